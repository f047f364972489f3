//! Worker process lifecycle: spawn, readiness check, crash detection and
//! shutdown.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use lokai_core::jsonrpc::{Frame, LineFramer, METHOD_NOT_FOUND, RpcResponse, classify};

use super::types::{SupervisorError, WorkerConfig, WorkerEvent, WorkerState};
use crate::rpc::{Correlator, RpcError, WorkerRequest};

const WRITE_QUEUE: usize = 32;
const EVENT_CAPACITY: usize = 256;
const READ_CHUNK: usize = 8 * 1024;
/// How long records already written by an exited worker may take to arrive.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// A worker-originated request together with the instance that must answer it.
#[derive(Debug)]
pub struct InstanceRequest {
    pub request: WorkerRequest,
    pub correlator: Arc<Correlator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Stop,
    ReadinessFailed,
}

/// State shared between the supervisor and one instance's tasks.
struct Shared {
    pid: Option<u32>,
    state: watch::Sender<WorkerState>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<WorkerEvent>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Shared {
    fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Apply a lifecycle transition. Illegal transitions are ignored.
    fn transition(&self, next: WorkerState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(pid = ?self.pid, state = %next, "Worker state changed");
            let _ = self.events.send(WorkerEvent::StateChanged(next));
        }
        changed
    }

    fn record_error(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }
}

struct Instance {
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<Shutdown>>,
}

/// Owns the worker process across its lifecycle.
///
/// Each `start` after a crash or stop spawns a fresh instance with its own
/// correlator; nothing from a previous instance is carried over.
pub struct WorkerSupervisor {
    config: WorkerConfig,
    instance: Mutex<Option<Instance>>,
    events: broadcast::Sender<WorkerEvent>,
    requests: mpsc::UnboundedSender<InstanceRequest>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl WorkerSupervisor {
    /// Create a supervisor. The receiver yields worker-originated requests
    /// from every instance it spawns.
    pub fn new(config: WorkerConfig) -> (Self, mpsc::UnboundedReceiver<InstanceRequest>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            config,
            instance: Mutex::new(None),
            events,
            requests,
            last_error: Arc::new(Mutex::new(None)),
        };
        (supervisor, requests_rx)
    }

    /// State of the current instance.
    pub fn state(&self) -> WorkerState {
        self.lock_instance()
            .as_ref()
            .map_or(WorkerState::NotStarted, |i| i.shared.state())
    }

    /// Whether calls are currently accepted.
    pub fn running(&self) -> bool {
        self.state().accepts_calls()
    }

    /// Process id of the current instance while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.lock_instance()
            .as_ref()
            .filter(|i| i.shared.state().accepts_calls())
            .and_then(|i| i.shared.pid)
    }

    /// Correlator of the current instance, if one was ever started.
    pub fn correlator(&self) -> Option<Arc<Correlator>> {
        self.lock_instance()
            .as_ref()
            .map(|i| Arc::clone(&i.shared.correlator))
    }

    /// Most recent startup failure or crash description.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Spawn the worker and wait until it answers a readiness ping.
    ///
    /// A no-op while an instance is starting or ready. On failure the
    /// process is terminated and the instance is left `Crashed`.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let shared = {
            let mut slot = self.lock_instance();
            if let Some(current) = slot.as_ref() {
                if current.shared.state().accepts_calls() {
                    debug!(state = %current.shared.state(), "Worker already running");
                    return Ok(());
                }
            }
            let instance = self.spawn_instance().inspect_err(|e| {
                *lock(&self.last_error) = Some(e.to_string());
            })?;
            let shared = Arc::clone(&instance.shared);
            *slot = Some(instance);
            shared
        };

        match self.await_ready(&shared).await {
            Ok(attempts) => {
                if shared.transition(WorkerState::Ready) {
                    *lock(&self.last_error) = None;
                    info!(pid = ?shared.pid, attempts, "Worker ready");
                    Ok(())
                } else {
                    // Stopped or crashed while the ping was answered.
                    Err(SupervisorError::StartupFailed {
                        reason: format!("worker {} during startup", shared.state()),
                    })
                }
            }
            Err(e) => {
                error!(pid = ?shared.pid, error = %e, "Worker failed to become ready");
                shared.record_error(e.to_string());
                self.shutdown_instance(&shared, Shutdown::ReadinessFailed)
                    .await;
                Err(e)
            }
        }
    }

    /// Terminate the worker. Idempotent.
    ///
    /// Outstanding calls fail with [`RpcError::NotRunning`]. Returns once the
    /// process has been reaped.
    pub async fn stop(&self) {
        let shared = self
            .lock_instance()
            .as_ref()
            .map(|i| Arc::clone(&i.shared));
        if let Some(shared) = shared {
            self.shutdown_instance(&shared, Shutdown::Stop).await;
        }
    }

    async fn shutdown_instance(&self, shared: &Arc<Shared>, reason: Shutdown) {
        let signal = {
            let mut slot = self.lock_instance();
            slot.as_mut()
                .filter(|i| Arc::ptr_eq(&i.shared, shared))
                .and_then(|i| i.shutdown.take())
        };
        if let Some(tx) = signal {
            if tx.send(reason).is_err() {
                debug!(pid = ?shared.pid, "Worker already exited");
            }
        }

        let mut state = shared.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    fn spawn_instance(&self) -> Result<Instance, SupervisorError> {
        let working_dir = self.working_directory();

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(&working_dir)
            .env("PYTHONUNBUFFERED", "1")
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            program = %self.config.program.display(),
            args = ?self.config.args,
            working_dir = %working_dir.display(),
            "Spawning worker"
        );
        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            reason: format!("{}: {e}", self.config.program.display()),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| SupervisorError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::SpawnFailed {
            reason: "Failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take();

        let pid = child.id();
        let (state, state_rx) = watch::channel(WorkerState::NotStarted);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
        let (correlator, worker_requests) =
            Correlator::new(write_tx, state_rx, self.config.request_timeout);
        let correlator = Arc::new(correlator);

        let shared = Arc::new(Shared {
            pid,
            state,
            correlator: Arc::clone(&correlator),
            events: self.events.clone(),
            last_error: Arc::clone(&self.last_error),
        });
        shared.transition(WorkerState::Starting);

        tokio::spawn(write_stdin(stdin, write_rx, pid));
        let reader = tokio::spawn(read_stdout(
            stdout,
            Arc::clone(&correlator),
            self.events.clone(),
            self.config.max_line_bytes,
            pid,
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(read_stderr(stderr, self.events.clone(), pid));
        }
        tokio::spawn(forward_requests(
            Arc::downgrade(&correlator),
            worker_requests,
            self.requests.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            reader,
            shutdown_rx,
            Arc::clone(&shared),
            self.config.terminate_timeout,
        ));

        Ok(Instance {
            shared,
            shutdown: Some(shutdown_tx),
        })
    }

    /// Ping until the worker answers, the instance dies, or the deadline
    /// passes. Returns the number of attempts issued.
    ///
    /// A new attempt goes out every retry interval while earlier ones stay
    /// outstanding, so the first answer to any of them counts even when the
    /// worker takes longer than the interval to reply.
    async fn await_ready(&self, shared: &Shared) -> Result<u32, SupervisorError> {
        let config = &self.config;
        let deadline = Instant::now() + config.readiness_timeout;

        let attempts = async {
            tokio::time::sleep(config.readiness_initial_delay).await;
            let mut outstanding = JoinSet::new();
            let mut issued = 0u32;
            let mut next_attempt = Instant::now();
            let outcome = loop {
                tokio::select! {
                    () = tokio::time::sleep_until(next_attempt) => {
                        issued += 1;
                        let correlator = Arc::clone(&shared.correlator);
                        let method = config.readiness_probe_method.clone();
                        outstanding.spawn(async move { correlator.call(&method, Value::Null).await });
                        next_attempt = Instant::now() + config.readiness_retry_interval;
                    }
                    Some(joined) = outstanding.join_next() => match joined {
                        Ok(Ok(_)) => break Ok(issued),
                        Ok(Err(RpcError::NotRunning | RpcError::ProcessCrashed)) => {
                            break Err(SupervisorError::StartupFailed {
                                reason: format!("worker {} before answering", shared.state()),
                            });
                        }
                        Ok(Err(e)) => debug!(issued, error = %e, "Readiness ping failed"),
                        Err(e) => debug!(issued, error = %e, "Readiness ping task ended"),
                    },
                }
            };
            // Leftover pings release their pending entries before start returns.
            outstanding.shutdown().await;
            outcome
        };

        tokio::time::timeout_at(deadline, attempts)
            .await
            .unwrap_or(Err(SupervisorError::StartupTimeout {
                timeout_secs: config.readiness_timeout.as_secs(),
            }))
    }

    fn working_directory(&self) -> PathBuf {
        let Some(requested) = &self.config.working_directory else {
            return std::env::current_dir().unwrap_or_else(|_| fallback_directory());
        };
        if requested.as_os_str().is_empty() || !requested.exists() {
            let fallback = fallback_directory();
            warn!(
                requested = %requested.display(),
                fallback = %fallback.display(),
                "Working directory missing or empty, using fallback"
            );
            return fallback;
        }
        requested.clone()
    }

    fn lock_instance(&self) -> MutexGuard<'_, Option<Instance>> {
        lock(&self.instance)
    }
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("program", &self.config.program)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fallback_directory() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("dirs::home_dir() returned None; falling back to temp_dir for working directory");
        std::env::temp_dir()
    })
}

/// Owns the child. Waits for either an exit or a shutdown request, then
/// settles the instance's state and outstanding calls.
async fn supervise(
    mut child: Child,
    mut reader: tokio::task::JoinHandle<()>,
    shutdown: oneshot::Receiver<Shutdown>,
    shared: Arc<Shared>,
    terminate_timeout: Duration,
) {
    let requested = tokio::select! {
        status = child.wait() => Err(status),
        reason = shutdown => Ok(reason.unwrap_or(Shutdown::Stop)),
    };

    match requested {
        Err(status) => {
            // Dispatch whatever the worker wrote before it went away. A
            // descendant may still hold the pipe open, so the wait is short.
            if tokio::time::timeout(EXIT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                warn!(pid = ?shared.pid, "Worker stdout still open after exit, abandoning it");
                reader.abort();
            }
            let code = status.as_ref().ok().and_then(ExitStatus::code);
            match &status {
                Ok(status) => warn!(pid = ?shared.pid, %status, "Worker exited"),
                Err(e) => error!(pid = ?shared.pid, error = %e, "Failed to wait for worker"),
            }
            if shared.state().accepts_calls() {
                shared.record_error(match code {
                    Some(code) => format!("Worker exited unexpectedly with code {code}"),
                    None => "Worker terminated by signal".to_string(),
                });
            }
            shared.correlator.fail_all(&RpcError::ProcessCrashed);
            let _ = shared.events.send(WorkerEvent::Exited { code });
            shared.transition(WorkerState::Crashed);
        }
        Ok(reason) => {
            let (final_state, failure) = match reason {
                Shutdown::Stop => (WorkerState::Stopped, RpcError::NotRunning),
                Shutdown::ReadinessFailed => (WorkerState::Crashed, RpcError::ProcessCrashed),
            };
            shared.correlator.fail_all(&failure);
            let status = terminate(&mut child, terminate_timeout, shared.pid).await;
            let code = status.and_then(|s| s.code());
            let _ = shared.events.send(WorkerEvent::Exited { code });
            shared.transition(final_state);
        }
    }
}

/// SIGTERM, bounded wait, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration, pid: Option<u32>) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            // SAFETY: pid is a valid process ID obtained from our own Child handle.
            // kill(2) with SIGTERM is safe to call on any owned subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?pid, %status, "Worker exited gracefully");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(?pid, error = %e, "Error waiting for worker");
            child.kill().await.ok();
            None
        }
        Err(_) => {
            warn!(?pid, "Timeout waiting for graceful shutdown, killing");
            child.kill().await.ok();
            child.wait().await.ok()
        }
    }
}

/// Single writer for the worker's stdin.
async fn write_stdin(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>, pid: Option<u32>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = stdin.write_all(&record).await {
            error!(?pid, error = %e, "Failed to write to worker stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(?pid, error = %e, "Failed to flush worker stdin");
            break;
        }
    }
    debug!(?pid, "stdin writer finished");
}

async fn read_stdout(
    mut stdout: ChildStdout,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<WorkerEvent>,
    max_line_bytes: usize,
    pid: Option<u32>,
) {
    let mut framer = LineFramer::with_max_line_bytes(max_line_bytes);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(?pid, error = %e, "Failed to read worker stdout");
                break;
            }
        };
        for frame in framer.feed(&buf[..n]) {
            match frame {
                Frame::Record(record) => correlator.dispatch(classify(record)),
                Frame::Malformed { line, reason } => {
                    warn!(?pid, %reason, "Skipping malformed worker record");
                    let _ = events.send(WorkerEvent::MalformedRecord { line, reason });
                }
            }
        }
    }
    if framer.pending_bytes() > 0 {
        debug!(?pid, bytes = framer.pending_bytes(), "Discarding unterminated record");
    }
    debug!(?pid, "stdout reader finished");
}

async fn read_stderr(stderr: ChildStderr, events: broadcast::Sender<WorkerEvent>, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(?pid, "stderr: {}", line);
        let _ = events.send(WorkerEvent::Stderr(line));
    }
    debug!(?pid, "stderr reader finished");
}

/// Tag worker requests with their instance. Ends with the instance.
async fn forward_requests(
    correlator: Weak<Correlator>,
    mut rx: mpsc::UnboundedReceiver<WorkerRequest>,
    out: mpsc::UnboundedSender<InstanceRequest>,
) {
    while let Some(request) = rx.recv().await {
        let Some(correlator) = correlator.upgrade() else {
            break;
        };
        if let Err(mpsc::error::SendError(unrouted)) = out.send(InstanceRequest {
            request,
            correlator,
        }) {
            warn!(method = %unrouted.request.method, "No request router, rejecting worker request");
            let response = RpcResponse::error(
                unrouted.request.id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", unrouted.request.method),
            );
            let _ = unrouted.correlator.respond(response).await;
        }
    }
}
