//! Request/response correlation over the worker's stdio stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use lokai_core::jsonrpc::{Inbound, LineFramer, RpcRequest, RpcResponse};

use super::pending::{PendingCall, PendingTable, TokenDelivery};
use super::stream::StreamingCall;
use super::types::{RpcError, StreamEvent, WorkerRequest};
use crate::subprocess::WorkerState;

/// Correlates calls to one worker instance with the records it writes back.
///
/// A correlator never outlives its instance: the supervisor builds a fresh
/// one per spawn, so identifiers restart at 1 and never cross instances.
pub struct Correlator {
    next_id: AtomicU64,
    pending: PendingTable,
    writer: mpsc::Sender<Vec<u8>>,
    state: watch::Receiver<WorkerState>,
    request_timeout: Duration,
    requests: mpsc::UnboundedSender<WorkerRequest>,
}

impl Correlator {
    /// Create a correlator writing encoded records into `writer`.
    ///
    /// Returns the receiving end of the worker-originated request channel.
    pub fn new(
        writer: mpsc::Sender<Vec<u8>>,
        state: watch::Receiver<WorkerState>,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerRequest>) {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let correlator = Self {
            next_id: AtomicU64::new(0),
            pending: PendingTable::default(),
            writer,
            state,
            request_timeout,
            requests,
        };
        (correlator, requests_rx)
    }

    /// Whether the owning instance currently accepts calls.
    pub fn is_running(&self) -> bool {
        self.state.borrow().accepts_calls()
    }

    /// Number of calls still waiting for a terminal record.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Most recently allocated identifier (0 before the first call).
    pub fn last_issued_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Resolves once the owning instance has crashed or stopped.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    /// Issue a single-response call and wait for its outcome.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if !self.is_running() {
            return Err(RpcError::NotRunning);
        }

        let id = self.allocate_id();
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall::Unary {
                method: method.to_string(),
                tx,
            },
        )?;
        let _guard = self.pending.guard(id);

        debug!(id, method, "Sending request");
        if let Err(e) = self.write(&RpcRequest::new(id, method, params)).await {
            if self.pending.remove(id).is_some() {
                return Err(e);
            }
            return rx.await.unwrap_or_else(|_| Err(dropped()));
        }

        match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or_else(|_| Err(dropped())),
            Err(_) => {
                if self.pending.remove(id).is_some() {
                    warn!(id, method, "Request timed out");
                    return Err(RpcError::Timeout {
                        id,
                        method: method.to_string(),
                        timeout_ms: millis(self.request_timeout),
                    });
                }
                // A record resolved the call between the deadline and the
                // removal attempt; its outcome is already on the way.
                rx.await.unwrap_or_else(|_| Err(dropped()))
            }
        }
    }

    /// Issue a token-streamed call.
    ///
    /// Never fails directly: if the worker is unavailable the returned handle
    /// yields a single [`StreamEvent::Error`] without anything being written.
    pub async fn call_streaming(&self, method: &str, params: Value) -> StreamingCall {
        if !self.is_running() {
            return StreamingCall::failed(method.to_string(), RpcError::NotRunning);
        }

        let id = self.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self.pending.insert(
            id,
            PendingCall::Streaming {
                method: method.to_string(),
                tx,
            },
        ) {
            return StreamingCall::failed(method.to_string(), e);
        }
        let call = StreamingCall::registered(
            id,
            method.to_string(),
            rx,
            self.pending.clone(),
            self.request_timeout,
        );

        debug!(id, method, "Sending streaming request");
        if let Err(e) = self.write(&RpcRequest::streaming(id, method, params)).await {
            if let Some(pending) = self.pending.remove(id) {
                pending.resolve(Err(e));
            }
        }
        call
    }

    /// Route one classified record from the worker.
    ///
    /// Records that match no outstanding call are dropped; that is the normal
    /// fate of a response arriving after its call timed out.
    pub fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Token { id, token } => match self.pending.deliver_token(id, token) {
                TokenDelivery::Delivered => {}
                TokenDelivery::NotStreaming => {
                    debug!(id, "Ignoring token for a non-streaming call");
                }
                TokenDelivery::Unknown => debug!(id, "Dropping token for unknown call"),
            },
            Inbound::Complete { id, result } => self.resolve(id, Ok(result)),
            Inbound::Response { id, outcome } => self.resolve(id, outcome.map_err(RpcError::from)),
            Inbound::Request { id, method, params } => {
                debug!(%id, method = %method, "Worker-originated request");
                if self
                    .requests
                    .send(WorkerRequest { id, method, params })
                    .is_err()
                {
                    warn!("No request router attached, dropping worker request");
                }
            }
            Inbound::Orphan { error } => match error {
                Some(err) => warn!(code = err.code, message = %err.message, "Uncorrelated worker error"),
                None => warn!("Uncorrelated worker record"),
            },
            Inbound::Invalid { reason } => warn!(%reason, "Ignoring invalid worker record"),
        }
    }

    /// Fail every outstanding call with `reason` and refuse new ones.
    pub fn fail_all(&self, reason: &RpcError) {
        let drained = self.pending.close(reason.clone());
        if !drained.is_empty() {
            warn!(count = drained.len(), error = %reason, "Failing outstanding calls");
        }
        for (id, call) in drained {
            debug!(id, method = call.method(), "Call failed");
            call.resolve(Err(reason.clone()));
        }
    }

    /// Answer a worker-originated request.
    pub async fn respond(&self, response: RpcResponse) -> Result<(), RpcError> {
        self.write(&response).await
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn resolve(&self, id: u64, outcome: Result<Value, RpcError>) {
        match self.pending.remove(id) {
            Some(call) => {
                debug!(id, method = call.method(), ok = outcome.is_ok(), "Call resolved");
                call.resolve(outcome);
            }
            None => debug!(id, "Dropping record for unknown call"),
        }
    }

    async fn write<T: Serialize>(&self, record: &T) -> Result<(), RpcError> {
        let bytes = LineFramer::encode(record).map_err(|e| RpcError::Transport(e.to_string()))?;
        self.writer
            .send(bytes)
            .await
            .map_err(|_| RpcError::NotRunning)
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("last_issued_id", &self.last_issued_id())
            .field("outstanding", &self.outstanding())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

fn dropped() -> RpcError {
    RpcError::Transport("call dropped without a result".into())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
