//! Lokai echo worker
//!
//! A stand-in for the agent worker that speaks the same line-delimited
//! JSON-RPC protocol on stdio. Replies echo their input; a few extra methods
//! (`approve`, `hang`, `crash`) exercise the bridge's failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lokai_core::jsonrpc::{
    INVALID_PARAMS, Inbound, JSONRPC_VERSION, LineFramer, METHOD_NOT_FOUND, PARSE_ERROR,
    RpcErrorObject, RpcResponse, classify,
};

#[derive(Parser, Debug)]
#[command(name = "lokai-echo-worker")]
#[command(version, about = "Echo worker speaking the Lokai worker protocol")]
struct Args {
    /// Never answer anything.
    #[arg(long)]
    silent: bool,

    /// Ignore pings for this many milliseconds after start.
    #[arg(long, default_value_t = 0)]
    ready_after_ms: u64,

    /// Wait this long before answering each ping.
    #[arg(long, default_value_t = 0)]
    ping_delay_ms: u64,

    /// On `crash`, leave a child holding stdout open for this many seconds.
    #[arg(long, default_value_t = 0)]
    orphan_secs: u64,

    /// Log level filter (logs go to stderr).
    #[arg(long, default_value = "warn", env = "LOKAI_ECHO_LOG_LEVEL")]
    log_level: String,
}

type Reply = Result<Value, RpcErrorObject>;

struct Worker {
    out: mpsc::UnboundedSender<Value>,
    /// Requests this worker sent to the bridge, keyed by their id.
    outgoing: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    ready_at: Instant,
    ping_delay: Duration,
    orphan_secs: u64,
}

impl Worker {
    fn send(&self, record: Value) {
        let _ = self.out.send(record);
    }

    fn reply(&self, id: Value, reply: Reply) {
        let response = match reply {
            Ok(result) => RpcResponse::result(id, result),
            Err(error) => RpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result: None,
                error: Some(error),
            },
        };
        self.send(json!(response));
    }

    async fn handle(self: Arc<Self>, id: Value, method: String, params: Value) {
        debug!(%id, method = %method, "Request");
        match method.as_str() {
            "ping" => {
                if Instant::now() < self.ready_at {
                    debug!("Not ready, ignoring ping");
                    return;
                }
                tokio::time::sleep(self.ping_delay).await;
                self.reply(id, Ok(json!({"status": "ok"})));
            }
            "process_message" => {
                let message = params.get("message").and_then(Value::as_str).unwrap_or("");
                let streaming = params
                    .get("streaming")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if streaming {
                    self.stream_words(&id, message);
                    self.reply(id, Ok(json!({"streaming": true})));
                } else {
                    self.reply(id, Ok(json!({"content": message, "tool_calls": []})));
                }
            }
            "execute_tool" => {
                let tool = params.get("tool").and_then(Value::as_str).unwrap_or("");
                let tool_params = params.get("params").cloned().unwrap_or_else(|| json!({}));
                self.reply(
                    id,
                    Ok(json!({"executed": tool, "params": tool_params, "result": "ok"})),
                );
            }
            "cancel" => self.reply(id, Ok(json!({"cancelled": true}))),
            "get_context" => {
                let cwd = std::env::current_dir().unwrap_or_default();
                let home = dirs::home_dir().unwrap_or_default();
                self.reply(
                    id,
                    Ok(json!({
                        "current_directory": cwd.display().to_string(),
                        "platform": std::env::consts::OS,
                        "home_dir": home.display().to_string(),
                    })),
                );
            }
            "approve" => {
                let reply = self.ask_bridge("request_approval", params).await;
                self.reply(id, reply);
            }
            "hang" => info!(%id, "Hanging on purpose"),
            "crash" => {
                warn!("Crashing on request");
                if self.orphan_secs > 0 {
                    // Inherits our stdout and outlives us.
                    if let Err(e) = std::process::Command::new("sleep")
                        .arg(self.orphan_secs.to_string())
                        .spawn()
                    {
                        warn!(error = %e, "Failed to leave a child behind");
                    }
                }
                std::process::exit(3);
            }
            other => self.reply(
                id,
                Err(RpcErrorObject {
                    code: METHOD_NOT_FOUND,
                    message: format!("Method not found: {other}"),
                    data: None,
                }),
            ),
        }
    }

    /// Token per whitespace-delimited word, then the completion record.
    fn stream_words(&self, id: &Value, message: &str) {
        let mut full = String::new();
        for (i, word) in message.split_whitespace().enumerate() {
            let token = if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            full.push_str(&token);
            self.send(json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "streaming": true,
                "token": token,
            }));
        }
        self.send(json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "complete": true,
            "result": full,
        }));
    }

    /// Call a method on the bridge and wait for its answer.
    async fn ask_bridge(&self, method: &str, params: Value) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        self.send(json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        }));
        rx.await.unwrap_or_else(|_| {
            Err(RpcErrorObject {
                code: INVALID_PARAMS,
                message: "bridge never answered".to_string(),
                data: None,
            })
        })
    }

    fn complete_outgoing(&self, id: u64, reply: Reply) {
        let tx = self
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(id, "Answer for unknown request"),
        }
    }
}

async fn write_stdout(mut rx: mpsc::UnboundedReceiver<Value>) {
    let mut stdout = tokio::io::stdout();
    while let Some(record) = rx.recv().await {
        let bytes = match LineFramer::encode(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode record");
                continue;
            }
        };
        if stdout.write_all(&bytes).await.is_err() || stdout.flush().await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    lokai_core::tracing_init::init_tracing(
        &format!("lokai_echo_worker={}", args.log_level),
        false,
    );
    info!(
        silent = args.silent,
        ready_after_ms = args.ready_after_ms,
        ping_delay_ms = args.ping_delay_ms,
        "Echo worker started"
    );

    let (out, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_stdout(out_rx));
    let worker = Arc::new(Worker {
        out,
        outgoing: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(0),
        ready_at: Instant::now() + Duration::from_millis(args.ready_after_ms),
        ping_delay: Duration::from_millis(args.ping_delay_ms),
        orphan_secs: args.orphan_secs,
    });

    let mut stdin = tokio::io::stdin();
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if args.silent {
            continue;
        }
        for frame in framer.feed(&buf[..n]) {
            let record = match frame.into_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Unparseable request");
                    worker.reply(
                        Value::Null,
                        Err(RpcErrorObject {
                            code: PARSE_ERROR,
                            message: format!("Parse error: {e}"),
                            data: None,
                        }),
                    );
                    continue;
                }
            };
            match classify(record) {
                Inbound::Request { id, method, params } => {
                    tokio::spawn(Arc::clone(&worker).handle(id, method, params));
                }
                Inbound::Response { id, outcome } => worker.complete_outgoing(id, outcome),
                other => debug!(?other, "Ignoring record"),
            }
        }
    }

    info!("stdin closed, exiting");
    drop(worker);
    let _ = writer.await;
    Ok(())
}
