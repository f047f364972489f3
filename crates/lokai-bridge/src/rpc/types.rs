//! Call correlation types.

use serde_json::Value;

use lokai_core::jsonrpc::RpcErrorObject;

/// Terminal failure of a call to the worker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("Worker process not running")]
    NotRunning,

    #[error("Request '{method}' (id={id}) timed out after {timeout_ms}ms")]
    Timeout {
        id: u64,
        method: String,
        timeout_ms: u64,
    },

    #[error("Worker process crashed")]
    ProcessCrashed,

    #[error("Worker error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<RpcErrorObject> for RpcError {
    fn from(err: RpcErrorObject) -> Self {
        Self::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// One event of a streaming call.
///
/// A stream yields any number of `Token`s followed by exactly one terminal
/// event (`Complete` or `Error`).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Complete(Value),
    Error(RpcError),
}

impl StreamEvent {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }
}

/// A call the worker makes to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Identifier in the worker's own id space, echoed back verbatim.
    pub id: Value,
    pub method: String,
    pub params: Value,
}
