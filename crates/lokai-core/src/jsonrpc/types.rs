//! Record types for the worker's JSON-RPC 2.0 stdio protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried on every record.
pub const JSONRPC_VERSION: &str = "2.0";

/// The received line was not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// The method was not found on the receiving side.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// The params did not match what the method expects.
pub const INVALID_PARAMS: i64 = -32602;
/// Start of the implementation-defined server error range.
pub const SERVER_ERROR: i64 = -32000;

/// Request record written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Build a plain (single-response) request.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a request that asks the worker to stream tokens back.
    ///
    /// The streaming flag travels inside `params`. Object params get a
    /// `streaming: true` key; anything else is wrapped as `{"value": ..}`.
    pub fn streaming(id: u64, method: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(mut map) => {
                map.insert("streaming".to_string(), Value::Bool(true));
                Value::Object(map)
            }
            Value::Null => serde_json::json!({ "streaming": true }),
            other => serde_json::json!({ "value": other, "streaming": true }),
        };
        Self::new(id, method, params)
    }

    /// Whether this request carries the streaming flag.
    pub fn is_streaming(&self) -> bool {
        self.params
            .get("streaming")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Structured error payload of a response record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response record written back to the worker for a worker-originated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Attach `data` to an error response. No effect on a result.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.data = Some(data);
        }
        self
    }
}

/// A record read from the worker, classified by what it means to the
/// correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Non-terminal streaming token for call `id`.
    Token { id: u64, token: String },
    /// Terminal streaming completion carrying the aggregated result.
    Complete { id: u64, result: Value },
    /// Plain terminal response.
    Response {
        id: u64,
        outcome: Result<Value, RpcErrorObject>,
    },
    /// Worker-originated call that expects a response from the bridge.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Error response that cannot be correlated (`"id": null`).
    Orphan { error: Option<RpcErrorObject> },
    /// Well-formed JSON that is not a protocol record.
    Invalid { reason: String },
}

impl Inbound {
    /// The correlation identifier this record resolves, if any.
    pub const fn call_id(&self) -> Option<u64> {
        match self {
            Self::Token { id, .. } | Self::Complete { id, .. } | Self::Response { id, .. } => {
                Some(*id)
            }
            Self::Request { .. } | Self::Orphan { .. } | Self::Invalid { .. } => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn streaming_flag_travels_in_params() {
        let req = RpcRequest::streaming(4, "process_message", json!({"message": "hi"}));
        assert!(req.is_streaming());
        assert_eq!(req.params, json!({"message": "hi", "streaming": true}));

        let wrapped = RpcRequest::streaming(5, "process_message", json!("hi"));
        assert_eq!(wrapped.params, json!({"value": "hi", "streaming": true}));

        assert!(!RpcRequest::new(6, "ping", Value::Null).is_streaming());
    }

    #[test]
    fn error_response_omits_result() {
        let response = RpcResponse::error(json!("w-1"), SERVER_ERROR, "Approval timeout: r1")
            .with_data(json!({"kind": "timeout"}));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": "w-1",
                "error": {"code": -32000, "message": "Approval timeout: r1", "data": {"kind": "timeout"}}
            })
        );

        // Data only attaches to errors.
        let ok = RpcResponse::result(json!(1), json!(true)).with_data(json!({"x": 1}));
        assert_eq!(ok.error, None);
    }
}
