//! Inbound record classification.
//!
//! Tolerant reader: unknown fields are ignored, and a record that fits no
//! known shape becomes `Inbound::Invalid` instead of an error.

use serde_json::Value;

use super::types::{Inbound, RpcErrorObject};

/// Classify a parsed JSON record from the worker's stdout.
pub fn classify(raw: Value) -> Inbound {
    if !raw.is_object() {
        return Inbound::Invalid {
            reason: "record is not a JSON object".into(),
        };
    }

    if let Some(method) = raw.get("method").and_then(Value::as_str) {
        return Inbound::Request {
            id: raw.get("id").cloned().unwrap_or(Value::Null),
            method: method.to_string(),
            params: raw.get("params").cloned().unwrap_or(Value::Null),
        };
    }

    let id = match raw.get("id") {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(id) => id,
            None => {
                return Inbound::Invalid {
                    reason: format!("id {n} is not an unsigned integer"),
                };
            }
        },
        None | Some(Value::Null) => {
            return Inbound::Orphan {
                error: parse_error(raw.get("error")),
            };
        }
        Some(other) => {
            return Inbound::Invalid {
                reason: format!("unsupported id type: {other}"),
            };
        }
    };

    if flag(&raw, "streaming") {
        if let Some(token) = raw.get("token").and_then(Value::as_str) {
            return Inbound::Token {
                id,
                token: token.to_string(),
            };
        }
    }

    if flag(&raw, "complete") {
        return Inbound::Complete {
            id,
            result: raw.get("result").cloned().unwrap_or(Value::Null),
        };
    }

    if let Some(error) = parse_error(raw.get("error")) {
        return Inbound::Response {
            id,
            outcome: Err(error),
        };
    }

    if raw.get("result").is_some() {
        return Inbound::Response {
            id,
            outcome: Ok(raw.get("result").cloned().unwrap_or(Value::Null)),
        };
    }

    Inbound::Invalid {
        reason: format!("record for id {id} has neither result nor error"),
    }
}

fn flag(raw: &Value, key: &str) -> bool {
    raw.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// `"error": null` is treated the same as a missing error.
fn parse_error(val: Option<&Value>) -> Option<RpcErrorObject> {
    let val = val.filter(|v| !v.is_null())?;
    if let Ok(error) = serde_json::from_value::<RpcErrorObject>(val.clone()) {
        return Some(error);
    }
    // Tolerate loosely shaped errors: keep whatever text we can find.
    let message = val
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| val.to_string(), String::from);
    Some(RpcErrorObject {
        code: val.get("code").and_then(Value::as_i64).unwrap_or(0),
        message,
        data: val.get("data").cloned(),
    })
}
