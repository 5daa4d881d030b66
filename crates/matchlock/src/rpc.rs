use serde_json::Value;

use crate::errors::RpcError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MsgKind {
    Response,
    Notification,
    Unknown,
}

/// Classify one inbound message. The supervisor never issues requests of
/// its own, so every id-bearing message is treated as a response; the
/// pending-table lookup drops ids it does not know.
pub(crate) fn classify_message(json: &Value) -> MsgKind {
    if json.get("id").is_some() {
        return MsgKind::Response;
    }
    if json.get("method").is_some() {
        return MsgKind::Notification;
    }
    MsgKind::Unknown
}

pub(crate) fn response_id(json: &Value) -> Option<u64> {
    json.get("id").and_then(Value::as_u64)
}

pub(crate) fn notification_method(json: &Value) -> Option<&str> {
    json.get("method").and_then(Value::as_str)
}

/// Map a JSON-RPC error object into the typed peer error.
/// Allocation: message clone. Complexity: O(1).
pub(crate) fn map_rpc_error(json_error: &Value) -> RpcError {
    let code = json_error
        .get("code")
        .and_then(Value::as_i64)
        .unwrap_or(RpcError::INTERNAL_ERROR);
    let message = json_error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown rpc error")
        .to_owned();
    RpcError::new(code, message)
}
