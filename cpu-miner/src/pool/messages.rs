//! JSON-RPC envelope used by every pool dialect.
//!
//! Pools speak newline-delimited JSON-RPC, but loosely: notifications may
//! carry `"id": null` or omit the id entirely, errors may be arrays or
//! objects, and a `"jsonrpc"` version field may or may not be present. This
//! lightweight type accepts all of those shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification from client or server
    Request {
        /// Message ID (absent or null for notifications)
        #[serde(default)]
        id: Option<u64>,
        /// Method name
        method: String,
        /// Method parameters
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message ID matching the request
        id: u64,
        /// Result value (present on success)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error value (present on failure)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    /// Create a new request message.
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Create a notification (request without ID).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Create a successful response.
    pub fn response(id: u64, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error_response(id: u64, error: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Get the message ID if present.
    pub fn id(&self) -> Option<u64> {
        match self {
            JsonRpcMessage::Request { id, .. } => *id,
            JsonRpcMessage::Response { id, .. } => Some(*id),
        }
    }

    /// Get the method name for requests.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }

    /// Get the params for requests.
    pub fn params(&self) -> Option<&Value> {
        match self {
            JsonRpcMessage::Request { params, .. } => Some(params),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

/// Extract a human-readable reason from a JSON-RPC error value.
///
/// Handles `[code, "message", data]` arrays, `{"code", "message"}` objects
/// and bare strings.
pub fn error_reason(error: &Value) -> String {
    match error {
        Value::Array(arr) => arr
            .get(1)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_without_id_field() {
        let msg: JsonRpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"job","params":{"job_id":"a","blob":"00","target":"ff"}}"#,
        )
        .unwrap();
        assert_eq!(msg.id(), None);
        assert_eq!(msg.method(), Some("job"));
        assert_eq!(msg.params().unwrap()["job_id"], "a");
    }

    #[test]
    fn notification_with_null_id() {
        let msg: JsonRpcMessage = serde_json::from_value(json!({
            "id": null,
            "method": "mining.notify",
            "params": ["job1", "00", "ff", true]
        }))
        .unwrap();
        assert_eq!(msg.id(), None);
        assert_eq!(msg.method(), Some("mining.notify"));
    }

    #[test]
    fn response_with_null_error() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"id":4,"jsonrpc":"2.0","error":null,"result":{"status":"OK"}}"#)
                .unwrap();
        match msg {
            JsonRpcMessage::Response { id, result, error } => {
                assert_eq!(id, 4);
                assert_eq!(result, Some(json!({"status": "OK"})));
                assert_eq!(error, None);
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn request_serializes_with_id() {
        let msg = JsonRpcMessage::request(1, "login", json!({"login": "w"}));
        let serialized = serde_json::to_string(&msg).unwrap();
        assert!(serialized.contains("\"id\":1"));
        assert!(serialized.contains("\"method\":\"login\""));
    }

    #[test]
    fn error_reasons() {
        assert_eq!(error_reason(&json!([23, "Low difficulty share", null])), "Low difficulty share");
        assert_eq!(error_reason(&json!({"code": -1, "message": "Unauthenticated"})), "Unauthenticated");
        assert_eq!(error_reason(&json!("bad")), "bad");
    }
}
