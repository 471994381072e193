//! JSON-RPC 2.0 framing

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC 2.0 version string
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request message. A request without an `id` is a
/// notification and gets no response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name to call
    pub method: String,

    /// Method parameters (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Request ID for correlation (absent for notifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Create a request with a string ID
    pub fn with_id(method: impl Into<String>, params: Option<Value>, id: impl Into<String>) -> Self {
        Self::new(method, params, Some(Value::String(id.into())))
    }

    /// Create a notification (no ID, no response expected)
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::new(method, params, None)
    }

    /// Check if this is a notification
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Get the request ID rendered as a string, if present
    pub fn id_as_string(&self) -> Option<String> {
        match &self.id {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(value) => Some(value.to_string()),
            None => None,
        }
    }
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Successful result (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error information (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    /// ID of the request this answers
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn success(result: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    pub fn error(error: JsonRpcError, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Check if this response contains an error
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// JSON-RPC 2.0 error information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Additional error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create a new JSON-RPC error
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    /// Create a method-not-found error
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::MethodNotFound as i32,
            "Method not found",
            Some(Value::String(format!("Method '{}' not found", method))),
        )
    }

    /// Create an invalid-params error
    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(
            JsonRpcErrorCode::InvalidParams as i32,
            "Invalid params",
            Some(Value::String(details.into())),
        )
    }

    /// Create an internal error
    pub fn internal_error(details: impl Into<String>) -> Self {
        Self::new(
            JsonRpcErrorCode::InternalError as i32,
            "Internal error",
            Some(Value::String(details.into())),
        )
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Standard JSON-RPC 2.0 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JsonRpcErrorCode {
    /// Invalid JSON was received
    ParseError = -32700,

    /// The JSON sent is not a valid Request object
    InvalidRequest = -32600,

    /// The method does not exist / is not available
    MethodNotFound = -32601,

    /// Invalid method parameter(s)
    InvalidParams = -32602,

    /// Internal JSON-RPC error
    InternalError = -32603,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let request = JsonRpcRequest::with_id("tools/list", None, "7");
        let text = serde_json::to_string(&request).unwrap();
        let back: JsonRpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(request, back);
        assert!(!request.is_notification());
        assert_eq!(request.id_as_string().as_deref(), Some("7"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcRequest::notification("notifications/tools/list_changed", None);
        assert!(note.is_notification());
        let text = serde_json::to_string(&note).unwrap();
        assert!(!text.contains("\"id\""));
    }

    #[test]
    fn test_response_variants() {
        let ok = JsonRpcResponse::success(json!({"tools": []}), Some(json!(1)));
        assert!(!ok.is_error());

        let err = JsonRpcResponse::error(JsonRpcError::method_not_found("x"), Some(json!(1)));
        assert!(err.is_error());
        assert_eq!(err.error.unwrap().code, JsonRpcErrorCode::MethodNotFound as i32);
    }
}
