//! Typed MCP message payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::capabilities::{ClientCapabilities, ServerCapabilities};
use super::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// Any incoming wire message: a request/notification or a response.
///
/// `Request` is tried first during deserialization; responses lack a
/// `method` field and fall through to the second variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl McpMessage {
    /// Message ID, if the frame carries one
    pub fn id(&self) -> Option<&Value> {
        match self {
            McpMessage::Request(req) => req.id.as_ref(),
            McpMessage::Response(resp) => resp.id.as_ref(),
        }
    }
}

// === Initialize ===

/// Parameters for the `initialize` method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    pub capabilities: ClientCapabilities,

    #[serde(rename = "clientInfo")]
    pub client_info: PeerInfo,
}

/// Result of the `initialize` method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    pub capabilities: ServerCapabilities,

    #[serde(rename = "serverInfo")]
    pub server_info: PeerInfo,
}

/// Identity of one side of the connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,

    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

impl PeerInfo {
    /// This proxy's identity, sent in `clientInfo`
    pub fn proxy() -> Self {
        Self {
            name: "mcpproxy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            metadata: HashMap::new(),
        }
    }
}

// === Tools ===

/// Tool definition as advertised by an upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,

    /// Behavioural annotations (read-only hints, destructiveness, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

/// Result of `tools/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<Tool>,

    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Parameters for `tools/call`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallParams {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// One block of tool output content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

/// Result of `tools/call`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,

    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Shorthand for a single text block
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Shorthand for a single error text block
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_untagged_message_discrimination() {
        let request: McpMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0", "method": "tools/list", "id": 1
        }))
        .unwrap();
        assert!(matches!(request, McpMessage::Request(_)));

        let notification: McpMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0", "method": "notifications/tools/list_changed"
        }))
        .unwrap();
        match notification {
            McpMessage::Request(req) => assert!(req.is_notification()),
            McpMessage::Response(_) => panic!("notification parsed as response"),
        }

        let response: McpMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0", "result": {"tools": []}, "id": 1
        }))
        .unwrap();
        assert!(matches!(response, McpMessage::Response(_)));
    }

    #[test]
    fn test_tool_round_trip() {
        let tool = Tool {
            name: "search".into(),
            description: "Full text search".into(),
            input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            annotations: None,
        };
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["inputSchema"]["type"], "object");
        let back: Tool = serde_json::from_value(value).unwrap();
        assert_eq!(tool, back);
    }

    #[test]
    fn test_call_tool_result_content() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "42"}],
            "isError": false
        }))
        .unwrap();
        assert_eq!(result.content.len(), 1);
        assert!(!result.is_error);
    }
}
