//! Capability negotiation structures exchanged during `initialize`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Capabilities the proxy announces as an MCP client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientCapabilities {
    /// Additional, unmodelled capability blocks
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Tool-related capabilities an upstream advertises
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolsCapability {
    /// Whether the server emits `notifications/tools/list_changed`
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Capabilities an upstream announces during `initialize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerCapabilities {
    /// Tool support, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,

    /// Additional, unmodelled capability blocks
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ServerCapabilities {
    /// Whether the server declared `tools.listChanged`
    pub fn advertises_list_changed(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| t.list_changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_changed_detection() {
        let caps: ServerCapabilities =
            serde_json::from_value(json!({"tools": {"listChanged": true}})).unwrap();
        assert!(caps.advertises_list_changed());

        let caps: ServerCapabilities = serde_json::from_value(json!({"tools": {}})).unwrap();
        assert!(!caps.advertises_list_changed());

        let caps: ServerCapabilities = serde_json::from_value(json!({})).unwrap();
        assert!(!caps.advertises_list_changed());
    }

    #[test]
    fn test_unknown_capability_blocks_survive() {
        let caps: ServerCapabilities =
            serde_json::from_value(json!({"resources": {"subscribe": true}})).unwrap();
        assert!(caps.extra.contains_key("resources"));
    }
}
