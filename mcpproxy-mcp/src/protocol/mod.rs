//! MCP protocol types: JSON-RPC 2.0 framing plus typed message payloads

pub mod capabilities;
pub mod jsonrpc;
pub mod messages;

pub use capabilities::{ClientCapabilities, ServerCapabilities, ToolsCapability};
pub use jsonrpc::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
pub use messages::{
    CallToolResult, InitializeParams, InitializeResult, McpMessage, PeerInfo, Tool, ToolContent,
    ToolsCallParams, ToolsListResult,
};
