//! # MCPProxy protocol layer
//!
//! JSON-RPC 2.0 framing, typed MCP messages and the client-side transports
//! the upstream supervisor speaks through. The rest of the system never
//! touches raw sockets or child pipes; it works against [`UpstreamClient`]
//! and the typed message structs defined here.
//!
//! ```text
//! Supervisor actor ── UpstreamClient ── McpTransport ── remote MCP server
//!                         │                (stdio / http / sse /
//!                         └ notifications    streamable http)
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use client::{ClientEvent, UpstreamClient};
pub use error::{McpError, McpResult};
pub use protocol::{
    CallToolResult, ClientCapabilities, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, McpMessage, ServerCapabilities, Tool, ToolContent,
};
pub use transport::{McpTransport, TransportHealth, TransportSpec};

/// MCP protocol revision spoken on the wire
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Default timeout for a single MCP request
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Method name of the tool-list change notification
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
