//! Transport layer abstractions for MCP communication
//!
//! Transports are full-duplex: `send` and `receive` use separate internal
//! locks so a blocked reader never stalls a writer. Each transport feeds
//! incoming frames (responses *and* server-initiated notifications) through
//! [`McpTransport::receive`]; correlation happens in the client layer.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::McpMessage;
use crate::{McpError, McpResult};

/// Transport configuration, decoupled from the config crate so this layer
/// stays reusable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportSpec {
    /// Local child process speaking JSON-RPC lines over stdin/stdout
    Stdio {
        command: String,

        #[serde(default)]
        args: Vec<String>,

        #[serde(default)]
        env: HashMap<String, String>,

        #[serde(skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
    },

    /// Plain HTTP request/response
    Http {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// HTTP + Server-Sent Events (legacy MCP transport)
    Sse {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// Streamable HTTP (POST with optional SSE response stream)
    StreamableHttp {
        url: String,

        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportSpec {
    /// Validate the transport configuration
    pub fn validate(&self) -> McpResult<()> {
        match self {
            TransportSpec::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::Configuration {
                        message: "stdio transport command cannot be empty".to_string(),
                    });
                }
            }
            TransportSpec::Http { url, .. }
            | TransportSpec::Sse { url, .. }
            | TransportSpec::StreamableHttp { url, .. } => {
                url::Url::parse(url).map_err(|e| McpError::Configuration {
                    message: format!("invalid transport URL '{}': {}", url, e),
                })?;
            }
        }
        Ok(())
    }

    /// Transport kind name for logs and health metadata
    pub fn kind(&self) -> &'static str {
        match self {
            TransportSpec::Stdio { .. } => "stdio",
            TransportSpec::Http { .. } => "http",
            TransportSpec::Sse { .. } => "sse",
            TransportSpec::StreamableHttp { .. } => "streamable-http",
        }
    }

    /// Create the transport this spec describes
    pub fn build(self) -> McpResult<Box<dyn McpTransport>> {
        self.validate()?;
        Ok(match self {
            TransportSpec::Stdio {
                command,
                args,
                env,
                working_dir,
            } => Box::new(StdioTransport::new(command, args, env, working_dir)),
            TransportSpec::Http { url, headers } => Box::new(HttpTransport::new(url, headers)?),
            TransportSpec::Sse { url, headers } => Box::new(SseTransport::new(url, headers)?),
            TransportSpec::StreamableHttp { url, headers } => {
                Box::new(StreamableHttpTransport::new(url, headers)?)
            }
        })
    }
}

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Establish the connection (spawn the child, open the stream)
    async fn connect(&self) -> McpResult<()>;

    /// Send one frame
    async fn send(&self, message: &McpMessage) -> McpResult<()>;

    /// Receive the next incoming frame. Driven by a single reader task;
    /// concurrent receivers are not supported.
    async fn receive(&self) -> McpResult<McpMessage>;

    /// Whether the transport believes it is connected
    async fn is_connected(&self) -> bool;

    /// Transport health snapshot
    async fn health(&self) -> TransportHealth;

    /// Tear down the connection and release resources
    async fn close(&self) -> McpResult<()>;

    /// Transport kind name
    fn kind(&self) -> &'static str;
}

/// Transport health information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportHealth {
    /// Whether the transport is connected
    pub connected: bool,

    /// Last successful message timestamp
    pub last_success: Option<chrono::DateTime<chrono::Utc>>,

    /// Last error encountered
    pub last_error: Option<String>,

    /// Number of consecutive failures
    pub consecutive_failures: u32,

    /// Round-trip latency, when measured
    pub latency: Option<Duration>,
}

impl TransportHealth {
    /// New, not-yet-connected state
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
            latency: None,
        }
    }

    /// Mark a successful operation
    pub fn mark_success(&mut self, latency: Option<Duration>) {
        self.connected = true;
        self.last_success = Some(chrono::Utc::now());
        self.last_error = None;
        self.consecutive_failures = 0;
        self.latency = latency;
    }

    /// Mark a failed operation
    pub fn mark_failure(&mut self, error: impl Into<String>) {
        self.connected = false;
        self.last_error = Some(error.into());
        self.consecutive_failures += 1;
    }
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Feed raw chunks, drain complete `(event, data)` pairs. Comment lines
/// (heartbeats) are skipped.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

/// One parsed SSE frame
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body; returns any frames it completed
    pub fn feed(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            if line.is_empty() {
                if !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
                self.event = None;
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            } else if line.starts_with(':') {
                // comment / heartbeat
            }
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(TransportSpec::Stdio {
            command: "npx".into(),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
        }
        .validate()
        .is_ok());

        assert!(TransportSpec::Stdio {
            command: "  ".into(),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
        }
        .validate()
        .is_err());

        assert!(TransportSpec::StreamableHttp {
            url: "not-a-url".into(),
            headers: HashMap::new(),
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_event_stream_parser() {
        let mut parser = EventStreamParser::new();

        let frames = parser.feed("event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "{\"a\":1}");

        // split across chunks
        assert!(parser.feed("data: par").is_empty());
        assert!(parser.feed("tial\n").is_empty());
        let frames = parser.feed("\n");
        assert_eq!(frames[0].data, "partial");

        // heartbeat comments produce nothing
        assert!(parser.feed(": keep-alive\n\n").is_empty());
    }

    #[test]
    fn test_multi_line_data_joined() {
        let mut parser = EventStreamParser::new();
        let frames = parser.feed("data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }
}
