//! Error types for MCP operations

use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// Comprehensive error type for MCP operations
#[derive(Error, Debug)]
pub enum McpError {
    /// Remote endpoint refused the connection
    #[error("Connection refused: {reason}")]
    ConnectionRefused { reason: String },

    /// Operation exceeded its deadline
    #[error("Timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    /// TLS handshake or certificate failure
    #[error("TLS error: {message}")]
    TlsError { message: String },

    /// Peer speaks something other than the expected MCP revision
    #[error("Protocol mismatch: {message}")]
    ProtocolMismatch { message: String },

    /// Transport-level errors not covered by a more specific variant
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Protocol-level errors (malformed frames, unexpected messages)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {details}")]
    Serialization { details: String },

    /// Tool not found on the upstream
    #[error("Tool not found: {tool_name}")]
    ToolNotFound { tool_name: String },

    /// Tool executed and reported failure
    #[error("Tool execution failed: {tool_name}: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    /// The upstream signalled that (re)authorization is required
    #[error("Authorization required: {detail}")]
    AuthRequired { detail: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation cancelled by shutdown
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl McpError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Create a tool-not-found error
    pub fn tool_not_found(tool_name: impl Into<String>) -> Self {
        Self::ToolNotFound {
            tool_name: tool_name.into(),
        }
    }

    /// Create an authorization-required error
    pub fn auth_required(detail: impl Into<String>) -> Self {
        Self::AuthRequired {
            detail: detail.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is retryable by the connection state machine
    pub fn is_retryable(&self) -> bool {
        match self {
            McpError::ConnectionRefused { .. }
            | McpError::Timeout { .. }
            | McpError::Transport { .. } => true,

            McpError::AuthRequired { .. }
            | McpError::ProtocolMismatch { .. }
            | McpError::ToolNotFound { .. }
            | McpError::Configuration { .. }
            | McpError::Cancelled { .. } => false,

            _ => false,
        }
    }

    /// Check if this error signals that an OAuth flow is needed.
    ///
    /// Matches 401 responses and the well-known body fragments upstream
    /// servers use for stale credentials.
    pub fn is_auth_error(&self) -> bool {
        if matches!(self, McpError::AuthRequired { .. }) {
            return true;
        }
        let text = self.to_string().to_lowercase();
        ["401", "invalid_token", "invalid_grant", "access_denied", "unauthorized", "no valid token available"]
            .iter()
            .any(|signal| text.contains(signal))
    }
}

// Implement conversions from common error types
impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Serialization {
            details: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            McpError::Timeout {
                timeout: Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS),
            }
        } else if err.is_connect() {
            McpError::ConnectionRefused {
                reason: err.to_string(),
            }
        } else {
            McpError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => McpError::Timeout {
                timeout: Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS),
            },
            std::io::ErrorKind::ConnectionRefused => McpError::ConnectionRefused {
                reason: err.to_string(),
            },
            _ => McpError::Transport {
                message: err.to_string(),
            },
        }
    }
}
