//! Supervisor error types

use thiserror::Error;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Unknown server; carries the configured names for the error body
    #[error("Server not found: {name}")]
    NotFound { name: String, available: Vec<String> },

    /// Add with a name that already exists
    #[error("Server already exists: {name}")]
    AlreadyExists { name: String },

    /// Quarantined servers never service tool calls
    #[error("Server '{name}' is quarantined")]
    Quarantined { name: String },

    /// Disabled servers never service tool calls
    #[error("Server '{name}' is disabled")]
    Disabled { name: String },

    /// No tool under this name
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    /// Short tool name matches several servers
    #[error("Tool name '{name}' is ambiguous across {servers:?}")]
    AmbiguousTool { name: String, servers: Vec<String> },

    /// Configuration/patch failure
    #[error(transparent)]
    Config(#[from] mcpproxy_config::ConfigError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] mcpproxy_storage::StorageError),

    /// Error from the upstream itself
    #[error(transparent)]
    Upstream(mcpproxy_mcp::McpError),
}

impl SupervisorError {
    /// Whether this is caller error (HTTP 400/404) rather than proxy
    /// failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SupervisorError::NotFound { .. }
                | SupervisorError::AlreadyExists { .. }
                | SupervisorError::Quarantined { .. }
                | SupervisorError::Disabled { .. }
                | SupervisorError::ToolNotFound { .. }
                | SupervisorError::AmbiguousTool { .. }
                | SupervisorError::Config(_)
        )
    }
}
