//! Index and routing error types

use thiserror::Error;

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    /// No tool under this name anywhere in the catalog
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },

    /// A short name matches tools on several servers
    #[error("Tool name '{name}' is ambiguous across servers {servers:?}; use the qualified form \"<server>.{name}\"")]
    AmbiguousTool { name: String, servers: Vec<String> },

    /// Cache persistence failure
    #[error("Cache storage error: {0}")]
    Storage(#[from] mcpproxy_storage::StorageError),

    /// A single-flight computation failed; carries the caller's error text
    #[error("{message}")]
    Compute { message: String },
}

impl IndexError {
    pub fn compute(message: impl Into<String>) -> Self {
        Self::Compute {
            message: message.into(),
        }
    }
}
