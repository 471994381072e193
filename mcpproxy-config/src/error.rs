//! Configuration error types

use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading configuration file
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),

    /// JSON parsing error
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    EnvError(String),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    /// Domain-specific configuration error
    #[error("Domain configuration error in {domain}: {message}")]
    DomainError { domain: String, message: String },

    /// A patch attempted to change a field that never changes
    #[error("Field '{field}' is immutable and cannot be changed")]
    ImmutableField { field: String },

    /// A patch carried a field with an unusable value
    #[error("Invalid value for field '{field}': {message}")]
    InvalidField { field: String, message: String },
}

impl ConfigError {
    /// Create an immutable-field error
    pub fn immutable_field(field: impl Into<String>) -> Self {
        Self::ImmutableField { field: field.into() }
    }

    /// Create an invalid-field error
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}
