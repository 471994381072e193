//! Domain-driven configuration management for MCPProxy
//!
//! This crate provides modular configuration split by functional domains,
//! with validation, defaults, environment variable support and the
//! smart-merge patch engine that every update path funnels through.

pub mod error;
pub mod loader;
pub mod merge;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, ConfigWatcher};
pub use merge::{smart_merge, ConfigDiff, FieldChange};

// Re-export domain configurations
pub use domains::{
    daemon::DaemonConfig, logging::LoggingConfig, oauth::OAuthSettings, tools::ToolsConfig,
    upstream::{IsolationConfig, OAuthClientConfig, Protocol, UpstreamConfig},
    ProxyConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration;
