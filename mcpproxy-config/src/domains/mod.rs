//! Domain-specific configuration modules

pub mod daemon;
pub mod logging;
pub mod oauth;
pub mod tools;
pub mod upstream;
pub mod utils;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Main MCPProxy configuration combining all domains.
///
/// Serialized as `~/.mcpproxy/mcp_config.json`, the source of truth the
/// daemon hot-reloads.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Control-plane server settings
    pub daemon: daemon::DaemonConfig,

    /// Logging configuration
    pub logging: logging::LoggingConfig,

    /// Tool call / cache limits
    pub tools: tools::ToolsConfig,

    /// OAuth subsystem settings
    pub oauth: oauth::OAuthSettings,

    /// Configured upstream servers
    #[serde(rename = "mcpServers")]
    pub upstreams: Vec<upstream::UpstreamConfig>,
}

impl ProxyConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.daemon.validate()?;
        self.logging.validate()?;
        self.tools.validate()?;
        self.oauth.validate()?;

        let mut seen = HashSet::new();
        for upstream in &self.upstreams {
            upstream.validate()?;
            if !seen.insert(upstream.name.as_str()) {
                return Err(crate::error::ConfigError::ValidationError(format!(
                    "duplicate upstream name '{}'",
                    upstream.name
                )));
            }
        }

        Ok(())
    }

    /// Find an upstream by name
    pub fn upstream(&self, name: &str) -> Option<&upstream::UpstreamConfig> {
        self.upstreams.iter().find(|u| u.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upstream::UpstreamConfig;

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = ProxyConfig::default();
        config
            .upstreams
            .push(UpstreamConfig::new_http("gh", "https://a.example/mcp"));
        config
            .upstreams
            .push(UpstreamConfig::new_http("gh", "https://b.example/mcp"));
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProxyConfig::default().validate_all().is_ok());
    }
}
