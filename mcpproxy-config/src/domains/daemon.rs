//! Daemon-level settings: listen address, API key, event stream cadence

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::utils::serde_duration;
use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Settings for the control-plane HTTP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the REST/MCP server binds to
    pub listen: String,

    /// API key required in `X-API-Key`; `MCPPROXY_API_KEY` overrides.
    /// When unset, the control plane is open (loopback deployments).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Cadence of SSE heartbeat comments on `/events`
    #[serde(with = "serde_duration")]
    pub sse_heartbeat: Duration,

    /// Maximum number of activity-log entries retained
    pub activity_retention: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            api_key: None,
            sse_heartbeat: Duration::from_secs(15),
            activity_retention: 1000,
        }
    }
}

impl Validatable for DaemonConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(self.validation_error(format!("invalid listen address: {}", self.listen)));
        }
        if self.activity_retention == 0 {
            return Err(self.validation_error("activity_retention must be positive"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "daemon"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listen_is_loopback() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.listen.starts_with("127.0.0.1"));
    }

    #[test]
    fn test_rejects_bad_listen_addr() {
        let config = DaemonConfig {
            listen: "nonsense".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
