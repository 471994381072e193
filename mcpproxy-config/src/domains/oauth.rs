//! OAuth subsystem settings: callback server, flow coordination, refresh

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::utils::serde_duration;
use crate::error::ConfigResult;
use crate::validation::Validatable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// First port the loopback callback server tries to bind
    pub callback_port_start: u16,

    /// Last port of the callback range (inclusive)
    pub callback_port_end: u16,

    /// One authorization flow per server may run at a time; a flow that
    /// exceeds this deadline is abandoned
    #[serde(with = "serde_duration")]
    pub flow_timeout: Duration,

    /// Window of the per-server browser-open rate limit
    #[serde(with = "serde_duration")]
    pub browser_rate_window: Duration,

    /// Tokens within this many seconds of expiry read as already expired
    #[serde(with = "serde_duration")]
    pub token_grace: Duration,

    /// Minimum spacing between refresh attempts for one server
    #[serde(with = "serde_duration")]
    pub refresh_min_interval: Duration,

    /// First network-failure backoff; doubles per retry
    #[serde(with = "serde_duration")]
    pub refresh_backoff_initial: Duration,

    /// Backoff ceiling
    #[serde(with = "serde_duration")]
    pub refresh_backoff_max: Duration,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            callback_port_start: 52500,
            callback_port_end: 52520,
            flow_timeout: Duration::from_secs(300),
            browser_rate_window: Duration::from_secs(300),
            token_grace: Duration::from_secs(60),
            refresh_min_interval: Duration::from_secs(10),
            refresh_backoff_initial: Duration::from_secs(10),
            refresh_backoff_max: Duration::from_secs(300),
        }
    }
}

impl Validatable for OAuthSettings {
    fn validate(&self) -> ConfigResult<()> {
        if self.callback_port_start == 0 {
            return Err(self.validation_error("callback_port_start must be non-zero"));
        }
        if self.callback_port_end < self.callback_port_start {
            return Err(self.validation_error(
                "callback_port_end must be >= callback_port_start",
            ));
        }
        if self.refresh_backoff_max < self.refresh_backoff_initial {
            return Err(self.validation_error(
                "refresh_backoff_max must be >= refresh_backoff_initial",
            ));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "oauth"
    }
}
