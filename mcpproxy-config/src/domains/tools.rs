//! Tool call, discovery and response-cache limits

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::utils::serde_duration;
use crate::error::ConfigResult;
use crate::validation::Validatable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Responses larger than this many bytes are truncated in the activity
    /// log and marked `response_truncated`
    pub tool_response_limit: usize,

    /// Capacity of the fingerprinted response cache (LRU entries)
    pub response_cache_capacity: usize,

    /// Deadline for one `tools/list` discovery run against an upstream
    #[serde(with = "serde_duration")]
    pub discovery_timeout: Duration,

    /// Default deadline for a brokered `tools/call`
    #[serde(with = "serde_duration")]
    pub call_timeout: Duration,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tool_response_limit: 20_000,
            response_cache_capacity: 256,
            discovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl Validatable for ToolsConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.tool_response_limit == 0 {
            return Err(self.validation_error("tool_response_limit must be positive"));
        }
        if self.response_cache_capacity == 0 {
            return Err(self.validation_error("response_cache_capacity must be positive"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "tools"
    }
}
