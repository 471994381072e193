//! Logging configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigResult;
use crate::validation::Validatable;

/// Log level names accepted by the filter
pub const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for the env filter (`RUST_LOG` still wins)
    pub level: String,

    /// Whether to also write rotating log files
    pub file_enabled: bool,

    /// Override for the log directory; platform default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: true,
            directory: None,
        }
    }
}

impl LoggingConfig {
    /// Directory log files rotate in: the override, else
    /// `<platform data dir>/mcpproxy/logs`
    pub fn log_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("mcpproxy")
                .join("logs")
        })
    }
}

impl Validatable for LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !LEVELS.contains(&self.level.as_str()) {
            return Err(self.validation_error(format!(
                "unknown log level '{}', expected one of {:?}",
                self.level, LEVELS
            )));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_validation() {
        assert!(LoggingConfig::default().validate().is_ok());
        let bad = LoggingConfig {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
