//! Configuration loading, environment variable handling and hot reload

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::domains::ProxyConfig;
use crate::error::{ConfigError, ConfigResult};

/// Default config file location: `~/.mcpproxy/mcp_config.json`
pub fn default_config_path() -> PathBuf {
    config_dir().join("mcp_config.json")
}

/// Default embedded store location: `~/.mcpproxy/config.db`
pub fn default_db_path() -> PathBuf {
    config_dir().join("config.db")
}

/// The `~/.mcpproxy` directory
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mcpproxy")
}

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with the default `MCPPROXY` prefix
    pub fn new() -> Self {
        Self {
            prefix: "MCPPROXY".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a JSON file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ProxyConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ProxyConfig = serde_json::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ProxyConfig> {
        let mut config = ProxyConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain: explicit path, default path,
    /// environment-only defaults
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ProxyConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => {
                let default = default_config_path();
                if default.exists() {
                    self.from_file(default)
                } else {
                    debug!("no config file found, starting from defaults");
                    self.from_env()
                }
            }
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut ProxyConfig) -> ConfigResult<()> {
        if let Ok(api_key) = self.get_env_var("API_KEY") {
            config.daemon.api_key = Some(api_key);
        }

        if let Ok(listen) = self.get_env_var("LISTEN") {
            config.daemon.listen = listen;
        }

        if let Ok(level) = self.get_env_var("LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(limit) = self.get_env_var("TOOL_RESPONSE_LIMIT") {
            config.tools.tool_response_limit = limit.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid TOOL_RESPONSE_LIMIT: {}", e))
            })?;
        }

        Ok(())
    }

    /// Get a prefixed environment variable
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Watches the config file and delivers freshly loaded configurations.
///
/// Editor save patterns (rename + write) collapse into a single reload via
/// a short debounce window. Invalid intermediate states are logged and
/// skipped; the previous configuration stays active.
pub struct ConfigWatcher {
    path: PathBuf,
    // Kept alive for the lifetime of the watcher; dropping it stops events.
    _watcher: RecommendedWatcher,
    rx: tokio::sync::mpsc::Receiver<ProxyConfig>,
}

impl ConfigWatcher {
    /// Start watching `path`. Reloads are validated before delivery.
    pub fn start(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        let watch_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "config watch error");
                    return;
                }
            };
            if !event.kind.is_modify() && !event.kind.is_create() {
                return;
            }
            // Debounce: editors emit bursts of events per save.
            std::thread::sleep(Duration::from_millis(100));
            match ConfigLoader::new().from_file(&watch_path) {
                Ok(config) => {
                    let _ = tx.blocking_send(config);
                }
                Err(e) => {
                    warn!(error = %e, "ignoring invalid config reload");
                }
            }
        })
        .map_err(|e| ConfigError::ValidationError(format!("failed to start watcher: {}", e)))?;

        let parent = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::ValidationError(format!("failed to watch config: {}", e)))?;

        Ok(Self {
            path,
            _watcher: watcher,
            rx,
        })
    }

    /// Path being watched
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receive the next successfully reloaded configuration
    pub async fn next(&mut self) -> Option<ProxyConfig> {
        self.rx.recv().await
    }
}

/// Atomically persist the configuration to `path` (write + rename)
pub fn save_config(config: &ProxyConfig, path: impl AsRef<Path>) -> ConfigResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::upstream::UpstreamConfig;

    #[test]
    fn test_load_missing_file_is_an_error() {
        let loader = ConfigLoader::new();
        assert!(loader.from_file("/definitely/not/here.json").is_err());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_config.json");

        let mut config = ProxyConfig::default();
        config
            .upstreams
            .push(UpstreamConfig::new_http("gh", "https://api.github.com/mcp"));
        save_config(&config, &path).unwrap();

        let loaded = ConfigLoader::new().from_file(&path).unwrap();
        assert_eq!(loaded.upstreams.len(), 1);
        assert_eq!(loaded.upstreams[0].name, "gh");
        assert!(loaded.upstreams[0].quarantined);
    }

    #[test]
    fn test_invalid_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ConfigLoader::new().from_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
