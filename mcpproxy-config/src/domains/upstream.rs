//! Upstream server definitions
//!
//! An [`UpstreamConfig`] is the immutable description of one remote MCP
//! server. The `protocol` discriminator decides which transport fields are
//! meaningful; `name` and `created` never change once the entry exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ConfigResult;
use crate::validation::{validate_upstream_name, Validatable};

/// Wire protocol used to reach an upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Local child process speaking JSON-RPC over stdin/stdout
    Stdio,

    /// Plain HTTP request/response
    Http,

    /// HTTP with a Server-Sent Events response stream
    Sse,

    /// Streamable HTTP (POST + SSE), the current MCP default
    StreamableHttp,

    /// Detect from the other fields: `command` means stdio, `url` means
    /// streamable HTTP
    #[default]
    Auto,
}

impl Protocol {
    /// Protocol name as it appears on the wire and in the CLI
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Stdio => "stdio",
            Protocol::Http => "http",
            Protocol::Sse => "sse",
            Protocol::StreamableHttp => "streamable-http",
            Protocol::Auto => "auto",
        }
    }
}

/// OAuth client settings for an HTTP-family upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OAuthClientConfig {
    /// Static client ID; when absent, Dynamic Client Registration is tried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Static client secret for confidential clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Requested scopes; empty means whatever the server advertises
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,

    /// Extra query parameters injected into the authorization URL and token
    /// requests. A manual `resource` entry here overrides auto-detection.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra_params: HashMap<String, String>,
}

/// Docker isolation settings for stdio upstreams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IsolationConfig {
    /// Whether the child process runs inside a container
    pub enabled: bool,

    /// Container image to run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Extra arguments passed to the container runtime
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// Configuration for one upstream MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Unique name, 1-64 characters from `[A-Za-z0-9_-]`. Immutable.
    pub name: String,

    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,

    /// Endpoint URL (HTTP-family protocols)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra HTTP headers sent on every request (HTTP-family protocols)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// OAuth client settings (HTTP-family protocols)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthClientConfig>,

    /// Command to execute (stdio protocol)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Command arguments (stdio protocol)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables for the child process. Values of the form
    /// `${env:NAME}` are resolved from the daemon's environment at spawn
    /// time; an unresolvable reference surfaces as a missing secret.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Working directory for the child process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Whether the server participates in routing at all
    #[serde(default = "super::utils::default_true")]
    pub enabled: bool,

    /// Quarantined servers are configured but never service tool calls
    /// until explicitly approved. New servers start quarantined.
    #[serde(default = "super::utils::default_true")]
    pub quarantined: bool,

    /// Docker isolation settings (stdio protocol)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationConfig>,

    /// Set once at creation and preserved across all patches. Immutable.
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,

    /// Bumped on every successful patch
    #[serde(default = "Utc::now")]
    pub updated: DateTime<Utc>,
}

impl UpstreamConfig {
    /// Create a new HTTP-family upstream; new entries start quarantined
    pub fn new_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            protocol: Protocol::Auto,
            url: Some(url.into()),
            headers: HashMap::new(),
            oauth: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            enabled: true,
            quarantined: true,
            isolation: None,
            created: now,
            updated: now,
        }
    }

    /// Create a new stdio upstream; new entries start quarantined
    pub fn new_stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            protocol: Protocol::Stdio,
            url: None,
            headers: HashMap::new(),
            oauth: None,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            working_dir: None,
            enabled: true,
            quarantined: true,
            isolation: None,
            created: now,
            updated: now,
        }
    }

    /// Resolve `auto` into a concrete protocol from the populated fields
    pub fn effective_protocol(&self) -> Protocol {
        match self.protocol {
            Protocol::Auto => {
                if self.command.is_some() {
                    Protocol::Stdio
                } else {
                    Protocol::StreamableHttp
                }
            }
            other => other,
        }
    }

    /// Whether this upstream speaks an HTTP-family protocol
    pub fn is_http_family(&self) -> bool {
        matches!(
            self.effective_protocol(),
            Protocol::Http | Protocol::Sse | Protocol::StreamableHttp
        )
    }

    /// Environment references of the form `${env:NAME}` whose variable is
    /// not set in the daemon's environment. Drives the missing-secret
    /// health state.
    pub fn missing_secrets(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for value in self.env.values() {
            if let Some(name) = parse_env_reference(value) {
                if std::env::var(&name).is_err() {
                    missing.push(name);
                }
            }
        }
        missing.sort();
        missing.dedup();
        missing
    }
}

/// Extract `NAME` from a `${env:NAME}` reference, if the value is one
pub fn parse_env_reference(value: &str) -> Option<String> {
    let inner = value.strip_prefix("${env:")?.strip_suffix('}')?;
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

impl Validatable for UpstreamConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_upstream_name(&self.name)?;

        match self.effective_protocol() {
            Protocol::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .unwrap_or_default();
                if command.trim().is_empty() {
                    return Err(self.validation_error("stdio upstream requires a command"));
                }
            }
            Protocol::Http | Protocol::Sse | Protocol::StreamableHttp => {
                let raw = self
                    .url
                    .as_deref()
                    .ok_or_else(|| self.validation_error("HTTP upstream requires a url"))?;
                url::Url::parse(raw)
                    .map_err(|e| self.validation_error(format!("invalid url: {}", e)))?;
            }
            Protocol::Auto => unreachable!("effective_protocol never returns Auto"),
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "upstream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_servers_start_quarantined() {
        let server = UpstreamConfig::new_http("gh", "https://api.github.com/mcp");
        assert!(server.quarantined);
        assert!(server.enabled);
    }

    #[test]
    fn test_protocol_auto_detection() {
        let http = UpstreamConfig::new_http("a", "https://example.com/mcp");
        assert_eq!(http.effective_protocol(), Protocol::StreamableHttp);
        assert!(http.is_http_family());

        let stdio = UpstreamConfig::new_stdio("b", "uvx", vec!["server".into()]);
        assert_eq!(stdio.effective_protocol(), Protocol::Stdio);
        assert!(!stdio.is_http_family());
    }

    #[test]
    fn test_validation_by_protocol() {
        let mut server = UpstreamConfig::new_http("a", "not a url");
        assert!(server.validate().is_err());
        server.url = Some("https://example.com/mcp".into());
        assert!(server.validate().is_ok());

        let mut stdio = UpstreamConfig::new_stdio("b", "", vec![]);
        assert!(stdio.validate().is_err());
        stdio.command = Some("npx".into());
        assert!(stdio.validate().is_ok());
    }

    #[test]
    fn test_env_reference_parsing() {
        assert_eq!(
            parse_env_reference("${env:GITHUB_TOKEN}"),
            Some("GITHUB_TOKEN".to_string())
        );
        assert_eq!(parse_env_reference("literal"), None);
        assert_eq!(parse_env_reference("${env:}"), None);
    }

    #[test]
    fn test_missing_secret_detection() {
        let mut server = UpstreamConfig::new_stdio("s", "run", vec![]);
        server
            .env
            .insert("TOKEN".into(), "${env:MCPPROXY_TEST_SURELY_UNSET}".into());
        assert_eq!(
            server.missing_secrets(),
            vec!["MCPPROXY_TEST_SURELY_UNSET".to_string()]
        );
    }

    #[test]
    fn test_serialization_round_trip_preserves_all_fields() {
        let mut server = UpstreamConfig::new_http("gh", "https://api.github.com/mcp");
        server.isolation = Some(IsolationConfig {
            enabled: true,
            image: Some("python:3.11".into()),
            extra_args: vec!["-v".into(), "/p:/m".into()],
        });
        server.oauth = Some(OAuthClientConfig {
            client_id: Some("abc".into()),
            client_secret: None,
            scopes: vec!["mcp".into()],
            extra_params: [("resource".to_string(), "https://rs".to_string())].into(),
        });

        let json = serde_json::to_value(&server).unwrap();
        let back: UpstreamConfig = serde_json::from_value(json).unwrap();
        assert_eq!(server, back);
    }
}
