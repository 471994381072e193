//! Classified OAuth errors
//!
//! Each runtime failure carries an `error_type`/`error_code` pair, the
//! flow's correlation ID, structured details (per-URL discovery status,
//! DCR status), a remediation suggestion and a `debug_hint` naming the
//! log-grep command that shows the whole flow.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type OAuthResult<T> = Result<T, OAuthError>;

/// OAuth subsystem errors
#[derive(Error, Debug, Clone)]
pub enum OAuthError {
    /// Protected-resource or authorization-server metadata unreachable
    #[error("OAuth metadata missing: {message}")]
    MetadataMissing {
        message: String,
        correlation_id: String,
        details: Value,
    },

    /// Metadata fetched but unusable
    #[error("OAuth metadata invalid: {message}")]
    MetadataInvalid {
        message: String,
        correlation_id: String,
        details: Value,
    },

    /// RFC 8707 resource in the token does not match the expected resource
    #[error("OAuth resource mismatch: {message}")]
    ResourceMismatch {
        message: String,
        correlation_id: String,
        details: Value,
    },

    /// The authorization server refused dynamic registration; a static
    /// client_id must be configured
    #[error("OAuth client registration refused: {message}")]
    ClientIdRequired {
        message: String,
        correlation_id: String,
        details: Value,
    },

    /// Dynamic Client Registration failed for another reason
    #[error("Dynamic client registration failed: {message}")]
    DcrFailed {
        message: String,
        correlation_id: String,
        details: Value,
    },

    /// The authorization flow itself failed (callback, exchange, ...)
    #[error("OAuth flow failed: {message}")]
    FlowFailed {
        message: String,
        correlation_id: String,
        details: Value,
    },

    // Pre-flight validation, rejected before any network activity
    /// Unknown server name
    #[error("Server not found: {name}")]
    ServerNotFound {
        name: String,
        available_servers: Vec<String>,
    },

    /// Server is disabled
    #[error("Server '{name}' is disabled")]
    ServerDisabled { name: String },

    /// Server is quarantined
    #[error("Server '{name}' is quarantined")]
    ServerQuarantined { name: String },

    /// Server transport cannot carry OAuth (stdio)
    #[error("Server '{name}' does not support OAuth")]
    OAuthNotSupported { name: String },

    /// Another flow for this server is already running
    #[error("An authorization flow for '{name}' is already in progress")]
    FlowInProgress { name: String, correlation_id: String },
}

impl OAuthError {
    /// Machine-readable error type, stable across releases
    pub fn error_type(&self) -> &'static str {
        match self {
            OAuthError::MetadataMissing { .. } => "oauth_metadata_missing",
            OAuthError::MetadataInvalid { .. } => "oauth_metadata_invalid",
            OAuthError::ResourceMismatch { .. } => "oauth_resource_mismatch",
            OAuthError::ClientIdRequired { .. } => "oauth_client_id_required",
            OAuthError::DcrFailed { .. } => "oauth_dcr_failed",
            OAuthError::FlowFailed { .. } => "oauth_flow_failed",
            OAuthError::ServerNotFound { .. } => "server_not_found",
            OAuthError::ServerDisabled { .. } => "server_disabled",
            OAuthError::ServerQuarantined { .. } => "server_quarantined",
            OAuthError::OAuthNotSupported { .. } => "oauth_not_supported",
            OAuthError::FlowInProgress { .. } => "flow_in_progress",
        }
    }

    /// Short error code for dashboards and docs
    pub fn error_code(&self) -> &'static str {
        match self {
            OAuthError::MetadataMissing { .. } => "OAUTH_NO_METADATA",
            OAuthError::MetadataInvalid { .. } => "OAUTH_BAD_METADATA",
            OAuthError::ResourceMismatch { .. } => "OAUTH_RESOURCE_MISMATCH",
            OAuthError::ClientIdRequired { .. } => "OAUTH_NO_CLIENT_ID",
            OAuthError::DcrFailed { .. } => "OAUTH_DCR_FAILED",
            OAuthError::FlowFailed { .. } => "OAUTH_FLOW_FAILED",
            OAuthError::ServerNotFound { .. } => "SERVER_NOT_FOUND",
            OAuthError::ServerDisabled { .. } => "SERVER_DISABLED",
            OAuthError::ServerQuarantined { .. } => "SERVER_QUARANTINED",
            OAuthError::OAuthNotSupported { .. } => "OAUTH_NOT_SUPPORTED",
            OAuthError::FlowInProgress { .. } => "FLOW_IN_PROGRESS",
        }
    }

    /// Whether this is a pre-flight validation rejection (HTTP 400)
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OAuthError::ServerNotFound { .. }
                | OAuthError::ServerDisabled { .. }
                | OAuthError::ServerQuarantined { .. }
                | OAuthError::OAuthNotSupported { .. }
                | OAuthError::FlowInProgress { .. }
        )
    }

    /// Correlation ID, when the error happened inside a flow
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            OAuthError::MetadataMissing { correlation_id, .. }
            | OAuthError::MetadataInvalid { correlation_id, .. }
            | OAuthError::ResourceMismatch { correlation_id, .. }
            | OAuthError::ClientIdRequired { correlation_id, .. }
            | OAuthError::DcrFailed { correlation_id, .. }
            | OAuthError::FlowFailed { correlation_id, .. }
            | OAuthError::FlowInProgress { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    /// Structured details for the response body
    pub fn details(&self) -> Value {
        match self {
            OAuthError::MetadataMissing { details, .. }
            | OAuthError::MetadataInvalid { details, .. }
            | OAuthError::ResourceMismatch { details, .. }
            | OAuthError::ClientIdRequired { details, .. }
            | OAuthError::DcrFailed { details, .. }
            | OAuthError::FlowFailed { details, .. } => details.clone(),
            OAuthError::ServerNotFound {
                available_servers, ..
            } => serde_json::json!({ "available_servers": available_servers }),
            _ => Value::Null,
        }
    }

    /// One-line remediation hint
    pub fn suggestion(&self) -> String {
        match self {
            OAuthError::MetadataMissing { .. } => {
                "Verify the server URL and that its authorization server publishes RFC 8414 metadata".to_string()
            }
            OAuthError::MetadataInvalid { .. } => {
                "The authorization server's metadata document is malformed; contact the server operator".to_string()
            }
            OAuthError::ResourceMismatch { .. } => {
                "Set oauth.extra_params.resource explicitly to the server's canonical resource URL".to_string()
            }
            OAuthError::ClientIdRequired { .. } => {
                "Configure a static oauth.client_id for this server; its authorization server does not allow dynamic registration".to_string()
            }
            OAuthError::DcrFailed { .. } => {
                "Retry, or configure a static oauth.client_id to bypass dynamic registration".to_string()
            }
            OAuthError::FlowFailed { .. } => {
                "Retry the login; if it keeps failing, check the callback port range and firewall".to_string()
            }
            OAuthError::ServerNotFound { .. } => "Check the server name with 'mcpproxy upstream list'".to_string(),
            OAuthError::ServerDisabled { name } => format!("Enable it first: mcpproxy upstream enable {}", name),
            OAuthError::ServerQuarantined { name } => {
                format!("Approve it first: mcpproxy upstream unquarantine {}", name)
            }
            OAuthError::OAuthNotSupported { .. } => {
                "Only HTTP-family servers support OAuth login".to_string()
            }
            OAuthError::FlowInProgress { .. } => {
                "Wait for the running flow to finish (it times out after 5 minutes)".to_string()
            }
        }
    }

    /// Where to look in the logs
    pub fn debug_hint(&self) -> String {
        match self.correlation_id() {
            Some(id) => format!("grep 'correlation_id={}' in the mcpproxy log directory", id),
            None => "run with --log-level debug and retry".to_string(),
        }
    }

    /// Serializable body for REST/CLI surfaces
    pub fn to_body(&self) -> OAuthErrorBody {
        OAuthErrorBody {
            error_type: self.error_type().to_string(),
            error_code: self.error_code().to_string(),
            message: self.to_string(),
            correlation_id: self.correlation_id().map(String::from),
            details: self.details(),
            suggestion: self.suggestion(),
            debug_hint: self.debug_hint(),
        }
    }
}

/// Wire shape of a classified OAuth error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthErrorBody {
    pub error_type: String,
    pub error_code: String,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,

    pub suggestion: String,
    pub debug_hint: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_codes_match_taxonomy() {
        let err = OAuthError::MetadataMissing {
            message: "m".into(),
            correlation_id: "cid".into(),
            details: json!({}),
        };
        assert_eq!(err.error_type(), "oauth_metadata_missing");
        assert_eq!(err.error_code(), "OAUTH_NO_METADATA");
        assert_eq!(err.correlation_id(), Some("cid"));
        assert!(!err.is_validation());
    }

    #[test]
    fn test_validation_errors_flagged() {
        let err = OAuthError::ServerNotFound {
            name: "x".into(),
            available_servers: vec!["a".into()],
        };
        assert!(err.is_validation());
        assert_eq!(err.details()["available_servers"][0], "a");
    }

    #[test]
    fn test_body_carries_correlation_id() {
        let err = OAuthError::FlowFailed {
            message: "exchange failed".into(),
            correlation_id: "abc-123".into(),
            details: json!({"step": "token_exchange"}),
        };
        let body = err.to_body();
        assert_eq!(body.error_code, "OAUTH_FLOW_FAILED");
        assert_eq!(body.correlation_id.as_deref(), Some("abc-123"));
        assert!(body.debug_hint.contains("abc-123"));
        assert_eq!(body.details["step"], "token_exchange");
    }
}
