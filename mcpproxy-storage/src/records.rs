//! Persisted record shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Persisted OAuth token for one upstream.
///
/// The bucket key is a SHA-256 of the config-level server name;
/// `display_name` preserves the user-visible name even if the hash input
/// ever changes shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokenRecord {
    pub server_name: String,
    pub display_name: String,

    pub access_token: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    pub token_type: String,

    /// Absolute expiry of the access token
    pub expires_at: DateTime<Utc>,

    #[serde(default)]
    pub scopes: Vec<String>,

    pub client_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Token endpoint the refresh grant goes to; kept so refresh works
    /// across restarts without re-running discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl OAuthTokenRecord {
    /// Bucket key for a server's token
    pub fn key_for(server_name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(server_name.as_bytes());
        hex_encode(&hasher.finalize())
    }
}

/// Kind of activity-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    ToolCall,
    PolicyDecision,
    QuarantineChange,
    ServerChange,
}

/// Where the activity originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    Mcp,
    Cli,
    Api,
}

/// Outcome of the logged operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Success,
    Error,
    Blocked,
}

/// One append-only activity-log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Monotonic ID assigned at append time
    #[serde(default)]
    pub id: u64,

    #[serde(rename = "type")]
    pub kind: ActivityKind,

    pub source: ActivitySource,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,

    /// Response payload, truncated to the configured limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(default)]
    pub response_truncated: bool,

    pub status: ActivityStatus,

    pub duration_ms: u64,

    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Rough token-usage estimate for the call, when computable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<u64>,
}

impl ActivityEntry {
    /// Truncate `response` to `limit` bytes, marking the entry when it was
    /// cut. Truncation lands on a char boundary.
    pub fn truncate_response(&mut self, limit: usize) {
        if let Some(response) = &self.response {
            if response.len() > limit {
                let mut cut = limit;
                while cut > 0 && !response.is_char_boundary(cut) {
                    cut -= 1;
                }
                self.response = Some(response[..cut].to_string());
                self.response_truncated = true;
            }
        }
    }
}

/// One persisted response-cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub fingerprint: String,
    pub value: Value,
    pub created: DateTime<Utc>,
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_key_is_stable_hash() {
        let a = OAuthTokenRecord::key_for("github");
        let b = OAuthTokenRecord::key_for("github");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, OAuthTokenRecord::key_for("gitlab"));
    }

    #[test]
    fn test_response_truncation_marks_entry() {
        let mut entry = ActivityEntry {
            id: 0,
            kind: ActivityKind::ToolCall,
            source: ActivitySource::Mcp,
            server: Some("gh".into()),
            tool: Some("search".into()),
            arguments: None,
            response: Some("x".repeat(100)),
            response_truncated: false,
            status: ActivityStatus::Success,
            duration_ms: 12,
            timestamp: Utc::now(),
            session_id: None,
            request_id: None,
            token_estimate: None,
        };

        entry.truncate_response(10);
        assert_eq!(entry.response.as_ref().unwrap().len(), 10);
        assert!(entry.response_truncated);

        let mut short = entry.clone();
        short.response = Some("ok".into());
        short.response_truncated = false;
        short.truncate_response(10);
        assert!(!short.response_truncated);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut entry = ActivityEntry {
            id: 0,
            kind: ActivityKind::ToolCall,
            source: ActivitySource::Api,
            server: None,
            tool: None,
            arguments: None,
            response: Some("héllo wörld".to_string()),
            response_truncated: false,
            status: ActivityStatus::Success,
            duration_ms: 0,
            timestamp: Utc::now(),
            session_id: None,
            request_id: None,
            token_estimate: None,
        };
        entry.truncate_response(2); // would split the é
        assert!(entry.response_truncated);
        assert!(entry.response.unwrap().is_char_boundary(1));
    }
}
