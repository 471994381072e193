//! OAuth server discovery
//!
//! RFC 9728 Protected Resource Metadata (found through the 401 challenge's
//! `resource_metadata` parameter) followed by RFC 8414 Authorization
//! Server Metadata. Every URL attempted and its outcome is recorded so a
//! failed discovery produces a fully structured error.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{OAuthError, OAuthResult};

/// RFC 9728 Protected Resource Metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The resource identifier clients pass as the RFC 8707 `resource`
    pub resource: String,

    #[serde(default)]
    pub scopes_supported: Vec<String>,

    #[serde(default)]
    pub authorization_servers: Vec<String>,

    #[serde(flatten)]
    pub additional_fields: serde_json::Map<String, Value>,
}

/// OAuth 2.0 Authorization Server Metadata (RFC 8414), the subset the
/// flow needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    #[serde(default)]
    pub scopes_supported: Vec<String>,

    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,

    #[serde(flatten)]
    pub additional_fields: serde_json::Map<String, Value>,
}

impl AuthorizationServerMetadata {
    /// Whether the server advertises S256 PKCE
    pub fn supports_pkce_s256(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

/// Everything a successful discovery produced
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub resource_metadata: ProtectedResourceMetadata,
    pub auth_metadata: AuthorizationServerMetadata,

    /// Structured record of each URL attempted, kept for error details
    /// and debug logging
    pub details: Value,
}

/// Extract the `resource_metadata` URL from a `WWW-Authenticate` challenge
pub fn parse_resource_metadata_url(challenge: &str) -> Option<String> {
    let marker = "resource_metadata=";
    let start = challenge.find(marker)? + marker.len();
    let rest = &challenge[start..];
    let rest = rest.strip_prefix('"').unwrap_or(rest);
    let end = rest.find('"').unwrap_or_else(|| {
        rest.find([',', ' ']).unwrap_or(rest.len())
    });
    let url = &rest[..end];
    (!url.is_empty()).then(|| url.to_string())
}

/// Probe the server URL and pull the `WWW-Authenticate` challenge from
/// its 401 response
pub async fn probe_challenge(
    client: &reqwest::Client,
    server_url: &str,
    correlation_id: &str,
) -> OAuthResult<String> {
    let response = client
        .get(server_url)
        .send()
        .await
        .map_err(|e| OAuthError::MetadataMissing {
            message: format!("server unreachable: {}", e),
            correlation_id: correlation_id.to_string(),
            details: json!({ "server_url": { "url": server_url, "found": false, "error": e.to_string() } }),
        })?;

    let challenge = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if challenge.is_empty() {
        return Err(OAuthError::MetadataMissing {
            message: format!(
                "server answered HTTP {} without a WWW-Authenticate challenge",
                response.status()
            ),
            correlation_id: correlation_id.to_string(),
            details: json!({
                "server_url": { "url": server_url, "status": response.status().as_u16(), "www_authenticate": false }
            }),
        });
    }

    Ok(challenge)
}

/// Run the full discovery chain against a server URL
pub async fn discover(
    client: &reqwest::Client,
    server_url: &str,
    correlation_id: &str,
) -> OAuthResult<DiscoveryOutcome> {
    let challenge = probe_challenge(client, server_url, correlation_id).await?;

    let metadata_url = parse_resource_metadata_url(&challenge).ok_or_else(|| {
        OAuthError::MetadataMissing {
            message: "WWW-Authenticate challenge carries no resource_metadata".to_string(),
            correlation_id: correlation_id.to_string(),
            details: json!({
                "challenge": challenge,
                "protected_resource_metadata": { "found": false }
            }),
        }
    })?;

    debug!(correlation_id = %correlation_id, url = %metadata_url, "fetching protected resource metadata");

    let resource_metadata: ProtectedResourceMetadata =
        fetch_json(client, &metadata_url, correlation_id, "protected_resource_metadata").await?;

    if resource_metadata.authorization_servers.is_empty() {
        return Err(OAuthError::MetadataInvalid {
            message: "protected resource metadata names no authorization servers".to_string(),
            correlation_id: correlation_id.to_string(),
            details: json!({
                "protected_resource_metadata": { "url": metadata_url, "found": true },
                "authorization_servers": []
            }),
        });
    }

    // Try each advertised authorization server until one yields metadata
    let mut attempts = Vec::new();
    for issuer in &resource_metadata.authorization_servers {
        for well_known in [
            well_known_url(issuer, "oauth-authorization-server"),
            well_known_url(issuer, "openid-configuration"),
        ] {
            match fetch_json::<AuthorizationServerMetadata>(
                client,
                &well_known,
                correlation_id,
                "authorization_server_metadata",
            )
            .await
            {
                Ok(auth_metadata) => {
                    attempts.push(json!({ "url": well_known, "found": true }));
                    let details = json!({
                        "protected_resource_metadata": { "url": metadata_url, "found": true },
                        "authorization_server_metadata": { "found": true, "attempts": attempts },
                    });
                    return Ok(DiscoveryOutcome {
                        resource_metadata,
                        auth_metadata,
                        details,
                    });
                }
                Err(e) => {
                    warn!(correlation_id = %correlation_id, url = %well_known, error = %e, "authorization server metadata fetch failed");
                    attempts.push(json!({ "url": well_known, "found": false, "error": e.to_string() }));
                }
            }
        }
    }

    Err(OAuthError::MetadataMissing {
        message: "no authorization server published usable metadata".to_string(),
        correlation_id: correlation_id.to_string(),
        details: json!({
            "protected_resource_metadata": { "url": metadata_url, "found": true },
            "authorization_server_metadata": { "found": false, "attempts": attempts },
        }),
    })
}

/// `{issuer}/.well-known/{document}`, path-aware per RFC 8414 §3
fn well_known_url(issuer: &str, document: &str) -> String {
    match url::Url::parse(issuer) {
        Ok(parsed) => {
            let path = parsed.path().trim_matches('/');
            let mut base = parsed.clone();
            if path.is_empty() {
                base.set_path(&format!("/.well-known/{}", document));
            } else {
                base.set_path(&format!("/.well-known/{}/{}", document, path));
            }
            base.set_query(None);
            base.to_string()
        }
        Err(_) => format!("{}/.well-known/{}", issuer.trim_end_matches('/'), document),
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    correlation_id: &str,
    what: &str,
) -> OAuthResult<T> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| OAuthError::MetadataMissing {
            message: format!("{} unreachable: {}", what, e),
            correlation_id: correlation_id.to_string(),
            details: json!({ what: { "url": url, "found": false, "error": e.to_string() } }),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(OAuthError::MetadataMissing {
            message: format!("{} returned HTTP {}", what, status),
            correlation_id: correlation_id.to_string(),
            details: json!({ what: { "url": url, "found": false, "status": status.as_u16() } }),
        });
    }

    let body = response.text().await.map_err(|e| OAuthError::MetadataMissing {
        message: format!("{} body unreadable: {}", what, e),
        correlation_id: correlation_id.to_string(),
        details: json!({ what: { "url": url, "found": false, "error": e.to_string() } }),
    })?;

    serde_json::from_str(&body).map_err(|e| OAuthError::MetadataInvalid {
        message: format!("{} is not valid metadata: {}", what, e),
        correlation_id: correlation_id.to_string(),
        details: json!({ what: { "url": url, "found": true, "parse_error": e.to_string() } }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_parsing() {
        assert_eq!(
            parse_resource_metadata_url(
                r#"Bearer realm="mcp", resource_metadata="https://rs.example/.well-known/oauth-protected-resource""#
            ),
            Some("https://rs.example/.well-known/oauth-protected-resource".to_string())
        );
        assert_eq!(
            parse_resource_metadata_url("Bearer resource_metadata=https://rs.example/prm"),
            Some("https://rs.example/prm".to_string())
        );
        assert_eq!(parse_resource_metadata_url("Bearer realm=\"mcp\""), None);
        assert_eq!(parse_resource_metadata_url(""), None);
    }

    #[test]
    fn test_well_known_path_handling() {
        assert_eq!(
            well_known_url("https://as.example", "oauth-authorization-server"),
            "https://as.example/.well-known/oauth-authorization-server"
        );
        // issuer with a path component per RFC 8414 §3.1
        assert_eq!(
            well_known_url("https://as.example/tenant1", "oauth-authorization-server"),
            "https://as.example/.well-known/oauth-authorization-server/tenant1"
        );
    }

    #[test]
    fn test_pkce_support_detection() {
        let metadata = AuthorizationServerMetadata {
            issuer: "https://as.example".into(),
            authorization_endpoint: "https://as.example/authorize".into(),
            token_endpoint: Some("https://as.example/token".into()),
            registration_endpoint: None,
            scopes_supported: vec![],
            code_challenge_methods_supported: vec!["S256".into()],
            additional_fields: Default::default(),
        };
        assert!(metadata.supports_pkce_s256());
    }

    #[tokio::test]
    async fn test_discovery_against_fake_endpoints() {
        // A listener that always 404s: metadata missing end to end
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });

        let client = reqwest::Client::new();
        let err = discover(&client, &format!("http://{}/mcp", addr), "cid-1")
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "OAUTH_NO_METADATA");
        assert_eq!(err.correlation_id(), Some("cid-1"));
    }
}
