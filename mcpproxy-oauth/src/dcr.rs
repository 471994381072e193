//! Dynamic Client Registration (RFC 7591)
//!
//! Tried when no static `client_id` is configured and the authorization
//! server advertises a registration endpoint. A 403 means registration is
//! closed and the user must configure a client ID by hand.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{OAuthError, OAuthResult};

/// Registration request body
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
}

impl RegistrationRequest {
    /// Standard registration body for the proxy's loopback client
    pub fn for_proxy(redirect_uri: &str) -> Self {
        Self {
            client_name: "mcpproxy".to_string(),
            redirect_uris: vec![redirect_uri.to_string()],
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            // Public client; PKCE carries the proof
            token_endpoint_auth_method: "none".to_string(),
        }
    }
}

/// The registration response fields the flow needs
#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,

    #[serde(default)]
    pub client_secret: Option<String>,
}

/// Register a client, classifying refusals
pub async fn register(
    client: &reqwest::Client,
    registration_endpoint: &str,
    request: &RegistrationRequest,
    correlation_id: &str,
) -> OAuthResult<RegisteredClient> {
    debug!(correlation_id = %correlation_id, endpoint = %registration_endpoint, "attempting dynamic client registration");

    let response = client
        .post(registration_endpoint)
        .json(request)
        .send()
        .await
        .map_err(|e| OAuthError::DcrFailed {
            message: format!("registration endpoint unreachable: {}", e),
            correlation_id: correlation_id.to_string(),
            details: json!({ "dcr": { "url": registration_endpoint, "error": e.to_string() } }),
        })?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if status == reqwest::StatusCode::FORBIDDEN {
        return Err(OAuthError::ClientIdRequired {
            message: "authorization server refuses dynamic registration".to_string(),
            correlation_id: correlation_id.to_string(),
            details: json!({ "dcr": { "url": registration_endpoint, "status": 403 } }),
        });
    }

    if !status.is_success() {
        return Err(OAuthError::DcrFailed {
            message: format!("registration returned HTTP {}", status),
            correlation_id: correlation_id.to_string(),
            details: json!({
                "dcr": { "url": registration_endpoint, "status": status.as_u16(), "body": body }
            }),
        });
    }

    let registered: RegisteredClient =
        serde_json::from_str(&body).map_err(|e| OAuthError::DcrFailed {
            message: format!("registration response unparsable: {}", e),
            correlation_id: correlation_id.to_string(),
            details: json!({ "dcr": { "url": registration_endpoint, "parse_error": e.to_string() } }),
        })?;

    info!(correlation_id = %correlation_id, client_id = %registered.client_id, "dynamic client registered");
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn one_shot_server(status_line: &'static str, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/register", addr)
    }

    #[tokio::test]
    async fn test_successful_registration() {
        let url = one_shot_server("201 Created", r#"{"client_id":"abc","client_secret":"s"}"#).await;
        let client = reqwest::Client::new();
        let request = RegistrationRequest::for_proxy("http://127.0.0.1:52500/callback");

        let registered = register(&client, &url, &request, "cid").await.unwrap();
        assert_eq!(registered.client_id, "abc");
        assert_eq!(registered.client_secret.as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn test_403_maps_to_client_id_required() {
        let url = one_shot_server("403 Forbidden", "{}").await;
        let client = reqwest::Client::new();
        let request = RegistrationRequest::for_proxy("http://127.0.0.1:52500/callback");

        let err = register(&client, &url, &request, "cid").await.unwrap_err();
        assert_eq!(err.error_code(), "OAUTH_NO_CLIENT_ID");
    }

    #[tokio::test]
    async fn test_other_failure_is_dcr_failed() {
        let url = one_shot_server("500 Internal Server Error", "oops").await;
        let client = reqwest::Client::new();
        let request = RegistrationRequest::for_proxy("http://127.0.0.1:52500/callback");

        let err = register(&client, &url, &request, "cid").await.unwrap_err();
        assert_eq!(err.error_code(), "OAUTH_DCR_FAILED");
    }
}
