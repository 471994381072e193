//! Loopback callback server for the authorization-code redirect
//!
//! Binds the first free port in the configured range, serves exactly one
//! redirect, verifies the CSRF `state` and hands the authorization code
//! back to the flow.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{OAuthError, OAuthResult};

const SUCCESS_PAGE: &str = "<html><body><h2>Login complete</h2>\
<p>You can close this tab and return to MCPProxy.</p></body></html>";

const FAILURE_PAGE: &str = "<html><body><h2>Login failed</h2>\
<p>MCPProxy could not complete the authorization. Check the logs.</p></body></html>";

/// A bound, not-yet-serving callback listener
#[derive(Debug)]
pub struct CallbackServer {
    listener: TcpListener,
    port: u16,
}

/// What the redirect delivered
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackResult {
    pub code: String,
    pub state: String,
}

impl CallbackServer {
    /// Bind the first free port in `[start, end]`
    pub async fn bind(
        range_start: u16,
        range_end: u16,
        correlation_id: &str,
    ) -> OAuthResult<Self> {
        for port in range_start..=range_end {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    debug!(correlation_id = %correlation_id, port, "callback server bound");
                    return Ok(Self { listener, port });
                }
                Err(e) => {
                    debug!(port, error = %e, "callback port unavailable");
                }
            }
        }
        Err(OAuthError::FlowFailed {
            message: format!(
                "no free callback port in {}-{}",
                range_start, range_end
            ),
            correlation_id: correlation_id.to_string(),
            details: serde_json::json!({ "port_range": [range_start, range_end] }),
        })
    }

    /// The bound port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The redirect URI to register with the authorization server
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    /// Serve redirects until one matches `expected_state`. Mismatched
    /// states are rejected and the listener keeps waiting; the flow's
    /// outer timeout bounds the whole wait.
    pub async fn wait_for_code(
        self,
        expected_state: &str,
        correlation_id: &str,
    ) -> OAuthResult<CallbackResult> {
        loop {
            let (mut socket, peer) =
                self.listener
                    .accept()
                    .await
                    .map_err(|e| OAuthError::FlowFailed {
                        message: format!("callback accept failed: {}", e),
                        correlation_id: correlation_id.to_string(),
                        details: serde_json::Value::Null,
                    })?;

            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);

            let Some(query) = parse_request_query(&request) else {
                respond(&mut socket, 404, FAILURE_PAGE).await;
                continue;
            };

            if let Some(error) = query_param(&query, "error") {
                let description =
                    query_param(&query, "error_description").unwrap_or_default();
                respond(&mut socket, 200, FAILURE_PAGE).await;
                return Err(OAuthError::FlowFailed {
                    message: format!(
                        "authorization server denied the request: {} {}",
                        error, description
                    ),
                    correlation_id: correlation_id.to_string(),
                    details: serde_json::json!({ "error": error, "error_description": description }),
                });
            }

            let code = query_param(&query, "code");
            let state = query_param(&query, "state");

            match (code, state) {
                (Some(code), Some(state)) if state == expected_state => {
                    respond(&mut socket, 200, SUCCESS_PAGE).await;
                    return Ok(CallbackResult { code, state });
                }
                (_, state) => {
                    warn!(
                        correlation_id = %correlation_id,
                        peer = %peer,
                        "callback with missing or mismatched state {:?}",
                        state
                    );
                    respond(&mut socket, 400, FAILURE_PAGE).await;
                }
            }
        }
    }
}

/// Pull the query string out of `GET /callback?... HTTP/1.1`
fn parse_request_query(request: &str) -> Option<String> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if method != "GET" || !target.starts_with("/callback") {
        return None;
    }
    Some(target.split_once('?').map(|(_, q)| q.to_string()).unwrap_or_default())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| {
            urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string())
        })
    })
}

async fn respond(socket: &mut tokio::net::TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        _ => "Not Found",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_parsing() {
        let request = "GET /callback?code=abc&state=xyz HTTP/1.1\r\nHost: x\r\n\r\n";
        let query = parse_request_query(request).unwrap();
        assert_eq!(query_param(&query, "code").as_deref(), Some("abc"));
        assert_eq!(query_param(&query, "state").as_deref(), Some("xyz"));
        assert_eq!(query_param(&query, "missing"), None);
    }

    #[test]
    fn test_non_callback_paths_rejected() {
        assert!(parse_request_query("GET /favicon.ico HTTP/1.1\r\n\r\n").is_none());
        assert!(parse_request_query("POST /callback?x=1 HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn test_url_decoding() {
        let query = "state=a%2Bb&code=c%20d";
        assert_eq!(query_param(query, "state").as_deref(), Some("a+b"));
        assert_eq!(query_param(query, "code").as_deref(), Some("c d"));
    }

    #[tokio::test]
    async fn test_callback_round_trip() {
        let server = CallbackServer::bind(52900, 52910, "cid").await.unwrap();
        let port = server.port();

        let wait = tokio::spawn(async move { server.wait_for_code("expected", "cid").await });

        // wrong state first: ignored, listener keeps serving
        let client = reqwest::Client::new();
        let bad = client
            .get(format!("http://127.0.0.1:{}/callback?code=evil&state=wrong", port))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status().as_u16(), 400);

        let good = client
            .get(format!(
                "http://127.0.0.1:{}/callback?code=authcode&state=expected",
                port
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(good.status().as_u16(), 200);

        let result = wait.await.unwrap().unwrap();
        assert_eq!(result.code, "authcode");
    }

    #[tokio::test]
    async fn test_provider_error_classified() {
        let server = CallbackServer::bind(52911, 52920, "cid").await.unwrap();
        let port = server.port();
        let wait = tokio::spawn(async move { server.wait_for_code("s", "cid").await });

        reqwest::get(format!(
            "http://127.0.0.1:{}/callback?error=access_denied&error_description=nope",
            port
        ))
        .await
        .unwrap();

        let err = wait.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "OAUTH_FLOW_FAILED");
        assert!(err.to_string().contains("access_denied"));
    }

    #[tokio::test]
    async fn test_port_range_exhaustion() {
        let _first = CallbackServer::bind(52921, 52921, "cid").await.unwrap();
        let err = CallbackServer::bind(52921, 52921, "cid").await.unwrap_err();
        assert_eq!(err.error_code(), "OAUTH_FLOW_FAILED");
    }
}
