//! HTTP + Server-Sent Events transport (legacy MCP transport)
//!
//! `connect` opens a long-lived GET stream. The first `endpoint` event
//! names the URL outgoing frames are POSTed to; every later `message`
//! event is an incoming frame.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{EventStreamParser, McpTransport, TransportHealth};
use crate::protocol::McpMessage;
use crate::{McpError, McpResult};

pub struct SseTransport {
    url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,

    /// POST endpoint announced by the server's `endpoint` event
    post_url: Mutex<Option<String>>,

    incoming_tx: mpsc::UnboundedSender<McpMessage>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<McpMessage>>,

    pump: Mutex<Option<JoinHandle<()>>>,
    health: std::sync::Arc<Mutex<TransportHealth>>,
    connected: std::sync::Arc<AtomicBool>,
}

impl SseTransport {
    pub fn new(url: String, headers: HashMap<String, String>) -> McpResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| McpError::Configuration {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        Ok(Self {
            url,
            client,
            headers,
            post_url: Mutex::new(None),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            pump: Mutex::new(None),
            health: std::sync::Arc::new(Mutex::new(TransportHealth::disconnected())),
            connected: std::sync::Arc::new(AtomicBool::new(false)),
        })
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        req
    }

    /// Resolve a possibly relative endpoint path against the stream URL
    fn resolve_endpoint(&self, endpoint: &str) -> McpResult<String> {
        let base = url::Url::parse(&self.url).map_err(|e| McpError::Configuration {
            message: format!("invalid SSE URL: {}", e),
        })?;
        let resolved = base.join(endpoint).map_err(|e| McpError::Protocol {
            message: format!("invalid endpoint event '{}': {}", endpoint, e),
        })?;
        Ok(resolved.to_string())
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn connect(&self) -> McpResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let response = self
            .apply_headers(
                self.client
                    .get(&self.url)
                    .header(reqwest::header::ACCEPT, "text/event-stream"),
            )
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(McpError::auth_required(format!(
                "401 unauthorized; www-authenticate: {}",
                challenge
            )));
        }
        if !status.is_success() {
            return Err(McpError::Transport {
                message: format!("SSE stream returned HTTP {}", status),
            });
        }

        // The pump forwards frames; the endpoint event is delivered through
        // a oneshot so connect can wait for it.
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let incoming = self.incoming_tx.clone();
        let health = self.health.clone();
        let connected = self.connected.clone();

        let pump = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut parser = EventStreamParser::new();
            let mut stream = response.bytes_stream();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "SSE stream failed");
                        break;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                for frame in parser.feed(&text) {
                    match frame.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(frame.data);
                            }
                        }
                        _ => match serde_json::from_str::<McpMessage>(&frame.data) {
                            Ok(message) => {
                                health.lock().await.mark_success(None);
                                if incoming.send(message).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "discarding unparsable SSE frame");
                            }
                        },
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            health.lock().await.mark_failure("SSE stream ended");
        });
        *self.pump.lock().await = Some(pump);

        // Wait for the endpoint announcement before declaring connected
        let endpoint = tokio::time::timeout(
            std::time::Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS),
            endpoint_rx,
        )
        .await
        .map_err(|_| McpError::timeout(std::time::Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS)))?
        .map_err(|_| McpError::protocol("SSE stream closed before endpoint event"))?;

        let resolved = self.resolve_endpoint(&endpoint)?;
        debug!(endpoint = %resolved, "SSE endpoint announced");
        *self.post_url.lock().await = Some(resolved);

        self.connected.store(true, Ordering::SeqCst);
        self.health.lock().await.mark_success(None);
        Ok(())
    }

    async fn send(&self, message: &McpMessage) -> McpResult<()> {
        let post_url = self
            .post_url
            .lock()
            .await
            .clone()
            .ok_or_else(|| McpError::transport("SSE transport not connected"))?;

        let response = self
            .apply_headers(self.client.post(&post_url).json(message))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(McpError::auth_required("401 unauthorized on SSE post"));
        }
        if !response.status().is_success() {
            return Err(McpError::Transport {
                message: format!("SSE post returned HTTP {}", response.status()),
            });
        }
        Ok(())
    }

    async fn receive(&self) -> McpResult<McpMessage> {
        let mut rx = self.incoming_rx.lock().await;
        rx.recv().await.ok_or_else(|| McpError::Cancelled {
            reason: "transport closed".to_string(),
        })
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health(&self) -> TransportHealth {
        self.health.lock().await.clone()
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.incoming_rx.lock().await.close();
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sse"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_resolution() {
        let transport = SseTransport::new(
            "https://example.com/mcp/sse".to_string(),
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(
            transport.resolve_endpoint("/messages?session=1").unwrap(),
            "https://example.com/messages?session=1"
        );
        assert_eq!(
            transport
                .resolve_endpoint("https://other.example/post")
                .unwrap(),
            "https://other.example/post"
        );
    }
}
