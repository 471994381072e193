//! Plain HTTP request/response transport
//!
//! Each outgoing frame is a POST; the HTTP response body is the matching
//! JSON-RPC response, queued for the reader. Notifications get a 202 and
//! produce nothing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

use super::{McpTransport, TransportHealth};
use crate::protocol::McpMessage;
use crate::{McpError, McpResult};

pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,

    incoming_tx: mpsc::UnboundedSender<McpMessage>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<McpMessage>>,

    health: Mutex<TransportHealth>,
    connected: AtomicBool,
}

impl HttpTransport {
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
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            health: Mutex::new(TransportHealth::disconnected()),
            connected: AtomicBool::new(false),
        })
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        req
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn connect(&self) -> McpResult<()> {
        // Stateless; the first POST establishes reachability
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &McpMessage) -> McpResult<()> {
        let started = Instant::now();
        let response = self
            .apply_headers(self.client.post(&self.url).json(message))
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
            let body = response.text().await.unwrap_or_default();
            self.health.lock().await.mark_failure("401 unauthorized");
            return Err(McpError::auth_required(format!(
                "401 unauthorized; www-authenticate: {}; body: {}",
                challenge, body
            )));
        }
        if !status.is_success() && status != reqwest::StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            self.health.lock().await.mark_failure(format!("HTTP {}", status));
            return Err(McpError::Transport {
                message: format!("upstream returned HTTP {}: {}", status, body),
            });
        }

        // 202 (notification accepted) carries no body
        if status != reqwest::StatusCode::ACCEPTED {
            let body = response.text().await?;
            if !body.trim().is_empty() {
                let incoming: McpMessage = serde_json::from_str(&body)?;
                let _ = self.incoming_tx.send(incoming);
            }
        }

        self.health.lock().await.mark_success(Some(started.elapsed()));
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
        self.incoming_rx.lock().await.close();
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}
