//! Streamable HTTP transport (current MCP default)
//!
//! Every frame is POSTed to the endpoint. The server answers with either a
//! JSON body or a short-lived `text/event-stream` carrying one or more
//! frames; both are funnelled into the incoming queue. The session ID the
//! server assigns on `initialize` rides along on every later request. An
//! optional long-lived GET stream picks up server-initiated notifications
//! where the server supports one.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{EventStreamParser, McpTransport, TransportHealth};
use crate::protocol::McpMessage;
use crate::{McpError, McpResult};

/// Header carrying the server-assigned session
const SESSION_HEADER: &str = "mcp-session-id";

pub struct StreamableHttpTransport {
    url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,

    session_id: Arc<Mutex<Option<String>>>,

    incoming_tx: mpsc::UnboundedSender<McpMessage>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<McpMessage>>,

    listener: Mutex<Option<JoinHandle<()>>>,
    stream_tasks: Mutex<Vec<JoinHandle<()>>>,

    health: Arc<Mutex<TransportHealth>>,
    connected: AtomicBool,
}

impl StreamableHttpTransport {
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
            session_id: Arc::new(Mutex::new(None)),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            listener: Mutex::new(None),
            stream_tasks: Mutex::new(Vec::new()),
            health: Arc::new(Mutex::new(TransportHealth::disconnected())),
            connected: AtomicBool::new(false),
        })
    }

    async fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        if let Some(session) = self.session_id.lock().await.as_deref() {
            req = req.header(SESSION_HEADER, session);
        }
        req
    }

    /// Spawn a task draining one SSE response body into the incoming queue
    async fn pump_sse_body(&self, response: reqwest::Response) {
        let incoming = self.incoming_tx.clone();
        let health = self.health.clone();
        let task = tokio::spawn(async move {
            let mut parser = EventStreamParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "response stream failed");
                        break;
                    }
                };
                for frame in parser.feed(&String::from_utf8_lossy(&chunk)) {
                    match serde_json::from_str::<McpMessage>(&frame.data) {
                        Ok(message) => {
                            health.lock().await.mark_success(None);
                            if incoming.send(message).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "discarding unparsable stream frame"),
                    }
                }
            }
        });
        self.stream_tasks.lock().await.push(task);
    }

    /// Open the optional long-lived GET notification stream. Servers that
    /// do not support one answer 404/405, which is fine.
    pub async fn open_listener(&self) -> McpResult<()> {
        if self.listener.lock().await.is_some() {
            return Ok(());
        }

        let response = self
            .apply_headers(
                self.client
                    .get(&self.url)
                    .header(reqwest::header::ACCEPT, "text/event-stream"),
            )
            .await
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED
        {
            debug!("upstream has no GET notification stream");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(McpError::Transport {
                message: format!("GET stream returned HTTP {}", response.status()),
            });
        }

        let incoming = self.incoming_tx.clone();
        let health = self.health.clone();
        let task = tokio::spawn(async move {
            let mut parser = EventStreamParser::new();
            let mut stream = response.bytes_stream();
            while let Some(Ok(chunk)) = stream.next().await {
                for frame in parser.feed(&String::from_utf8_lossy(&chunk)) {
                    match serde_json::from_str::<McpMessage>(&frame.data) {
                        Ok(message) => {
                            health.lock().await.mark_success(None);
                            if incoming.send(message).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "discarding unparsable listener frame"),
                    }
                }
            }
        });
        *self.listener.lock().await = Some(task);
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn connect(&self) -> McpResult<()> {
        // Stateless until the first POST; the session is assigned on
        // initialize.
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &McpMessage) -> McpResult<()> {
        let started = Instant::now();
        let response = self
            .apply_headers(
                self.client
                    .post(&self.url)
                    .header(
                        reqwest::header::ACCEPT,
                        "application/json, text/event-stream",
                    )
                    .json(message),
            )
            .await
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

        // Adopt the session the server assigned; a fresh session is the
        // moment to try the optional GET notification stream
        let mut fresh_session = false;
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.lock().await;
            if guard.as_deref() != Some(session) {
                debug!(session = %session, "adopted upstream session");
                *guard = Some(session.to_string());
                fresh_session = true;
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if status != reqwest::StatusCode::ACCEPTED {
            if content_type.starts_with("text/event-stream") {
                self.pump_sse_body(response).await;
            } else {
                let body = response.text().await?;
                if !body.trim().is_empty() {
                    let incoming: McpMessage = serde_json::from_str(&body)?;
                    let _ = self.incoming_tx.send(incoming);
                }
            }
        }

        if fresh_session {
            if let Err(e) = self.open_listener().await {
                debug!(error = %e, "no server notification stream");
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
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        for task in self.stream_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.incoming_rx.lock().await.close();
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "streamable-http"
    }
}
