//! REST + SSE client against the core
//!
//! All tray commands round-trip through the core's API; the SSE stream is
//! the only push channel. Stream loss is reported to the state machine,
//! which drives reconnection with exponential backoff.

use std::time::Duration;

use futures::StreamExt;
use mcpproxy_mcp::transport::EventStreamParser;
use serde_json::Value;
use tracing::{debug, warn};

/// Events the SSE pump hands to the tray loop
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// `servers.changed` or `config.reloaded`: re-fetch and re-merge
    ServersChanged,

    /// Any other named event, passed through for logging
    Other(String),

    /// The stream ended
    StreamLost(String),
}

/// Client for one core instance
#[derive(Clone)]
pub struct CoreClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl CoreClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    /// Whether the core answers its info endpoint
    pub async fn is_ready(&self) -> bool {
        let url = format!("{}/api/v1/info", self.base_url);
        matches!(
            self.request(self.http.get(&url))
                .timeout(Duration::from_secs(2))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        )
    }

    /// `GET /api/v1/servers`, unwrapped from the envelope
    pub async fn fetch_servers(&self) -> Result<Vec<Value>, String> {
        let url = format!("{}/api/v1/servers", self.base_url);
        let body: Value = self
            .request(self.http.get(&url))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// POST one of the admin verbs for a server
    pub async fn server_action(&self, name: &str, action: &str) -> Result<(), String> {
        let url = format!("{}/api/v1/servers/{}/{}", self.base_url, name, action);
        let response = self
            .request(self.http.post(&url))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("core answered HTTP {}", response.status()))
        }
    }

    /// Consume `/events`, forwarding frames until the stream drops. The
    /// caller owns reconnection policy.
    pub async fn pump_events(&self, tx: tokio::sync::mpsc::Sender<CoreEvent>) {
        let url = match &self.api_key {
            Some(key) => format!("{}/events?api_key={}", self.base_url, key),
            None => format!("{}/events", self.base_url),
        };

        let response = match self
            .http
            .get(&url)
            .header("accept", "text/event-stream")
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let _ = tx
                    .send(CoreEvent::StreamLost(format!("HTTP {}", response.status())))
                    .await;
                return;
            }
            Err(e) => {
                let _ = tx.send(CoreEvent::StreamLost(e.to_string())).await;
                return;
            }
        };

        let mut parser = EventStreamParser::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tx.send(CoreEvent::StreamLost(e.to_string())).await;
                    return;
                }
            };
            for frame in parser.feed(&String::from_utf8_lossy(&chunk)) {
                let event = match frame.event.as_str() {
                    "servers.changed" | "config.reloaded" => CoreEvent::ServersChanged,
                    other => CoreEvent::Other(other.to_string()),
                };
                debug!(event = %frame.event, "core event");
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        warn!("core event stream ended");
        let _ = tx
            .send(CoreEvent::StreamLost("stream closed".to_string()))
            .await;
    }
}
