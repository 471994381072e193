//! Upstream MCP client
//!
//! Owns one transport, runs a read pump that correlates responses to
//! in-flight requests by ID and surfaces notifications through a channel.
//! The supervisor's actor is the single consumer of [`ClientEvent`]s.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    CallToolResult, ClientCapabilities, InitializeParams, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, McpMessage, PeerInfo, ServerCapabilities, Tool, ToolsCallParams,
    ToolsListResult,
};
use crate::transport::McpTransport;
use crate::{McpError, McpResult, MCP_PROTOCOL_VERSION};

/// Events the client surfaces to its owner
#[derive(Debug)]
pub enum ClientEvent {
    /// A server-initiated notification arrived
    Notification(JsonRpcRequest),

    /// The read pump stopped; the connection is gone
    Disconnected { reason: String },
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// MCP client for one upstream server
pub struct UpstreamClient {
    transport: Arc<dyn McpTransport>,
    pending: PendingMap,
    next_id: AtomicU64,
    request_timeout: Duration,
    events_tx: mpsc::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    capabilities: Mutex<Option<ServerCapabilities>>,
}

impl UpstreamClient {
    /// Wrap a transport. The returned receiver carries notifications and
    /// the disconnect signal; the owner must drain it.
    pub fn new(
        transport: Arc<dyn McpTransport>,
        request_timeout: Duration,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let client = Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            request_timeout,
            events_tx,
            pump: Mutex::new(None),
            capabilities: Mutex::new(None),
        };
        (client, events_rx)
    }

    /// Connect the transport, run the initialize handshake and start the
    /// read pump
    pub async fn start(&self) -> McpResult<InitializeResult> {
        self.transport.connect().await?;
        self.spawn_pump().await;

        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: PeerInfo::proxy(),
        };
        let response = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = parse_result(response)?;

        debug!(
            server = %result.server_info.name,
            version = %result.protocol_version,
            "initialize handshake complete"
        );

        *self.capabilities.lock().await = Some(result.capabilities.clone());

        // Completes the handshake; no response expected
        self.notify("notifications/initialized", None).await?;

        Ok(result)
    }

    /// Capabilities learned during initialize
    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities.lock().await.clone()
    }

    /// List all tools, following pagination cursors
    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let response = self.request("tools/list", params).await?;
            let page: ToolsListResult = parse_result(response)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(tools)
    }

    /// Invoke a tool with an explicit deadline
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> McpResult<CallToolResult> {
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments,
        };
        let response = self
            .request_with_timeout("tools/call", Some(serde_json::to_value(params)?), timeout)
            .await?;
        parse_result(response)
    }

    /// Send a request and await its response under the default timeout
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> McpResult<JsonRpcResponse> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Send a request and await its response
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let request = JsonRpcRequest::with_id(method, params, id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.transport.send(&McpMessage::Request(request)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::Cancelled {
                reason: "connection lost while waiting for response".to_string(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::timeout(timeout))
            }
        }
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let note = JsonRpcRequest::notification(method, params);
        self.transport.send(&McpMessage::Request(note)).await
    }

    /// Stop the pump, fail all in-flight requests and close the transport
    pub async fn close(&self) -> McpResult<()> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.fail_pending("client closed").await;
        self.transport.close().await
    }

    async fn fail_pending(&self, _reason: &str) {
        // Dropping the senders wakes every waiter with a recv error
        self.pending.lock().await.clear();
    }

    async fn spawn_pump(&self) {
        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let events = self.events_tx.clone();

        let pump = tokio::spawn(async move {
            loop {
                match transport.receive().await {
                    Ok(McpMessage::Response(response)) => {
                        let id = response
                            .id
                            .as_ref()
                            .map(value_id_to_string)
                            .unwrap_or_default();
                        let waiter = pending.lock().await.remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => {
                                debug!(id = %id, "response with no waiting request");
                            }
                        }
                    }
                    Ok(McpMessage::Request(request)) if request.is_notification() => {
                        if events
                            .send(ClientEvent::Notification(request))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(McpMessage::Request(request)) => {
                        // Server-initiated request; answer pings, refuse the rest
                        let response = if request.method == "ping" {
                            JsonRpcResponse::success(json!({}), request.id.clone())
                        } else {
                            JsonRpcResponse::error(
                                crate::protocol::JsonRpcError::method_not_found(&request.method),
                                request.id.clone(),
                            )
                        };
                        if let Err(e) = transport.send(&McpMessage::Response(response)).await {
                            warn!(error = %e, "failed to answer server request");
                        }
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        pending.lock().await.clear();
                        let _ = events.send(ClientEvent::Disconnected { reason }).await;
                        break;
                    }
                }
            }
        });

        *self.pump.lock().await = Some(pump);
    }
}

/// Render a JSON-RPC id value the same way the sender does
fn value_id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Extract and deserialize a successful result, mapping JSON-RPC errors
/// into the typed error space
fn parse_result<T: serde::de::DeserializeOwned>(response: JsonRpcResponse) -> McpResult<T> {
    if let Some(error) = response.error {
        let text = format!("{} {}", error.message, error.data.clone().unwrap_or_default());
        if text.to_lowercase().contains("unauthorized") || text.contains("401") {
            return Err(McpError::auth_required(text));
        }
        return Err(McpError::Protocol {
            message: format!("upstream error {}: {}", error.code, error.message),
        });
    }
    let result = response.result.ok_or_else(|| McpError::Protocol {
        message: "response carried neither result nor error".to_string(),
    })?;
    Ok(serde_json::from_value(result)?)
}
