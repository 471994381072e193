//! The per-upstream actor
//!
//! One actor per configured server owns that server's transport client,
//! connection state machine and tool list. Cross-actor interaction goes
//! through the supervisor's command channels only; actors reference each
//! other by server name, never by pointer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use mcpproxy_config::{Protocol, ToolsConfig, UpstreamConfig};
use mcpproxy_events::{EventBus, ProxyEvent};
use mcpproxy_index::ToolRegistry;
use mcpproxy_mcp::transport::StdioTransport;
use mcpproxy_mcp::{
    CallToolResult, ClientEvent, McpError, McpResult, McpTransport, Tool, TransportSpec,
    UpstreamClient, TOOLS_LIST_CHANGED,
};
use mcpproxy_oauth::FlowCoordinator;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mask::masked_env;
use crate::process::{capture_stderr, OutputRing};
use crate::state::{
    can_transition, event_for_exit_code, next_state, ConnectionState, RetryPolicy, StateEvent,
};

/// Deadline for one discovery run triggered by `tools/list_changed`
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands an actor accepts
pub enum ActorCommand {
    Connect,
    Disconnect,
    CallTool {
        tool: String,
        args: Option<Value>,
        reply: oneshot::Sender<McpResult<CallToolResult>>,
    },
    ListTools {
        reply: oneshot::Sender<McpResult<Vec<Tool>>>,
    },
    ForceReauth,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Point-in-time view of an actor, input to the health calculator
#[derive(Debug, Clone, PartialEq)]
pub struct ActorStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    pub last_error: Option<String>,
}

/// State shared between the actor task and its handle
pub struct ActorShared {
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    shutdown: AtomicBool,
}

impl ActorShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ConnectionState::Initializing),
            last_error: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> ActorStatus {
        let state = *self.state.read().expect("actor state poisoned");
        ActorStatus {
            state,
            connected: state == ConnectionState::Connected,
            connecting: matches!(
                state,
                ConnectionState::Initializing
                    | ConnectionState::Launching
                    | ConnectionState::WaitingReady
                    | ConnectionState::Connecting
                    | ConnectionState::Reconnecting
            ),
            last_error: self.last_error.read().expect("actor state poisoned").clone(),
        }
    }
}

/// Dependencies every actor shares
#[derive(Clone)]
pub struct ActorDeps {
    pub bus: EventBus,
    pub registry: Arc<ToolRegistry>,
    pub coordinator: Arc<FlowCoordinator>,

    /// Process-wide set of servers with a discovery in progress; the
    /// membership check is the whole debounce
    pub discovery_inflight: Arc<Mutex<HashSet<String>>>,

    pub tools: ToolsConfig,

    /// Authorization header values per server, maintained by the token
    /// layer; consulted when (re)building HTTP transports
    pub auth_headers: Arc<RwLock<HashMap<String, String>>>,
}

/// Handle the supervisor keeps per actor
pub struct ActorHandle {
    pub name: String,
    tx: mpsc::Sender<ActorCommand>,
    shared: Arc<ActorShared>,
    ring: OutputRing,
    join: JoinHandle<()>,
}

impl ActorHandle {
    /// Spawn the actor for `config`
    pub fn spawn(config: UpstreamConfig, deps: ActorDeps) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let shared = ActorShared::new();
        let ring = OutputRing::new();
        let name = config.name.clone();

        let actor = Actor {
            config,
            deps,
            shared: shared.clone(),
            ring: ring.clone(),
            client: None,
            client_events: None,
            stdio: None,
            capture: None,
        };
        let join = tokio::spawn(actor.run(rx));

        Self {
            name,
            tx,
            shared,
            ring,
            join,
        }
    }

    pub fn status(&self) -> ActorStatus {
        self.shared.status()
    }

    /// Clone of the command channel, so callers can queue work without
    /// holding any supervisor lock across the await
    pub fn command_sender(&self) -> mpsc::Sender<ActorCommand> {
        self.tx.clone()
    }

    /// Recent captured child output
    pub fn logs(&self, limit: usize) -> Vec<String> {
        self.ring.tail(limit)
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        args: Option<Value>,
    ) -> McpResult<CallToolResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorCommand::CallTool {
                tool: tool.to_string(),
                args,
                reply,
            })
            .await
            .map_err(|_| McpError::Cancelled {
                reason: "actor gone".to_string(),
            })?;
        rx.await.map_err(|_| McpError::Cancelled {
            reason: "actor dropped the request".to_string(),
        })?
    }

    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ActorCommand::ListTools { reply })
            .await
            .map_err(|_| McpError::Cancelled {
                reason: "actor gone".to_string(),
            })?;
        rx.await.map_err(|_| McpError::Cancelled {
            reason: "actor dropped the request".to_string(),
        })?
    }

    pub async fn force_reauth(&self) {
        let _ = self.tx.send(ActorCommand::ForceReauth).await;
    }

    /// Graceful shutdown with a bounded wait; the task is aborted if it
    /// overstays the grace window
    pub async fn shutdown(self, grace: Duration) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let (done, rx) = oneshot::channel();
        if self.tx.send(ActorCommand::Shutdown { done }).await.is_ok() {
            if tokio::time::timeout(grace, rx).await.is_err() {
                warn!(server = %self.name, "actor ignored shutdown, aborting");
                self.join.abort();
            }
        } else {
            self.join.abort();
        }
    }
}

struct Actor {
    config: UpstreamConfig,
    deps: ActorDeps,
    shared: Arc<ActorShared>,
    ring: OutputRing,

    client: Option<Arc<UpstreamClient>>,
    client_events: Option<mpsc::Receiver<ClientEvent>>,

    /// Kept alongside the trait object for exit codes and stderr
    stdio: Option<Arc<StdioTransport>>,
    capture: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<ActorCommand>) {
        if self.config.enabled && !self.config.quarantined {
            self.establish().await;
        }

        loop {
            let mut events = self.client_events.take();
            tokio::select! {
                command = commands.recv() => {
                    self.client_events = events;
                    match command {
                        None => {
                            self.teardown().await;
                            break;
                        }
                        Some(ActorCommand::Shutdown { done }) => {
                            self.apply(StateEvent::Shutdown);
                            self.teardown().await;
                            let _ = done.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = recv_event(&mut events) => {
                    self.client_events = events;
                    match event {
                        Some(event) => self.handle_client_event(event).await,
                        None => self.client_events = None,
                    }
                }
            }
        }
    }

    // === state machine plumbing ===

    fn state(&self) -> ConnectionState {
        *self.shared.state.read().expect("actor state poisoned")
    }

    /// Apply an event to the state machine; illegal events are dropped
    fn apply(&self, event: StateEvent) -> Option<ConnectionState> {
        let current = self.state();
        let next = next_state(current, event)?;
        debug_assert!(can_transition(current, next));
        *self.shared.state.write().expect("actor state poisoned") = next;
        debug!(server = %self.config.name, from = %current, to = %next, "state transition");
        self.deps.bus.publish(ProxyEvent::HealthChanged {
            server: self.config.name.clone(),
            level: next.label().to_string(),
        });
        self.deps.bus.publish(ProxyEvent::ServersChanged);
        Some(next)
    }

    fn record_error(&self, error: impl Into<String>) {
        *self.shared.last_error.write().expect("actor state poisoned") = Some(error.into());
    }

    fn clear_error(&self) {
        *self.shared.last_error.write().expect("actor state poisoned") = None;
    }

    fn shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    // === commands ===

    async fn handle_command(&mut self, command: ActorCommand) {
        match command {
            ActorCommand::Connect => {
                if self.state().is_error() {
                    debug!(server = %self.config.name, "connect ignored in sticky error state");
                } else if self.client.is_none() {
                    self.establish().await;
                }
            }
            ActorCommand::Disconnect => {
                self.teardown().await;
                self.apply(StateEvent::Shutdown);
            }
            ActorCommand::CallTool { tool, args, reply } => {
                let result = self.call_tool(&tool, args).await;
                let _ = reply.send(result);
            }
            ActorCommand::ListTools { reply } => {
                let result = match &self.client {
                    Some(client) => client.list_tools().await,
                    None => Err(McpError::transport("not connected")),
                };
                let _ = reply.send(result);
            }
            ActorCommand::ForceReauth => {
                info!(server = %self.config.name, "reauthorization requested");
                self.record_error("reauthorization requested: no valid token available");
                self.deps.bus.publish(ProxyEvent::OAuthRequired {
                    server: self.config.name.clone(),
                });
                self.deps.bus.publish(ProxyEvent::ServersChanged);
            }
            ActorCommand::Shutdown { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn call_tool(&mut self, tool: &str, args: Option<Value>) -> McpResult<CallToolResult> {
        let Some(client) = self.client.clone() else {
            return Err(McpError::transport(format!(
                "upstream '{}' is not connected ({})",
                self.config.name,
                self.state().label()
            )));
        };

        match client
            .call_tool(tool, args, self.deps.tools.call_timeout)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) if e.is_auth_error() => {
                self.defer_to_oauth(&e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    // === connection sequence ===

    async fn establish(&mut self) {
        match self.config.effective_protocol() {
            Protocol::Stdio => self.establish_stdio().await,
            _ => self.establish_http().await,
        }
    }

    /// stdio: initializing -> launching -> waiting_ready -> connecting ->
    /// connected, with exit codes mapped onto error leaves
    async fn establish_stdio(&mut self) {
        // Unresolvable secrets never spawn; the leaf is sticky until the
        // user fixes the config.
        let missing = self.config.missing_secrets();
        if !missing.is_empty() {
            self.record_error(format!("missing secret: {}", missing.join(", ")));
            self.apply(StateEvent::Start);
            self.apply(StateEvent::ConfigError);
            return;
        }

        if self.apply(StateEvent::Start).is_none() {
            return;
        }

        let policy = RetryPolicy::for_state(ConnectionState::WaitingReady);
        for attempt in 1..=policy.max_attempts {
            if self.shutting_down() {
                return;
            }

            let spec = self.stdio_spec();
            debug!(
                server = %self.config.name,
                attempt,
                env = ?masked_env(&self.config.env),
                "launching stdio child"
            );

            let transport = match build_stdio(spec) {
                Ok(transport) => transport,
                Err(e) => {
                    self.record_error(e.to_string());
                    self.apply(StateEvent::ConfigError);
                    return;
                }
            };

            if let Err(e) = transport.connect().await {
                self.record_error(e.to_string());
                self.apply(StateEvent::GeneralError);
                return;
            }

            // stderr is piped from the moment of spawn; attach capture
            // before the handshake so early output lands in the ring
            if let Some(stderr) = transport.take_stderr().await {
                self.capture = Some(capture_stderr(&self.config.name, stderr, self.ring.clone()));
            }

            if self.apply(StateEvent::CoreStarted).is_none() {
                return;
            }

            let dyn_transport: Arc<dyn McpTransport> = transport.clone();
            let (client, events) =
                UpstreamClient::new(dyn_transport, self.deps.tools.call_timeout);

            match tokio::time::timeout(policy.timeout, client.start()).await {
                Ok(Ok(init)) => {
                    if self.apply(StateEvent::CoreReady).is_none() {
                        return;
                    }
                    if !init.capabilities.advertises_list_changed() {
                        debug!(server = %self.config.name, "upstream does not advertise tools.listChanged");
                    }
                    self.stdio = Some(transport);
                    self.finish_connect(Arc::new(client), events).await;
                    return;
                }
                Ok(Err(e)) => {
                    if e.is_auth_error() {
                        let _ = client.close().await;
                        self.defer_to_oauth(&e);
                        return;
                    }
                    self.record_error(e.to_string());
                    if let Some(code) = transport.exit_code().await {
                        // Exit during startup: retry into launching, then
                        // land on the mapped leaf
                        self.apply(StateEvent::Retry);
                        if let Some(event) = event_for_exit_code(code) {
                            let _ = client.close().await;
                            self.record_error(format!("child exited with code {}", code));
                            self.apply(event);
                            return;
                        }
                    }
                }
                Err(_) => {
                    self.record_error(format!(
                        "upstream not ready within {} s",
                        policy.timeout.as_secs()
                    ));
                }
            }

            // Failed attempt: stop the pump and terminate the child
            let _ = client.close().await;
            let _ = client_cleanup(&mut self.stdio, &mut self.capture).await;

            if attempt < policy.max_attempts {
                // retry loops back through launching; the next iteration
                // spawns again and re-applies core_started
                self.apply(StateEvent::Retry);
                tokio::time::sleep(policy.delay).await;
            }
        }

        self.apply(StateEvent::Timeout);
    }

    /// HTTP family: initializing -> connecting -> connected, with the
    /// connecting and reconnecting budgets from the retry policy
    async fn establish_http(&mut self) {
        if self.apply(StateEvent::SkipCore).is_none() {
            return;
        }

        let policy = RetryPolicy::for_state(ConnectionState::Connecting);
        for attempt in 1..=policy.max_attempts {
            if self.shutting_down() {
                return;
            }

            match self.try_connect_http(policy.timeout).await {
                Ok(()) => return,
                Err(e) if e.is_auth_error() => {
                    self.defer_to_oauth(&e);
                    return;
                }
                Err(e) => {
                    debug!(server = %self.config.name, attempt, error = %e, "connect attempt failed");
                    self.record_error(e.to_string());
                }
            }

            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }

        if self.apply(StateEvent::ConnectionLost).is_some() {
            self.reconnect_loop().await;
        }
    }

    /// One HTTP connect + handshake + discovery
    async fn try_connect_http(&mut self, timeout: Duration) -> McpResult<()> {
        let spec = self.http_spec();
        let transport = spec.build()?;
        let transport: Arc<dyn McpTransport> = Arc::from(transport);
        let (client, events) = UpstreamClient::new(transport, self.deps.tools.call_timeout);

        match tokio::time::timeout(timeout, client.start()).await {
            Ok(Ok(init)) => {
                if !init.capabilities.advertises_list_changed() {
                    debug!(server = %self.config.name, "upstream does not advertise tools.listChanged");
                }
                self.finish_connect(Arc::new(client), events).await;
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = client.close().await;
                Err(e)
            }
            Err(_) => {
                let _ = client.close().await;
                Err(McpError::timeout(timeout))
            }
        }
    }

    /// Commit a successful connection: discovery, registry, events
    async fn finish_connect(
        &mut self,
        client: Arc<UpstreamClient>,
        events: mpsc::Receiver<ClientEvent>,
    ) {
        self.client = Some(client.clone());
        self.client_events = Some(events);
        self.clear_error();
        self.apply(StateEvent::Connected);
        info!(server = %self.config.name, "upstream connected");

        // Initial discovery inline so tool_count is right when the
        // connected event lands
        match tokio::time::timeout(self.deps.tools.discovery_timeout, client.list_tools()).await {
            Ok(Ok(tools)) => {
                let count = tools.len();
                self.deps.registry.update_server(&self.config.name, tools);
                self.deps.bus.publish(ProxyEvent::ToolsChanged {
                    server: self.config.name.clone(),
                    tool_count: count,
                });
            }
            Ok(Err(e)) => {
                warn!(server = %self.config.name, error = %e, "initial tool discovery failed");
            }
            Err(_) => {
                warn!(server = %self.config.name, "initial tool discovery timed out");
            }
        }
    }

    /// The reconnecting budget: 10 attempts at 5 s, pausing while an
    /// OAuth flow is active for this server (the flow's outcome wins)
    async fn reconnect_loop(&mut self) {
        let policy = RetryPolicy::for_state(ConnectionState::Reconnecting);
        let mut attempt = 0;

        while attempt < policy.max_attempts {
            if self.shutting_down() {
                return;
            }

            if self.deps.coordinator.active_flow(&self.config.name).is_some() {
                debug!(server = %self.config.name, "OAuth flow active, pausing reconnect");
                tokio::time::sleep(policy.delay).await;
                continue;
            }

            attempt += 1;
            tokio::time::sleep(policy.delay).await;

            let result = match self.config.effective_protocol() {
                Protocol::Stdio => {
                    // child gone: relaunch through the launching path
                    if self.apply(StateEvent::CoreExited).is_some() {
                        self.relaunch_stdio(policy.timeout).await
                    } else {
                        return;
                    }
                }
                _ => self.try_connect_http(policy.timeout).await,
            };

            match result {
                Ok(()) => return,
                Err(e) if e.is_auth_error() => {
                    self.defer_to_oauth(&e);
                    return;
                }
                Err(e) => {
                    debug!(server = %self.config.name, attempt, error = %e, "reconnect attempt failed");
                    self.record_error(e.to_string());
                    // a relaunch failure may have parked us in an error leaf
                    if self.state().is_error() {
                        return;
                    }
                    // stdio relaunch path returns through launching; go
                    // back to reconnecting for the next attempt
                    if self.state() == ConnectionState::Launching
                        || self.state() == ConnectionState::WaitingReady
                    {
                        self.apply(StateEvent::Timeout);
                        return;
                    }
                }
            }
        }

        self.record_error("reconnect attempts exhausted");
        self.apply(StateEvent::RetriesExhausted);
    }

    /// One stdio relaunch out of the reconnecting state
    async fn relaunch_stdio(&mut self, timeout: Duration) -> McpResult<()> {
        let spec = self.stdio_spec();
        let transport = build_stdio(spec)?;
        transport.connect().await?;

        if let Some(stderr) = transport.take_stderr().await {
            self.capture = Some(capture_stderr(&self.config.name, stderr, self.ring.clone()));
        }
        self.apply(StateEvent::CoreStarted);

        let dyn_transport: Arc<dyn McpTransport> = transport.clone();
        let (client, events) = UpstreamClient::new(dyn_transport, self.deps.tools.call_timeout);

        match tokio::time::timeout(timeout, client.start()).await {
            Ok(Ok(_)) => {
                self.apply(StateEvent::CoreReady);
                self.stdio = Some(transport);
                self.finish_connect(Arc::new(client), events).await;
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = client.close().await;
                if let Some(code) = transport.exit_code().await {
                    if let Some(event) = event_for_exit_code(code) {
                        self.record_error(format!("child exited with code {}", code));
                        // error leaves hang off launching, so step back first
                        self.apply(StateEvent::Retry);
                        self.apply(event);
                    }
                }
                Err(e)
            }
            Err(_) => {
                let _ = client.close().await;
                Err(McpError::timeout(timeout))
            }
        }
    }

    // === client events ===

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Notification(note) if note.method == TOOLS_LIST_CHANGED => {
                self.on_tools_list_changed().await;
            }
            ClientEvent::Notification(note) => {
                debug!(server = %self.config.name, method = %note.method, "upstream notification");
            }
            ClientEvent::Disconnected { reason } => {
                if self.shutting_down() {
                    return;
                }
                warn!(server = %self.config.name, reason = %reason, "upstream connection lost");
                self.record_error(reason);
                if let Some(client) = self.client.take() {
                    let _ = client.close().await;
                }
                self.client_events = None;

                if self.apply(StateEvent::ConnectionLost).is_some() {
                    // A stdio child that died with a mapped exit code goes
                    // straight to its error leaf instead of retry churn
                    if let Some(stdio) = self.stdio.clone() {
                        if let Some(code) = stdio.exit_code().await {
                            if code != 0 {
                                if self.apply(StateEvent::CoreExited).is_some() {
                                    if let Some(event) = event_for_exit_code(code) {
                                        self.record_error(format!(
                                            "child exited with code {}",
                                            code
                                        ));
                                        self.apply(event);
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    self.reconnect_loop().await;
                }
            }
        }
    }

    /// Debounced re-discovery on `tools/list_changed`. The in-progress
    /// set is the whole debounce: a second notification while discovery
    /// runs is dropped.
    async fn on_tools_list_changed(&mut self) {
        let advertised = match &self.client {
            Some(client) => client
                .capabilities()
                .await
                .map(|caps| caps.advertises_list_changed())
                .unwrap_or(false),
            None => return,
        };
        if !advertised {
            warn!(
                server = %self.config.name,
                "tools/list_changed from a server that did not advertise it; processing anyway"
            );
        }

        {
            let mut inflight = self
                .deps
                .discovery_inflight
                .lock()
                .expect("inflight poisoned");
            if !inflight.insert(self.config.name.clone()) {
                debug!(server = %self.config.name, "discovery already in progress, dropping notification");
                return;
            }
        }

        let Some(client) = self.client.clone() else {
            self.deps
                .discovery_inflight
                .lock()
                .expect("inflight poisoned")
                .remove(&self.config.name);
            return;
        };
        let registry = self.deps.registry.clone();
        let bus = self.deps.bus.clone();
        let inflight = self.deps.discovery_inflight.clone();
        let server = self.config.name.clone();

        // Async so the actor keeps serving commands; failures are logged,
        // never fatal to the actor
        tokio::spawn(async move {
            let result = tokio::time::timeout(DISCOVERY_TIMEOUT, client.list_tools()).await;
            match result {
                Ok(Ok(tools)) => {
                    let count = tools.len();
                    registry.update_server(&server, tools);
                    // tools.changed only after the index committed
                    bus.publish(ProxyEvent::ToolsChanged {
                        server: server.clone(),
                        tool_count: count,
                    });
                    info!(server = %server, tools = count, "re-discovery complete");
                }
                Ok(Err(e)) => {
                    warn!(server = %server, error = %e, "re-discovery failed");
                }
                Err(_) => {
                    warn!(server = %server, "re-discovery timed out");
                }
            }
            inflight.lock().expect("inflight poisoned").remove(&server);
        });
    }

    /// An OAuth-signalling failure: hand over to the OAuth subsystem.
    /// The actor never opens browsers or serves callbacks itself.
    fn defer_to_oauth(&self, error: &McpError) {
        info!(server = %self.config.name, error = %error, "authorization required, deferring to OAuth subsystem");
        self.record_error(error.to_string());
        self.deps.bus.publish(ProxyEvent::OAuthRequired {
            server: self.config.name.clone(),
        });
        self.deps.bus.publish(ProxyEvent::ServersChanged);
    }

    // === teardown ===

    async fn teardown(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.close().await;
        }
        self.client_events = None;
        let _ = client_cleanup(&mut self.stdio, &mut self.capture).await;
        self.deps.registry.remove_server(&self.config.name);
    }

    // === transport construction ===

    fn stdio_spec(&self) -> TransportSpec {
        TransportSpec::Stdio {
            command: self.config.command.clone().unwrap_or_default(),
            args: self.config.args.clone(),
            env: resolve_env(&self.config.env),
            working_dir: self.config.working_dir.clone(),
        }
    }

    fn http_spec(&self) -> TransportSpec {
        let url = self.config.url.clone().unwrap_or_default();
        let mut headers = self.config.headers.clone();
        if let Some(auth) = self
            .deps
            .auth_headers
            .read()
            .expect("auth headers poisoned")
            .get(&self.config.name)
        {
            headers.insert("Authorization".to_string(), auth.clone());
        }

        match self.config.effective_protocol() {
            Protocol::Http => TransportSpec::Http { url, headers },
            Protocol::Sse => TransportSpec::Sse { url, headers },
            _ => TransportSpec::StreamableHttp { url, headers },
        }
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<ClientEvent>>) -> Option<ClientEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn build_stdio(spec: TransportSpec) -> McpResult<Arc<StdioTransport>> {
    spec.validate()?;
    match spec {
        TransportSpec::Stdio {
            command,
            args,
            env,
            working_dir,
        } => Ok(Arc::new(StdioTransport::new(command, args, env, working_dir))),
        _ => Err(McpError::Configuration {
            message: "not a stdio spec".to_string(),
        }),
    }
}

async fn client_cleanup(
    stdio: &mut Option<Arc<StdioTransport>>,
    capture: &mut Option<JoinHandle<()>>,
) -> McpResult<()> {
    if let Some(transport) = stdio.take() {
        transport.close().await?;
    }
    if let Some(task) = capture.take() {
        task.abort();
    }
    Ok(())
}

/// Resolve `${env:NAME}` references against the daemon's environment.
/// Unresolvable references were rejected before spawn; stragglers pass
/// through verbatim.
fn resolve_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let resolved = match mcpproxy_config::domains::upstream::parse_env_reference(value) {
                Some(name) => std::env::var(&name).unwrap_or_else(|_| value.clone()),
                None => value.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_config::OAuthSettings;

    fn deps() -> ActorDeps {
        let settings = OAuthSettings::default();
        ActorDeps {
            bus: EventBus::new(),
            registry: Arc::new(ToolRegistry::new()),
            coordinator: Arc::new(FlowCoordinator::new(
                settings.flow_timeout,
                settings.browser_rate_window,
            )),
            discovery_inflight: Arc::new(Mutex::new(HashSet::new())),
            tools: ToolsConfig::default(),
            auth_headers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_lands_in_error_state() {
        let config = UpstreamConfig {
            quarantined: false,
            ..UpstreamConfig::new_stdio("bad", "definitely-not-a-command-xyz", vec![])
        };
        let handle = ActorHandle::spawn(config, deps());

        // give the actor a moment to run its connect sequence
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = handle.status();
        assert!(status.state.is_error());
        assert!(status.last_error.is_some());

        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_missing_secret_is_sticky_config_error() {
        let mut config = UpstreamConfig::new_stdio("s", "cat", vec![]);
        config.quarantined = false;
        config
            .env
            .insert("TOKEN".into(), "${env:MCPPROXY_SURELY_UNSET_VAR}".into());

        let handle = ActorHandle::spawn(config, deps());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = handle.status();
        assert_eq!(status.state, ConnectionState::ErrorConfig);
        assert!(status.last_error.unwrap().contains("MCPPROXY_SURELY_UNSET_VAR"));

        // non-shutdown commands do not move a sticky error state
        let err = handle.call_tool("x", None).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.status().state, ConnectionState::ErrorConfig);

        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_quarantined_actor_does_not_connect() {
        let config = UpstreamConfig::new_stdio("q", "cat", vec![]);
        assert!(config.quarantined);
        let handle = ActorHandle::spawn(config, deps());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(handle.status().state, ConnectionState::Initializing);
        let err = handle.call_tool("x", None).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));

        handle.shutdown(Duration::from_secs(5)).await;
    }

    #[test]
    fn test_env_resolution() {
        std::env::set_var("MCPPROXY_TEST_RESOLVE_VAR", "resolved-value");
        let env = HashMap::from([
            ("A".to_string(), "${env:MCPPROXY_TEST_RESOLVE_VAR}".to_string()),
            ("B".to_string(), "literal".to_string()),
        ]);
        let resolved = resolve_env(&env);
        std::env::remove_var("MCPPROXY_TEST_RESOLVE_VAR");

        assert_eq!(resolved["A"], "resolved-value");
        assert_eq!(resolved["B"], "literal");
    }
}
