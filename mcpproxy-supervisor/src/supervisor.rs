//! The supervisor: owner of every upstream actor
//!
//! The name-to-actor map lives here and nowhere else. All mutation paths
//! (REST, MCP tool, CLI) funnel through these methods, which persist
//! through the storage layer, keep the tool registry in sync and publish
//! `servers.changed` after every successful mutation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use mcpproxy_config::{merge::smart_merge, ConfigDiff, ToolsConfig, UpstreamConfig};
use mcpproxy_events::{EventBus, ProxyEvent};
use mcpproxy_health::{calculate_health, HealthInput, HealthStatus, RefreshState};
use mcpproxy_index::{IndexError, ToolRegistry};
use mcpproxy_mcp::{CallToolResult, McpError};
use mcpproxy_oauth::{FlowCoordinator, RefreshManager, TokenStore};
use mcpproxy_storage::{
    ActivityEntry, ActivityKind, ActivitySource, ActivityStatus, ProxyStore,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};

use crate::actor::{ActorDeps, ActorHandle};
use crate::error::{SupervisorError, SupervisorResult};

/// Grace window actors get to wind down at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// JSON view of one server, serialized identically across REST, MCP and
/// CLI surfaces
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerView {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    pub protocol: String,
    pub enabled: bool,
    pub quarantined: bool,
    pub connected: bool,
    pub connecting: bool,
    pub tool_count: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<chrono::DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_logged_out: Option<bool>,

    pub health: HealthStatus,
}

/// The supervisor
pub struct Supervisor {
    actors: AsyncRwLock<HashMap<String, ActorHandle>>,
    configs: RwLock<HashMap<String, UpstreamConfig>>,

    store: ProxyStore,
    registry: Arc<ToolRegistry>,
    bus: EventBus,
    tokens: TokenStore,
    refresh: Arc<RefreshManager>,
    coordinator: Arc<FlowCoordinator>,
    tools_config: ToolsConfig,
    activity_retention: usize,

    /// Writes the authoritative config file; invoked before
    /// `servers.changed` is published so subscribers always observe the
    /// write as already durable
    config_sink: RwLock<Option<ConfigSink>>,

    deps: ActorDeps,
}

type ConfigSink = Box<dyn Fn(Vec<UpstreamConfig>) + Send + Sync>;

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ProxyStore,
        registry: Arc<ToolRegistry>,
        bus: EventBus,
        tokens: TokenStore,
        refresh: Arc<RefreshManager>,
        coordinator: Arc<FlowCoordinator>,
        tools_config: ToolsConfig,
        activity_retention: usize,
    ) -> Arc<Self> {
        let deps = ActorDeps {
            bus: bus.clone(),
            registry: registry.clone(),
            coordinator: coordinator.clone(),
            discovery_inflight: Arc::new(Mutex::new(HashSet::new())),
            tools: tools_config.clone(),
            auth_headers: Arc::new(RwLock::new(HashMap::new())),
        };

        Arc::new(Self {
            actors: AsyncRwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            store,
            registry,
            bus,
            tokens,
            refresh,
            coordinator,
            tools_config,
            activity_retention,
            config_sink: RwLock::new(None),
            deps,
        })
    }

    /// Install the config-file writer invoked before every
    /// `servers.changed` publication
    pub fn set_config_sink(&self, sink: impl Fn(Vec<UpstreamConfig>) + Send + Sync + 'static) {
        *self.config_sink.write().expect("sink poisoned") = Some(Box::new(sink));
    }

    /// Persist the current upstream set through the sink, then announce
    /// the change
    fn commit_and_announce(&self) {
        let upstreams: Vec<UpstreamConfig> = {
            let configs = self.configs.read().expect("configs poisoned");
            let mut list: Vec<UpstreamConfig> = configs.values().cloned().collect();
            list.sort_by(|a, b| a.name.cmp(&b.name));
            list
        };
        if let Some(sink) = self.config_sink.read().expect("sink poisoned").as_ref() {
            sink(upstreams);
        }
        self.bus.publish(ProxyEvent::ServersChanged);
    }

    /// Bring the supervisor in line with the given upstream set (initial
    /// load and config hot-reload)
    pub async fn sync(&self, upstreams: Vec<UpstreamConfig>) {
        let desired: HashMap<String, UpstreamConfig> = upstreams
            .into_iter()
            .map(|u| (u.name.clone(), u))
            .collect();

        // shut down actors whose config is gone or materially changed
        let mut to_respawn = Vec::new();
        {
            let mut actors = self.actors.write().await;
            let current: Vec<String> = actors.keys().cloned().collect();
            for name in current {
                let keep = matches!(desired.get(&name), Some(new_config) if {
                    let configs = self.configs.read().expect("configs poisoned");
                    configs.get(&name) == Some(new_config)
                });
                if !keep {
                    if let Some(handle) = actors.remove(&name) {
                        handle.shutdown(SHUTDOWN_GRACE).await;
                    }
                    self.registry.remove_server(&name);
                }
            }
            for (name, config) in &desired {
                if !actors.contains_key(name) {
                    to_respawn.push((name.clone(), config.clone()));
                }
            }
        }

        *self.configs.write().expect("configs poisoned") = desired;

        for (name, config) in to_respawn {
            if let Err(e) = self.store.put_upstream(&config) {
                warn!(server = %name, error = %e, "failed to persist upstream");
            }
            self.update_auth_header(&name);
            self.spawn_actor(config).await;
        }
    }

    async fn spawn_actor(&self, config: UpstreamConfig) {
        let name = config.name.clone();
        let handle = ActorHandle::spawn(config, self.deps.clone());
        self.actors.write().await.insert(name, handle);
    }

    /// Add a new server. Fails on duplicate names; the server starts
    /// quarantined unless the config says otherwise.
    pub async fn add_server(
        &self,
        config: UpstreamConfig,
        source: ActivitySource,
    ) -> SupervisorResult<()> {
        use mcpproxy_config::validation::Validatable;
        config.validate()?;

        {
            let configs = self.configs.read().expect("configs poisoned");
            if configs.contains_key(&config.name) {
                return Err(SupervisorError::AlreadyExists {
                    name: config.name.clone(),
                });
            }
        }

        self.store.put_upstream(&config)?;
        self.configs
            .write()
            .expect("configs poisoned")
            .insert(config.name.clone(), config.clone());

        self.log_activity(
            ActivityKind::ServerChange,
            source,
            Some(&config.name),
            json!({ "op": "add", "protocol": config.effective_protocol().as_str() }),
            ActivityStatus::Success,
        );

        info!(server = %config.name, quarantined = config.quarantined, "server added");
        self.spawn_actor(config).await;
        self.commit_and_announce();
        Ok(())
    }

    /// Remove a server entirely: actor, storage record, token, schedule
    pub async fn remove_server(
        &self,
        name: &str,
        source: ActivitySource,
    ) -> SupervisorResult<()> {
        let existed = self
            .configs
            .write()
            .expect("configs poisoned")
            .remove(name)
            .is_some();
        if !existed {
            return Err(self.not_found(name));
        }

        if let Some(handle) = self.actors.write().await.remove(name) {
            handle.shutdown(SHUTDOWN_GRACE).await;
        }
        self.registry.remove_server(name);
        self.store.delete_upstream(name)?;
        self.tokens.delete(name)?;
        self.refresh.forget(name);

        self.log_activity(
            ActivityKind::ServerChange,
            source,
            Some(name),
            json!({ "op": "remove" }),
            ActivityStatus::Success,
        );

        info!(server = %name, "server removed");
        self.commit_and_announce();
        Ok(())
    }

    /// Smart-merge patch. The merged config is persisted in one write and
    /// the actor restarted to pick it up.
    pub async fn patch_server(
        &self,
        name: &str,
        patch: &Value,
        source: ActivitySource,
    ) -> SupervisorResult<ConfigDiff> {
        let current = {
            let configs = self.configs.read().expect("configs poisoned");
            configs.get(name).cloned().ok_or_else(|| self.not_found(name))?
        };

        let quarantined_before = current.quarantined;
        let (merged, diff) = smart_merge(&current, patch)?;

        self.store.put_upstream(&merged)?;
        self.configs
            .write()
            .expect("configs poisoned")
            .insert(name.to_string(), merged.clone());

        if quarantined_before != merged.quarantined {
            self.log_activity(
                ActivityKind::QuarantineChange,
                source,
                Some(name),
                json!({ "quarantined": merged.quarantined }),
                ActivityStatus::Success,
            );
        }
        self.log_activity(
            ActivityKind::ServerChange,
            source,
            Some(name),
            serde_json::to_value(&diff).unwrap_or_default(),
            ActivityStatus::Success,
        );

        // restart the actor so transport-level changes take effect
        if let Some(handle) = self.actors.write().await.remove(name) {
            handle.shutdown(SHUTDOWN_GRACE).await;
        }
        self.update_auth_header(name);
        self.spawn_actor(merged).await;

        self.commit_and_announce();
        Ok(diff)
    }

    /// Convenience wrappers over patch for the admin verbs
    pub async fn set_enabled(&self, name: &str, enabled: bool, source: ActivitySource) -> SupervisorResult<ConfigDiff> {
        self.patch_server(name, &json!({ "enabled": enabled }), source).await
    }

    pub async fn set_quarantined(&self, name: &str, quarantined: bool, source: ActivitySource) -> SupervisorResult<ConfigDiff> {
        self.patch_server(name, &json!({ "quarantined": quarantined }), source).await
    }

    /// Tear the actor down and spawn it fresh from the stored config
    pub async fn restart_server(&self, name: &str) -> SupervisorResult<()> {
        let config = {
            let configs = self.configs.read().expect("configs poisoned");
            configs.get(name).cloned().ok_or_else(|| self.not_found(name))?
        };

        if let Some(handle) = self.actors.write().await.remove(name) {
            handle.shutdown(SHUTDOWN_GRACE).await;
        }
        self.update_auth_header(name);
        self.spawn_actor(config).await;
        self.bus.publish(ProxyEvent::ServersChanged);
        Ok(())
    }

    /// Route a (possibly qualified) tool call to its actor. Quarantined
    /// and disabled servers never service calls.
    pub async fn call_tool(
        &self,
        reference: &str,
        args: Option<Value>,
    ) -> SupervisorResult<CallToolResult> {
        let (server, tool) = self.registry.resolve(reference)?;

        {
            let configs = self.configs.read().expect("configs poisoned");
            let config = configs.get(&server).ok_or_else(|| self.not_found(&server))?;
            if config.quarantined {
                return Err(SupervisorError::Quarantined { name: server });
            }
            if !config.enabled {
                return Err(SupervisorError::Disabled { name: server });
            }
        }

        // Queue the call without holding the map lock across the await
        let sender = {
            let actors = self.actors.read().await;
            actors
                .get(&server)
                .ok_or_else(|| self.not_found(&server))?
                .command_sender()
        };

        let (reply, rx) = tokio::sync::oneshot::channel();
        sender
            .send(crate::actor::ActorCommand::CallTool {
                tool,
                args,
                reply,
            })
            .await
            .map_err(|_| SupervisorError::Upstream(McpError::Cancelled {
                reason: "actor gone".to_string(),
            }))?;
        let result = rx.await.map_err(|_| {
            SupervisorError::Upstream(McpError::Cancelled {
                reason: "actor dropped the request".to_string(),
            })
        })?;
        Ok(result?)
    }

    /// Captured child output for `upstream logs`
    pub async fn server_logs(&self, name: &str, limit: usize) -> SupervisorResult<Vec<String>> {
        let actors = self.actors.read().await;
        let handle = actors.get(name).ok_or_else(|| self.not_found(name))?;
        Ok(handle.logs(limit))
    }

    /// Ask an actor to surface a reauthorization request
    pub async fn force_reauth(&self, name: &str) -> SupervisorResult<()> {
        let actors = self.actors.read().await;
        let handle = actors.get(name).ok_or_else(|| self.not_found(name))?;
        handle.force_reauth().await;
        Ok(())
    }

    /// Stored config for one server
    pub fn config(&self, name: &str) -> Option<UpstreamConfig> {
        self.configs.read().expect("configs poisoned").get(name).cloned()
    }

    /// All configured server names
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs
            .read()
            .expect("configs poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The unified view of one server
    pub async fn server_view(&self, name: &str) -> SupervisorResult<ServerView> {
        let config = self.config(name).ok_or_else(|| self.not_found(name))?;
        let actors = self.actors.read().await;
        let status = actors.get(name).map(|h| h.status());
        drop(actors);

        let tool_count = self.registry.tool_count(name);
        let refresh = self.refresh.snapshot(name);
        let token = self.tokens.get(name).ok().flatten();

        let missing = config.missing_secrets();
        let input = HealthInput {
            enabled: config.enabled,
            quarantined: config.quarantined,
            connection_label: status
                .as_ref()
                .map(|s| s.state.label().to_string())
                .unwrap_or_else(|| "initializing".to_string()),
            connection_in_error: status.as_ref().is_some_and(|s| s.state.is_error()),
            connected: status.as_ref().is_some_and(|s| s.connected),
            last_error: status.as_ref().and_then(|s| s.last_error.clone()),
            tool_count,
            missing_secret: missing.first().cloned(),
            oauth_config_error: oauth_config_error(&config),
            refresh_state: refresh.as_ref().map(|r| r.state).unwrap_or(RefreshState::Idle),
            refresh_retry_count: refresh.as_ref().map(|r| r.retry_count).unwrap_or(0),
            refresh_next_attempt: refresh.as_ref().and_then(|r| r.scheduled_at),
        };
        let health = calculate_health(&input);

        let oauth_configured = config.oauth.is_some() || config.is_http_family();
        let oauth_status = match (&token, refresh.as_ref().map(|r| r.state)) {
            (Some(_), Some(RefreshState::Failed)) => Some("refresh_failed".to_string()),
            (Some(state), _) if state.access_expired => Some("expired".to_string()),
            (Some(_), _) => Some("authenticated".to_string()),
            (None, _) => None,
        };

        Ok(ServerView {
            name: config.name.clone(),
            url: config.url.clone(),
            command: config.command.clone(),
            protocol: config.effective_protocol().as_str().to_string(),
            enabled: config.enabled,
            quarantined: config.quarantined,
            connected: input.connected,
            connecting: status.as_ref().is_some_and(|s| s.connecting),
            tool_count,
            last_error: input.last_error.clone(),
            oauth_status,
            token_expires_at: token.as_ref().map(|t| t.record.expires_at),
            user_logged_out: (config.oauth.is_some() && token.is_none() && oauth_configured)
                .then_some(true),
            health,
        })
    }

    /// Views for every configured server, name-ordered
    pub async fn server_views(&self) -> Vec<ServerView> {
        let mut views = Vec::new();
        for name in self.server_names() {
            if let Ok(view) = self.server_view(&name).await {
                views.push(view);
            }
        }
        views
    }

    /// Load a token's access value into the shared header map the actors
    /// read when building transports
    pub fn update_auth_header(&self, name: &str) {
        let mut headers = self
            .deps
            .auth_headers
            .write()
            .expect("auth headers poisoned");
        match self.tokens.get(name) {
            Ok(Some(state)) if !state.access_expired => {
                headers.insert(
                    name.to_string(),
                    format!("Bearer {}", state.record.access_token),
                );
            }
            _ => {
                headers.remove(name);
            }
        }
    }

    /// Append an activity entry, with response truncation applied
    pub fn log_activity(
        &self,
        kind: ActivityKind,
        source: ActivitySource,
        server: Option<&str>,
        payload: Value,
        status: ActivityStatus,
    ) {
        let mut entry = ActivityEntry {
            id: 0,
            kind,
            source,
            server: server.map(String::from),
            tool: None,
            arguments: Some(payload),
            response: None,
            response_truncated: false,
            status,
            duration_ms: 0,
            timestamp: Utc::now(),
            session_id: None,
            request_id: None,
            token_estimate: None,
        };
        entry.truncate_response(self.tools_config.tool_response_limit);
        match self.store.append_activity(entry, self.activity_retention) {
            Ok(entry) => {
                self.bus.publish(ProxyEvent::Activity {
                    entry: serde_json::to_value(&entry).unwrap_or_default(),
                });
            }
            Err(e) => warn!(error = %e, "failed to append activity entry"),
        }
    }

    /// Shut down every actor within the grace window
    pub async fn shutdown(&self) {
        let mut actors = self.actors.write().await;
        for (_, handle) in actors.drain() {
            handle.shutdown(SHUTDOWN_GRACE).await;
        }
    }

    fn not_found(&self, name: &str) -> SupervisorError {
        SupervisorError::NotFound {
            name: name.to_string(),
            available: self.server_names(),
        }
    }
}

/// Statically detectable OAuth misconfiguration
fn oauth_config_error(config: &UpstreamConfig) -> Option<String> {
    let oauth = config.oauth.as_ref()?;
    if oauth.client_id.as_deref() == Some("") {
        return Some("oauth.client_id is empty".to_string());
    }
    if oauth.client_secret.is_some() && oauth.client_id.is_none() {
        return Some("oauth.client_secret set without oauth.client_id".to_string());
    }
    None
}

/// Routing errors double as validation errors on the REST surface
impl From<IndexError> for SupervisorError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::ToolNotFound { name } => SupervisorError::ToolNotFound { name },
            IndexError::AmbiguousTool { name, servers } => {
                SupervisorError::AmbiguousTool { name, servers }
            }
            IndexError::Storage(e) => SupervisorError::Storage(e),
            IndexError::Compute { message } => {
                SupervisorError::Upstream(McpError::internal(message))
            }
        }
    }
}

impl From<McpError> for SupervisorError {
    fn from(err: McpError) -> Self {
        SupervisorError::Upstream(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_config::OAuthSettings;

    async fn supervisor() -> Arc<Supervisor> {
        let store = ProxyStore::open_temporary().unwrap();
        let tokens = TokenStore::new(store.clone(), Duration::from_secs(60));
        let bus = EventBus::new();
        let settings = OAuthSettings::default();
        let refresh = RefreshManager::new(tokens.clone(), bus.clone(), settings.clone());
        let coordinator = Arc::new(FlowCoordinator::new(
            settings.flow_timeout,
            settings.browser_rate_window,
        ));
        Supervisor::new(
            store,
            Arc::new(ToolRegistry::new()),
            bus,
            tokens,
            refresh,
            coordinator,
            ToolsConfig::default(),
            100,
        )
    }

    #[tokio::test]
    async fn test_add_starts_quarantined_and_unhealthy() {
        let supervisor = supervisor().await;
        let config = UpstreamConfig::new_http("gh", "https://api.github.com/mcp");
        supervisor.add_server(config, ActivitySource::Api).await.unwrap();

        let view = supervisor.server_view("gh").await.unwrap();
        assert!(view.quarantined);
        assert!(view.enabled);
        assert_eq!(view.health.action, mcpproxy_health::HealthAction::Approve);
        assert_eq!(view.health.level, mcpproxy_health::HealthLevel::Unhealthy);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let supervisor = supervisor().await;
        let config = UpstreamConfig::new_http("gh", "https://api.github.com/mcp");
        supervisor.add_server(config.clone(), ActivitySource::Api).await.unwrap();

        let err = supervisor.add_server(config, ActivitySource::Api).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyExists { .. }));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_patch_preserves_isolation() {
        let supervisor = supervisor().await;
        let mut config = UpstreamConfig::new_http("gh", "https://api.github.com/mcp");
        config.isolation = Some(mcpproxy_config::IsolationConfig {
            enabled: true,
            image: Some("python:3.11".into()),
            extra_args: vec!["-v".into(), "/p:/m".into()],
        });
        let isolation_before = config.isolation.clone();
        supervisor.add_server(config, ActivitySource::Api).await.unwrap();

        supervisor
            .patch_server("gh", &json!({"quarantined": false}), ActivitySource::Api)
            .await
            .unwrap();

        let stored = supervisor.config("gh").unwrap();
        assert!(!stored.quarantined);
        assert_eq!(stored.isolation, isolation_before);

        // the persisted record kept every field too
        let persisted = supervisor.store.get_upstream("gh").unwrap();
        assert_eq!(persisted.isolation, isolation_before);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_restores_prior_state() {
        let supervisor = supervisor().await;
        let names_before = supervisor.server_names();

        let config = UpstreamConfig::new_http("tmp", "https://x.example/mcp");
        supervisor.add_server(config, ActivitySource::Cli).await.unwrap();
        supervisor.remove_server("tmp", ActivitySource::Cli).await.unwrap();

        assert_eq!(supervisor.server_names(), names_before);
        assert!(matches!(
            supervisor.remove_server("tmp", ActivitySource::Cli).await,
            Err(SupervisorError::NotFound { .. })
        ));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_quarantined_server_blocks_calls() {
        let supervisor = supervisor().await;
        let config = UpstreamConfig::new_http("gh", "https://api.github.com/mcp");
        supervisor.add_server(config, ActivitySource::Api).await.unwrap();

        // registry has no tools yet: resolution fails first
        let err = supervisor.call_tool("gh.search", None).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ToolNotFound { .. }));

        // with a tool in the registry, quarantine blocks the call
        supervisor.registry.update_server(
            "gh",
            vec![mcpproxy_mcp::Tool {
                name: "search".into(),
                description: String::new(),
                input_schema: json!({}),
                annotations: None,
            }],
        );
        let err = supervisor.call_tool("gh.search", None).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Quarantined { .. }));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_secret_surfaces_in_health() {
        let supervisor = supervisor().await;
        let mut config = UpstreamConfig::new_stdio("s", "cat", vec![]);
        config
            .env
            .insert("TOKEN".into(), "${env:MISSING_TOKEN_XYZ}".into());
        config.quarantined = false;
        supervisor.add_server(config, ActivitySource::Api).await.unwrap();

        let view = supervisor.server_view("s").await.unwrap();
        assert_eq!(view.health.action, mcpproxy_health::HealthAction::SetSecret);
        assert_eq!(view.health.detail.as_deref(), Some("MISSING_TOKEN_XYZ"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_found_carries_available_servers() {
        let supervisor = supervisor().await;
        let config = UpstreamConfig::new_http("gh", "https://api.github.com/mcp");
        supervisor.add_server(config, ActivitySource::Api).await.unwrap();

        match supervisor.server_view("nope").await.unwrap_err() {
            SupervisorError::NotFound { available, .. } => {
                assert_eq!(available, vec!["gh".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }
        supervisor.shutdown().await;
    }
}
