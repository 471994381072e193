//! Application context: the dependencies every handler shares

use std::sync::Arc;

use mcpproxy_config::{DaemonConfig, ProxyConfig, ToolsConfig};
use mcpproxy_events::EventBus;
use mcpproxy_index::{ResponseCache, ToolRegistry};
use mcpproxy_oauth::{OAuthFlowManager, RefreshManager, TokenStore};
use mcpproxy_storage::ProxyStore;
use mcpproxy_supervisor::Supervisor;
use metrics_exporter_prometheus::PrometheusHandle;

/// Everything the routes need, cheaply cloneable
#[derive(Clone)]
pub struct AppContext {
    pub supervisor: Arc<Supervisor>,
    pub registry: Arc<ToolRegistry>,
    pub cache: Arc<ResponseCache>,
    pub bus: EventBus,
    pub store: ProxyStore,
    pub tokens: TokenStore,
    pub flows: Arc<OAuthFlowManager>,
    pub refresh: Arc<RefreshManager>,
    pub daemon: DaemonConfig,
    pub tools: ToolsConfig,

    /// Rendered by `GET /metrics`
    pub metrics: PrometheusHandle,

    /// Last update-checker result, when a checker ran
    pub update: Option<crate::models::UpdateInfo>,
}

impl AppContext {
    /// Effective API key: environment overrides configuration
    pub fn api_key(&self) -> Option<String> {
        std::env::var("MCPPROXY_API_KEY")
            .ok()
            .or_else(|| self.daemon.api_key.clone())
    }

    /// Build a context from a loaded configuration and its already-wired
    /// core services
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ProxyConfig,
        supervisor: Arc<Supervisor>,
        registry: Arc<ToolRegistry>,
        cache: Arc<ResponseCache>,
        bus: EventBus,
        store: ProxyStore,
        tokens: TokenStore,
        flows: Arc<OAuthFlowManager>,
        refresh: Arc<RefreshManager>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            supervisor,
            registry,
            cache,
            bus,
            store,
            tokens,
            flows,
            refresh,
            daemon: config.daemon.clone(),
            tools: config.tools.clone(),
            metrics,
            update: None,
        }
    }
}
