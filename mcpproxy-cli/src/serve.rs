//! The daemon composition root
//!
//! Wires storage, event bus, registry, cache, OAuth subsystem and
//! supervisor together, starts the config watcher and runs the
//! control-plane server until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mcpproxy_config::{loader, ConfigLoader, ConfigWatcher, ProxyConfig};
use mcpproxy_events::{EventBus, ProxyEvent};
use mcpproxy_index::{ResponseCache, ToolRegistry};
use mcpproxy_oauth::{FlowCoordinator, OAuthFlowManager, RefreshManager, TokenStore};
use mcpproxy_server::AppContext;
use mcpproxy_storage::ProxyStore;
use mcpproxy_supervisor::Supervisor;

pub async fn run(
    listen: Option<String>,
    log_level: Option<String>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let loader_ = ConfigLoader::new();
    let mut config = loader_
        .load(config_path.as_ref())
        .context("failed to load configuration")?;

    if let Some(listen) = listen {
        config.daemon.listen = listen;
    }
    if let Some(level) = log_level {
        config.logging.level = level;
    }

    // Console plus rotating file output; the guard must outlive the server
    let _log_guard = init_logging(&config)?;

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

    let db_path = loader::default_db_path();
    let store = ProxyStore::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    let bus = EventBus::new();
    let registry = Arc::new(ToolRegistry::new());
    let cache = Arc::new(ResponseCache::new(
        config.tools.response_cache_capacity,
        Some(store.clone()),
    ));
    let tokens = TokenStore::new(store.clone(), config.oauth.token_grace);
    let refresh = RefreshManager::new(tokens.clone(), bus.clone(), config.oauth.clone());
    let coordinator = Arc::new(FlowCoordinator::new(
        config.oauth.flow_timeout,
        config.oauth.browser_rate_window,
    ));
    let flows = Arc::new(OAuthFlowManager::new(
        config.oauth.clone(),
        tokens.clone(),
        coordinator.clone(),
        refresh.clone(),
        bus.clone(),
    ));

    let supervisor = Supervisor::new(
        store.clone(),
        registry.clone(),
        bus.clone(),
        tokens.clone(),
        refresh.clone(),
        coordinator.clone(),
        config.tools.clone(),
        config.daemon.activity_retention,
    );

    // Mutations flow back into the config file before servers.changed
    let file_path = config_path.clone().unwrap_or_else(loader::default_config_path);
    {
        let base = config.clone();
        let file_path = file_path.clone();
        supervisor.set_config_sink(move |upstreams| {
            let mut snapshot = base.clone();
            snapshot.upstreams = upstreams;
            if let Err(e) = loader::save_config(&snapshot, &file_path) {
                warn!(error = %e, "failed to persist config file");
            }
        });
    }

    refresh.start();
    supervisor.sync(config.upstreams.clone()).await;

    // Refreshed tokens feed the actors' Authorization headers; a server
    // that was down for lack of credentials gets its connection retried
    {
        let supervisor = supervisor.clone();
        let mut sub = bus.subscribe();
        tokio::spawn(async move {
            while let Some(envelope) = sub.recv().await {
                if let ProxyEvent::TokenRefreshed { server } = &envelope.event {
                    supervisor.update_auth_header(server);
                    let reconnect = match supervisor.server_view(server).await {
                        Ok(view) => !view.connected,
                        Err(_) => false,
                    };
                    if reconnect {
                        if let Err(e) = supervisor.restart_server(server).await {
                            warn!(server = %server, error = %e, "post-token reconnect failed");
                        }
                    }
                }
            }
        });
    }

    // Hot reload: the watcher delivers validated configs only
    if file_path.exists() {
        match ConfigWatcher::start(&file_path) {
            Ok(mut watcher) => {
                let supervisor = supervisor.clone();
                let bus = bus.clone();
                tokio::spawn(async move {
                    while let Some(new_config) = watcher.next().await {
                        info!("config file changed, reloading");
                        supervisor.sync(new_config.upstreams).await;
                        bus.publish(ProxyEvent::ConfigReloaded);
                    }
                });
            }
            Err(e) => warn!(error = %e, "config watching disabled"),
        }
    }

    let ctx = AppContext::new(
        &config,
        supervisor.clone(),
        registry,
        cache,
        bus,
        store.clone(),
        tokens,
        flows,
        refresh,
        metrics_handle,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.daemon.listen,
        config = %file_path.display(),
        "mcpproxy starting"
    );

    mcpproxy_server::serve(ctx, shutdown_signal()).await?;

    info!("shutting down");
    supervisor.shutdown().await;
    store.flush().ok();
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Console logging plus daily-rotating files in the platform log dir
fn init_logging(
    config: &ProxyConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.file_enabled {
        let dir = config.logging.log_directory();
        std::fs::create_dir_all(&dir).ok();
        let appender = tracing_appender::rolling::daily(&dir, "mcpproxy.log");
        let (file_writer, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        Ok(None)
    }
}
