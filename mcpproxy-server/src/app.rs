//! Router assembly and server entry point

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::context::AppContext;
use crate::handlers::{events, info as info_handler, mcp, metrics, servers};
use crate::models::ApiResponse;

/// Build the complete application router
pub fn create_app(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/info", get(info_handler::info))
        .route("/servers", get(servers::list).post(servers::add))
        .route(
            "/servers/{name}",
            get(servers::get)
                .delete(servers::remove)
                .patch(servers::patch),
        )
        .route("/servers/{name}/login", post(servers::login))
        .route("/servers/{name}/logout", post(servers::logout))
        .route("/servers/{name}/quarantine", post(servers::quarantine))
        .route("/servers/{name}/unquarantine", post(servers::unquarantine))
        .route("/servers/{name}/enable", post(servers::enable))
        .route("/servers/{name}/disable", post(servers::disable))
        .route("/servers/{name}/restart", post(servers::restart))
        .route("/servers/{name}/logs", get(servers::logs))
        .route("/tools", get(servers::tools))
        .route("/diagnostics", get(servers::diagnostics))
        .route("/activity", get(servers::activity));

    Router::new()
        .nest("/api/v1", api)
        .route("/mcp", post(mcp::endpoint))
        .route("/events", get(events::events))
        .route("/metrics", get(metrics::metrics))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// API-key gate. `/metrics` stays open for scrapers; `/events` also
/// accepts `?api_key=` because EventSource cannot set headers.
async fn require_api_key(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = ctx.api_key() else {
        return next.run(request).await;
    };

    let path = request.uri().path();
    if path == "/metrics" {
        return next.run(request).await;
    }

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let query_key = (path == "/events")
        .then(|| {
            request.uri().query().and_then(|query| {
                query.split('&').find_map(|pair| {
                    pair.strip_prefix("api_key=").map(String::from)
                })
            })
        })
        .flatten();

    if header_key.as_deref() == Some(expected.as_str())
        || query_key.as_deref() == Some(expected.as_str())
    {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::<()>::err("invalid or missing API key", None)),
        )
            .into_response()
    }
}

/// Bind and run the control-plane server until `shutdown` resolves
pub async fn serve(
    ctx: AppContext,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listen = ctx.daemon.listen.clone();
    let app = create_app(ctx);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_config::{ProxyConfig, ToolsConfig, UpstreamConfig};
    use mcpproxy_events::EventBus;
    use mcpproxy_index::{ResponseCache, ToolRegistry};
    use mcpproxy_oauth::{FlowCoordinator, OAuthFlowManager, RefreshManager, TokenStore};
    use mcpproxy_storage::ProxyStore;
    use mcpproxy_supervisor::Supervisor;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::Arc;
    use std::time::Duration;

    async fn test_context() -> AppContext {
        let config = ProxyConfig::default();
        let store = ProxyStore::open_temporary().unwrap();
        let bus = EventBus::new();
        let registry = Arc::new(ToolRegistry::new());
        let tokens = TokenStore::new(store.clone(), Duration::from_secs(60));
        let settings = config.oauth.clone();
        let refresh = RefreshManager::new(tokens.clone(), bus.clone(), settings.clone());
        let coordinator = Arc::new(FlowCoordinator::new(
            settings.flow_timeout,
            settings.browser_rate_window,
        ));
        let supervisor = Supervisor::new(
            store.clone(),
            registry.clone(),
            bus.clone(),
            tokens.clone(),
            refresh.clone(),
            coordinator.clone(),
            ToolsConfig::default(),
            100,
        );
        let flows = Arc::new(OAuthFlowManager::new(
            settings,
            tokens.clone(),
            coordinator,
            refresh.clone(),
            bus.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(16, None));
        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle());

        AppContext::new(
            &config, supervisor, registry, cache, bus, store, tokens, flows, refresh, metrics,
        )
    }

    async fn spawn_app(ctx: AppContext) -> String {
        let app = create_app(ctx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_add_then_fetch_shows_quarantine() {
        let ctx = test_context().await;
        let base = spawn_app(ctx.clone()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/v1/servers", base))
            .json(&serde_json::json!({ "name": "gh", "url": "https://api.github.com/mcp" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let body: serde_json::Value = client
            .get(format!("{}/api/v1/servers", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let servers = body["data"].as_array().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0]["name"], "gh");
        assert_eq!(servers[0]["quarantined"], true);
        assert_eq!(servers[0]["enabled"], true);
        assert_eq!(servers[0]["health"]["action"], "approve");
        assert_eq!(servers[0]["health"]["level"], "unhealthy");

        ctx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_patch_preserves_isolation_over_rest() {
        let ctx = test_context().await;
        let base = spawn_app(ctx.clone()).await;
        let client = reqwest::Client::new();

        client
            .post(format!("{}/api/v1/servers", base))
            .json(&serde_json::json!({
                "name": "iso",
                "url": "https://x.example/mcp",
                "isolation": { "enabled": true, "image": "python:3.11", "extra_args": ["-v", "/p:/m"] }
            }))
            .send()
            .await
            .unwrap();

        let response = client
            .patch(format!("{}/api/v1/servers/iso", base))
            .json(&serde_json::json!({ "quarantined": false }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let config: UpstreamConfig = ctx.supervisor.config("iso").unwrap();
        let isolation = config.isolation.unwrap();
        assert!(isolation.enabled);
        assert_eq!(isolation.image.as_deref(), Some("python:3.11"));
        assert_eq!(isolation.extra_args, vec!["-v", "/p:/m"]);
        assert!(!config.quarantined);

        ctx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_server_is_404_with_available_list() {
        let ctx = test_context().await;
        let base = spawn_app(ctx.clone()).await;
        let client = reqwest::Client::new();

        let response = client
            .delete(format!("{}/api/v1/servers/ghost", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "server_not_found");
        ctx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_api_key_enforced_when_configured() {
        let mut ctx = test_context().await;
        ctx.daemon.api_key = Some("sekrit".to_string());
        let base = spawn_app(ctx.clone()).await;
        let client = reqwest::Client::new();

        let denied = client
            .get(format!("{}/api/v1/servers", base))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status().as_u16(), 401);

        let allowed = client
            .get(format!("{}/api/v1/servers", base))
            .header("X-API-Key", "sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status().as_u16(), 200);

        // metrics stays open for scrapers
        let metrics = client
            .get(format!("{}/metrics", base))
            .send()
            .await
            .unwrap();
        assert_eq!(metrics.status().as_u16(), 200);

        ctx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_mcp_endpoint_lists_builtin_tools() {
        let ctx = test_context().await;
        let base = spawn_app(ctx.clone()).await;
        let client = reqwest::Client::new();

        let body: serde_json::Value = client
            .post(format!("{}/mcp", base))
            .json(&serde_json::json!({ "jsonrpc": "2.0", "method": "tools/list", "id": 1 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let names: Vec<&str> = body["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"retrieve_tools"));
        assert!(names.contains(&"call_tool"));
        assert!(names.contains(&"upstream_servers"));

        ctx.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_mcp_call_on_quarantined_server_is_blocked() {
        let ctx = test_context().await;
        ctx.supervisor
            .add_server(
                UpstreamConfig::new_http("gh", "https://api.github.com/mcp"),
                mcpproxy_storage::ActivitySource::Api,
            )
            .await
            .unwrap();
        ctx.registry.update_server(
            "gh",
            vec![mcpproxy_mcp::Tool {
                name: "search".into(),
                description: "search".into(),
                input_schema: serde_json::json!({}),
                annotations: None,
            }],
        );

        let base = spawn_app(ctx.clone()).await;
        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post(format!("{}/mcp", base))
            .json(&serde_json::json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": { "name": "call_tool", "arguments": { "name": "gh.search", "args": {} } }
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let message = body["error"]["data"].to_string();
        assert!(message.contains("quarantined"), "got: {}", message);

        ctx.supervisor.shutdown().await;
    }
}
