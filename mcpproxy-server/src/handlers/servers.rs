//! `/api/v1/servers` CRUD, admin verbs and the OAuth login trigger

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use mcpproxy_config::{ConfigDiff, UpstreamConfig};
use mcpproxy_storage::ActivitySource;
use mcpproxy_supervisor::ServerView;
use serde_json::Value;
use tracing::info;

use super::supervisor_error_response;
use crate::context::AppContext;
use crate::models::ApiResponse;

pub async fn list(State(ctx): State<AppContext>) -> Json<ApiResponse<Vec<ServerView>>> {
    Json(ApiResponse::ok(ctx.supervisor.server_views().await))
}

pub async fn get(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match ctx.supervisor.server_view(&name).await {
        Ok(view) => (StatusCode::OK, Json(ApiResponse::ok(view))).into_response(),
        Err(e) => supervisor_error_response::<ServerView>(e).into_response(),
    }
}

pub async fn add(
    State(ctx): State<AppContext>,
    Json(config): Json<UpstreamConfig>,
) -> impl IntoResponse {
    match ctx.supervisor.add_server(config, ActivitySource::Api).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(Value::Null))).into_response(),
        Err(e) => supervisor_error_response::<Value>(e).into_response(),
    }
}

pub async fn remove(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match ctx.supervisor.remove_server(&name, ActivitySource::Api).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(Value::Null))).into_response(),
        Err(e) => supervisor_error_response::<Value>(e).into_response(),
    }
}

pub async fn patch(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match ctx
        .supervisor
        .patch_server(&name, &body, ActivitySource::Api)
        .await
    {
        Ok(diff) => (StatusCode::OK, Json(ApiResponse::ok(diff))).into_response(),
        Err(e) => supervisor_error_response::<ConfigDiff>(e).into_response(),
    }
}

/// `POST /api/v1/servers/{name}/login`: start the OAuth flow
pub async fn login(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Some(config) = ctx.supervisor.config(&name) else {
        let err = mcpproxy_oauth::OAuthError::ServerNotFound {
            name: name.clone(),
            available_servers: ctx.supervisor.server_names(),
        };
        return (StatusCode::BAD_REQUEST, Json(err.to_body())).into_response();
    };

    match ctx.flows.start_login(&config).await {
        Ok(response) => {
            info!(server = %name, correlation_id = %response.correlation_id, "login flow started");
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) if e.is_validation() => {
            (StatusCode::BAD_REQUEST, Json(e.to_body())).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(e.to_body())).into_response(),
    }
}

/// Logout: drop the persisted token and its schedule
pub async fn logout(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match ctx.tokens.delete(&name) {
        Ok(removed) => {
            ctx.refresh.forget(&name);
            ctx.supervisor.update_auth_header(&name);
            ctx.bus.publish(mcpproxy_events::ProxyEvent::ServersChanged);
            (
                StatusCode::OK,
                Json(ApiResponse::ok(serde_json::json!({ "removed": removed }))),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<Value>::err(e.to_string(), None)),
        )
            .into_response(),
    }
}

macro_rules! admin_verb {
    ($fn_name:ident, |$ctx:ident: &AppContext, $name:ident: String| async move $body:block) => {
        pub async fn $fn_name(
            State($ctx): State<AppContext>,
            Path($name): Path<String>,
        ) -> impl IntoResponse {
            let $ctx = &$ctx;
            let result = (async move $body).await;
            match result {
                Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(Value::Null))).into_response(),
                Err(e) => supervisor_error_response::<Value>(e).into_response(),
            }
        }
    };
}

admin_verb!(quarantine, |ctx: &AppContext, name: String| async move {
    ctx.supervisor
        .set_quarantined(&name, true, ActivitySource::Api)
        .await
        .map(|_| ())
});

admin_verb!(unquarantine, |ctx: &AppContext, name: String| async move {
    ctx.supervisor
        .set_quarantined(&name, false, ActivitySource::Api)
        .await
        .map(|_| ())
});

admin_verb!(enable, |ctx: &AppContext, name: String| async move {
    ctx.supervisor
        .set_enabled(&name, true, ActivitySource::Api)
        .await
        .map(|_| ())
});

admin_verb!(disable, |ctx: &AppContext, name: String| async move {
    ctx.supervisor
        .set_enabled(&name, false, ActivitySource::Api)
        .await
        .map(|_| ())
});

admin_verb!(restart, |ctx: &AppContext, name: String| async move {
    ctx.supervisor.restart_server(&name).await
});

/// `GET /api/v1/servers/{name}/logs`
pub async fn logs(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match ctx.supervisor.server_logs(&name, 200).await {
        Ok(lines) => (StatusCode::OK, Json(ApiResponse::ok(lines))).into_response(),
        Err(e) => supervisor_error_response::<Vec<String>>(e).into_response(),
    }
}

/// `GET /api/v1/tools`: the aggregated catalog
pub async fn tools(State(ctx): State<AppContext>) -> impl IntoResponse {
    let tools: Vec<Value> = ctx
        .registry
        .all_tools()
        .into_iter()
        .map(|indexed| {
            serde_json::json!({
                "name": indexed.qualified_name(),
                "server": indexed.server,
                "description": indexed.tool.description,
            })
        })
        .collect();
    Json(ApiResponse::ok(tools))
}

/// `GET /api/v1/diagnostics`: doctor over the REST surface
pub async fn diagnostics(State(ctx): State<AppContext>) -> impl IntoResponse {
    let views = ctx.supervisor.server_views().await;
    let pairs: Vec<(&str, &mcpproxy_health::HealthStatus)> = views
        .iter()
        .map(|view| (view.name.as_str(), &view.health))
        .collect();
    let report = mcpproxy_health::doctor(pairs);
    Json(ApiResponse::ok(report))
}

/// `GET /api/v1/activity`
pub async fn activity(State(ctx): State<AppContext>) -> impl IntoResponse {
    match ctx.store.recent_activity(100) {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::ok(entries))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<Value>::err(e.to_string(), None)),
        )
            .into_response(),
    }
}
