//! `GET /api/v1/info`

use axum::extract::State;
use axum::Json;

use crate::context::AppContext;
use crate::models::{ApiResponse, Endpoints, InfoResponse};

pub async fn info(State(ctx): State<AppContext>) -> Json<ApiResponse<InfoResponse>> {
    let update = if std::env::var_os("MCPPROXY_DISABLE_AUTO_UPDATE").is_some() {
        None
    } else {
        // prereleases only count when explicitly opted in
        ctx.update.clone().map(|mut update| {
            if update.is_prerelease == Some(true)
                && std::env::var_os("MCPPROXY_ALLOW_PRERELEASE_UPDATES").is_none()
            {
                update.available = false;
            }
            update
        })
    };

    Json(ApiResponse::ok(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        listen_addr: ctx.daemon.listen.clone(),
        endpoints: Endpoints {
            http: format!("http://{}", ctx.daemon.listen),
            socket: None,
        },
        update,
    }))
}
