//! `GET /metrics`: Prometheus text exposition

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::context::AppContext;

pub async fn metrics(State(ctx): State<AppContext>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.metrics.render(),
    )
}
