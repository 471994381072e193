//! HTTP route handlers

pub mod events;
pub mod info;
pub mod mcp;
pub mod metrics;
pub mod servers;

use axum::http::StatusCode;
use axum::Json;
use mcpproxy_supervisor::SupervisorError;

use crate::models::{ApiError, ApiResponse};

/// Map a supervisor error onto the envelope and status code
pub fn supervisor_error_response<T>(
    err: SupervisorError,
) -> (StatusCode, Json<ApiResponse<T>>) {
    let status = match &err {
        SupervisorError::NotFound { .. } => StatusCode::NOT_FOUND,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let details = match &err {
        SupervisorError::NotFound { available, .. } => {
            Some(serde_json::json!({ "available_servers": available }))
        }
        SupervisorError::AmbiguousTool { servers, .. } => {
            Some(serde_json::json!({ "servers": servers }))
        }
        _ => None,
    };

    let body = ApiResponse {
        success: false,
        data: None,
        error: Some(ApiError {
            message: err.to_string(),
            code: Some(error_code(&err).to_string()),
            details,
        }),
    };
    (status, Json(body))
}

fn error_code(err: &SupervisorError) -> &'static str {
    match err {
        SupervisorError::NotFound { .. } => "server_not_found",
        SupervisorError::AlreadyExists { .. } => "server_exists",
        SupervisorError::Quarantined { .. } => "server_quarantined",
        SupervisorError::Disabled { .. } => "server_disabled",
        SupervisorError::ToolNotFound { .. } => "tool_not_found",
        SupervisorError::AmbiguousTool { .. } => "tool_ambiguous",
        SupervisorError::Config(mcpproxy_config::ConfigError::ImmutableField { .. }) => {
            "immutable_field"
        }
        SupervisorError::Config(_) => "invalid_field",
        SupervisorError::Storage(_) => "storage_error",
        SupervisorError::Upstream(_) => "upstream_error",
    }
}
