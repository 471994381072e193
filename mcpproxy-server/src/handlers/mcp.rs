//! The proxy's own MCP endpoint
//!
//! A streamable-HTTP style endpoint: each POST carries one JSON-RPC frame.
//! Instead of the raw union of every upstream catalog, the LLM sees three
//! built-in tools: `retrieve_tools` (BM25 discovery), `call_tool`
//! (qualified routing through the supervisor) and `upstream_servers`
//! (server management).

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use mcpproxy_events::ProxyEvent;
use mcpproxy_index::fingerprint;
use mcpproxy_mcp::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use mcpproxy_storage::{ActivityEntry, ActivityKind, ActivitySource, ActivityStatus};
use mcpproxy_supervisor::SupervisorError;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::AppContext;

/// Crude token estimate for activity accounting
fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

pub async fn endpoint(
    State(ctx): State<AppContext>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    // Notifications get acknowledged without a body
    if request.is_notification() {
        debug!(method = %request.method, "mcp notification");
        return StatusCode::ACCEPTED.into_response();
    }

    let id = request.id.clone();
    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(initialize_result(), id),
        "ping" => JsonRpcResponse::success(json!({}), id),
        "tools/list" => JsonRpcResponse::success(json!({ "tools": builtin_tools() }), id),
        "tools/call" => {
            let params = request.params.unwrap_or_default();
            match dispatch_tool(&ctx, &params).await {
                Ok(result) => JsonRpcResponse::success(result, id),
                Err(error) => JsonRpcResponse::error(error, id),
            }
        }
        other => JsonRpcResponse::error(JsonRpcError::method_not_found(other), id),
    };

    (StatusCode::OK, Json(response)).into_response()
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": mcpproxy_mcp::MCP_PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": true } },
        "serverInfo": {
            "name": "mcpproxy",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// The three tools the proxy itself exposes
fn builtin_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "retrieve_tools",
            "description": "Search the aggregated tool catalog with a BM25-ranked keyword query and get back the most relevant tools with usage hints.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Keywords describing the needed capability" },
                    "limit": { "type": "integer", "description": "Maximum number of tools to return", "default": 10 }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "call_tool",
            "description": "Invoke an upstream tool by its qualified name \"<server>.<tool>\" (the short name works while it is unambiguous).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Qualified tool name" },
                    "args": { "type": "object", "description": "Arguments passed through to the upstream tool" }
                },
                "required": ["name"]
            }
        }),
        json!({
            "name": "upstream_servers",
            "description": "Manage the configured upstream MCP servers: list, add, patch or remove. New servers start quarantined.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "operation": { "type": "string", "enum": ["list", "add", "patch", "remove"] },
                    "name": { "type": "string" },
                    "config": { "type": "object" },
                    "patch": { "type": "object" }
                },
                "required": ["operation"]
            }
        }),
    ]
}

async fn dispatch_tool(ctx: &AppContext, params: &Value) -> Result<Value, JsonRpcError> {
    let tool_name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("missing tool name"))?;
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    match tool_name {
        "retrieve_tools" => retrieve_tools(ctx, &arguments),
        "call_tool" => call_tool(ctx, &arguments).await,
        "upstream_servers" => upstream_servers(ctx, &arguments).await,
        other => Err(JsonRpcError::method_not_found(other)),
    }
}

fn retrieve_tools(ctx: &AppContext, args: &Value) -> Result<Value, JsonRpcError> {
    let query = args
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("missing query"))?;
    let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(10) as usize;

    let hits = ctx.registry.search(query, limit);
    let tools: Vec<Value> = hits
        .iter()
        .filter_map(|hit| {
            ctx.registry.get(&hit.qualified_name).map(|indexed| {
                json!({
                    "name": hit.qualified_name,
                    "score": hit.score,
                    "server": indexed.server,
                    "description": indexed.tool.description,
                    "inputSchema": indexed.tool.input_schema,
                })
            })
        })
        .collect();

    let hint = if tools.is_empty() {
        "No matching tools. Broaden the query or check server health with upstream_servers list."
    } else {
        "Call a result with call_tool using its qualified name."
    };

    Ok(tool_text_result(json!({ "tools": tools, "hint": hint })))
}

async fn call_tool(ctx: &AppContext, args: &Value) -> Result<Value, JsonRpcError> {
    let name = args
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("missing name"))?;
    let tool_args = args.get("args").cloned().unwrap_or(json!({}));

    let (server, tool) = ctx
        .registry
        .resolve(name)
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

    // Security gate before the cache: a cached response must never let a
    // quarantined or disabled server answer.
    if let Some(config) = ctx.supervisor.config(&server) {
        if config.quarantined {
            log_blocked_call(ctx, &server, &tool, &tool_args, "quarantined");
            return Err(JsonRpcError::invalid_params(format!(
                "server '{}' is quarantined; approve it before calling its tools",
                server
            )));
        }
        if !config.enabled {
            log_blocked_call(ctx, &server, &tool, &tool_args, "disabled");
            return Err(JsonRpcError::invalid_params(format!(
                "server '{}' is disabled",
                server
            )));
        }
    }

    let started = Instant::now();
    let key = fingerprint(&server, &tool, &tool_args);

    let supervisor = ctx.supervisor.clone();
    let call_server = server.clone();
    let call_tool_name = tool.clone();
    let call_args = tool_args.clone();
    let reference = format!("{}.{}", server, tool);

    let result = ctx
        .cache
        .get_or_compute(&key, || async move {
            let outcome = supervisor
                .call_tool(&format!("{}.{}", call_server, call_tool_name), Some(call_args))
                .await
                .map_err(|e| mcpproxy_index::IndexError::compute(e.to_string()))?;
            serde_json::to_value(&outcome)
                .map_err(|e| mcpproxy_index::IndexError::compute(e.to_string()))
        })
        .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    let (status, response_text, error) = match &result {
        Ok(value) => (
            ActivityStatus::Success,
            Some(value.to_string()),
            None,
        ),
        Err(e) => {
            let text = e.to_string();
            let status = if text.contains("quarantined") || text.contains("disabled") {
                ActivityStatus::Blocked
            } else {
                ActivityStatus::Error
            };
            (status, None, Some(text))
        }
    };

    metrics::counter!(
        "mcpproxy_tool_calls_total",
        "server" => server.clone(),
        "status" => match status {
            ActivityStatus::Success => "success",
            ActivityStatus::Error => "error",
            ActivityStatus::Blocked => "blocked",
        },
    )
    .increment(1);

    let mut entry = ActivityEntry {
        id: 0,
        kind: ActivityKind::ToolCall,
        source: ActivitySource::Mcp,
        server: Some(server),
        tool: Some(tool),
        arguments: Some(tool_args),
        response: response_text.clone(),
        response_truncated: false,
        status,
        duration_ms,
        timestamp: chrono::Utc::now(),
        session_id: None,
        request_id: Some(uuid::Uuid::new_v4().to_string()),
        token_estimate: response_text.as_deref().map(estimate_tokens),
    };
    entry.truncate_response(ctx.tools.tool_response_limit);
    if let Ok(entry) = ctx.store.append_activity(entry, ctx.daemon.activity_retention) {
        ctx.bus.publish(ProxyEvent::Activity {
            entry: serde_json::to_value(&entry).unwrap_or_default(),
        });
    }

    match result {
        Ok(value) => Ok(value),
        Err(_) => {
            let message = error.unwrap_or_else(|| format!("call to '{}' failed", reference));
            Err(JsonRpcError::internal_error(message))
        }
    }
}

async fn upstream_servers(ctx: &AppContext, args: &Value) -> Result<Value, JsonRpcError> {
    let operation = args
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::invalid_params("missing operation"))?;

    match operation {
        "list" => {
            let views = ctx.supervisor.server_views().await;
            Ok(tool_text_result(json!({ "servers": views })))
        }
        "add" => {
            let config = args
                .get("config")
                .cloned()
                .ok_or_else(|| JsonRpcError::invalid_params("missing config"))?;
            let config: mcpproxy_config::UpstreamConfig = serde_json::from_value(config)
                .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
            let name = config.name.clone();
            ctx.supervisor
                .add_server(config, ActivitySource::Mcp)
                .await
                .map_err(map_supervisor_error)?;
            Ok(tool_text_result(json!({
                "added": name,
                "quarantined": true,
                "note": "new servers start quarantined; approve before use"
            })))
        }
        "patch" => {
            let name = args
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| JsonRpcError::invalid_params("missing name"))?;
            let patch = args
                .get("patch")
                .cloned()
                .ok_or_else(|| JsonRpcError::invalid_params("missing patch"))?;
            let diff = ctx
                .supervisor
                .patch_server(name, &patch, ActivitySource::Mcp)
                .await
                .map_err(map_supervisor_error)?;
            Ok(tool_text_result(json!({ "patched": name, "diff": diff })))
        }
        "remove" => {
            let name = args
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| JsonRpcError::invalid_params("missing name"))?;
            ctx.supervisor
                .remove_server(name, ActivitySource::Mcp)
                .await
                .map_err(map_supervisor_error)?;
            Ok(tool_text_result(json!({ "removed": name })))
        }
        other => Err(JsonRpcError::invalid_params(format!(
            "unknown operation '{}'",
            other
        ))),
    }
}

/// Record a policy-blocked call in the activity log
fn log_blocked_call(ctx: &AppContext, server: &str, tool: &str, args: &Value, reason: &str) {
    let entry = ActivityEntry {
        id: 0,
        kind: ActivityKind::PolicyDecision,
        source: ActivitySource::Mcp,
        server: Some(server.to_string()),
        tool: Some(tool.to_string()),
        arguments: Some(args.clone()),
        response: Some(format!("blocked: {}", reason)),
        response_truncated: false,
        status: ActivityStatus::Blocked,
        duration_ms: 0,
        timestamp: chrono::Utc::now(),
        session_id: None,
        request_id: None,
        token_estimate: None,
    };
    if let Ok(entry) = ctx.store.append_activity(entry, ctx.daemon.activity_retention) {
        ctx.bus.publish(ProxyEvent::Activity {
            entry: serde_json::to_value(&entry).unwrap_or_default(),
        });
    }
}

/// Wrap a JSON payload as MCP tool-result content
fn tool_text_result(payload: Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": payload.to_string() }],
        "isError": false
    })
}

fn map_supervisor_error(err: SupervisorError) -> JsonRpcError {
    if err.is_validation() {
        JsonRpcError::invalid_params(err.to_string())
    } else {
        JsonRpcError::internal_error(err.to_string())
    }
}
