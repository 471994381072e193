//! # Control-plane server
//!
//! The REST surface (`/api/v1/...`), the `/events` SSE fan-out, the
//! Prometheus `/metrics` endpoint and the MCP endpoint with the built-in
//! `retrieve_tools` / `call_tool` / `upstream_servers` tools. Routes
//! translate external calls into supervisor and OAuth operations; no
//! business logic lives here.

pub mod app;
pub mod context;
pub mod handlers;
pub mod models;

pub use app::{create_app, serve};
pub use context::AppContext;
pub use models::ApiResponse;
