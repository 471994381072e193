//! # OAuth subsystem
//!
//! Everything between "the upstream said 401" and "we hold a valid,
//! proactively refreshed token":
//!
//! - RFC 9728 protected-resource discovery and RFC 8414 authorization
//!   server metadata ([`discovery`])
//! - RFC 8707 `resource` parameter selection ([`resource`])
//! - Dynamic Client Registration ([`dcr`])
//! - The PKCE authorization flow with its loopback callback server
//!   ([`flow`], [`callback`])
//! - Token persistence with the expiry grace period ([`tokens`])
//! - Proactive refresh with exponential backoff ([`refresh`])
//! - The per-server flow coordinator that serializes concurrent login
//!   attempts ([`coordinator`])
//!
//! Every runtime failure is classified into an [`OAuthError`] carrying a
//! correlation ID before it leaves this crate; a raw error reaching a user
//! surface is a bug.

pub mod browser;
pub mod callback;
pub mod coordinator;
pub mod dcr;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod refresh;
pub mod resource;
pub mod tokens;

pub use coordinator::{FlowCoordinator, FlowGuard};
pub use error::{OAuthError, OAuthErrorBody, OAuthResult};
pub use flow::{OAuthFlowManager, OAuthStartResponse};
pub use refresh::{RefreshManager, RefreshOutcome, RefreshScheduleSnapshot};
pub use tokens::{TokenStore, TokenState};

/// Metric: refresh attempts by server and result
pub const METRIC_REFRESH_TOTAL: &str = "mcpproxy_oauth_refresh_total";

/// Metric: refresh duration histogram by server and result
pub const METRIC_REFRESH_DURATION: &str = "mcpproxy_oauth_refresh_duration_seconds";
