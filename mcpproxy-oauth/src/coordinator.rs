//! Per-server flow coordination
//!
//! One authorization flow per server at a time. A second attempt while one
//! is active gets `flow_in_progress` with the active flow's correlation ID
//! instead of clearing state and retrying. Flows that outlive the timeout
//! are considered abandoned and their slot is reclaimed. Browser opens are
//! rate limited per server, except within an already-active flow.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{OAuthError, OAuthResult};

#[derive(Debug, Clone)]
struct ActiveFlow {
    correlation_id: String,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    active: HashMap<String, ActiveFlow>,
    last_browser_open: HashMap<String, Instant>,
}

/// The process-wide coordinator
#[derive(Debug)]
pub struct FlowCoordinator {
    state: Mutex<CoordinatorState>,
    flow_timeout: Duration,
    browser_rate_window: Duration,
}

/// Releases the server's flow slot on drop. Owns its coordinator so it
/// can travel into the flow's background task.
#[derive(Debug)]
pub struct FlowGuard {
    coordinator: std::sync::Arc<FlowCoordinator>,
    server: String,
    correlation_id: String,
}

impl FlowGuard {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        let mut state = self.coordinator.state.lock().expect("coordinator poisoned");
        // Only clear the slot if it is still ours
        if state
            .active
            .get(&self.server)
            .is_some_and(|flow| flow.correlation_id == self.correlation_id)
        {
            state.active.remove(&self.server);
        }
    }
}

impl FlowCoordinator {
    pub fn new(flow_timeout: Duration, browser_rate_window: Duration) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            flow_timeout,
            browser_rate_window,
        }
    }

    /// Claim the server's flow slot. Fails with `flow_in_progress` (and the
    /// running flow's correlation ID) while another flow is active.
    pub fn start_flow(
        self: &std::sync::Arc<Self>,
        server: &str,
        correlation_id: &str,
    ) -> OAuthResult<FlowGuard> {
        let mut state = self.state.lock().expect("coordinator poisoned");

        if let Some(active) = state.active.get(server) {
            if active.started_at.elapsed() < self.flow_timeout {
                return Err(OAuthError::FlowInProgress {
                    name: server.to_string(),
                    correlation_id: active.correlation_id.clone(),
                });
            }
            warn!(
                server = %server,
                stale_correlation_id = %active.correlation_id,
                "reclaiming abandoned OAuth flow slot"
            );
        }

        state.active.insert(
            server.to_string(),
            ActiveFlow {
                correlation_id: correlation_id.to_string(),
                started_at: Instant::now(),
            },
        );
        info!(server = %server, correlation_id = %correlation_id, "OAuth flow started");

        Ok(FlowGuard {
            coordinator: self.clone(),
            server: server.to_string(),
            correlation_id: correlation_id.to_string(),
        })
    }

    /// Correlation ID of the flow currently running for `server`, if any
    pub fn active_flow(&self, server: &str) -> Option<String> {
        let state = self.state.lock().expect("coordinator poisoned");
        state
            .active
            .get(server)
            .filter(|flow| flow.started_at.elapsed() < self.flow_timeout)
            .map(|flow| flow.correlation_id.clone())
    }

    /// Whether the per-server browser-open rate limit allows an open now.
    /// `within_active_flow` overrides the limit, and a permitted open
    /// consumes the window.
    pub fn may_open_browser(&self, server: &str, within_active_flow: bool) -> bool {
        let mut state = self.state.lock().expect("coordinator poisoned");
        let now = Instant::now();

        if !within_active_flow {
            if let Some(last) = state.last_browser_open.get(server) {
                if now.duration_since(*last) < self.browser_rate_window {
                    return false;
                }
            }
        }
        state.last_browser_open.insert(server.to_string(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> std::sync::Arc<FlowCoordinator> {
        std::sync::Arc::new(FlowCoordinator::new(
            Duration::from_secs(300),
            Duration::from_secs(300),
        ))
    }

    #[test]
    fn test_second_flow_blocked_with_first_correlation_id() {
        let coordinator = coordinator();

        let guard = coordinator.start_flow("gh", "cid-1").unwrap();
        let err = coordinator.start_flow("gh", "cid-2").unwrap_err();
        assert!(matches!(
            err,
            OAuthError::FlowInProgress { ref correlation_id, .. } if correlation_id == "cid-1"
        ));

        drop(guard);
        assert!(coordinator.start_flow("gh", "cid-3").is_ok());
    }

    #[test]
    fn test_flows_for_different_servers_independent() {
        let coordinator = coordinator();
        let _a = coordinator.start_flow("a", "cid-a").unwrap();
        assert!(coordinator.start_flow("b", "cid-b").is_ok());
    }

    #[test]
    fn test_stale_flow_reclaimed() {
        let coordinator = std::sync::Arc::new(FlowCoordinator::new(
            Duration::from_millis(0),
            Duration::from_secs(300),
        ));
        let _stale = coordinator.start_flow("gh", "cid-old").unwrap();
        // zero timeout: the old slot is immediately reclaimable
        assert!(coordinator.start_flow("gh", "cid-new").is_ok());
    }

    #[test]
    fn test_browser_rate_limit_per_server() {
        let coordinator = coordinator();

        assert!(coordinator.may_open_browser("gh", false));
        assert!(!coordinator.may_open_browser("gh", false));
        // other servers are unaffected
        assert!(coordinator.may_open_browser("docs", false));
        // an active flow overrides the window
        assert!(coordinator.may_open_browser("gh", true));
    }

    #[test]
    fn test_guard_drop_only_clears_own_slot() {
        let coordinator = std::sync::Arc::new(FlowCoordinator::new(
            Duration::from_millis(0),
            Duration::from_secs(300),
        ));
        let stale = coordinator.start_flow("gh", "cid-old").unwrap();
        let _fresh = coordinator.start_flow("gh", "cid-new").unwrap();

        // dropping the reclaimed guard must not evict the new flow
        drop(stale);
        assert_eq!(coordinator.active_flow("gh"), None); // zero timeout: nothing reads as active
        let state = coordinator.state.lock().unwrap();
        assert_eq!(state.active["gh"].correlation_id, "cid-new");
    }
}
