//! Unified health model
//!
//! [`calculate_health`] is a pure function from raw signals to the
//! [`HealthStatus`] every surface (CLI, tray, web UI) renders verbatim.
//! Clients never re-derive state from legacy fields; the tray's
//! "connected" count comes from `level == healthy`, not from the raw
//! `connected` boolean.

pub mod doctor;

pub use doctor::{doctor, DoctorReport, UpstreamProblem};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Administrative state, orthogonal to connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    Enabled,
    Disabled,
    Quarantined,
}

/// The single remedial action a surface should offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthAction {
    Login,
    Restart,
    Enable,
    Approve,
    ViewLogs,
    SetSecret,
    Configure,

    /// Nothing to do
    #[default]
    #[serde(rename = "")]
    None,
}

/// Calculator output, rendered as the `health` object on every surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub level: HealthLevel,
    pub admin_state: AdminState,
    pub summary: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub action: HealthAction,
}

impl HealthStatus {
    /// Whether `last_error` is redundant next to this status and must be
    /// suppressed in UIs
    pub fn suppresses_last_error(&self) -> bool {
        matches!(
            self.action,
            HealthAction::Login | HealthAction::SetSecret | HealthAction::Configure
        )
    }
}

/// State of the proactive token refresh schedule, as seen by the calculator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    #[default]
    Idle,
    Scheduled,
    Retrying,
    Failed,
}

/// Raw signals the calculator consumes. Collected by the supervisor;
/// nothing here is derived.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthInput {
    pub enabled: bool,
    pub quarantined: bool,

    /// Human-readable label of the connection state ("connected",
    /// "reconnecting", "error: port conflict", ...)
    pub connection_label: String,

    /// Whether the connection state machine sits in an error leaf
    pub connection_in_error: bool,

    pub connected: bool,
    pub last_error: Option<String>,
    pub tool_count: usize,

    /// Name of an unresolvable `${env:...}` secret, when one exists
    pub missing_secret: Option<String>,

    /// OAuth configuration problem detected at validation time
    pub oauth_config_error: Option<String>,

    pub refresh_state: RefreshState,
    pub refresh_retry_count: u32,
    pub refresh_next_attempt: Option<DateTime<Utc>>,
}

/// Fragments of an error string that signal a required login
const OAUTH_SIGNALS: &[&str] = &["401", "invalid_token", "invalid_grant", "unauthorized"];

/// Map raw signals to the unified health status. Pure and deterministic:
/// equal inputs produce equal outputs. First matching row wins.
pub fn calculate_health(input: &HealthInput) -> HealthStatus {
    let admin_state = if input.quarantined {
        AdminState::Quarantined
    } else if !input.enabled {
        AdminState::Disabled
    } else {
        AdminState::Enabled
    };

    let status = |level, summary: String, detail: Option<String>, action| HealthStatus {
        level,
        admin_state,
        summary,
        detail,
        action,
    };

    if input.quarantined {
        return status(
            HealthLevel::Unhealthy,
            "Quarantined".to_string(),
            None,
            HealthAction::Approve,
        );
    }

    if !input.enabled {
        return status(
            HealthLevel::Unhealthy,
            "Disabled".to_string(),
            None,
            HealthAction::Enable,
        );
    }

    if let Some(secret) = &input.missing_secret {
        return status(
            HealthLevel::Unhealthy,
            format!("Missing secret: {}", secret),
            Some(secret.clone()),
            HealthAction::SetSecret,
        );
    }

    if let Some(error) = &input.oauth_config_error {
        return status(
            HealthLevel::Unhealthy,
            "OAuth config error".to_string(),
            Some(error.clone()),
            HealthAction::Configure,
        );
    }

    if input.refresh_state == RefreshState::Failed {
        return status(
            HealthLevel::Unhealthy,
            "Refresh token expired".to_string(),
            None,
            HealthAction::Login,
        );
    }

    if let Some(error) = &input.last_error {
        let lowered = error.to_lowercase();
        if OAUTH_SIGNALS.iter().any(|signal| lowered.contains(signal)) {
            return status(
                HealthLevel::Unhealthy,
                "Login required".to_string(),
                None,
                HealthAction::Login,
            );
        }
    }

    if input.refresh_state == RefreshState::Retrying {
        let detail = input
            .refresh_next_attempt
            .map(|at| format!("retry {} at {}", input.refresh_retry_count, at.to_rfc3339()));
        return status(
            HealthLevel::Degraded,
            "Token refresh retry pending".to_string(),
            detail,
            HealthAction::ViewLogs,
        );
    }

    if input.connection_in_error {
        return status(
            HealthLevel::Unhealthy,
            input.connection_label.clone(),
            input.last_error.clone(),
            HealthAction::ViewLogs,
        );
    }

    if input.connected && input.tool_count > 0 {
        return status(
            HealthLevel::Healthy,
            format!("Connected ({} tools)", input.tool_count),
            None,
            HealthAction::None,
        );
    }

    if input.connected {
        return status(
            HealthLevel::Degraded,
            "Connected, no tools".to_string(),
            None,
            HealthAction::ViewLogs,
        );
    }

    status(
        HealthLevel::Degraded,
        "Connecting…".to_string(),
        None,
        HealthAction::None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_input() -> HealthInput {
        HealthInput {
            enabled: true,
            quarantined: false,
            connection_label: "connected".into(),
            connected: true,
            tool_count: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_healthy_connected_with_tools() {
        let health = calculate_health(&connected_input());
        assert_eq!(health.level, HealthLevel::Healthy);
        assert_eq!(health.summary, "Connected (3 tools)");
        assert_eq!(health.action, HealthAction::None);
        assert_eq!(health.admin_state, AdminState::Enabled);
    }

    #[test]
    fn test_quarantine_beats_everything() {
        let mut input = connected_input();
        input.quarantined = true;
        input.missing_secret = Some("TOKEN".into());
        input.last_error = Some("401".into());

        let health = calculate_health(&input);
        assert_eq!(health.level, HealthLevel::Unhealthy);
        assert_eq!(health.summary, "Quarantined");
        assert_eq!(health.action, HealthAction::Approve);
        assert_eq!(health.admin_state, AdminState::Quarantined);
    }

    #[test]
    fn test_disabled_second() {
        let mut input = connected_input();
        input.enabled = false;
        input.missing_secret = Some("TOKEN".into());

        let health = calculate_health(&input);
        assert_eq!(health.summary, "Disabled");
        assert_eq!(health.action, HealthAction::Enable);
    }

    #[test]
    fn test_missing_secret_surfaces_name() {
        let mut input = connected_input();
        input.missing_secret = Some("MISSING_TOKEN".into());

        let health = calculate_health(&input);
        assert_eq!(health.summary, "Missing secret: MISSING_TOKEN");
        assert_eq!(health.detail.as_deref(), Some("MISSING_TOKEN"));
        assert_eq!(health.action, HealthAction::SetSecret);
        assert!(health.suppresses_last_error());
    }

    #[test]
    fn test_refresh_failed_means_login() {
        let mut input = connected_input();
        input.refresh_state = RefreshState::Failed;

        let health = calculate_health(&input);
        assert_eq!(health.summary, "Refresh token expired");
        assert_eq!(health.action, HealthAction::Login);
    }

    #[test]
    fn test_oauth_signal_in_error_string() {
        for signal in ["401 Unauthorized", "invalid_token", "invalid_grant", "Unauthorized"] {
            let mut input = connected_input();
            input.connected = false;
            input.last_error = Some(signal.to_string());

            let health = calculate_health(&input);
            assert_eq!(health.summary, "Login required", "signal: {}", signal);
            assert_eq!(health.action, HealthAction::Login);
        }
    }

    #[test]
    fn test_refresh_retrying_is_degraded() {
        let mut input = connected_input();
        input.refresh_state = RefreshState::Retrying;
        input.refresh_retry_count = 2;

        let health = calculate_health(&input);
        assert_eq!(health.level, HealthLevel::Degraded);
        assert_eq!(health.action, HealthAction::ViewLogs);
    }

    #[test]
    fn test_connection_error_leaf() {
        let mut input = connected_input();
        input.connected = false;
        input.connection_in_error = true;
        input.connection_label = "error: port conflict".into();
        input.last_error = Some("port 8080 in use".into());

        let health = calculate_health(&input);
        assert_eq!(health.level, HealthLevel::Unhealthy);
        assert_eq!(health.summary, "error: port conflict");
        assert_eq!(health.action, HealthAction::ViewLogs);
    }

    #[test]
    fn test_connected_without_tools_is_degraded() {
        let mut input = connected_input();
        input.tool_count = 0;

        let health = calculate_health(&input);
        assert_eq!(health.level, HealthLevel::Degraded);
        assert_eq!(health.summary, "Connected, no tools");
    }

    #[test]
    fn test_otherwise_connecting() {
        let mut input = connected_input();
        input.connected = false;
        input.tool_count = 0;

        let health = calculate_health(&input);
        assert_eq!(health.level, HealthLevel::Degraded);
        assert_eq!(health.summary, "Connecting…");
        assert_eq!(health.action, HealthAction::None);
    }

    #[test]
    fn test_purity_and_stability() {
        let input = connected_input();
        let a = calculate_health(&input);
        let b = calculate_health(&input);
        assert_eq!(a, b);
        // repeated invocation with unchanged input stays stable
        for _ in 0..10 {
            assert_eq!(calculate_health(&input), a);
        }
    }

    #[test]
    fn test_action_serializes_to_spec_strings() {
        assert_eq!(serde_json::to_value(HealthAction::Login).unwrap(), "login");
        assert_eq!(
            serde_json::to_value(HealthAction::ViewLogs).unwrap(),
            "view_logs"
        );
        assert_eq!(
            serde_json::to_value(HealthAction::SetSecret).unwrap(),
            "set_secret"
        );
        assert_eq!(serde_json::to_value(HealthAction::None).unwrap(), "");
    }
}
