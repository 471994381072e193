//! Doctor diagnostics: aggregate per-server health into actionable groups
//!
//! Grouping is driven entirely by `health.action`, which keeps the CLI's
//! `doctor` output and the web UI's projection of `GET /servers` in exact
//! parity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{HealthAction, HealthLevel, HealthStatus};

/// One non-healthy server outside the OAuth/secret groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamProblem {
    pub server: String,
    pub summary: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub action: HealthAction,
}

/// Aggregated diagnostics across all servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DoctorReport {
    /// Servers whose action is `login`
    pub oauth_required: Vec<String>,

    /// Other non-healthy servers
    pub upstream_errors: Vec<UpstreamProblem>,

    /// Secret name to the servers that need it
    pub missing_secrets: BTreeMap<String, Vec<String>>,
}

impl DoctorReport {
    /// Whether everything is healthy
    pub fn is_clean(&self) -> bool {
        self.oauth_required.is_empty()
            && self.upstream_errors.is_empty()
            && self.missing_secrets.is_empty()
    }
}

/// Build the report from `(server name, health)` pairs
pub fn doctor<'a>(statuses: impl IntoIterator<Item = (&'a str, &'a HealthStatus)>) -> DoctorReport {
    let mut report = DoctorReport::default();

    for (server, health) in statuses {
        match health.action {
            HealthAction::Login => report.oauth_required.push(server.to_string()),
            HealthAction::SetSecret => {
                let secret = health
                    .detail
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                report
                    .missing_secrets
                    .entry(secret)
                    .or_default()
                    .push(server.to_string());
            }
            _ => {
                if health.level != HealthLevel::Healthy {
                    report.upstream_errors.push(UpstreamProblem {
                        server: server.to_string(),
                        summary: health.summary.clone(),
                        detail: health.detail.clone(),
                        action: health.action,
                    });
                }
            }
        }
    }

    report.oauth_required.sort();
    report.upstream_errors.sort_by(|a, b| a.server.cmp(&b.server));
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdminState, HealthLevel};

    fn health(level: HealthLevel, action: HealthAction, detail: Option<&str>) -> HealthStatus {
        HealthStatus {
            level,
            admin_state: AdminState::Enabled,
            summary: "s".into(),
            detail: detail.map(String::from),
            action,
        }
    }

    #[test]
    fn test_grouping_by_action() {
        let login = health(HealthLevel::Unhealthy, HealthAction::Login, None);
        let secret = health(HealthLevel::Unhealthy, HealthAction::SetSecret, Some("TOKEN"));
        let secret2 = health(HealthLevel::Unhealthy, HealthAction::SetSecret, Some("TOKEN"));
        let errored = health(HealthLevel::Unhealthy, HealthAction::ViewLogs, None);
        let healthy = health(HealthLevel::Healthy, HealthAction::None, None);

        let report = doctor([
            ("b", &login),
            ("a", &secret),
            ("c", &errored),
            ("d", &healthy),
            ("e", &secret2),
        ]);

        assert_eq!(report.oauth_required, vec!["b".to_string()]);
        assert_eq!(report.missing_secrets["TOKEN"], vec!["a", "e"]);
        assert_eq!(report.upstream_errors.len(), 1);
        assert_eq!(report.upstream_errors[0].server, "c");
        assert!(!report.is_clean());
    }

    #[test]
    fn test_all_healthy_is_clean() {
        let healthy = health(HealthLevel::Healthy, HealthAction::None, None);
        let report = doctor([("a", &healthy)]);
        assert!(report.is_clean());
    }

    #[test]
    fn test_degraded_counts_as_upstream_error() {
        let degraded = health(HealthLevel::Degraded, HealthAction::ViewLogs, None);
        let report = doctor([("a", &degraded)]);
        assert_eq!(report.upstream_errors.len(), 1);
    }
}
