//! Smart-merged menu view model
//!
//! Server items keep their identity across refreshes: an update from
//! `GET /servers` is diffed onto the existing entries in place so the
//! menu renderer only repaints what changed. Counts derive from the
//! unified health object, never from raw connection booleans.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

/// One server as the tray sees it
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerItem {
    pub name: String,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub quarantined: bool,

    #[serde(default)]
    pub tool_count: usize,

    pub health: HealthView,

    #[serde(default)]
    pub last_error: Option<String>,
}

/// The health object, rendered verbatim
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthView {
    pub level: String,
    pub admin_state: String,
    pub summary: String,

    #[serde(default)]
    pub detail: Option<String>,

    pub action: String,
}

impl ServerItem {
    /// The single warning line the menu shows, when one applies
    pub fn menu_warning(&self) -> Option<String> {
        match self.health.action.as_str() {
            "login" => Some(format!("⚠️ Login Required — {}", self.name)),
            "set_secret" => Some(format!("⚠️ Set Secret — {}", self.name)),
            "configure" => Some(format!("⚠️ Configure — {}", self.name)),
            _ => None,
        }
    }

    /// `last_error` is redundant when the action already names the remedy
    pub fn display_error(&self) -> Option<&str> {
        match self.health.action.as_str() {
            "login" | "set_secret" | "configure" => None,
            _ => self.last_error.as_deref(),
        }
    }
}

/// The whole menu model
#[derive(Debug, Default)]
pub struct ViewModel {
    servers: BTreeMap<String, ServerItem>,

    /// Names whose item changed in the last merge (repaint set)
    pub dirty: Vec<String>,
}

impl ViewModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a fresh `GET /servers` payload. Existing items are updated
    /// in place; the dirty list names exactly what changed.
    pub fn merge(&mut self, payload: &[Value]) {
        self.dirty.clear();
        let mut seen = Vec::new();

        for value in payload {
            let Ok(item) = serde_json::from_value::<ServerItem>(value.clone()) else {
                continue;
            };
            seen.push(item.name.clone());

            match self.servers.get_mut(&item.name) {
                Some(existing) => {
                    if *existing != item {
                        *existing = item.clone();
                        self.dirty.push(item.name);
                    }
                }
                None => {
                    self.dirty.push(item.name.clone());
                    self.servers.insert(item.name.clone(), item);
                }
            }
        }

        let removed: Vec<String> = self
            .servers
            .keys()
            .filter(|name| !seen.contains(name))
            .cloned()
            .collect();
        for name in removed {
            self.servers.remove(&name);
            self.dirty.push(name);
        }
    }

    /// Connected count: healthy per the calculator, nothing else
    pub fn connected_count(&self) -> usize {
        self.servers
            .values()
            .filter(|item| item.health.level == "healthy")
            .count()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ServerItem> {
        self.servers.get(name)
    }

    /// All warnings for the menu's alert section
    pub fn warnings(&self) -> Vec<String> {
        self.servers
            .values()
            .filter_map(ServerItem::menu_warning)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server(name: &str, level: &str, action: &str) -> Value {
        json!({
            "name": name,
            "enabled": true,
            "quarantined": false,
            "tool_count": 3,
            "health": {
                "level": level,
                "admin_state": "enabled",
                "summary": "s",
                "action": action
            }
        })
    }

    #[test]
    fn test_merge_tracks_dirty_set() {
        let mut model = ViewModel::new();
        model.merge(&[server("a", "healthy", ""), server("b", "degraded", "view_logs")]);
        assert_eq!(model.dirty, vec!["a", "b"]);

        // identical payload: nothing dirty
        model.merge(&[server("a", "healthy", ""), server("b", "degraded", "view_logs")]);
        assert!(model.dirty.is_empty());

        // one change: only that item repaints
        model.merge(&[server("a", "unhealthy", "login"), server("b", "degraded", "view_logs")]);
        assert_eq!(model.dirty, vec!["a"]);
    }

    #[test]
    fn test_removed_servers_leave_the_model() {
        let mut model = ViewModel::new();
        model.merge(&[server("a", "healthy", ""), server("b", "healthy", "")]);
        model.merge(&[server("a", "healthy", "")]);

        assert_eq!(model.len(), 1);
        assert!(model.get("b").is_none());
        assert!(model.dirty.contains(&"b".to_string()));
    }

    #[test]
    fn test_connected_count_uses_health_level() {
        let mut model = ViewModel::new();
        model.merge(&[
            server("a", "healthy", ""),
            server("b", "degraded", "view_logs"),
            server("c", "unhealthy", "login"),
        ]);
        assert_eq!(model.connected_count(), 1);
    }

    #[test]
    fn test_warning_lines() {
        let mut model = ViewModel::new();
        model.merge(&[
            server("a", "unhealthy", "login"),
            server("b", "unhealthy", "set_secret"),
            server("c", "healthy", ""),
        ]);
        let warnings = model.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("Login Required"));
        assert!(warnings[1].contains("Set Secret"));
    }

    #[test]
    fn test_error_suppressed_when_action_conveys_remedy() {
        let item: ServerItem = serde_json::from_value(json!({
            "name": "a",
            "last_error": "401 unauthorized",
            "health": {
                "level": "unhealthy", "admin_state": "enabled",
                "summary": "Login required", "action": "login"
            }
        }))
        .unwrap();
        assert_eq!(item.display_error(), None);

        let item: ServerItem = serde_json::from_value(json!({
            "name": "a",
            "last_error": "connection refused",
            "health": {
                "level": "unhealthy", "admin_state": "enabled",
                "summary": "error", "action": "view_logs"
            }
        }))
        .unwrap();
        assert_eq!(item.display_error(), Some("connection refused"));
    }
}
