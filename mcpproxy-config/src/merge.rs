//! Smart-merge patch engine
//!
//! Every update path (MCP tool, REST, CLI, internal) funnels through
//! [`smart_merge`]. Semantics follow RFC 7396 merge-patch: objects merge
//! deeply with `null` removing a key, scalars and arrays replace entirely.
//! `name` and `created` are immutable and any attempt to change them is
//! rejected before the merge runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::domains::upstream::UpstreamConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::validation::Validatable;

/// One modified leaf in a [`ConfigDiff`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: Value,
    pub to: Value,
}

/// Record of what a patch changed, logged and appended to the activity log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDiff {
    /// Dotted path to `{from, to}` for leaves whose value changed
    pub modified: BTreeMap<String, FieldChange>,

    /// Dotted paths introduced by the patch
    pub added: Vec<String>,

    /// Dotted paths removed by the patch (`null` in the patch body)
    pub removed: Vec<String>,

    pub timestamp: DateTime<Utc>,
}

impl ConfigDiff {
    /// Whether the patch changed anything at all
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Apply `patch` to `original` with smart-merge semantics.
///
/// Returns the merged, validated configuration together with the diff the
/// merge produced. `updated` is bumped on the result but does not appear in
/// the diff.
pub fn smart_merge(
    original: &UpstreamConfig,
    patch: &Value,
) -> ConfigResult<(UpstreamConfig, ConfigDiff)> {
    let patch_obj = patch
        .as_object()
        .ok_or_else(|| ConfigError::ValidationError("patch must be a JSON object".into()))?;

    reject_immutable(original, patch_obj)?;

    let before = serde_json::to_value(original)?;
    let mut merged_value = before.clone();
    merge_value(&mut merged_value, patch);

    let mut diff = ConfigDiff {
        modified: BTreeMap::new(),
        added: Vec::new(),
        removed: Vec::new(),
        timestamp: Utc::now(),
    };
    diff_values("", &before, &merged_value, &mut diff);
    diff.modified.remove("updated");

    let mut merged: UpstreamConfig = serde_json::from_value(merged_value)?;
    merged.updated = Utc::now();
    merged.validate()?;

    Ok((merged, diff))
}

/// Refuse patches touching `name` or `created` with a different value
fn reject_immutable(original: &UpstreamConfig, patch: &Map<String, Value>) -> ConfigResult<()> {
    if let Some(name) = patch.get("name") {
        if name.as_str() != Some(original.name.as_str()) {
            return Err(ConfigError::immutable_field("name"));
        }
    }
    if let Some(created) = patch.get("created") {
        let current = serde_json::to_value(original.created)?;
        if *created != current {
            return Err(ConfigError::immutable_field("created"));
        }
    }
    Ok(())
}

/// RFC 7396 merge-patch: objects merge recursively, `null` removes,
/// everything else (scalars and arrays alike) replaces.
fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_entry) in patch_map {
                if patch_entry.is_null() {
                    target_map.remove(key);
                } else if let Some(existing) = target_map.get_mut(key) {
                    merge_value(existing, patch_entry);
                } else {
                    target_map.insert(key.clone(), patch_entry.clone());
                }
            }
        }
        (target_slot, patch_value) => {
            *target_slot = patch_value.clone();
        }
    }
}

/// Walk both trees and record leaf-level changes under dotted paths
fn diff_values(prefix: &str, before: &Value, after: &Value, diff: &mut ConfigDiff) {
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            for (key, before_entry) in before_map {
                let path = join_path(prefix, key);
                match after_map.get(key) {
                    Some(after_entry) => diff_values(&path, before_entry, after_entry, diff),
                    None => diff.removed.push(path),
                }
            }
            for key in after_map.keys() {
                if !before_map.contains_key(key) {
                    diff.added.push(join_path(prefix, key));
                }
            }
        }
        (before_leaf, after_leaf) => {
            if before_leaf != after_leaf {
                diff.modified.insert(
                    prefix.to_string(),
                    FieldChange {
                        from: before_leaf.clone(),
                        to: after_leaf.clone(),
                    },
                );
            }
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::upstream::IsolationConfig;
    use serde_json::json;

    fn server_with_isolation() -> UpstreamConfig {
        let mut server = UpstreamConfig::new_http("gh", "https://api.github.com/mcp");
        server.isolation = Some(IsolationConfig {
            enabled: true,
            image: Some("python:3.11".into()),
            extra_args: vec!["-v".into(), "/p:/m".into()],
        });
        server
    }

    #[test]
    fn test_scalar_patch_replaces() {
        let server = server_with_isolation();
        let (merged, diff) = smart_merge(&server, &json!({"quarantined": false})).unwrap();
        assert!(!merged.quarantined);
        assert_eq!(diff.modified["quarantined"].to, json!(false));
    }

    #[test]
    fn test_patch_preserves_omitted_fields() {
        let server = server_with_isolation();
        let (merged, _) = smart_merge(&server, &json!({"quarantined": false})).unwrap();
        // isolation must come back byte-identical
        assert_eq!(merged.isolation, server.isolation);
        assert_eq!(merged.url, server.url);
        assert_eq!(merged.created, server.created);
    }

    #[test]
    fn test_map_deep_merge_and_null_removal() {
        let mut server = server_with_isolation();
        server.headers.insert("Authorization".into(), "Bearer x".into());
        server.headers.insert("X-Keep".into(), "yes".into());

        let (merged, diff) = smart_merge(
            &server,
            &json!({"headers": {"Authorization": null, "X-New": "added"}}),
        )
        .unwrap();

        assert!(!merged.headers.contains_key("Authorization"));
        assert_eq!(merged.headers["X-Keep"], "yes");
        assert_eq!(merged.headers["X-New"], "added");
        assert!(diff.removed.contains(&"headers.Authorization".to_string()));
        assert!(diff.added.contains(&"headers.X-New".to_string()));
    }

    #[test]
    fn test_arrays_replace_entirely() {
        let server = server_with_isolation();
        let (merged, _) = smart_merge(
            &server,
            &json!({"isolation": {"extra_args": ["--net=none"]}}),
        )
        .unwrap();
        assert_eq!(
            merged.isolation.unwrap().extra_args,
            vec!["--net=none".to_string()]
        );
    }

    #[test]
    fn test_nested_struct_deep_merges() {
        let server = server_with_isolation();
        let (merged, _) = smart_merge(&server, &json!({"isolation": {"enabled": false}})).unwrap();
        let isolation = merged.isolation.unwrap();
        assert!(!isolation.enabled);
        // untouched nested fields survive
        assert_eq!(isolation.image.as_deref(), Some("python:3.11"));
    }

    #[test]
    fn test_immutable_name_rejected() {
        let server = server_with_isolation();
        let err = smart_merge(&server, &json!({"name": "other"})).unwrap_err();
        assert!(matches!(err, ConfigError::ImmutableField { ref field } if field == "name"));

        // restating the current name is not a change
        assert!(smart_merge(&server, &json!({"name": "gh"})).is_ok());
    }

    #[test]
    fn test_immutable_created_rejected() {
        let server = server_with_isolation();
        let err = smart_merge(
            &server,
            &json!({"created": "2020-01-01T00:00:00Z"}),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ImmutableField { ref field } if field == "created"));
    }

    #[test]
    fn test_merged_config_is_validated() {
        let server = server_with_isolation();
        assert!(smart_merge(&server, &json!({"url": "not a url"})).is_err());
    }

    #[test]
    fn test_empty_patch_produces_empty_diff() {
        let server = server_with_isolation();
        let (_, diff) = smart_merge(&server, &json!({})).unwrap();
        assert!(diff.is_empty());
    }
}
