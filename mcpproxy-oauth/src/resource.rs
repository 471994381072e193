//! RFC 8707 resource parameter selection and extra-param merging

use std::collections::BTreeMap;
use std::collections::HashMap;

/// Pick the `resource` value injected into authorization and token
/// requests. Priority:
///
/// 1. a manual `extra_params.resource` override,
/// 2. the `resource` from the protected-resource metadata,
/// 3. the configured server URL as the final fallback.
pub fn select_resource(
    manual_extra_params: &HashMap<String, String>,
    metadata_resource: Option<&str>,
    server_url: &str,
) -> String {
    if let Some(manual) = manual_extra_params.get("resource") {
        return manual.clone();
    }
    if let Some(resource) = metadata_resource {
        if !resource.is_empty() {
            return resource.to_string();
        }
    }
    server_url.to_string()
}

/// Merge auto-detected parameters with the user's manual `extra_params`.
/// Manual entries win per key. The result is ordered for deterministic
/// URLs.
pub fn merge_extra_params(
    auto: &[(String, String)],
    manual: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = auto.iter().cloned().collect();
    for (key, value) in manual {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_resource_wins() {
        let manual = HashMap::from([("resource".to_string(), "https://manual".to_string())]);
        assert_eq!(
            select_resource(&manual, Some("https://metadata"), "https://server"),
            "https://manual"
        );
    }

    #[test]
    fn test_metadata_resource_second() {
        assert_eq!(
            select_resource(&HashMap::new(), Some("https://metadata"), "https://server"),
            "https://metadata"
        );
    }

    #[test]
    fn test_server_url_fallback() {
        assert_eq!(
            select_resource(&HashMap::new(), None, "https://server"),
            "https://server"
        );
        assert_eq!(
            select_resource(&HashMap::new(), Some(""), "https://server"),
            "https://server"
        );
    }

    #[test]
    fn test_manual_params_merge_over_auto() {
        let auto = vec![
            ("resource".to_string(), "https://auto".to_string()),
            ("audience".to_string(), "mcp".to_string()),
        ];
        let manual = HashMap::from([
            ("resource".to_string(), "https://manual".to_string()),
            ("prompt".to_string(), "consent".to_string()),
        ]);

        let merged = merge_extra_params(&auto, &manual);
        assert_eq!(merged["resource"], "https://manual");
        assert_eq!(merged["audience"], "mcp");
        assert_eq!(merged["prompt"], "consent");
    }
}
