//! Masking of sensitive argument and environment values before logging

/// Key substrings that mark a value as sensitive
const SENSITIVE_KEY_PARTS: &[&str] = &["key", "secret", "token", "password"];

/// Whether a key names something that must never be logged verbatim
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lowered.contains(part))
}

/// Mask a sensitive value: `aaaa****zzzz` keeping four characters of each
/// end, or `****` outright when the value is shorter than 8 characters
pub fn mask_value(value: &str) -> String {
    if value.len() < 8 {
        return "****".to_string();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Mask `value` when `key` is sensitive, pass it through otherwise
pub fn mask_pair(key: &str, value: &str) -> String {
    if is_sensitive_key(key) {
        mask_value(value)
    } else {
        value.to_string()
    }
}

/// Render an env map for logging with sensitive values masked
pub fn masked_env(env: &std::collections::HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = env
        .iter()
        .map(|(key, value)| (key.clone(), mask_pair(key, value)))
        .collect();
    pairs.sort();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_key_detection() {
        assert!(is_sensitive_key("GITHUB_TOKEN"));
        assert!(is_sensitive_key("api_key"));
        assert!(is_sensitive_key("CLIENT_SECRET"));
        assert!(is_sensitive_key("DbPassword"));
        assert!(!is_sensitive_key("WORKDIR"));
        assert!(!is_sensitive_key("PORT"));
    }

    #[test]
    fn test_mask_shape() {
        assert_eq!(mask_value("abcdefghijkl"), "abcd****ijkl");
        assert_eq!(mask_value("12345678"), "1234****5678");
        assert_eq!(mask_value("short"), "****");
        assert_eq!(mask_value(""), "****");
    }

    #[test]
    fn test_pair_masking_only_for_sensitive_keys() {
        assert_eq!(mask_pair("API_TOKEN", "abcdefghijkl"), "abcd****ijkl");
        assert_eq!(mask_pair("HOME", "/home/user"), "/home/user");
    }
}
