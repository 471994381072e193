//! Fingerprinted response cache with per-key single flight
//!
//! Cache keys are stable fingerprints over `(server, tool, canonical JSON
//! arguments)`. Concurrent callers for the same fingerprint share one
//! in-flight computation; eviction is LRU with a configured bound. Hits
//! and entries are mirrored into the storage layer's `cache` bucket so a
//! restart starts warm.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use mcpproxy_storage::{CacheRecord, ProxyStore};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::error::IndexResult;

/// Render a JSON value with all object keys sorted, recursively
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string encodes"));
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Stable cache key over server, tool and canonicalized arguments
pub fn fingerprint(server: &str, tool: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server.as_bytes());
    hasher.update([0]);
    hasher.update(tool.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_json(arguments).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

type InflightCell = Arc<OnceCell<Value>>;

/// The cache. One instance serves the whole proxy.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, Value>>,

    /// Fingerprint to the shared in-flight computation
    inflight: Mutex<HashMap<String, InflightCell>>,

    /// Write-through persistence, when configured
    store: Option<ProxyStore>,
}

impl ResponseCache {
    pub fn new(capacity: usize, store: Option<ProxyStore>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Cached value for a fingerprint, consulting memory then the bucket
    pub async fn get(&self, fingerprint: &str) -> Option<Value> {
        if let Some(value) = self.entries.lock().await.get(fingerprint) {
            return Some(value.clone());
        }
        if let Some(store) = &self.store {
            if let Ok(Some(record)) = store.cache_get(fingerprint) {
                self.entries
                    .lock()
                    .await
                    .put(fingerprint.to_string(), record.value.clone());
                return Some(record.value);
            }
        }
        None
    }

    /// Fetch through the cache. At most one `compute` runs per fingerprint
    /// at a time; concurrent callers await the same in-flight future.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        compute: F,
    ) -> IndexResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = IndexResult<Value>>,
    {
        if let Some(hit) = self.get(fingerprint).await {
            debug!(fingerprint = %fingerprint, "response cache hit");
            return Ok(hit);
        }

        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                let value = compute().await?;
                self.insert(fingerprint, value.clone()).await;
                Ok::<Value, crate::error::IndexError>(value)
            })
            .await
            .cloned();

        // Whoever finishes last simply re-removes; harmless
        self.inflight.lock().await.remove(fingerprint);

        result
    }

    /// Insert a computed value, mirroring it into the bucket
    pub async fn insert(&self, fingerprint: &str, value: Value) {
        self.entries
            .lock()
            .await
            .put(fingerprint.to_string(), value.clone());

        if let Some(store) = &self.store {
            let record = CacheRecord {
                fingerprint: fingerprint.to_string(),
                value,
                created: chrono::Utc::now(),
            };
            if let Err(e) = store.cache_put(&record) {
                warn!(error = %e, "failed to persist cache entry");
            }
        }
    }

    /// Number of in-memory entries
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"d": 2, "c": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"c": 3, "d": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_fingerprint_stability() {
        let args1 = json!({"x": 1, "y": 2});
        let args2 = json!({"y": 2, "x": 1});
        assert_eq!(
            fingerprint("gh", "search", &args1),
            fingerprint("gh", "search", &args2)
        );
        assert_ne!(
            fingerprint("gh", "search", &args1),
            fingerprint("gh", "other", &args1)
        );
        assert_ne!(
            fingerprint("gh", "search", &args1),
            fingerprint("docs", "search", &args1)
        );
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_compute_once() {
        let cache = Arc::new(ResponseCache::new(16, None));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = fingerprint("gh", "search", &json!({"q": "rust"}));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(json!({"answer": 42}))
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!({"answer": 42}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = ResponseCache::new(2, None);
        cache.insert("a", json!(1)).await;
        cache.insert("b", json!(2)).await;
        cache.insert("c", json!(3)).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.get("c").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_write_through_persistence_survives_memory_loss() {
        let store = ProxyStore::open_temporary().unwrap();
        let cache = ResponseCache::new(4, Some(store.clone()));
        cache.insert("fp", json!({"v": 1})).await;

        // a fresh cache over the same store warms from the bucket
        let rebuilt = ResponseCache::new(4, Some(store));
        assert_eq!(rebuilt.get("fp").await, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_failed_compute_is_not_cached() {
        let cache = ResponseCache::new(4, None);
        let key = "fp";

        let err = cache
            .get_or_compute(key, || async {
                Err(crate::error::IndexError::ToolNotFound { name: "x".into() })
            })
            .await;
        assert!(err.is_err());

        // a later compute runs again and succeeds
        let ok = cache
            .get_or_compute(key, || async { Ok(json!(7)) })
            .await
            .unwrap();
        assert_eq!(ok, json!(7));
    }
}
