//! The sled-backed store and its bucket accessors

use std::path::Path;

use mcpproxy_config::UpstreamConfig;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::records::{ActivityEntry, CacheRecord, OAuthTokenRecord};

const BUCKET_UPSTREAMS: &str = "upstreams";
const BUCKET_TOKENS: &str = "oauth_tokens";
const BUCKET_ACTIVITY: &str = "activity";
const BUCKET_CACHE: &str = "cache";

/// Handle over the embedded database. Cheap to clone; sled trees are
/// internally reference counted.
#[derive(Clone)]
pub struct ProxyStore {
    upstreams: sled::Tree,
    tokens: sled::Tree,
    activity: sled::Tree,
    cache: sled::Tree,
    db: sled::Db,
}

impl ProxyStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            upstreams: db.open_tree(BUCKET_UPSTREAMS)?,
            tokens: db.open_tree(BUCKET_TOKENS)?,
            activity: db.open_tree(BUCKET_ACTIVITY)?,
            cache: db.open_tree(BUCKET_CACHE)?,
            db,
        })
    }

    /// Open a throwaway in-memory store (tests)
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            upstreams: db.open_tree(BUCKET_UPSTREAMS)?,
            tokens: db.open_tree(BUCKET_TOKENS)?,
            activity: db.open_tree(BUCKET_ACTIVITY)?,
            cache: db.open_tree(BUCKET_CACHE)?,
            db,
        })
    }

    /// Flush all dirty buffers to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // === upstreams bucket ===
    //
    // The full UpstreamConfig round-trips through this bucket; a field
    // missing here would silently drop user configuration.

    pub fn put_upstream(&self, config: &UpstreamConfig) -> StorageResult<()> {
        let bytes = serde_json::to_vec(config)?;
        self.upstreams.insert(config.name.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_upstream(&self, name: &str) -> StorageResult<UpstreamConfig> {
        let bytes = self
            .upstreams
            .get(name.as_bytes())?
            .ok_or_else(|| StorageError::not_found(BUCKET_UPSTREAMS, name))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::corruption(BUCKET_UPSTREAMS, name, e.to_string()))
    }

    pub fn delete_upstream(&self, name: &str) -> StorageResult<bool> {
        Ok(self.upstreams.remove(name.as_bytes())?.is_some())
    }

    pub fn list_upstreams(&self) -> StorageResult<Vec<UpstreamConfig>> {
        let mut configs = Vec::new();
        for entry in self.upstreams.iter() {
            let (key, bytes) = entry?;
            let name = String::from_utf8_lossy(&key).to_string();
            let config = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::corruption(BUCKET_UPSTREAMS, name, e.to_string()))?;
            configs.push(config);
        }
        Ok(configs)
    }

    // === oauth_tokens bucket ===

    pub fn put_token(&self, record: &OAuthTokenRecord) -> StorageResult<()> {
        let key = OAuthTokenRecord::key_for(&record.server_name);
        let bytes = serde_json::to_vec(record)?;
        self.tokens.insert(key.as_bytes(), bytes)?;
        debug!(server = %record.server_name, "token persisted");
        Ok(())
    }

    pub fn get_token(&self, server_name: &str) -> StorageResult<Option<OAuthTokenRecord>> {
        let key = OAuthTokenRecord::key_for(server_name);
        match self.tokens.get(key.as_bytes())? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::corruption(BUCKET_TOKENS, server_name, e.to_string())
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn delete_token(&self, server_name: &str) -> StorageResult<bool> {
        let key = OAuthTokenRecord::key_for(server_name);
        Ok(self.tokens.remove(key.as_bytes())?.is_some())
    }

    pub fn list_tokens(&self) -> StorageResult<Vec<OAuthTokenRecord>> {
        let mut records = Vec::new();
        for entry in self.tokens.iter() {
            let (key, bytes) = entry?;
            let key = String::from_utf8_lossy(&key).to_string();
            let record = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::corruption(BUCKET_TOKENS, key, e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    // === activity bucket ===

    /// Append an entry, assign its monotonic ID and prune beyond
    /// `retention` entries
    pub fn append_activity(
        &self,
        mut entry: ActivityEntry,
        retention: usize,
    ) -> StorageResult<ActivityEntry> {
        let id = self.db.generate_id()?;
        entry.id = id;
        let bytes = serde_json::to_vec(&entry)?;
        self.activity.insert(id.to_be_bytes(), bytes)?;

        // Big-endian keys iterate oldest-first, so pruning pops the front
        while self.activity.len() > retention {
            if self.activity.pop_min()?.is_none() {
                break;
            }
        }

        Ok(entry)
    }

    /// Most recent entries, newest first
    pub fn recent_activity(&self, limit: usize) -> StorageResult<Vec<ActivityEntry>> {
        let mut entries = Vec::new();
        for item in self.activity.iter().rev().take(limit) {
            let (key, bytes) = item?;
            let key = u64::from_be_bytes(key.as_ref().try_into().unwrap_or_default());
            let entry = serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::corruption(BUCKET_ACTIVITY, key.to_string(), e.to_string())
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    // === cache bucket ===

    pub fn cache_put(&self, record: &CacheRecord) -> StorageResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.cache.insert(record.fingerprint.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn cache_get(&self, fingerprint: &str) -> StorageResult<Option<CacheRecord>> {
        match self.cache.get(fingerprint.as_bytes())? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::corruption(BUCKET_CACHE, fingerprint, e.to_string())
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn cache_delete(&self, fingerprint: &str) -> StorageResult<bool> {
        Ok(self.cache.remove(fingerprint.as_bytes())?.is_some())
    }
}
