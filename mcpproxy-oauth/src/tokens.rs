//! Token persistence with the expiry grace period
//!
//! Reads surface `expires_at` lowered by the configured grace, so a token
//! about to lapse already reads as expired and consumers refresh
//! preemptively instead of racing the real deadline.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use mcpproxy_storage::{OAuthTokenRecord, ProxyStore, StorageResult};
use tracing::debug;

/// A token as consumers see it, grace already applied
#[derive(Debug, Clone, PartialEq)]
pub struct TokenState {
    pub record: OAuthTokenRecord,

    /// Expiry after the grace subtraction
    pub effective_expires_at: DateTime<Utc>,

    /// Whether the access token should be treated as expired right now
    pub access_expired: bool,

    /// Whether a refresh token is available
    pub can_refresh: bool,
}

/// Store facade over the `oauth_tokens` bucket
#[derive(Clone)]
pub struct TokenStore {
    store: ProxyStore,
    grace: Duration,
}

impl TokenStore {
    pub fn new(store: ProxyStore, grace: Duration) -> Self {
        Self { store, grace }
    }

    /// Read a server's token, applying the grace period
    pub fn get(&self, server_name: &str) -> StorageResult<Option<TokenState>> {
        let Some(record) = self.store.get_token(server_name)? else {
            return Ok(None);
        };
        Ok(Some(self.state_of(record)))
    }

    /// Persist a token (insert or replace)
    pub fn save(&self, record: &OAuthTokenRecord) -> StorageResult<()> {
        self.store.put_token(record)?;
        debug!(server = %record.server_name, expires_at = %record.expires_at, "token saved");
        Ok(())
    }

    /// Drop a server's token (logout)
    pub fn delete(&self, server_name: &str) -> StorageResult<bool> {
        self.store.delete_token(server_name)
    }

    /// All persisted tokens with grace applied
    pub fn list(&self) -> StorageResult<Vec<TokenState>> {
        Ok(self
            .store
            .list_tokens()?
            .into_iter()
            .map(|record| self.state_of(record))
            .collect())
    }

    fn state_of(&self, record: OAuthTokenRecord) -> TokenState {
        let grace = ChronoDuration::from_std(self.grace).unwrap_or_else(|_| ChronoDuration::zero());
        let effective = record.expires_at - grace;
        TokenState {
            access_expired: effective <= Utc::now(),
            can_refresh: record.refresh_token.is_some(),
            effective_expires_at: effective,
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_in: ChronoDuration, refresh: bool) -> OAuthTokenRecord {
        OAuthTokenRecord {
            server_name: "gh".into(),
            display_name: "gh".into(),
            access_token: "at".into(),
            refresh_token: refresh.then(|| "rt".to_string()),
            token_type: "Bearer".into(),
            expires_at: Utc::now() + expires_in,
            scopes: vec![],
            client_id: "cid".into(),
            client_secret: None,
            token_endpoint: None,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    fn store() -> TokenStore {
        TokenStore::new(
            ProxyStore::open_temporary().unwrap(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_token_within_grace_reads_expired() {
        let store = store();
        // expires in 30s, grace is 60s: already effectively expired
        store.save(&record(ChronoDuration::seconds(30), true)).unwrap();

        let state = store.get("gh").unwrap().unwrap();
        assert!(state.access_expired);
        assert!(state.can_refresh);
    }

    #[test]
    fn test_token_outside_grace_reads_valid() {
        let store = store();
        store.save(&record(ChronoDuration::seconds(3600), false)).unwrap();

        let state = store.get("gh").unwrap().unwrap();
        assert!(!state.access_expired);
        assert!(!state.can_refresh);
    }

    #[test]
    fn test_delete_is_logout() {
        let store = store();
        store.save(&record(ChronoDuration::seconds(3600), true)).unwrap();
        assert!(store.delete("gh").unwrap());
        assert!(store.get("gh").unwrap().is_none());
        assert!(!store.delete("gh").unwrap());
    }
}
