//! Embedded storage layer for MCPProxy
//!
//! A single sled database (`~/.mcpproxy/config.db`) with one tree per
//! bucket: `upstreams`, `oauth_tokens`, `activity`, `cache`. Values are
//! serde-JSON encoded records. sled serializes writers internally; readers
//! observe point-in-time snapshots of each key.

pub mod error;
pub mod records;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use records::{
    ActivityEntry, ActivityKind, ActivitySource, ActivityStatus, CacheRecord, OAuthTokenRecord,
};
pub use store::ProxyStore;
