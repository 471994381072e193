//! Storage error types

use thiserror::Error;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Key not present in the bucket
    #[error("Not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Write conflicted with a concurrent update
    #[error("Conflict writing {bucket}/{key}")]
    Conflict { bucket: String, key: String },

    /// Stored bytes failed to decode
    #[error("Corrupt record in {bucket}/{key}: {details}")]
    Corruption {
        bucket: String,
        key: String,
        details: String,
    },

    /// Backend failure
    #[error("Storage backend error: {0}")]
    Backend(#[from] sled::Error),

    /// Encoding failure before the write
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn corruption(
        bucket: impl Into<String>,
        key: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::Corruption {
            bucket: bucket.into(),
            key: key.into(),
            details: details.into(),
        }
    }
}
