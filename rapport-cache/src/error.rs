//! Error types for cache operations.
//!
//! Store failures never reach callers of [`Cache`](crate::Cache) reads and
//! writes; they become misses. What is left are caller mistakes.

use rapport_store::StoreError;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Key or tag rejected before reaching the store.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Value could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store error surfaced at initialization.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CacheError {
    pub(crate) fn from_key_error(err: StoreError) -> Self {
        match err {
            StoreError::InvalidKey(msg) => Self::InvalidKey(msg),
            other => Self::Store(other),
        }
    }
}
