use rapport_cache::CacheError;
use rapport_csrf::CsrfError;
use rapport_ratelimit::RateLimitError;
use rapport_store::StoreError;
use thiserror::Error;

/// Result type for state layer setup.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised while building or installing a [`StateLayer`](crate::StateLayer).
///
/// Request-time failures never surface here; each component absorbs them.
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Csrf(#[from] CsrfError),

    #[error("Global state layer already initialized")]
    AlreadyInitialized,

    #[error("Global state layer not initialized")]
    NotInitialized,
}
