//! Store error types.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection could not be established or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A connect or command deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// The store rejected a command.
    #[error("Command error: {0}")]
    Command(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key or identifier failed validation before reaching the store.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying Redis error that is not transport related.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(redis::RedisError),
}

impl StoreError {
    /// Whether this error means the dependency itself is unhealthy.
    ///
    /// Transport errors count against the connector's circuit breaker; command
    /// errors (wrong type, bad arguments) do not.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }

    /// Whether this error was raised before any store call was made.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidKey(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Connection(err.to_string())
        } else {
            Self::Redis(err)
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
