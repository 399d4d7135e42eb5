//! Error types for rate limiting

use rapport_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Result type for rate limiting operations
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Rate limiting errors
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Rate limit exceeded
    #[error("Rate limit exceeded. Retry after {} seconds", retry_after_secs(.retry_after))]
    LimitExceeded {
        /// Remaining requests (always 0 when limit exceeded)
        remaining: u64,
        /// Total limit
        limit: u64,
        /// When the limit resets (Unix timestamp in seconds)
        reset_at: u64,
        /// Time to wait before retrying
        retry_after: Duration,
    },

    /// Neither tier could record the event
    #[error("Rate limit store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Rate limit configuration error: {0}")]
    Config(String),

    /// Key rejected before reaching the store
    #[error("Invalid rate limit key: {0}")]
    InvalidKey(String),
}

/// Whole seconds a client should wait, rounded up and never zero.
pub(crate) fn retry_after_secs(retry_after: &Duration) -> u64 {
    let ms = retry_after.as_millis() as u64;
    ms.div_ceil(1000).max(1)
}

impl RateLimitError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a limit exceeded error
    pub fn limit_exceeded(limit: u64, reset_at: u64, retry_after: Duration) -> Self {
        Self::LimitExceeded {
            remaining: 0,
            limit,
            reset_at,
            retry_after,
        }
    }

    /// Check if this error is a rate limit exceeded error
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::LimitExceeded { .. })
    }

    /// Get the retry-after duration if this is a limit exceeded error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::LimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// HTTP status a handler should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::LimitExceeded { .. } => 429,
            Self::InvalidKey(_) => 400,
            Self::Store(_) => 503,
            Self::Config(_) => 500,
        }
    }

    /// Get rate limit headers for HTTP response
    pub fn headers(&self) -> Option<RateLimitHeaders> {
        match self {
            Self::LimitExceeded {
                limit,
                reset_at,
                retry_after,
                ..
            } => Some(RateLimitHeaders::denied(
                *limit,
                *reset_at,
                retry_after_secs(retry_after),
            )),
            _ => None,
        }
    }
}

/// Standard rate limit headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// X-RateLimit-Limit: Maximum requests allowed
    pub limit: u64,
    /// X-RateLimit-Remaining: Requests remaining in current window
    pub remaining: u64,
    /// X-RateLimit-Reset: Unix timestamp when the limit resets
    pub reset: u64,
    /// Retry-After: Seconds until the client should retry (only when limited)
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Create headers for an allowed request
    pub fn allowed(limit: u64, remaining: u64, reset: u64) -> Self {
        Self {
            limit,
            remaining,
            reset,
            retry_after: None,
        }
    }

    /// Create headers for a denied request
    pub fn denied(limit: u64, reset: u64, retry_after: u64) -> Self {
        Self {
            limit,
            remaining: 0,
            reset,
            retry_after: Some(retry_after),
        }
    }

    /// Get header name/value pairs
    pub fn to_header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ];

        if let Some(retry) = self.retry_after {
            headers.push(("Retry-After", retry.to_string()));
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_error() {
        let error = RateLimitError::limit_exceeded(5, 1_700_000_060, Duration::from_millis(59_200));

        assert!(error.is_limit_exceeded());
        assert_eq!(error.status_code(), 429);
        assert_eq!(error.retry_after(), Some(Duration::from_millis(59_200)));
        assert_eq!(error.to_string(), "Rate limit exceeded. Retry after 60 seconds");

        let headers = error.headers().unwrap();
        assert_eq!(headers.limit, 5);
        assert_eq!(headers.remaining, 0);
        assert_eq!(headers.reset, 1_700_000_060);
        assert_eq!(headers.retry_after, Some(60));
    }

    #[test]
    fn test_retry_after_never_zero() {
        assert_eq!(retry_after_secs(&Duration::ZERO), 1);
        assert_eq!(retry_after_secs(&Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(&Duration::from_millis(1001)), 2);
    }

    #[test]
    fn test_store_error() {
        let error = RateLimitError::from(StoreError::Timeout);
        assert!(!error.is_limit_exceeded());
        assert_eq!(error.retry_after(), None);
        assert!(error.headers().is_none());
        assert_eq!(error.status_code(), 503);
    }

    #[test]
    fn test_headers_to_pairs() {
        let headers = RateLimitHeaders::denied(100, 1234567890, 30);
        let pairs = headers.to_header_pairs();

        assert_eq!(pairs.len(), 4);
        assert!(
            pairs
                .iter()
                .any(|(k, v)| *k == "X-RateLimit-Limit" && v == "100")
        );
        assert!(
            pairs
                .iter()
                .any(|(k, v)| *k == "X-RateLimit-Remaining" && v == "0")
        );
        assert!(pairs.iter().any(|(k, v)| *k == "Retry-After" && v == "30"));

        let pairs = RateLimitHeaders::allowed(100, 99, 1234567890).to_header_pairs();
        assert_eq!(pairs.len(), 3);
    }
}
