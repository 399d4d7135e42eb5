//! Store trait definition.

use crate::error::Result;
use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Result of recording one event in a sliding window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowHit {
    /// Events inside the window, including the one just recorded.
    pub count: u64,
    /// Timestamp (Unix millis) of the oldest event still inside the window.
    pub oldest_ms: u64,
    /// Member recorded for this event; pass to `window_remove` to undo it.
    pub member: String,
}

/// Primitive keyed operations that both tiers provide.
///
/// The shared Redis tier and the in-process fallback implement the same
/// contract, so consumers pick a tier per call and then speak one language.
/// Expiry is always passive: entries past their TTL read as absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a value.
    ///
    /// Returns `Ok(None)` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, replacing any previous one.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key of any kind. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Set or refresh the expiry of a key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time-to-live, `None` when absent or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Get several values in one round trip, in input order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Set several values with a common TTL in one round trip.
    async fn set_many(&self, items: &[(String, String)], ttl: Option<Duration>) -> Result<()>;

    /// Delete several keys. Returns how many were removed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64>;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Add members to a set.
    ///
    /// The set's expiry only ever grows: it is extended to `ttl` when that is
    /// longer than what remains, and made persistent when `ttl` is `None`.
    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()>;

    /// All members of a set; empty when absent.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically drop events older than `now_ms - window`, record one event at
    /// `now_ms`, and report the resulting count.
    ///
    /// The key expires `window` after its latest event.
    async fn window_hit(&self, key: &str, now_ms: u64, window: Duration) -> Result<WindowHit>;

    /// Count events with timestamp `>= since_ms` without recording anything.
    async fn window_count(&self, key: &str, since_ms: u64) -> Result<u64>;

    /// Remove one previously recorded event.
    async fn window_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Round-trip health check.
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Current wall-clock time in Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unique member for a window event: `<ms>-<nonce>`.
///
/// The nonce keeps simultaneous events from different callers distinct in an
/// ordered set keyed by timestamp.
pub fn event_member(now_ms: u64) -> String {
    format!("{}-{:016x}", now_ms, rand::random::<u64>())
}

/// Timestamp encoded in an event member, if well formed.
pub fn member_timestamp(member: &str) -> Option<u64> {
    member.split_once('-').and_then(|(ms, _)| ms.parse().ok())
}

/// Earliest timestamp still inside a window ending at `now_ms`.
pub fn window_start(now_ms: u64, window: Duration) -> u64 {
    now_ms.saturating_sub(window.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_member_roundtrip() {
        let member = event_member(1_700_000_000_123);
        assert_eq!(member_timestamp(&member), Some(1_700_000_000_123));
        assert_ne!(event_member(5), event_member(5));
    }

    #[test]
    fn test_member_timestamp_malformed() {
        assert_eq!(member_timestamp("garbage"), None);
        assert_eq!(member_timestamp("abc-123"), None);
    }

    #[test]
    fn test_window_start_saturates() {
        assert_eq!(window_start(1_000, Duration::from_secs(60)), 0);
        assert_eq!(window_start(61_000, Duration::from_secs(60)), 1_000);
    }
}
