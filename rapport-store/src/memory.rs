//! In-process fallback tier.
//!
//! Uses DashMap for thread-safe concurrent access. Expiry is enforced by
//! filtering on read; a sweep amortized over writes keeps abandoned keys from
//! accumulating. State is process-local and is lost on restart.

use crate::error::Result;
use crate::traits::{KeyValueStore, WindowHit, event_member, window_start};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Writes between two lazy sweeps.
const SWEEP_INTERVAL: u64 = 512;

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct SetEntry {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct WindowLog {
    /// `(timestamp_ms, member)`, ordered by timestamp.
    events: VecDeque<(u64, String)>,
    expires_at: Option<Instant>,
}

impl WindowLog {
    fn prune(&mut self, cutoff_ms: u64) {
        while let Some((ms, _)) = self.events.front() {
            if *ms < cutoff_ms {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

fn live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.is_none_or(|exp| exp > now)
}

fn remaining(expires_at: Option<Instant>, now: Instant) -> Option<Duration> {
    expires_at.and_then(|exp| exp.checked_duration_since(now))
}

/// In-memory store with the same semantics as the shared tier.
pub struct MemoryStore {
    values: DashMap<String, ValueEntry>,
    sets: DashMap<String, SetEntry>,
    windows: DashMap<String, WindowLog>,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        debug!("Creating in-memory fallback store");
        Self {
            values: DashMap::new(),
            sets: DashMap::new(),
            windows: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of tracked keys, expired ones included until the next sweep.
    pub fn key_count(&self) -> usize {
        self.values.len() + self.sets.len() + self.windows.len()
    }

    /// Drop every expired key.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.values.retain(|_, e| live(e.expires_at, now));
        self.sets.retain(|_, s| live(s.expires_at, now) && !s.members.is_empty());
        self.windows
            .retain(|_, w| live(w.expires_at, now) && !w.events.is_empty());
        trace!(key_count = self.key_count(), "Fallback store swept");
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.values.clear();
        self.sets.clear();
        self.windows.clear();
    }

    /// Must be called with no map guard held.
    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            self.sweep();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.values.get(key) {
            if live(entry.expires_at, now) {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }

        self.values.remove_if(key, |_, e| !live(e.expires_at, now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.values
            .insert(key.to_string(), ValueEntry { value, expires_at });
        self.after_write();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let value = self
            .values
            .remove(key)
            .is_some_and(|(_, e)| live(e.expires_at, now));
        let set = self
            .sets
            .remove(key)
            .is_some_and(|(_, s)| live(s.expires_at, now));
        let window = self
            .windows
            .remove(key)
            .is_some_and(|(_, w)| live(w.expires_at, now));
        Ok(value || set || window)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let found = self
            .values
            .get(key)
            .is_some_and(|e| live(e.expires_at, now))
            || self
                .sets
                .get(key)
                .is_some_and(|s| live(s.expires_at, now) && !s.members.is_empty())
            || self
                .windows
                .get(key)
                .is_some_and(|w| live(w.expires_at, now) && !w.events.is_empty());
        Ok(found)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let expires_at = Some(now + ttl);

        if let Some(mut entry) = self.values.get_mut(key)
            && live(entry.expires_at, now)
        {
            entry.expires_at = expires_at;
            return Ok(true);
        }
        if let Some(mut set) = self.sets.get_mut(key)
            && live(set.expires_at, now)
        {
            set.expires_at = expires_at;
            return Ok(true);
        }
        if let Some(mut log) = self.windows.get_mut(key)
            && live(log.expires_at, now)
        {
            log.expires_at = expires_at;
            return Ok(true);
        }
        Ok(false)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        if let Some(entry) = self.values.get(key)
            && live(entry.expires_at, now)
        {
            return Ok(remaining(entry.expires_at, now));
        }
        if let Some(set) = self.sets.get(key)
            && live(set.expires_at, now)
            && !set.members.is_empty()
        {
            return Ok(remaining(set.expires_at, now));
        }
        if let Some(log) = self.windows.get(key)
            && live(log.expires_at, now)
            && !log.events.is_empty()
        {
            return Ok(remaining(log.expires_at, now));
        }
        Ok(None)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn set_many(&self, items: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        for (key, value) in items {
            self.set(key, value.clone(), ttl).await?;
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let now = Instant::now();
        let mut removed = 0u64;
        self.values.retain(|k, e| {
            let matched = k.starts_with(prefix);
            removed += (matched && live(e.expires_at, now)) as u64;
            !matched
        });
        self.sets.retain(|k, s| {
            let matched = k.starts_with(prefix);
            removed += (matched && live(s.expires_at, now) && !s.members.is_empty()) as u64;
            !matched
        });
        self.windows.retain(|k, w| {
            let matched = k.starts_with(prefix);
            removed += (matched && live(w.expires_at, now) && !w.events.is_empty()) as u64;
            !matched
        });
        debug!(prefix = %prefix, removed, "Deleted keys by prefix in fallback store");
        Ok(removed)
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        {
            let mut set = self.sets.entry(key.to_string()).or_default();
            let fresh = set.members.is_empty() || !live(set.expires_at, now);
            if fresh {
                set.members.clear();
            }

            set.expires_at = match (ttl, fresh, set.expires_at) {
                (None, _, _) => None,
                (Some(ttl), true, _) => Some(now + ttl),
                (Some(_), false, None) => None,
                (Some(ttl), false, Some(current)) => Some(current.max(now + ttl)),
            };
            set.members.extend(members.iter().cloned());
        }
        self.after_write();
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .sets
            .get(key)
            .filter(|s| live(s.expires_at, now))
            .map(|s| s.members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn window_hit(&self, key: &str, now_ms: u64, window: Duration) -> Result<WindowHit> {
        let cutoff = window_start(now_ms, window);
        let member = event_member(now_ms);

        let hit = {
            let mut log = self.windows.entry(key.to_string()).or_default();
            if !live(log.expires_at, Instant::now()) {
                log.events.clear();
            }
            log.prune(cutoff);

            let pos = log.events.partition_point(|(ms, _)| *ms <= now_ms);
            log.events.insert(pos, (now_ms, member.clone()));
            log.expires_at = Some(Instant::now() + window);

            WindowHit {
                count: log.events.len() as u64,
                oldest_ms: log.events.front().map(|(ms, _)| *ms).unwrap_or(now_ms),
                member,
            }
        };

        trace!(key = %key, count = hit.count, "Fallback window hit");
        self.after_write();
        Ok(hit)
    }

    async fn window_count(&self, key: &str, since_ms: u64) -> Result<u64> {
        let now = Instant::now();
        Ok(self
            .windows
            .get(key)
            .filter(|w| live(w.expires_at, now))
            .map(|w| w.events.iter().filter(|(ms, _)| *ms >= since_ms).count() as u64)
            .unwrap_or(0))
    }

    async fn window_remove(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.windows.get_mut(key).is_some_and(|mut log| {
            let before = log.events.len();
            log.events.retain(|(_, m)| m != member);
            log.events.len() != before
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
