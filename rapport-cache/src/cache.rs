//! Typed cache over the dual-tier store.

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::stats::{CacheStats, CacheStatsSnapshot};
use rapport_store::{DualTier, Route, StoreError, validate_key};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Response cache with tag invalidation.
///
/// Each operation runs against whichever tier the connector hands out for
/// that call. Store failures are absorbed: reads become misses, writes become
/// no-ops, and both are counted in [`CacheStats`]. Only caller mistakes
/// (malformed keys, unserializable values) come back as errors.
///
/// Outside production the cache is inert: every read misses and every write is
/// dropped.
#[derive(Clone)]
pub struct Cache {
    tiers: DualTier,
    config: Arc<CacheConfig>,
    stats: Arc<CacheStats>,
}

impl Cache {
    /// Create a cache over `tiers`.
    pub fn new(tiers: DualTier, config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        debug!(
            prefix = %config.key_prefix,
            default_ttl = ?config.default_ttl,
            enabled = config.enabled(),
            "Cache initialized"
        );

        Ok(Self {
            tiers,
            config: Arc::new(config),
            stats: Arc::new(CacheStats::default()),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether reads and writes reach the store.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled()
    }

    /// Copy of the counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero the counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// A cache whose keys live under `<prefix>:<namespace>`.
    ///
    /// Shares tiers and counters with `self`.
    pub fn namespace(&self, namespace: &str) -> CacheResult<Self> {
        validate_entry_key(namespace)?;
        let config = CacheConfig {
            key_prefix: self.config.build_key(namespace),
            ..(*self.config).clone()
        };

        Ok(Self {
            tiers: self.tiers.clone(),
            config: Arc::new(config),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Get a typed value.
    ///
    /// Returns `Ok(None)` on a miss, on a store failure, and for entries that
    /// no longer decode as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let full_key = self.full_key(key)?;
        if !self.is_enabled() {
            return Ok(None);
        }

        let route = self.route().await;
        let found = match route.store().get(&full_key).await {
            Ok(found) => found,
            Err(err) => {
                self.absorb(&route, "get", key, &err);
                self.stats.miss();
                return Ok(None);
            }
        };

        match found.map(|json| self.decode::<T>(key, &json)) {
            Some(Some(value)) => {
                self.stats.hit();
                trace!(key = %key, tier = %route.tier(), "Cache hit");
                Ok(Some(value))
            }
            _ => {
                self.stats.miss();
                trace!(key = %key, tier = %route.tier(), "Cache miss");
                Ok(None)
            }
        }
    }

    /// Store a value and index it under `tags`.
    ///
    /// `ttl` falls back to the configured default. Tag indexing is best effort:
    /// a failed index update leaves the entry to expire on its own.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<()> {
        let full_key = self.full_key(key)?;
        validate_tags(tags)?;
        let json = encode(value)?;
        if !self.is_enabled() {
            return Ok(());
        }

        let ttl = ttl.or(self.config.default_ttl);
        let route = self.route().await;

        if let Err(err) = route.store().set(&full_key, json, ttl).await {
            self.absorb(&route, "set", key, &err);
            return Ok(());
        }
        self.stats.write();
        trace!(key = %key, tier = %route.tier(), ttl = ?ttl, "Cache set");

        self.index_tags(&route, &full_key, tags, ttl).await;
        Ok(())
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// `populate` runs at most once per call and only on a miss. Concurrent
    /// callers missing on the same key each run their own `populate`.
    pub async fn get_or_populate<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tags: &[&str],
        populate: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let value = populate().await?;
        self.set(key, &value, ttl, tags).await?;
        Ok(value)
    }

    /// Delete a key. Returns whether an entry was removed.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key)?;
        if !self.is_enabled() {
            return Ok(false);
        }

        let route = self.route().await;
        match route.store().delete(&full_key).await {
            Ok(removed) => Ok(removed),
            Err(err) => {
                self.absorb(&route, "delete", key, &err);
                Ok(false)
            }
        }
    }

    /// Delete every entry written with `tag`, then the tag index itself.
    ///
    /// Returns how many entries were removed. Index members whose entries
    /// already expired are skipped.
    pub async fn delete_by_tag(&self, tag: &str) -> CacheResult<u64> {
        validate_key(tag).map_err(CacheError::from_key_error)?;
        if !self.is_enabled() {
            return Ok(0);
        }

        let route = self.route().await;
        let tag_key = self.config.tag_key(tag);

        let members = match route.store().set_members(&tag_key).await {
            Ok(members) => members,
            Err(err) => {
                self.absorb(&route, "delete_by_tag", tag, &err);
                return Ok(0);
            }
        };

        let removed = match route.store().delete_many(&members).await {
            Ok(removed) => removed,
            Err(err) => {
                self.absorb(&route, "delete_by_tag", tag, &err);
                return Ok(0);
            }
        };

        if let Err(err) = route.store().delete(&tag_key).await {
            self.absorb(&route, "delete_by_tag", tag, &err);
        }

        debug!(tag = %tag, removed, tier = %route.tier(), "Invalidated cache tag");
        Ok(removed)
    }

    /// Get several values; the result is in input order.
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[&str]) -> CacheResult<Vec<Option<T>>> {
        let full_keys = keys
            .iter()
            .map(|key| self.full_key(key))
            .collect::<CacheResult<Vec<_>>>()?;
        if !self.is_enabled() || keys.is_empty() {
            return Ok(keys.iter().map(|_| None).collect());
        }

        let route = self.route().await;
        let raw = match route.store().get_many(&full_keys).await {
            Ok(raw) => raw,
            Err(err) => {
                self.absorb(&route, "get_many", keys[0], &err);
                self.stats.lookups(0, keys.len() as u64);
                return Ok(keys.iter().map(|_| None).collect());
            }
        };

        let values: Vec<Option<T>> = keys
            .iter()
            .zip(raw)
            .map(|(key, json)| json.and_then(|json| self.decode(key, &json)))
            .collect();

        let hits = values.iter().filter(|v| v.is_some()).count() as u64;
        self.stats.lookups(hits, values.len() as u64 - hits);
        Ok(values)
    }

    /// Store several values with one TTL.
    pub async fn set_many<T: Serialize>(
        &self,
        items: &[(&str, T)],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let encoded = items
            .iter()
            .map(|(key, value)| -> CacheResult<(String, String)> {
                Ok((self.full_key(key)?, encode(value)?))
            })
            .collect::<CacheResult<Vec<_>>>()?;
        if !self.is_enabled() || encoded.is_empty() {
            return Ok(());
        }

        let ttl = ttl.or(self.config.default_ttl);
        let route = self.route().await;
        match route.store().set_many(&encoded, ttl).await {
            Ok(()) => {
                for _ in &encoded {
                    self.stats.write();
                }
                Ok(())
            }
            Err(err) => {
                self.absorb(&route, "set_many", items[0].0, &err);
                Ok(())
            }
        }
    }

    /// Whether a live entry exists.
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key)?;
        if !self.is_enabled() {
            return Ok(false);
        }

        let route = self.route().await;
        match route.store().exists(&full_key).await {
            Ok(found) => Ok(found),
            Err(err) => {
                self.absorb(&route, "exists", key, &err);
                Ok(false)
            }
        }
    }

    /// Reset an entry's TTL. Returns `false` if there was no entry.
    pub async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let full_key = self.full_key(key)?;
        if !self.is_enabled() {
            return Ok(false);
        }

        let route = self.route().await;
        match route.store().expire(&full_key, ttl).await {
            Ok(updated) => Ok(updated),
            Err(err) => {
                self.absorb(&route, "expire", key, &err);
                Ok(false)
            }
        }
    }

    /// Remaining TTL of an entry.
    pub async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let full_key = self.full_key(key)?;
        if !self.is_enabled() {
            return Ok(None);
        }

        let route = self.route().await;
        match route.store().ttl(&full_key).await {
            Ok(ttl) => Ok(ttl),
            Err(err) => {
                self.absorb(&route, "ttl", key, &err);
                Ok(None)
            }
        }
    }

    /// Delete every entry and tag index under this cache's prefix.
    pub async fn clear(&self) -> CacheResult<u64> {
        if !self.is_enabled() {
            return Ok(0);
        }

        let prefix = self.config.namespace_prefix();
        let route = self.route().await;
        match route.store().delete_prefix(&prefix).await {
            Ok(removed) => {
                debug!(prefix = %prefix, removed, tier = %route.tier(), "Cache cleared");
                Ok(removed)
            }
            Err(err) => {
                self.absorb(&route, "clear", &prefix, &err);
                Ok(0)
            }
        }
    }

    fn full_key(&self, key: &str) -> CacheResult<String> {
        validate_entry_key(key)?;
        Ok(self.config.build_key(key))
    }

    async fn route(&self) -> Route {
        let route = self.tiers.route().await;
        self.stats.served_by(route.tier());
        route
    }

    async fn index_tags(&self, route: &Route, full_key: &str, tags: &[&str], ttl: Option<Duration>) {
        let member = [full_key.to_string()];
        for tag in tags {
            if let Err(err) = route
                .store()
                .set_add(&self.config.tag_key(tag), &member, ttl)
                .await
            {
                self.absorb(route, "tag", tag, &err);
                return;
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, json: &str) -> Option<T> {
        match serde_json::from_str(json) {
            Ok(value) => Some(value),
            Err(err) => {
                self.stats.error();
                warn!(key = %key, error = %err, "Cached value does not decode, treating as miss");
                None
            }
        }
    }

    fn absorb(&self, route: &Route, op: &'static str, key: &str, err: &StoreError) {
        self.stats.error();
        self.tiers.report_failure(route, err);
        warn!(
            op,
            key = %key,
            tier = %route.tier(),
            error = %err,
            "Cache store call failed, continuing without cache"
        );
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("prefix", &self.config.key_prefix)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))
}

// Segments starting with `#` belong to the cache's own index keys.
fn validate_entry_key(key: &str) -> CacheResult<()> {
    validate_key(key).map_err(CacheError::from_key_error)?;
    if key.split(':').any(|segment| segment.starts_with('#')) {
        return Err(CacheError::InvalidKey(format!(
            "key segments starting with '#' are reserved: {:?}",
            key
        )));
    }
    Ok(())
}

fn validate_tags(tags: &[&str]) -> CacheResult<()> {
    for tag in tags {
        validate_key(tag).map_err(CacheError::from_key_error)?;
    }
    Ok(())
}
