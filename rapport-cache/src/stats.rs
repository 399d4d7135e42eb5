//! Cache counters.

use rapport_store::Tier;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for one cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
    fallback_serves: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStatsSnapshot {
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found nothing, including reads turned into misses by errors.
    pub misses: u64,
    /// Successful writes.
    pub writes: u64,
    /// Store failures absorbed by the cache.
    pub errors: u64,
    /// Operations served by the fallback tier.
    pub fallback_serves: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of reads that hit, `0.0` before any read.
    pub fn hit_rate(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads == 0 {
            0.0
        } else {
            self.hits as f64 / reads as f64
        }
    }
}

impl CacheStats {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lookups(&self, hits: u64, misses: u64) {
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn served_by(&self, tier: Tier) {
        if tier == Tier::Fallback {
            self.fallback_serves.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            fallback_serves: self.fallback_serves.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.fallback_serves.store(0, Ordering::Relaxed);
    }
}
