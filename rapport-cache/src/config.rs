//! Cache configuration types.

use crate::error::{CacheError, CacheResult};
use rapport_store::{ExecutionMode, namespaced};
use std::time::Duration;

/// Key segment that marks a tag index.
pub(crate) const TAG_SEGMENT: &str = "#tag";

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace prepended to every cache key.
    pub key_prefix: String,

    /// TTL used when a write does not give one. `None` keeps entries until evicted.
    pub default_ttl: Option<Duration>,

    /// Execution mode; caching only runs in production.
    pub mode: ExecutionMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache".to_string(),
            default_ttl: Some(Duration::from_secs(300)),
            mode: ExecutionMode::Production,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `RAPPORT_CACHE_PREFIX`, `RAPPORT_CACHE_TTL_SECS` and `RAPPORT_ENV`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("RAPPORT_CACHE_PREFIX") {
            config.key_prefix = prefix;
        }

        if let Ok(ttl) = std::env::var("RAPPORT_CACHE_TTL_SECS")
            && let Ok(secs) = ttl.trim().parse::<u64>()
        {
            config.default_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Ok(mode) = std::env::var("RAPPORT_ENV")
            && let Some(mode) = ExecutionMode::parse(&mode)
        {
            config.mode = mode;
        }

        config
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Keep entries without a TTL unless one is given per write.
    pub fn without_default_ttl(mut self) -> Self {
        self.default_ttl = None;
        self
    }

    /// Set the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether the cache does anything in this configuration.
    pub fn enabled(&self) -> bool {
        self.mode.caching_enabled()
    }

    /// Build the final key with prefix.
    pub fn build_key(&self, key: &str) -> String {
        namespaced(&self.key_prefix, key)
    }

    /// Key of the index set for `tag`.
    ///
    /// Index keys carry a `#tag` segment, which [`Cache`](crate::Cache) never
    /// accepts in an entry key.
    pub fn tag_key(&self, tag: &str) -> String {
        namespaced(&self.key_prefix, &format!("{}:{}", TAG_SEGMENT, tag))
    }

    /// Prefix shared by every key this cache owns, for `clear`.
    pub fn namespace_prefix(&self) -> String {
        if self.key_prefix.is_empty() {
            String::new()
        } else {
            format!("{}:", self.key_prefix)
        }
    }

    /// Reject configurations that would collide with other consumers.
    pub fn validate(&self) -> CacheResult<()> {
        if self.key_prefix.is_empty() {
            return Err(CacheError::Config(
                "key_prefix must not be empty; clear() would wipe the whole store".to_string(),
            ));
        }

        if self.key_prefix.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CacheError::Config(format!(
                "key_prefix contains whitespace: {:?}",
                self.key_prefix
            )));
        }

        if self.default_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(CacheError::Config("default_ttl must be non-zero".to_string()));
        }

        Ok(())
    }
}
