use crate::error::StateResult;
use rapport_cache::CacheConfig;
use rapport_csrf::CsrfConfig;
use rapport_ratelimit::RateLimitConfig;
use rapport_store::StoreConfig;
use tracing::debug;

/// Configuration for every component of a [`StateLayer`](crate::StateLayer).
#[derive(Debug, Clone, Default)]
pub struct StateConfig {
    /// Shared-store connection and breaker settings.
    pub store: StoreConfig,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Rate limit policies.
    pub ratelimit: RateLimitConfig,
    /// Anti-forgery token settings.
    pub csrf: CsrfConfig,
}

impl StateConfig {
    /// Load `.env` if present, then read every component's variables.
    pub fn from_env() -> StateResult<Self> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "Loaded environment file"),
            Err(err) if err.not_found() => {}
            Err(err) => debug!(error = %err, "Ignoring unreadable environment file"),
        }

        Ok(Self {
            store: StoreConfig::from_env().build(),
            cache: CacheConfig::from_env(),
            ratelimit: RateLimitConfig::from_env().config(),
            csrf: CsrfConfig::from_env()?,
        })
    }

    /// Replace the store configuration.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Replace the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the rate limit configuration.
    pub fn with_ratelimit(mut self, ratelimit: RateLimitConfig) -> Self {
        self.ratelimit = ratelimit;
        self
    }

    /// Replace the CSRF configuration.
    pub fn with_csrf(mut self, csrf: CsrfConfig) -> Self {
        self.csrf = csrf;
        self
    }

    /// Validate every section.
    pub fn validate(&self) -> StateResult<()> {
        self.store.validate()?;
        self.cache.validate()?;
        self.ratelimit.validate()?;
        self.csrf.validate()?;
        Ok(())
    }
}
