use crate::config::StateConfig;
use crate::error::{StateError, StateResult};
use once_cell::sync::OnceCell;
use rapport_cache::Cache;
use rapport_csrf::TokenStore;
use rapport_ratelimit::RateLimiter;
use rapport_store::{
    ConnectorStatus, DualTier, MemoryStore, StoreConnector, StoreDialer, Tier,
};
use std::sync::Arc;
use tracing::{debug, info};

static GLOBAL: OnceCell<StateLayer> = OnceCell::new();

/// Cache, rate limiter and token store wired to one connector and one
/// fallback.
///
/// Cloning is cheap; every clone shares the same connection state.
#[derive(Clone)]
pub struct StateLayer {
    tiers: DualTier,
    cache: Cache,
    limiter: RateLimiter,
    tokens: TokenStore,
}

impl StateLayer {
    /// Build a layer that talks to the Redis server named in `config.store`.
    ///
    /// Nothing is dialed here; the first request that needs the shared store
    /// connects.
    #[cfg(feature = "redis")]
    pub fn new(config: StateConfig) -> StateResult<Self> {
        let dialer = Arc::new(rapport_store::RedisDialer::new(&config.store)?);
        Self::with_dialer(dialer, config)
    }

    /// Build a layer over an arbitrary dialer.
    pub fn with_dialer(dialer: Arc<dyn StoreDialer>, config: StateConfig) -> StateResult<Self> {
        config.validate()?;

        let connector = StoreConnector::from_config(dialer, &config.store);
        let tiers = DualTier::new(Arc::new(connector), Arc::new(MemoryStore::new()));

        let cache = Cache::new(tiers.clone(), config.cache)?;
        let limiter = RateLimiter::new(tiers.clone(), config.ratelimit);
        let tokens = TokenStore::new(tiers.clone(), config.csrf)?;

        debug!(
            target = %tiers.connector().status().target,
            caching = cache.is_enabled(),
            "State layer ready"
        );

        Ok(Self {
            tiers,
            cache,
            limiter,
            tokens,
        })
    }

    /// Response cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Sliding-window rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Anti-forgery token store.
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// The shared tiers, for callers that need raw store access.
    pub fn tiers(&self) -> &DualTier {
        &self.tiers
    }

    /// The shared-store connector.
    pub fn connector(&self) -> &Arc<StoreConnector> {
        self.tiers.connector()
    }

    /// Connector snapshot for health endpoints.
    pub fn status(&self) -> ConnectorStatus {
        self.tiers.connector().status()
    }

    /// Try to reach the shared store now instead of on the first request.
    ///
    /// Returns the tier the next call would use.
    pub async fn warm_up(&self) -> Tier {
        let tier = self.tiers.route().await.tier();
        info!(tier = %tier, "State layer warmed up");
        tier
    }

    /// Drop the shared-store connection. The next request redials.
    pub fn close(&self) {
        self.tiers.connector().close();
    }

    /// Make `layer` the process-wide instance.
    pub fn install(layer: StateLayer) -> StateResult<&'static StateLayer> {
        GLOBAL
            .set(layer)
            .map_err(|_| StateError::AlreadyInitialized)?;
        GLOBAL.get().ok_or(StateError::NotInitialized)
    }

    /// The process-wide instance, built from the environment on first use.
    #[cfg(feature = "redis")]
    pub fn global() -> StateResult<&'static StateLayer> {
        GLOBAL.get_or_try_init(|| StateConfig::from_env().and_then(StateLayer::new))
    }

    /// The process-wide instance, if one was installed or built.
    pub fn try_global() -> Option<&'static StateLayer> {
        GLOBAL.get()
    }
}

impl std::fmt::Debug for StateLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLayer")
            .field("tiers", &self.tiers)
            .field("limiter", &self.limiter)
            .field("tokens", &self.tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_store::ConnectionState;
    use rapport_store::testing::ScriptedDialer;

    #[tokio::test]
    async fn test_components_share_one_connector() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let layer = StateLayer::with_dialer(dialer.clone(), StateConfig::default()).unwrap();
        assert_eq!(dialer.dial_count(), 0);

        layer.cache().set("k", &1u32, None, &[]).await.unwrap();
        layer.limiter().check("ip", std::time::Duration::from_secs(60), 5).await.unwrap();
        layer.tokens().issue("session").await.unwrap();

        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(layer.status().state, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_warm_up_and_close() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let layer = StateLayer::with_dialer(dialer.clone(), StateConfig::default()).unwrap();

        assert_eq!(layer.warm_up().await, Tier::Shared);
        layer.close();
        assert_eq!(layer.status().state, ConnectionState::Disconnected);
        assert_eq!(layer.warm_up().await, Tier::Shared);
        assert_eq!(dialer.dial_count(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = StateConfig::default();
        config.csrf.secret.clear();
        let result = StateLayer::with_dialer(Arc::new(ScriptedDialer::healthy()), config);
        assert!(matches!(result, Err(StateError::Csrf(_))));
    }
}
