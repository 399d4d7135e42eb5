//! # Rapport
//!
//! Resilient shared state for web services. A response cache, a
//! sliding-window rate limiter and an anti-forgery token store share one
//! lazily connected Redis connection and one in-process fallback. When Redis
//! is slow or gone, requests keep being served from the fallback and the
//! connector backs off, cools down and probes until it can switch back.
//!
//! ## Crates
//!
//! - [`rapport_store`]: connector, circuit breaker, both tiers
//! - [`rapport_cache`]: typed cache with tag invalidation
//! - [`rapport_ratelimit`]: sliding-window limits with rate-limit headers
//! - [`rapport_csrf`]: session-bound tokens
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rapport::prelude::*;
//!
//! rapport::init_tracing();
//! let state = StateLayer::new(StateConfig::from_env()?)?;
//!
//! state.limiter().check_policy(PolicyKind::Standard, &client_ip).await?.into_result()?;
//! let token = state.tokens().issue(&session_id).await?;
//! let page: String = state
//!     .cache()
//!     .get_or_populate("home", None, &["pages"], || render_home())
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod layer;
pub mod logging;

pub use config::StateConfig;
pub use error::{StateError, StateResult};
pub use layer::StateLayer;
pub use logging::{LogFormat, init_tracing, init_tracing_with};

pub use rapport_cache;
pub use rapport_csrf;
pub use rapport_ratelimit;
pub use rapport_store;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{StateConfig, StateError, StateLayer, StateResult};
    pub use rapport_cache::{Cache, CacheConfig, CacheError};
    pub use rapport_csrf::{CsrfConfig, CsrfError, CsrfToken, TokenStore};
    pub use rapport_ratelimit::{
        Policy, PolicyKind, RateLimitConfig, RateLimitError, RateLimitOutcome, RateLimiter,
    };
    pub use rapport_store::{ConnectionState, ExecutionMode, StoreConfig, Tier};
}
