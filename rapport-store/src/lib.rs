//! # Rapport Store
//!
//! Dual-tier keyed storage: a shared Redis store reached through a lazily
//! connected, circuit-broken connector, and an in-process fallback that serves
//! every call the shared store cannot.
//!
//! ## Features
//!
//! - **Lazy connection**: nothing is dialed until the first request needs it
//! - **Circuit breaking**: exponential backoff, then a cool-down with a single probe
//! - **Fallback tier**: TTL, set and sliding-window primitives in memory
//! - **One contract**: both tiers implement [`KeyValueStore`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rapport_store::prelude::*;
//! use std::sync::Arc;
//!
//! let config = StoreConfig::from_env().build();
//! let dialer = Arc::new(RedisDialer::new(&config)?);
//! let connector = Arc::new(StoreConnector::from_config(dialer, &config));
//! let tiers = DualTier::new(connector, Arc::new(MemoryStore::new()));
//!
//! let route = tiers.route().await;
//! route.store().set("greeting", "hello".into(), None).await?;
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod key;
pub mod memory;
pub mod tier;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis_store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{ExecutionMode, StoreConfig, StoreConfigBuilder};
pub use connector::{
    ConnectPolicy, ConnectionState, ConnectorStatus, DisconnectSignal, StoreConnector, StoreDialer,
    StoreResult,
};
pub use error::{Result, StoreError};
pub use key::{MAX_KEY_LEN, namespaced, validate_key};
pub use memory::MemoryStore;
pub use tier::{DualTier, Route, Tier};
pub use traits::{KeyValueStore, WindowHit, unix_millis};

#[cfg(feature = "redis")]
pub use redis_store::{RedisDialer, RedisStore};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{ExecutionMode, StoreConfig};
    pub use crate::connector::{StoreConnector, StoreDialer, StoreResult};
    pub use crate::error::{Result, StoreError};
    pub use crate::memory::MemoryStore;
    pub use crate::tier::{DualTier, Route, Tier};
    pub use crate::traits::KeyValueStore;

    #[cfg(feature = "redis")]
    pub use crate::redis_store::{RedisDialer, RedisStore};
}
