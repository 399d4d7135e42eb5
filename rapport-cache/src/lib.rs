//! # Rapport Cache
//!
//! Typed response caching over the Rapport dual-tier store.
//!
//! ## Features
//!
//! - **Typed values**: anything `Serialize + DeserializeOwned`, stored as JSON
//! - **Tag invalidation**: drop every entry written with a tag in one call
//! - **Never fails a request**: store trouble turns into misses, counted in stats
//! - **Mode aware**: inert outside production
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rapport_cache::{Cache, CacheConfig};
//! use std::time::Duration;
//!
//! let cache = Cache::new(tiers, CacheConfig::from_env())?;
//!
//! let article: Article = cache
//!     .get_or_populate("article:42", Some(Duration::from_secs(600)), &["articles"], || {
//!         load_article(42)
//!     })
//!     .await?;
//!
//! // After an edit
//! cache.delete_by_tag("articles").await?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod stats;

pub use cache::Cache;
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use stats::{CacheStats, CacheStatsSnapshot};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::config::CacheConfig;
    pub use crate::error::{CacheError, CacheResult};
}
