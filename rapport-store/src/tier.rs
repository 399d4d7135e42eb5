//! Per-call tier selection.

use crate::connector::{StoreConnector, StoreResult};
use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::traits::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Which tier served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The shared Redis store.
    Shared,
    /// The in-process fallback.
    Fallback,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// The store chosen for one logical operation.
#[derive(Clone)]
pub enum Route {
    /// Use the shared store through this handle.
    Shared(Arc<dyn KeyValueStore>),
    /// Use the local fallback.
    Fallback(Arc<MemoryStore>),
}

impl Route {
    /// Tier of this route.
    pub fn tier(&self) -> Tier {
        match self {
            Self::Shared(_) => Tier::Shared,
            Self::Fallback(_) => Tier::Fallback,
        }
    }

    /// Whether this route goes to the shared store.
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// The store to issue commands against.
    pub fn store(&self) -> &dyn KeyValueStore {
        match self {
            Self::Shared(handle) => handle.as_ref(),
            Self::Fallback(memory) => memory.as_ref(),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Route").field(&self.tier()).finish()
    }
}

/// The connector plus the fallback it degrades to.
///
/// Cache, limiter and token store each hold a clone; all clones share one
/// connector and one fallback.
#[derive(Clone)]
pub struct DualTier {
    connector: Arc<StoreConnector>,
    fallback: Arc<MemoryStore>,
}

impl DualTier {
    /// Combine a connector with a fallback store.
    pub fn new(connector: Arc<StoreConnector>, fallback: Arc<MemoryStore>) -> Self {
        Self {
            connector,
            fallback,
        }
    }

    /// Pick the tier for the next operation.
    pub async fn route(&self) -> Route {
        match self.connector.acquire().await {
            StoreResult::Ready(handle) => Route::Shared(handle),
            StoreResult::Unavailable => {
                trace!("Shared store unavailable, routing to fallback");
                Route::Fallback(Arc::clone(&self.fallback))
            }
        }
    }

    /// Route straight to the fallback.
    pub fn fallback_route(&self) -> Route {
        Route::Fallback(Arc::clone(&self.fallback))
    }

    /// The fallback store.
    pub fn fallback(&self) -> &Arc<MemoryStore> {
        &self.fallback
    }

    /// The shared-store connector.
    pub fn connector(&self) -> &Arc<StoreConnector> {
        &self.connector
    }

    /// Tell the connector that a call through `route` failed.
    ///
    /// Fallback failures are ignored; the connector only tracks the shared tier.
    pub fn report_failure(&self, route: &Route, err: &StoreError) {
        match route {
            Route::Shared(handle) => {
                debug!(error = %err, "Reporting shared store failure to connector");
                self.connector.report_failure(handle, err);
            }
            Route::Fallback(_) => {
                debug!(error = %err, "Fallback store call failed");
            }
        }
    }
}

impl fmt::Debug for DualTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualTier")
            .field("connector", &self.connector)
            .field("fallback_keys", &self.fallback.key_count())
            .finish()
    }
}
