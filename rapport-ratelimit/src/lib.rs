//! # Rapport Rate Limit
//!
//! Sliding-window rate limiting over the Rapport dual-tier store.
//!
//! Every check records one event at the current time, drops events older than
//! the window and counts what is left. The `limit`-th event inside a window is
//! allowed; the `limit + 1`-th is the first one rejected. On Redis the whole
//! step is one MULTI/EXEC batch; on the in-process fallback it runs under the
//! key's shard lock.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rapport_ratelimit::{PolicyKind, RateLimitConfig};
//!
//! let limiter = RateLimitConfig::from_env().build(tiers)?;
//!
//! let outcome = limiter.check_policy(PolicyKind::Strict, &client_ip).await?;
//! for (name, value) in outcome.headers().to_header_pairs() {
//!     response.insert_header(name, value);
//! }
//! outcome.into_result()?; // 429 with Retry-After when denied
//! ```

pub mod config;
pub mod error;

pub use config::{Policy, PolicyKind, RateLimitConfig, RateLimiterBuilder};
pub use error::{RateLimitError, RateLimitHeaders, RateLimitResult};

use error::retry_after_secs;
use rapport_store::{DualTier, Route, StoreError, Tier, WindowHit, unix_millis, validate_key};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// An event recorded by a check, kept so it can be rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedEvent {
    /// Storage key of the window.
    pub key: String,
    /// Member recorded in the window.
    pub member: String,
    /// Tier holding the event.
    pub tier: Tier,
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitOutcome {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Events inside the window, including this one
    pub count: u64,
    /// Maximum number of requests allowed
    pub limit: u64,
    /// Number of remaining requests in the current window
    pub remaining: u64,
    /// When the oldest event in the window leaves it (Unix millis)
    pub reset_at_ms: u64,
    /// Time until retrying can succeed; only set when denied
    pub retry_after: Option<Duration>,
    /// Tier that counted the event; `None` when no store was consulted
    pub tier: Option<Tier>,
    /// Event to pass to [`RateLimiter::rollback`]
    pub event: Option<RecordedEvent>,
}

impl RateLimitOutcome {
    fn from_hit(hit: WindowHit, key: String, policy: Policy, now_ms: u64, tier: Tier) -> Self {
        let window_ms = policy.window.as_millis() as u64;
        let allowed = hit.count <= policy.limit;
        let reset_at_ms = hit.oldest_ms.saturating_add(window_ms);
        let retry_after =
            (!allowed).then(|| Duration::from_millis(reset_at_ms.saturating_sub(now_ms)));

        Self {
            allowed,
            count: hit.count,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(hit.count),
            reset_at_ms,
            retry_after,
            tier: Some(tier),
            event: Some(RecordedEvent {
                key,
                member: hit.member,
                tier,
            }),
        }
    }

    /// Outcome for requests that skip counting (bypass keys, fail-open).
    fn unchecked(policy: Policy, now_ms: u64) -> Self {
        Self {
            allowed: true,
            count: 0,
            limit: policy.limit,
            remaining: policy.limit,
            reset_at_ms: now_ms.saturating_add(policy.window.as_millis() as u64),
            retry_after: None,
            tier: None,
            event: None,
        }
    }

    /// Whether the request is allowed
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// `reset_at_ms` as a Unix timestamp in seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// Headers describing this outcome
    pub fn headers(&self) -> RateLimitHeaders {
        match self.retry_after {
            Some(retry_after) if !self.allowed => RateLimitHeaders::denied(
                self.limit,
                self.reset_at_secs(),
                retry_after_secs(&retry_after),
            ),
            _ => RateLimitHeaders::allowed(self.limit, self.remaining, self.reset_at_secs()),
        }
    }

    /// `Ok(self)` when allowed, [`RateLimitError::LimitExceeded`] otherwise.
    pub fn into_result(self) -> RateLimitResult<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitError::limit_exceeded(
                self.limit,
                self.reset_at_secs(),
                self.retry_after.unwrap_or_default(),
            ))
        }
    }
}

/// The main rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    tiers: DualTier,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter builder
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Create a new rate limiter over `tiers`
    pub fn new(tiers: DualTier, config: RateLimitConfig) -> Self {
        debug!(prefix = %config.key_prefix, "Creating new rate limiter");
        Self { tiers, config }
    }

    /// Get the configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record one request for `key` and decide whether it is allowed.
    ///
    /// Expected conditions come back as values: a denied request is an
    /// outcome with `allowed == false`. Errors are limited to malformed input
    /// and the (practically unreachable) case of both tiers failing.
    pub async fn check(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> RateLimitResult<RateLimitOutcome> {
        self.check_at(key, window, limit, unix_millis()).await
    }

    /// [`check`](Self::check) against one of the configured policies.
    ///
    /// Policies count in separate windows: the same key under `strict` and
    /// `standard` does not share events.
    pub async fn check_policy(
        &self,
        kind: PolicyKind,
        key: &str,
    ) -> RateLimitResult<RateLimitOutcome> {
        let policy = self.config.policy(kind);
        self.check_key(
            key,
            self.policy_key(kind, key),
            policy,
            unix_millis(),
        )
        .await
    }

    /// [`check`](Self::check) with an explicit timestamp in Unix millis.
    pub async fn check_at(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
        now_ms: u64,
    ) -> RateLimitResult<RateLimitOutcome> {
        let policy = Policy::new(limit, window);
        policy.validate()?;
        self.check_key(key, self.storage_key(key), policy, now_ms).await
    }

    async fn check_key(
        &self,
        key: &str,
        store_key: String,
        policy: Policy,
        now_ms: u64,
    ) -> RateLimitResult<RateLimitOutcome> {
        validate_key(key).map_err(invalid_key)?;

        if self.config.should_bypass(key) {
            trace!(key = %key, "Rate limit bypassed");
            return Ok(RateLimitOutcome::unchecked(policy, now_ms));
        }

        let route = self.tiers.route().await;
        let outcome = match route.store().window_hit(&store_key, now_ms, policy.window).await {
            Ok(hit) => RateLimitOutcome::from_hit(hit, store_key, policy, now_ms, route.tier()),
            Err(err) => {
                self.tiers.report_failure(&route, &err);
                if !route.is_shared() {
                    return Err(err.into());
                }

                if self.config.fail_open {
                    warn!(key = %key, error = %err, "Rate limit store failed, allowing request");
                    return Ok(RateLimitOutcome::unchecked(policy, now_ms));
                }

                warn!(key = %key, error = %err, "Rate limit store failed, counting on fallback");
                let fallback = self.tiers.fallback_route();
                let hit = fallback
                    .store()
                    .window_hit(&store_key, now_ms, policy.window)
                    .await?;
                RateLimitOutcome::from_hit(hit, store_key, policy, now_ms, Tier::Fallback)
            }
        };

        if outcome.allowed {
            trace!(key = %key, count = outcome.count, limit = outcome.limit, "Request allowed");
        } else {
            warn!(
                key = %key,
                count = outcome.count,
                limit = outcome.limit,
                retry_after = ?outcome.retry_after,
                "Rate limit exceeded"
            );
            if !self.config.record_rejected {
                return Ok(self.forget(outcome).await);
            }
        }

        Ok(outcome)
    }

    /// Remove the event a check recorded.
    ///
    /// Use it to stop counting requests that should not count (for example
    /// successful logins). Returns `false` when there is nothing to remove or
    /// the tier that recorded the event is no longer the one serving.
    pub async fn rollback(&self, outcome: &RateLimitOutcome) -> RateLimitResult<bool> {
        let Some(event) = &outcome.event else {
            return Ok(false);
        };

        let route = match event.tier {
            Tier::Fallback => self.tiers.fallback_route(),
            Tier::Shared => {
                let route = self.tiers.route().await;
                if !route.is_shared() {
                    debug!(key = %event.key, "Shared store gone, skipping rollback");
                    return Ok(false);
                }
                route
            }
        };

        match route.store().window_remove(&event.key, &event.member).await {
            Ok(removed) => {
                trace!(key = %event.key, removed, "Rolled back rate limit event");
                Ok(removed)
            }
            Err(err) => {
                self.absorb(&route, &event.key, &err);
                Ok(false)
            }
        }
    }

    /// Events currently inside the window for `key`, without recording one.
    pub async fn count(&self, key: &str, window: Duration) -> RateLimitResult<u64> {
        validate_key(key).map_err(invalid_key)?;
        let store_key = self.storage_key(key);
        let since = unix_millis().saturating_sub(window.as_millis() as u64);

        let route = self.tiers.route().await;
        match route.store().window_count(&store_key, since).await {
            Ok(count) => Ok(count),
            Err(err) if route.is_shared() => {
                self.absorb(&route, key, &err);
                Ok(self
                    .tiers
                    .fallback_route()
                    .store()
                    .window_count(&store_key, since)
                    .await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Forget every event recorded for `key` on the serving tier.
    pub async fn reset(&self, key: &str) -> RateLimitResult<()> {
        validate_key(key).map_err(invalid_key)?;
        debug!(key = %key, "Resetting rate limit");

        let mut keys = vec![self.storage_key(key)];
        keys.extend(
            [PolicyKind::Strict, PolicyKind::Standard, PolicyKind::Relaxed]
                .into_iter()
                .map(|kind| self.policy_key(kind, key)),
        );

        let route = self.tiers.route().await;
        if let Err(err) = route.store().delete_many(&keys).await {
            self.absorb(&route, key, &err);
            if route.is_shared() {
                self.tiers.fallback_route().store().delete_many(&keys).await?;
            }
        }
        Ok(())
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:adhoc:{}", self.config.key_prefix, key)
    }

    fn policy_key(&self, kind: PolicyKind, key: &str) -> String {
        format!("{}:policy:{}:{}", self.config.key_prefix, kind, key)
    }

    async fn forget(&self, mut outcome: RateLimitOutcome) -> RateLimitOutcome {
        if let Some(event) = &outcome.event {
            let route = match event.tier {
                Tier::Shared => self.tiers.route().await,
                Tier::Fallback => self.tiers.fallback_route(),
            };
            if route.tier() == event.tier
                && let Err(err) = route.store().window_remove(&event.key, &event.member).await
            {
                self.absorb(&route, &event.key, &err);
            }
        }
        outcome.event = None;
        outcome
    }

    fn absorb(&self, route: &Route, key: &str, err: &StoreError) {
        self.tiers.report_failure(route, err);
        warn!(key = %key, tier = %route.tier(), error = %err, "Rate limit store call failed");
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

fn invalid_key(err: StoreError) -> RateLimitError {
    match err {
        StoreError::InvalidKey(msg) => RateLimitError::InvalidKey(msg),
        other => RateLimitError::Store(other),
    }
}
