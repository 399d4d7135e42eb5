//! Lazily connected, circuit-broken access to the shared store.
//!
//! The connector owns the single shared-store handle of the process. Callers
//! ask for it with [`StoreConnector::acquire`] and receive either a ready
//! handle or [`StoreResult::Unavailable`]; the connector never makes a request
//! wait on another caller's dial and never surfaces connection errors.
//!
//! ```text
//!  Disconnected --acquire--> Connecting --ok--> Ready
//!       ^                        |                |
//!       |<------fail (n <= max)--+                | transport error /
//!       |                        |                | disconnect
//!       |                        v                |
//!       +---cooldown passed--- CoolingDown <------+ (n > max)
//! ```

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::traits::KeyValueStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Establishes connections to the shared store.
#[async_trait]
pub trait StoreDialer: Send + Sync {
    /// Open a connection and return a handle ready for commands.
    ///
    /// Dialers that learn about dropped connections on their own should fire
    /// `disconnected` when the returned handle's connection goes away.
    async fn dial(&self, disconnected: DisconnectSignal) -> Result<Arc<dyn KeyValueStore>>;

    /// Human-readable target for logs.
    fn describe(&self) -> String;
}

/// Connector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handle; the next `acquire` may dial.
    Disconnected,
    /// A dial is in flight.
    Connecting,
    /// A handle is available.
    Ready,
    /// Too many failures; no dials until the cool-down passes.
    CoolingDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::CoolingDown => "cooling_down",
        };
        f.write_str(name)
    }
}

/// Outcome of [`StoreConnector::acquire`].
#[derive(Clone)]
pub enum StoreResult {
    /// The shared store is reachable through this handle.
    Ready(Arc<dyn KeyValueStore>),
    /// Serve the call from the fallback tier.
    Unavailable,
}

impl StoreResult {
    /// Whether a handle was returned.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl fmt::Debug for StoreResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(handle) => f.debug_tuple("Ready").field(&handle.backend()).finish(),
            Self::Unavailable => f.write_str("Unavailable"),
        }
    }
}

/// Retry and circuit-breaker settings.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Deadline for a single dial.
    pub connect_timeout: Duration,
    /// Consecutive failures tolerated before cooling down.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub retry_backoff: Duration,
    /// Cap for the exponential delay.
    pub max_backoff: Duration,
    /// Length of the cool-down.
    pub cooldown: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for ConnectPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            max_backoff: config.max_backoff,
            cooldown: config.cooldown,
        }
    }
}

impl ConnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Point-in-time view of the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Consecutive failures since the last successful dial.
    pub failure_count: u32,
    /// Time left before another dial is allowed, if any.
    pub retry_in: Option<Duration>,
    /// Dial target.
    pub target: String,
}

/// Tells the connector that the connection from one particular dial closed.
///
/// Firing it after the connector has moved on to a newer connection, or after
/// the connector itself is gone, does nothing.
#[derive(Clone)]
pub struct DisconnectSignal {
    inner: Weak<Mutex<Inner>>,
    attempt: u64,
    target: Arc<str>,
}

impl DisconnectSignal {
    /// A signal attached to no connector.
    pub fn detached() -> Self {
        Self {
            inner: Weak::new(),
            attempt: 0,
            target: Arc::from(""),
        }
    }

    /// Report that the connection closed.
    pub fn notify(&self) {
        if let Some(inner) = self.inner.upgrade() {
            mark_disconnected(&mut inner.lock(), Some(self.attempt), &self.target);
        }
    }
}

impl fmt::Debug for DisconnectSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectSignal")
            .field("target", &self.target)
            .field("attempt", &self.attempt)
            .finish()
    }
}

struct Inner {
    state: ConnectionState,
    handle: Option<Arc<dyn KeyValueStore>>,
    failure_count: u32,
    /// Earliest moment another dial may start (backoff or cool-down end).
    not_before: Option<Instant>,
    /// Bumped for every dial so a stale guard cannot reset a newer one.
    attempt: u64,
}

/// Owner of the shared-store connection.
pub struct StoreConnector {
    dialer: Arc<dyn StoreDialer>,
    policy: ConnectPolicy,
    inner: Arc<Mutex<Inner>>,
}

impl StoreConnector {
    /// Create a connector. Nothing is dialed until the first `acquire`.
    pub fn new(dialer: Arc<dyn StoreDialer>, policy: ConnectPolicy) -> Self {
        Self {
            dialer,
            policy,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                handle: None,
                failure_count: 0,
                not_before: None,
                attempt: 0,
            })),
        }
    }

    /// Create a connector with the policy taken from `config`.
    pub fn from_config(dialer: Arc<dyn StoreDialer>, config: &StoreConfig) -> Self {
        Self::new(dialer, ConnectPolicy::from(config))
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &ConnectPolicy {
        &self.policy
    }

    /// Get the shared-store handle, dialing if allowed.
    ///
    /// Returns [`StoreResult::Unavailable`] immediately while another caller is
    /// dialing, during backoff, and during cool-down.
    pub async fn acquire(&self) -> StoreResult {
        let attempt = {
            let mut inner = self.inner.lock();
            let now = Instant::now();

            match inner.state {
                ConnectionState::Ready => {
                    if let Some(handle) = &inner.handle {
                        return StoreResult::Ready(Arc::clone(handle));
                    }
                }
                ConnectionState::Connecting => return StoreResult::Unavailable,
                ConnectionState::Disconnected | ConnectionState::CoolingDown => {
                    if inner.not_before.is_some_and(|t| now < t) {
                        return StoreResult::Unavailable;
                    }
                    if inner.state == ConnectionState::CoolingDown {
                        debug!(target = %self.dialer.describe(), "Cool-down elapsed, probing shared store");
                    }
                }
            }

            inner.state = ConnectionState::Connecting;
            inner.attempt += 1;
            inner.attempt
        };

        let mut guard = DialGuard {
            inner: &*self.inner,
            attempt,
            armed: true,
        };

        let signal = DisconnectSignal {
            inner: Arc::downgrade(&self.inner),
            attempt,
            target: Arc::from(self.dialer.describe()),
        };
        let dialed = match tokio::time::timeout(self.policy.connect_timeout, self.dialer.dial(signal))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };
        guard.armed = false;

        match dialed {
            Ok(handle) => {
                self.on_connected(attempt, Arc::clone(&handle));
                StoreResult::Ready(handle)
            }
            Err(err) => {
                let mut inner = self.inner.lock();
                if inner.attempt == attempt {
                    self.record_failure(&mut inner, &err);
                }
                StoreResult::Unavailable
            }
        }
    }

    /// Report an error seen while using `handle`.
    ///
    /// Transport errors drop the handle and count as a failure, but only if
    /// `handle` is still the current one; reports about a replaced handle and
    /// non-transport errors are ignored.
    pub fn report_failure(&self, handle: &Arc<dyn KeyValueStore>, err: &StoreError) {
        if !err.is_transport() {
            return;
        }

        let mut inner = self.inner.lock();
        let is_current = inner
            .handle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle));

        if is_current {
            inner.handle = None;
            self.record_failure(&mut inner, err);
        }
    }

    /// The connection was closed underneath us; redial on the next `acquire`.
    ///
    /// Does not count as a failure.
    pub fn notify_disconnected(&self) {
        mark_disconnected(&mut self.inner.lock(), None, &self.dialer.describe());
    }

    /// Drop the handle and return to `Disconnected`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.handle = None;
        inner.state = ConnectionState::Disconnected;
        inner.failure_count = 0;
        inner.not_before = None;
        inner.attempt += 1;
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Snapshot for health endpoints and logs.
    pub fn status(&self) -> ConnectorStatus {
        let inner = self.inner.lock();
        let now = Instant::now();
        ConnectorStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            retry_in: inner
                .not_before
                .and_then(|t| t.checked_duration_since(now))
                .filter(|d| !d.is_zero()),
            target: self.dialer.describe(),
        }
    }

    fn on_connected(&self, attempt: u64, handle: Arc<dyn KeyValueStore>) {
        let mut inner = self.inner.lock();
        if inner.attempt != attempt {
            return;
        }

        if inner.failure_count > 0 {
            info!(
                target = %self.dialer.describe(),
                failures = inner.failure_count,
                "Shared store reconnected"
            );
        } else {
            info!(target = %self.dialer.describe(), backend = handle.backend(), "Shared store connected");
        }

        inner.state = ConnectionState::Ready;
        inner.handle = Some(handle);
        inner.failure_count = 0;
        inner.not_before = None;
    }

    fn record_failure(&self, inner: &mut Inner, err: &StoreError) {
        let now = Instant::now();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.handle = None;

        if inner.failure_count > self.policy.max_retries {
            inner.state = ConnectionState::CoolingDown;
            inner.not_before = Some(now + self.policy.cooldown);
            warn!(
                target = %self.dialer.describe(),
                failures = inner.failure_count,
                cooldown = ?self.policy.cooldown,
                error = %err,
                "Shared store circuit open, cooling down"
            );
        } else {
            let delay = self.policy.backoff(inner.failure_count);
            inner.state = ConnectionState::Disconnected;
            inner.not_before = Some(now + delay);
            warn!(
                target = %self.dialer.describe(),
                failures = inner.failure_count,
                retry_in = ?delay,
                error = %err,
                "Shared store unavailable"
            );
        }
    }
}

impl fmt::Debug for StoreConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConnector")
            .field("target", &self.dialer.describe())
            .field("state", &self.state())
            .finish()
    }
}

// `attempt` of `None` drops whatever connection is current.
fn mark_disconnected(inner: &mut Inner, attempt: Option<u64>, target: &str) {
    if inner.state != ConnectionState::Ready || attempt.is_some_and(|a| a != inner.attempt) {
        return;
    }
    info!(target = %target, "Shared store disconnected");
    inner.state = ConnectionState::Disconnected;
    inner.handle = None;
    inner.not_before = None;
}

/// Returns the connector to `Disconnected` if an `acquire` is dropped mid-dial.
struct DialGuard<'a> {
    inner: &'a Mutex<Inner>,
    attempt: u64,
    armed: bool,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.attempt == self.attempt && inner.state == ConnectionState::Connecting {
            debug!("Dial cancelled, resetting connector");
            inner.state = ConnectionState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedDialer, StaticDialer};

    fn policy() -> ConnectPolicy {
        ConnectPolicy {
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            cooldown: Duration::from_secs(30),
        }
    }

    fn connector(dialer: &Arc<ScriptedDialer>) -> StoreConnector {
        StoreConnector::new(dialer.clone(), policy())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(6), Duration::from_secs(2));
        assert_eq!(policy.backoff(200), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_connect_and_reuse() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let connector = connector(&dialer);
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dial_count(), 0);

        let first = connector.acquire().await;
        let second = connector.acquire().await;

        match (first, second) {
            (StoreResult::Ready(a), StoreResult::Ready(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("expected two ready handles, got {:?}", other),
        }
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(connector.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_suppresses_dials() {
        let dialer = Arc::new(ScriptedDialer::down());
        let connector = connector(&dialer);

        assert!(!connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 1);

        // still inside the 100ms backoff
        assert!(!connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(connector.status().retry_in, Some(Duration::from_millis(100)));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(connector.status().failure_count, 2);

        // second failure doubles the delay
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        dialer.fail_next(2);
        let connector = connector(&dialer);

        assert!(!connector.acquire().await.is_ready());
        tokio::time::advance(policy().backoff(1)).await;
        assert!(!connector.acquire().await.is_ready());
        tokio::time::advance(policy().backoff(2)).await;
        assert!(connector.acquire().await.is_ready());

        let status = connector.status();
        assert_eq!(status.state, ConnectionState::Ready);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.retry_in, None);
    }

    async fn trip_breaker(connector: &StoreConnector) {
        let policy = policy();
        for failure in 1..=policy.max_retries {
            assert!(!connector.acquire().await.is_ready());
            tokio::time::advance(policy.backoff(failure)).await;
        }
        assert!(!connector.acquire().await.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_after_max_retries() {
        let dialer = Arc::new(ScriptedDialer::down());
        let connector = connector(&dialer);

        trip_breaker(&connector).await;
        assert_eq!(connector.state(), ConnectionState::CoolingDown);
        assert_eq!(dialer.dial_count(), 4);

        // no reconnect attempts while cooling down
        dialer.set_up(true);
        tokio::time::advance(Duration::from_secs(29)).await;
        for _ in 0..10 {
            assert!(!connector.acquire().await.is_ready());
        }
        assert_eq!(dialer.dial_count(), 4);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 5);
        assert_eq!(connector.status().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reenters_cooldown() {
        let dialer = Arc::new(ScriptedDialer::down());
        let connector = connector(&dialer);

        trip_breaker(&connector).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        // exactly one probe
        assert!(!connector.acquire().await.is_ready());
        assert!(!connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 5);
        assert_eq!(connector.state(), ConnectionState::CoolingDown);
        assert_eq!(connector.status().retry_in, Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_do_not_wait_on_dial() {
        let dialer = Arc::new(ScriptedDialer::healthy().with_delay(Duration::from_secs(1)));
        let connector = Arc::new(connector(&dialer));

        let dialing = tokio::spawn({
            let connector = connector.clone();
            async move { connector.acquire().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(connector.state(), ConnectionState::Connecting);

        let started = Instant::now();
        assert!(!connector.acquire().await.is_ready());
        assert_eq!(started.elapsed(), Duration::ZERO);

        assert!(dialing.await.unwrap().is_ready());
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_resets_state() {
        let dialer = Arc::new(ScriptedDialer::healthy().with_delay(Duration::from_secs(1)));
        let connector = connector(&dialer);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), connector.acquire()).await;
        assert!(cancelled.is_err());

        let status = connector.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.failure_count, 0);

        assert!(connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_failure() {
        let dialer = Arc::new(ScriptedDialer::healthy().with_delay(Duration::from_secs(10)));
        let connector = connector(&dialer);

        let started = Instant::now();
        assert!(!connector.acquire().await.is_ready());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(connector.status().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_failure_drops_current_handle() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let connector = connector(&dialer);

        let StoreResult::Ready(handle) = connector.acquire().await else {
            panic!("expected ready");
        };

        // command errors leave the connection alone
        connector.report_failure(&handle, &StoreError::Command("WRONGTYPE".into()));
        assert_eq!(connector.state(), ConnectionState::Ready);

        connector.report_failure(&handle, &StoreError::Timeout);
        let status = connector.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.failure_count, 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        let StoreResult::Ready(fresh) = connector.acquire().await else {
            panic!("expected ready");
        };

        // a late report about the old handle is ignored
        connector.report_failure(&handle, &StoreError::Timeout);
        assert_eq!(connector.state(), ConnectionState::Ready);
        assert!(!Arc::ptr_eq(&handle, &fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_disconnected_redials_immediately() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let connector = connector(&dialer);

        assert!(connector.acquire().await.is_ready());
        connector.notify_disconnected();
        assert_eq!(connector.state(), ConnectionState::Disconnected);

        assert!(connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(connector.status().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dialer_disconnect_drops_to_disconnected() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let connector = connector(&dialer);

        assert!(connector.acquire().await.is_ready());
        assert!(dialer.drop_connection());
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert_eq!(connector.status().retry_in, None);

        assert!(connector.acquire().await.is_ready());
        assert_eq!(dialer.dial_count(), 2);
        assert_eq!(connector.status().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_disconnect_is_ignored() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let connector = connector(&dialer);

        assert!(connector.acquire().await.is_ready());
        let stale = dialer.last_signal();
        connector.close();
        assert!(connector.acquire().await.is_ready());

        stale.notify();
        assert_eq!(connector.state(), ConnectionState::Ready);
        DisconnectSignal::detached().notify();
        assert_eq!(connector.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_close_and_status_target() {
        let store: Arc<dyn KeyValueStore> = Arc::new(crate::memory::MemoryStore::new());
        let connector = StoreConnector::new(Arc::new(StaticDialer::new(store)), policy());

        assert!(connector.acquire().await.is_ready());
        assert_eq!(connector.status().target, "static://memory");

        connector.close();
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }
}
