//! Fakes for exercising outage handling without a Redis server.
//!
//! Enabled for this crate's own tests and, through the `test-util` feature, for
//! downstream crates.

use crate::connector::{DisconnectSignal, StoreDialer};
use crate::error::{Result, StoreError};
use crate::memory::MemoryStore;
use crate::traits::{KeyValueStore, WindowHit};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// A dialer whose availability is controlled by the test.
///
/// Successful dials hand out a [`ScriptedStore`] over one shared
/// [`MemoryStore`], so data written through any handle is visible through
/// [`ScriptedDialer::shared`]. Taking the dialer down also breaks handles that
/// were already handed out, which simulates a mid-request outage.
pub struct ScriptedDialer {
    backing: Arc<MemoryStore>,
    up: Arc<AtomicBool>,
    fail_next: AtomicU32,
    dials: AtomicUsize,
    delay: Option<Duration>,
    signal: Mutex<Option<DisconnectSignal>>,
}

impl ScriptedDialer {
    /// A dialer that connects on every attempt.
    pub fn healthy() -> Self {
        Self {
            backing: Arc::new(MemoryStore::new()),
            up: Arc::new(AtomicBool::new(true)),
            fail_next: AtomicU32::new(0),
            dials: AtomicUsize::new(0),
            delay: None,
            signal: Mutex::new(None),
        }
    }

    /// A dialer that refuses every attempt until [`set_up`](Self::set_up).
    pub fn down() -> Self {
        let dialer = Self::healthy();
        dialer.set_up(false);
        dialer
    }

    /// Sleep this long inside every dial.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Bring the fake server up or down.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Fail the next `n` dials even while up.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of dial attempts so far.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Announce that the latest connection closed, the way a client library
    /// reports a dropped socket. Returns `false` if nothing was dialed yet.
    pub fn drop_connection(&self) -> bool {
        match self.signal.lock().clone() {
            Some(signal) => {
                signal.notify();
                true
            }
            None => false,
        }
    }

    /// Disconnect signal handed to the latest dial.
    pub fn last_signal(&self) -> DisconnectSignal {
        self.signal
            .lock()
            .clone()
            .unwrap_or_else(DisconnectSignal::detached)
    }

    /// The data behind every handle this dialer produced.
    pub fn shared(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.backing)
    }
}

#[async_trait]
impl StoreDialer for ScriptedDialer {
    async fn dial(&self, disconnected: DisconnectSignal) -> Result<Arc<dyn KeyValueStore>> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if scripted_failure || !self.up.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".to_string()));
        }

        *self.signal.lock() = Some(disconnected);
        Ok(Arc::new(ScriptedStore {
            backing: Arc::clone(&self.backing),
            up: Arc::clone(&self.up),
        }))
    }

    fn describe(&self) -> String {
        "scripted://".to_string()
    }
}

/// Handle produced by [`ScriptedDialer`].
///
/// Delegates to the shared backing store while the dialer is up and fails every
/// call with a connection error while it is down.
pub struct ScriptedStore {
    backing: Arc<MemoryStore>,
    up: Arc<AtomicBool>,
}

impl ScriptedStore {
    fn check(&self) -> Result<&MemoryStore> {
        if self.up.load(Ordering::SeqCst) {
            Ok(&self.backing)
        } else {
            Err(StoreError::Connection("connection reset by peer".to_string()))
        }
    }
}

#[async_trait]
impl KeyValueStore for ScriptedStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.check()?.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.check()?.ttl(key).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.check()?.get_many(keys).await
    }

    async fn set_many(&self, items: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        self.check()?.set_many(items, ttl).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        self.check()?.delete_many(keys).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.check()?.delete_prefix(prefix).await
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        self.check()?.set_add(key, members, ttl).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.check()?.set_members(key).await
    }

    async fn window_hit(&self, key: &str, now_ms: u64, window: Duration) -> Result<WindowHit> {
        self.check()?.window_hit(key, now_ms, window).await
    }

    async fn window_count(&self, key: &str, since_ms: u64) -> Result<u64> {
        self.check()?.window_count(key, since_ms).await
    }

    async fn window_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.check()?.window_remove(key, member).await
    }

    async fn ping(&self) -> Result<()> {
        self.check().map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "scripted"
    }
}

/// Kind of error a [`FailingStore`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused or reset.
    Connection,
    /// Command deadline exceeded.
    Timeout,
    /// Server rejected the command.
    Command,
}

/// A store where every operation fails.
#[derive(Debug, Clone, Copy)]
pub struct FailingStore {
    kind: FailureKind,
}

impl FailingStore {
    /// Fail with the given kind of error.
    pub fn new(kind: FailureKind) -> Self {
        Self { kind }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(match self.kind {
            FailureKind::Connection => StoreError::Connection("broken pipe".to_string()),
            FailureKind::Timeout => StoreError::Timeout,
            FailureKind::Command => StoreError::Command("WRONGTYPE".to_string()),
        })
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<()> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        self.fail()
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        self.fail()
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
        self.fail()
    }

    async fn get_many(&self, _keys: &[String]) -> Result<Vec<Option<String>>> {
        self.fail()
    }

    async fn set_many(&self, _items: &[(String, String)], _ttl: Option<Duration>) -> Result<()> {
        self.fail()
    }

    async fn delete_many(&self, _keys: &[String]) -> Result<u64> {
        self.fail()
    }

    async fn delete_prefix(&self, _prefix: &str) -> Result<u64> {
        self.fail()
    }

    async fn set_add(&self, _key: &str, _members: &[String], _ttl: Option<Duration>) -> Result<()> {
        self.fail()
    }

    async fn set_members(&self, _key: &str) -> Result<Vec<String>> {
        self.fail()
    }

    async fn window_hit(&self, _key: &str, _now_ms: u64, _window: Duration) -> Result<WindowHit> {
        self.fail()
    }

    async fn window_count(&self, _key: &str, _since_ms: u64) -> Result<u64> {
        self.fail()
    }

    async fn window_remove(&self, _key: &str, _member: &str) -> Result<bool> {
        self.fail()
    }

    async fn ping(&self) -> Result<()> {
        self.fail()
    }

    fn backend(&self) -> &'static str {
        "failing"
    }
}

/// Dialer that always hands out the same store.
pub struct StaticDialer {
    store: Arc<dyn KeyValueStore>,
}

impl StaticDialer {
    /// Hand out `store` on every dial.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreDialer for StaticDialer {
    async fn dial(&self, _disconnected: DisconnectSignal) -> Result<Arc<dyn KeyValueStore>> {
        Ok(Arc::clone(&self.store))
    }

    fn describe(&self) -> String {
        format!("static://{}", self.store.backend())
    }
}
