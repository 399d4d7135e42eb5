//! Redis-backed shared tier.
//!
//! Every command runs under the configured command timeout; a deadline miss is
//! reported as [`StoreError::Timeout`] so the connector can count it.

use crate::config::StoreConfig;
use crate::connector::{DisconnectSignal, StoreDialer};
use crate::error::{Result, StoreError};
use crate::traits::{KeyValueStore, WindowHit, event_member, member_timestamp, window_start};
use async_trait::async_trait;
use redis::{
    AsyncConnectionConfig, Client, IntoConnectionInfo, ProtocolVersion, PushInfo, PushKind,
};
use redis::aio::MultiplexedConnection;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Keys scanned per SCAN round trip in `delete_prefix`.
const SCAN_BATCH: usize = 250;

/// Adds members to a set and only ever lengthens its expiry.
///
/// ARGV[1] is the TTL in milliseconds, `0` meaning persistent.
const SET_ADD_SCRIPT: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
local existed = redis.call('EXISTS', key)
redis.call('SADD', key, unpack(ARGV, 2))
if ttl == 0 then
    redis.call('PERSIST', key)
    return 1
end
local current = redis.call('PTTL', key)
if existed == 0 or (current >= 0 and current < ttl) then
    redis.call('PEXPIRE', key, ttl)
end
return 1
"#;

/// Redis store over a multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    command_timeout: Duration,
}

impl RedisStore {
    /// Wrap an established connection.
    pub fn new(conn: MultiplexedConnection, command_timeout: Duration) -> Self {
        Self {
            conn,
            command_timeout,
        }
    }

    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.run(async move { redis::cmd("GET").arg(key).query_async(&mut conn).await })
            .await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.run(async move { cmd.query_async::<()>(&mut conn).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .run(async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: u64 = self
            .run(async move { redis::cmd("EXISTS").arg(key).query_async(&mut conn).await })
            .await?;
        Ok(found > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: u64 = self
            .run(async move {
                redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ms: i64 = self
            .run(async move { redis::cmd("PTTL").arg(key).query_async(&mut conn).await })
            .await?;

        // -2: missing, -1: no expiry
        match ms {
            ms if ms > 0 => Ok(Some(Duration::from_millis(ms as u64))),
            _ => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        self.run(async move { redis::cmd("MGET").arg(keys).query_async(&mut conn).await })
            .await
    }

    async fn set_many(&self, items: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in items {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            cmd.ignore();
        }
        let mut conn = self.conn.clone();
        self.run(async move { pipe.query_async::<()>(&mut conn).await })
            .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.run(async move { redis::cmd("DEL").arg(keys).query_async(&mut conn).await })
            .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = escape_glob(prefix);
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let mut conn = self.conn.clone();
            let (next, keys): (u64, Vec<String>) = self
                .run(async {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            removed += self.delete_many(&keys).await?;

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed, "Deleted keys by prefix in Redis");
        Ok(removed)
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let ttl_ms = ttl.map(ttl_millis).unwrap_or(0);
        let script = redis::Script::new(SET_ADD_SCRIPT);
        let mut invocation = script.key(key);
        invocation.arg(ttl_ms).arg(members);

        let mut conn = self.conn.clone();
        self.run(async move { invocation.invoke_async::<i64>(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.run(async move { redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await })
            .await
    }

    async fn window_hit(&self, key: &str, now_ms: u64, window: Duration) -> Result<WindowHit> {
        let cutoff = window_start(now_ms, window);
        let member = event_member(now_ms);

        // MULTI/EXEC keeps remove-old/add-new/count atomic against other writers
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", cutoff))
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(window))
            .ignore();

        let mut conn = self.conn.clone();
        let (count, oldest): (u64, Vec<String>) = self
            .run(async move { pipe.query_async(&mut conn).await })
            .await?;

        let oldest_ms = oldest
            .first()
            .and_then(|m| member_timestamp(m))
            .unwrap_or(now_ms);

        trace!(key = %key, count, "Redis window hit");
        Ok(WindowHit {
            count,
            oldest_ms,
            member,
        })
    }

    async fn window_count(&self, key: &str, since_ms: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        self.run(async move {
            redis::cmd("ZCOUNT")
                .arg(key)
                .arg(since_ms)
                .arg("+inf")
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn window_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .run(async move {
                redis::cmd("ZREM")
                    .arg(key)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self
            .run(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

/// Dials Redis and hands the connector a ready [`RedisStore`].
///
/// Connections speak RESP3 so the client can push a disconnection notice,
/// which is forwarded to the connector as soon as the socket drops.
pub struct RedisDialer {
    client: Client,
    url: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl RedisDialer {
    /// Create a dialer.
    ///
    /// Fails only on configuration problems; no network traffic happens here.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let info = config
            .connection_url()
            .into_connection_info()
            .map_err(|e| StoreError::Config(e.to_string()))?;
        let settings = info.redis_settings().clone().set_protocol(ProtocolVersion::RESP3);
        let client = Client::open(info.set_redis_settings(settings))
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
        })
    }
}

#[async_trait]
impl StoreDialer for RedisDialer {
    async fn dial(&self, disconnected: DisconnectSignal) -> Result<Arc<dyn KeyValueStore>> {
        debug!(url = %self.url, "Dialing Redis");
        let on_push = move |push: PushInfo| {
            if push.kind == PushKind::Disconnection {
                disconnected.notify();
            }
            Ok::<(), std::convert::Infallible>(())
        };
        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(Some(self.connect_timeout))
            .set_response_timeout(Some(self.command_timeout))
            .set_push_sender(on_push);

        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection_with_config(&config),
        )
        .await
        .map_err(|_| StoreError::Timeout)?
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = RedisStore::new(conn, self.command_timeout);
        store.ping().await?;

        info!(url = %self.url, "Redis connection established");
        Ok(Arc::new(store))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
