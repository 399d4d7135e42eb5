//! Integration tests for rapport-store

use futures::future::join_all;
use rapport_store::testing::{FailingStore, FailureKind, ScriptedDialer, StaticDialer};
use rapport_store::*;
use std::sync::Arc;
use std::time::Duration;

fn dual_tier(dialer: Arc<dyn StoreDialer>) -> DualTier {
    let config = StoreConfig::default();
    let connector = StoreConnector::from_config(dialer, &config);
    DualTier::new(Arc::new(connector), Arc::new(MemoryStore::new()))
}

#[tokio::test(start_paused = true)]
async fn test_outage_and_recovery_cycle() {
    let dialer = Arc::new(ScriptedDialer::healthy());
    let tiers = dual_tier(dialer.clone());

    let route = tiers.route().await;
    assert_eq!(route.tier(), Tier::Shared);
    route
        .store()
        .set("session:1", "alice".into(), Some(Duration::from_secs(60)))
        .await
        .unwrap();

    // shared store dies mid-request
    dialer.set_up(false);
    let err = route.store().get("session:1").await.unwrap_err();
    assert!(err.is_transport());
    tiers.report_failure(&route, &err);

    let route = tiers.route().await;
    assert_eq!(route.tier(), Tier::Fallback);
    assert_eq!(route.store().get("session:1").await.unwrap(), None);

    // recovery happens on the first call after the backoff
    dialer.set_up(true);
    tokio::time::advance(Duration::from_millis(100)).await;
    let route = tiers.route().await;
    assert_eq!(route.tier(), Tier::Shared);
    assert_eq!(
        route.store().get("session:1").await.unwrap(),
        Some("alice".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_outage_never_blocks_beyond_connect_timeout() {
    let dialer = Arc::new(ScriptedDialer::healthy().with_delay(Duration::from_secs(60)));
    let tiers = dual_tier(dialer.clone());

    let started = tokio::time::Instant::now();
    for _ in 0..20 {
        let route = tiers.route().await;
        assert_eq!(route.tier(), Tier::Fallback);
    }
    assert!(started.elapsed() <= Duration::from_secs(5));
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn test_command_errors_keep_connection() {
    let store: Arc<dyn KeyValueStore> = Arc::new(FailingStore::new(FailureKind::Command));
    let tiers = dual_tier(Arc::new(StaticDialer::new(store)));

    let route = tiers.route().await;
    let err = route.store().get("k").await.unwrap_err();
    assert!(!err.is_transport());
    tiers.report_failure(&route, &err);

    assert_eq!(tiers.connector().state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_timeouts_trip_connection() {
    let store: Arc<dyn KeyValueStore> = Arc::new(FailingStore::new(FailureKind::Timeout));
    let tiers = dual_tier(Arc::new(StaticDialer::new(store)));

    let route = tiers.route().await;
    let err = route.store().set("k", "v".into(), None).await.unwrap_err();
    tiers.report_failure(&route, &err);

    let status = tiers.connector().status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.failure_count, 1);
}

#[tokio::test]
async fn test_concurrent_window_hits_are_counted_once_each() {
    let store = Arc::new(MemoryStore::new());
    let now = unix_millis();

    let hits = join_all((0..50).map(|_| {
        let store = store.clone();
        async move {
            store
                .window_hit("ratelimit:sw:ip", now, Duration::from_secs(60))
                .await
                .unwrap()
                .count
        }
    }))
    .await;

    let mut counts = hits;
    counts.sort_unstable();
    assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
    assert_eq!(store.window_count("ratelimit:sw:ip", 0).await.unwrap(), 50);
}

#[test]
fn test_key_validation() {
    assert!(validate_key("cache:user:1").is_ok());
    assert!(validate_key("").is_err());
    assert!(validate_key("has space").is_err());
    assert!(validate_key(&"x".repeat(MAX_KEY_LEN + 1)).is_err());
    assert_eq!(namespaced("cache", "user:1"), "cache:user:1");
}

#[test]
fn test_store_error_display() {
    let err = StoreError::Connection("refused".to_string());
    assert!(err.to_string().contains("refused"));
}

// Require a running Redis: cargo test -- --ignored

#[cfg(feature = "redis")]
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_through_connector() {
    let config = StoreConfig::from_env().build();
    let dialer = Arc::new(RedisDialer::new(&config).unwrap());
    let tiers = dual_tier(dialer);

    let route = tiers.route().await;
    assert_eq!(route.tier(), Tier::Shared);

    route
        .store()
        .set_add("rapport:it:tags", &["a".into(), "b".into()], Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let mut members = route.store().set_members("rapport:it:tags").await.unwrap();
    members.sort();
    assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    route.store().delete("rapport:it:tags").await.unwrap();
}
