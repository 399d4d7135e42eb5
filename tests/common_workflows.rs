//! Integration tests for common Rapport workflows.
//!
//! Each test wires a full state layer over a fake dialer and drives it the way
//! request handlers would.

use rapport::prelude::*;
use rapport_store::testing::ScriptedDialer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Article {
    id: u32,
    title: String,
}

fn layer(dialer: Arc<ScriptedDialer>) -> StateLayer {
    StateLayer::with_dialer(dialer, StateConfig::default()).unwrap()
}

async fn six_rapid_hits(state: &StateLayer) -> Vec<RateLimitOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..6 {
        outcomes.push(
            state
                .limiter()
                .check("ip:1.2.3.4", Duration::from_millis(60_000), 5)
                .await
                .unwrap(),
        );
    }
    outcomes
}

// =============================================================================
// Healthy shared store
// =============================================================================

#[tokio::test]
async fn test_rate_limit_six_rapid_hits() {
    let state = layer(Arc::new(ScriptedDialer::healthy()));
    let now = rapport_store::unix_millis();

    let outcomes = six_rapid_hits(&state).await;
    let allowed: Vec<bool> = outcomes.iter().map(|o| o.allowed).collect();
    assert_eq!(allowed, vec![true, true, true, true, true, false]);

    let sixth = &outcomes[5];
    assert!(sixth.reset_at_ms >= now + 60_000);
    assert!(sixth.reset_at_ms < now + 62_000);

    let err = sixth.clone().into_result().unwrap_err();
    assert_eq!(err.status_code(), 429);
}

#[tokio::test]
async fn test_cache_populate_and_tag_invalidation() {
    let state = layer(Arc::new(ScriptedDialer::healthy()));
    let cache = state.cache();

    let article: Article = cache
        .get_or_populate("article:1", None, &["articles"], || async {
            Ok::<_, CacheError>(Article {
                id: 1,
                title: "Hello".into(),
            })
        })
        .await
        .unwrap();
    cache
        .set("article:2", &Article { id: 2, title: "World".into() }, None, &["articles"])
        .await
        .unwrap();
    cache.set("settings", &"dark", None, &["config"]).await.unwrap();

    assert_eq!(cache.get::<Article>("article:1").await.unwrap(), Some(article));

    assert_eq!(cache.delete_by_tag("articles").await.unwrap(), 2);
    assert_eq!(cache.get::<Article>("article:1").await.unwrap(), None);
    assert_eq!(cache.get::<Article>("article:2").await.unwrap(), None);
    assert_eq!(cache.get::<String>("settings").await.unwrap(), Some("dark".into()));
}

#[tokio::test(start_paused = true)]
async fn test_cache_entries_expire() {
    let state = layer(Arc::new(ScriptedDialer::healthy()));
    let cache = state.cache();

    cache
        .set("short", &42u32, Some(Duration::from_secs(5)), &[])
        .await
        .unwrap();
    assert_eq!(cache.get::<u32>("short").await.unwrap(), Some(42));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(cache.get::<u32>("short").await.unwrap(), None);
}

#[tokio::test]
async fn test_csrf_issue_verify_reissue() {
    let state = layer(Arc::new(ScriptedDialer::healthy()));
    let tokens = state.tokens();

    let first = tokens.issue("session-1").await.unwrap();
    assert!(tokens.verify("session-1", &first.value).await.unwrap());
    assert!(!tokens.verify("session-1", "some-other-string").await.unwrap());

    let second = tokens.issue("session-1").await.unwrap();
    assert!(!tokens.verify("session-1", &first.value).await.unwrap());
    assert!(tokens.verify("session-1", &second.value).await.unwrap());
}

// =============================================================================
// Shared store outage
// =============================================================================

#[tokio::test]
async fn test_everything_holds_on_fallback() {
    let dialer = Arc::new(ScriptedDialer::down());
    let state = layer(dialer.clone());

    let outcomes = six_rapid_hits(&state).await;
    let allowed: Vec<bool> = outcomes.iter().map(|o| o.allowed).collect();
    assert_eq!(allowed, vec![true, true, true, true, true, false]);
    assert!(outcomes.iter().all(|o| o.tier == Some(Tier::Fallback)));

    let cache = state.cache();
    cache.set("a", &1u32, None, &["t"]).await.unwrap();
    cache.set("b", &2u32, None, &[]).await.unwrap();
    assert_eq!(cache.get::<u32>("a").await.unwrap(), Some(1));
    assert_eq!(cache.delete_by_tag("t").await.unwrap(), 1);
    assert_eq!(cache.get::<u32>("a").await.unwrap(), None);
    assert_eq!(cache.get::<u32>("b").await.unwrap(), Some(2));

    let token = state.tokens().issue("s").await.unwrap();
    assert!(state.tokens().verify("s", &token.value).await.unwrap());

    // nothing reached the shared store
    assert_eq!(dialer.shared().key_count(), 0);
    assert_ne!(state.status().state, ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_hung_store_never_blocks_requests() {
    let dialer = Arc::new(ScriptedDialer::healthy().with_delay(Duration::from_secs(120)));
    let state = layer(dialer.clone());
    let connect_timeout = state.connector().policy().connect_timeout;

    let started = tokio::time::Instant::now();
    for _ in 0..10 {
        state.limiter().check("ip", Duration::from_secs(60), 100).await.unwrap();
        state.cache().get::<u32>("k").await.unwrap();
    }

    assert!(started.elapsed() <= connect_timeout);
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_switches_back_to_shared() {
    let dialer = Arc::new(ScriptedDialer::healthy());
    let state = layer(dialer.clone());

    state.cache().set("k", &"shared", None, &[]).await.unwrap();
    assert_eq!(state.warm_up().await, Tier::Shared);

    dialer.set_up(false);
    assert_eq!(state.cache().get::<String>("k").await.unwrap(), None);
    assert_eq!(state.cache().stats().errors, 1);

    dialer.set_up(true);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(
        state.cache().get::<String>("k").await.unwrap(),
        Some("shared".into())
    );
    assert_eq!(state.status().state, ConnectionState::Ready);
}

#[tokio::test]
async fn test_dropped_connection_redials_on_next_request() {
    let dialer = Arc::new(ScriptedDialer::healthy());
    let state = layer(dialer.clone());

    state.cache().set("k", &1u32, None, &[]).await.unwrap();
    assert!(dialer.drop_connection());
    assert_eq!(state.status().state, ConnectionState::Disconnected);

    assert_eq!(state.cache().get::<u32>("k").await.unwrap(), Some(1));
    assert_eq!(dialer.dial_count(), 2);
    assert_eq!(state.status().failure_count, 0);
}
