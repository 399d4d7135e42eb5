//! Session-bound token storage over the dual-tier store.

use crate::config::CsrfConfig;
use crate::error::{CsrfError, Result};
use crate::token::{CsrfToken, MAX_TOKEN_LEN, TokenRecord, TokenSigner};
use rapport_store::{DualTier, KeyValueStore, Route, StoreError, Tier, validate_key};
use tracing::{debug, trace, warn};

/// Issues and checks one live token per session.
///
/// The store keeps a keyed digest of each token, never the token itself, so a
/// dump of the shared store does not leak usable tokens.
#[derive(Clone)]
pub struct TokenStore {
    tiers: DualTier,
    config: CsrfConfig,
    signer: TokenSigner,
}

impl TokenStore {
    /// Create a token store over `tiers`.
    pub fn new(tiers: DualTier, config: CsrfConfig) -> Result<Self> {
        config.validate()?;
        debug!(prefix = %config.key_prefix, ttl = ?config.token_ttl, "Creating token store");

        let signer = TokenSigner::new(&config.secret);
        Ok(Self {
            tiers,
            config,
            signer,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Issue a fresh token for `session_id`, superseding any previous one.
    pub async fn issue(&self, session_id: &str) -> Result<CsrfToken> {
        validate_session(session_id)?;

        let token = CsrfToken::generate(self.config.token_ttl);
        let record = serde_json::to_string(&self.signer.record(session_id, &token)?)?;
        let key = self.config.token_key(session_id);

        let route = self.tiers.route().await;
        let tier = match route
            .store()
            .set(&key, record.clone(), Some(self.config.token_ttl))
            .await
        {
            Ok(()) => route.tier(),
            Err(err) => {
                self.absorb(&route, session_id, &err);
                if !route.is_shared() {
                    return Err(err.into());
                }
                self.tiers
                    .fallback_route()
                    .store()
                    .set(&key, record, Some(self.config.token_ttl))
                    .await?;
                Tier::Fallback
            }
        };

        if tier == Tier::Shared {
            self.drop_fallback_copy(&key).await;
        }

        debug!(session = %session_id, tier = %tier, "Issued CSRF token");
        Ok(token)
    }

    /// Whether `token` is the live token for `session_id`.
    ///
    /// Absent, expired and mismatched tokens are all `Ok(false)`; an expired
    /// record is deleted on the way out.
    pub async fn verify(&self, session_id: &str, token: &str) -> Result<bool> {
        validate_session(session_id)?;

        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            trace!(session = %session_id, "Rejecting malformed CSRF token");
            return Ok(false);
        }

        let key = self.config.token_key(session_id);
        let route = self.tiers.route().await;
        let (route, stored) = match route.store().get(&key).await {
            Ok(stored) => (route, stored),
            Err(err) => {
                self.absorb(&route, session_id, &err);
                if !route.is_shared() {
                    return Err(err.into());
                }
                let fallback = self.tiers.fallback_route();
                let stored = fallback.store().get(&key).await?;
                (fallback, stored)
            }
        };

        let Some(stored) = stored else {
            trace!(session = %session_id, tier = %route.tier(), "No CSRF token for session");
            return Ok(false);
        };

        let record: TokenRecord = match serde_json::from_str(&stored) {
            Ok(record) => record,
            Err(err) => {
                warn!(session = %session_id, error = %err, "Discarding unreadable CSRF record");
                self.delete_on(&route, &key, session_id).await;
                return Ok(false);
            }
        };

        if record.is_expired() {
            debug!(session = %session_id, "CSRF token expired");
            self.delete_on(&route, &key, session_id).await;
            return Ok(false);
        }

        let valid = self.signer.matches(session_id, token, &record);
        if !valid {
            debug!(session = %session_id, tier = %route.tier(), "CSRF token mismatch");
        }
        Ok(valid)
    }

    /// Like [`verify`](Self::verify), but as an error for handlers that bail
    /// with `?`.
    pub async fn require(&self, session_id: &str, token: Option<&str>) -> Result<()> {
        let token = token.ok_or(CsrfError::MissingToken)?;
        if self.verify(session_id, token).await? {
            Ok(())
        } else {
            Err(CsrfError::InvalidToken)
        }
    }

    /// Delete the token for `session_id`. Returns whether one was removed.
    ///
    /// While the shared store is unavailable only the fallback copy is
    /// cleared; a token issued on the shared tier stays valid there until it
    /// expires.
    pub async fn revoke(&self, session_id: &str) -> Result<bool> {
        validate_session(session_id)?;
        let key = self.config.token_key(session_id);

        let route = self.tiers.route().await;
        let removed = match route.store().delete(&key).await {
            Ok(removed) => {
                if route.is_shared() {
                    self.drop_fallback_copy(&key).await;
                }
                removed
            }
            Err(err) => {
                self.absorb(&route, session_id, &err);
                if !route.is_shared() {
                    return Err(err.into());
                }
                self.tiers.fallback_route().store().delete(&key).await?
            }
        };

        debug!(session = %session_id, removed, tier = %route.tier(), "Revoked CSRF token");
        Ok(removed)
    }

    /// Revoke and issue in one call, e.g. after login.
    pub async fn rotate(&self, session_id: &str) -> Result<CsrfToken> {
        self.revoke(session_id).await?;
        self.issue(session_id).await
    }

    async fn delete_on(&self, route: &Route, key: &str, session_id: &str) {
        if let Err(err) = route.store().delete(key).await {
            self.absorb(route, session_id, &err);
        }
    }

    // A token issued during an outage must not verify after the shared tier
    // takes over with a newer one.
    async fn drop_fallback_copy(&self, key: &str) {
        if let Err(err) = self.tiers.fallback().delete(key).await {
            trace!(key = %key, error = %err, "Fallback cleanup failed");
        }
    }

    fn absorb(&self, route: &Route, session_id: &str, err: &StoreError) {
        self.tiers.report_failure(route, err);
        warn!(session = %session_id, tier = %route.tier(), error = %err, "CSRF store call failed");
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("config", &self.config)
            .finish()
    }
}

fn validate_session(session_id: &str) -> Result<()> {
    validate_key(session_id).map_err(|err| match err {
        StoreError::InvalidKey(msg) => CsrfError::InvalidSession(msg),
        other => CsrfError::Store(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rapport_store::testing::{FailingStore, FailureKind, ScriptedDialer, StaticDialer};
    use rapport_store::{ConnectPolicy, MemoryStore, StoreConnector, StoreDialer};
    use std::sync::Arc;
    use std::time::Duration;

    fn tiers_with(dialer: Arc<dyn StoreDialer>) -> DualTier {
        let connector = StoreConnector::new(dialer, ConnectPolicy::default());
        DualTier::new(Arc::new(connector), Arc::new(MemoryStore::new()))
    }

    fn config() -> CsrfConfig {
        CsrfConfig::new(b"test_secret_key_32_bytes_long!!!".to_vec()).unwrap()
    }

    fn store() -> TokenStore {
        TokenStore::new(tiers_with(Arc::new(ScriptedDialer::healthy())), config()).unwrap()
    }

    #[tokio::test]
    async fn test_issue_then_verify() {
        let tokens = store();
        let token = tokens.issue("session-1").await.unwrap();

        assert!(tokens.verify("session-1", &token.value).await.unwrap());
        assert!(!tokens.verify("session-1", "not-the-token").await.unwrap());
        assert!(!tokens.verify("session-2", &token.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_reissue_supersedes() {
        let tokens = store();
        let first = tokens.issue("s").await.unwrap();
        let second = tokens.issue("s").await.unwrap();

        assert!(!tokens.verify("s", &first.value).await.unwrap());
        assert!(tokens.verify("s", &second.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_stored_value_is_a_digest() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let tokens = TokenStore::new(tiers_with(dialer.clone()), config()).unwrap();
        let token = tokens.issue("s").await.unwrap();

        let raw = dialer.shared().get("csrf:s").await.unwrap().unwrap();
        assert!(!raw.contains(&token.value));
        let record: TokenRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.expires_at, token.expires_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_ttl_expires_token() {
        let config = config().with_token_ttl(Duration::from_secs(5));
        let tokens =
            TokenStore::new(tiers_with(Arc::new(ScriptedDialer::healthy())), config).unwrap();
        let token = tokens.issue("s").await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!tokens.verify("s", &token.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_record_is_deleted() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let tokens = TokenStore::new(tiers_with(dialer.clone()), config()).unwrap();

        let mut token = CsrfToken::generate(Duration::from_secs(60));
        token.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        let record = TokenSigner::new(&tokens.config().secret).record("s", &token).unwrap();
        dialer
            .shared()
            .set("csrf:s", serde_json::to_string(&record).unwrap(), None)
            .await
            .unwrap();

        assert!(!tokens.verify("s", &token.value).await.unwrap());
        assert!(!dialer.shared().exists("csrf:s").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_record_fails_closed() {
        let dialer = Arc::new(ScriptedDialer::healthy());
        let tokens = TokenStore::new(tiers_with(dialer.clone()), config()).unwrap();
        dialer.shared().set("csrf:s", "garbage".into(), None).await.unwrap();

        assert!(!tokens.verify("s", "anything").await.unwrap());
        assert!(!dialer.shared().exists("csrf:s").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke() {
        let tokens = store();
        let token = tokens.issue("s").await.unwrap();

        assert!(tokens.revoke("s").await.unwrap());
        assert!(!tokens.revoke("s").await.unwrap());
        assert!(!tokens.verify("s", &token.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotate() {
        let tokens = store();
        let old = tokens.issue("s").await.unwrap();
        let new = tokens.rotate("s").await.unwrap();

        assert!(!tokens.verify("s", &old.value).await.unwrap());
        assert!(tokens.verify("s", &new.value).await.unwrap());
    }

    #[tokio::test]
    async fn test_require() {
        let tokens = store();
        let token = tokens.issue("s").await.unwrap();

        assert!(tokens.require("s", Some(&token.value)).await.is_ok());
        assert!(matches!(
            tokens.require("s", None).await,
            Err(CsrfError::MissingToken)
        ));
        let err = tokens.require("s", Some("forged")).await.unwrap_err();
        assert!(matches!(err, CsrfError::InvalidToken));
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_invalid_session_rejected() {
        let tokens = store();
        assert!(matches!(
            tokens.issue("").await,
            Err(CsrfError::InvalidSession(_))
        ));
        assert!(matches!(
            tokens.verify("has space", "t").await,
            Err(CsrfError::InvalidSession(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_token_is_false() {
        let tokens = store();
        tokens.issue("s").await.unwrap();
        let huge = "a".repeat(MAX_TOKEN_LEN + 1);
        assert!(!tokens.verify("s", &huge).await.unwrap());
        assert!(!tokens.verify("s", "").await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_failure_serves_from_fallback() {
        let store: Arc<dyn KeyValueStore> = Arc::new(FailingStore::new(FailureKind::Timeout));
        let tiers = tiers_with(Arc::new(StaticDialer::new(store)));
        let tokens = TokenStore::new(tiers.clone(), config()).unwrap();

        let token = tokens.issue("s").await.unwrap();
        assert!(tiers.fallback().exists("csrf:s").await.unwrap());
        assert!(tokens.verify("s", &token.value).await.unwrap());
        assert!(tokens.revoke("s").await.unwrap());
        assert!(!tiers.fallback().exists("csrf:s").await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_issue_clears_fallback_copy() {
        let dialer = Arc::new(ScriptedDialer::down());
        let tiers = tiers_with(dialer.clone());
        let tokens = TokenStore::new(tiers.clone(), config()).unwrap();

        let during = tokens.issue("s").await.unwrap();
        assert!(tiers.fallback().exists("csrf:s").await.unwrap());

        dialer.set_up(true);
        tiers.connector().close();
        let after = tokens.issue("s").await.unwrap();

        assert!(!tiers.fallback().exists("csrf:s").await.unwrap());
        assert!(tokens.verify("s", &after.value).await.unwrap());
        assert!(!tokens.verify("s", &during.value).await.unwrap());
    }
}
