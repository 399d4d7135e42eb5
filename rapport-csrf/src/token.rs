use crate::error::{CsrfError, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Longest token accepted for verification; generated tokens are 43 chars.
pub const MAX_TOKEN_LEN: usize = 128;

/// CSRF token handed to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfToken {
    /// Random token value
    pub value: String,

    /// Token creation timestamp
    pub issued_at: DateTime<Utc>,

    /// Token expiration timestamp
    pub expires_at: DateTime<Utc>,
}

impl CsrfToken {
    /// Generate a new CSRF token
    pub fn generate(ttl: Duration) -> Self {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; 32] = rng.r#gen();
        let value = URL_SAFE_NO_PAD.encode(random_bytes);

        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));

        Self {
            value,
            issued_at,
            expires_at,
        }
    }

    /// Check if token is expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// What the store keeps per session: a digest, never the token itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Keyed digest of session id and token
    pub digest: String,

    /// Token creation timestamp
    pub issued_at: DateTime<Utc>,

    /// Token expiration timestamp
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Check if the recorded token is expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Computes and checks token digests.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    /// Create a signer over `secret`.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    fn mac(&self, session_id: &str, token: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CsrfError::Internal(e.to_string()))?;
        mac.update(session_id.as_bytes());
        mac.update(&[0]);
        mac.update(token.as_bytes());
        Ok(mac)
    }

    /// Record for `token` bound to `session_id`.
    pub fn record(&self, session_id: &str, token: &CsrfToken) -> Result<TokenRecord> {
        let digest = self.mac(session_id, &token.value)?.finalize().into_bytes();
        Ok(TokenRecord {
            digest: URL_SAFE_NO_PAD.encode(digest),
            issued_at: token.issued_at,
            expires_at: token.expires_at,
        })
    }

    /// Constant-time check of `token` against a stored record.
    pub fn matches(&self, session_id: &str, token: &str, record: &TokenRecord) -> bool {
        let Ok(expected) = URL_SAFE_NO_PAD.decode(&record.digest) else {
            return false;
        };
        match self.mac(session_id, token) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}
