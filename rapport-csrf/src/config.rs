use crate::error::{CsrfError, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use std::time::Duration;

/// Shortest accepted signing secret.
pub const MIN_SECRET_LEN: usize = 32;

/// CSRF protection configuration
#[derive(Clone)]
pub struct CsrfConfig {
    /// Secret key for token digests (must be at least 32 bytes)
    pub secret: Vec<u8>,

    /// Token time-to-live
    pub token_ttl: Duration,

    /// Header name for CSRF token
    pub header_name: String,

    /// Namespace for stored tokens
    pub key_prefix: String,
}

impl CsrfConfig {
    /// Create a new CSRF configuration
    pub fn new(secret: Vec<u8>) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CsrfError::Config(format!(
                "Secret key must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        Ok(Self::with_secret_unchecked(secret))
    }

    fn with_secret_unchecked(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_ttl: Duration::from_secs(3600),
            header_name: "X-CSRF-Token".to_string(),
            key_prefix: "csrf".to_string(),
        }
    }

    /// Build from `RAPPORT_CSRF_SECRET` (URL-safe base64) and
    /// `RAPPORT_CSRF_TTL_SECS`.
    ///
    /// A missing secret is generated, which is only correct for a single
    /// process: tokens issued by one instance will not verify on another.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("RAPPORT_CSRF_SECRET") {
            Ok(encoded) => {
                let secret = URL_SAFE_NO_PAD
                    .decode(encoded.trim().trim_end_matches('='))
                    .map_err(|e| CsrfError::Config(format!("RAPPORT_CSRF_SECRET: {}", e)))?;
                Self::new(secret)?
            }
            Err(_) => {
                tracing::warn!("RAPPORT_CSRF_SECRET not set, using a per-process secret");
                Self::default()
            }
        };

        if let Ok(ttl) = std::env::var("RAPPORT_CSRF_TTL_SECS")
            && let Ok(secs) = ttl.trim().parse::<u64>()
            && secs > 0
        {
            config.token_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Generate a secret key
    pub fn generate_secret() -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..MIN_SECRET_LEN).map(|_| rng.r#gen()).collect()
    }

    /// Set token TTL
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Set header name
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    /// Set the storage namespace
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Storage key for a session's token
    pub fn token_key(&self, session_id: &str) -> String {
        format!("{}:{}", self.key_prefix, session_id)
    }

    /// Reject settings that would break issuance.
    pub fn validate(&self) -> Result<()> {
        if self.secret.len() < MIN_SECRET_LEN {
            return Err(CsrfError::Config(format!(
                "Secret key must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if self.token_ttl.is_zero() {
            return Err(CsrfError::Config("token_ttl must be non-zero".to_string()));
        }
        if self.key_prefix.is_empty() {
            return Err(CsrfError::Config("key_prefix must not be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self::with_secret_unchecked(Self::generate_secret())
    }
}

impl std::fmt::Debug for CsrfConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfConfig")
            .field("secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("header_name", &self.header_name)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}
