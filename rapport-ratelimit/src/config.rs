//! Rate limiter configuration and builder

use crate::RateLimiter;
use crate::error::{RateLimitError, RateLimitResult};
use rapport_store::DualTier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// A limit of `limit` events per trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Events allowed inside one window.
    pub limit: u64,
    /// Length of the trailing window.
    #[serde(with = "window_millis")]
    pub window: Duration,
}

impl Policy {
    /// Create a policy.
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// 5 per 15 minutes, for credential and password-reset endpoints.
    pub const fn strict() -> Self {
        Self::new(5, Duration::from_secs(15 * 60))
    }

    /// 100 per 15 minutes, for ordinary API traffic.
    pub const fn standard() -> Self {
        Self::new(100, Duration::from_secs(15 * 60))
    }

    /// 300 per minute, for cheap read-only endpoints.
    pub const fn relaxed() -> Self {
        Self::new(300, Duration::from_secs(60))
    }

    /// Reject windows that cannot hold an event.
    pub fn validate(&self) -> RateLimitResult<()> {
        if self.window.as_millis() == 0 {
            return Err(RateLimitError::config("window must be at least 1ms"));
        }
        Ok(())
    }
}

impl FromStr for Policy {
    type Err = RateLimitError;

    /// Parse `<limit>/<window_ms>`, e.g. `5/900000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (limit, window) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| RateLimitError::config(format!("expected <limit>/<window_ms>, got '{}'", s)))?;

        let limit = limit
            .trim()
            .parse()
            .map_err(|_| RateLimitError::config(format!("invalid limit in '{}'", s)))?;
        let window_ms: u64 = window
            .trim()
            .parse()
            .map_err(|_| RateLimitError::config(format!("invalid window in '{}'", s)))?;

        let policy = Self::new(limit, Duration::from_millis(window_ms));
        policy.validate()?;
        Ok(policy)
    }
}

/// Named policy tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// See [`Policy::strict`].
    Strict,
    /// See [`Policy::standard`].
    Standard,
    /// See [`Policy::relaxed`].
    Relaxed,
}

impl PolicyKind {
    /// Name used in storage keys and environment variables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Standard => "standard",
            Self::Relaxed => "relaxed",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the rate limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Key prefix for storage
    pub key_prefix: String,
    /// Strict policy
    pub strict: Policy,
    /// Standard policy
    pub standard: Policy,
    /// Relaxed policy
    pub relaxed: Policy,
    /// Allow the request when the shared store fails mid-check instead of
    /// recounting on the fallback
    pub fail_open: bool,
    /// Keep rejected attempts in the window so hammering extends the lockout
    pub record_rejected: bool,
    /// Bypass keys (these keys will never be rate limited)
    pub bypass_keys: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratelimit:sw".to_string(),
            strict: Policy::strict(),
            standard: Policy::standard(),
            relaxed: Policy::relaxed(),
            fail_open: false,
            record_rejected: true,
            bypass_keys: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// Create a new configuration builder
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Load overrides from the environment.
    ///
    /// `RAPPORT_RATELIMIT_{STRICT,STANDARD,RELAXED}` take `<limit>/<window_ms>`;
    /// `RAPPORT_RATELIMIT_FAIL_OPEN` takes `true`/`false`. Malformed values are
    /// reported and the default is kept.
    pub fn from_env() -> RateLimiterBuilder {
        let mut builder = RateLimiterBuilder::new();

        for kind in [PolicyKind::Strict, PolicyKind::Standard, PolicyKind::Relaxed] {
            let var = format!("RAPPORT_RATELIMIT_{}", kind.as_str().to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                match value.parse::<Policy>() {
                    Ok(policy) => builder = builder.policy(kind, policy),
                    Err(err) => warn!(var = %var, error = %err, "Ignoring malformed rate limit policy"),
                }
            }
        }

        if let Ok(value) = std::env::var("RAPPORT_RATELIMIT_FAIL_OPEN")
            && let Ok(fail_open) = value.trim().parse::<bool>()
        {
            builder = builder.fail_open(fail_open);
        }

        builder
    }

    /// Policy for a tier.
    pub fn policy(&self, kind: PolicyKind) -> Policy {
        match kind {
            PolicyKind::Strict => self.strict,
            PolicyKind::Standard => self.standard,
            PolicyKind::Relaxed => self.relaxed,
        }
    }

    /// Check if a key should bypass rate limiting
    pub fn should_bypass(&self, key: &str) -> bool {
        self.bypass_keys.iter().any(|k| k == key)
    }

    /// Reject configurations that can never work.
    pub fn validate(&self) -> RateLimitResult<()> {
        if self.key_prefix.is_empty() {
            return Err(RateLimitError::config("key_prefix must not be empty"));
        }
        self.strict.validate()?;
        self.standard.validate()?;
        self.relaxed.validate()
    }
}

/// Builder for creating a RateLimiter
#[derive(Default)]
pub struct RateLimiterBuilder {
    config: RateLimitConfig,
}

impl RateLimiterBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key prefix for storage
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Replace one of the named policies
    pub fn policy(mut self, kind: PolicyKind, policy: Policy) -> Self {
        match kind {
            PolicyKind::Strict => self.config.strict = policy,
            PolicyKind::Standard => self.config.standard = policy,
            PolicyKind::Relaxed => self.config.relaxed = policy,
        }
        self
    }

    /// Allow requests when the shared store fails mid-check
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.config.fail_open = fail_open;
        self
    }

    /// Whether rejected attempts count toward the window
    pub fn record_rejected(mut self, record: bool) -> Self {
        self.config.record_rejected = record;
        self
    }

    /// Add a key that should bypass rate limiting
    pub fn bypass_key(mut self, key: impl Into<String>) -> Self {
        self.config.bypass_keys.push(key.into());
        self
    }

    /// Add multiple keys that should bypass rate limiting
    pub fn bypass_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.bypass_keys.extend(keys.into_iter().map(|k| k.into()));
        self
    }

    /// Finish the configuration without building a limiter
    pub fn config(self) -> RateLimitConfig {
        self.config
    }

    /// Build the rate limiter
    pub fn build(self, tiers: DualTier) -> RateLimitResult<RateLimiter> {
        self.config.validate()?;

        debug!(
            strict = ?self.config.strict,
            standard = ?self.config.standard,
            relaxed = ?self.config.relaxed,
            fail_open = self.config.fail_open,
            "Building rate limiter"
        );

        Ok(RateLimiter::new(tiers, self.config))
    }
}

mod window_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(window: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (window.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies() {
        let config = RateLimitConfig::default();
        assert_eq!(config.policy(PolicyKind::Strict), Policy::new(5, Duration::from_secs(900)));
        assert_eq!(config.policy(PolicyKind::Standard).limit, 100);
        assert_eq!(config.policy(PolicyKind::Relaxed).window, Duration::from_secs(60));
        assert!(!config.fail_open);
        assert!(config.record_rejected);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policy_parse() {
        let policy: Policy = "10/60000".parse().unwrap();
        assert_eq!(policy, Policy::new(10, Duration::from_secs(60)));

        let policy: Policy = " 3 / 500 ".parse().unwrap();
        assert_eq!(policy, Policy::new(3, Duration::from_millis(500)));

        assert!("10".parse::<Policy>().is_err());
        assert!("x/1000".parse::<Policy>().is_err());
        assert!("10/0".parse::<Policy>().is_err());
    }

    #[test]
    fn test_builder() {
        let config = RateLimitConfig::builder()
            .policy(PolicyKind::Strict, Policy::new(3, Duration::from_secs(60)))
            .fail_open(true)
            .record_rejected(false)
            .bypass_key("127.0.0.1")
            .bypass_keys(["10.0.0.1", "10.0.0.2"])
            .config();

        assert_eq!(config.strict.limit, 3);
        assert!(config.fail_open);
        assert!(!config.record_rejected);
        assert!(config.should_bypass("10.0.0.2"));
        assert!(!config.should_bypass("10.0.0.3"));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = RateLimitConfig::builder()
            .policy(PolicyKind::Relaxed, Policy::new(1, Duration::ZERO))
            .config();
        assert!(matches!(config.validate(), Err(RateLimitError::Config(_))));
    }

    #[test]
    fn test_policy_serde() {
        let json = serde_json::to_value(Policy::strict()).unwrap();
        assert_eq!(json["limit"], 5);
        assert_eq!(json["window"], 900_000);
        assert_eq!(serde_json::to_value(PolicyKind::Relaxed).unwrap(), "relaxed");
    }
}
