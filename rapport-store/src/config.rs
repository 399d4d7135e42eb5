//! Store configuration.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the process is running.
///
/// Caching is switched off outside production so correctness tests never
/// depend on what a previous run left in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Deployed service.
    #[default]
    Production,
    /// Local developer machine.
    Development,
    /// Automated test run.
    Test,
}

impl ExecutionMode {
    /// Parse a mode name (`production`, `development`/`dev`/`local`, `test`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" | "local" => Some(Self::Development),
            "test" | "testing" => Some(Self::Test),
            _ => None,
        }
    }

    /// Whether response caching should be active in this mode.
    pub fn caching_enabled(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Shared-store connection and resilience configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS).
    pub url: String,
    /// Username for Redis 6+ ACL.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Database number (0-15).
    pub database: Option<u8>,
    /// Deadline for establishing a connection.
    #[serde(with = "millis", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Deadline for a single command or batch.
    ///
    /// Must be shorter than `connect_timeout`. A call that dials and then runs
    /// its command waits at most `connect_timeout + command_timeout`; every
    /// later call waits at most `command_timeout`.
    #[serde(with = "millis", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Consecutive connect failures tolerated before cooling down.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first reconnect attempt; doubles per failure.
    #[serde(with = "millis", default = "default_retry_backoff")]
    pub retry_backoff: Duration,
    /// Upper bound for the reconnect delay.
    #[serde(with = "millis", default = "default_max_backoff")]
    pub max_backoff: Duration,
    /// How long the circuit stays open once `max_retries` is exceeded.
    #[serde(with = "millis", default = "default_cooldown")]
    pub cooldown: Duration,
    /// Execution mode.
    #[serde(default)]
    pub mode: ExecutionMode,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            username: None,
            password: None,
            database: None,
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            max_backoff: default_max_backoff(),
            cooldown: default_cooldown(),
            mode: ExecutionMode::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> StoreConfigBuilder {
        let mut builder = StoreConfigBuilder::new();

        if let Ok(url) = std::env::var("RAPPORT_REDIS_URL") {
            builder = builder.url(url);
        }

        if let Ok(username) = std::env::var("RAPPORT_REDIS_USERNAME") {
            builder = builder.username(username);
        }

        if let Ok(password) = std::env::var("RAPPORT_REDIS_PASSWORD") {
            builder = builder.password(password);
        }

        if let Ok(db) = std::env::var("RAPPORT_REDIS_DATABASE")
            && let Ok(db_num) = db.parse()
        {
            builder = builder.database(db_num);
        }

        if let Some(ms) = env_u64("RAPPORT_CONNECT_TIMEOUT_MS") {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }

        if let Some(ms) = env_u64("RAPPORT_COMMAND_TIMEOUT_MS") {
            builder = builder.command_timeout(Duration::from_millis(ms));
        }

        if let Some(retries) = env_u64("RAPPORT_MAX_RETRIES") {
            builder = builder.max_retries(retries as u32);
        }

        if let Some(ms) = env_u64("RAPPORT_MAX_BACKOFF_MS") {
            builder = builder.max_backoff(Duration::from_millis(ms));
        }

        if let Some(secs) = env_u64("RAPPORT_COOLDOWN_SECS") {
            builder = builder.cooldown(Duration::from_secs(secs));
        }

        if let Ok(mode) = std::env::var("RAPPORT_ENV")
            && let Some(mode) = ExecutionMode::parse(&mode)
        {
            builder = builder.mode(mode);
        }

        builder
    }

    /// Get the full Redis URL with auth and database.
    pub fn connection_url(&self) -> String {
        let mut url = self.url.clone();

        if let Some(password) = &self.password {
            let auth = match &self.username {
                Some(username) => format!("{}:{}@", username, password),
                None => format!(":{}@", password),
            };
            for scheme in ["rediss://", "redis://"] {
                if url.starts_with(scheme) {
                    url = url.replacen(scheme, &format!("{}{}", scheme, auth), 1);
                    break;
                }
            }
        }

        if let Some(db) = self.database {
            url = format!("{}/{}", url.trim_end_matches('/'), db);
        }

        url
    }

    /// Reject configurations that can never work.
    ///
    /// Only called at initialization; per-request paths never see these errors.
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| StoreError::Config(format!("invalid store url '{}': {}", self.url, e)))?;

        if !matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
            return Err(StoreError::Config(format!(
                "unsupported store url scheme '{}'",
                parsed.scheme()
            )));
        }

        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(StoreError::Config("timeouts must be non-zero".to_string()));
        }

        if self.command_timeout >= self.connect_timeout {
            return Err(StoreError::Config(format!(
                "command_timeout ({:?}) must be shorter than connect_timeout ({:?})",
                self.command_timeout, self.connect_timeout
            )));
        }

        if self.max_backoff < self.retry_backoff {
            return Err(StoreError::Config(
                "max_backoff must not be shorter than retry_backoff".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Builder for store configuration.
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
        }
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the username (Redis 6+ ACL).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Set the database number.
    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the per-command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set how many connect failures are tolerated before cooling down.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the initial reconnect backoff.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// Set the reconnect backoff cap.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_backoff = backoff;
        self
    }

    /// Set the circuit-breaker cool-down.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    /// Set the execution mode.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> StoreConfig {
        self.config
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.mode, ExecutionMode::Production);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_url_with_password() {
        let config = StoreConfig::builder()
            .url("redis://cache.internal:6379")
            .password("s3cret")
            .database(2)
            .build();

        assert_eq!(config.connection_url(), "redis://:s3cret@cache.internal:6379/2");
    }

    #[test]
    fn test_connection_url_with_acl_user() {
        let config = StoreConfig::builder()
            .url("rediss://cache.internal:6380")
            .username("app")
            .password("pw")
            .build();

        assert_eq!(config.connection_url(), "rediss://app:pw@cache.internal:6380");
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = StoreConfig::new("not a url");
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));

        let config = StoreConfig::new("http://localhost:6379");
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = StoreConfig::builder()
            .connect_timeout(Duration::ZERO)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_command_timeout_not_below_connect_timeout() {
        let config = StoreConfig::builder()
            .connect_timeout(Duration::from_secs(2))
            .command_timeout(Duration::from_secs(2))
            .build();
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));

        let config = StoreConfig::builder()
            .connect_timeout(Duration::from_secs(2))
            .command_timeout(Duration::from_millis(500))
            .build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!(ExecutionMode::parse("production"), Some(ExecutionMode::Production));
        assert_eq!(ExecutionMode::parse("Dev"), Some(ExecutionMode::Development));
        assert_eq!(ExecutionMode::parse("test"), Some(ExecutionMode::Test));
        assert_eq!(ExecutionMode::parse("staging"), None);

        assert!(ExecutionMode::Production.caching_enabled());
        assert!(!ExecutionMode::Development.caching_enabled());
        assert!(!ExecutionMode::Test.caching_enabled());
    }

    #[test]
    fn test_serde_roundtrip_uses_millis() {
        let config = StoreConfig::builder()
            .connect_timeout(Duration::from_millis(1500))
            .build();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["connect_timeout"], 1500);
        assert_eq!(json["mode"], "production");
    }
}
