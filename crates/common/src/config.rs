//! Application configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Job queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Rate limit policies keyed by limit type, merged over the built-in defaults.
    /// Type names are matched case-insensitively.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitPolicy>,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Global job queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs running at once per queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-job execution timeout in milliseconds.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
    /// Backoff unit in milliseconds, multiplied by the attempt count.
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Sleep between polling ticks in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Entries kept in the completed log.
    #[serde(default = "default_log_limit")]
    pub completed_log_limit: usize,
    /// Entries kept in the failed log.
    #[serde(default = "default_log_limit")]
    pub failed_log_limit: usize,
    /// TTL of persisted job records, in seconds.
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
    /// Lifetime of an idempotency marker beyond the job's delay, in seconds.
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    /// Time past the job timeout after which an active job is considered
    /// abandoned and failed, in milliseconds.
    #[serde(default = "default_stalled_grace_ms")]
    pub stalled_grace_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_timeout_ms: default_job_timeout_ms(),
            backoff_delay_ms: default_backoff_delay_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            completed_log_limit: default_log_limit(),
            failed_log_limit: default_log_limit(),
            job_ttl_secs: default_job_ttl_secs(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            stalled_grace_ms: default_stalled_grace_ms(),
        }
    }
}

impl QueueConfig {
    /// Per-job timeout.
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Polling interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Age at which an active job counts as stalled.
    #[must_use]
    pub const fn stalled_after(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms.saturating_add(self.stalled_grace_ms))
    }
}

/// A `{window, max}` rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitPolicy {
    /// Window length in seconds.
    pub window: u64,
    /// Maximum requests per window.
    pub max: u64,
}

impl RateLimitPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(window: u64, max: u64) -> Self {
        Self { window, max }
    }

    /// Window length in milliseconds.
    #[must_use]
    pub const fn window_millis(&self) -> i64 {
        (self.window * 1000) as i64
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

fn default_redis_prefix() -> String {
    "bazaar".to_string()
}

const fn default_concurrency() -> usize {
    5
}

const fn default_job_timeout_ms() -> u64 {
    30_000
}

const fn default_backoff_delay_ms() -> u64 {
    5_000
}

const fn default_max_backoff_ms() -> u64 {
    3_600_000
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_log_limit() -> usize {
    1_000
}

const fn default_job_ttl_secs() -> u64 {
    24 * 60 * 60
}

const fn default_idempotency_ttl_secs() -> u64 {
    60 * 60
}

const fn default_stalled_grace_ms() -> u64 {
    60_000
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `BAZAAR_ENV`)
    /// 3. Environment variables with `BAZAAR__` prefix and `__` nesting
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("BAZAAR_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("BAZAAR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("BAZAAR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.job_timeout(), Duration::from_secs(30));
        assert_eq!(config.completed_log_limit, 1000);
        assert_eq!(config.job_ttl_secs, 86_400);
        assert_eq!(config.stalled_after(), Duration::from_secs(90));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let source = r#"
            [redis]
            url = "redis://localhost:6379"

            [queue]
            concurrency = 2

            [rate_limits.LOGIN_ATTEMPTS]
            window = 300
            max = 5
        "#;

        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.redis.prefix, "bazaar");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.queue.poll_interval_ms, 1000);
        // Keys may come back lowercased depending on the source.
        let login = config
            .rate_limits
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("LOGIN_ATTEMPTS"))
            .map(|(_, policy)| *policy);
        assert_eq!(login, Some(RateLimitPolicy::new(300, 5)));
    }

    #[test]
    fn test_policy_window_millis() {
        assert_eq!(RateLimitPolicy::new(60, 10).window_millis(), 60_000);
    }
}
