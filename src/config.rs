//! Configuration management for quota-guard.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{QuotaError, Result};
use crate::ratelimit::Algorithm;

/// Prefix for environment variable overrides, e.g. `QUOTA__REDIS__URL`.
const ENV_PREFIX: &str = "QUOTA";

/// Main configuration for the quota-guard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Shared counter store connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (e.g. redis://127.0.0.1:6379/0)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// How long to wait for the initial connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upper bound for every individual store command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_command_timeout() -> u64 {
    3000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Limit applied when the caller does not supply one and no override exists
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Length of the counting window in milliseconds
    #[serde(default = "default_window_size")]
    pub window_size_ms: u64,

    /// Counting algorithm, fixed for the lifetime of a service instance
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Keep per-identity overrides in a local cache
    #[serde(default = "default_enable_local_cache")]
    pub enable_local_cache: bool,

    /// Lifetime of an override, both in the store and in the local cache
    #[serde(default = "default_local_cache_ttl")]
    pub local_cache_ttl_ms: u64,

    /// How often expired cache entries are swept
    #[serde(default = "default_sweep_interval")]
    pub cache_sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            window_size_ms: default_window_size(),
            algorithm: Algorithm::default(),
            enable_local_cache: default_enable_local_cache(),
            local_cache_ttl_ms: default_local_cache_ttl(),
            cache_sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }

    pub fn local_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.local_cache_ttl_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_size() -> u64 {
    1000
}

fn default_enable_local_cache() -> bool {
    true
}

fn default_local_cache_ttl() -> u64 {
    60_000
}

fn default_sweep_interval() -> u64 {
    60_000
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl QuotaConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// Later sources win: file values override defaults, `QUOTA__*`
    /// environment variables override the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(QuotaError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let config: QuotaConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the rate limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.redis.url.trim().is_empty() {
            return Err(QuotaError::Config("redis.url is required".into()));
        }
        if self.redis.command_timeout_ms == 0 {
            return Err(QuotaError::Config(
                "redis.command_timeout_ms must be greater than 0".into(),
            ));
        }

        let rl = &self.rate_limit;
        if rl.default_limit == 0 {
            return Err(QuotaError::Config(
                "rate_limit.default_limit must be greater than 0".into(),
            ));
        }
        if rl.window_size_ms == 0 {
            return Err(QuotaError::Config(
                "rate_limit.window_size_ms must be greater than 0".into(),
            ));
        }
        // Also the lifetime of stored overrides, so required with the cache off.
        if rl.local_cache_ttl_ms == 0 {
            return Err(QuotaError::Config(
                "rate_limit.local_cache_ttl_ms must be greater than 0".into(),
            ));
        }
        if rl.enable_local_cache && rl.cache_sweep_interval_ms == 0 {
            return Err(QuotaError::Config(
                "rate_limit.cache_sweep_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}
