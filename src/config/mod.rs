use garde::Validate;
use serde::Deserialize;
use std::time::Duration;
use strum::{Display, EnumString};

/// Which job repository backend this deployment uses. Chosen once at startup.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RepositoryBackend {
    Redis,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Redis connection string (tier queues, quota counters, heartbeats)
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// PostgreSQL connection string, required for the postgres backend
    #[garde(skip)]
    pub database_url: Option<String>,

    #[serde(default = "default_backend")]
    #[garde(skip)]
    pub job_repository_backend: RepositoryBackend,

    /// Object storage bucket (S3-compatible)
    #[garde(length(min = 1))]
    pub s3_bucket: String,

    #[garde(length(min = 1))]
    pub s3_endpoint: String,

    #[serde(default = "default_region")]
    #[garde(length(min = 1))]
    pub s3_region: String,

    #[garde(length(min = 1))]
    pub s3_access_key: String,

    #[garde(length(min = 1))]
    pub s3_secret_key: String,

    /// Background removal provider endpoint
    #[garde(url)]
    pub bg_removal_url: String,

    #[garde(length(min = 1))]
    pub bg_removal_api_key: String,

    #[serde(default = "default_bg_timeout_ms")]
    #[garde(range(min = 100, max = 300_000))]
    pub bg_removal_timeout_ms: u64,

    #[serde(default = "default_bg_max_retries")]
    #[garde(range(max = 10))]
    pub bg_removal_max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    #[garde(range(min = 1))]
    pub bg_removal_backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    #[garde(range(min = 1))]
    pub bg_removal_backoff_max_ms: u64,

    #[serde(default = "default_breaker_threshold")]
    #[garde(range(min = 1, max = 100))]
    pub breaker_error_threshold_percent: u32,

    #[serde(default = "default_breaker_volume")]
    #[garde(range(min = 1))]
    pub breaker_volume_threshold: u32,

    #[serde(default = "default_breaker_window_ms")]
    #[garde(range(min = 100))]
    pub breaker_rolling_window_ms: u64,

    #[serde(default = "default_breaker_reset_ms")]
    #[garde(range(min = 100))]
    pub breaker_reset_timeout_ms: u64,

    /// Breaker-level bound on one provider call; at least the request timeout
    #[serde(default = "default_breaker_call_timeout_ms")]
    #[garde(range(min = 100, max = 600_000))]
    pub breaker_call_timeout_ms: u64,

    #[serde(default = "default_fast_concurrency")]
    #[garde(range(min = 1, max = 256))]
    pub fast_concurrency: usize,

    #[serde(default = "default_slow_concurrency")]
    #[garde(range(min = 1, max = 256))]
    pub slow_concurrency: usize,

    #[serde(default = "default_bulk_concurrency")]
    #[garde(range(min = 1, max = 256))]
    pub bulk_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    #[garde(range(min = 10))]
    pub poll_interval_ms: u64,

    /// Deliveries of one envelope before it is dead-lettered
    #[serde(default = "default_max_delivery_attempts")]
    #[garde(range(min = 1, max = 20))]
    pub max_delivery_attempts: u32,

    #[serde(default = "default_heartbeat_interval_ms")]
    #[garde(range(min = 100))]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_ttl_ms")]
    #[garde(range(min = 100))]
    pub heartbeat_ttl_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    #[garde(range(min = 100))]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_worker_id")]
    #[garde(length(min = 1, max = 128))]
    pub worker_id: String,

    /// Bind address for the /health and /metrics endpoints
    #[serde(default = "default_ops_bind_addr")]
    #[garde(length(min = 1))]
    pub ops_bind_addr: String,
}

fn default_backend() -> RepositoryBackend {
    RepositoryBackend::Redis
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_bg_timeout_ms() -> u64 {
    30_000
}

fn default_bg_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_breaker_threshold() -> u32 {
    50
}

fn default_breaker_volume() -> u32 {
    5
}

fn default_breaker_window_ms() -> u64 {
    10_000
}

fn default_breaker_reset_ms() -> u64 {
    30_000
}

fn default_breaker_call_timeout_ms() -> u64 {
    35_000
}

fn default_fast_concurrency() -> usize {
    8
}

fn default_slow_concurrency() -> usize {
    2
}

fn default_bulk_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_ttl_ms() -> u64 {
    45_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

fn default_ops_bind_addr() -> String {
    "0.0.0.0:9091".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tier sizes, ordered fast >= slow >= bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierConcurrency {
    pub fast: usize,
    pub slow: usize,
    pub bulk: usize,
}

impl TierConcurrency {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fast == 0 || self.slow == 0 || self.bulk == 0 {
            return Err(ConfigError::Invalid(
                "tier concurrency must be at least 1".to_string(),
            ));
        }
        if !(self.fast >= self.slow && self.slow >= self.bulk) {
            return Err(ConfigError::Invalid(format!(
                "tier concurrency must satisfy fast >= slow >= bulk (got fast={}, slow={}, bulk={})",
                self.fast, self.slow, self.bulk
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate_all()?;
        Ok(config)
    }

    /// Field bounds via garde, then the cross-field rules.
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;

        self.tier_concurrency().validate()?;

        if self.bg_removal_backoff_base_ms > self.bg_removal_backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "bg_removal_backoff_base_ms ({}) must not exceed bg_removal_backoff_max_ms ({})",
                self.bg_removal_backoff_base_ms, self.bg_removal_backoff_max_ms
            )));
        }

        if self.breaker_call_timeout_ms < self.bg_removal_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "breaker_call_timeout_ms ({}) must not be shorter than bg_removal_timeout_ms ({})",
                self.breaker_call_timeout_ms, self.bg_removal_timeout_ms
            )));
        }

        if self.heartbeat_ttl_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_ttl_ms ({}) must be longer than heartbeat_interval_ms ({})",
                self.heartbeat_ttl_ms, self.heartbeat_interval_ms
            )));
        }

        if self.job_repository_backend == RepositoryBackend::Postgres
            && self.database_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Invalid(
                "database_url is required for the postgres job repository".to_string(),
            ));
        }

        Ok(())
    }

    pub fn tier_concurrency(&self) -> TierConcurrency {
        TierConcurrency {
            fast: self.fast_concurrency,
            slow: self.slow_concurrency,
            bulk: self.bulk_concurrency,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ttl_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
