//! Server configuration.

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use derivative::Derivative;
use serde::Deserialize;

use crate::upstream::{FixtureUpstreamConfig, HttpUpstreamConfig};

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// This is useful for deploying to certain application platforms like Fly.io
const ENV_CONFIG_BASE64: &str = "BROKER_SERVER_CONFIG_BASE64";

/// Environment variable storing the database connection string.
const ENV_DATABASE_URL: &str = "BROKER_SERVER_DATABASE_URL";

/// Environment variable storing the client bearer token.
const ENV_API_TOKEN: &str = "BROKER_SERVER_API_TOKEN";

/// Environment variable storing the admin bearer token.
const ENV_ADMIN_TOKEN: &str = "BROKER_SERVER_ADMIN_TOKEN";

/// Configuration for the Broker Server.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Bearer token accepted on the client surface.
    #[serde(rename = "api-token")]
    #[serde(default = "load_api_token_from_env")]
    #[derivative(Debug = "ignore")]
    pub api_token: String,

    /// Bearer token accepted on the admin surface.
    #[serde(rename = "admin-token")]
    #[serde(default = "load_admin_token_from_env")]
    #[derivative(Debug = "ignore")]
    pub admin_token: String,

    /// Log output format (`json` or `text`).
    #[serde(rename = "log-format")]
    #[serde(default = "Default::default")]
    pub log_format: LogFormat,

    /// Database connection.
    #[serde(default = "Default::default")]
    pub database: DatabaseConfig,

    /// Upstream cloud provider.
    #[serde(default = "Default::default")]
    pub upstream: UpstreamConfig,

    /// Sandbox allocation.
    #[serde(default = "Default::default")]
    pub allocation: AllocationConfig,

    /// Background jobs.
    #[serde(default = "Default::default")]
    pub jobs: JobsConfig,

    /// Circuit breaker guarding the upstream provider.
    #[serde(default = "Default::default")]
    pub breaker: BreakerConfig,

    /// Per-client rate limiting.
    #[serde(rename = "rate-limit")]
    #[serde(default = "Default::default")]
    pub rate_limit: RateLimitConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LogFormat {
    /// Newline-delimited JSON records.
    #[serde(rename = "json")]
    Json,

    /// Human-readable output.
    #[serde(rename = "text")]
    Text,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL.
    #[serde(default = "load_database_url_from_env")]
    pub url: String,
}

/// Upstream provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamConfig {
    /// The real cloud provider, over HTTP.
    #[serde(rename = "http")]
    Http(HttpUpstreamConfig),

    /// A fixed set of accounts, for development and tests.
    #[serde(rename = "fixture")]
    Fixture(FixtureUpstreamConfig),
}

/// Allocation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocationConfig {
    /// Nominal lab session length, in hours.
    #[serde(rename = "lab-duration-hours")]
    #[serde(default = "default_lab_duration_hours")]
    pub lab_duration_hours: i32,

    /// Extra time past the nominal lab duration before the expiry
    /// loop claims an allocation.
    #[serde(rename = "grace-period")]
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,

    /// Number of available candidates fetched per allocation attempt.
    #[serde(rename = "k-candidates")]
    #[serde(default = "default_k_candidates")]
    pub k_candidates: u64,

    /// Base of the jittered exponential backoff between claim attempts,
    /// in milliseconds.
    #[serde(rename = "backoff-base-ms")]
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap of the jittered exponential backoff, in milliseconds.
    #[serde(rename = "backoff-max-ms")]
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// `retry_after` hint returned when the pool is exhausted, in seconds.
    #[serde(rename = "retry-after")]
    #[serde(default = "default_retry_after")]
    pub retry_after: u64,
}

/// Background job configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// The frequency to reconcile the pool against the upstream provider.
    #[serde(rename = "sync-interval")]
    #[serde(with = "humantime_serde", default = "default_sync_interval")]
    pub sync_interval: Duration,

    /// The frequency to drain the pending-deletion queue.
    #[serde(rename = "cleanup-interval")]
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,

    /// Number of sandboxes deleted upstream per cleanup batch.
    #[serde(rename = "cleanup-batch-size")]
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,

    /// Pause between cleanup batches. This deliberately throttles the
    /// upstream provider.
    #[serde(rename = "cleanup-batch-delay")]
    #[serde(with = "humantime_serde", default = "default_cleanup_batch_delay")]
    pub cleanup_batch_delay: Duration,

    /// The frequency to sweep for orphaned allocations.
    #[serde(rename = "expiry-interval")]
    #[serde(with = "humantime_serde", default = "default_expiry_interval")]
    pub expiry_interval: Duration,

    /// Upstream deletions attempted per sandbox before the record is
    /// left for the admin surface.
    #[serde(rename = "deletion-max-attempts")]
    #[serde(default = "default_deletion_max_attempts")]
    pub deletion_max_attempts: i32,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(rename = "failure-threshold")]
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before a probe is allowed.
    #[serde(rename = "open-timeout")]
    #[serde(with = "humantime_serde", default = "default_breaker_timeout")]
    pub open_timeout: Duration,
}

/// Rate limit configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained request rate per client.
    #[serde(rename = "requests-per-second")]
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Maximum burst capacity per client.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Config {
    /// Nominal lab duration in seconds.
    pub fn lab_duration_seconds(&self) -> i64 {
        i64::from(self.allocation.lab_duration_hours) * 3600
    }

    /// Expiry threshold (lab duration + grace period) in seconds.
    pub fn expiry_threshold_seconds(&self) -> i64 {
        self.lab_duration_seconds() + self.allocation.grace_period.as_secs() as i64
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Text
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: load_database_url_from_env(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::Fixture(FixtureUpstreamConfig::default())
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            lab_duration_hours: default_lab_duration_hours(),
            grace_period: default_grace_period(),
            k_candidates: default_k_candidates(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            retry_after: default_retry_after(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            cleanup_interval: default_cleanup_interval(),
            cleanup_batch_size: default_cleanup_batch_size(),
            cleanup_batch_delay: default_cleanup_batch_delay(),
            expiry_interval: default_expiry_interval(),
            deletion_max_attempts: default_deletion_max_attempts(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            open_timeout: default_breaker_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

fn load_database_url_from_env() -> String {
    env::var(ENV_DATABASE_URL).unwrap_or_else(|_| "sqlite::memory:".to_string())
}

fn load_api_token_from_env() -> String {
    env::var(ENV_API_TOKEN).unwrap_or_else(|_| "dev_token_change_me".to_string())
}

fn load_admin_token_from_env() -> String {
    env::var(ENV_ADMIN_TOKEN).unwrap_or_else(|_| "admin_token_change_me".to_string())
}

fn default_listen_address() -> SocketAddr {
    "[::]:8080".parse().unwrap()
}

fn default_lab_duration_hours() -> i32 {
    4
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_k_candidates() -> u64 {
    15
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5000
}

fn default_retry_after() -> u64 {
    30
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_cleanup_batch_size() -> usize {
    10
}

fn default_cleanup_batch_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_expiry_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_deletion_max_attempts() -> i32 {
    3
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_burst() -> u32 {
    20
}

fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&config)?)
}

fn load_config_from_str(s: &str) -> Result<Config> {
    tracing::info!("Using configurations from environment variable");
    Ok(toml::from_str(s)?)
}

/// Loads the configuration in the standard order.
///
/// Precedence is as follows:
/// * Path given from the command line
/// * TOML read from the BROKER_SERVER_CONFIG_BASE64 environment variable
/// * Built-in defaults (every field has one)
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    if let Some(config_path) = config_path {
        return load_config_from_path(config_path);
    }

    if let Ok(config_env) = env::var(ENV_CONFIG_BASE64) {
        let decoded = String::from_utf8(BASE64_STANDARD.decode(config_env.as_bytes())?)?;
        return load_config_from_str(&decoded);
    }

    load_config_from_str("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").expect("Could not load default config");

        assert_eq!(config.allocation.lab_duration_hours, 4);
        assert_eq!(config.allocation.k_candidates, 15);
        assert_eq!(config.lab_duration_seconds(), 4 * 3600);
        assert_eq!(config.expiry_threshold_seconds(), 4 * 3600 + 30 * 60);
        assert_eq!(config.jobs.sync_interval, Duration::from_secs(600));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(matches!(config.upstream, UpstreamConfig::Fixture(_)));
    }

    #[test]
    fn test_humantime_durations() {
        let config: Config = toml::from_str(
            r#"
            [allocation]
            grace-period = "15m"

            [jobs]
            cleanup-interval = "1m 30s"
            "#,
        )
        .expect("Could not parse config");

        assert_eq!(config.allocation.grace_period, Duration::from_secs(900));
        assert_eq!(config.jobs.cleanup_interval, Duration::from_secs(90));
    }

    #[test]
    fn test_upstream_http() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            type = "http"
            base-url = "https://csp.example.com/v2"
            token = "secret"
            "#,
        )
        .expect("Could not parse config");

        assert!(matches!(config.upstream, UpstreamConfig::Http(_)));
    }
}
