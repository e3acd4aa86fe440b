//! Configuration loading and validation.
//!
//! One TOML file with five sections — `[policy]`, `[rate_limit]`,
//! `[cache]`, `[http]`, `[logging]` — every field defaulted, so an empty
//! file yields a working client with the baseline policy.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::policy::Policy;

/// Top-level configuration for the outbound client layer.
#[derive(Debug, Default, Deserialize)]
pub struct StraylightConfig {
    /// Egress policy the guardian enforces.
    #[serde(default)]
    pub policy: Policy,

    /// Throughput limits.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Response cache sizing and persistence.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Transport timeouts and retry bounds.
    #[serde(default)]
    pub http: HttpConfig,

    /// Tracing subscriber setup for the host process.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[rate_limit]` section.
#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained request rate, per second.
    #[serde(default = "default_requests_per_sec")]
    pub requests_per_sec: f64,

    /// Burst capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Whether each distinct host also gets its own bucket.
    #[serde(default)]
    pub per_host: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_sec: default_requests_per_sec(),
            burst: default_burst(),
            per_host: false,
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Whether GET responses are cached at all.
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Maximum live entries.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Byte budget across all entries.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Default entry TTL in seconds.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Single-file persistence artifact, if any.
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            default_ttl_secs: default_ttl_secs(),
            persist_path: None,
        }
    }
}

/// `[http]` section.
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    /// Per-request transport timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Total transport attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Backoff cap, in milliseconds.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for the daily-rotated JSON log file. Console-only when
    /// unset.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            logs_dir: None,
        }
    }
}

// Default value functions for serde

fn default_requests_per_sec() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    20
}
fn default_cache_enabled() -> bool {
    true
}
fn default_max_entries() -> usize {
    500
}
fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_max_ms() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".to_owned()
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<StraylightConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: StraylightConfig = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}
