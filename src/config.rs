//! Engine configuration from defaults, an optional TOML file and
//! `EXTRACT_CORE_*` environment variables.
//!
//! Environment values override file values. Invalid or missing values fall
//! back to the previous layer without failing; out-of-range values are
//! clamped.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `EXTRACT_CORE_MAX_CONCURRENT` | 2 x CPUs (2..=32) | Items executing at once across batches |
//! | `EXTRACT_CORE_MAX_PENDING` | 10000 | Max items waiting in the queue |
//! | `EXTRACT_CORE_MAX_BATCH_ITEMS` | 1000 | Max items per batch |
//! | `EXTRACT_CORE_MAX_CONCURRENCY_LIMIT` | 64 | Upper bound for a batch `concurrency_limit` |
//! | `EXTRACT_CORE_GLOBAL_RATE_CAPACITY` | 10 | Global token bucket capacity |
//! | `EXTRACT_CORE_GLOBAL_RATE_PER_SEC` | 5.0 | Global token refill per second |
//! | `EXTRACT_CORE_CACHE_TTL_SECS` | 3600 | Default cache TTL |
//! | `EXTRACT_CORE_CACHE_MAX_ENTRIES` | 10000 | Cache capacity |
//! | `EXTRACT_CORE_ITEM_TIMEOUT_MS` | 30000 | Per-attempt extractor timeout |
//! | `EXTRACT_CORE_RETRY_MAX_ATTEMPTS` | 3 | Attempts per item, first included |
//! | `EXTRACT_CORE_RETRY_BASE_DELAY_MS` | 500 | First backoff delay |
//! | `EXTRACT_CORE_RETRY_MULTIPLIER` | 2.0 | Backoff growth factor |
//! | `EXTRACT_CORE_RETRY_MAX_DELAY_MS` | 30000 | Backoff cap |
//! | `EXTRACT_CORE_RETRY_JITTER` | 0.1 | Backoff jitter fraction |
//! | `EXTRACT_CORE_TOKEN_POLL_MS` | 50 | Max sleep while waiting for a token |
//! | `EXTRACT_CORE_BATCH_RETENTION_SECS` | 86400 | Terminal batch retention |
//! | `EXTRACT_CORE_MAINTENANCE_INTERVAL_SECS` | 60 | Cache and retention sweep interval |
//! | `EXTRACT_CORE_SHUTDOWN_TIMEOUT` | 30 | Graceful shutdown timeout (secs) |
//! | `EXTRACT_CORE_DEFAULT_PRIORITY` | normal | Batch priority when unset |
//! | `EXTRACT_CORE_DEFAULT_CONCURRENCY` | 5 | Batch `concurrency_limit` when unset |
//! | `EXTRACT_CORE_DEFAULT_RATE_LIMIT` | unset | Batch requests/second when unset |
//! | `EXTRACT_CORE_DEFAULT_TTL_SECS` | 3600 | Batch cache TTL when unset |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;
use crate::scheduler::{CacheConfig, Priority, RateLimitConfig, RetryPolicy};

/// Longest cache TTL a batch may request.
pub const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-batch options. Unset fields take the engine defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub priority: Priority,
    /// Items of this batch executing at once.
    pub concurrency_limit: usize,
    /// Requests per second for this batch, on top of the global quota.
    pub rate_limit: Option<f64>,
    /// Cache TTL for results produced by this batch.
    #[serde(rename = "ttl_secs", with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            concurrency_limit: 5,
            rate_limit: None,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl BatchOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_rate_limit(mut self, per_second: f64) -> Self {
        self.rate_limit = Some(per_second);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn validate(&self, config: &EngineConfig) -> Result<(), ValidationError> {
        if self.concurrency_limit == 0 || self.concurrency_limit > config.max_concurrency_limit {
            return Err(ValidationError::ConcurrencyLimit {
                value: self.concurrency_limit,
                max: config.max_concurrency_limit,
            });
        }
        if let Some(rate) = self.rate_limit {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ValidationError::RateLimit(rate));
            }
        }
        if self.ttl > MAX_TTL {
            return Err(ValidationError::Ttl { secs: self.ttl.as_secs(), max: MAX_TTL.as_secs() });
        }
        Ok(())
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub max_pending: usize,
    pub max_batch_items: usize,
    pub max_concurrency_limit: usize,
    pub global_rate: RateLimitConfig,
    pub cache: CacheConfig,
    pub item_timeout: Duration,
    pub retry: RetryPolicy,
    pub token_poll_interval: Duration,
    pub batch_retention: Duration,
    pub maintenance_interval: Duration,
    pub shutdown_timeout: Duration,
    pub defaults: BatchOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_pending: 10_000,
            max_batch_items: 1000,
            max_concurrency_limit: 64,
            global_rate: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            item_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            token_poll_interval: Duration::from_millis(50),
            batch_retention: Duration::from_secs(24 * 3600),
            maintenance_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            defaults: BatchOptions::default(),
        }
    }
}

fn default_max_concurrent() -> usize {
    (num_cpus::get() * 2).clamp(2, 32)
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub max_concurrent: usize,
    pub max_pending: usize,
    pub max_batch_items: usize,
    pub max_concurrency_limit: usize,
    pub global_rate_capacity: u32,
    pub global_rate_per_sec: f64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub item_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
    pub token_poll_ms: u64,
    pub batch_retention_secs: u64,
    pub maintenance_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub defaults: BatchOptions,
}

impl EngineConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            max_concurrent: self.max_concurrent,
            max_pending: self.max_pending,
            max_batch_items: self.max_batch_items,
            max_concurrency_limit: self.max_concurrency_limit,
            global_rate_capacity: self.global_rate.capacity,
            global_rate_per_sec: self.global_rate.refill_per_sec,
            cache_ttl_secs: self.cache.default_ttl.as_secs(),
            cache_max_entries: self.cache.max_entries,
            item_timeout_ms: self.item_timeout.as_millis() as u64,
            retry_max_attempts: self.retry.max_attempts,
            retry_base_delay_ms: self.retry.base_delay.as_millis() as u64,
            retry_multiplier: self.retry.multiplier,
            retry_max_delay_ms: self.retry.max_delay.as_millis() as u64,
            retry_jitter: self.retry.jitter,
            token_poll_ms: self.token_poll_interval.as_millis() as u64,
            batch_retention_secs: self.batch_retention.as_secs(),
            maintenance_interval_secs: self.maintenance_interval.as_secs(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            defaults: self.defaults.clone(),
        }
    }

    /// Cross-field checks that clamping alone cannot fix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults
            .validate(self)
            .map_err(|e| ConfigError::Invalid(format!("defaults: {e}")))?;
        if self.global_rate.refill_per_sec <= 0.0 || !self.global_rate.refill_per_sec.is_finite() {
            return Err(ConfigError::Invalid("global refill rate must be positive".into()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid("retry base delay exceeds max delay".into()));
        }
        Ok(())
    }

    /// Clamp every field into its supported range.
    fn sanitize(mut self) -> Self {
        self.max_concurrent = self.max_concurrent.clamp(1, 1024);
        self.max_pending = self.max_pending.max(1);
        self.max_batch_items = self.max_batch_items.clamp(1, self.max_pending);
        self.max_concurrency_limit = self.max_concurrency_limit.clamp(1, 1024);
        self.global_rate.capacity = self.global_rate.capacity.max(1);
        self.cache.max_entries = self.cache.max_entries.max(1);
        self.item_timeout = self.item_timeout.max(Duration::from_millis(1));
        self.retry.max_attempts = self.retry.max_attempts.clamp(1, 20);
        self.retry.multiplier = self.retry.multiplier.max(1.0);
        self.retry.jitter = self.retry.jitter.clamp(0.0, 1.0);
        self.token_poll_interval = self.token_poll_interval.max(Duration::from_millis(1));
        self.maintenance_interval = self.maintenance_interval.max(Duration::from_secs(1));
        self.shutdown_timeout = self.shutdown_timeout.max(Duration::from_secs(1));
        self.defaults.concurrency_limit = self.defaults.concurrency_limit.clamp(1, self.max_concurrency_limit);
        self.defaults.ttl = self.defaults.ttl.min(MAX_TTL);
        self
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a finite `f64` env var, returning `default` on missing or invalid.
fn parse_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_u64(key, default.as_millis() as u64))
}

fn parse_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_u64(key, default.as_secs()))
}

fn apply_env(mut cfg: EngineConfig) -> EngineConfig {
    cfg.max_concurrent = parse_usize("EXTRACT_CORE_MAX_CONCURRENT", cfg.max_concurrent);
    cfg.max_pending = parse_usize("EXTRACT_CORE_MAX_PENDING", cfg.max_pending);
    cfg.max_batch_items = parse_usize("EXTRACT_CORE_MAX_BATCH_ITEMS", cfg.max_batch_items);
    cfg.max_concurrency_limit = parse_usize("EXTRACT_CORE_MAX_CONCURRENCY_LIMIT", cfg.max_concurrency_limit);

    cfg.global_rate.capacity = parse_u32("EXTRACT_CORE_GLOBAL_RATE_CAPACITY", cfg.global_rate.capacity);
    let rate = parse_f64("EXTRACT_CORE_GLOBAL_RATE_PER_SEC", cfg.global_rate.refill_per_sec);
    if rate > 0.0 {
        cfg.global_rate.refill_per_sec = rate;
    }

    cfg.cache.default_ttl = parse_secs("EXTRACT_CORE_CACHE_TTL_SECS", cfg.cache.default_ttl);
    cfg.cache.max_entries = parse_usize("EXTRACT_CORE_CACHE_MAX_ENTRIES", cfg.cache.max_entries);
    cfg.item_timeout = parse_millis("EXTRACT_CORE_ITEM_TIMEOUT_MS", cfg.item_timeout);

    cfg.retry.max_attempts = parse_u32("EXTRACT_CORE_RETRY_MAX_ATTEMPTS", cfg.retry.max_attempts);
    cfg.retry.base_delay = parse_millis("EXTRACT_CORE_RETRY_BASE_DELAY_MS", cfg.retry.base_delay);
    cfg.retry.multiplier = parse_f64("EXTRACT_CORE_RETRY_MULTIPLIER", cfg.retry.multiplier);
    cfg.retry.max_delay = parse_millis("EXTRACT_CORE_RETRY_MAX_DELAY_MS", cfg.retry.max_delay);
    cfg.retry.jitter = parse_f64("EXTRACT_CORE_RETRY_JITTER", cfg.retry.jitter);

    cfg.token_poll_interval = parse_millis("EXTRACT_CORE_TOKEN_POLL_MS", cfg.token_poll_interval);
    cfg.batch_retention = parse_secs("EXTRACT_CORE_BATCH_RETENTION_SECS", cfg.batch_retention);
    cfg.maintenance_interval = parse_secs("EXTRACT_CORE_MAINTENANCE_INTERVAL_SECS", cfg.maintenance_interval);
    cfg.shutdown_timeout = parse_secs("EXTRACT_CORE_SHUTDOWN_TIMEOUT", cfg.shutdown_timeout);

    if let Some(priority) = std::env::var("EXTRACT_CORE_DEFAULT_PRIORITY").ok().and_then(|v| v.parse().ok()) {
        cfg.defaults.priority = priority;
    }
    cfg.defaults.concurrency_limit = parse_usize("EXTRACT_CORE_DEFAULT_CONCURRENCY", cfg.defaults.concurrency_limit);
    let batch_rate = parse_f64("EXTRACT_CORE_DEFAULT_RATE_LIMIT", cfg.defaults.rate_limit.unwrap_or(0.0));
    cfg.defaults.rate_limit = (batch_rate > 0.0).then_some(batch_rate);
    cfg.defaults.ttl = parse_secs("EXTRACT_CORE_DEFAULT_TTL_SECS", cfg.defaults.ttl);
    cfg
}

/// Load configuration from environment variables over defaults.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EngineConfig {
    apply_env(EngineConfig::default()).sanitize()
}

/// Load a TOML file, then apply environment overrides.
pub fn load_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: FileConfig = toml::from_str(&text)?;
    Ok(apply_env(file.apply(EngineConfig::default())).sanitize())
}

/// On-disk layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    max_concurrent: Option<usize>,
    max_pending: Option<usize>,
    max_batch_items: Option<usize>,
    max_concurrency_limit: Option<usize>,
    item_timeout_ms: Option<u64>,
    token_poll_ms: Option<u64>,
    batch_retention_secs: Option<u64>,
    maintenance_interval_secs: Option<u64>,
    shutdown_timeout_secs: Option<u64>,
    global_rate: Option<RateLimitConfig>,
    cache: FileCache,
    retry: FileRetry,
    defaults: Option<BatchOptions>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileCache {
    ttl_secs: Option<u64>,
    max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileRetry {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    max_delay_ms: Option<u64>,
    jitter: Option<f64>,
}

impl FileConfig {
    fn apply(self, mut cfg: EngineConfig) -> EngineConfig {
        if let Some(v) = self.max_concurrent {
            cfg.max_concurrent = v;
        }
        if let Some(v) = self.max_pending {
            cfg.max_pending = v;
        }
        if let Some(v) = self.max_batch_items {
            cfg.max_batch_items = v;
        }
        if let Some(v) = self.max_concurrency_limit {
            cfg.max_concurrency_limit = v;
        }
        if let Some(v) = self.item_timeout_ms {
            cfg.item_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.token_poll_ms {
            cfg.token_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.batch_retention_secs {
            cfg.batch_retention = Duration::from_secs(v);
        }
        if let Some(v) = self.maintenance_interval_secs {
            cfg.maintenance_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.shutdown_timeout_secs {
            cfg.shutdown_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.global_rate {
            cfg.global_rate = v;
        }
        if let Some(v) = self.cache.ttl_secs {
            cfg.cache.default_ttl = Duration::from_secs(v);
        }
        if let Some(v) = self.cache.max_entries {
            cfg.cache.max_entries = v;
        }
        if let Some(v) = self.retry.max_attempts {
            cfg.retry.max_attempts = v;
        }
        if let Some(v) = self.retry.base_delay_ms {
            cfg.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retry.multiplier {
            cfg.retry.multiplier = v;
        }
        if let Some(v) = self.retry.max_delay_ms {
            cfg.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retry.jitter {
            cfg.retry.jitter = v;
        }
        if let Some(v) = self.defaults {
            cfg.defaults = v;
        }
        cfg
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
