//! Typed configuration, loaded from a single YAML file: a
//! `serde::Deserialize` tree loaded with `serde_yaml`, one nested struct
//! per concern.

use serde::Deserialize;
use std::time::Duration;

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub idempotency: IdempotencyConfig,
    pub sequence: SequenceConfig,
    pub rate_limit: RateLimitConfig,
    pub backpressure: BackpressureConfig,
    pub lock: LockConfig,
    pub reference_data: ReferenceDataConfig,
    pub retries: RetriesConfig,
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub job_status: JobStatusConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub durable: DurableConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreProvider {
    Memory,
    Postgres,
}

/// Durable-store connection settings: `memory` for local/dev runs and
/// tests, `postgres` for a real deployment, connected with a bounded-retry
/// bring-up.
#[derive(Debug, Clone, Deserialize)]
pub struct DurableConfig {
    #[serde(default = "default_store_provider")]
    pub provider: StoreProvider,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_connect_attempts")]
    pub connect_max_attempts: u32,
}

fn default_store_provider() -> StoreProvider {
    StoreProvider::Memory
}
fn default_connect_attempts() -> u32 {
    10
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            provider: default_store_provider(),
            database_url: None,
            connect_max_attempts: default_connect_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(with = "humantime_secs")]
    pub window: Duration,
    #[serde(with = "humantime_secs")]
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_true")]
    pub buffer_enabled: bool,
    #[serde(default = "default_buffer_window")]
    pub buffer_window_size: u64,
    #[serde(default = "default_buffer_timeout", with = "humantime_secs")]
    pub buffer_timeout: Duration,
    #[serde(default = "default_time_window_days")]
    pub time_window_days: i64,
}

fn default_true() -> bool {
    true
}
fn default_buffer_window() -> u64 {
    1000
}
fn default_buffer_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_time_window_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub global: BucketConfig,
    pub per_partition: BucketConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BucketConfig {
    pub requests_per_second: f64,
    pub burst_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackpressureConfig {
    pub lag_max: u64,
    pub lag_resume: u64,
    pub queue_max: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(with = "humantime_secs")]
    pub default_hold: Duration,
    #[serde(with = "humantime_secs")]
    pub default_wait: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceDataConfig {
    pub security: CacheConfig,
    pub account: CacheConfig,
    pub client: RefDataClientConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CacheConfig {
    #[serde(with = "humantime_secs")]
    pub ttl: Duration,
}

/// Resilience knobs shared by the security-master, account-master, and
/// approval-workflow clients: request timeout, bounded
/// retry with backoff, and circuit-breaker thresholds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RefDataClientConfig {
    #[serde(with = "humantime_millis")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "humantime_millis")]
    pub retry_backoff: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_success_threshold: u32,
    #[serde(with = "humantime_secs")]
    pub circuit_open_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetriesConfig {
    pub deadlock: DeadlockRetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadlockRetryConfig {
    pub attempts: u32,
    #[serde(with = "humantime_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_millis")]
    pub max_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingProvider {
    Log,
    Jms,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingConfig {
    pub provider: MessagingProvider,
    pub topics: TopicsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    pub input: String,
    pub partition_pattern: String,
    pub dlq: String,
    pub router_dlq: String,
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusConfig {
    #[serde(with = "humantime_secs", default = "default_job_retention")]
    pub retention: Duration,
}

fn default_job_retention() -> Duration {
    Duration::from_secs(24 * 3600)
}

impl Default for JobStatusConfig {
    fn default() -> Self {
        Self {
            retention: default_job_retention(),
        }
    }
}

/// Structured-logging knobs: `log_dir`/`log_file`/`rotation`/`use_json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "default_true")]
    pub log_to_stdout: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_dir() -> String {
    "logs".into()
}
fn default_log_file() -> String {
    "trade-capture-core.log".into()
}
fn default_rotation() -> String {
    "daily".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            rotation: default_rotation(),
            use_json: false,
            log_to_stdout: true,
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::FatalConfig(format!("reading {path}: {e}")))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(yaml).map_err(|e| CoreError::FatalConfig(e.to_string()))
    }

    /// Default configuration for local development and tests.
    pub fn dev_default() -> Self {
        Self::from_yaml(DEV_DEFAULT_YAML).expect("dev_default literal must parse")
    }
}

const DEV_DEFAULT_YAML: &str = r#"
idempotency:
  window: 24h
  cache_ttl: 24h
sequence:
  buffer_enabled: true
  buffer_window_size: 1000
  buffer_timeout: 300s
  time_window_days: 7
rate_limit:
  global:
    requests_per_second: 1000
    burst_size: 2000
  per_partition:
    requests_per_second: 10
    burst_size: 20
backpressure:
  lag_max: 10000
  lag_resume: 2000
  queue_max: 5000
lock:
  default_hold: 30s
  default_wait: 5s
reference_data:
  security:
    ttl: 300s
  account:
    ttl: 300s
  client:
    timeout: 2000ms
    max_retries: 2
    retry_backoff: 100ms
    circuit_failure_threshold: 5
    circuit_success_threshold: 2
    circuit_open_timeout: 30s
retries:
  deadlock:
    attempts: 5
    initial_backoff: 50ms
    max_backoff: 2000ms
messaging:
  provider: log
  topics:
    input: "trade-capture-input"
    partition_pattern: "trade/capture/input/{partition}"
    dlq: "trade-capture-dlq"
    router_dlq: "trade/capture/router/dlq"
    output: "trade-capture-blotter"
job_status:
  retention: 86400s
durable:
  provider: memory
  connect_max_attempts: 10
telemetry:
  log_dir: logs
  log_file: trade-capture-core.log
  rotation: daily
  use_json: false
  log_to_stdout: true
  log_level: info
"#;

/// `serde_with`-style helper modules for humantime-ish `"30s"` / `"1h"`
/// duration fields without pulling in the `humantime_serde` crate.
mod humantime_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    #[allow(dead_code)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}s", d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod humantime_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    #[allow(dead_code)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (num, unit) = raw.split_at(
        raw.find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration '{raw}'"))?,
    );
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration number '{num}' in '{raw}'"))?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        "d" => value * 86_400_000.0,
        other => return Err(format!("unknown duration unit '{other}' in '{raw}'")),
    };
    Ok(Duration::from_millis(millis as u64))
}
