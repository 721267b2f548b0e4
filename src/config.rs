//! Construction-time configuration
//!
//! The on-disk form keeps human-readable literals (`2s`, `200MB`, `80%`).
//! Those are parsed strictly into [`PerformanceConfig`]; malformed input is
//! rejected instead of falling back to a default.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const KIB: f64 = 1024.0;

/// Raw configuration as written in TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPerformanceConfig {
    #[serde(default)]
    pub monitor: RawMonitorConfig,

    #[serde(default)]
    pub pool: RawPoolConfig,

    #[serde(default)]
    pub cache: RawCacheConfig,

    #[serde(default)]
    pub queue: RawQueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMonitorConfig {
    #[serde(default = "default_interval")]
    pub interval: String,

    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: String,

    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: String,

    #[serde(default = "default_io_threshold")]
    pub io_threshold: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPoolConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,

    #[serde(default = "default_worker_timeout")]
    pub worker_timeout: String,

    #[serde(default = "default_max_worker_restarts")]
    pub max_worker_restarts: usize,

    #[serde(default = "default_high_load_threshold")]
    pub high_load_threshold: String,

    #[serde(default = "default_memory_pressure_threshold")]
    pub memory_pressure_threshold: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_executable: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCacheConfig {
    #[serde(default = "default_max_cached_parsers")]
    pub max_cached_parsers: usize,

    #[serde(default = "default_max_cached_asts", rename = "maxCachedASTs")]
    pub max_cached_asts: usize,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,

    #[serde(default = "default_max_idle_time")]
    pub max_idle_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQueueConfig {
    #[serde(default = "default_fairness_ratio")]
    pub fairness_ratio: f64,
}

fn default_interval() -> String { "2s".to_string() }
fn default_history_size() -> usize { 30 }
fn default_cpu_threshold() -> String { "80%".to_string() }
fn default_memory_threshold() -> String { "200MB".to_string() }
fn default_io_threshold() -> String { "80%".to_string() }
fn default_max_concurrent() -> usize { 4 }
fn default_worker_timeout() -> String { "30s".to_string() }
fn default_max_worker_restarts() -> usize { 5 }
fn default_high_load_threshold() -> String { "80%".to_string() }
fn default_memory_pressure_threshold() -> String { "150MB".to_string() }
fn default_max_cached_parsers() -> usize { 10 }
fn default_max_cached_asts() -> usize { 100 }
fn default_cleanup_interval() -> String { "5m".to_string() }
fn default_max_idle_time() -> String { "10m".to_string() }
fn default_fairness_ratio() -> f64 { 0.1 }

impl Default for RawMonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            history_size: default_history_size(),
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            io_threshold: default_io_threshold(),
        }
    }
}

impl Default for RawPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent(),
            worker_timeout: default_worker_timeout(),
            max_worker_restarts: default_max_worker_restarts(),
            high_load_threshold: default_high_load_threshold(),
            memory_pressure_threshold: default_memory_pressure_threshold(),
            worker_executable: None,
        }
    }
}

impl Default for RawCacheConfig {
    fn default() -> Self {
        Self {
            max_cached_parsers: default_max_cached_parsers(),
            max_cached_asts: default_max_cached_asts(),
            cleanup_interval: default_cleanup_interval(),
            max_idle_time: default_max_idle_time(),
        }
    }
}

impl Default for RawQueueConfig {
    fn default() -> Self {
        Self {
            fairness_ratio: default_fairness_ratio(),
        }
    }
}

/// Resource monitor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub history_size: usize,
    /// Percent, 0-100
    pub cpu_threshold: f64,
    /// Bytes of resident memory
    pub memory_threshold: u64,
    /// Percent of the IO ceiling, 0-100
    pub io_threshold: f64,
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_concurrent_operations: usize,
    pub worker_timeout: Duration,
    pub max_worker_restarts: usize,
    /// CPU percent above which pools shrink to half
    pub high_load_threshold: f64,
    /// Resident bytes above which pools shrink by a further half
    pub memory_pressure_threshold: u64,
    /// Binary that serves `worker <language>`; defaults to the current executable
    pub worker_executable: Option<PathBuf>,
}

/// Parser/AST cache settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_cached_parsers: usize,
    pub max_cached_asts: usize,
    pub cleanup_interval: Duration,
    pub max_idle_time: Duration,
}

/// Priority queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub fairness_ratio: f64,
}

/// Fully validated configuration for [`crate::PerformanceManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceConfig {
    pub monitor: MonitorConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            history_size: 30,
            cpu_threshold: 80.0,
            memory_threshold: 200 * 1024 * 1024,
            io_threshold: 80.0,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 4,
            worker_timeout: Duration::from_secs(30),
            max_worker_restarts: 5,
            high_load_threshold: 80.0,
            memory_pressure_threshold: 150 * 1024 * 1024,
            worker_executable: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cached_parsers: 10,
            max_cached_asts: 100,
            cleanup_interval: Duration::from_secs(5 * 60),
            max_idle_time: Duration::from_secs(10 * 60),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { fairness_ratio: 0.1 }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl TryFrom<RawPerformanceConfig> for PerformanceConfig {
    type Error = ConfigError;

    fn try_from(raw: RawPerformanceConfig) -> Result<Self, Self::Error> {
        let monitor = MonitorConfig {
            interval: parse_duration("monitor.interval", &raw.monitor.interval)?,
            history_size: at_least_one("monitor.historySize", raw.monitor.history_size)?,
            cpu_threshold: parse_percentage("monitor.cpuThreshold", &raw.monitor.cpu_threshold)?,
            memory_threshold: parse_size("monitor.memoryThreshold", &raw.monitor.memory_threshold)?,
            io_threshold: parse_percentage("monitor.ioThreshold", &raw.monitor.io_threshold)?,
        };

        let pool = PoolConfig {
            max_concurrent_operations: at_least_one(
                "pool.maxConcurrentOperations",
                raw.pool.max_concurrent_operations,
            )?,
            worker_timeout: parse_duration("pool.workerTimeout", &raw.pool.worker_timeout)?,
            max_worker_restarts: raw.pool.max_worker_restarts,
            high_load_threshold: parse_percentage(
                "pool.highLoadThreshold",
                &raw.pool.high_load_threshold,
            )?,
            memory_pressure_threshold: parse_size(
                "pool.memoryPressureThreshold",
                &raw.pool.memory_pressure_threshold,
            )?,
            worker_executable: raw.pool.worker_executable,
        };

        let cache = CacheConfig {
            max_cached_parsers: at_least_one("cache.maxCachedParsers", raw.cache.max_cached_parsers)?,
            max_cached_asts: at_least_one("cache.maxCachedASTs", raw.cache.max_cached_asts)?,
            cleanup_interval: parse_duration("cache.cleanupInterval", &raw.cache.cleanup_interval)?,
            max_idle_time: parse_duration("cache.maxIdleTime", &raw.cache.max_idle_time)?,
        };

        let ratio = raw.queue.fairness_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::OutOfRange {
                key: "queue.fairnessRatio".to_string(),
                reason: format!("{} is not in (0, 1]", ratio),
            });
        }

        Ok(Self {
            monitor,
            pool,
            cache,
            queue: QueueConfig { fairness_ratio: ratio },
        })
    }
}

impl PerformanceConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawPerformanceConfig =
            toml::from_str(content).map_err(|e| ConfigError::Syntax(e.to_string()))?;
        Self::try_from(raw)
    }

    /// Default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&RawPerformanceConfig::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }
}

fn at_least_one(key: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::OutOfRange {
            key: key.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

/// Split `"200MB"` into `(200.0, "MB")`.
fn split_quantity(value: &str) -> Option<(f64, &str)> {
    let value = value.trim();
    let end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    if end == 0 {
        return None;
    }

    let number: f64 = value[..end].parse().ok()?;
    if !number.is_finite() {
        return None;
    }
    Some((number, value[end..].trim()))
}

/// Parse `<n>(ms|s|m|h)`.
pub fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        key: key.to_string(),
        value: value.to_string(),
    };

    let (number, unit) = split_quantity(value).ok_or_else(invalid)?;
    let seconds = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(invalid()),
    };

    Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::OutOfRange {
        key: key.to_string(),
        reason: format!("duration '{}' is too large", value),
    })
}

/// Parse `<n>(B|KB|MB|GB)` into bytes (binary multiples).
pub fn parse_size(key: &str, value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSize {
        key: key.to_string(),
        value: value.to_string(),
    };

    let (number, unit) = split_quantity(value).ok_or_else(invalid)?;
    let multiplier = match unit {
        "B" => 1.0,
        "KB" => KIB,
        "MB" => KIB * KIB,
        "GB" => KIB * KIB * KIB,
        _ => return Err(invalid()),
    };

    let bytes = (number * multiplier).round();
    // u64::MAX as f64 rounds up to 2^64, which is already out of range
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(ConfigError::OutOfRange {
            key: key.to_string(),
            reason: format!("size '{}' is too large", value),
        });
    }
    Ok(bytes as u64)
}

/// Parse `<n>%?` into a percentage between 0 and 100.
pub fn parse_percentage(key: &str, value: &str) -> Result<f64, ConfigError> {
    let invalid = || ConfigError::InvalidPercentage {
        key: key.to_string(),
        value: value.to_string(),
    };

    let (number, unit) = split_quantity(value).ok_or_else(invalid)?;
    if !(unit.is_empty() || unit == "%") || number > 100.0 {
        return Err(invalid());
    }
    Ok(number)
}
