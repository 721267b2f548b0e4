//! Error taxonomy for the scheduler
//!
//! Internal faults (sampling glitches, worker crashes) stay inside the owning
//! component and surface as events or counters. Only configuration errors are
//! raised to callers at construction time.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Malformed or out-of-range configuration, raised before anything starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid duration '{value}' for {key}: expected <n>(ms|s|m|h)")]
    InvalidDuration { key: String, value: String },

    #[error("invalid size '{value}' for {key}: expected <n>(B|KB|MB|GB)")]
    InvalidSize { key: String, value: String },

    #[error("invalid percentage '{value}' for {key}: expected <n>% between 0 and 100")]
    InvalidPercentage { key: String, value: String },

    #[error("{key} out of range: {reason}")]
    OutOfRange { key: String, reason: String },

    #[error("failed to parse config: {0}")]
    Syntax(String),

    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },
}

/// Why a single analysis task did not produce a result.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum TaskError {
    #[error("worker {worker_id} crashed (exit code {code:?})")]
    WorkerCrash { worker_id: u64, code: Option<i32> },

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task cancelled")]
    Cancelled,

    #[error("analysis disabled: {0}")]
    AnalysisDisabled(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("unsupported file type: {0}")]
    UnsupportedLanguage(String),

    #[error("worker pool is shutting down")]
    PoolShutdown,

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// Resource sampling failure. Never leaves the monitor.
#[derive(Debug, Clone, Error)]
pub enum SamplingError {
    #[error("process {0} is not visible to the sampler")]
    ProcessMissing(u32),

    #[error("sampler unavailable: {0}")]
    Unavailable(String),

    #[error("sampling task failed: {0}")]
    Join(String),
}

/// Wire-level failure between the pool and an isolated worker process.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed worker message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("worker channel io: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-level error for the fallible public surface.
///
/// Task failures are results, not errors: they travel on `task:failed`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("performance manager has been shut down")]
    ShutDown,
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidDuration {
            key: "interval".to_string(),
            value: "2 weeks".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid duration '2 weeks' for interval: expected <n>(ms|s|m|h)"
        );
    }

    #[test]
    fn test_scheduler_error_wraps_config_error() {
        let err: SchedulerError = ConfigError::Syntax("expected '='".to_string()).into();
        assert!(matches!(err, SchedulerError::Config(ConfigError::Syntax(_))));
        assert_eq!(err.to_string(), "failed to parse config: expected '='");
    }
}
