//! Resource-aware scheduling for background code analysis
//!
//! A [`PerformanceManager`] decides what to analyze, how deeply, and with how
//! much parallelism:
//!
//! - [`ResourceMonitor`] samples the process and derives a degradation level
//! - [`SmartPriorityQueue`] ranks submissions by relevance
//! - [`AdaptiveWorkerPool`] runs analysis in per-language pools of threads or
//!   subprocesses, sized to current pressure
//! - [`LazyLoadingManager`] caches parsers and syntax trees and degrades
//!   analysis depth under load

// Core modules
pub mod config;
pub mod errors;
pub mod events;
pub mod language;
pub mod task;

// Components
pub mod lazy;
pub mod manager;
pub mod monitor;
pub mod parser;
pub mod pool;
pub mod queue;

pub mod infrastructure;

// Re-export commonly used items
pub use config::{CacheConfig, MonitorConfig, PerformanceConfig, PoolConfig, QueueConfig};
pub use errors::{ConfigError, Result, SchedulerError, TaskError};
pub use events::{Event, EventBus};
pub use language::{ExecutionKind, Language};
pub use lazy::LazyLoadingManager;
pub use manager::{
    CleanupReport, LoadLevel, PerformanceManager, PerformanceManagerBuilder,
    PerformanceStatistics, SubmitOutcome, SubmitStatus,
};
pub use monitor::{AnalysisDepth, DegradationLevel, ResourceMonitor, ResourceSnapshot};
pub use parser::SyntaxTree;
pub use pool::{AdaptiveWorkerPool, PoolStatistics};
pub use queue::{PriorityTier, RelevanceContext, SmartPriorityQueue};
pub use task::{AnalysisRequest, TaskId, TaskOptions, TaskWrapper};
