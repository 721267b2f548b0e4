//! Ambient services: logging setup and scheduler metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_dev_logging, init_logging, init_prod_logging, LogConfig, LogFormat, LogOutput};
pub use metrics::{MetricsSummary, SchedulerMetrics, TimingStats};
