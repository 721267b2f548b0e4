//! Scheduler counters and task timings

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const TOTAL_SUBMITTED: &str = "totalSubmitted";
pub const COMPLETED_TASKS: &str = "completedTasks";
pub const FAILED_TASKS: &str = "failedTasks";
pub const THROTTLING_EVENTS: &str = "throttlingEvents";
pub const CANCELLED_TASKS: &str = "cancelledTasks";
pub const TASK_DURATION: &str = "taskDuration";

/// Samples kept per timing; older ones are dropped.
const MAX_SAMPLES: usize = 1024;

/// Named counters and duration samples, owned by one manager.
pub struct SchedulerMetrics {
    timings: RwLock<HashMap<String, VecDeque<Duration>>>,
    counters: RwLock<HashMap<String, u64>>,
    start_time: Instant,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            timings: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn record_timing(&self, name: &str, duration: Duration) {
        let mut timings = self.timings.write();
        let samples = timings.entry(name.to_string()).or_default();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(duration);
    }

    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, value: u64) {
        *self.counters.write().entry(name.to_string()).or_default() += value;
    }

    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn get_timing_stats(&self, name: &str) -> Option<TimingStats> {
        self.timings
            .read()
            .get(name)
            .map(|samples| TimingStats::from_samples(samples.iter().copied()))
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn summary(&self) -> MetricsSummary {
        let timings = self
            .timings
            .read()
            .iter()
            .map(|(name, samples)| {
                (name.clone(), TimingStats::from_samples(samples.iter().copied()))
            })
            .collect();
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();

        MetricsSummary {
            uptime: self.uptime(),
            timings,
            counters,
        }
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: usize,
    pub total: Duration,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl TimingStats {
    fn from_samples(samples: impl Iterator<Item = Duration>) -> Self {
        let mut sorted: Vec<Duration> = samples.collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort();

        let count = sorted.len();
        let total: Duration = sorted.iter().sum();
        let percentile = |p: f64| sorted[((count as f64 * p) as usize).min(count - 1)];

        Self {
            count,
            total,
            mean: total / count as u32,
            min: sorted[0],
            max: sorted[count - 1],
            p50: percentile(0.50),
            p95: percentile(0.95),
            p99: percentile(0.99),
        }
    }
}

/// Point-in-time copy of all metrics, names sorted.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub uptime: Duration,
    pub timings: BTreeMap<String, TimingStats>,
    pub counters: BTreeMap<String, u64>,
}

impl MetricsSummary {
    pub fn report(&self) -> String {
        let mut lines = vec![format!("Uptime: {:.2?}", self.uptime), String::new()];

        lines.push("=== Counters ===".to_string());
        for (name, value) in &self.counters {
            lines.push(format!("{}: {}", name, value));
        }

        lines.push(String::new());
        lines.push("=== Timings ===".to_string());
        for (name, stats) in &self.timings {
            lines.push(format!(
                "{}: count={} mean={:.2?} min={:.2?} max={:.2?} p50={:.2?} p95={:.2?} p99={:.2?}",
                name, stats.count, stats.mean, stats.min, stats.max, stats.p50, stats.p95, stats.p99
            ));
        }

        lines.join("\n")
    }
}
