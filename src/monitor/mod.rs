//! Resource monitoring and the shared degradation signal
//!
//! The monitor is the only writer of [`ResourceSnapshot`]. Everything else
//! reads the snapshot or reacts to `degradation:changed` on the event bus.

mod level;
pub mod sampler;

pub use level::{AnalysisDepth, DegradationLevel};
pub use sampler::{RawSample, ResourceSampler, StaticSampler, SystemSampler};

use crate::config::MonitorConfig;
use crate::errors::SamplingError;
use crate::events::{Event, EventBus};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Latest resource reading plus the level derived from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// Clamped to [0, 100] without dividing by core count
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_percent: f64,
    pub io_percent: f64,
    pub degradation_level: DegradationLevel,
    pub timestamp: SystemTime,
}

impl ResourceSnapshot {
    fn initial() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_used_bytes: 0,
            memory_percent: 0.0,
            io_percent: 0.0,
            degradation_level: DegradationLevel::Normal,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatistics {
    pub current: ResourceSnapshot,
    pub average_cpu_percent: f64,
    pub average_memory_bytes: u64,
    pub average_io_percent: f64,
    pub history_len: usize,
    pub samples_collected: u64,
    pub sampling_errors: u64,
    pub manual_override: Option<DegradationLevel>,
    pub is_running: bool,
}

struct MonitorState {
    snapshot: ResourceSnapshot,
    cpu_history: VecDeque<f64>,
    memory_history: VecDeque<u64>,
    io_history: VecDeque<f64>,
    manual_override: Option<DegradationLevel>,
    samples_collected: u64,
    sampling_errors: u64,
}

struct MonitorInner {
    config: MonitorConfig,
    baseline_concurrency: usize,
    sampler: Arc<dyn ResourceSampler>,
    events: EventBus,
    state: RwLock<MonitorState>,
    sampling_task: Mutex<Option<JoinHandle<()>>>,
    timers_started: AtomicUsize,
}

/// Samples process resources on an interval and publishes degradation changes.
///
/// Cloning yields another handle to the same monitor.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

impl ResourceMonitor {
    /// Monitor backed by [`SystemSampler`].
    ///
    /// `baseline_concurrency` is the unthrottled concurrency that
    /// recommendations are scaled from.
    pub fn new(config: MonitorConfig, baseline_concurrency: usize, events: EventBus) -> Self {
        Self::with_sampler(
            config,
            baseline_concurrency,
            events,
            Arc::new(SystemSampler::new()),
        )
    }

    pub fn with_sampler(
        config: MonitorConfig,
        baseline_concurrency: usize,
        events: EventBus,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        let history = config.history_size;
        Self {
            inner: Arc::new(MonitorInner {
                config,
                baseline_concurrency,
                sampler,
                events,
                state: RwLock::new(MonitorState {
                    snapshot: ResourceSnapshot::initial(),
                    cpu_history: VecDeque::with_capacity(history),
                    memory_history: VecDeque::with_capacity(history),
                    io_history: VecDeque::with_capacity(history),
                    manual_override: None,
                    samples_collected: 0,
                    sampling_errors: 0,
                }),
                sampling_task: Mutex::new(None),
                timers_started: AtomicUsize::new(0),
            }),
        }
    }

    /// Start periodic sampling. A second call while running does nothing.
    pub fn start(&self) {
        let mut task = self.inner.sampling_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Resource monitor already running");
            return;
        }

        let monitor = self.clone();
        let interval = self.inner.config.interval.max(Duration::from_millis(1));
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.sample_once().await;
            }
        }));
        self.inner.timers_started.fetch_add(1, Ordering::Relaxed);

        info!(interval = ?interval, "Resource monitor started");
    }

    /// Stop sampling. No-op when not running.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.sampling_task.lock().take() {
            handle.abort();
            info!("Resource monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .sampling_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Take one sample now. Failures keep the previous snapshot.
    pub async fn sample_once(&self) {
        let sampler = Arc::clone(&self.inner.sampler);
        let result = tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .unwrap_or_else(|e| Err(SamplingError::Join(e.to_string())));

        match result {
            Ok(raw) => self.ingest_sample(raw),
            Err(e) => {
                self.inner.state.write().sampling_errors += 1;
                warn!(error = %e, "Resource sampling failed, keeping last snapshot");
            }
        }
    }

    /// Fold a reading into history and re-evaluate the degradation level.
    pub fn ingest_sample(&self, raw: RawSample) {
        let config = &self.inner.config;
        let cpu = raw.cpu_percent.clamp(0.0, 100.0);
        let io = raw.io_percent();

        let change = {
            let mut state = self.inner.state.write();
            push_bounded(&mut state.cpu_history, cpu, config.history_size);
            push_bounded(&mut state.memory_history, raw.memory_used_bytes, config.history_size);
            push_bounded(&mut state.io_history, io, config.history_size);
            state.samples_collected += 1;

            let (computed, reason) = evaluate(config, cpu, raw.memory_used_bytes);
            let level = state.manual_override.unwrap_or(computed);
            let old = state.snapshot.degradation_level;

            state.snapshot = ResourceSnapshot {
                cpu_percent: cpu,
                memory_used_bytes: raw.memory_used_bytes,
                memory_percent: raw.memory_percent(),
                io_percent: io,
                degradation_level: level,
                timestamp: SystemTime::now(),
            };

            (old != level).then_some((old, level, reason))
        };

        if io > config.io_threshold {
            debug!(io_percent = io, "IO activity above threshold");
        }

        if let Some((old, new, reason)) = change {
            self.publish_change(old, new, reason);
        }
    }

    /// Receive this monitor's `degradation:changed` events.
    pub fn subscribe(&self) -> flume::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn get_current_usage(&self) -> ResourceSnapshot {
        self.inner.state.read().snapshot.clone()
    }

    pub fn degradation_level(&self) -> DegradationLevel {
        self.inner.state.read().snapshot.degradation_level
    }

    /// Pin the degradation level until [`clear_override`](Self::clear_override).
    pub fn set_degradation_level(&self, level: DegradationLevel, reason: &str) {
        let old = {
            let mut state = self.inner.state.write();
            state.manual_override = Some(level);
            std::mem::replace(&mut state.snapshot.degradation_level, level)
        };

        info!(level = level.as_u8(), reason, "Degradation level set manually");
        if old != level {
            self.publish_change(old, level, reason.to_string());
        }
    }

    /// Return to sampled degradation, re-evaluated from the newest sample.
    pub fn clear_override(&self) {
        let change = {
            let mut state = self.inner.state.write();
            if state.manual_override.take().is_none() {
                return;
            }
            let level = match (state.cpu_history.back(), state.memory_history.back()) {
                (Some(&cpu), Some(&memory)) => evaluate(&self.inner.config, cpu, memory).0,
                _ => DegradationLevel::Normal,
            };
            let old = std::mem::replace(&mut state.snapshot.degradation_level, level);
            (old != level).then_some((old, level))
        };

        if let Some((old, new)) = change {
            self.publish_change(old, new, "manual override cleared".to_string());
        }
    }

    pub fn get_recommended_analysis_depth(&self) -> AnalysisDepth {
        self.degradation_level().analysis_depth()
    }

    pub fn get_recommended_concurrency(&self) -> usize {
        self.degradation_level()
            .recommended_concurrency(self.inner.baseline_concurrency)
    }

    pub fn get_statistics(&self) -> ResourceStatistics {
        let is_running = self.is_running();
        let state = self.inner.state.read();
        ResourceStatistics {
            current: state.snapshot.clone(),
            average_cpu_percent: mean_f64(&state.cpu_history),
            average_memory_bytes: if state.memory_history.is_empty() {
                0
            } else {
                state.memory_history.iter().sum::<u64>() / state.memory_history.len() as u64
            },
            average_io_percent: mean_f64(&state.io_history),
            history_len: state.cpu_history.len(),
            samples_collected: state.samples_collected,
            sampling_errors: state.sampling_errors,
            manual_override: state.manual_override,
            is_running,
        }
    }

    fn publish_change(&self, old: DegradationLevel, new: DegradationLevel, reason: String) {
        info!(
            old_level = old.as_u8(),
            new_level = new.as_u8(),
            reason = %reason,
            "Degradation level changed"
        );
        self.inner.events.publish(Event::DegradationChanged {
            old_level: old,
            new_level: new,
            reason,
        });
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("level", &self.degradation_level())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Both over threshold is critical, either alone is elevated.
fn evaluate(config: &MonitorConfig, cpu: f64, memory: u64) -> (DegradationLevel, String) {
    let cpu_high = cpu > config.cpu_threshold;
    let memory_high = memory > config.memory_threshold;

    match (cpu_high, memory_high) {
        (true, true) => (
            DegradationLevel::Critical,
            format!("cpu {:.1}% and memory {} bytes above thresholds", cpu, memory),
        ),
        (true, false) => (
            DegradationLevel::Elevated,
            format!("cpu {:.1}% above {:.1}%", cpu, config.cpu_threshold),
        ),
        (false, true) => (
            DegradationLevel::Elevated,
            format!("memory {} bytes above {} bytes", memory, config.memory_threshold),
        ),
        (false, false) => (
            DegradationLevel::Normal,
            "resource usage within thresholds".to_string(),
        ),
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T, capacity: usize) {
    if buffer.len() == capacity {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

fn mean_f64(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
