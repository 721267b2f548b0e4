//! Composition root for the scheduler
//!
//! [`PerformanceManager`] owns one instance of every component and wires
//! them together through the shared [`EventBus`]:
//!
//! - degradation changes update the load level and rescale the pools
//! - task results update the global counters and free dispatch capacity
//! - a dispatch loop moves tasks from the priority queue into the pools
//!   while the monitor's recommended concurrency allows it

use crate::config::PerformanceConfig;
use crate::errors::{Result, SchedulerError, TaskError};
use crate::events::{Event, EventBus};
use crate::infrastructure::metrics::{self, MetricsSummary, SchedulerMetrics, TimingStats};
use crate::lazy::{LazyCacheStatistics, LazyLoadingManager};
use crate::language::Language;
use crate::monitor::{
    AnalysisDepth, DegradationLevel, ResourceMonitor, ResourceSampler, ResourceStatistics,
    SystemSampler,
};
use crate::pool::{AdaptiveWorkerPool, DefaultUnitFactory, PoolStatistics, UnitFactory};
use crate::queue::{QueueStatistics, RelevanceContext, SmartPriorityQueue};
use crate::task::{AnalysisRequest, TaskId};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Human-facing name for a degradation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl LoadLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "normal" | "0" => Some(Self::Normal),
            "elevated" | "1" => Some(Self::Elevated),
            "high" | "2" => Some(Self::High),
            "critical" | "3" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl From<DegradationLevel> for LoadLevel {
    fn from(level: DegradationLevel) -> Self {
        match level {
            DegradationLevel::Normal => Self::Normal,
            DegradationLevel::Elevated => Self::Elevated,
            DegradationLevel::Severe => Self::High,
            DegradationLevel::Critical => Self::Critical,
        }
    }
}

impl From<LoadLevel> for DegradationLevel {
    fn from(level: LoadLevel) -> Self {
        match level {
            LoadLevel::Normal => Self::Normal,
            LoadLevel::Elevated => Self::Elevated,
            LoadLevel::High => Self::Severe,
            LoadLevel::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
    Queued,
    /// Rejected under critical load. Not an error.
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    /// `None` when throttled
    pub task_id: Option<TaskId>,
    pub status: SubmitStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cache_entries_removed: usize,
    pub workers_trimmed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStatistics {
    pub current_load: LoadLevel,
    pub total_submitted: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub throttling_events: u64,
    pub active_tasks: usize,
    pub in_flight: usize,
    pub task_duration: Option<TimingStats>,
    pub resources: ResourceStatistics,
    pub queue: QueueStatistics,
    pub pools: PoolStatistics,
    pub caches: LazyCacheStatistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Queued,
    Dispatched,
}

/// Bookkeeping for a task between submission and its result.
#[derive(Debug, Clone)]
struct ActiveTask {
    file_path: PathBuf,
    state: TaskState,
    submitted_at: Instant,
}

struct ManagerInner {
    config: PerformanceConfig,
    events: EventBus,
    monitor: ResourceMonitor,
    lazy: LazyLoadingManager,
    pool: AdaptiveWorkerPool,
    queue: Mutex<SmartPriorityQueue>,
    metrics: SchedulerMetrics,
    active: DashMap<TaskId, ActiveTask>,
    current_load: RwLock<LoadLevel>,
    in_flight: AtomicUsize,
    dispatch: Arc<Notify>,
    background: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

pub struct PerformanceManagerBuilder {
    config: PerformanceConfig,
    sampler: Option<Arc<dyn ResourceSampler>>,
    unit_factory: Option<Arc<dyn UnitFactory>>,
}

impl PerformanceManagerBuilder {
    /// Replace the `sysinfo` sampler, e.g. with a fixed reading.
    pub fn sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Replace how pools create their execution units.
    pub fn unit_factory(mut self, factory: Arc<dyn UnitFactory>) -> Self {
        self.unit_factory = Some(factory);
        self
    }

    pub fn build(self) -> PerformanceManager {
        let config = self.config;
        let events = EventBus::new();

        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SystemSampler::new()));
        let monitor = ResourceMonitor::with_sampler(
            config.monitor.clone(),
            config.pool.max_concurrent_operations,
            events.clone(),
            sampler,
        );
        let lazy = LazyLoadingManager::new(config.cache.clone(), events.clone());
        let factory = self.unit_factory.unwrap_or_else(|| {
            Arc::new(DefaultUnitFactory::new(
                config.pool.worker_executable.clone(),
                lazy.clone(),
            ))
        });
        let pool = AdaptiveWorkerPool::new(config.pool.clone(), events.clone(), factory);
        let queue = SmartPriorityQueue::new(&config.queue);

        PerformanceManager {
            inner: Arc::new(ManagerInner {
                config,
                events,
                monitor,
                lazy,
                pool,
                queue: Mutex::new(queue),
                metrics: SchedulerMetrics::new(),
                active: DashMap::new(),
                current_load: RwLock::new(LoadLevel::Normal),
                in_flight: AtomicUsize::new(0),
                dispatch: Arc::new(Notify::new()),
                background: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

/// The scheduler's single entry point.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct PerformanceManager {
    inner: Arc<ManagerInner>,
}

impl PerformanceManager {
    pub fn new(config: PerformanceConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: PerformanceConfig) -> PerformanceManagerBuilder {
        PerformanceManagerBuilder {
            config,
            sampler: None,
            unit_factory: None,
        }
    }

    /// Start monitoring, the caches' timers and the dispatch loop.
    ///
    /// Must run inside a tokio runtime. Calling it again is a no-op.
    pub fn initialize(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            debug!("Performance manager already initialized");
            return Ok(());
        }

        let inner = &self.inner;
        // Subscribe before anything can publish
        let events = inner.events.subscribe();

        inner.monitor.start();
        inner.lazy.initialize(&inner.monitor);
        inner.pool.initialize(&inner.monitor);
        *inner.current_load.write() = inner.monitor.degradation_level().into();

        let mut background = inner.background.lock();
        background.push(tokio::spawn(run_wiring(
            Arc::downgrade(&self.inner),
            events,
        )));
        background.push(tokio::spawn(run_dispatch(
            Arc::downgrade(&self.inner),
            Arc::clone(&inner.dispatch),
        )));
        drop(background);

        inner.dispatch.notify_one();
        inner.events.publish(Event::PerformanceInitialized);
        info!(
            max_concurrent_operations = inner.config.pool.max_concurrent_operations,
            sample_interval = ?inner.config.monitor.interval,
            "Performance manager initialized"
        );
        Ok(())
    }

    /// Queue a request, or throttle it under critical load.
    ///
    /// Never blocks. A newer request for the same file supersedes any older
    /// one not yet running on a worker, whether it waits in the priority
    /// queue or in a language pool. Superseded tasks fail with
    /// [`TaskError::Cancelled`].
    #[instrument(skip(self, request, context), fields(path = %request.file_path.display()))]
    pub fn submit_task(
        &self,
        request: AnalysisRequest,
        context: &RelevanceContext,
    ) -> Result<SubmitOutcome> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        inner.metrics.increment(metrics::TOTAL_SUBMITTED);

        if inner.is_throttling() {
            inner.metrics.increment(metrics::THROTTLING_EVENTS);
            debug!("Submission throttled under critical load");
            return Ok(SubmitOutcome {
                task_id: None,
                status: SubmitStatus::Throttled,
            });
        }

        let file_path = request.file_path.clone();
        let language = request.language();
        let (task_id, superseded) = {
            let mut queue = inner.queue.lock();
            let superseded = queue.cancel_obsolete_tasks(&file_path);
            (queue.enqueue(request, context), superseded)
        };

        for old in superseded {
            inner.active.remove(&old);
            inner.events.publish(Event::TaskFailed {
                task_id: old,
                file_path: file_path.clone(),
                language,
                error: TaskError::Cancelled,
            });
        }

        inner.pool.supersede(&file_path, task_id);

        inner.active.insert(
            task_id,
            ActiveTask {
                file_path,
                state: TaskState::Queued,
                submitted_at: Instant::now(),
            },
        );
        inner.dispatch.notify_one();

        Ok(SubmitOutcome {
            task_id: Some(task_id),
            status: SubmitStatus::Queued,
        })
    }

    /// Cancel a queued or running task. Unknown ids return `false`.
    pub async fn cancel_task(&self, task_id: TaskId) -> bool {
        let inner = &self.inner;
        let queued = inner.queue.lock().remove(task_id);
        if let Some(task) = queued {
            inner.active.remove(&task_id);
            inner.events.publish(Event::TaskFailed {
                task_id,
                language: task.request.language(),
                file_path: task.request.file_path,
                error: TaskError::Cancelled,
            });
            return true;
        }
        inner.pool.cancel_task(task_id).await
    }

    pub async fn get_performance_statistics(&self) -> PerformanceStatistics {
        let inner = &self.inner;
        let m = &inner.metrics;
        let pools = inner.pool.get_pool_statistics().await;
        let mut queue = inner.queue.lock().get_queue_statistics();
        queue.preemptive_cancellations += pools.superseded;
        PerformanceStatistics {
            current_load: self.get_current_performance_level(),
            total_submitted: m.get_counter(metrics::TOTAL_SUBMITTED),
            completed_tasks: m.get_counter(metrics::COMPLETED_TASKS),
            failed_tasks: m.get_counter(metrics::FAILED_TASKS),
            cancelled_tasks: m.get_counter(metrics::CANCELLED_TASKS),
            throttling_events: m.get_counter(metrics::THROTTLING_EVENTS),
            active_tasks: inner.active.len(),
            in_flight: inner.in_flight.load(Ordering::Acquire),
            task_duration: m.get_timing_stats(metrics::TASK_DURATION),
            resources: inner.monitor.get_statistics(),
            queue,
            pools,
            caches: inner.lazy.get_cache_statistics(),
        }
    }

    /// Counters and timings as collected so far.
    pub fn metrics_summary(&self) -> MetricsSummary {
        self.inner.metrics.summary()
    }

    /// Pin the load level until [`Self::clear_performance_override`].
    pub fn set_performance_level(&self, level: LoadLevel) {
        let inner = &self.inner;
        info!(%level, "Performance level set manually");
        inner.update_load(level);
        inner
            .monitor
            .set_degradation_level(level.into(), &format!("performance level set to {}", level));
        inner.dispatch.notify_one();
    }

    /// Return to sampling-driven levels.
    pub fn clear_performance_override(&self) {
        self.inner.monitor.clear_override();
    }

    pub fn get_current_performance_level(&self) -> LoadLevel {
        *self.inner.current_load.read()
    }

    /// Drop every cache entry and retire idle workers.
    pub async fn force_cleanup(&self) -> CleanupReport {
        let inner = &self.inner;
        let report = CleanupReport {
            cache_entries_removed: inner.lazy.schedule_cleanup(Duration::ZERO),
            workers_trimmed: inner.pool.trim_idle().await,
        };
        inner.events.publish(Event::PerformanceForcedCleanup {
            cache_entries_removed: report.cache_entries_removed,
            workers_trimmed: report.workers_trimmed,
        });
        info!(
            cache_entries_removed = report.cache_entries_removed,
            workers_trimmed = report.workers_trimmed,
            "Forced cleanup"
        );
        report
    }

    pub fn subscribe(&self) -> flume::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn resource_monitor(&self) -> &ResourceMonitor {
        &self.inner.monitor
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stop monitoring, terminate the pools, clear the queue, release caches.
    ///
    /// Safe to call whether or not [`Self::initialize`] ran or succeeded.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down performance manager");

        inner.monitor.stop();
        let background: Vec<JoinHandle<()>> = inner.background.lock().drain(..).collect();
        for handle in &background {
            handle.abort();
        }

        inner.pool.shutdown().await;

        let discarded = inner.queue.lock().clear();
        let pending: Vec<(TaskId, ActiveTask)> = inner
            .active
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        inner.active.clear();
        for (task_id, task) in pending {
            if task.state == TaskState::Queued {
                inner.events.publish(Event::TaskFailed {
                    task_id,
                    language: Language::from_path(&task.file_path),
                    file_path: task.file_path,
                    error: TaskError::PoolShutdown,
                });
            }
        }
        inner.in_flight.store(0, Ordering::Release);

        inner.lazy.shutdown();
        inner.events.publish(Event::PerformanceShutdown);
        info!(discarded, "Performance manager shut down");
    }
}

impl fmt::Debug for PerformanceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceManager")
            .field("current_load", &self.get_current_performance_level())
            .field("active_tasks", &self.inner.active.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl ManagerInner {
    fn is_throttling(&self) -> bool {
        self.monitor.degradation_level() == DegradationLevel::Critical
            && self.monitor.get_recommended_analysis_depth() == AnalysisDepth::Disabled
    }

    fn update_load(&self, level: LoadLevel) {
        let old = std::mem::replace(&mut *self.current_load.write(), level);
        if old != level {
            self.events.publish(Event::PerformanceLevelChanged { old, new: level });
        }
    }

    /// Move tasks into the pools while concurrency allows.
    fn dispatch_ready(&self) {
        loop {
            let limit = self.monitor.get_recommended_concurrency();
            if limit == 0 || self.in_flight.load(Ordering::Acquire) >= limit {
                return;
            }
            let Some(task) = self.queue.lock().dequeue() else {
                return;
            };

            let task_id = task.id;
            let file_path = task.request.file_path.clone();
            let language = task.request.language();
            if let Some(mut entry) = self.active.get_mut(&task_id) {
                entry.state = TaskState::Dispatched;
            }
            self.in_flight.fetch_add(1, Ordering::AcqRel);

            if let Err(error) = self.pool.submit_task(task) {
                warn!(%task_id, error = %error, "Pool rejected task");
                self.finish(task_id);
                self.events.publish(Event::TaskFailed {
                    task_id,
                    file_path,
                    language,
                    error,
                });
            }
        }
    }

    /// Forget a finished task, releasing its dispatch slot.
    fn finish(&self, task_id: TaskId) {
        if let Some((_, task)) = self.active.remove(&task_id) {
            if task.state == TaskState::Dispatched {
                let _ = self
                    .in_flight
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            }
            debug!(%task_id, elapsed = ?task.submitted_at.elapsed(), "Task finished");
        }
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::DegradationChanged {
                new_level, reason, ..
            } => {
                self.update_load(new_level.into());
                let usage = self.monitor.get_current_usage();
                let workers = self
                    .pool
                    .rescale_all(usage.cpu_percent, usage.memory_used_bytes)
                    .await;
                info!(level = %new_level, %reason, workers, "Load level changed");
                self.dispatch.notify_one();
            }
            Event::TaskCompleted {
                task_id, duration, ..
            } => {
                self.metrics.increment(metrics::COMPLETED_TASKS);
                self.metrics.record_timing(metrics::TASK_DURATION, duration);
                self.finish(task_id);
                self.dispatch.notify_one();
            }
            Event::TaskFailed { task_id, error, .. } => {
                if error == TaskError::Cancelled {
                    self.metrics.increment(metrics::CANCELLED_TASKS);
                } else {
                    self.metrics.increment(metrics::FAILED_TASKS);
                }
                self.finish(task_id);
                self.dispatch.notify_one();
            }
            _ => {}
        }
    }
}

async fn run_wiring(inner: Weak<ManagerInner>, events: flume::Receiver<Event>) {
    while let Ok(event) = events.recv_async().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
}

async fn run_dispatch(inner: Weak<ManagerInner>, wake: Arc<Notify>) {
    loop {
        match inner.upgrade() {
            Some(inner) => inner.dispatch_ready(),
            None => break,
        }
        wake.notified().await;
    }
}
