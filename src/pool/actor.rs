//! One actor per language pool
//!
//! The actor task exclusively owns the pool's workers and internal queue.
//! Commands arrive on a flume mailbox; unit results and timeout expiries on
//! two internal channels. A task whose file has a newer submission is
//! dropped from the queue, or on arrival, before it reaches a worker.

use super::protocol::WorkerRequest;
use super::unit::{ExecutionUnit, UnitEvent, UnitFactory};
use crate::config::PoolConfig;
use crate::errors::TaskError;
use crate::events::{Event, EventBus};
use crate::language::{ExecutionKind, Language};
use crate::monitor::{AnalysisDepth, ResourceMonitor};
use crate::task::{TaskId, TaskWrapper};
use dashmap::DashMap;
use flume::{Receiver, Sender};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Automatic worker replacements are limited to this many per window.
const RESTART_WINDOW: Duration = Duration::from_secs(60);

pub(crate) enum PoolMessage {
    Submit(TaskWrapper),
    Cancel {
        task_id: TaskId,
        reply: Sender<bool>,
    },
    CancelForFile {
        path: PathBuf,
        reply: Sender<Vec<TaskId>>,
    },
    /// Purge queued tasks older than the newest submission for `path`
    Supersede {
        path: PathBuf,
    },
    Scale {
        cpu_percent: f64,
        memory_bytes: u64,
        reply: Sender<usize>,
    },
    TrimIdle {
        reply: Sender<usize>,
    },
    Stats {
        reply: Sender<LanguagePoolStatistics>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LanguagePoolStatistics {
    pub language: Language,
    pub execution_kind: ExecutionKind,
    pub workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub queued: usize,
    pub target_size: usize,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    /// Cancelled because a newer submission for the same file arrived
    pub superseded: u64,
    pub worker_restarts: u64,
    pub average_task_duration: Duration,
}

struct Timeout {
    task_id: TaskId,
    worker_id: u64,
}

struct Worker {
    unit: Arc<dyn ExecutionUnit>,
    current: Option<TaskWrapper>,
    created_at: Instant,
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    timeouts: u64,
    cancelled: u64,
    superseded: u64,
    worker_restarts: u64,
    average_secs: f64,
}

/// Pool size for the given pressure, never below one.
pub fn target_pool_size(config: &PoolConfig, cpu_percent: f64, memory_bytes: u64) -> usize {
    let mut multiplier = if cpu_percent > config.high_load_threshold {
        0.5
    } else if cpu_percent > config.high_load_threshold * 0.75 {
        0.75
    } else {
        1.0
    };
    if memory_bytes > config.memory_pressure_threshold {
        multiplier *= 0.5;
    }
    ((config.max_concurrent_operations as f64 * multiplier).floor() as usize).max(1)
}

pub(crate) struct PoolActor {
    language: Language,
    config: PoolConfig,
    factory: Arc<dyn UnitFactory>,
    events: EventBus,
    monitor: Option<ResourceMonitor>,
    routes: Arc<DashMap<TaskId, Language>>,
    /// Newest submission per file, shared by every pool
    superseded: Arc<DashMap<PathBuf, TaskId>>,
    workers: BTreeMap<u64, Worker>,
    queue: VecDeque<TaskWrapper>,
    target_size: usize,
    restarts: VecDeque<Instant>,
    counters: Counters,
    unit_tx: Sender<UnitEvent>,
    unit_rx: Receiver<UnitEvent>,
    timer_tx: Sender<Timeout>,
    timer_rx: Receiver<Timeout>,
}

impl PoolActor {
    pub(crate) fn new(
        language: Language,
        config: PoolConfig,
        factory: Arc<dyn UnitFactory>,
        events: EventBus,
        monitor: Option<ResourceMonitor>,
        routes: Arc<DashMap<TaskId, Language>>,
        superseded: Arc<DashMap<PathBuf, TaskId>>,
    ) -> Self {
        let (unit_tx, unit_rx) = flume::unbounded();
        let (timer_tx, timer_rx) = flume::unbounded();
        let target_size = match &monitor {
            Some(monitor) => {
                let usage = monitor.get_current_usage();
                target_pool_size(&config, usage.cpu_percent, usage.memory_used_bytes)
            }
            None => config.max_concurrent_operations.max(1),
        };
        Self {
            language,
            config,
            factory,
            events,
            monitor,
            routes,
            superseded,
            workers: BTreeMap::new(),
            queue: VecDeque::new(),
            target_size,
            restarts: VecDeque::new(),
            counters: Counters::default(),
            unit_tx,
            unit_rx,
            timer_tx,
            timer_rx,
        }
    }

    pub(crate) async fn run(mut self, mailbox: Receiver<PoolMessage>) {
        self.spawn_worker();
        self.events.publish(Event::PoolInitialized {
            language: self.language,
            execution_kind: self.language.execution_kind(),
            workers: self.workers.len(),
        });
        info!(
            language = %self.language,
            kind = ?self.language.execution_kind(),
            target_size = self.target_size,
            "Worker pool started"
        );

        let unit_rx = self.unit_rx.clone();
        let timer_rx = self.timer_rx.clone();
        loop {
            tokio::select! {
                message = mailbox.recv_async() => match message {
                    Ok(PoolMessage::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Ok(message) => self.handle(message).await,
                    Err(_) => {
                        self.shutdown().await;
                        return;
                    }
                },
                Ok(event) = unit_rx.recv_async() => self.on_unit_event(event).await,
                Ok(timeout) = timer_rx.recv_async() => self.on_timeout(timeout).await,
            }
        }
    }

    async fn handle(&mut self, message: PoolMessage) {
        match message {
            PoolMessage::Submit(task) => {
                if self.is_superseded(&task) {
                    self.supersede(task);
                } else {
                    self.enqueue(task);
                    self.try_dispatch().await;
                }
            }
            PoolMessage::Cancel { task_id, reply } => {
                let cancelled = self.cancel(task_id).await;
                let _ = reply.send(cancelled);
            }
            PoolMessage::CancelForFile { path, reply } => {
                let _ = reply.send(self.cancel_for_file(&path));
            }
            PoolMessage::Supersede { path } => self.purge_superseded(&path),
            PoolMessage::Scale {
                cpu_percent,
                memory_bytes,
                reply,
            } => {
                let size = self.scale(cpu_percent, memory_bytes).await;
                let _ = reply.send(size);
            }
            PoolMessage::TrimIdle { reply } => {
                let trimmed = self.retire_idle(1).await;
                let _ = reply.send(trimmed);
            }
            PoolMessage::Stats { reply } => {
                let _ = reply.send(self.statistics());
            }
            PoolMessage::Shutdown { .. } => {}
        }
    }

    /// Insert keeping descending priority, FIFO among equals.
    fn enqueue(&mut self, task: TaskWrapper) {
        let at = self
            .queue
            .iter()
            .position(|queued| queued.relevance_score < task.relevance_score)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, task);
    }

    fn idle_worker(&self) -> Option<u64> {
        self.workers
            .iter()
            .find(|(_, worker)| worker.current.is_none())
            .map(|(id, _)| *id)
    }

    fn busy_count(&self) -> usize {
        self.workers.values().filter(|w| w.current.is_some()).count()
    }

    /// Start a worker; returns its id on success.
    fn spawn_worker(&mut self) -> Option<u64> {
        let worker_id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        match self
            .factory
            .spawn(self.language, worker_id, self.unit_tx.clone())
        {
            Ok(unit) => {
                debug!(language = %self.language, worker_id, "Worker started");
                self.workers.insert(
                    worker_id,
                    Worker {
                        unit,
                        current: None,
                        created_at: Instant::now(),
                    },
                );
                Some(worker_id)
            }
            Err(e) => {
                warn!(language = %self.language, error = %e, "Failed to start worker");
                self.events.publish(Event::WorkerError {
                    language: self.language,
                    worker_id,
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Replace a lost worker if the restart budget allows.
    fn replace_worker(&mut self) {
        let now = Instant::now();
        while self
            .restarts
            .front()
            .is_some_and(|at| now.duration_since(*at) > RESTART_WINDOW)
        {
            self.restarts.pop_front();
        }

        if self.restarts.len() >= self.config.max_worker_restarts {
            warn!(
                language = %self.language,
                restarts = self.restarts.len(),
                "Worker restart budget exhausted"
            );
            return;
        }

        if self.spawn_worker().is_some() {
            self.restarts.push_back(now);
            self.counters.worker_restarts += 1;
        }
    }

    async fn try_dispatch(&mut self) {
        while !self.queue.is_empty() {
            let worker_id = match self.idle_worker() {
                Some(id) => id,
                None if self.workers.len() < self.target_size => match self.spawn_worker() {
                    Some(id) => id,
                    None => break,
                },
                None => break,
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            self.dispatch(worker_id, task).await;
        }

        if self.workers.is_empty() && !self.queue.is_empty() {
            let error = TaskError::Dispatch(format!("no {} worker could be started", self.language));
            for task in std::mem::take(&mut self.queue) {
                self.fail(task, error.clone());
            }
        }
    }

    async fn dispatch(&mut self, worker_id: u64, mut task: TaskWrapper) {
        let Some(unit) = self.workers.get(&worker_id).map(|w| Arc::clone(&w.unit)) else {
            self.enqueue(task);
            return;
        };

        let recommended = self
            .monitor
            .as_ref()
            .map_or(AnalysisDepth::Full, ResourceMonitor::get_recommended_analysis_depth);
        let mut options = task.request.options.clone();
        options.language = Some(self.language);
        options.depth = Some(
            options
                .depth
                .unwrap_or(AnalysisDepth::Full)
                .most_restrictive(recommended),
        );

        let request = WorkerRequest {
            task_id: task.id,
            file_path: task.request.file_path.clone(),
            content: task.request.content.clone(),
            options,
        };

        if let Err(e) = unit.send(request).await {
            warn!(language = %self.language, worker_id, error = %e, "Dispatch failed");
            self.remove_worker(worker_id).await;
            self.fail(task, e);
            self.replace_worker();
            return;
        }

        let timer_tx = self.timer_tx.clone();
        let timeout = self.config.worker_timeout;
        let task_id = task.id;
        task.started_at = Some(Instant::now());
        task.assigned_worker = Some(worker_id);
        task.timeout_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(Timeout { task_id, worker_id });
        }));

        debug!(task_id = %task.id, worker_id, "Task dispatched");
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.current = Some(task);
        }
    }

    async fn on_unit_event(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::Completed {
                worker_id,
                task_id,
                result,
            } => {
                let Some(worker) = self.workers.get_mut(&worker_id) else {
                    debug!(worker_id, %task_id, "Discarding result from terminated worker");
                    return;
                };
                if worker.current.as_ref().map(|t| t.id) != Some(task_id) {
                    debug!(worker_id, %task_id, "Discarding stale result");
                    return;
                }
                let Some(mut task) = worker.current.take() else {
                    return;
                };
                task.clear_timeout();

                match result {
                    Ok(tree) => {
                        let duration = task.started_at.map(|at| at.elapsed()).unwrap_or_default();
                        self.record_duration(duration);
                        self.counters.completed += 1;
                        self.routes.remove(&task.id);
                        self.events.publish(Event::TaskCompleted {
                            task_id: task.id,
                            file_path: task.request.file_path,
                            language: self.language,
                            tree,
                            duration,
                        });
                    }
                    Err(error) => self.fail(task, error),
                }

                self.enforce_target().await;
                self.try_dispatch().await;
            }
            UnitEvent::Exited {
                worker_id,
                code,
                message,
            } => {
                let Some(mut worker) = self.workers.remove(&worker_id) else {
                    return;
                };
                warn!(
                    language = %self.language,
                    worker_id,
                    ?code,
                    uptime = ?worker.created_at.elapsed(),
                    %message,
                    "Worker exited unexpectedly"
                );
                self.events.publish(Event::WorkerError {
                    language: self.language,
                    worker_id,
                    message,
                });
                if let Some(mut task) = worker.current.take() {
                    task.clear_timeout();
                    self.fail(task, TaskError::WorkerCrash { worker_id, code });
                }
                self.replace_worker();
                self.try_dispatch().await;
            }
        }
    }

    async fn on_timeout(&mut self, timeout: Timeout) {
        let matches = self
            .workers
            .get(&timeout.worker_id)
            .and_then(|w| w.current.as_ref())
            .is_some_and(|task| task.id == timeout.task_id);
        if !matches {
            return;
        }

        warn!(
            language = %self.language,
            task_id = %timeout.task_id,
            worker_id = timeout.worker_id,
            "Task timed out, terminating worker"
        );
        if let Some(mut task) = self.remove_worker(timeout.worker_id).await {
            task.timeout_handle = None;
            self.counters.timeouts += 1;
            self.fail(task, TaskError::Timeout(self.config.worker_timeout));
        }
        self.replace_worker();
        self.try_dispatch().await;
    }

    /// Kill and forget a worker, returning its task if it had one.
    async fn remove_worker(&mut self, worker_id: u64) -> Option<TaskWrapper> {
        let mut worker = self.workers.remove(&worker_id)?;
        worker.unit.kill().await;
        worker.current.take().map(|mut task| {
            task.clear_timeout();
            task
        })
    }

    async fn cancel(&mut self, task_id: TaskId) -> bool {
        if let Some(at) = self.queue.iter().position(|t| t.id == task_id) {
            if let Some(task) = self.queue.remove(at) {
                self.counters.cancelled += 1;
                self.fail(task, TaskError::Cancelled);
            }
            return true;
        }

        let running = self
            .workers
            .iter()
            .find(|(_, w)| w.current.as_ref().is_some_and(|t| t.id == task_id))
            .map(|(id, _)| *id);
        let Some(worker_id) = running else {
            return false;
        };

        info!(%task_id, worker_id, "Cancelling running task, terminating worker");
        if let Some(task) = self.remove_worker(worker_id).await {
            self.counters.cancelled += 1;
            self.fail(task, TaskError::Cancelled);
        }
        self.replace_worker();
        self.try_dispatch().await;
        true
    }

    fn cancel_for_file(&mut self, path: &Path) -> Vec<TaskId> {
        let (matching, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|t| t.file_path() == path);
        self.queue = kept;

        let ids = matching.iter().map(|t| t.id).collect();
        for task in matching {
            self.counters.cancelled += 1;
            self.fail(task, TaskError::Cancelled);
        }
        ids
    }

    /// Whether a newer submission for the same file is already known.
    fn is_superseded(&self, task: &TaskWrapper) -> bool {
        let path = task.file_path();
        if self
            .superseded
            .get(path)
            .is_some_and(|newer| task.id < *newer)
        {
            return true;
        }
        // The newest task has arrived; nothing older can follow it
        self.superseded.remove_if(path, |_, newer| *newer <= task.id);
        false
    }

    fn supersede(&mut self, task: TaskWrapper) {
        debug!(task_id = %task.id, path = %task.file_path().display(), "Superseded before dispatch");
        self.counters.superseded += 1;
        self.counters.cancelled += 1;
        self.fail(task, TaskError::Cancelled);
    }

    fn purge_superseded(&mut self, path: &Path) {
        let Some(newer) = self.superseded.get(path).map(|entry| *entry) else {
            return;
        };
        let (stale, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|t| t.file_path() == path && t.id < newer);
        self.queue = kept;
        for task in stale {
            self.supersede(task);
        }
    }

    async fn scale(&mut self, cpu_percent: f64, memory_bytes: u64) -> usize {
        let target = target_pool_size(&self.config, cpu_percent, memory_bytes);
        let previous = self.workers.len();
        self.target_size = target;

        let demand = (self.busy_count() + self.queue.len()).min(target);
        while self.workers.len() < demand {
            if self.spawn_worker().is_none() {
                break;
            }
        }
        self.enforce_target().await;

        if self.workers.len() != previous {
            info!(
                language = %self.language,
                cpu_percent,
                memory_bytes,
                target,
                from = previous,
                to = self.workers.len(),
                "Pool rescaled"
            );
        }

        self.try_dispatch().await;
        self.workers.len()
    }

    /// Retire idle workers above the target. Busy workers are never touched.
    async fn enforce_target(&mut self) {
        let excess = self.workers.len().saturating_sub(self.target_size);
        if excess > 0 {
            self.retire_idle_count(excess).await;
        }
    }

    /// Retire idle workers until `floor` remain or none are idle.
    async fn retire_idle(&mut self, floor: usize) -> usize {
        let excess = self.workers.len().saturating_sub(floor);
        self.retire_idle_count(excess).await
    }

    async fn retire_idle_count(&mut self, count: usize) -> usize {
        let idle: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, w)| w.current.is_none())
            .map(|(id, _)| *id)
            .take(count)
            .collect();
        for worker_id in &idle {
            self.remove_worker(*worker_id).await;
        }
        idle.len()
    }

    fn fail(&mut self, task: TaskWrapper, error: TaskError) {
        if error != TaskError::Cancelled {
            self.counters.failed += 1;
        }
        self.routes.remove(&task.id);
        debug!(task_id = %task.id, error = %error, "Task failed");
        self.events.publish(Event::TaskFailed {
            task_id: task.id,
            file_path: task.request.file_path,
            language: Some(self.language),
            error,
        });
    }

    fn record_duration(&mut self, duration: Duration) {
        let n = (self.counters.completed + 1) as f64;
        let sample = duration.as_secs_f64();
        self.counters.average_secs += (sample - self.counters.average_secs) / n;
    }

    fn statistics(&self) -> LanguagePoolStatistics {
        let busy = self.busy_count();
        LanguagePoolStatistics {
            language: self.language,
            execution_kind: self.language.execution_kind(),
            workers: self.workers.len(),
            busy_workers: busy,
            idle_workers: self.workers.len() - busy,
            queued: self.queue.len(),
            target_size: self.target_size,
            completed: self.counters.completed,
            failed: self.counters.failed,
            timeouts: self.counters.timeouts,
            cancelled: self.counters.cancelled,
            superseded: self.counters.superseded,
            worker_restarts: self.counters.worker_restarts,
            average_task_duration: Duration::from_secs_f64(self.counters.average_secs.max(0.0)),
        }
    }

    async fn shutdown(&mut self) {
        for task in std::mem::take(&mut self.queue) {
            self.fail(task, TaskError::PoolShutdown);
        }

        let worker_ids: Vec<u64> = self.workers.keys().copied().collect();
        for worker_id in worker_ids {
            if let Some(task) = self.remove_worker(worker_id).await {
                self.fail(task, TaskError::PoolShutdown);
            }
        }

        self.events.publish(Event::PoolShutdown {
            language: self.language,
        });
        info!(language = %self.language, "Worker pool shut down");
    }
}
