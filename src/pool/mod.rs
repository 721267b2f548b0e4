//! Adaptive worker pools, one per language
//!
//! Each language pool is an actor that owns its workers and internal queue.
//! [`AdaptiveWorkerPool`] is the cheap, cloneable front that creates pools
//! on first use and routes commands to them.

mod actor;
pub mod protocol;
pub mod stdio;
pub mod unit;

pub use actor::{target_pool_size, LanguagePoolStatistics};
pub use protocol::{decode_line, encode_line, WorkerRequest, WorkerResponse};
pub use stdio::{run_stdio_worker, serve};
pub use unit::{
    DefaultUnitFactory, ExecutionUnit, InProcessUnit, IsolatedProcessUnit, UnitEvent,
    UnitFactory, UnitSink,
};

use actor::{PoolActor, PoolMessage};
use crate::config::PoolConfig;
use crate::errors::TaskError;
use crate::events::EventBus;
use crate::language::Language;
use crate::monitor::ResourceMonitor;
use crate::task::{TaskId, TaskWrapper};
use dashmap::DashMap;
use flume::Sender;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Totals across every language pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatistics {
    pub pools: Vec<LanguagePoolStatistics>,
    pub total_workers: usize,
    pub busy_workers: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub superseded: u64,
    pub worker_restarts: u64,
    pub average_task_duration: Duration,
}

struct PoolHandle {
    mailbox: Sender<PoolMessage>,
    task: JoinHandle<()>,
}

struct PoolInner {
    config: PoolConfig,
    events: EventBus,
    factory: Arc<dyn UnitFactory>,
    monitor: RwLock<Option<ResourceMonitor>>,
    pools: DashMap<Language, PoolHandle>,
    routes: Arc<DashMap<TaskId, Language>>,
    superseded: Arc<DashMap<PathBuf, TaskId>>,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct AdaptiveWorkerPool {
    inner: Arc<PoolInner>,
}

impl AdaptiveWorkerPool {
    pub fn new(config: PoolConfig, events: EventBus, factory: Arc<dyn UnitFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                events,
                factory,
                monitor: RwLock::new(None),
                pools: DashMap::new(),
                routes: Arc::new(DashMap::new()),
                superseded: Arc::new(DashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Pools created after this point size themselves from the monitor's
    /// latest reading and stamp its recommended depth onto every request.
    pub fn initialize(&self, monitor: &ResourceMonitor) {
        *self.inner.monitor.write() = Some(monitor.clone());
        info!(
            max_concurrent_operations = self.inner.config.max_concurrent_operations,
            worker_timeout = ?self.inner.config.worker_timeout,
            "Adaptive worker pool initialized"
        );
    }

    fn mailbox(&self, language: Language) -> Result<Sender<PoolMessage>, TaskError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(TaskError::PoolShutdown);
        }
        if let Some(handle) = self.inner.pools.get(&language) {
            return Ok(handle.mailbox.clone());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TaskError::Dispatch(format!("no async runtime: {}", e)))?;

        let handle = self.inner.pools.entry(language).or_insert_with(|| {
            let (mailbox, receiver) = flume::unbounded();
            let actor = PoolActor::new(
                language,
                self.inner.config.clone(),
                Arc::clone(&self.inner.factory),
                self.inner.events.clone(),
                self.inner.monitor.read().clone(),
                Arc::clone(&self.inner.routes),
                Arc::clone(&self.inner.superseded),
            );
            debug!(%language, "Creating worker pool");
            PoolHandle {
                mailbox,
                task: runtime.spawn(actor.run(receiver)),
            }
        });
        Ok(handle.mailbox.clone())
    }

    fn mailboxes(&self) -> Vec<Sender<PoolMessage>> {
        self.inner
            .pools
            .iter()
            .map(|entry| entry.mailbox.clone())
            .collect()
    }

    /// Hand a task to its language pool. Returns as soon as it is queued there.
    pub fn submit_task(&self, task: TaskWrapper) -> Result<TaskId, TaskError> {
        let language = task.request.language().ok_or_else(|| {
            TaskError::UnsupportedLanguage(task.request.file_path.display().to_string())
        })?;
        let mailbox = self.mailbox(language)?;

        let task_id = task.id;
        self.inner.routes.insert(task_id, language);
        if mailbox.send(PoolMessage::Submit(task)).is_err() {
            self.inner.routes.remove(&task_id);
            return Err(TaskError::PoolShutdown);
        }
        Ok(task_id)
    }

    /// Cancel a task owned by a pool. Running tasks cost their worker.
    pub async fn cancel_task(&self, task_id: TaskId) -> bool {
        let Some(language) = self.inner.routes.get(&task_id).map(|entry| *entry) else {
            return false;
        };
        let Some(mailbox) = self.inner.pools.get(&language).map(|h| h.mailbox.clone()) else {
            return false;
        };
        ask(&mailbox, |reply| PoolMessage::Cancel { task_id, reply })
            .await
            .unwrap_or(false)
    }

    /// Cancel tasks for `path` that are still waiting in a pool queue.
    pub async fn cancel_tasks_for_file(&self, path: &Path) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for mailbox in self.mailboxes() {
            let path = path.to_path_buf();
            if let Some(ids) = ask(&mailbox, |reply| PoolMessage::CancelForFile { path, reply }).await
            {
                cancelled.extend(ids);
            }
        }
        cancelled
    }

    /// Mark `newer` as the only submission for `path` that may still run.
    ///
    /// Older tasks for the file that are waiting in a pool queue, or that
    /// reach a pool later, fail with [`TaskError::Cancelled`]. Tasks already
    /// on a worker are left alone.
    pub fn supersede(&self, path: &Path, newer: TaskId) {
        self.inner
            .superseded
            .entry(path.to_path_buf())
            .and_modify(|id| *id = (*id).max(newer))
            .or_insert(newer);

        for mailbox in self.mailboxes() {
            let _ = mailbox.send(PoolMessage::Supersede {
                path: path.to_path_buf(),
            });
        }
    }

    /// Resize one language pool for the given pressure. Returns its worker count.
    pub async fn scale_pool(&self, language: Language, cpu_percent: f64, memory_bytes: u64) -> usize {
        let Ok(mailbox) = self.mailbox(language) else {
            return 0;
        };
        ask(&mailbox, |reply| PoolMessage::Scale {
            cpu_percent,
            memory_bytes,
            reply,
        })
        .await
        .unwrap_or(0)
    }

    /// Resize every existing pool. Returns the total worker count.
    pub async fn rescale_all(&self, cpu_percent: f64, memory_bytes: u64) -> usize {
        let mailboxes = self.mailboxes();
        join_all(mailboxes.iter().map(|mailbox| {
            ask(mailbox, |reply| PoolMessage::Scale {
                cpu_percent,
                memory_bytes,
                reply,
            })
        }))
        .await
        .into_iter()
        .map(|workers| workers.unwrap_or(0))
        .sum()
    }

    /// Retire idle workers, keeping one per pool. Returns how many were retired.
    pub async fn trim_idle(&self) -> usize {
        let mut trimmed = 0;
        for mailbox in self.mailboxes() {
            trimmed += ask(&mailbox, |reply| PoolMessage::TrimIdle { reply })
                .await
                .unwrap_or(0);
        }
        trimmed
    }

    pub async fn get_pool_statistics(&self) -> PoolStatistics {
        let mut stats = PoolStatistics::default();
        let mut weighted_secs = 0.0;

        let mailboxes = self.mailboxes();
        let replies = join_all(
            mailboxes
                .iter()
                .map(|mailbox| ask(mailbox, |reply| PoolMessage::Stats { reply })),
        )
        .await;

        for pool in replies.into_iter().flatten() {
            stats.total_workers += pool.workers;
            stats.busy_workers += pool.busy_workers;
            stats.queued += pool.queued;
            stats.completed += pool.completed;
            stats.failed += pool.failed;
            stats.timeouts += pool.timeouts;
            stats.cancelled += pool.cancelled;
            stats.superseded += pool.superseded;
            stats.worker_restarts += pool.worker_restarts;
            weighted_secs += pool.average_task_duration.as_secs_f64() * pool.completed as f64;
            stats.pools.push(pool);
        }

        if stats.completed > 0 {
            stats.average_task_duration =
                Duration::from_secs_f64(weighted_secs / stats.completed as f64);
        }
        stats.pools.sort_by_key(|pool| pool.language);
        stats
    }

    /// Tasks currently owned by some pool.
    pub fn active_tasks(&self) -> usize {
        self.inner.routes.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Fail everything still pending, terminate every worker, stop the pools.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Worker pool shutdown already in progress");
            return;
        }

        let languages: Vec<Language> = self.inner.pools.iter().map(|e| *e.key()).collect();
        for language in languages {
            let Some((_, handle)) = self.inner.pools.remove(&language) else {
                continue;
            };
            if ask(&handle.mailbox, |reply| PoolMessage::Shutdown { reply })
                .await
                .is_none()
            {
                warn!(%language, "Worker pool stopped before shutdown was acknowledged");
            }
            drop(handle.mailbox);
            if let Err(e) = handle.task.await {
                warn!(%language, error = %e, "Worker pool task failed");
            }
        }
        self.inner.routes.clear();
        self.inner.superseded.clear();
        info!("All worker pools shut down");
    }
}

impl std::fmt::Debug for AdaptiveWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveWorkerPool")
            .field("pools", &self.inner.pools.len())
            .field("active_tasks", &self.inner.routes.len())
            .finish()
    }
}

/// Send a request and wait for the actor's reply.
async fn ask<T>(
    mailbox: &Sender<PoolMessage>,
    message: impl FnOnce(Sender<T>) -> PoolMessage,
) -> Option<T> {
    let (reply, response) = flume::bounded(1);
    mailbox.send_async(message(reply)).await.ok()?;
    response.recv_async().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::events::Event;
    use crate::language::ExecutionKind;
    use crate::monitor::{AnalysisDepth, RawSample, StaticSampler};
    use crate::parser::{analyze_source, PythonParser};
    use crate::task::AnalysisRequest;
    use async_trait::async_trait;
    use flume::Receiver;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const MB: u64 = 1024 * 1024;

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        /// Accept work and never answer
        Hold,
        /// Answer immediately
        Echo,
        /// Die on the first request
        Crash,
    }

    struct MockUnit {
        id: u64,
        mode: Mode,
        sink: UnitSink,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExecutionUnit for MockUnit {
        fn id(&self) -> u64 {
            self.id
        }

        fn kind(&self) -> ExecutionKind {
            ExecutionKind::Process
        }

        async fn send(&self, request: WorkerRequest) -> Result<(), TaskError> {
            match self.mode {
                Mode::Hold => {}
                Mode::Echo => {
                    let result = analyze_source(
                        &PythonParser,
                        &request.file_path,
                        &request.content,
                        AnalysisDepth::Minimal,
                    );
                    let _ = self.sink.send(UnitEvent::Completed {
                        worker_id: self.id,
                        task_id: request.task_id,
                        result: result.map(Arc::new),
                    });
                }
                Mode::Crash => {
                    let _ = self.sink.send(UnitEvent::Exited {
                        worker_id: self.id,
                        code: Some(101),
                        message: "boom".to_string(),
                    });
                }
            }
            Ok(())
        }

        async fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockFactory {
        mode: Mutex<Mode>,
        spawned: AtomicUsize,
        kills: Arc<AtomicUsize>,
    }

    impl MockFactory {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode: Mutex::new(mode),
                spawned: AtomicUsize::new(0),
                kills: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    impl UnitFactory for MockFactory {
        fn spawn(
            &self,
            _language: Language,
            worker_id: u64,
            sink: UnitSink,
        ) -> Result<Arc<dyn ExecutionUnit>, TaskError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockUnit {
                id: worker_id,
                mode: *self.mode.lock(),
                sink,
                kills: Arc::clone(&self.kills),
            }))
        }
    }

    fn config() -> PoolConfig {
        PoolConfig {
            max_concurrent_operations: 4,
            worker_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        }
    }

    fn pool_with(
        config: PoolConfig,
        factory: Arc<MockFactory>,
    ) -> (AdaptiveWorkerPool, Receiver<Event>) {
        let events = EventBus::new();
        let rx = events.subscribe();
        (AdaptiveWorkerPool::new(config, events, factory), rx)
    }

    fn task(path: &str, score: u8) -> TaskWrapper {
        TaskWrapper::new(AnalysisRequest::new(path, "x = 1\n"), score)
    }

    async fn next_task_event(rx: &Receiver<Event>) -> Event {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, Event::TaskCompleted { .. } | Event::TaskFailed { .. }) {
                return event;
            }
        }
    }

    #[test]
    fn test_target_pool_size() {
        let config = config();
        assert_eq!(target_pool_size(&config, 10.0, 50 * MB), 4);
        assert_eq!(target_pool_size(&config, 70.0, 50 * MB), 3);
        assert_eq!(target_pool_size(&config, 90.0, 50 * MB), 2);
        assert_eq!(target_pool_size(&config, 10.0, 200 * MB), 2);
        assert_eq!(target_pool_size(&config, 90.0, 200 * MB), 1);

        let single = PoolConfig {
            max_concurrent_operations: 1,
            ..config
        };
        assert_eq!(target_pool_size(&single, 95.0, 500 * MB), 1);
    }

    #[tokio::test]
    async fn test_scale_up_toward_queued_demand() {
        let factory = MockFactory::new(Mode::Hold);
        let (pool, _rx) = pool_with(config(), factory);

        assert_eq!(pool.scale_pool(Language::Python, 90.0, 50 * MB).await, 1);
        for i in 0..6 {
            pool.submit_task(task(&format!("f{}.py", i), 50)).unwrap();
        }

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.busy_workers, 2);
        assert_eq!(stats.queued, 4);

        assert_eq!(pool.scale_pool(Language::Python, 10.0, 50 * MB).await, 4);
        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.busy_workers, 4);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.pools[0].target_size, 4);
    }

    #[tokio::test]
    async fn test_scale_down_spares_busy_workers() {
        let factory = MockFactory::new(Mode::Hold);
        let (pool, _rx) = pool_with(config(), factory);

        for i in 0..3 {
            pool.submit_task(task(&format!("f{}.py", i), 50)).unwrap();
        }
        assert_eq!(pool.scale_pool(Language::Python, 90.0, 200 * MB).await, 3);

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.busy_workers, 3);
        assert_eq!(stats.pools[0].target_size, 1);
    }

    #[tokio::test]
    async fn test_completion_updates_statistics() {
        let factory = MockFactory::new(Mode::Echo);
        let (pool, rx) = pool_with(config(), factory);

        let id = pool.submit_task(task("main.go", 80)).unwrap();
        match next_task_event(&rx).await {
            Event::TaskCompleted {
                task_id, language, ..
            } => {
                assert_eq!(task_id, id);
                assert_eq!(language, Language::Go);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(pool.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_timeout_terminates_worker_and_fails_task() {
        let factory = MockFactory::new(Mode::Hold);
        let (pool, rx) = pool_with(
            PoolConfig {
                worker_timeout: Duration::from_millis(50),
                ..config()
            },
            Arc::clone(&factory),
        );

        let id = pool.submit_task(task("slow.py", 50)).unwrap();
        match next_task_event(&rx).await {
            Event::TaskFailed { task_id, error, .. } => {
                assert_eq!(task_id, id);
                assert!(matches!(error, TaskError::Timeout(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.worker_restarts, 1);
        assert_eq!(stats.total_workers, 1);
        assert_eq!(factory.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_crash_fails_task_and_replaces_worker() {
        let factory = MockFactory::new(Mode::Crash);
        let (pool, rx) = pool_with(config(), Arc::clone(&factory));

        pool.submit_task(task("crash.py", 50)).unwrap();
        match next_task_event(&rx).await {
            Event::TaskFailed { error, .. } => {
                assert!(matches!(error, TaskError::WorkerCrash { code: Some(101), .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.worker_restarts, 1);
        assert_eq!(factory.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restart_budget_is_bounded() {
        let factory = MockFactory::new(Mode::Crash);
        let (pool, rx) = pool_with(
            PoolConfig {
                max_concurrent_operations: 1,
                max_worker_restarts: 2,
                ..config()
            },
            Arc::clone(&factory),
        );

        for i in 0..4 {
            pool.submit_task(task(&format!("c{}.py", i), 50)).unwrap();
        }
        for _ in 0..4 {
            next_task_event(&rx).await;
        }

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.worker_restarts, 2);
        assert_eq!(stats.failed, 4);
    }

    #[tokio::test]
    async fn test_cancel_running_and_queued() {
        let factory = MockFactory::new(Mode::Hold);
        let (pool, rx) = pool_with(
            PoolConfig {
                max_concurrent_operations: 1,
                ..config()
            },
            Arc::clone(&factory),
        );

        let running = pool.submit_task(task("a.py", 50)).unwrap();
        let queued = pool.submit_task(task("b.py", 50)).unwrap();

        assert!(pool.cancel_task(queued).await);
        assert!(pool.cancel_task(running).await);
        assert!(!pool.cancel_task(running).await);
        assert!(!pool.cancel_task(TaskId::from_raw(u64::MAX)).await);

        for _ in 0..2 {
            match next_task_event(&rx).await {
                Event::TaskFailed { error, .. } => assert_eq!(error, TaskError::Cancelled),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(factory.kills.load(Ordering::SeqCst), 1);
        assert_eq!(pool.get_pool_statistics().await.cancelled, 2);
    }

    #[tokio::test]
    async fn test_cancel_for_file_leaves_running_task() {
        let factory = MockFactory::new(Mode::Hold);
        let (pool, _rx) = pool_with(
            PoolConfig {
                max_concurrent_operations: 1,
                ..config()
            },
            factory,
        );

        pool.submit_task(task("same.py", 50)).unwrap();
        let waiting = pool.submit_task(task("same.py", 50)).unwrap();

        let cancelled = pool.cancel_tasks_for_file(Path::new("same.py")).await;
        assert_eq!(cancelled, vec![waiting]);

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.busy_workers, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_internal_queue_orders_by_relevance() {
        let factory = MockFactory::new(Mode::Hold);
        let (pool, rx) = pool_with(
            PoolConfig {
                max_concurrent_operations: 1,
                ..config()
            },
            Arc::clone(&factory),
        );

        let first = pool.submit_task(task("a.py", 10)).unwrap();
        let low = pool.submit_task(task("b.py", 10)).unwrap();
        let high = pool.submit_task(task("c.py", 90)).unwrap();

        // Freeing the only worker hands it the highest-scored waiting task
        assert!(pool.cancel_task(first).await);
        next_task_event(&rx).await;
        assert_eq!(factory.kills.load(Ordering::SeqCst), 1);

        // `low` is still queued, so cancelling it costs no worker
        assert!(pool.cancel_task(low).await);
        assert_eq!(factory.kills.load(Ordering::SeqCst), 1);

        assert!(pool.cancel_task(high).await);
        assert_eq!(factory.kills.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_new_pool_sizes_from_current_pressure() {
        let events = EventBus::new();
        let monitor = ResourceMonitor::with_sampler(
            MonitorConfig::default(),
            4,
            events.clone(),
            Arc::new(StaticSampler::new(RawSample {
                cpu_percent: 85.0,
                memory_used_bytes: 50 * MB,
                memory_total_bytes: 8 * 1024 * MB,
                io_bytes_per_sec: 0.0,
            })),
        );
        monitor.sample_once().await;

        let pool = AdaptiveWorkerPool::new(config(), events, MockFactory::new(Mode::Hold));
        pool.initialize(&monitor);
        for i in 0..4 {
            pool.submit_task(task(&format!("f{}.py", i), 50)).unwrap();
        }

        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.pools[0].target_size, 2);
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.queued, 2);
    }

    #[tokio::test]
    async fn test_supersede_drops_waiting_and_late_tasks() {
        let factory = MockFactory::new(Mode::Hold);
        let (pool, rx) = pool_with(
            PoolConfig {
                max_concurrent_operations: 1,
                ..config()
            },
            Arc::clone(&factory),
        );

        let running = task("same.py", 50);
        let waiting = task("same.py", 50);
        let late = task("same.py", 50);
        let newest = task("same.py", 50);
        let (waiting_id, late_id, newest_id) = (waiting.id, late.id, newest.id);

        pool.submit_task(running).unwrap();
        pool.submit_task(waiting).unwrap();
        pool.supersede(Path::new("same.py"), newest_id);

        // A task older than the newest submission that reaches the pool late
        pool.submit_task(late).unwrap();

        let mut dropped = Vec::new();
        for _ in 0..2 {
            match next_task_event(&rx).await {
                Event::TaskFailed { task_id, error, .. } => {
                    assert_eq!(error, TaskError::Cancelled);
                    dropped.push(task_id);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(dropped, vec![waiting_id, late_id]);

        pool.submit_task(newest).unwrap();
        let stats = pool.get_pool_statistics().await;
        assert_eq!(stats.superseded, 2);
        assert_eq!(stats.busy_workers, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(factory.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_rejects_new_work() {
        let factory = MockFactory::new(Mode::Hold);
        let (pool, rx) = pool_with(
            PoolConfig {
                max_concurrent_operations: 1,
                ..config()
            },
            factory,
        );

        pool.submit_task(task("a.py", 50)).unwrap();
        pool.submit_task(task("b.py", 50)).unwrap();
        pool.shutdown().await;

        for _ in 0..2 {
            match next_task_event(&rx).await {
                Event::TaskFailed { error, .. } => assert_eq!(error, TaskError::PoolShutdown),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(matches!(
            pool.submit_task(task("c.py", 50)),
            Err(TaskError::PoolShutdown)
        ));
        assert_eq!(pool.active_tasks(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_language_is_rejected() {
        let (pool, _rx) = pool_with(config(), MockFactory::new(Mode::Echo));
        assert!(matches!(
            pool.submit_task(task("notes.txt", 50)),
            Err(TaskError::UnsupportedLanguage(_))
        ));
    }
}
