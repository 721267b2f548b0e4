//! Execution units: the two ways a pool runs analysis work
//!
//! Threads share the parent's caches and cost little to start. Processes
//! give each worker its own crash domain. Both report back through a
//! [`UnitSink`], keyed by worker id, so a pool can tell live results from
//! the late output of a unit it already terminated.

use super::protocol::{decode_line, encode_line, WorkerRequest, WorkerResponse};
use crate::errors::TaskError;
use crate::language::{ExecutionKind, Language};
use crate::lazy::LazyLoadingManager;
use crate::parser::SyntaxTree;
use crate::task::TaskId;
use async_trait::async_trait;
use flume::Sender;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a unit reports back to its pool.
#[derive(Debug)]
pub enum UnitEvent {
    Completed {
        worker_id: u64,
        task_id: TaskId,
        result: Result<Arc<SyntaxTree>, TaskError>,
    },
    /// The unit died on its own: panic, crash or unexpected exit
    Exited {
        worker_id: u64,
        code: Option<i32>,
        message: String,
    },
}

pub type UnitSink = Sender<UnitEvent>;

#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    fn id(&self) -> u64;

    fn kind(&self) -> ExecutionKind;

    /// Hand one request to the unit. Results arrive on the sink.
    async fn send(&self, request: WorkerRequest) -> Result<(), TaskError>;

    /// Force-terminate. No `Exited` event follows.
    async fn kill(&self);
}

/// Creates units for a pool.
pub trait UnitFactory: Send + Sync {
    fn spawn(
        &self,
        language: Language,
        worker_id: u64,
        sink: UnitSink,
    ) -> Result<Arc<dyn ExecutionUnit>, TaskError>;
}

/// Dedicated OS thread sharing the parent's parser and AST caches.
///
/// Threads cannot be interrupted; `kill` detaches the thread, which exits
/// after its current request. Its late result is still sent but the pool
/// no longer recognizes the worker id.
pub struct InProcessUnit {
    id: u64,
    requests: Mutex<Option<Sender<WorkerRequest>>>,
}

impl InProcessUnit {
    pub fn spawn(
        language: Language,
        worker_id: u64,
        lazy: LazyLoadingManager,
        sink: UnitSink,
    ) -> Result<Self, TaskError> {
        let (tx, rx) = flume::unbounded::<WorkerRequest>();

        std::thread::Builder::new()
            .name(format!("{}-worker-{}", language, worker_id))
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    let task_id = request.task_id;
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        lazy.load_ast(&request.file_path, &request.content, &request.options)
                    }));

                    let event = match outcome {
                        Ok(result) => UnitEvent::Completed {
                            worker_id,
                            task_id,
                            result,
                        },
                        Err(panic) => {
                            let _ = sink.send(UnitEvent::Exited {
                                worker_id,
                                code: None,
                                message: panic_message(panic.as_ref()),
                            });
                            return;
                        }
                    };
                    if sink.send(event).is_err() {
                        return;
                    }
                }
            })
            .map_err(|e| TaskError::Dispatch(format!("failed to start worker thread: {}", e)))?;

        Ok(Self {
            id: worker_id,
            requests: Mutex::new(Some(tx)),
        })
    }
}

#[async_trait]
impl ExecutionUnit for InProcessUnit {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ExecutionKind {
        ExecutionKind::Thread
    }

    async fn send(&self, request: WorkerRequest) -> Result<(), TaskError> {
        let requests = self.requests.lock();
        let tx = requests
            .as_ref()
            .ok_or_else(|| TaskError::Dispatch(format!("worker {} was terminated", self.id)))?;
        tx.send(request)
            .map_err(|_| TaskError::Dispatch(format!("worker {} thread has exited", self.id)))
    }

    async fn kill(&self) {
        self.requests.lock().take();
    }
}

/// Child process speaking newline-delimited JSON over stdin/stdout.
pub struct IsolatedProcessUnit {
    id: u64,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl IsolatedProcessUnit {
    /// Launch `executable worker <language>`.
    pub fn spawn(
        executable: &std::path::Path,
        language: Language,
        worker_id: u64,
        sink: UnitSink,
    ) -> Result<Self, TaskError> {
        let mut child = Command::new(executable)
            .arg("worker")
            .arg(language.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TaskError::Dispatch(format!("failed to spawn {}: {}", executable.display(), e))
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::Dispatch("worker stdout unavailable".to_string()))?;

        let results = sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let event = match decode_line::<WorkerResponse>(&line) {
                    Ok(WorkerResponse::Completed { task_id, tree }) => UnitEvent::Completed {
                        worker_id,
                        task_id,
                        result: Ok(Arc::new(tree)),
                    },
                    Ok(WorkerResponse::Failed { task_id, error }) => UnitEvent::Completed {
                        worker_id,
                        task_id,
                        result: Err(error),
                    },
                    Err(e) => {
                        warn!(worker_id, error = %e, "Discarding malformed worker output");
                        continue;
                    }
                };
                if results.send(event).is_err() {
                    break;
                }
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };

            match exited {
                Some(status) => {
                    let code = status.as_ref().ok().and_then(|s| s.code());
                    let message = match status {
                        Ok(status) => format!("worker process exited with {}", status),
                        Err(e) => format!("failed to wait on worker process: {}", e),
                    };
                    let _ = sink.send(UnitEvent::Exited {
                        worker_id,
                        code,
                        message,
                    });
                }
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!(worker_id, error = %e, "Worker process already gone");
                    }
                    let _ = child.wait().await;
                }
            }
        });

        Ok(Self {
            id: worker_id,
            stdin: tokio::sync::Mutex::new(stdin),
            kill: Mutex::new(Some(kill_tx)),
        })
    }
}

#[async_trait]
impl ExecutionUnit for IsolatedProcessUnit {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ExecutionKind {
        ExecutionKind::Process
    }

    async fn send(&self, request: WorkerRequest) -> Result<(), TaskError> {
        let line = encode_line(&request).map_err(|e| TaskError::Dispatch(e.to_string()))?;
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| TaskError::Dispatch(format!("worker {} was terminated", self.id)))?;

        let written = match pipe.write_all(line.as_bytes()).await {
            Ok(()) => pipe.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| TaskError::Dispatch(format!("worker {} pipe: {}", self.id, e)))
    }

    async fn kill(&self) {
        self.stdin.lock().await.take();
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
    }
}

/// Picks the unit variant from [`Language::execution_kind`].
pub struct DefaultUnitFactory {
    executable: Option<PathBuf>,
    lazy: LazyLoadingManager,
}

impl DefaultUnitFactory {
    /// `executable` must serve `worker <language>`; `None` means the current binary.
    pub fn new(executable: Option<PathBuf>, lazy: LazyLoadingManager) -> Self {
        Self { executable, lazy }
    }

    fn executable(&self) -> Result<PathBuf, TaskError> {
        match &self.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe()
                .map_err(|e| TaskError::Dispatch(format!("cannot locate worker executable: {}", e))),
        }
    }
}

impl UnitFactory for DefaultUnitFactory {
    fn spawn(
        &self,
        language: Language,
        worker_id: u64,
        sink: UnitSink,
    ) -> Result<Arc<dyn ExecutionUnit>, TaskError> {
        match language.execution_kind() {
            ExecutionKind::Thread => Ok(Arc::new(InProcessUnit::spawn(
                language,
                worker_id,
                self.lazy.clone(),
                sink,
            )?)),
            ExecutionKind::Process => Ok(Arc::new(IsolatedProcessUnit::spawn(
                &self.executable()?,
                language,
                worker_id,
                sink,
            )?)),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::events::EventBus;
    use crate::task::TaskOptions;
    use std::time::Duration;

    fn request(id: u64, path: &str, content: &str) -> WorkerRequest {
        WorkerRequest {
            task_id: TaskId::from_raw(id),
            file_path: PathBuf::from(path),
            content: content.to_string(),
            options: TaskOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_in_process_unit_round_trip() {
        let (sink, events) = flume::unbounded();
        let lazy = LazyLoadingManager::new(CacheConfig::default(), EventBus::new());
        let unit = InProcessUnit::spawn(Language::TypeScript, 1, lazy, sink).unwrap();

        unit.send(request(10, "app.ts", "export function run() {}\n"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv_async())
            .await
            .unwrap()
            .unwrap();
        match event {
            UnitEvent::Completed {
                worker_id,
                task_id,
                result,
            } => {
                assert_eq!(worker_id, 1);
                assert_eq!(task_id, TaskId::from_raw(10));
                assert_eq!(result.unwrap().node_count, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_killed_in_process_unit_rejects_work() {
        let (sink, _events) = flume::unbounded();
        let lazy = LazyLoadingManager::new(CacheConfig::default(), EventBus::new());
        let unit = InProcessUnit::spawn(Language::JavaScript, 2, lazy, sink).unwrap();

        unit.kill().await;
        let err = unit.send(request(11, "a.js", "")).await.unwrap_err();
        assert!(matches!(err, TaskError::Dispatch(_)));
    }

    #[tokio::test]
    async fn test_missing_executable_is_dispatch_error() {
        let (sink, _events) = flume::unbounded();
        let result = IsolatedProcessUnit::spawn(
            std::path::Path::new("/nonexistent/analysis-worker"),
            Language::Go,
            3,
            sink,
        );
        assert!(matches!(result, Err(TaskError::Dispatch(_))));
    }

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(panic.as_ref()), "worker panicked: boom");
    }
}
