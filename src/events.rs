//! Typed events and the bus that fans them out
//!
//! Components publish on an explicitly shared [`EventBus`]; subscribers
//! receive every event published after they subscribed on their own
//! unbounded flume channel. Dropped receivers are pruned on publish.

use crate::errors::TaskError;
use crate::language::{ExecutionKind, Language};
use crate::manager::LoadLevel;
use crate::monitor::{AnalysisDepth, DegradationLevel};
use crate::parser::SyntaxTree;
use crate::task::TaskId;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
pub enum Event {
    PerformanceInitialized,
    PerformanceLevelChanged {
        old: LoadLevel,
        new: LoadLevel,
    },
    PerformanceForcedCleanup {
        cache_entries_removed: usize,
        workers_trimmed: usize,
    },
    PerformanceShutdown,

    TaskCompleted {
        task_id: TaskId,
        file_path: PathBuf,
        language: Language,
        tree: Arc<SyntaxTree>,
        duration: Duration,
    },
    TaskFailed {
        task_id: TaskId,
        file_path: PathBuf,
        language: Option<Language>,
        error: TaskError,
    },

    ParserLoaded {
        language: Language,
    },
    ParserUnloaded {
        language: Language,
    },
    ParserCacheHit {
        language: Language,
    },
    ParserReducedComplexity {
        language: Language,
        depth: AnalysisDepth,
    },
    AstLoaded {
        file_path: PathBuf,
        depth: AnalysisDepth,
    },
    AstCacheHit {
        file_path: PathBuf,
    },
    CleanupCompleted {
        removed: usize,
    },
    MemoryPressureResponse {
        level: DegradationLevel,
        parsers_evicted: usize,
        asts_evicted: usize,
    },

    PoolInitialized {
        language: Language,
        execution_kind: ExecutionKind,
        workers: usize,
    },
    PoolShutdown {
        language: Language,
    },
    WorkerError {
        language: Language,
        worker_id: u64,
        message: String,
    },

    DegradationChanged {
        old_level: DegradationLevel,
        new_level: DegradationLevel,
        reason: String,
    },
}

impl Event {
    /// Stable event name consumed by the CLI/UI layer.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PerformanceInitialized => "performance:initialized",
            Self::PerformanceLevelChanged { .. } => "performance:level-changed",
            Self::PerformanceForcedCleanup { .. } => "performance:forced-cleanup",
            Self::PerformanceShutdown => "performance:shutdown",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::ParserLoaded { .. } => "parser:loaded",
            Self::ParserUnloaded { .. } => "parser:unloaded",
            Self::ParserCacheHit { .. } => "parser:cache-hit",
            Self::ParserReducedComplexity { .. } => "parser:reduced-complexity",
            Self::AstLoaded { .. } => "ast:loaded",
            Self::AstCacheHit { .. } => "ast:cache-hit",
            Self::CleanupCompleted { .. } => "cleanup:completed",
            Self::MemoryPressureResponse { .. } => "memory-pressure:response",
            Self::PoolInitialized { .. } => "pool:initialized",
            Self::PoolShutdown { .. } => "pool:shutdown",
            Self::WorkerError { .. } => "worker:error",
            Self::DegradationChanged { .. } => "degradation:changed",
        }
    }
}

/// Cloneable publish/subscribe handle.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: Event) {
        trace!(event = event.name(), "Publishing event");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
