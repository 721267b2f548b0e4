//! Analysis tasks as they move from the queue to a worker

use crate::language::Language;
use crate::monitor::AnalysisDepth;
use crate::queue::PriorityTier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier, stable across the queue and the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Per-task analysis options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Overrides extension-based language detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,

    /// Upper bound on analysis depth; the scheduler may reduce it further
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<AnalysisDepth>,
}

/// What a caller asks the scheduler to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub file_path: PathBuf,
    pub content: String,
    pub options: TaskOptions,
}

impl AnalysisRequest {
    pub fn new(file_path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            content: content.into(),
            options: TaskOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn language(&self) -> Option<Language> {
        self.options
            .language
            .or_else(|| Language::from_path(&self.file_path))
    }
}

/// A request plus its scheduling state.
///
/// Owned by exactly one of the priority queue or a language pool at a time.
#[derive(Debug)]
pub struct TaskWrapper {
    pub id: TaskId,
    pub request: AnalysisRequest,
    pub tier: PriorityTier,
    pub relevance_score: u8,
    pub enqueued_at: Instant,
    pub started_at: Option<Instant>,
    pub assigned_worker: Option<u64>,
    pub timeout_handle: Option<JoinHandle<()>>,
}

impl TaskWrapper {
    pub fn new(request: AnalysisRequest, relevance_score: u8) -> Self {
        Self {
            id: TaskId::next(),
            request,
            tier: PriorityTier::from_score(relevance_score),
            relevance_score,
            enqueued_at: Instant::now(),
            started_at: None,
            assigned_worker: None,
            timeout_handle: None,
        }
    }

    pub fn file_path(&self) -> &std::path::Path {
        &self.request.file_path
    }

    /// Stop the pending timeout timer, if any.
    pub fn clear_timeout(&mut self) {
        if let Some(handle) = self.timeout_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_language_detection_and_override() {
        let request = AnalysisRequest::new("src/app.ts", "let x = 1;");
        assert_eq!(request.language(), Some(Language::TypeScript));

        let request = AnalysisRequest::new("BUILD", "").with_options(TaskOptions {
            language: Some(Language::Python),
            depth: None,
        });
        assert_eq!(request.language(), Some(Language::Python));
    }

    #[test]
    fn test_wrapper_tier_follows_score() {
        let task = TaskWrapper::new(AnalysisRequest::new("a.py", ""), 95);
        assert_eq!(task.tier, PriorityTier::Critical);
        assert_eq!(task.relevance_score, 95);
        assert!(task.started_at.is_none());
    }
}
