//! Relevance-driven multi-tier priority queue
//!
//! Critical work is always served first. Every `1 / fairness_ratio`
//! dequeues the oldest medium/low task jumps ahead of waiting high-tier work
//! so background analysis cannot starve. With no high-tier work waiting the
//! turn is plain tier order. Only the newest submission per file is
//! kept; older queued entries for the same path are dropped on enqueue.

pub mod relevance;

pub use relevance::{PriorityTier, RelevanceContext};

use crate::config::QueueConfig;
use crate::task::{AnalysisRequest, TaskId, TaskWrapper};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Queue depth per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatistics {
    pub total_queued: usize,
    pub by_tier: TierCounts,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub preemptive_cancellations: u64,
    pub fairness_dequeues: u64,
    pub cancelled: u64,
    pub average_wait: Duration,
}

pub struct SmartPriorityQueue {
    critical: VecDeque<TaskWrapper>,
    high: VecDeque<TaskWrapper>,
    medium: VecDeque<TaskWrapper>,
    low: VecDeque<TaskWrapper>,

    /// Newest queued task per file
    by_file: HashMap<PathBuf, TaskId>,

    /// A fairness dequeue happens when `dequeue_count % fairness_interval == 0`
    fairness_interval: u64,
    dequeue_count: u64,

    total_enqueued: u64,
    preemptive_cancellations: u64,
    fairness_dequeues: u64,
    cancelled: u64,
    total_wait: Duration,
}

impl SmartPriorityQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let interval = (1.0 / config.fairness_ratio).round().max(1.0) as u64;

        Self {
            critical: VecDeque::new(),
            high: VecDeque::new(),
            medium: VecDeque::new(),
            low: VecDeque::new(),
            by_file: HashMap::new(),
            fairness_interval: interval,
            dequeue_count: 0,
            total_enqueued: 0,
            preemptive_cancellations: 0,
            fairness_dequeues: 0,
            cancelled: 0,
            total_wait: Duration::ZERO,
        }
    }

    /// Score the request from its relevance context and queue it.
    pub fn enqueue(&mut self, request: AnalysisRequest, context: &RelevanceContext) -> TaskId {
        let score = context.score(SystemTime::now());
        self.enqueue_scored(request, score)
    }

    /// Queue a request with a precomputed relevance score.
    pub fn enqueue_scored(&mut self, request: AnalysisRequest, score: u8) -> TaskId {
        self.cancel_obsolete_tasks(&request.file_path);

        let task = TaskWrapper::new(request, score.min(100));
        let id = task.id;
        let tier = task.tier;

        trace!(task = %id, tier = %tier, score, path = %task.file_path().display(), "Enqueued task");
        self.by_file.insert(task.request.file_path.clone(), id);
        self.tier_mut(tier).push_back(task);
        self.total_enqueued += 1;
        id
    }

    /// Next task to dispatch, or `None` when every tier is empty.
    pub fn dequeue(&mut self) -> Option<TaskWrapper> {
        if self.is_empty() {
            return None;
        }

        self.dequeue_count += 1;
        let fairness_turn = self.dequeue_count % self.fairness_interval == 0;

        let task = if let Some(task) = self.critical.pop_front() {
            Some(task)
        } else if fairness_turn
            && !self.high.is_empty()
            && !(self.medium.is_empty() && self.low.is_empty())
        {
            self.fairness_dequeues += 1;
            self.pop_oldest_background()
        } else {
            self.high
                .pop_front()
                .or_else(|| self.medium.pop_front())
                .or_else(|| self.low.pop_front())
        }?;

        if self.by_file.get(task.file_path()) == Some(&task.id) {
            self.by_file.remove(task.file_path());
        }
        self.total_wait += task.enqueued_at.elapsed();
        Some(task)
    }

    /// Drop every queued task for `path`, counting each as a preemptive
    /// cancellation. Dispatched tasks are unaffected.
    pub fn cancel_obsolete_tasks(&mut self, path: &Path) -> Vec<TaskId> {
        let Some(id) = self.by_file.remove(path) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        if self.take(id).is_some() {
            removed.push(id);
        }

        self.preemptive_cancellations += removed.len() as u64;
        if !removed.is_empty() {
            debug!(path = %path.display(), superseded = ?removed, "Superseded queued analysis");
        }
        removed
    }

    /// Remove a queued task by id.
    pub fn remove(&mut self, id: TaskId) -> Option<TaskWrapper> {
        let task = self.take(id)?;
        if self.by_file.get(task.file_path()) == Some(&id) {
            self.by_file.remove(task.file_path());
        }
        self.cancelled += 1;
        Some(task)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tiers().any(|tier| tier.iter().any(|task| task.id == id))
    }

    pub fn len(&self) -> usize {
        self.tiers().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers().all(VecDeque::is_empty)
    }

    /// Drop everything queued. Returns how many tasks were discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        self.critical.clear();
        self.high.clear();
        self.medium.clear();
        self.low.clear();
        self.by_file.clear();
        count
    }

    pub fn get_queue_statistics(&self) -> QueueStatistics {
        let total_dequeued = self.dequeue_count;
        let average_wait = if total_dequeued == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.total_wait.as_secs_f64() / total_dequeued as f64)
        };

        QueueStatistics {
            total_queued: self.len(),
            by_tier: TierCounts {
                critical: self.critical.len(),
                high: self.high.len(),
                medium: self.medium.len(),
                low: self.low.len(),
            },
            total_enqueued: self.total_enqueued,
            total_dequeued,
            preemptive_cancellations: self.preemptive_cancellations,
            fairness_dequeues: self.fairness_dequeues,
            cancelled: self.cancelled,
            average_wait,
        }
    }

    fn tiers(&self) -> impl Iterator<Item = &VecDeque<TaskWrapper>> {
        [&self.critical, &self.high, &self.medium, &self.low].into_iter()
    }

    fn tier_mut(&mut self, tier: PriorityTier) -> &mut VecDeque<TaskWrapper> {
        match tier {
            PriorityTier::Critical => &mut self.critical,
            PriorityTier::High => &mut self.high,
            PriorityTier::Medium => &mut self.medium,
            PriorityTier::Low => &mut self.low,
        }
    }

    fn take(&mut self, id: TaskId) -> Option<TaskWrapper> {
        for tier in [
            PriorityTier::Critical,
            PriorityTier::High,
            PriorityTier::Medium,
            PriorityTier::Low,
        ] {
            let queue = self.tier_mut(tier);
            if let Some(pos) = queue.iter().position(|task| task.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Oldest head of the medium and low tiers.
    fn pop_oldest_background(&mut self) -> Option<TaskWrapper> {
        let medium_at = self.medium.front().map(|task| task.enqueued_at);
        let low_at = self.low.front().map(|task| task.enqueued_at);

        match (medium_at, low_at) {
            (Some(medium), Some(low)) if low < medium => self.low.pop_front(),
            (Some(_), _) => self.medium.pop_front(),
            (None, Some(_)) => self.low.pop_front(),
            (None, None) => None,
        }
    }
}

impl Default for SmartPriorityQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(path: &str) -> AnalysisRequest {
        AnalysisRequest::new(path, "x = 1")
    }

    #[test]
    fn test_critical_served_first() {
        let mut queue = SmartPriorityQueue::default();
        let h1 = queue.enqueue_scored(request("h1.py"), 75);
        let _h2 = queue.enqueue_scored(request("h2.py"), 80);
        let c1 = queue.enqueue_scored(request("c1.py"), 95);

        assert_eq!(queue.dequeue().unwrap().id, c1);
        assert_eq!(queue.dequeue().unwrap().id, h1);
    }

    #[test]
    fn test_tier_order_without_fairness_trigger() {
        let mut queue = SmartPriorityQueue::default();
        for (i, score) in [95u8, 80, 50, 20, 10].into_iter().enumerate() {
            queue.enqueue_scored(request(&format!("f{}.ts", i)), score);
        }

        let tiers: Vec<_> = std::iter::from_fn(|| queue.dequeue())
            .map(|task| task.tier)
            .collect();
        assert_eq!(
            tiers,
            vec![
                PriorityTier::Critical,
                PriorityTier::High,
                PriorityTier::Medium,
                PriorityTier::Low,
                PriorityTier::Low,
            ]
        );
    }

    #[test]
    fn test_fifo_within_tier() {
        let mut queue = SmartPriorityQueue::default();
        let first = queue.enqueue_scored(request("a.go"), 50);
        let second = queue.enqueue_scored(request("b.go"), 60);
        let third = queue.enqueue_scored(request("c.go"), 45);

        assert_eq!(queue.dequeue().unwrap().id, first);
        assert_eq!(queue.dequeue().unwrap().id, second);
        assert_eq!(queue.dequeue().unwrap().id, third);
    }

    #[test]
    fn test_fairness_serves_low_tier() {
        let mut queue = SmartPriorityQueue::default();
        for i in 0..20 {
            queue.enqueue_scored(request(&format!("high{}.ts", i)), 75);
        }
        queue.enqueue_scored(request("background.ts"), 10);

        let served: Vec<_> = (0..10).filter_map(|_| queue.dequeue()).collect();
        assert!(served.iter().any(|task| task.tier == PriorityTier::Low));
        assert_eq!(served[9].tier, PriorityTier::Low);
        assert_eq!(queue.get_queue_statistics().fairness_dequeues, 1);
    }

    #[test]
    fn test_fairness_turn_without_high_work_keeps_tier_order() {
        let mut queue = SmartPriorityQueue::default();
        let low = queue.enqueue_scored(request("old-low.ts"), 10);
        for i in 0..10 {
            queue.enqueue_scored(request(&format!("medium{}.ts", i)), 50);
        }

        let served: Vec<_> = (0..10).filter_map(|_| queue.dequeue()).collect();
        assert!(served.iter().all(|task| task.tier == PriorityTier::Medium));
        assert_eq!(queue.get_queue_statistics().fairness_dequeues, 0);
        assert_eq!(queue.dequeue().unwrap().id, low);
    }

    #[test]
    fn test_average_wait() {
        let mut queue = SmartPriorityQueue::default();
        assert_eq!(queue.get_queue_statistics().average_wait, Duration::ZERO);

        queue.enqueue_scored(request("a.py"), 50);
        queue.enqueue_scored(request("b.py"), 50);
        std::thread::sleep(Duration::from_millis(5));
        queue.dequeue();
        queue.dequeue();

        let stats = queue.get_queue_statistics();
        assert_eq!(stats.total_dequeued, 2);
        assert!(stats.average_wait >= Duration::from_millis(5));
    }

    #[test]
    fn test_coalescing_keeps_newest() {
        let mut queue = SmartPriorityQueue::default();
        let a = queue.enqueue_scored(request("src/x.ts"), 50);
        let b = queue.enqueue_scored(request("src/x.ts"), 20);

        assert_eq!(queue.len(), 1);
        assert!(!queue.contains(a));
        assert!(queue.contains(b));

        let stats = queue.get_queue_statistics();
        assert_eq!(stats.preemptive_cancellations, 1);
        assert_eq!(queue.dequeue().unwrap().id, b);
    }

    #[test]
    fn test_dequeued_task_is_not_coalesced() {
        let mut queue = SmartPriorityQueue::default();
        let a = queue.enqueue_scored(request("src/x.ts"), 50);
        assert_eq!(queue.dequeue().unwrap().id, a);

        queue.enqueue_scored(request("src/x.ts"), 50);
        assert_eq!(queue.get_queue_statistics().preemptive_cancellations, 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut queue = SmartPriorityQueue::default();
        let a = queue.enqueue_scored(request("a.py"), 10);
        queue.enqueue_scored(request("b.py"), 90);

        assert!(queue.remove(a).is_some());
        assert!(queue.remove(a).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_queue_statistics().cancelled, 1);

        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_enqueue_scores_context() {
        let mut queue = SmartPriorityQueue::default();
        let ctx = RelevanceContext {
            is_currently_open: true,
            last_modified: Some(SystemTime::now()),
            is_in_current_worktree: true,
            ..Default::default()
        };
        queue.enqueue(request("open.rs"), &ctx);
        let task = queue.dequeue().unwrap();
        assert_eq!(task.relevance_score, 90);
        assert_eq!(task.tier, PriorityTier::Critical);
    }

    proptest! {
        #[test]
        fn prop_one_queued_task_per_file(paths in prop::collection::vec(0usize..5, 1..40)) {
            let mut queue = SmartPriorityQueue::default();
            for (i, p) in paths.iter().enumerate() {
                queue.enqueue_scored(request(&format!("file{}.ts", p)), (i * 7 % 100) as u8);
            }

            let distinct: std::collections::HashSet<_> = paths.iter().collect();
            let stats = queue.get_queue_statistics();
            prop_assert_eq!(queue.len(), distinct.len());
            prop_assert_eq!(stats.preemptive_cancellations as usize, paths.len() - distinct.len());
        }

        #[test]
        fn prop_fairness_window(high in 10usize..40, low in 1usize..5, skip in 0usize..9) {
            let mut queue = SmartPriorityQueue::default();
            for i in 0..high {
                queue.enqueue_scored(request(&format!("h{}.ts", i)), 75);
            }
            for i in 0..low {
                queue.enqueue_scored(request(&format!("l{}.ts", i)), 5);
            }
            for _ in 0..skip {
                queue.dequeue();
            }

            let window: Vec<_> = (0..10).filter_map(|_| queue.dequeue()).collect();
            prop_assert!(window.iter().any(|task| task.tier == PriorityTier::Low));
        }
    }
}
