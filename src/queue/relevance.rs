//! Relevance scoring for queued analysis work
//!
//! The weights (40/30/20/10) and tier cutoffs (90/70/40) are shared with the
//! relevance-signal collaborator and must change together with it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

pub const OPEN_WEIGHT: u8 = 40;
pub const RECENTLY_MODIFIED_WEIGHT: u8 = 30;
pub const WORKTREE_WEIGHT: u8 = 20;
pub const RELATED_TASK_WEIGHT: u8 = 10;

pub const CRITICAL_CUTOFF: u8 = 90;
pub const HIGH_CUTOFF: u8 = 70;
pub const MEDIUM_CUTOFF: u8 = 40;

/// A file counts as recently modified inside this window.
pub const RECENT_MODIFICATION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Relevance signal supplied with every enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevanceContext {
    pub is_currently_open: bool,
    pub last_modified: Option<SystemTime>,
    pub is_in_current_worktree: bool,
    pub is_related_to_current_task: bool,
}

impl RelevanceContext {
    pub fn last_modified_recently(&self, now: SystemTime) -> bool {
        match self.last_modified {
            // A timestamp in the future still counts as fresh
            Some(modified) => now
                .duration_since(modified)
                .map(|age| age <= RECENT_MODIFICATION_WINDOW)
                .unwrap_or(true),
            None => false,
        }
    }

    /// Additive 0-100 relevance score.
    pub fn score(&self, now: SystemTime) -> u8 {
        let mut score: u16 = 0;
        if self.is_currently_open {
            score += OPEN_WEIGHT as u16;
        }
        if self.last_modified_recently(now) {
            score += RECENTLY_MODIFIED_WEIGHT as u16;
        }
        if self.is_in_current_worktree {
            score += WORKTREE_WEIGHT as u16;
        }
        if self.is_related_to_current_task {
            score += RELATED_TASK_WEIGHT as u16;
        }
        score.min(100) as u8
    }
}

/// Queue tier derived from the relevance score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityTier {
    pub const fn from_score(score: u8) -> Self {
        if score >= CRITICAL_CUTOFF {
            Self::Critical
        } else if score >= HIGH_CUTOFF {
            Self::High
        } else if score >= MEDIUM_CUTOFF {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
