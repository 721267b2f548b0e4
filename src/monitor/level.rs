//! Degradation levels and the analysis depth they imply

use serde::{Deserialize, Serialize};
use std::fmt;

/// How aggressively analysis is curtailed, 0 (normal) to 3 (critical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DegradationLevel {
    Normal = 0,
    Elevated = 1,
    Severe = 2,
    Critical = 3,
}

impl DegradationLevel {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Elevated),
            2 => Some(Self::Severe),
            3 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Fraction of the baseline concurrency allowed at this level.
    pub const fn concurrency_multiplier(self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Elevated => 0.75,
            Self::Severe => 0.5,
            Self::Critical => 0.0,
        }
    }

    pub fn recommended_concurrency(self, baseline: usize) -> usize {
        (baseline as f64 * self.concurrency_multiplier()).floor() as usize
    }

    pub const fn analysis_depth(self) -> AnalysisDepth {
        match self {
            Self::Normal => AnalysisDepth::Full,
            Self::Elevated => AnalysisDepth::Reduced,
            Self::Severe => AnalysisDepth::Minimal,
            Self::Critical => AnalysisDepth::Disabled,
        }
    }
}

impl From<DegradationLevel> for u8 {
    fn from(level: DegradationLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for DegradationLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or_else(|| format!("degradation level {} is not in 0..=3", value))
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// How much parsing work is performed per file.
///
/// Ordered from most to least work, so `max` picks the more restrictive depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisDepth {
    /// Declarations, dependencies and pattern analysis
    Full,
    /// Declarations only; pattern and dependency analysis skipped
    Reduced,
    /// Top-level skeleton only
    Minimal,
    /// No parsing; callers receive a reason instead of a tree
    Disabled,
}

impl AnalysisDepth {
    pub fn most_restrictive(self, other: Self) -> Self {
        self.max(other)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Reduced => "reduced",
            Self::Minimal => "minimal",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for AnalysisDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
