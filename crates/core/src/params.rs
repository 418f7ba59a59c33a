//! The closed set of tunable knobs.
//!
//! Each id carries an immutable default and a closed valid range. Two
//! groups of weights must renormalize to sum 1 after any update: the five
//! model-selection scoring weights and the four quality-composite weights.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// Every knob the tuner manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HyperparameterId {
    /// Baseline seconds between governance cycles.
    GovernanceCycleSecs,
    /// EMA smoothing for quality tracking.
    QualityEmaAlpha,
    /// EMA smoothing for latency tracking.
    LatencyEmaAlpha,
    // Quality-composite weights. Normalized as a group.
    QualitySuccessWeight,
    QualityLatencyWeight,
    QualityFeedbackWeight,
    QualityErrorWeight,
    // Model-selection scoring weights. Normalized as a group.
    SelectionQualityWeight,
    SelectionLatencyWeight,
    SelectionCostWeight,
    SelectionLoadWeight,
    SelectionFreshnessWeight,
    /// Probability of exploratory parameter trials.
    ExplorationRate,
    /// UCB exploration constant for the model bandit.
    BanditExplorationBonus,
    /// Available-memory threshold (GB) below which memory is considered hot.
    MemoryHotThresholdGb,
    /// Available-memory threshold (GB) below which memory is critical.
    MemoryCriticalThresholdGb,
    /// Score variance below which the system counts as converged.
    ConvergenceThreshold,
    /// Negative-trend magnitude that flags divergence and arms rollback.
    RollbackSensitivity,
}

pub const ALL_PARAMS: [HyperparameterId; 18] = [
    HyperparameterId::GovernanceCycleSecs,
    HyperparameterId::QualityEmaAlpha,
    HyperparameterId::LatencyEmaAlpha,
    HyperparameterId::QualitySuccessWeight,
    HyperparameterId::QualityLatencyWeight,
    HyperparameterId::QualityFeedbackWeight,
    HyperparameterId::QualityErrorWeight,
    HyperparameterId::SelectionQualityWeight,
    HyperparameterId::SelectionLatencyWeight,
    HyperparameterId::SelectionCostWeight,
    HyperparameterId::SelectionLoadWeight,
    HyperparameterId::SelectionFreshnessWeight,
    HyperparameterId::ExplorationRate,
    HyperparameterId::BanditExplorationBonus,
    HyperparameterId::MemoryHotThresholdGb,
    HyperparameterId::MemoryCriticalThresholdGb,
    HyperparameterId::ConvergenceThreshold,
    HyperparameterId::RollbackSensitivity,
];

const SELECTION_WEIGHTS: [HyperparameterId; 5] = [
    HyperparameterId::SelectionQualityWeight,
    HyperparameterId::SelectionLatencyWeight,
    HyperparameterId::SelectionCostWeight,
    HyperparameterId::SelectionLoadWeight,
    HyperparameterId::SelectionFreshnessWeight,
];

const QUALITY_WEIGHTS: [HyperparameterId; 4] = [
    HyperparameterId::QualitySuccessWeight,
    HyperparameterId::QualityLatencyWeight,
    HyperparameterId::QualityFeedbackWeight,
    HyperparameterId::QualityErrorWeight,
];

const_assert_eq!(SELECTION_WEIGHTS.len(), 5);
const_assert_eq!(QUALITY_WEIGHTS.len(), 4);

/// A set of ids whose current values must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormalizationGroup {
    SelectionWeights,
    QualityWeights,
}

impl NormalizationGroup {
    pub fn members(self) -> &'static [HyperparameterId] {
        match self {
            NormalizationGroup::SelectionWeights => &SELECTION_WEIGHTS,
            NormalizationGroup::QualityWeights => &QUALITY_WEIGHTS,
        }
    }
}

impl HyperparameterId {
    pub fn default_value(self) -> f64 {
        use HyperparameterId::*;
        match self {
            GovernanceCycleSecs => 300.0,
            QualityEmaAlpha => 0.2,
            LatencyEmaAlpha => 0.3,
            QualitySuccessWeight => 0.4,
            QualityLatencyWeight => 0.2,
            QualityFeedbackWeight => 0.3,
            QualityErrorWeight => 0.1,
            SelectionQualityWeight => 0.35,
            SelectionLatencyWeight => 0.25,
            SelectionCostWeight => 0.15,
            SelectionLoadWeight => 0.10,
            SelectionFreshnessWeight => 0.15,
            ExplorationRate => 0.1,
            BanditExplorationBonus => 1.4,
            MemoryHotThresholdGb => 4.0,
            MemoryCriticalThresholdGb => 1.0,
            ConvergenceThreshold => 0.01,
            RollbackSensitivity => 0.01,
        }
    }

    /// Closed valid range `[lo, hi]`.
    pub fn range(self) -> (f64, f64) {
        use HyperparameterId::*;
        match self {
            GovernanceCycleSecs => (60.0, 900.0),
            QualityEmaAlpha | LatencyEmaAlpha => (0.01, 0.9),
            QualitySuccessWeight | QualityLatencyWeight | QualityFeedbackWeight
            | QualityErrorWeight => (0.0, 1.0),
            SelectionQualityWeight | SelectionLatencyWeight | SelectionCostWeight
            | SelectionLoadWeight | SelectionFreshnessWeight => (0.0, 1.0),
            ExplorationRate => (0.01, 0.5),
            BanditExplorationBonus => (0.1, 3.0),
            MemoryHotThresholdGb => (1.0, 16.0),
            MemoryCriticalThresholdGb => (0.25, 4.0),
            ConvergenceThreshold => (0.001, 0.05),
            RollbackSensitivity => (0.005, 0.1),
        }
    }

    pub fn group(self) -> Option<NormalizationGroup> {
        use HyperparameterId::*;
        match self {
            SelectionQualityWeight | SelectionLatencyWeight | SelectionCostWeight
            | SelectionLoadWeight | SelectionFreshnessWeight => {
                Some(NormalizationGroup::SelectionWeights)
            }
            QualitySuccessWeight | QualityLatencyWeight | QualityFeedbackWeight
            | QualityErrorWeight => Some(NormalizationGroup::QualityWeights),
            _ => None,
        }
    }

    pub fn clamp(self, value: f64) -> f64 {
        let (lo, hi) = self.range();
        value.clamp(lo, hi)
    }
}
