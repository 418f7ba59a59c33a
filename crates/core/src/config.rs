//! Aggregate configuration for the governance core.

use serde::{Deserialize, Serialize};

use crate::bandit::BanditConfig;
use crate::convergence::DetectorConfig;
use crate::feedback::FeedbackConfig;
use crate::meta::MetaConfig;
use crate::scheduler::SchedulerConfig;
use crate::tuner::TunerConfig;

/// One struct to override any numeric default. Every field has the
/// defaults documented on its component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Seed for all component RNGs; each component derives its own stream.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub tuner: TunerConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub meta: MetaConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Cycles in the learning phase before optimization starts.
    pub warmup_cycles: u64,
    /// Run the meta controller every this many cycles.
    pub meta_eval_every: u64,
    /// Consecutive failed-but-required cycles before degrading.
    pub max_consecutive_failures: u32,
    pub history_cap: usize,
    pub audit_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            warmup_cycles: 5,
            meta_eval_every: 3,
            max_consecutive_failures: 3,
            history_cap: 100,
            audit_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let config: GovernanceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.scheduler.baseline_secs, 300);
        assert_eq!(config.orchestrator.max_consecutive_failures, 3);
        assert_eq!(config.tuner.persist_every, 10);
        assert_eq!(config.bandit.persist_every, 50);
        assert_eq!(config.detector.persist_every, 50);
        assert_eq!(config.feedback.persist_every, 100);
    }

    #[test]
    fn round_trips_through_json() {
        let mut config = GovernanceConfig::default();
        config.seed = 7;
        config.orchestrator.warmup_cycles = 2;
        let text = serde_json::to_string(&config).unwrap();
        let back: GovernanceConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.seed, 7);
        assert_eq!(back.orchestrator.warmup_cycles, 2);
    }
}
