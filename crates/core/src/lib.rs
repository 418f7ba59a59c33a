//! Adaptive governance core.
//!
//! A self-tuning control subsystem: it learns which configuration values
//! to use (Bayesian hyperparameter tuning), which model to route a task
//! to (contextual bandit), and when to run its next governance cycle
//! (adaptive scheduling), all from streams of explicit, implicit, and system
//! feedback, with convergence detection and checkpoint rollback keeping
//! it honest.

pub mod audit;
pub mod bandit;
pub mod config;
pub mod context;
pub mod convergence;
pub mod feedback;
pub mod meta;
pub mod orchestrator;
pub mod params;
pub mod persist;
pub mod runtime;
pub mod sampling;
pub mod scheduler;
pub mod stats;
pub mod tuner;

#[cfg(test)]
mod tests;

pub use audit::{AuditQueue, EnqueueResult, GovernanceEvent, GovernanceEventKind};
pub use bandit::{compute_reward, ArmStatistics, BanditConfig, ContextualBandit, ModelArm};
pub use config::{GovernanceConfig, OrchestratorConfig};
pub use context::{
    ComplexityLevel, Context, ResourceTier, TaskCategory, TimeCluster, UrgencyLevel,
};
pub use convergence::{
    ChangeDecision, Checkpoint, ConvergenceAnalysis, ConvergenceDetector, ConvergenceState,
    DetectorConfig, MetricSnapshot,
};
pub use feedback::{
    AggregatedFeedback, FeedbackAggregator, FeedbackCategory, FeedbackConfig, FeedbackContext,
    FeedbackEvent, FeedbackSource,
};
pub use meta::{
    LearningRateConfig, MetaAction, MetaConfig, MetaDecision, MetaLearningController,
    OptimizationStrategy, StrategyPerformance,
};
pub use orchestrator::{
    GovernanceCycleMetrics, GovernanceOrchestrator, GovernancePhase, GovernanceStatistics,
};
pub use params::{HyperparameterId, NormalizationGroup, ALL_PARAMS};
pub use runtime::{
    BlobStore, Clock, ManualClock, MemoryBlobStore, ResourceProbe, ResourceSnapshot, Rng,
    SeededRng, SequenceRng, StaticProbe, StoreError, SystemClock, ThermalState,
};
pub use scheduler::{
    ActivityLevel, AdaptiveIntervalScheduler, HourlyPattern, IntervalDecision, IntervalFactors,
    ResourceAvailability, SchedulerConfig, StabilityLevel,
};
pub use tuner::{AdaptiveHyperparameter, HyperparameterTuner, OutcomeRecord, TunerConfig, TunerMode};
