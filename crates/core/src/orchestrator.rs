//! The governance orchestrator.
//!
//! Owns the six components and drives them once per cycle in a fixed
//! order: aggregate feedback, snapshot metrics into the detector, let the
//! meta controller steer, fold cycle outcomes into the tuner, and ask the
//! scheduler when to run next. Ownership is the lock: no component ever
//! calls another.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::audit::{AuditQueue, GovernanceEvent, GovernanceEventKind};
use crate::bandit::{ContextualBandit, ModelArm};
use crate::config::{GovernanceConfig, OrchestratorConfig};
use crate::context::Context;
use crate::convergence::{ConvergenceDetector, ConvergenceState, MetricSnapshot};
use crate::feedback::{FeedbackAggregator, FeedbackCategory, FeedbackSource};
use crate::meta::{MetaAction, MetaDecision, MetaLearningController, OptimizationStrategy};
use crate::params::{HyperparameterId, NormalizationGroup};
use crate::runtime::{BlobStore, Clock, ResourceProbe, SeededRng, ThermalState};
use crate::scheduler::{ActivityLevel, AdaptiveIntervalScheduler, ResourceAvailability, StabilityLevel};
use crate::tuner::HyperparameterTuner;

/// Lifecycle of the governance loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernancePhase {
    Starting,
    Learning,
    Optimizing,
    Paused,
    Degraded,
    Recovering,
}

/// Outcome record for one governance cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernanceCycleMetrics {
    pub cycle: u64,
    pub duration_secs: u64,
    pub changes_applied: u32,
    pub issues_detected: u32,
    pub resource_usage: f64,
    pub overall_success: bool,
    pub timestamp: u64,
}

/// Typed statistics export for the whole core.
#[derive(Debug, Clone)]
pub struct GovernanceStatistics {
    pub phase: GovernancePhase,
    pub cycles_run: u64,
    pub next_run_at: u64,
    pub consecutive_failures: u32,
}

pub struct GovernanceOrchestrator {
    config: OrchestratorConfig,
    phase: GovernancePhase,
    resume_phase: GovernancePhase,
    cycle: u64,
    consecutive_failures: u32,
    history: VecDeque<GovernanceCycleMetrics>,
    next_run_at: u64,
    last_cycle_at: Option<u64>,
    pub aggregator: FeedbackAggregator,
    pub tuner: HyperparameterTuner,
    pub bandit: ContextualBandit,
    pub detector: ConvergenceDetector,
    pub scheduler: AdaptiveIntervalScheduler,
    pub meta: MetaLearningController,
    audit: AuditQueue,
    probe: Box<dyn ResourceProbe>,
    clock: Arc<dyn Clock>,
}

impl GovernanceOrchestrator {
    /// Build the core with injected capabilities. Each component gets its
    /// own RNG stream derived from the configured seed and loads its own
    /// persisted state.
    pub fn new(
        config: GovernanceConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn BlobStore>,
        probe: Box<dyn ResourceProbe>,
    ) -> Self {
        let seed = config.seed;
        let rng = |offset: u64| Box::new(SeededRng::new(seed.wrapping_add(offset)));

        let aggregator =
            FeedbackAggregator::new(config.feedback.clone(), clock.clone(), store.clone());
        let tuner =
            HyperparameterTuner::new(config.tuner.clone(), rng(1), clock.clone(), store.clone());
        let bandit =
            ContextualBandit::new(config.bandit.clone(), rng(2), clock.clone(), store.clone());
        let detector =
            ConvergenceDetector::new(config.detector.clone(), clock.clone(), store.clone());
        let scheduler =
            AdaptiveIntervalScheduler::new(config.scheduler.clone(), clock.clone(), store.clone());
        let meta =
            MetaLearningController::new(config.meta.clone(), rng(3), clock.clone(), store);

        let now = clock.now();
        Self {
            audit: AuditQueue::new(config.orchestrator.audit_capacity),
            config: config.orchestrator,
            phase: GovernancePhase::Starting,
            resume_phase: GovernancePhase::Starting,
            cycle: 0,
            consecutive_failures: 0,
            history: VecDeque::new(),
            next_run_at: now,
            last_cycle_at: None,
            aggregator,
            tuner,
            bandit,
            detector,
            scheduler,
            meta,
            probe,
            clock,
        }
    }

    pub fn phase(&self) -> GovernancePhase {
        self.phase
    }

    pub fn next_run_at(&self) -> u64 {
        self.next_run_at
    }

    pub fn history(&self) -> &VecDeque<GovernanceCycleMetrics> {
        &self.history
    }

    pub fn audit(&self) -> &AuditQueue {
        &self.audit
    }

    /// Select a model for a task, routing through the meta controller's
    /// current strategy. UCB reads its exploration bonus from the tuner.
    pub fn select_model(&mut self, ctx: &Context) -> Option<ModelArm> {
        let bonus = self.tuner.value(HyperparameterId::BanditExplorationBonus);
        let arm = match self.meta.strategy() {
            OptimizationStrategy::Ucb => self.bandit.select_ucb(ctx, bonus),
            _ => self.bandit.select_thompson(ctx),
        };
        arm.cloned()
    }

    /// Pass-through for host-observed activity.
    pub fn record_activity(&mut self, level: ActivityLevel) {
        self.scheduler.record_activity(level);
    }

    pub fn pause(&mut self) {
        if self.phase != GovernancePhase::Paused {
            self.resume_phase = self.phase;
            self.phase = GovernancePhase::Paused;
            self.emit(GovernanceEventKind::Paused, "paused by host");
        }
    }

    pub fn resume(&mut self) {
        if self.phase == GovernancePhase::Paused {
            self.phase = self.resume_phase;
            self.emit(GovernanceEventKind::Resumed, "resumed by host");
        }
    }

    /// Run one governance cycle. Bounded, never fails; a paused core
    /// reports a quiet no-op cycle.
    #[tracing::instrument(skip(self), fields(cycle = self.cycle + 1))]
    pub fn run_cycle(&mut self) -> GovernanceCycleMetrics {
        let started = self.clock.now();

        if self.phase == GovernancePhase::Paused {
            return GovernanceCycleMetrics {
                cycle: self.cycle,
                duration_secs: 0,
                changes_applied: 0,
                issues_detected: 0,
                resource_usage: 0.0,
                overall_success: true,
                timestamp: started,
            };
        }

        self.cycle += 1;
        self.emit(GovernanceEventKind::CycleStarted, "");

        // 1. host resources
        let resources = self.probe.snapshot();
        let usage = resources.memory_pressure();
        let hot = self.tuner.value(HyperparameterId::MemoryHotThresholdGb);
        let critical = self.tuner.value(HyperparameterId::MemoryCriticalThresholdGb);
        let availability = if resources.thermal >= ThermalState::Serious
            || resources.available_memory_gb < critical
        {
            ResourceAvailability::Critical
        } else if resources.thermal == ThermalState::Fair
            || resources.available_memory_gb < hot
        {
            ResourceAvailability::Constrained
        } else if resources.available_memory_gb >= 2.0 * hot {
            ResourceAvailability::Plentiful
        } else {
            ResourceAvailability::Adequate
        };
        self.scheduler.set_resources(availability);

        // 2. feedback → metric snapshot
        let agg = self.aggregator.aggregate_all();
        let latency_score = agg
            .by_source
            .get(&FeedbackSource::ResponseLatency)
            .copied()
            .unwrap_or(0.5);
        let satisfaction = agg
            .by_category
            .get(&FeedbackCategory::Explicit)
            .copied()
            .unwrap_or(0.5);
        let system_score = agg
            .by_category
            .get(&FeedbackCategory::System)
            .copied()
            .unwrap_or(0.5);
        let snapshot = MetricSnapshot {
            composite_quality: agg.composite,
            latency: latency_score,
            user_satisfaction: satisfaction,
            error_rate: 1.0 - system_score,
            resource_efficiency: 1.0 - usage,
            timestamp: started,
        };
        let overall = snapshot.overall_score();

        // 3. detector, with live tuner thresholds
        self.detector.set_thresholds(
            self.tuner.value(HyperparameterId::ConvergenceThreshold),
            self.tuner.value(HyperparameterId::RollbackSensitivity),
        );
        self.detector.record(snapshot);
        let analysis = self.detector.analyze();

        self.scheduler.set_stability(match analysis.state {
            ConvergenceState::Converged => StabilityLevel::Stable,
            ConvergenceState::Converging => StabilityLevel::Settling,
            ConvergenceState::Exploring | ConvergenceState::Unknown => StabilityLevel::Drifting,
            ConvergenceState::Diverging | ConvergenceState::Unstable => StabilityLevel::Unstable,
        });

        let mut issues_detected = 0u32;
        if matches!(
            analysis.state,
            ConvergenceState::Diverging | ConvergenceState::Unstable
        ) {
            issues_detected += 1;
        }
        if snapshot.error_rate > 0.3 {
            issues_detected += 1;
        }
        if resources.thermal >= ThermalState::Serious {
            issues_detected += 1;
        }

        // 4. meta control
        self.meta.record_outcome(overall >= 0.5, overall);
        let mut changes_applied = 0u32;
        if self.cycle % self.config.meta_eval_every == 0 {
            let decision = self.meta.evaluate(self.detector.checkpoints());
            changes_applied += self.apply_decision(&decision);
        }

        // 5. tuner outcomes for the weight groups, rewarded by this
        // cycle's overall score
        for group in [
            NormalizationGroup::SelectionWeights,
            NormalizationGroup::QualityWeights,
        ] {
            for &id in group.members() {
                let tested = self.tuner.value(id);
                self.tuner
                    .record_outcome(id, tested, overall, Some("governance-cycle"));
            }
        }

        // 6. degradation bookkeeping
        let change_required =
            matches!(
                analysis.state,
                ConvergenceState::Diverging | ConvergenceState::Unstable
            ) || overall < 0.4;
        let cycle_failed = change_required && changes_applied == 0;
        if cycle_failed {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.config.max_consecutive_failures
                && self.phase != GovernancePhase::Degraded
            {
                self.phase = GovernancePhase::Degraded;
                self.emit(GovernanceEventKind::DegradedEntered, "");
                tracing::warn!(
                    failures = self.consecutive_failures,
                    "governance degraded"
                );
            }
        } else {
            self.consecutive_failures = 0;
            if self.phase == GovernancePhase::Degraded {
                self.phase = GovernancePhase::Recovering;
                self.emit(GovernanceEventKind::DegradedExited, "");
            }
        }

        // 7. phase advance
        self.phase = match self.phase {
            GovernancePhase::Starting => GovernancePhase::Learning,
            GovernancePhase::Learning if self.cycle >= self.config.warmup_cycles => {
                GovernancePhase::Optimizing
            }
            GovernancePhase::Recovering => GovernancePhase::Optimizing,
            other => other,
        };

        // 8. schedule the next run
        let actual = self
            .last_cycle_at
            .map(|t| started.saturating_sub(t))
            .unwrap_or(0);
        self.scheduler
            .record_outcome(actual, changes_applied, issues_detected, usage);
        let interval = self.scheduler.next_interval();
        self.next_run_at = self.clock.now() + interval.seconds;
        self.last_cycle_at = Some(started);

        let metrics = GovernanceCycleMetrics {
            cycle: self.cycle,
            duration_secs: self.clock.now().saturating_sub(started),
            changes_applied,
            issues_detected,
            resource_usage: usage,
            overall_success: !cycle_failed,
            timestamp: started,
        };
        self.history.push_back(metrics.clone());
        while self.history.len() > self.config.history_cap {
            self.history.pop_front();
        }

        self.emit(
            GovernanceEventKind::CycleCompleted,
            format!("score {overall:.3}, next in {}s", interval.seconds),
        );
        metrics
    }

    /// Apply a meta decision across components. Returns how many
    /// configuration changes were actually applied; invalid transitions
    /// degrade to none.
    fn apply_decision(&mut self, decision: &MetaDecision) -> u32 {
        match &decision.action {
            MetaAction::Continue => 0,
            MetaAction::SwitchStrategy(strategy) => {
                self.meta.apply(decision);
                self.emit(
                    GovernanceEventKind::StrategySwitched,
                    format!("{strategy:?}: {}", decision.reason),
                );
                1
            }
            MetaAction::AdjustLearningRate(_)
            | MetaAction::IncreaseExploration
            | MetaAction::DecreaseExploration => {
                self.meta.apply(decision);
                self.emit(GovernanceEventKind::DecisionApplied, decision.reason.clone());
                1
            }
            MetaAction::RollbackTo(id) => {
                let Some(checkpoint) = self.detector.checkpoint(*id).cloned() else {
                    // checkpoint vanished; treat as continue
                    return 0;
                };
                self.tuner.restore_values(&checkpoint.parameters);
                self.meta
                    .adopt_checkpoint(checkpoint.strategy, checkpoint.learning_rate);
                self.meta.apply(decision);
                self.emit(
                    GovernanceEventKind::RollbackPerformed,
                    format!("checkpoint {id}: {}", decision.reason),
                );
                tracing::info!(checkpoint = id, "rolled back to checkpoint");
                1
            }
            MetaAction::CreateCheckpoint => {
                let parameters = self.tuner.snapshot_values();
                let id = self.detector.create_checkpoint(
                    decision.reason.clone(),
                    self.meta.strategy(),
                    self.meta.learning_rate(),
                    parameters,
                );
                self.meta.apply(decision);
                self.emit(
                    GovernanceEventKind::CheckpointCreated,
                    format!("checkpoint {id}"),
                );
                0
            }
            MetaAction::Pause { .. } => {
                self.meta.apply(decision);
                self.emit(GovernanceEventKind::Paused, decision.reason.clone());
                0
            }
            MetaAction::Resume => {
                self.meta.apply(decision);
                self.emit(GovernanceEventKind::Resumed, decision.reason.clone());
                0
            }
        }
    }

    /// Write every component's state blob now.
    pub fn flush_all(&mut self) {
        self.aggregator.flush();
        self.tuner.flush();
        self.bandit.flush();
        self.detector.flush();
        self.scheduler.flush();
        self.meta.flush();
    }

    pub fn statistics(&self) -> GovernanceStatistics {
        GovernanceStatistics {
            phase: self.phase,
            cycles_run: self.cycle,
            next_run_at: self.next_run_at,
            consecutive_failures: self.consecutive_failures,
        }
    }

    fn emit(&self, kind: GovernanceEventKind, detail: impl Into<String>) {
        self.audit.push(
            GovernanceEvent::new(kind, self.clock.now(), self.cycle).with_detail(detail),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ManualClock, MemoryBlobStore, ResourceSnapshot, StaticProbe};

    fn orchestrator() -> (GovernanceOrchestrator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(12 * 3600));
        let store = Arc::new(MemoryBlobStore::new());
        let orchestrator = GovernanceOrchestrator::new(
            GovernanceConfig::default(),
            clock.clone(),
            store,
            Box::new(StaticProbe::new(ResourceSnapshot::default())),
        );
        (orchestrator, clock)
    }

    #[test]
    fn phases_progress_through_warmup() {
        let (mut o, clock) = orchestrator();
        assert_eq!(o.phase(), GovernancePhase::Starting);
        o.run_cycle();
        assert_eq!(o.phase(), GovernancePhase::Learning);
        for _ in 0..5 {
            clock.advance(300);
            o.run_cycle();
        }
        assert_eq!(o.phase(), GovernancePhase::Optimizing);
    }

    #[test]
    fn cycle_schedules_next_run_within_bounds() {
        let (mut o, _) = orchestrator();
        let before = o.next_run_at();
        o.run_cycle();
        let gap = o.next_run_at().saturating_sub(before);
        assert!((60..=900).contains(&gap), "gap {gap}");
    }

    #[test]
    fn pause_makes_cycles_no_ops() {
        let (mut o, _) = orchestrator();
        o.run_cycle();
        o.pause();
        assert_eq!(o.phase(), GovernancePhase::Paused);
        let cycles_before = o.statistics().cycles_run;
        let metrics = o.run_cycle();
        assert_eq!(o.statistics().cycles_run, cycles_before);
        assert!(metrics.overall_success);
        o.resume();
        assert_eq!(o.phase(), GovernancePhase::Learning);
    }

    #[test]
    fn history_stays_bounded() {
        let clock = Arc::new(ManualClock::new(12 * 3600));
        let store = Arc::new(MemoryBlobStore::new());
        let mut config = GovernanceConfig::default();
        config.orchestrator.history_cap = 10;
        let mut o = GovernanceOrchestrator::new(
            config,
            clock.clone(),
            store,
            Box::new(StaticProbe::new(ResourceSnapshot::default())),
        );
        for _ in 0..30 {
            clock.advance(120);
            o.run_cycle();
        }
        assert_eq!(o.history().len(), 10);
        assert_eq!(o.history().back().unwrap().cycle, 30);
    }

    #[test]
    fn audit_trail_brackets_each_cycle() {
        let (mut o, _) = orchestrator();
        o.run_cycle();
        let events = o.audit().drain();
        assert!(events
            .iter()
            .any(|e| e.kind == GovernanceEventKind::CycleStarted));
        assert!(events
            .iter()
            .any(|e| e.kind == GovernanceEventKind::CycleCompleted));
    }

    #[test]
    fn weight_groups_stay_normalized_across_cycles() {
        let (mut o, clock) = orchestrator();
        for _ in 0..10 {
            clock.advance(300);
            o.run_cycle();
            for group in [
                NormalizationGroup::SelectionWeights,
                NormalizationGroup::QualityWeights,
            ] {
                let sum: f64 = group.members().iter().map(|&id| o.tuner.value(id)).sum();
                assert!((sum - 1.0).abs() < 1e-9, "sum {sum}");
            }
        }
    }

    #[test]
    fn constrained_host_lengthens_intervals() {
        let clock = Arc::new(ManualClock::new(12 * 3600));
        let store = Arc::new(MemoryBlobStore::new());
        let mut tight = GovernanceOrchestrator::new(
            GovernanceConfig::default(),
            clock.clone(),
            store.clone(),
            Box::new(StaticProbe::new(ResourceSnapshot {
                available_memory_gb: 0.5,
                total_memory_gb: 16.0,
                available_disk_gb: 10.0,
                thermal: ThermalState::Serious,
            })),
        );
        let mut roomy = GovernanceOrchestrator::new(
            GovernanceConfig::default(),
            clock.clone(),
            Arc::new(MemoryBlobStore::new()),
            Box::new(StaticProbe::new(ResourceSnapshot {
                available_memory_gb: 14.0,
                total_memory_gb: 16.0,
                available_disk_gb: 100.0,
                thermal: ThermalState::Nominal,
            })),
        );
        let now = clock.now();
        tight.run_cycle();
        roomy.run_cycle();
        let tight_gap = tight.next_run_at() - now;
        let roomy_gap = roomy.next_run_at() - now;
        assert!(tight_gap > roomy_gap, "tight {tight_gap} roomy {roomy_gap}");
    }
}
