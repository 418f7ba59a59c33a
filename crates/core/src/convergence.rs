//! Convergence detection and rollback support.
//!
//! Classifies the system from a rolling window of metric snapshots:
//! variance says how settled scores are, trend says which way they move,
//! oscillation count catches thrashing. Checkpoints capture known-good
//! configurations for rollback.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::meta::OptimizationStrategy;
use crate::params::HyperparameterId;
use crate::persist;
use crate::runtime::{BlobStore, Clock};
use crate::stats;

const STATE_KEY: &str = "detector.state";
const STATE_VERSION: u32 = 1;

/// One cycle's scored metrics, each field in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub composite_quality: f64,
    pub latency: f64,
    pub user_satisfaction: f64,
    pub error_rate: f64,
    pub resource_efficiency: f64,
    pub timestamp: u64,
}

impl MetricSnapshot {
    /// The scalar the detector tracks:
    /// `0.40·quality + 0.30·satisfaction + 0.20·efficiency + 0.10·(1 − error)`.
    pub fn overall_score(&self) -> f64 {
        0.40 * self.composite_quality
            + 0.30 * self.user_satisfaction
            + 0.20 * self.resource_efficiency
            + 0.10 * (1.0 - self.error_rate)
    }

    fn clamped(mut self) -> Self {
        self.composite_quality = self.composite_quality.clamp(0.0, 1.0);
        self.latency = self.latency.clamp(0.0, 1.0);
        self.user_satisfaction = self.user_satisfaction.clamp(0.0, 1.0);
        self.error_rate = self.error_rate.clamp(0.0, 1.0);
        self.resource_efficiency = self.resource_efficiency.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceState {
    Exploring,
    Converging,
    Converged,
    Diverging,
    Unstable,
    Unknown,
}

impl ConvergenceState {
    /// Whether configuration changes should be accepted in this state.
    pub fn accepts_changes(self) -> bool {
        !matches!(self, ConvergenceState::Converged | ConvergenceState::Unstable)
    }

    /// Scale factor on exploration while in this state.
    pub fn exploration_multiplier(self) -> f64 {
        match self {
            ConvergenceState::Exploring => 1.5,
            ConvergenceState::Converging => 0.8,
            ConvergenceState::Converged => 0.3,
            ConvergenceState::Diverging => 1.2,
            ConvergenceState::Unstable => 0.5,
            ConvergenceState::Unknown => 1.0,
        }
    }

    pub fn recommended_action(self) -> &'static str {
        match self {
            ConvergenceState::Exploring => "explore freely",
            ConvergenceState::Converging => "narrow the search",
            ConvergenceState::Converged => "hold configuration",
            ConvergenceState::Diverging => "consider rollback",
            ConvergenceState::Unstable => "postpone changes",
            ConvergenceState::Unknown => "collect more data",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceAnalysis {
    pub state: ConvergenceState,
    pub confidence: f64,
    pub variance: f64,
    pub trend: f64,
    pub oscillations: u32,
    pub since_converged: Option<u64>,
    pub recommendation: &'static str,
}

/// Verdict on a proposed configuration change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangeDecision {
    Apply,
    Postpone,
    /// Apply at a reduced scale.
    ExperimentSmall { scale: f64 },
    Reject,
}

/// A restorable known-good configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    pub timestamp: u64,
    pub strategy: OptimizationStrategy,
    pub learning_rate: f64,
    pub performance: MetricSnapshot,
    pub score: f64,
    pub parameters: HashMap<HyperparameterId, f64>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub variance_window: usize,
    pub trend_window: usize,
    pub min_samples: usize,
    pub oscillation_threshold: u32,
    pub window_cap: usize,
    pub max_checkpoints: usize,
    pub persist_every: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            variance_window: 50,
            trend_window: 20,
            min_samples: 20,
            oscillation_threshold: 5,
            window_cap: 500,
            max_checkpoints: 20,
            persist_every: 50,
        }
    }
}

/// Typed statistics export.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatistics {
    pub samples: usize,
    pub checkpoints: usize,
    pub state: ConvergenceState,
    pub best_checkpoint_score: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DetectorState {
    window: VecDeque<MetricSnapshot>,
    checkpoints: Vec<Checkpoint>,
    last_converged_at: Option<u64>,
    next_checkpoint_id: u64,
}

pub struct ConvergenceDetector {
    config: DetectorConfig,
    window: VecDeque<MetricSnapshot>,
    checkpoints: Vec<Checkpoint>,
    last_converged_at: Option<u64>,
    next_checkpoint_id: u64,
    /// Variance bound for convergence; tuner-managed, refreshed per cycle.
    convergence_threshold: f64,
    /// Negative-trend magnitude flagging divergence; tuner-managed.
    divergence_threshold: f64,
    snapshots_since_persist: u32,
    dirty: bool,
    clock: Arc<dyn Clock>,
    store: Arc<dyn BlobStore>,
}

impl ConvergenceDetector {
    pub fn new(config: DetectorConfig, clock: Arc<dyn Clock>, store: Arc<dyn BlobStore>) -> Self {
        let state: DetectorState =
            persist::load(store.as_ref(), STATE_KEY, STATE_VERSION).unwrap_or_default();
        Self {
            config,
            window: state.window,
            checkpoints: state.checkpoints,
            last_converged_at: state.last_converged_at,
            next_checkpoint_id: state.next_checkpoint_id,
            convergence_threshold: HyperparameterId::ConvergenceThreshold.default_value(),
            divergence_threshold: HyperparameterId::RollbackSensitivity.default_value(),
            snapshots_since_persist: 0,
            dirty: false,
            clock,
            store,
        }
    }

    /// Refresh the tuner-managed thresholds. Called by the orchestrator
    /// before each cycle's analysis.
    pub fn set_thresholds(&mut self, convergence: f64, divergence: f64) {
        self.convergence_threshold = HyperparameterId::ConvergenceThreshold.clamp(convergence);
        self.divergence_threshold = HyperparameterId::RollbackSensitivity.clamp(divergence);
    }

    pub fn record(&mut self, snapshot: MetricSnapshot) {
        self.window.push_back(snapshot.clamped());
        while self.window.len() > self.config.window_cap {
            self.window.pop_front();
        }

        if self.analyze().state == ConvergenceState::Converged {
            self.last_converged_at = Some(snapshot.timestamp);
        }

        self.snapshots_since_persist += 1;
        if self.snapshots_since_persist >= self.config.persist_every || self.dirty {
            self.flush();
        }
    }

    /// Pure function of the current window.
    pub fn analyze(&self) -> ConvergenceAnalysis {
        let now = self.clock.now();
        let since_converged = self.last_converged_at.map(|t| now.saturating_sub(t));

        if self.window.len() < self.config.min_samples {
            return ConvergenceAnalysis {
                state: ConvergenceState::Unknown,
                confidence: 0.0,
                variance: 0.0,
                trend: 0.0,
                oscillations: 0,
                since_converged,
                recommendation: ConvergenceState::Unknown.recommended_action(),
            };
        }

        let scores: Vec<f64> = self.window.iter().map(|s| s.overall_score()).collect();

        let variance_slice = tail(&scores, self.config.variance_window);
        let variance = stats::sample_variance(variance_slice);

        let trend_slice = tail(&scores, self.config.trend_window);
        let trend = if trend_slice.len() >= 5 {
            stats::slope(trend_slice)
        } else {
            0.0
        };

        let oscillations = count_oscillations(tail(&scores, 2 * self.config.trend_window));

        let conv = self.convergence_threshold;
        let div = self.divergence_threshold;
        let osc_threshold = self.config.oscillation_threshold;

        let (state, confidence) = if oscillations > osc_threshold {
            let over = (oscillations - osc_threshold) as f64;
            (ConvergenceState::Unstable, 0.7 + (over * 0.05).min(0.3))
        } else if variance < conv && trend.abs() < 0.01 {
            (
                ConvergenceState::Converged,
                (0.7 + 10.0 * (conv - variance)).min(1.0),
            )
        } else if variance < 3.0 * conv && trend > 0.0 {
            (ConvergenceState::Converging, 0.6 + (5.0 * trend).min(0.3))
        } else if trend < -div {
            (ConvergenceState::Diverging, 0.6 + (3.0 * trend.abs()).min(0.4))
        } else {
            (ConvergenceState::Exploring, 0.5)
        };

        ConvergenceAnalysis {
            state,
            confidence,
            variance,
            trend,
            oscillations,
            since_converged,
            recommendation: state.recommended_action(),
        }
    }

    /// Gate a proposed change on the current state.
    pub fn should_apply_change(&self, expected_improvement: f64, _risk: f64) -> ChangeDecision {
        let div = self.divergence_threshold;
        match self.analyze().state {
            ConvergenceState::Converged => {
                if expected_improvement > 2.0 * div {
                    ChangeDecision::ExperimentSmall { scale: 0.3 }
                } else {
                    ChangeDecision::Reject
                }
            }
            ConvergenceState::Unstable => ChangeDecision::Postpone,
            ConvergenceState::Diverging => {
                if expected_improvement > 0.0 {
                    ChangeDecision::Apply
                } else {
                    ChangeDecision::Postpone
                }
            }
            ConvergenceState::Exploring => ChangeDecision::Apply,
            ConvergenceState::Converging => {
                if expected_improvement > div {
                    ChangeDecision::ExperimentSmall { scale: 0.5 }
                } else {
                    ChangeDecision::Postpone
                }
            }
            ConvergenceState::Unknown => ChangeDecision::Postpone,
        }
    }

    /// Kelly-criterion sizing of a proposed change.
    pub fn kelly_decision(&self, expected_improvement: f64, win_probability: f64) -> ChangeDecision {
        let p = win_probability.clamp(0.0, 1.0);
        let edge = expected_improvement / self.divergence_threshold.max(0.01);
        let fraction = (edge * p - (1.0 - p)) / edge.max(0.01);
        if fraction <= 0.0 {
            ChangeDecision::Reject
        } else if fraction < 0.5 {
            ChangeDecision::ExperimentSmall { scale: fraction }
        } else {
            ChangeDecision::Apply
        }
    }

    /// Capture the current configuration as a checkpoint, scored by the
    /// recent window. Only the top checkpoints by score are kept.
    pub fn create_checkpoint(
        &mut self,
        reason: impl Into<String>,
        strategy: OptimizationStrategy,
        learning_rate: f64,
        parameters: HashMap<HyperparameterId, f64>,
    ) -> u64 {
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;

        let recent: Vec<&MetricSnapshot> = self.window.iter().rev().take(10).collect();
        let score = if recent.is_empty() {
            0.5
        } else {
            recent.iter().map(|s| s.overall_score()).sum::<f64>() / recent.len() as f64
        };
        let performance = recent.first().copied().copied().unwrap_or(MetricSnapshot {
            composite_quality: 0.5,
            latency: 0.5,
            user_satisfaction: 0.5,
            error_rate: 0.0,
            resource_efficiency: 0.5,
            timestamp: self.clock.now(),
        });

        self.checkpoints.push(Checkpoint {
            id,
            timestamp: self.clock.now(),
            strategy,
            learning_rate,
            performance,
            score,
            parameters,
            reason: reason.into(),
        });

        if self.checkpoints.len() > self.config.max_checkpoints {
            self.checkpoints.sort_by(|a, b| {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            });
            self.checkpoints.truncate(self.config.max_checkpoints);
        }

        self.dirty = true;
        tracing::debug!(checkpoint = id, score, "checkpoint created");
        id
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn checkpoint(&self, id: u64) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == id)
    }

    pub fn find_best_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().max_by(|a, b| {
            a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Most recent checkpoint at or above `min_score` (default 0.5).
    pub fn find_last_good_checkpoint(&self, min_score: Option<f64>) -> Option<&Checkpoint> {
        let floor = min_score.unwrap_or(0.5);
        self.checkpoints
            .iter()
            .filter(|c| c.score >= floor)
            .max_by_key(|c| c.timestamp)
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn statistics(&self) -> DetectorStatistics {
        DetectorStatistics {
            samples: self.window.len(),
            checkpoints: self.checkpoints.len(),
            state: self.analyze().state,
            best_checkpoint_score: self.find_best_checkpoint().map(|c| c.score),
        }
    }

    pub fn flush(&mut self) {
        let state = DetectorState {
            window: self.window.clone(),
            checkpoints: self.checkpoints.clone(),
            last_converged_at: self.last_converged_at,
            next_checkpoint_id: self.next_checkpoint_id,
        };
        let ok = persist::save(self.store.as_ref(), STATE_KEY, STATE_VERSION, &state);
        self.dirty = !ok;
        if ok {
            self.snapshots_since_persist = 0;
        }
    }

    pub fn reset(&mut self) {
        tracing::info!("convergence detector reset");
        self.window.clear();
        self.checkpoints.clear();
        self.last_converged_at = None;
        self.next_checkpoint_id = 0;
        self.snapshots_since_persist = 0;
        self.flush();
    }
}

fn tail(values: &[f64], n: usize) -> &[f64] {
    &values[values.len().saturating_sub(n)..]
}

/// Sign changes between consecutive meaningful diffs (`|diff| > 0.01`).
fn count_oscillations(scores: &[f64]) -> u32 {
    let diffs: Vec<f64> = scores
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| d.abs() > 0.01)
        .collect();
    diffs
        .windows(2)
        .filter(|pair| pair[0].signum() != pair[1].signum())
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ManualClock, MemoryBlobStore};

    fn snapshot(score_driver: f64, ts: u64) -> MetricSnapshot {
        // overall_score == score_driver when every component equals it
        MetricSnapshot {
            composite_quality: score_driver,
            latency: score_driver,
            user_satisfaction: score_driver,
            error_rate: 1.0 - score_driver,
            resource_efficiency: score_driver,
            timestamp: ts,
        }
    }

    fn detector() -> ConvergenceDetector {
        ConvergenceDetector::new(
            DetectorConfig::default(),
            Arc::new(ManualClock::new(10_000)),
            Arc::new(MemoryBlobStore::new()),
        )
    }

    #[test]
    fn overall_score_weighting() {
        let s = MetricSnapshot {
            composite_quality: 1.0,
            latency: 0.0,
            user_satisfaction: 0.0,
            error_rate: 1.0,
            resource_efficiency: 0.0,
            timestamp: 0,
        };
        assert!((s.overall_score() - 0.40).abs() < 1e-12);
        assert!((snapshot(0.8, 0).overall_score() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn below_min_samples_is_unknown() {
        let mut d = detector();
        for i in 0..19 {
            d.record(snapshot(0.6, i));
        }
        let analysis = d.analyze();
        assert_eq!(analysis.state, ConvergenceState::Unknown);
        assert_eq!(analysis.confidence, 0.0);
    }

    #[test]
    fn flat_stream_converges() {
        let mut d = detector();
        for i in 0..40 {
            d.record(snapshot(0.7, i));
        }
        let analysis = d.analyze();
        assert_eq!(analysis.state, ConvergenceState::Converged);
        assert!(analysis.confidence >= 0.7);
        assert!(analysis.variance < 1e-9);
    }

    #[test]
    fn gentle_rise_is_converging() {
        let mut d = detector();
        for i in 0..30 {
            d.record(snapshot(0.3 + 0.5 * i as f64 / 29.0, i));
        }
        let analysis = d.analyze();
        assert_eq!(analysis.state, ConvergenceState::Converging);
        assert!(analysis.trend > 0.01);
    }

    #[test]
    fn rise_then_fall_is_diverging() {
        let mut d = detector();
        let mut ts = 0;
        for i in 0..30 {
            d.record(snapshot(0.5 + 0.3 * i as f64 / 29.0, ts));
            ts += 1;
        }
        for i in 0..10 {
            d.record(snapshot(0.8 - 0.4 * (i + 1) as f64 / 10.0, ts));
            ts += 1;
        }
        let analysis = d.analyze();
        assert_eq!(analysis.state, ConvergenceState::Diverging);
        assert_eq!(d.should_apply_change(0.0, 0.5), ChangeDecision::Postpone);
        assert_eq!(d.should_apply_change(0.2, 0.5), ChangeDecision::Apply);
    }

    #[test]
    fn sawtooth_is_unstable() {
        let mut d = detector();
        for i in 0..40 {
            let score = if i % 2 == 0 { 0.3 } else { 0.7 };
            d.record(snapshot(score, i));
        }
        let analysis = d.analyze();
        assert_eq!(analysis.state, ConvergenceState::Unstable);
        assert!(analysis.oscillations > 5);
        assert_eq!(d.should_apply_change(0.5, 0.0), ChangeDecision::Postpone);
    }

    #[test]
    fn converged_state_rejects_small_changes() {
        let mut d = detector();
        for i in 0..40 {
            d.record(snapshot(0.7, i));
        }
        assert_eq!(d.should_apply_change(0.001, 0.0), ChangeDecision::Reject);
        match d.should_apply_change(1.0, 0.0) {
            ChangeDecision::ExperimentSmall { scale } => assert!((scale - 0.3).abs() < 1e-12),
            other => panic!("expected small experiment, got {other:?}"),
        }
    }

    #[test]
    fn kelly_boundaries() {
        let d = detector();
        assert_eq!(d.kelly_decision(0.2, 1.0), ChangeDecision::Apply);
        assert_eq!(d.kelly_decision(-0.1, 0.9), ChangeDecision::Reject);
        assert_eq!(d.kelly_decision(0.0, 0.5), ChangeDecision::Reject);
        match d.kelly_decision(0.02, 0.55) {
            ChangeDecision::ExperimentSmall { scale } => {
                assert!(scale > 0.0 && scale < 0.5);
            }
            ChangeDecision::Apply => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn checkpoints_keep_top_by_score() {
        let mut d = detector();
        for round in 0..25u64 {
            // vary window quality so scores differ per checkpoint
            let level = 0.3 + 0.02 * round as f64;
            for i in 0..10 {
                d.record(snapshot(level, round * 10 + i));
            }
            d.create_checkpoint(
                format!("round {round}"),
                OptimizationStrategy::Thompson,
                0.1,
                HashMap::new(),
            );
        }
        assert_eq!(d.checkpoints().len(), 20);
        let best = d.find_best_checkpoint().unwrap();
        assert!(best.score > 0.7);
        // low-scoring early checkpoints were evicted
        assert!(d.checkpoints().iter().all(|c| c.score > 0.35));
    }

    #[test]
    fn last_good_checkpoint_prefers_recency() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut d = ConvergenceDetector::new(
            DetectorConfig::default(),
            clock.clone(),
            Arc::new(MemoryBlobStore::new()),
        );
        for i in 0..30 {
            d.record(snapshot(0.8, i));
        }
        let first = d.create_checkpoint("a", OptimizationStrategy::Thompson, 0.1, HashMap::new());
        clock.advance(500);
        let second = d.create_checkpoint("b", OptimizationStrategy::Thompson, 0.1, HashMap::new());
        let found = d.find_last_good_checkpoint(None).unwrap();
        assert_eq!(found.id, second);
        assert!(d.checkpoint(first).is_some());
    }

    #[test]
    fn state_round_trips_through_store() {
        let store = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        {
            let mut d = ConvergenceDetector::new(
                DetectorConfig::default(),
                clock.clone(),
                store.clone(),
            );
            for i in 0..60 {
                d.record(snapshot(0.7, i));
            }
            d.create_checkpoint("steady", OptimizationStrategy::Ucb, 0.2, HashMap::new());
            d.flush();
        }
        let d = ConvergenceDetector::new(DetectorConfig::default(), clock, store);
        assert_eq!(d.window_len(), 60);
        assert_eq!(d.checkpoints().len(), 1);
        assert_eq!(d.checkpoints()[0].strategy, OptimizationStrategy::Ucb);
        assert_eq!(d.analyze().state, ConvergenceState::Converged);
    }
}
