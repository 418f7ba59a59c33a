//! Divergence → rollback pipeline.
//!
//! Rising scores get checkpointed; a decline flips the detector to
//! diverging, changes get postponed, and sustained decline drives the
//! meta controller to a rollback that restores the checkpointed tuner
//! parameters.

use std::sync::Arc;

use crate::convergence::{
    ChangeDecision, ConvergenceDetector, ConvergenceState, DetectorConfig, MetricSnapshot,
};
use crate::meta::{MetaAction, MetaConfig, MetaLearningController};
use crate::params::HyperparameterId;
use crate::runtime::{ManualClock, MemoryBlobStore, SeededRng};
use crate::tuner::{HyperparameterTuner, TunerConfig};

fn snapshot(score: f64, ts: u64) -> MetricSnapshot {
    MetricSnapshot {
        composite_quality: score,
        latency: score,
        user_satisfaction: score,
        error_rate: 1.0 - score,
        resource_efficiency: score,
        timestamp: ts,
    }
}

#[test]
fn divergence_postpones_then_rolls_back() {
    let clock = Arc::new(ManualClock::new(100_000));
    let store = Arc::new(MemoryBlobStore::new());

    let mut tuner = HyperparameterTuner::new(
        TunerConfig::default(),
        Box::new(SeededRng::new(3)),
        clock.clone(),
        store.clone(),
    );
    let mut detector =
        ConvergenceDetector::new(DetectorConfig::default(), clock.clone(), store.clone());
    let mut meta = MetaLearningController::new(
        MetaConfig::default(),
        Box::new(SeededRng::new(4)),
        clock.clone(),
        store,
    );

    // healthy climb to 0.8
    let mut ts = 0;
    for i in 0..30 {
        detector.record(snapshot(0.5 + 0.3 * i as f64 / 29.0, ts));
        ts += 1;
    }

    // checkpoint the good configuration, with a recognizable parameter
    tuner.record_outcome(HyperparameterId::ExplorationRate, 0.25, 0.9, None);
    let good_exploration = tuner.value(HyperparameterId::ExplorationRate);
    let checkpoint_id = detector.create_checkpoint(
        "peak performance",
        meta.strategy(),
        meta.learning_rate(),
        tuner.snapshot_values(),
    );

    // regression to 0.4
    for i in 0..10 {
        detector.record(snapshot(0.8 - 0.4 * (i + 1) as f64 / 10.0, ts));
        ts += 1;
    }

    let analysis = detector.analyze();
    assert_eq!(analysis.state, ConvergenceState::Diverging);
    assert_eq!(
        detector.should_apply_change(0.0, 0.5),
        ChangeDecision::Postpone
    );

    // sustained decline in the meta controller's reward stream
    for _ in 0..5 {
        meta.record_outcome(false, 0.3);
    }
    let decision = meta.evaluate(detector.checkpoints());
    assert_eq!(decision.action, MetaAction::RollbackTo(checkpoint_id));

    // wander the parameter away, then restore from the checkpoint
    for _ in 0..10 {
        tuner.record_outcome(HyperparameterId::ExplorationRate, 0.45, 0.95, None);
    }
    assert!(tuner.value(HyperparameterId::ExplorationRate) > good_exploration);

    let checkpoint = detector.checkpoint(checkpoint_id).unwrap().clone();
    tuner.restore_values(&checkpoint.parameters);
    meta.adopt_checkpoint(checkpoint.strategy, checkpoint.learning_rate);
    meta.apply(&decision);

    assert!(
        (tuner.value(HyperparameterId::ExplorationRate) - good_exploration).abs() < 1e-9
    );
    assert_eq!(meta.statistics().consecutive_declines, 0);
}

#[test]
fn rollback_without_checkpoints_degrades_gracefully() {
    let clock = Arc::new(ManualClock::new(100_000));
    let mut meta = MetaLearningController::new(
        MetaConfig::default(),
        Box::new(SeededRng::new(4)),
        clock,
        Arc::new(MemoryBlobStore::new()),
    );
    for _ in 0..8 {
        meta.record_outcome(false, 0.2);
    }
    let decision = meta.evaluate(&[]);
    assert!(!matches!(decision.action, MetaAction::RollbackTo(_)));
}
