//! Persistence round-trips across the whole core.

use std::sync::Arc;

use crate::bandit::{BanditConfig, ContextualBandit};
use crate::config::GovernanceConfig;
use crate::context::{Context, TaskCategory};
use crate::feedback::FeedbackContext;
use crate::orchestrator::GovernanceOrchestrator;
use crate::params::{HyperparameterId, ALL_PARAMS};
use crate::runtime::{
    BlobStore, ManualClock, MemoryBlobStore, ResourceSnapshot, SeededRng, StaticProbe,
};

const NOON: u64 = 12 * 3600;

fn core(clock: Arc<ManualClock>, store: Arc<MemoryBlobStore>) -> GovernanceOrchestrator {
    GovernanceOrchestrator::new(
        GovernanceConfig::default(),
        clock,
        store,
        Box::new(StaticProbe::new(ResourceSnapshot::default())),
    )
}

#[test]
fn whole_core_survives_a_restart() {
    let clock = Arc::new(ManualClock::new(NOON));
    let store = Arc::new(MemoryBlobStore::new());
    let ctx = Context::new(TaskCategory::Debugging);

    let (values, pulls, window_len, baseline) = {
        let mut c = core(clock.clone(), store.clone());
        c.bandit.register_arms(vec![crate::bandit::ModelArm {
            id: "m".to_string(),
            family: "sim".to_string(),
            is_local: true,
            expected_latency_ms: 400.0,
            expected_quality: 0.8,
        }]);
        for _ in 0..8 {
            c.aggregator.record_success(FeedbackContext::for_model("m"));
            c.bandit.record_reward("m", &ctx, 0.8);
            c.run_cycle();
            clock.advance(300);
        }
        c.flush_all();
        (
            c.tuner.snapshot_values(),
            c.bandit.global_stats("m").pull_count,
            c.detector.window_len(),
            c.scheduler.adaptive_baseline(),
        )
    };

    let c = core(clock, store);
    for id in ALL_PARAMS {
        assert!(
            (c.tuner.value(id) - values[&id]).abs() < 1e-12,
            "{id:?} drifted across restart"
        );
    }
    assert_eq!(c.bandit.global_stats("m").pull_count, pulls);
    assert_eq!(c.detector.window_len(), window_len);
    assert!((c.scheduler.adaptive_baseline() - baseline).abs() < 1e-12);
}

#[test]
fn corrupt_blob_resets_only_that_component() {
    let clock = Arc::new(ManualClock::new(NOON));
    let store = Arc::new(MemoryBlobStore::new());
    {
        let mut c = core(clock.clone(), store.clone());
        for _ in 0..12 {
            c.tuner
                .record_outcome(HyperparameterId::ExplorationRate, 0.3, 0.9, None);
        }
        c.bandit
            .record_reward("m", &Context::new(TaskCategory::General), 0.9);
        c.flush_all();
    }

    store.put("tuner.state", b"garbage".to_vec()).unwrap();

    let c = core(clock, store);
    // tuner came back with defaults
    assert_eq!(
        c.tuner.value(HyperparameterId::ExplorationRate),
        HyperparameterId::ExplorationRate.default_value()
    );
    // the bandit's blob was untouched
    assert_eq!(c.bandit.global_stats("m").pull_count, 1);
}

#[test]
fn future_blob_version_is_discarded() {
    let clock = Arc::new(ManualClock::new(NOON));
    let store = Arc::new(MemoryBlobStore::new());
    store
        .put(
            "bandit.state",
            br#"{"version":99,"state":{"ctx_stats":{},"global_stats":{},"total_pulls":5}}"#
                .to_vec(),
        )
        .unwrap();
    let b = ContextualBandit::new(
        BanditConfig::default(),
        Box::new(SeededRng::new(1)),
        clock,
        store,
    );
    assert_eq!(b.statistics().total_pulls, 0);
}
