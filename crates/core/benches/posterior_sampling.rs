//! Latency benchmarks for the probabilistic hot paths: posterior
//! sampling in the tuner and Thompson selection in the bandit.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use selftune_core::bandit::{BanditConfig, ContextualBandit, ModelArm};
use selftune_core::context::{Context, TaskCategory};
use selftune_core::params::HyperparameterId;
use selftune_core::runtime::{ManualClock, MemoryBlobStore, SeededRng};
use selftune_core::sampling;
use selftune_core::tuner::{HyperparameterTuner, TunerConfig};
use std::sync::Arc;

fn bench_distributions(c: &mut Criterion) {
    let mut group = c.benchmark_group("distributions");
    let mut rng = SeededRng::new(42);

    group.bench_function("beta_2_2", |b| {
        b.iter(|| black_box(sampling::beta(&mut rng, 2.0, 2.0)))
    });
    group.bench_function("gamma_9", |b| {
        b.iter(|| black_box(sampling::gamma(&mut rng, 9.0)))
    });
    group.bench_function("normal", |b| {
        b.iter(|| black_box(sampling::standard_normal(&mut rng)))
    });

    group.finish();
}

fn bench_tuner_sample(c: &mut Criterion) {
    let mut tuner = HyperparameterTuner::new(
        TunerConfig::default(),
        Box::new(SeededRng::new(42)),
        Arc::new(ManualClock::new(0)),
        Arc::new(MemoryBlobStore::new()),
    );
    for _ in 0..50 {
        tuner.record_outcome(HyperparameterId::ExplorationRate, 0.2, 0.8, None);
    }

    c.bench_function("tuner_sample", |b| {
        b.iter(|| black_box(tuner.sample(HyperparameterId::ExplorationRate)))
    });
}

fn bench_bandit_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("bandit_select");

    for num_arms in [2usize, 8, 32] {
        let mut bandit = ContextualBandit::new(
            BanditConfig::default(),
            Box::new(SeededRng::new(42)),
            Arc::new(ManualClock::new(0)),
            Arc::new(MemoryBlobStore::new()),
        );
        let arms: Vec<ModelArm> = (0..num_arms)
            .map(|i| ModelArm {
                id: format!("arm-{i}"),
                family: "bench".to_string(),
                is_local: i % 2 == 0,
                expected_latency_ms: 400.0,
                expected_quality: 0.7,
            })
            .collect();
        bandit.register_arms(arms);
        let ctx = Context::new(TaskCategory::CodeGeneration);
        for i in 0..num_arms {
            for _ in 0..10 {
                bandit.record_reward(&format!("arm-{i}"), &ctx, 0.5);
            }
        }

        group.bench_with_input(
            BenchmarkId::new("thompson", num_arms),
            &num_arms,
            |b, _| b.iter(|| black_box(bandit.select_thompson(&ctx).map(|a| a.id.clone()))),
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_distributions,
    bench_tuner_sample,
    bench_bandit_select
);
criterion_main!(benches);
