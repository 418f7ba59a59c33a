//! Drives the governance core against the synthetic workload.
//!
//! Each governance cycle serves a batch of tasks through the bandit,
//! feeds the observed signals back into the aggregator, and lets the
//! core retune itself. A mid-run quality shock exercises divergence
//! detection and rollback. The per-cycle trace lands in a CSV.

use clap::{Parser, ValueEnum};
use miette::{IntoDiagnostic, Result};
use selftune_core::bandit::{compute_reward, ModelArm};
use selftune_core::config::GovernanceConfig;
use selftune_core::runtime::Clock;
use selftune_core::feedback::FeedbackContext;
use selftune_core::orchestrator::GovernanceOrchestrator;
use selftune_core::runtime::{
    ManualClock, MemoryBlobStore, ResourceSnapshot, StaticProbe,
};
use selftune_core::scheduler::ActivityLevel;
use selftune_sim::Workload;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "selftune-sim", version, about = "Governance core simulation")]
struct Cli {
    /// Governance cycles to run
    #[arg(long, default_value_t = 120)]
    cycles: u64,
    /// Tasks served per cycle
    #[arg(long, default_value_t = 25)]
    tasks_per_cycle: u32,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Cycle at which backend quality collapses (0 disables)
    #[arg(long, default_value_t = 60)]
    shock_at: u64,
    /// Cycles the shock lasts
    #[arg(long, default_value_t = 20)]
    shock_duration: u64,
    #[arg(long, default_value = "history.csv")]
    out: PathBuf,
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    // simulated time: the clock only moves when the scheduler says so
    let clock = Arc::new(ManualClock::new(12 * 3600));
    let store = Arc::new(MemoryBlobStore::new());
    let mut config = GovernanceConfig::default();
    config.seed = cli.seed;
    let mut core = GovernanceOrchestrator::new(
        config,
        clock.clone(),
        store,
        Box::new(StaticProbe::new(ResourceSnapshot::default())),
    );

    let mut workload = Workload::new(cli.seed ^ 0x5157);
    core.bandit.register_arms(
        workload
            .models()
            .iter()
            .map(|m| ModelArm {
                id: m.id.clone(),
                family: "sim".to_string(),
                is_local: m.is_local,
                expected_latency_ms: m.base_latency_ms,
                expected_quality: m.base_quality,
            })
            .collect(),
    );

    let mut writer = csv::Writer::from_path(&cli.out).into_diagnostic()?;
    writer
        .write_record([
            "cycle",
            "phase",
            "overall_success",
            "changes_applied",
            "issues_detected",
            "interval_secs",
            "convergence_state",
            "selected_share_local",
        ])
        .into_diagnostic()?;

    for cycle in 1..=cli.cycles {
        if cli.shock_at != 0 && cycle == cli.shock_at {
            tracing::warn!(cycle, "injecting quality shock");
            workload.inject_shock(0.5);
        }
        if cli.shock_at != 0 && cycle == cli.shock_at + cli.shock_duration {
            tracing::info!(cycle, "clearing quality shock");
            workload.clear_shock();
        }

        let mut local_selections = 0u32;
        for _ in 0..cli.tasks_per_cycle {
            let ctx = workload.next_task();
            let Some(arm) = core.select_model(&ctx) else {
                continue;
            };
            if arm.is_local {
                local_selections += 1;
            }
            let seen = workload.serve(&arm.id);

            let feedback_ctx = FeedbackContext::for_model(&arm.id);
            core.aggregator
                .record_latency(seen.latency_ms, feedback_ctx.clone());
            if seen.error {
                core.aggregator.record_error(feedback_ctx.clone());
            } else {
                core.aggregator.record_success(feedback_ctx.clone());
            }
            if seen.regenerated {
                core.aggregator.record_regeneration(feedback_ctx.clone());
            }
            if seen.edited {
                core.aggregator.record_edit(feedback_ctx.clone());
            }
            if let Some(rating) = seen.rating {
                core.aggregator
                    .record_rating((rating * 5.0).round() as u32, 5, feedback_ctx);
            }

            let reward = compute_reward(
                seen.latency_ms,
                seen.rating,
                seen.regenerated,
                seen.edited,
                seen.error,
            );
            core.bandit.record_reward(&arm.id, &ctx, reward);
        }

        core.record_activity(ActivityLevel::Moderate);
        let metrics = core.run_cycle();
        let analysis = core.detector.analyze();

        writer
            .write_record([
                metrics.cycle.to_string(),
                format!("{:?}", core.phase()),
                metrics.overall_success.to_string(),
                metrics.changes_applied.to_string(),
                metrics.issues_detected.to_string(),
                core.next_run_at()
                    .saturating_sub(clock.now())
                    .to_string(),
                format!("{:?}", analysis.state),
                format!(
                    "{:.2}",
                    local_selections as f64 / cli.tasks_per_cycle.max(1) as f64
                ),
            ])
            .into_diagnostic()?;

        for event in core.audit().drain() {
            tracing::debug!(kind = ?event.kind, cycle = event.cycle, "{}", event.detail);
        }

        // jump simulated time to the next scheduled run
        let wait = core.next_run_at().saturating_sub(clock.now());
        clock.advance(wait);
    }

    core.flush_all();
    writer.flush().into_diagnostic()?;

    let stats = core.statistics();
    tracing::info!(
        cycles = stats.cycles_run,
        phase = ?stats.phase,
        convergence = core.tuner.system_convergence(),
        "simulation complete"
    );
    println!(
        "ran {} cycles, final phase {:?}, trace written to {}",
        stats.cycles_run,
        stats.phase,
        cli.out.display()
    );
    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
    }
}
