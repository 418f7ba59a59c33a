//! Synthetic assistant workload for exercising the governance core.
//!
//! Two simulated model backends with different latent quality and
//! latency serve a stream of tasks. Observations are noisy, and a
//! mid-run quality shock on the backends lets the run demonstrate
//! divergence detection and rollback.

use rand::{Rng as _, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use selftune_core::context::{ComplexityLevel, Context, TaskCategory, UrgencyLevel};

/// Latent truth about one simulated backend.
#[derive(Debug, Clone)]
pub struct SimModel {
    pub id: String,
    pub is_local: bool,
    pub base_quality: f64,
    pub base_latency_ms: f64,
}

/// One observed task completion.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub latency_ms: f64,
    pub rating: Option<f64>,
    pub regenerated: bool,
    pub edited: bool,
    pub error: bool,
}

pub struct Workload {
    rng: ChaCha8Rng,
    models: Vec<SimModel>,
    /// Quality penalty applied to every model while a shock is active.
    shock_penalty: f64,
}

const TASKS: [TaskCategory; 6] = [
    TaskCategory::CodeGeneration,
    TaskCategory::Debugging,
    TaskCategory::Summarization,
    TaskCategory::QuestionAnswering,
    TaskCategory::CreativeWriting,
    TaskCategory::Conversation,
];

impl Workload {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            models: vec![
                SimModel {
                    id: "local-fast".to_string(),
                    is_local: true,
                    base_quality: 0.82,
                    base_latency_ms: 600.0,
                },
                SimModel {
                    id: "remote-large".to_string(),
                    is_local: false,
                    base_quality: 0.68,
                    base_latency_ms: 2_400.0,
                },
            ],
            shock_penalty: 0.0,
        }
    }

    pub fn models(&self) -> &[SimModel] {
        &self.models
    }

    /// Degrade every backend, as an upstream regression would.
    pub fn inject_shock(&mut self, penalty: f64) {
        self.shock_penalty = penalty.clamp(0.0, 1.0);
    }

    pub fn clear_shock(&mut self) {
        self.shock_penalty = 0.0;
    }

    /// Draw the next task context.
    pub fn next_task(&mut self) -> Context {
        let task = TASKS[self.rng.random_range(0..TASKS.len())];
        let urgency = if self.rng.random_bool(0.1) {
            UrgencyLevel::Critical
        } else {
            UrgencyLevel::Normal
        };
        let complexity = if self.rng.random_bool(0.2) {
            ComplexityLevel::Complex
        } else {
            ComplexityLevel::Moderate
        };
        Context::new(task)
            .with_urgency(urgency)
            .with_complexity(complexity)
    }

    /// Serve a task on the named model and report what the user saw.
    pub fn serve(&mut self, model_id: &str) -> Observation {
        let model = self
            .models
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
            .unwrap_or_else(|| self.models[0].clone());

        let quality = (model.base_quality - self.shock_penalty).clamp(0.0, 1.0);
        let latency_noise = Normal::new(0.0, model.base_latency_ms * 0.15)
            .map(|n| n.sample(&mut self.rng))
            .unwrap_or(0.0);
        let latency_ms = (model.base_latency_ms + latency_noise).max(50.0);

        let error = self.rng.random_bool(0.02 + (1.0 - quality) * 0.05);
        let regenerated = !error && self.rng.random_bool((1.0 - quality) * 0.5);
        let edited = !error && self.rng.random_bool((1.0 - quality) * 0.25);
        let rating = if self.rng.random_bool(0.3) {
            let noise: f64 = self.rng.random_range(-0.1..=0.1);
            Some((quality + noise).clamp(0.0, 1.0))
        } else {
            None
        };

        Observation {
            latency_ms,
            rating,
            regenerated,
            edited,
            error,
        }
    }
}
