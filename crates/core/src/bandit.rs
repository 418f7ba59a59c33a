//! Contextual multi-armed bandit over model arms.
//!
//! Statistics are kept per (context, arm) and per arm globally. Selection
//! blends the two once a context has seen enough pulls; before that the
//! global posterior carries the decision alone.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::{ComplexityLevel, Context, UrgencyLevel};
use crate::persist;
use crate::runtime::{BlobStore, Clock, Rng};
use crate::sampling;

const STATE_KEY: &str = "bandit.state";
const STATE_VERSION: u32 = 1;

/// A candidate model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArm {
    pub id: String,
    pub family: String,
    pub is_local: bool,
    pub expected_latency_ms: f64,
    pub expected_quality: f64,
}

/// Accumulated fractional rewards for one arm in one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmStatistics {
    pub successes: f64,
    pub failures: f64,
    pub total_reward: f64,
    pub pull_count: u64,
    pub last_pulled: u64,
}

impl ArmStatistics {
    fn beta_sample(&self, rng: &mut dyn Rng) -> f64 {
        sampling::beta(rng, self.successes + 1.0, self.failures + 1.0)
    }

    pub fn mean_reward(&self) -> f64 {
        if self.pull_count == 0 {
            0.5
        } else {
            self.total_reward / self.pull_count as f64
        }
    }

    /// UCB score; unpulled arms sort first.
    fn ucb_score(&self, total_pulls: u64, bonus: f64) -> f64 {
        if self.pull_count == 0 {
            return f64::INFINITY;
        }
        let n = self.pull_count as f64;
        self.mean_reward() + bonus * (((total_pulls + 1) as f64).ln() / n).sqrt()
    }

    fn absorb(&mut self, reward: f64, now: u64) {
        self.successes += reward;
        self.failures += 1.0 - reward;
        self.total_reward += reward;
        self.pull_count += 1;
        self.last_pulled = now;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Context-local pulls required before the context posterior is
    /// trusted in the blend.
    pub min_pulls_for_context: u64,
    /// Weight of the context posterior in the blend (rest is global).
    pub context_blend: f64,
    pub persist_every: u32,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            min_pulls_for_context: 5,
            context_blend: 0.7,
            persist_every: 50,
        }
    }
}

/// Typed statistics export.
#[derive(Debug, Clone, Serialize)]
pub struct BanditStatistics {
    pub arms: usize,
    pub total_pulls: u64,
    pub tracked_contexts: usize,
    pub best_global_arm: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BanditState {
    ctx_stats: HashMap<u64, HashMap<String, ArmStatistics>>,
    global_stats: HashMap<String, ArmStatistics>,
    total_pulls: u64,
}

pub struct ContextualBandit {
    config: BanditConfig,
    arms: Vec<ModelArm>,
    ctx_stats: HashMap<u64, HashMap<String, ArmStatistics>>,
    global_stats: HashMap<String, ArmStatistics>,
    total_pulls: u64,
    rewards_since_persist: u32,
    dirty: bool,
    rng: Box<dyn Rng>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn BlobStore>,
}

impl ContextualBandit {
    pub fn new(
        config: BanditConfig,
        rng: Box<dyn Rng>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let state: BanditState =
            persist::load(store.as_ref(), STATE_KEY, STATE_VERSION).unwrap_or_default();
        Self {
            config,
            arms: Vec::new(),
            ctx_stats: state.ctx_stats,
            global_stats: state.global_stats,
            total_pulls: state.total_pulls,
            rewards_since_persist: 0,
            dirty: false,
            rng,
            clock,
            store,
        }
    }

    /// Replace the arm roster. Statistics for returning arms survive.
    pub fn register_arms(&mut self, arms: Vec<ModelArm>) {
        self.arms = arms;
    }

    pub fn add_arm(&mut self, arm: ModelArm) {
        if !self.arms.iter().any(|a| a.id == arm.id) {
            self.arms.push(arm);
        }
    }

    /// Drop an arm from the roster. Its statistics are kept so a
    /// re-registered arm resumes where it left off.
    pub fn remove_arm(&mut self, id: &str) {
        self.arms.retain(|a| a.id != id);
    }

    pub fn arms(&self) -> &[ModelArm] {
        &self.arms
    }

    /// Thompson selection: blended posterior sample per arm, contextual
    /// multipliers, ties to the earlier-registered arm.
    pub fn select_thompson(&mut self, ctx: &Context) -> Option<&ModelArm> {
        let idx = self.select_index(ctx, SelectionRule::Thompson)?;
        self.arms.get(idx)
    }

    /// UCB selection. The exploration bonus is supplied by the caller;
    /// the orchestrator reads it from the tuner each cycle.
    pub fn select_ucb(&mut self, ctx: &Context, exploration_bonus: f64) -> Option<&ModelArm> {
        let idx = self.select_index(ctx, SelectionRule::Ucb(exploration_bonus))?;
        self.arms.get(idx)
    }

    fn select_index(&mut self, ctx: &Context, rule: SelectionRule) -> Option<usize> {
        if self.arms.is_empty() {
            return None;
        }
        let ctx_key = ctx.key();
        let mut best: Option<(usize, f64)> = None;

        for (idx, arm) in self.arms.iter().enumerate() {
            let global = self.global_stats.get(&arm.id).copied().unwrap_or_default();
            let local = self
                .ctx_stats
                .get(&ctx_key)
                .and_then(|m| m.get(&arm.id))
                .copied()
                .unwrap_or_default();

            let mut score = match rule {
                SelectionRule::Thompson => {
                    if local.pull_count >= self.config.min_pulls_for_context {
                        self.config.context_blend * local.beta_sample(self.rng.as_mut())
                            + (1.0 - self.config.context_blend)
                                * global.beta_sample(self.rng.as_mut())
                    } else {
                        global.beta_sample(self.rng.as_mut())
                    }
                }
                SelectionRule::Ucb(bonus) => {
                    if local.pull_count >= self.config.min_pulls_for_context {
                        self.config.context_blend * local.ucb_score(self.total_pulls, bonus)
                            + (1.0 - self.config.context_blend)
                                * global.ucb_score(self.total_pulls, bonus)
                    } else {
                        global.ucb_score(self.total_pulls, bonus)
                    }
                }
            };

            if ctx.urgency == UrgencyLevel::Critical && arm.is_local {
                score *= 1.2;
            }
            if ctx.urgency == UrgencyLevel::Critical && arm.expected_latency_ms > 5_000.0 {
                score *= 0.7;
            }
            if ctx.complexity == ComplexityLevel::VeryComplex && arm.expected_quality > 0.8 {
                score *= 1.1;
            }

            // strictly-greater keeps insertion order on ties
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((idx, score));
            }
        }

        best.map(|(idx, _)| idx)
    }

    /// Fold in an observed reward for a (model, context) pull.
    pub fn record_reward(&mut self, model: &str, ctx: &Context, reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        let now = self.clock.now();

        self.ctx_stats
            .entry(ctx.key())
            .or_default()
            .entry(model.to_string())
            .or_default()
            .absorb(reward, now);
        self.global_stats
            .entry(model.to_string())
            .or_default()
            .absorb(reward, now);
        self.total_pulls += 1;

        self.rewards_since_persist += 1;
        if self.rewards_since_persist >= self.config.persist_every || self.dirty {
            self.flush();
        }
    }

    /// Monte-Carlo selection frequencies under Thompson draws.
    pub fn selection_probabilities(&mut self, ctx: &Context, samples: u32) -> HashMap<String, f64> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        if self.arms.is_empty() || samples == 0 {
            return HashMap::new();
        }
        for _ in 0..samples {
            if let Some(idx) = self.select_index(ctx, SelectionRule::Thompson) {
                *counts.entry(self.arms[idx].id.clone()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .map(|(id, c)| (id, c as f64 / samples as f64))
            .collect()
    }

    pub fn global_stats(&self, model: &str) -> ArmStatistics {
        self.global_stats.get(model).copied().unwrap_or_default()
    }

    pub fn context_stats(&self, ctx: &Context, model: &str) -> ArmStatistics {
        self.ctx_stats
            .get(&ctx.key())
            .and_then(|m| m.get(model))
            .copied()
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> BanditStatistics {
        let best_global_arm = self
            .global_stats
            .iter()
            .max_by(|a, b| {
                a.1.mean_reward()
                    .partial_cmp(&b.1.mean_reward())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| id.clone());
        BanditStatistics {
            arms: self.arms.len(),
            total_pulls: self.total_pulls,
            tracked_contexts: self.ctx_stats.len(),
            best_global_arm,
        }
    }

    pub fn flush(&mut self) {
        let state = BanditState {
            ctx_stats: self.ctx_stats.clone(),
            global_stats: self.global_stats.clone(),
            total_pulls: self.total_pulls,
        };
        let ok = persist::save(self.store.as_ref(), STATE_KEY, STATE_VERSION, &state);
        self.dirty = !ok;
        if ok {
            self.rewards_since_persist = 0;
        }
    }

    pub fn reset(&mut self) {
        tracing::info!("bandit statistics reset");
        self.ctx_stats.clear();
        self.global_stats.clear();
        self.total_pulls = 0;
        self.rewards_since_persist = 0;
        self.flush();
    }
}

#[derive(Clone, Copy)]
enum SelectionRule {
    Thompson,
    Ucb(f64),
}

/// Scalar reward for one completed task.
///
/// Errors zero the reward outright; latency, explicit rating, and the
/// regenerate/edit signals shape the rest around a 0.5 base.
pub fn compute_reward(
    latency_ms: f64,
    rating: Option<f64>,
    regenerated: bool,
    edited: bool,
    error: bool,
) -> f64 {
    if error {
        return 0.0;
    }
    let mut reward = 0.5;
    reward += 0.2 * (1.0 - latency_ms / 10_000.0).max(0.0);
    if let Some(rating) = rating {
        reward += 0.4 * (rating.clamp(0.0, 1.0) - 0.5);
    }
    if regenerated {
        reward -= 0.2;
    }
    if edited {
        reward -= 0.1;
    }
    reward.clamp(0.0, 1.0)
}
