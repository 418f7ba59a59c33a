//! Bayesian hyperparameter tuning.
//!
//! Each knob carries a Beta posterior over outcome quality, Welford
//! statistics over tested values, and a bounded outcome history. Values
//! move by an adaptive EMA toward well-rewarded trials; weight groups
//! renormalize after every touch.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::params::{HyperparameterId, NormalizationGroup, ALL_PARAMS};
use crate::persist;
use crate::runtime::{BlobStore, Clock, Rng};
use crate::sampling;
use crate::stats::Welford;

const STATE_KEY: &str = "tuner.state";
const STATE_VERSION: u32 = 1;
const HISTORY_CAP: usize = 100;
const WEEK_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// How boldly sampled values may depart from the current estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunerMode {
    Aggressive,
    Balanced,
    Conservative,
    /// Exploit with a light UCB bonus; used once the system has settled.
    Convergent,
}

impl Default for TunerMode {
    fn default() -> Self {
        TunerMode::Balanced
    }
}

/// One tested-value observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub tested: f64,
    pub outcome: f64,
    pub timestamp: u64,
    pub context: Option<String>,
}

/// Posterior and statistics for one knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveHyperparameter {
    pub id: HyperparameterId,
    pub current: f64,
    pub alpha: f64,
    pub beta: f64,
    pub tested_stats: Welford,
    pub history: VecDeque<OutcomeRecord>,
    pub consecutive_stable: u32,
    pub last_outcome_at: u64,
}

impl AdaptiveHyperparameter {
    fn fresh(id: HyperparameterId) -> Self {
        Self {
            id,
            current: id.default_value(),
            alpha: 1.0,
            beta: 1.0,
            tested_stats: Welford::default(),
            history: VecDeque::new(),
            consecutive_stable: 0,
            last_outcome_at: 0,
        }
    }

    pub fn trials(&self) -> u64 {
        self.tested_stats.count
    }

    /// Adaptive EMA step size: noisier knobs move faster, floor 0.1 until
    /// five trials exist.
    fn adaptive_alpha(&self) -> f64 {
        if self.tested_stats.count < 5 {
            0.1
        } else {
            (0.1 + self.tested_stats.cv() * 0.3).clamp(0.01, 0.5)
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(self.alpha >= 1.0);
        debug_assert!(self.beta >= 1.0);
        debug_assert!(self.tested_stats.m2 >= 0.0);
        let (lo, hi) = self.id.range();
        debug_assert!(self.current >= lo && self.current <= hi);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    pub mode: TunerMode,
    pub persist_every: u32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            mode: TunerMode::Balanced,
            persist_every: 10,
        }
    }
}

/// Typed statistics export.
#[derive(Debug, Clone, Serialize)]
pub struct TunerStatistics {
    pub total_trials: u64,
    pub converged_params: usize,
    pub system_convergence: f64,
    pub mode: TunerMode,
}

#[derive(Debug, Serialize, Deserialize)]
struct TunerState {
    params: Vec<AdaptiveHyperparameter>,
    total_trials: u64,
}

pub struct HyperparameterTuner {
    config: TunerConfig,
    params: HashMap<HyperparameterId, AdaptiveHyperparameter>,
    total_trials: u64,
    outcomes_since_persist: u32,
    dirty: bool,
    rng: Box<dyn Rng>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn BlobStore>,
}

impl HyperparameterTuner {
    pub fn new(
        config: TunerConfig,
        rng: Box<dyn Rng>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let mut params: HashMap<_, _> = ALL_PARAMS
            .iter()
            .map(|&id| (id, AdaptiveHyperparameter::fresh(id)))
            .collect();
        let mut total_trials = 0;
        if let Some(state) = persist::load::<TunerState>(store.as_ref(), STATE_KEY, STATE_VERSION) {
            total_trials = state.total_trials;
            for param in state.params {
                params.insert(param.id, param);
            }
        }
        Self {
            config,
            params,
            total_trials,
            outcomes_since_persist: 0,
            dirty: false,
            rng,
            clock,
            store,
        }
    }

    pub fn mode(&self) -> TunerMode {
        self.config.mode
    }

    pub fn set_mode(&mut self, mode: TunerMode) {
        self.config.mode = mode;
    }

    /// Best current estimate for a knob.
    pub fn value(&self, id: HyperparameterId) -> f64 {
        self.params
            .get(&id)
            .map(|p| p.current)
            .unwrap_or_else(|| id.default_value())
    }

    /// Thompson sample mapped into the knob's range, shaped by mode.
    pub fn sample(&mut self, id: HyperparameterId) -> f64 {
        let (current, alpha, beta, trials) = match self.params.get(&id) {
            Some(p) => (p.current, p.alpha, p.beta, p.trials()),
            None => return id.default_value(),
        };
        let (lo, hi) = id.range();
        let raw = lo + sampling::beta(self.rng.as_mut(), alpha, beta) * (hi - lo);
        let raw = raw.clamp(lo, hi);

        match self.config.mode {
            TunerMode::Aggressive | TunerMode::Balanced => raw,
            TunerMode::Conservative => (0.7 * current + 0.3 * raw).clamp(lo, hi),
            TunerMode::Convergent => {
                if trials >= 1 {
                    self.sample_ucb(id, 0.5)
                } else {
                    raw
                }
            }
        }
    }

    /// UCB point estimate: `current + bonus * sqrt(ln(N + 1) / n)`,
    /// projected into range. Needs at least one trial.
    pub fn sample_ucb(&self, id: HyperparameterId, bonus: f64) -> f64 {
        let param = match self.params.get(&id) {
            Some(p) if p.trials() >= 1 => p,
            _ => return self.value(id),
        };
        let n = param.trials() as f64;
        let big_n = (self.total_trials + 1) as f64;
        id.clamp(param.current + bonus * (big_n.ln() / n).sqrt())
    }

    /// Fold in one trial result. Outcomes above 0.5 pull the current value
    /// toward the tested one; near-identical well-rewarded trials bump the
    /// stability counter that gates convergence.
    pub fn record_outcome(
        &mut self,
        id: HyperparameterId,
        tested: f64,
        outcome: f64,
        context: Option<&str>,
    ) {
        let outcome = outcome.clamp(0.0, 1.0);
        let now = self.clock.now();

        let Some(param) = self.params.get_mut(&id) else {
            return;
        };

        param.alpha += outcome;
        param.beta += 1.0 - outcome;
        param.tested_stats.push(tested);

        param.history.push_back(OutcomeRecord {
            tested,
            outcome,
            timestamp: now,
            context: context.map(str::to_string),
        });
        while param.history.len() > HISTORY_CAP {
            param.history.pop_front();
        }

        if outcome > 0.5 {
            let step = param.adaptive_alpha();
            param.current = id.clamp((1.0 - step) * param.current + step * tested);
        }

        let relative_gap = (tested - param.current).abs() / param.current.abs().max(0.001);
        if relative_gap < 0.05 && outcome > 0.6 {
            param.consecutive_stable += 1;
        } else {
            param.consecutive_stable = 0;
        }

        param.last_outcome_at = now;
        param.assert_invariants();

        if let Some(group) = id.group() {
            self.renormalize(group);
        }

        self.total_trials += 1;
        self.outcomes_since_persist += 1;
        if self.outcomes_since_persist >= self.config.persist_every || self.dirty {
            self.flush();
        }
    }

    /// Rescale a weight group so members sum to 1, each within range.
    fn renormalize(&mut self, group: NormalizationGroup) {
        let members = group.members();
        let sum: f64 = members.iter().map(|id| self.value(*id)).sum();
        if sum <= 0.0 {
            // degenerate; reseed from defaults
            for id in members {
                if let Some(p) = self.params.get_mut(id) {
                    p.current = id.default_value();
                }
            }
            return;
        }
        for id in members {
            if let Some(p) = self.params.get_mut(id) {
                p.current = id.clamp(p.current / sum);
            }
        }
        debug_assert!(
            (members.iter().map(|id| self.value(*id)).sum::<f64>() - 1.0).abs() < 1e-9
        );
    }

    /// Self-assessed confidence: sample count, inverse dispersion, recency.
    pub fn confidence(&self, id: HyperparameterId) -> f64 {
        let Some(param) = self.params.get(&id) else {
            return 0.0;
        };
        let n = param.trials() as f64;
        let sample_term = (n / 50.0).min(1.0);
        let dispersion_term = (1.0 - param.tested_stats.cv()).max(0.0);
        let recency_term = if param.last_outcome_at == 0 {
            0.0
        } else {
            let age = self.clock.now().saturating_sub(param.last_outcome_at) as f64;
            (1.0 - age / WEEK_SECS).max(0.0)
        };
        0.4 * sample_term + 0.4 * dispersion_term + 0.2 * recency_term
    }

    pub fn is_converged(&self, id: HyperparameterId) -> bool {
        self.params
            .get(&id)
            .map(|p| p.trials() >= 20 && p.tested_stats.cv() < 0.1 && p.consecutive_stable >= 10)
            .unwrap_or(false)
    }

    /// Fraction of knobs whose posteriors have settled.
    pub fn system_convergence(&self) -> f64 {
        let converged = ALL_PARAMS.iter().filter(|&&id| self.is_converged(id)).count();
        converged as f64 / ALL_PARAMS.len() as f64
    }

    /// Current values of every knob, for checkpointing.
    pub fn snapshot_values(&self) -> HashMap<HyperparameterId, f64> {
        ALL_PARAMS.iter().map(|&id| (id, self.value(id))).collect()
    }

    /// Restore current values from a checkpoint snapshot. Posteriors and
    /// histories are kept; only the point estimates move.
    pub fn restore_values(&mut self, values: &HashMap<HyperparameterId, f64>) {
        for (&id, &value) in values {
            if let Some(param) = self.params.get_mut(&id) {
                param.current = id.clamp(value);
                param.consecutive_stable = 0;
            }
        }
        self.renormalize(NormalizationGroup::SelectionWeights);
        self.renormalize(NormalizationGroup::QualityWeights);
        self.dirty = true;
        tracing::info!("tuner parameters restored from checkpoint");
    }

    pub fn param(&self, id: HyperparameterId) -> Option<&AdaptiveHyperparameter> {
        self.params.get(&id)
    }

    pub fn statistics(&self) -> TunerStatistics {
        let converged = ALL_PARAMS.iter().filter(|&&id| self.is_converged(id)).count();
        TunerStatistics {
            total_trials: self.total_trials,
            converged_params: converged,
            system_convergence: self.system_convergence(),
            mode: self.config.mode,
        }
    }

    pub fn flush(&mut self) {
        let state = TunerState {
            params: self.params.values().cloned().collect(),
            total_trials: self.total_trials,
        };
        let ok = persist::save(self.store.as_ref(), STATE_KEY, STATE_VERSION, &state);
        self.dirty = !ok;
        if ok {
            self.outcomes_since_persist = 0;
        }
    }

    pub fn reset(&mut self) {
        tracing::info!("tuner reset to defaults");
        self.params = ALL_PARAMS
            .iter()
            .map(|&id| (id, AdaptiveHyperparameter::fresh(id)))
            .collect();
        self.total_trials = 0;
        self.outcomes_since_persist = 0;
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ManualClock, MemoryBlobStore, SeededRng};

    fn tuner() -> HyperparameterTuner {
        HyperparameterTuner::new(
            TunerConfig::default(),
            Box::new(SeededRng::new(42)),
            Arc::new(ManualClock::new(1_000_000)),
            Arc::new(MemoryBlobStore::new()),
        )
    }

    #[test]
    fn posterior_and_range_invariants_hold_under_fire() {
        let mut t = tuner();
        let mut rng = SeededRng::new(9);
        for i in 0..300 {
            let id = ALL_PARAMS[i % ALL_PARAMS.len()];
            let tested = rng.uniform() * 20.0 - 5.0; // deliberately wild
            let outcome = rng.uniform() * 1.4 - 0.2; // outside [0,1] too
            t.record_outcome(id, tested, outcome, None);

            let p = t.param(id).unwrap();
            assert!(p.alpha >= 1.0);
            assert!(p.beta >= 1.0);
            assert!(p.tested_stats.m2 >= -1e-12);
            let (lo, hi) = id.range();
            assert!(p.current >= lo && p.current <= hi);
        }
    }

    #[test]
    fn converges_on_consistently_rewarded_value() {
        let mut t = tuner();
        let id = HyperparameterId::ExplorationRate;
        for i in 0..40 {
            let outcome = if i % 2 == 0 { 0.9 } else { 0.8 };
            t.record_outcome(id, 0.2, outcome, None);
        }
        let current = t.value(id);
        assert!((0.18..=0.22).contains(&current), "current {current}");
        assert!(t.is_converged(id));
        assert!(t.confidence(id) >= 0.7, "confidence {}", t.confidence(id));
    }

    #[test]
    fn half_rewarded_outcome_leaves_current_unchanged() {
        let mut t = tuner();
        let id = HyperparameterId::QualityEmaAlpha;
        let before = t.value(id);
        t.record_outcome(id, 0.8, 0.5, None);
        assert_eq!(t.value(id), before);
    }

    #[test]
    fn group_renormalizes_after_every_update() {
        let mut t = tuner();
        let group = NormalizationGroup::QualityWeights;
        for i in 0..30 {
            t.record_outcome(
                HyperparameterId::QualitySuccessWeight,
                0.6,
                0.9,
                Some("cycle"),
            );
            let sum: f64 = group.members().iter().map(|id| t.value(*id)).sum();
            assert!((sum - 1.0).abs() < 1e-9, "iteration {i}: sum {sum}");
            for id in group.members() {
                let v = t.value(*id);
                assert!((0.0..=1.0).contains(&v));
            }
        }
        // the rewarded member grew at the others' expense
        assert!(t.value(HyperparameterId::QualitySuccessWeight) > 0.4);
    }

    #[test]
    fn sampling_respects_range_in_every_mode() {
        for mode in [
            TunerMode::Aggressive,
            TunerMode::Balanced,
            TunerMode::Conservative,
            TunerMode::Convergent,
        ] {
            let mut t = HyperparameterTuner::new(
                TunerConfig {
                    mode,
                    ..Default::default()
                },
                Box::new(SeededRng::new(5)),
                Arc::new(ManualClock::new(0)),
                Arc::new(MemoryBlobStore::new()),
            );
            t.record_outcome(HyperparameterId::ExplorationRate, 0.2, 0.9, None);
            for _ in 0..200 {
                let v = t.sample(HyperparameterId::ExplorationRate);
                let (lo, hi) = HyperparameterId::ExplorationRate.range();
                assert!(v >= lo && v <= hi, "{mode:?} sampled {v}");
            }
        }
    }

    #[test]
    fn conservative_mode_stays_near_current() {
        let mut t = HyperparameterTuner::new(
            TunerConfig {
                mode: TunerMode::Conservative,
                ..Default::default()
            },
            Box::new(SeededRng::new(6)),
            Arc::new(ManualClock::new(0)),
            Arc::new(MemoryBlobStore::new()),
        );
        let id = HyperparameterId::BanditExplorationBonus;
        let current = t.value(id);
        let (lo, hi) = id.range();
        for _ in 0..100 {
            let v = t.sample(id);
            // conservative blend keeps 70% of current
            assert!(v >= 0.7 * current + 0.3 * lo - 1e-9);
            assert!(v <= 0.7 * current + 0.3 * hi + 1e-9);
        }
    }

    #[test]
    fn ucb_needs_a_trial_and_projects_into_range() {
        let mut t = tuner();
        let id = HyperparameterId::ConvergenceThreshold;
        assert_eq!(t.sample_ucb(id, 0.5), t.value(id));
        t.record_outcome(id, 0.012, 0.8, None);
        let v = t.sample_ucb(id, 10.0);
        let (lo, hi) = id.range();
        assert!(v >= lo && v <= hi);
    }

    #[test]
    fn state_round_trips_through_store() {
        let store = Arc::new(MemoryBlobStore::new());
        let clock = Arc::new(ManualClock::new(500_000));
        {
            let mut t = HyperparameterTuner::new(
                TunerConfig::default(),
                Box::new(SeededRng::new(42)),
                clock.clone(),
                store.clone(),
            );
            for _ in 0..15 {
                t.record_outcome(HyperparameterId::ExplorationRate, 0.3, 0.8, None);
            }
            t.flush();
        }
        let reloaded = HyperparameterTuner::new(
            TunerConfig::default(),
            Box::new(SeededRng::new(42)),
            clock,
            store,
        );
        let p = reloaded.param(HyperparameterId::ExplorationRate).unwrap();
        assert_eq!(p.trials(), 15);
        assert!(p.alpha > 1.0);
        assert_eq!(reloaded.statistics().total_trials, 15);
    }

    #[test]
    fn restore_values_clamps_and_renormalizes() {
        let mut t = tuner();
        let mut values = t.snapshot_values();
        values.insert(HyperparameterId::ExplorationRate, 7.0);
        values.insert(HyperparameterId::QualitySuccessWeight, 0.9);
        t.restore_values(&values);
        assert_eq!(t.value(HyperparameterId::ExplorationRate), 0.5);
        let sum: f64 = NormalizationGroup::QualityWeights
            .members()
            .iter()
            .map(|id| t.value(*id))
            .sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
