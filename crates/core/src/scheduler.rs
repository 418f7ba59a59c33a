//! Adaptive governance-cycle scheduling.
//!
//! The next interval is the adaptive baseline scaled by a weighted blend
//! of activity, stability, resource, hourly-pattern, and trend
//! multipliers, clamped to configured bounds. Cycle effectiveness feeds
//! back into the baseline.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::persist;
use crate::runtime::{BlobStore, Clock};
use crate::stats;

const STATE_KEY: &str = "scheduler.state";
const STATE_VERSION: u32 = 1;
const SAMPLE_CAP: usize = 1000;
const PATTERN_LEARNING_RATE: f64 = 0.1;
const CONFIDENCE_CAP: f64 = 0.95;

/// How busy the user currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityLevel {
    Idle,
    Light,
    Moderate,
    Heavy,
    Intense,
}

impl ActivityLevel {
    /// Numeric code used for pattern averaging and trend slopes.
    pub fn numeric(self) -> f64 {
        match self {
            ActivityLevel::Idle => 0.0,
            ActivityLevel::Light => 1.0,
            ActivityLevel::Moderate => 2.0,
            ActivityLevel::Heavy => 3.0,
            ActivityLevel::Intense => 4.0,
        }
    }

    /// Busier hours shorten the interval.
    pub fn multiplier(self) -> f64 {
        match self {
            ActivityLevel::Idle => 1.5,
            ActivityLevel::Light => 1.2,
            ActivityLevel::Moderate => 1.0,
            ActivityLevel::Heavy => 0.7,
            ActivityLevel::Intense => 0.5,
        }
    }
}

/// How settled the governance loop looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StabilityLevel {
    Stable,
    Settling,
    Drifting,
    Unstable,
}

impl StabilityLevel {
    /// Stable systems can afford long intervals; unstable ones need
    /// frequent correction.
    pub fn multiplier(self) -> f64 {
        match self {
            StabilityLevel::Stable => 1.4,
            StabilityLevel::Settling => 1.0,
            StabilityLevel::Drifting => 0.8,
            StabilityLevel::Unstable => 0.6,
        }
    }
}

/// Host resource headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAvailability {
    Plentiful,
    Adequate,
    Constrained,
    Critical,
}

impl ResourceAvailability {
    /// Constrained hosts get longer intervals to stay out of the way.
    pub fn multiplier(self) -> f64 {
        match self {
            ResourceAvailability::Plentiful => 0.85,
            ResourceAvailability::Adequate => 1.0,
            ResourceAvailability::Constrained => 1.3,
            ResourceAvailability::Critical => 1.6,
        }
    }
}

/// Learned expectation for one hour of the day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyPattern {
    pub hour: u8,
    /// Expected activity as a continuous code in `[0, 4]`.
    pub expected_activity: f64,
    pub confidence: f64,
    pub sample_count: u64,
}

impl HourlyPattern {
    fn seeded(hour: u8) -> Self {
        // time-of-day priors: quiet nights, busy working hours
        let expected = match hour {
            0..=5 => ActivityLevel::Idle.numeric(),
            6..=8 => ActivityLevel::Light.numeric(),
            9..=11 => ActivityLevel::Heavy.numeric(),
            12..=13 => ActivityLevel::Moderate.numeric(),
            14..=17 => ActivityLevel::Heavy.numeric(),
            18..=21 => ActivityLevel::Moderate.numeric(),
            _ => ActivityLevel::Light.numeric(),
        };
        Self {
            hour,
            expected_activity: expected,
            confidence: 0.3,
            sample_count: 0,
        }
    }

    /// Bayesian-weighted pull toward the observation. At low confidence
    /// the observation weight approaches 1 and dominates the mean.
    fn update(&mut self, observed: f64) {
        let existing_weight = self.confidence;
        let observed_weight =
            PATTERN_LEARNING_RATE * (1.0 - self.confidence) + (1.0 - PATTERN_LEARNING_RATE);
        self.expected_activity = (self.expected_activity * existing_weight
            + observed * observed_weight)
            / (existing_weight + observed_weight);
        self.confidence = (self.confidence + (1.0 - self.confidence) * 0.05).min(CONFIDENCE_CAP);
        self.sample_count += 1;
    }

    /// Multiplier for a continuous activity code: linear interpolation
    /// over the per-level table.
    fn multiplier(&self) -> f64 {
        multiplier_for_code(self.expected_activity)
    }
}

fn multiplier_for_code(code: f64) -> f64 {
    const TABLE: [f64; 5] = [1.5, 1.2, 1.0, 0.7, 0.5];
    let code = code.clamp(0.0, 4.0);
    let lower = code.floor() as usize;
    let upper = code.ceil() as usize;
    if lower == upper {
        return TABLE[lower];
    }
    let t = code - lower as f64;
    TABLE[lower] * (1.0 - t) + TABLE[upper] * t
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivitySample {
    pub timestamp: u64,
    pub level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub min_secs: u64,
    pub max_secs: u64,
    pub baseline_secs: u64,
    pub persist_every: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_secs: 60,
            max_secs: 900,
            baseline_secs: 300,
            persist_every: 20,
        }
    }
}

/// The multipliers that shaped an interval decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalFactors {
    pub activity: f64,
    pub stability: f64,
    pub resources: f64,
    pub pattern: f64,
    pub pattern_confidence: f64,
    pub trend: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalDecision {
    pub seconds: u64,
    pub reason: String,
    pub confidence: f64,
    pub factors: IntervalFactors,
}

/// Typed statistics export.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatistics {
    pub adaptive_baseline_secs: f64,
    pub avg_interval_secs: f64,
    pub interval_variance: f64,
    pub activity_samples: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SchedulerState {
    patterns: Vec<HourlyPattern>,
    samples: VecDeque<ActivitySample>,
    adaptive_baseline: f64,
    avg_interval: f64,
    interval_variance: f64,
}

pub struct AdaptiveIntervalScheduler {
    config: SchedulerConfig,
    activity: ActivityLevel,
    stability: StabilityLevel,
    resources: ResourceAvailability,
    patterns: Vec<HourlyPattern>,
    samples: VecDeque<ActivitySample>,
    adaptive_baseline: f64,
    avg_interval: f64,
    interval_variance: f64,
    outcomes_since_persist: u32,
    dirty: bool,
    clock: Arc<dyn Clock>,
    store: Arc<dyn BlobStore>,
}

impl AdaptiveIntervalScheduler {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>, store: Arc<dyn BlobStore>) -> Self {
        let loaded = persist::load::<SchedulerState>(store.as_ref(), STATE_KEY, STATE_VERSION);
        let baseline = config.baseline_secs as f64;
        let mut scheduler = Self {
            config,
            activity: ActivityLevel::Moderate,
            stability: StabilityLevel::Settling,
            resources: ResourceAvailability::Adequate,
            patterns: (0..24).map(HourlyPattern::seeded).collect(),
            samples: VecDeque::new(),
            adaptive_baseline: baseline,
            avg_interval: baseline,
            interval_variance: 0.0,
            outcomes_since_persist: 0,
            dirty: false,
            clock,
            store,
        };
        if let Some(state) = loaded {
            if state.patterns.len() == 24 {
                scheduler.patterns = state.patterns;
            }
            scheduler.samples = state.samples;
            scheduler.adaptive_baseline = state
                .adaptive_baseline
                .clamp(scheduler.config.min_secs as f64, scheduler.config.max_secs as f64);
            scheduler.avg_interval = state.avg_interval;
            scheduler.interval_variance = state.interval_variance;
        }
        scheduler
    }

    pub fn set_activity(&mut self, activity: ActivityLevel) {
        self.activity = activity;
    }

    pub fn set_stability(&mut self, stability: StabilityLevel) {
        self.stability = stability;
    }

    pub fn set_resources(&mut self, resources: ResourceAvailability) {
        self.resources = resources;
    }

    /// Record an observed activity level: ring buffer plus the hourly
    /// pattern for the current hour.
    pub fn record_activity(&mut self, level: ActivityLevel) {
        let now = self.clock.now();
        self.activity = level;
        self.samples.push_back(ActivitySample {
            timestamp: now,
            level: level.numeric(),
        });
        while self.samples.len() > SAMPLE_CAP {
            self.samples.pop_front();
        }
        let hour = self.clock.hour_of(now) as usize;
        self.patterns[hour].update(level.numeric());
        self.dirty = true;
    }

    /// Compute the next cycle interval.
    pub fn next_interval(&mut self) -> IntervalDecision {
        let now = self.clock.now();
        let hour = self.clock.hour_of(now) as usize;

        let m_activity = self.activity.multiplier();
        let m_stability = self.stability.multiplier();
        let m_resources = self.resources.multiplier();
        let pattern = &self.patterns[hour];
        let m_pattern = pattern.multiplier();
        let p_conf = pattern.confidence;

        let recent: Vec<f64> = self
            .samples
            .iter()
            .rev()
            .take(10)
            .map(|s| s.level)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let m_trend = (1.0 - 0.2 * stats::slope(&recent)).clamp(0.5, 1.5);

        let weight_sum = 0.30 + 0.25 + 0.20 + 0.15 * p_conf + 0.10;
        let blended = (0.30 * m_activity
            + 0.25 * m_stability
            + 0.20 * m_resources
            + 0.15 * p_conf * m_pattern
            + 0.10 * m_trend)
            / weight_sum;

        let seconds = (self.adaptive_baseline * blended)
            .clamp(self.config.min_secs as f64, self.config.max_secs as f64);

        self.avg_interval = stats::ema(self.avg_interval, seconds, 0.1);
        let deviation = seconds - self.avg_interval;
        self.interval_variance = stats::ema(self.interval_variance, deviation * deviation, 0.1);

        let confidence =
            0.5 * p_conf + 0.5 * (self.samples.len() as f64 / 100.0).min(1.0);

        let reason = if blended < 0.9 {
            "high activity or instability, tightening cadence".to_string()
        } else if blended > 1.1 {
            "quiet and stable, relaxing cadence".to_string()
        } else {
            "near baseline".to_string()
        };

        IntervalDecision {
            seconds: seconds.round() as u64,
            reason,
            confidence,
            factors: IntervalFactors {
                activity: m_activity,
                stability: m_stability,
                resources: m_resources,
                pattern: m_pattern,
                pattern_confidence: p_conf,
                trend: m_trend,
            },
        }
    }

    /// Score how well the elapsed cycle used its interval and adjust the
    /// adaptive baseline accordingly.
    pub fn record_outcome(
        &mut self,
        _actual_secs: u64,
        changes_applied: u32,
        issues_detected: u32,
        resource_usage: f64,
    ) {
        let mut effectiveness: f64 = 0.5;
        if issues_detected > 0 && changes_applied > 0 {
            effectiveness += 0.2;
        }
        if resource_usage < 0.3 {
            effectiveness += 0.1;
        } else if resource_usage > 0.7 {
            effectiveness -= 0.1;
        }
        if issues_detected > 2 * changes_applied {
            effectiveness -= 0.2;
        }
        let effectiveness = effectiveness.clamp(0.0, 1.0);

        // poor cycles stretch the cadence, effective ones tighten it
        let factor = if effectiveness < 0.4 {
            1.05
        } else if effectiveness > 0.7 {
            0.95
        } else {
            1.0 + (0.55 - effectiveness) * 0.1
        };
        self.adaptive_baseline = (self.adaptive_baseline * factor)
            .clamp(self.config.min_secs as f64, self.config.max_secs as f64);

        self.outcomes_since_persist += 1;
        if self.outcomes_since_persist >= self.config.persist_every || self.dirty {
            self.flush();
        }
    }

    pub fn pattern(&self, hour: u8) -> HourlyPattern {
        self.patterns[(hour as usize) % 24]
    }

    pub fn adaptive_baseline(&self) -> f64 {
        self.adaptive_baseline
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        SchedulerStatistics {
            adaptive_baseline_secs: self.adaptive_baseline,
            avg_interval_secs: self.avg_interval,
            interval_variance: self.interval_variance,
            activity_samples: self.samples.len(),
        }
    }

    pub fn flush(&mut self) {
        let state = SchedulerState {
            patterns: self.patterns.clone(),
            samples: self.samples.clone(),
            adaptive_baseline: self.adaptive_baseline,
            avg_interval: self.avg_interval,
            interval_variance: self.interval_variance,
        };
        let ok = persist::save(self.store.as_ref(), STATE_KEY, STATE_VERSION, &state);
        self.dirty = !ok;
        if ok {
            self.outcomes_since_persist = 0;
        }
    }

    pub fn reset(&mut self) {
        tracing::info!("scheduler reset");
        self.patterns = (0..24).map(HourlyPattern::seeded).collect();
        self.samples.clear();
        self.adaptive_baseline = self.config.baseline_secs as f64;
        self.avg_interval = self.config.baseline_secs as f64;
        self.interval_variance = 0.0;
        self.outcomes_since_persist = 0;
        self.flush();
    }
}
