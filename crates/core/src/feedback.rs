//! Unified feedback aggregation.
//!
//! Heterogeneous signals (explicit ratings, implicit behavior, system
//! metrics) are normalized onto a common `[0, 1]` scale (higher is
//! better for the system), time-decayed, and blended into one composite
//! score with a self-assessed confidence.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::TaskCategory;
use crate::persist;
use crate::runtime::{BlobStore, Clock, ThermalState};

const STATE_KEY: &str = "feedback.state";
const STATE_VERSION: u32 = 1;

/// Signal category. Category weights decide how much each family moves
/// the composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedbackCategory {
    Explicit,
    Implicit,
    System,
}

/// Closed enumeration of every signal the aggregator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedbackSource {
    // Explicit
    ExplicitRating,
    ThumbsUp,
    ThumbsDown,
    ModelOverride,
    // Implicit
    Regeneration,
    ContinuedConversation,
    Abandonment,
    EditBeforeSend,
    CopyContent,
    ShareContent,
    SessionDuration,
    FollowUpQuestion,
    // System
    ResponseLatency,
    TaskError,
    TaskSuccess,
    MemoryPressure,
    ThermalEvent,
}

pub const ALL_SOURCES: [FeedbackSource; 17] = [
    FeedbackSource::ExplicitRating,
    FeedbackSource::ThumbsUp,
    FeedbackSource::ThumbsDown,
    FeedbackSource::ModelOverride,
    FeedbackSource::Regeneration,
    FeedbackSource::ContinuedConversation,
    FeedbackSource::Abandonment,
    FeedbackSource::EditBeforeSend,
    FeedbackSource::CopyContent,
    FeedbackSource::ShareContent,
    FeedbackSource::SessionDuration,
    FeedbackSource::FollowUpQuestion,
    FeedbackSource::ResponseLatency,
    FeedbackSource::TaskError,
    FeedbackSource::TaskSuccess,
    FeedbackSource::MemoryPressure,
    FeedbackSource::ThermalEvent,
];

impl FeedbackSource {
    pub fn category(self) -> FeedbackCategory {
        use FeedbackSource::*;
        match self {
            ExplicitRating | ThumbsUp | ThumbsDown | ModelOverride => FeedbackCategory::Explicit,
            Regeneration | ContinuedConversation | Abandonment | EditBeforeSend | CopyContent
            | ShareContent | SessionDuration | FollowUpQuestion => FeedbackCategory::Implicit,
            ResponseLatency | TaskError | TaskSuccess | MemoryPressure | ThermalEvent => {
                FeedbackCategory::System
            }
        }
    }

    /// Starting weight before any weight learning.
    pub fn default_weight(self) -> f64 {
        use FeedbackSource::*;
        match self {
            ExplicitRating => 1.0,
            ThumbsUp | ThumbsDown => 0.9,
            ModelOverride => 0.8,
            Regeneration | Abandonment | ShareContent => 0.7,
            ContinuedConversation | CopyContent => 0.6,
            EditBeforeSend | SessionDuration | FollowUpQuestion => 0.5,
            ResponseLatency => 0.9,
            TaskError => 1.0,
            TaskSuccess => 0.9,
            MemoryPressure | ThermalEvent => 0.8,
        }
    }

    /// Whether a larger raw observation is good news for the system.
    pub fn higher_is_better(self) -> bool {
        use FeedbackSource::*;
        !matches!(
            self,
            ThumbsDown
                | ModelOverride
                | Regeneration
                | Abandonment
                | EditBeforeSend
                | ResponseLatency
                | TaskError
                | MemoryPressure
                | ThermalEvent
        )
    }

    pub fn default_confidence(self) -> f64 {
        use FeedbackSource::*;
        match self {
            ExplicitRating | TaskError => 1.0,
            ThumbsUp | ThumbsDown | TaskSuccess => 0.9,
            ModelOverride => 0.95,
            Regeneration | ResponseLatency | MemoryPressure | ThermalEvent => 0.8,
            Abandonment | EditBeforeSend | ShareContent => 0.7,
            ContinuedConversation | CopyContent => 0.6,
            SessionDuration | FollowUpQuestion => 0.5,
        }
    }
}

/// Where a signal came from. All fields optional; indexing uses model and
/// conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackContext {
    pub model: Option<String>,
    pub task: Option<TaskCategory>,
    pub conversation: Option<String>,
    pub message: Option<String>,
    pub session: Option<String>,
}

impl FeedbackContext {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }
}

/// One immutable signal observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub source: FeedbackSource,
    pub raw_value: f64,
    /// `[0, 1]`, higher is better for the system.
    pub normalized: f64,
    pub confidence: f64,
    pub timestamp: u64,
    pub context: FeedbackContext,
}

/// Result of aggregating an event set.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedFeedback {
    pub composite: f64,
    pub confidence: f64,
    pub contributing: usize,
    pub by_source: HashMap<FeedbackSource, f64>,
    pub by_category: HashMap<FeedbackCategory, f64>,
}

impl AggregatedFeedback {
    /// Neutral result for an empty event set.
    fn neutral() -> Self {
        Self {
            composite: 0.5,
            confidence: 0.0,
            contributing: 0,
            by_source: HashMap::new(),
            by_category: HashMap::new(),
        }
    }
}

/// Typed statistics export.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStatistics {
    pub total_events: usize,
    pub explicit_events: usize,
    pub implicit_events: usize,
    pub system_events: usize,
    pub tracked_models: usize,
    pub tracked_conversations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    pub capacity: usize,
    pub half_life_secs: u64,
    pub explicit_weight: f64,
    pub implicit_weight: f64,
    pub system_weight: f64,
    pub persist_every: u32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            half_life_secs: 7 * 24 * 3600,
            explicit_weight: 0.5,
            implicit_weight: 0.3,
            system_weight: 0.2,
            persist_every: 100,
        }
    }
}

impl FeedbackConfig {
    fn category_weight(&self, category: FeedbackCategory) -> f64 {
        match category {
            FeedbackCategory::Explicit => self.explicit_weight,
            FeedbackCategory::Implicit => self.implicit_weight,
            FeedbackCategory::System => self.system_weight,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FeedbackState {
    events: Vec<FeedbackEvent>,
    source_weights: HashMap<FeedbackSource, f64>,
}

/// The aggregator. Serialized actor: one owner, `&mut self` operations.
pub struct FeedbackAggregator {
    config: FeedbackConfig,
    events: Vec<FeedbackEvent>,
    by_model: HashMap<String, Vec<usize>>,
    by_conversation: HashMap<String, Vec<usize>>,
    source_weights: HashMap<FeedbackSource, f64>,
    records_since_persist: u32,
    dirty: bool,
    clock: Arc<dyn Clock>,
    store: Arc<dyn BlobStore>,
}

impl FeedbackAggregator {
    pub fn new(config: FeedbackConfig, clock: Arc<dyn Clock>, store: Arc<dyn BlobStore>) -> Self {
        let state: FeedbackState =
            persist::load(store.as_ref(), STATE_KEY, STATE_VERSION).unwrap_or_default();
        let mut aggregator = Self {
            config,
            events: state.events,
            by_model: HashMap::new(),
            by_conversation: HashMap::new(),
            source_weights: default_weights(),
            records_since_persist: 0,
            dirty: false,
            clock,
            store,
        };
        for (source, weight) in state.source_weights {
            aggregator.source_weights.insert(source, weight);
        }
        aggregator.rebuild_indexes();
        aggregator
    }

    /// Append an event. Out-of-range fields are clamped, never rejected.
    pub fn record(&mut self, mut event: FeedbackEvent) {
        event.normalized = event.normalized.clamp(0.0, 1.0);
        event.confidence = event.confidence.clamp(0.0, 1.0);

        if self.events.len() >= self.config.capacity {
            self.trim_oldest_half();
        }

        let idx = self.events.len();
        if let Some(model) = &event.context.model {
            self.by_model.entry(model.clone()).or_default().push(idx);
        }
        if let Some(conversation) = &event.context.conversation {
            self.by_conversation
                .entry(conversation.clone())
                .or_default()
                .push(idx);
        }
        self.events.push(event);

        self.records_since_persist += 1;
        if self.records_since_persist >= self.config.persist_every || self.dirty {
            self.flush();
        }
    }

    /// Star-style rating `rating / max`, full confidence.
    pub fn record_rating(&mut self, rating: u32, max: u32, context: FeedbackContext) {
        let max = max.max(1);
        self.record_with(
            FeedbackSource::ExplicitRating,
            rating as f64,
            rating as f64 / max as f64,
            1.0,
            context,
        );
    }

    pub fn record_thumbs(&mut self, up: bool, context: FeedbackContext) {
        let source = if up {
            FeedbackSource::ThumbsUp
        } else {
            FeedbackSource::ThumbsDown
        };
        self.record_with(source, if up { 1.0 } else { 0.0 }, if up { 1.0 } else { 0.0 }, 0.9, context);
    }

    /// Piecewise latency curve: under a second is perfect, one to three
    /// seconds drifts to 0.7, three to ten seconds falls to 0.15, beyond
    /// ten seconds decays linearly to a 0.1 floor.
    pub fn record_latency(&mut self, latency_ms: f64, context: FeedbackContext) {
        let ms = latency_ms.max(0.0);
        let normalized = if ms < 1_000.0 {
            1.0
        } else if ms < 3_000.0 {
            1.0 - 0.3 * (ms - 1_000.0) / 2_000.0
        } else if ms < 10_000.0 {
            0.7 - 0.55 * (ms - 3_000.0) / 7_000.0
        } else {
            (0.15 - 0.05 * (ms - 10_000.0) / 10_000.0).max(0.1)
        };
        self.record_with(FeedbackSource::ResponseLatency, ms, normalized, 0.8, context);
    }

    pub fn record_regeneration(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::Regeneration, 1.0, 0.2, 0.8, context);
    }

    pub fn record_continuation(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::ContinuedConversation, 1.0, 0.7, 0.6, context);
    }

    pub fn record_abandonment(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::Abandonment, 1.0, 0.15, 0.7, context);
    }

    pub fn record_override(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::ModelOverride, 1.0, 0.25, 0.95, context);
    }

    pub fn record_error(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::TaskError, 1.0, 0.0, 1.0, context);
    }

    pub fn record_success(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::TaskSuccess, 1.0, 0.9, 0.9, context);
    }

    pub fn record_edit(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::EditBeforeSend, 1.0, 0.3, 0.7, context);
    }

    pub fn record_copy(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::CopyContent, 1.0, 0.8, 0.6, context);
    }

    pub fn record_share(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::ShareContent, 1.0, 0.9, 0.7, context);
    }

    pub fn record_session_duration(&mut self, secs: u64, context: FeedbackContext) {
        let normalized = (secs as f64 / 1_800.0).min(1.0);
        self.record_with(FeedbackSource::SessionDuration, secs as f64, normalized, 0.5, context);
    }

    pub fn record_follow_up(&mut self, context: FeedbackContext) {
        self.record_with(FeedbackSource::FollowUpQuestion, 1.0, 0.6, 0.5, context);
    }

    pub fn record_memory_pressure(&mut self, pressure: f64, context: FeedbackContext) {
        let p = pressure.clamp(0.0, 1.0);
        self.record_with(FeedbackSource::MemoryPressure, p, 1.0 - p, 0.8, context);
    }

    pub fn record_thermal(&mut self, thermal: ThermalState, context: FeedbackContext) {
        let normalized = match thermal {
            ThermalState::Nominal => 1.0,
            ThermalState::Fair => 0.7,
            ThermalState::Serious => 0.3,
            ThermalState::Critical => 0.1,
        };
        self.record_with(FeedbackSource::ThermalEvent, normalized, normalized, 0.8, context);
    }

    fn record_with(
        &mut self,
        source: FeedbackSource,
        raw_value: f64,
        normalized: f64,
        confidence: f64,
        context: FeedbackContext,
    ) {
        let timestamp = self.clock.now();
        self.record(FeedbackEvent {
            source,
            raw_value,
            normalized,
            confidence,
            timestamp,
            context,
        });
    }

    pub fn aggregate_for_model(&self, model: &str) -> AggregatedFeedback {
        match self.by_model.get(model) {
            Some(indexes) => self.aggregate(indexes.iter().filter_map(|&i| self.events.get(i))),
            None => AggregatedFeedback::neutral(),
        }
    }

    pub fn aggregate_for_conversation(&self, conversation: &str) -> AggregatedFeedback {
        match self.by_conversation.get(conversation) {
            Some(indexes) => self.aggregate(indexes.iter().filter_map(|&i| self.events.get(i))),
            None => AggregatedFeedback::neutral(),
        }
    }

    pub fn aggregate_all(&self) -> AggregatedFeedback {
        self.aggregate(self.events.iter())
    }

    /// The decay-weighted blend. Per event:
    /// `w = source_weight * confidence * 0.5^(age / half_life)`; per-source
    /// and per-category scores are `Σ(w * normalized) / Σ w`; the composite
    /// is the category-weighted mean of category scores.
    fn aggregate<'a>(&self, events: impl Iterator<Item = &'a FeedbackEvent>) -> AggregatedFeedback {
        let now = self.clock.now();
        let half_life = self.config.half_life_secs.max(1) as f64;

        let mut source_w: HashMap<FeedbackSource, (f64, f64)> = HashMap::new();
        let mut category_w: HashMap<FeedbackCategory, (f64, f64)> = HashMap::new();
        let mut count = 0usize;
        let mut age_sum = 0.0;

        for event in events {
            let age = now.saturating_sub(event.timestamp) as f64;
            let decay = 0.5_f64.powf(age / half_life);
            let weight = self.weight_of(event.source) * event.confidence * decay;
            if weight <= 0.0 {
                continue;
            }

            let entry = source_w.entry(event.source).or_insert((0.0, 0.0));
            entry.0 += weight;
            entry.1 += weight * event.normalized;

            let entry = category_w.entry(event.source.category()).or_insert((0.0, 0.0));
            entry.0 += weight;
            entry.1 += weight * event.normalized;

            count += 1;
            age_sum += age;
        }

        if count == 0 {
            return AggregatedFeedback::neutral();
        }

        let by_source: HashMap<FeedbackSource, f64> = source_w
            .into_iter()
            .map(|(s, (w, wv))| (s, wv / w))
            .collect();
        let by_category: HashMap<FeedbackCategory, f64> = category_w
            .into_iter()
            .map(|(c, (w, wv))| (c, wv / w))
            .collect();

        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (category, score) in &by_category {
            let w = self.config.category_weight(*category);
            weighted += w * score;
            weight_sum += w;
        }
        let composite = if weight_sum > 0.0 {
            weighted / weight_sum
        } else {
            0.5
        };

        let avg_age = age_sum / count as f64;
        let confidence = 0.6 * (count as f64 / 25.0).min(1.0)
            + 0.4 * (1.0 - avg_age / (2.0 * half_life)).max(0.0);

        AggregatedFeedback {
            composite: composite.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            contributing: count,
            by_source,
            by_category,
        }
    }

    /// Nudge per-source weights toward agreement with a ground-truth
    /// outcome. Clamped to `[0.01, 2.0]`.
    pub fn update_weights(&mut self, ground_truth: f64, events: &[FeedbackEvent]) {
        let truth = ground_truth.clamp(0.0, 1.0);
        for event in events {
            let weight = self.source_weights.entry(event.source).or_insert_with(|| {
                event.source.default_weight()
            });
            *weight += 0.01 * (truth - event.normalized) * event.confidence;
            *weight = weight.clamp(0.01, 2.0);
        }
        self.dirty = true;
    }

    pub fn weight_of(&self, source: FeedbackSource) -> f64 {
        self.source_weights
            .get(&source)
            .copied()
            .unwrap_or_else(|| source.default_weight())
    }

    pub fn statistics(&self) -> FeedbackStatistics {
        let count_in = |category: FeedbackCategory| {
            self.events
                .iter()
                .filter(|e| e.source.category() == category)
                .count()
        };
        FeedbackStatistics {
            total_events: self.events.len(),
            explicit_events: count_in(FeedbackCategory::Explicit),
            implicit_events: count_in(FeedbackCategory::Implicit),
            system_events: count_in(FeedbackCategory::System),
            tracked_models: self.by_model.len(),
            tracked_conversations: self.by_conversation.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Write the state blob now. Clears the dirty flag on success.
    pub fn flush(&mut self) {
        let state = FeedbackState {
            events: self.events.clone(),
            source_weights: self.source_weights.clone(),
        };
        let ok = persist::save(self.store.as_ref(), STATE_KEY, STATE_VERSION, &state);
        self.dirty = !ok;
        if ok {
            self.records_since_persist = 0;
        }
    }

    /// Drop all events and learned weights.
    pub fn reset(&mut self) {
        tracing::info!("feedback aggregator reset to defaults");
        self.events.clear();
        self.by_model.clear();
        self.by_conversation.clear();
        self.source_weights = default_weights();
        self.records_since_persist = 0;
        self.flush();
    }

    fn trim_oldest_half(&mut self) {
        let keep_from = self.events.len() / 2;
        self.events.drain(..keep_from);
        self.rebuild_indexes();
    }

    fn rebuild_indexes(&mut self) {
        self.by_model.clear();
        self.by_conversation.clear();
        for (idx, event) in self.events.iter().enumerate() {
            if let Some(model) = &event.context.model {
                self.by_model.entry(model.clone()).or_default().push(idx);
            }
            if let Some(conversation) = &event.context.conversation {
                self.by_conversation
                    .entry(conversation.clone())
                    .or_default()
                    .push(idx);
            }
        }
    }
}

fn default_weights() -> HashMap<FeedbackSource, f64> {
    ALL_SOURCES
        .iter()
        .map(|&s| (s, s.default_weight()))
        .collect()
}
