//! Task/time/resource context for model selection.
//!
//! The bandit keys its per-context statistics on the hash of this tuple.
//! Detection heuristics are deliberately cheap keyword matchers; they run
//! on every query.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Broad task families. Closed set; `detect_from_query` maps free text
/// onto it, falling back to `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskCategory {
    CodeGeneration,
    CodeReview,
    Debugging,
    Explanation,
    Translation,
    Summarization,
    CreativeWriting,
    TechnicalWriting,
    QuestionAnswering,
    MathReasoning,
    DataAnalysis,
    Planning,
    Research,
    Brainstorming,
    Conversation,
    General,
}

impl TaskCategory {
    /// Keyword heuristic. First match wins, so more specific families are
    /// checked before broader ones.
    pub fn detect_from_query(query: &str) -> TaskCategory {
        let q = query.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| q.contains(w));

        if has(&["debug", "stack trace", "error message", "crash", "exception"]) {
            TaskCategory::Debugging
        } else if has(&["review this code", "code review", "review my pr"]) {
            TaskCategory::CodeReview
        } else if has(&["write a function", "implement", "write code", "refactor", "fn ", "class "])
        {
            TaskCategory::CodeGeneration
        } else if has(&["translate", "in french", "in spanish", "in german", "in japanese"]) {
            TaskCategory::Translation
        } else if has(&["summarize", "summary", "tl;dr", "key points"]) {
            TaskCategory::Summarization
        } else if has(&["poem", "story", "fiction", "lyrics", "screenplay"]) {
            TaskCategory::CreativeWriting
        } else if has(&["documentation", "readme", "design doc", "spec for"]) {
            TaskCategory::TechnicalWriting
        } else if has(&["prove", "solve", "equation", "integral", "derivative", "calculate"]) {
            TaskCategory::MathReasoning
        } else if has(&["dataset", "csv", "analyze the data", "correlation", "chart"]) {
            TaskCategory::DataAnalysis
        } else if has(&["plan", "roadmap", "milestones", "schedule"]) {
            TaskCategory::Planning
        } else if has(&["research", "compare sources", "literature"]) {
            TaskCategory::Research
        } else if has(&["brainstorm", "ideas for", "come up with"]) {
            TaskCategory::Brainstorming
        } else if has(&["explain", "what does", "how does", "why does"]) {
            TaskCategory::Explanation
        } else if has(&["?"]) {
            TaskCategory::QuestionAnswering
        } else if q.split_whitespace().count() <= 6 {
            TaskCategory::Conversation
        } else {
            TaskCategory::General
        }
    }
}

/// Coarse time-of-day bucket. `from_hour` uses local hour 0..23.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeCluster {
    Night,        // 0..5
    EarlyMorning, // 5..8
    Morning,      // 8..12
    Afternoon,    // 12..17
    Evening,      // 17..21
    LateNight,    // 21..24
}

impl TimeCluster {
    pub fn from_hour(hour: u8) -> TimeCluster {
        match hour {
            0..=4 => TimeCluster::Night,
            5..=7 => TimeCluster::EarlyMorning,
            8..=11 => TimeCluster::Morning,
            12..=16 => TimeCluster::Afternoon,
            17..=20 => TimeCluster::Evening,
            _ => TimeCluster::LateNight,
        }
    }
}

/// Memory headroom bucket, thresholded on available GB. The hot/critical
/// thresholds are tuner-managed knobs; the defaults here match their
/// default values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceTier {
    Abundant,
    Comfortable,
    Constrained,
    Critical,
}

impl ResourceTier {
    pub fn from_available_gb(available_gb: f64, hot_gb: f64, critical_gb: f64) -> ResourceTier {
        if available_gb >= 2.0 * hot_gb {
            ResourceTier::Abundant
        } else if available_gb >= hot_gb {
            ResourceTier::Comfortable
        } else if available_gb >= critical_gb {
            ResourceTier::Constrained
        } else {
            ResourceTier::Critical
        }
    }
}

impl Default for ResourceTier {
    fn default() -> Self {
        ResourceTier::Comfortable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UrgencyLevel {
    Low,
    Normal,
    High,
    Critical,
}

impl UrgencyLevel {
    pub fn detect(query: &str) -> UrgencyLevel {
        let q = query.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| q.contains(w));
        if has(&["urgent", "asap", "immediately", "right now", "emergency"]) {
            UrgencyLevel::Critical
        } else if has(&["quick", "quickly", "fast", "soon", "hurry"]) {
            UrgencyLevel::High
        } else if has(&["whenever", "no rush", "no hurry", "eventually"]) {
            UrgencyLevel::Low
        } else {
            UrgencyLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl ComplexityLevel {
    /// Length plus structure keywords. Long multi-part prompts with
    /// architectural vocabulary read as very complex.
    pub fn detect(query: &str) -> ComplexityLevel {
        let q = query.to_lowercase();
        let words = q.split_whitespace().count();
        let has = |needles: &[&str]| needles.iter().any(|w| q.contains(w));

        let hard_vocabulary = has(&[
            "architecture",
            "distributed",
            "formally",
            "end-to-end",
            "trade-offs",
            "concurrency",
        ]);
        if words > 120 || (words > 60 && hard_vocabulary) {
            ComplexityLevel::VeryComplex
        } else if words > 60 || hard_vocabulary {
            ComplexityLevel::Complex
        } else if words > 15 {
            ComplexityLevel::Moderate
        } else {
            ComplexityLevel::Simple
        }
    }
}

/// The tuple the bandit conditions on. Recent tasks are capped at three,
/// newest last.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Context {
    pub task: TaskCategory,
    pub time: TimeCluster,
    pub resources: ResourceTier,
    pub recent_tasks: SmallVec<[TaskCategory; 3]>,
    pub urgency: UrgencyLevel,
    pub complexity: ComplexityLevel,
}

impl Context {
    pub fn new(task: TaskCategory) -> Self {
        Self {
            task,
            time: TimeCluster::Afternoon,
            resources: ResourceTier::default(),
            recent_tasks: SmallVec::new(),
            urgency: UrgencyLevel::Normal,
            complexity: ComplexityLevel::Moderate,
        }
    }

    pub fn with_time(mut self, time: TimeCluster) -> Self {
        self.time = time;
        self
    }

    pub fn with_resources(mut self, resources: ResourceTier) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_urgency(mut self, urgency: UrgencyLevel) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_complexity(mut self, complexity: ComplexityLevel) -> Self {
        self.complexity = complexity;
        self
    }

    /// Push a task into the recent-task window, evicting the oldest past
    /// three.
    pub fn push_recent(&mut self, task: TaskCategory) {
        if self.recent_tasks.len() == 3 {
            self.recent_tasks.remove(0);
        }
        self.recent_tasks.push(task);
    }

    /// Stable 64-bit key for statistics bucketing.
    pub fn key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}
