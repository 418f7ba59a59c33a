//! Governance event queue.
//!
//! Consumers that want push-style visibility into governance activity
//! drain this bounded lock-free queue; the orchestrator never blocks on
//! it. A full queue reports `Full` and the event is counted as dropped
//! rather than silently lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Event types emitted across a governance cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GovernanceEventKind {
    CycleStarted,
    CycleCompleted,
    DecisionApplied,
    StrategySwitched,
    RollbackPerformed,
    CheckpointCreated,
    DegradedEntered,
    DegradedExited,
    Paused,
    Resumed,
}

/// One governance event with its cycle correlation.
#[derive(Clone, Debug)]
pub struct GovernanceEvent {
    pub kind: GovernanceEventKind,
    pub timestamp: u64,
    pub cycle: u64,
    pub detail: String,
}

impl GovernanceEvent {
    pub fn new(kind: GovernanceEventKind, timestamp: u64, cycle: u64) -> Self {
        Self {
            kind,
            timestamp,
            cycle,
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Result of an enqueue attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueResult {
    Ok,
    /// Queue above 80% capacity; consumers are falling behind.
    HighWaterMark,
    Full,
}

/// Bounded lock-free event queue.
pub struct AuditQueue {
    queue: Arc<ArrayQueue<GovernanceEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl AuditQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, event: GovernanceEvent) -> EnqueueResult {
        if self.queue.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return EnqueueResult::Full;
        }
        if self.queue.len() * 5 >= self.capacity * 4 {
            EnqueueResult::HighWaterMark
        } else {
            EnqueueResult::Ok
        }
    }

    pub fn pop(&self) -> Option<GovernanceEvent> {
        self.queue.pop()
    }

    /// Drain everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<GovernanceEvent> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        events
    }

    /// Shared handle for an external consumer thread.
    pub fn handle(&self) -> Arc<ArrayQueue<GovernanceEvent>> {
        Arc::clone(&self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
