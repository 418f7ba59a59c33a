//! Injected runtime capabilities.
//!
//! Every boundary the core touches (time, randomness, persistence,
//! resource observation) is a trait object handed in at construction.
//! Tests inject `ManualClock` / `SequenceRng` / `MemoryBlobStore` and get
//! fully deterministic runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{Rng as _, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

/// Wall-clock capability. All timestamps are whole seconds since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;

    /// Hour of day for a timestamp, 0..23. UTC by default.
    fn hour_of(&self, timestamp: u64) -> u8 {
        ((timestamp / 3600) % 24) as u8
    }
}

/// Production clock backed by `SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Settable clock for tests. Shared via `Arc`, advanced explicitly.
#[derive(Debug)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    pub fn new(secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(secs),
        }
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}

/// Uniform randomness capability: `uniform()` yields `f64` in `[0, 1)`.
pub trait Rng: Send {
    fn uniform(&mut self) -> f64;
}

/// Production RNG: ChaCha8 seeded from a `u64` for reproducible runs.
#[derive(Debug)]
pub struct SeededRng {
    inner: ChaCha8Rng,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Rng for SeededRng {
    fn uniform(&mut self) -> f64 {
        self.inner.random::<f64>()
    }
}

/// Replays a fixed tape of uniforms, cycling when exhausted. Test-only in
/// spirit, but kept public so downstream crates can script decisions.
#[derive(Debug)]
pub struct SequenceRng {
    tape: Vec<f64>,
    pos: usize,
}

impl SequenceRng {
    pub fn new(tape: Vec<f64>) -> Self {
        Self { tape, pos: 0 }
    }
}

impl Rng for SequenceRng {
    fn uniform(&mut self) -> f64 {
        if self.tape.is_empty() {
            return 0.5;
        }
        let v = self.tape[self.pos % self.tape.len()];
        self.pos += 1;
        v.clamp(0.0, 0.999_999_999)
    }
}

/// Errors surfaced by a blob store write. Reads never fail: a missing or
/// unreadable blob is simply `None`.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("blob store rejected write for key `{key}`: {detail}")]
    Write { key: String, detail: String },
}

/// Namespaced key/value persistence capability.
///
/// Writes are last-write-wins per key; the store is internally
/// synchronized. Components treat a failed `put` as retryable at the next
/// persistence cadence and never propagate it to callers.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
}

/// In-memory store. The production host supplies its own implementation;
/// this one backs tests and the sim harness.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .ok()
            .and_then(|map| map.get(key).cloned())
    }

    fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        match self.blobs.write() {
            Ok(mut map) => {
                map.insert(key.to_string(), bytes);
                Ok(())
            }
            Err(_) => Err(StoreError::Write {
                key: key.to_string(),
                detail: "store lock poisoned".to_string(),
            }),
        }
    }
}

/// Thermal pressure as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// Point-in-time view of host resources. May be stale up to one cycle.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub available_memory_gb: f64,
    pub total_memory_gb: f64,
    pub available_disk_gb: f64,
    pub thermal: ThermalState,
}

impl ResourceSnapshot {
    /// Fraction of memory in use, in `[0, 1]`.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_gb <= 0.0 {
            return 0.0;
        }
        (1.0 - self.available_memory_gb / self.total_memory_gb).clamp(0.0, 1.0)
    }
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            available_memory_gb: 8.0,
            total_memory_gb: 16.0,
            available_disk_gb: 100.0,
            thermal: ThermalState::Nominal,
        }
    }
}

/// Read-only resource observation capability.
pub trait ResourceProbe: Send {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Probe returning a fixed snapshot. Tests mutate between cycles by
/// swapping the probe out.
#[derive(Debug, Default)]
pub struct StaticProbe {
    pub snapshot: ResourceSnapshot,
}

impl StaticProbe {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self { snapshot }
    }
}

impl ResourceProbe for StaticProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        self.snapshot
    }
}
