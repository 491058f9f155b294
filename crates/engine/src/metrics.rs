//! Counters for external metrics emission.
//!
//! The engine only counts; a host reads [`EngineSnapshot`] and exports it
//! however it likes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::CacheSnapshot;
use crate::quota::QuotaSnapshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub dispatched: u64,
    pub total_bytes: u64,
    pub largest_bytes: u64,
    /// Extra batches a submission needed beyond its first
    pub splits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub quota: QuotaSnapshot,
    pub cache: CacheSnapshot,
    pub batches: BatchStats,
    /// "OK" or an error code, to count
    pub outcomes: BTreeMap<String, u64>,
}

#[derive(Default)]
pub struct Metrics {
    dispatched: AtomicU64,
    total_bytes: AtomicU64,
    largest_bytes: AtomicU64,
    splits: AtomicU64,
    outcomes: Mutex<BTreeMap<&'static str, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_dispatched(&self, bytes: usize) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.largest_bytes.fetch_max(bytes as u64, Ordering::Relaxed);
    }

    pub fn batches_split(&self, extra: usize) {
        if extra > 0 {
            self.splits.fetch_add(extra as u64, Ordering::Relaxed);
        }
    }

    pub fn outcome(&self, label: &'static str) {
        *self.outcomes.lock().entry(label).or_insert(0) += 1;
    }

    pub fn batches(&self) -> BatchStats {
        BatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            largest_bytes: self.largest_bytes.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
        }
    }

    pub fn outcomes(&self) -> BTreeMap<String, u64> {
        self.outcomes.lock().iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }
}
