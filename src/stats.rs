//! Global cache counters.
//!
//! One atomic per event class, sampled into a plain snapshot for
//! monitoring endpoints and tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide event counters for one [`crate::cache::PlanCache`].
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub lookups: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub recompiles: AtomicU64,
    pub failed_recompiles: AtomicU64,
    pub deletes: AtomicU64,
    pub fixes: AtomicU64,
    pub unfixes: AtomicU64,
    pub cleanups: AtomicU64,
    /// Discoverable entries currently linked in the table.
    pub live_entries: AtomicI64,
}

impl CacheCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            recompiles: self.recompiles.load(Ordering::Relaxed),
            failed_recompiles: self.failed_recompiles.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            fixes: self.fixes.load(Ordering::Relaxed),
            unfixes: self.unfixes.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
            live_entries: self.live_entries.load(Ordering::Relaxed).max(0) as u64,
        }
    }

    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CountersSnapshot {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub recompiles: u64,
    pub failed_recompiles: u64,
    pub deletes: u64,
    pub fixes: u64,
    pub unfixes: u64,
    pub cleanups: u64,
    pub live_entries: u64,
}

impl CountersSnapshot {
    /// Hit rate over all lookups (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
