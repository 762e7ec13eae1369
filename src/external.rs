//! External collaborator contracts.
//!
//! The cache treats the SQL compiler, the plan (de)serializer, the
//! statistics collector, and the companion result cache as black boxes
//! behind these traits. Nothing in this crate implements SQL semantics;
//! these seams are where the surrounding engine plugs in.

use std::sync::Arc;

use crate::error::CacheResult;
use crate::plan::{ExecutablePlan, PlanArena, SerializedPlan};

/// Page-count estimates from the statistics subsystem.
///
/// The cache only consumes the output of statistics collection: a current
/// page-count estimate per catalog object, plus a channel to push back the
/// value it observed so the collector stays in sync.
pub trait StatisticsSource: Send + Sync {
    /// Current estimated page count for a catalog object.
    fn current_page_count(&self, object_id: u64) -> i64;

    /// Notify the collector that the cache refreshed its stored estimate.
    fn updated_cardinality(&self, object_id: u64, pages: i64);
}

/// Byte-stream plan (de)serializer.
///
/// `deserialize` produces a runtime tree together with its private arena;
/// the two halves live and die as a pair.
pub trait PlanCodec: Send + Sync {
    fn deserialize(&self, buffer: &SerializedPlan) -> CacheResult<(ExecutablePlan, PlanArena)>;
}

/// Handle into the companion result cache attached to a plan entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResultCacheHandle(pub u64);

/// Predicate handed to the result-cache hook at construction: true while
/// the plan entry behind a handle is still discoverable through the plan
/// table.
pub type ReachabilityProbe = Arc<dyn Fn(ResultCacheHandle) -> bool + Send + Sync>;

/// Companion result-cache notifications.
///
/// On entry deletion the cache manager invalidates the entry's result rows
/// before releasing the payload.
pub trait ResultCacheHook: Send + Sync {
    fn invalidate(&self, handle: ResultCacheHandle);

    /// Receive the owning cache's reachability predicate. The hook may
    /// call it while scanning its own entries to ask whether the plan
    /// behind a handle can still be reached through the plan table.
    fn attach_reachability(&self, _reachable: ReachabilityProbe) {}
}

/// No-op result-cache hook for deployments without a result cache.
#[derive(Debug, Default)]
pub struct NoResultCache;

impl ResultCacheHook for NoResultCache {
    fn invalidate(&self, _handle: ResultCacheHandle) {}
}

/// Trivial codec: the executable plan and arena mirror the serialized
/// bytes. Sufficient for tests and for engines that execute directly from
/// the flat buffer.
#[derive(Debug, Default)]
pub struct IdentityCodec;

impl PlanCodec for IdentityCodec {
    fn deserialize(&self, buffer: &SerializedPlan) -> CacheResult<(ExecutablePlan, PlanArena)> {
        Ok((
            ExecutablePlan {
                repr: buffer.0.clone(),
            },
            PlanArena {
                storage: Vec::with_capacity(buffer.len()),
            },
        ))
    }
}

/// Statistics source backed by a fixed table of page counts. Intended for
/// tests; production engines adapt their statistics manager instead.
#[derive(Debug, Default)]
pub struct FixedPageCounts {
    counts: dashmap::DashMap<u64, i64>,
}

impl FixedPageCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, object_id: u64, pages: i64) {
        self.counts.insert(object_id, pages);
    }
}

impl StatisticsSource for FixedPageCounts {
    fn current_page_count(&self, object_id: u64) -> i64 {
        self.counts.get(&object_id).map_or(0, |v| *v)
    }

    fn updated_cardinality(&self, object_id: u64, pages: i64) {
        self.counts.insert(object_id, pages);
    }
}
