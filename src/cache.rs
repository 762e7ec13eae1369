//! The plan cache manager: the public protocol over the entry table.
//!
//! ## Architecture
//!
//! ```text
//! PlanCache (cheap-clone handle)
//!   `-- Arc<CacheInner>
//!         |-- PlanTable            (digest -> generations)
//!         |-- CacheCounters        (global event counters)
//!         |-- scratch EvictionHeap (reused across cleanups)
//!         |-- cleanup guard        (single-flight AtomicBool)
//!         `-- collaborators        (codec, statistics, result cache)
//! ```
//!
//! One `PlanCache` is constructed at server start and lives for the
//! process; sessions clone the handle. Every operation completes or
//! returns promptly: the only waiting anywhere is bounded CAS retries and
//! the busy-return cleanup guard.
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use plancache::{Config, PlanCache, Prepare};
//! use plancache::external::{FixedPageCounts, IdentityCodec, NoResultCache};
//! use plancache::plan::{PlanDigest, QueryText, SerializedPlan};
//!
//! let cache = PlanCache::new(
//!     Config::default(),
//!     Arc::new(IdentityCodec),
//!     Arc::new(FixedPageCounts::new()),
//!     Arc::new(NoResultCache),
//! ).unwrap();
//!
//! let digest = PlanDigest::of("select * from t where k = ?");
//! assert!(matches!(cache.lookup_prepare(&digest), Prepare::Miss));
//!
//! let text = QueryText {
//!     hashed: "select * from t where k = ?".to_string(),
//!     ..Default::default()
//! };
//! let fixed = cache
//!     .insert(text, SerializedPlan(vec![1, 2, 3]), Vec::new(), false)
//!     .unwrap();
//! drop(fixed); // unfix
//!
//! assert!(matches!(cache.lookup_prepare(&digest), Prepare::Hit(_)));
//! ```

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::clones::PlanClone;
use crate::config::Config;
use crate::entry::{MarkDeleted, PlanEntry, Probe, Unfix};
use crate::error::{CacheError, CacheResult};
use crate::external::{PlanCodec, ResultCacheHandle, ResultCacheHook, StatisticsSource};
use crate::heap::EvictionHeap;
use crate::plan::{now_millis, PlanDigest, PlanKey, QueryText, RelatedObject, SerializedPlan};
use crate::recompile::{check_drift, DriftCheck};
use crate::stats::{CacheCounters, CountersSnapshot};
use crate::table::{InsertOutcome, PlanTable};

/// Attempts before the insert-or-recompile loop reports contention.
const MAX_RECOMPILE_ATTEMPTS: u32 = 32;

/// Scratch heap capacity preallocated at construction; larger eviction
/// batches fall back to a temporary heap.
const SCRATCH_HEAP_CAPACITY: usize = 256;

/// Outcome of a prepare-mode lookup.
pub enum Prepare {
    /// Cached plan, ready to use.
    Hit(FixedPlan),
    /// Cached plan is servable but stale: the caller must recompile and
    /// re-insert before executing.
    Recompile(FixedPlan),
    /// Nothing cached; compile and insert.
    Miss,
}

/// Why a cleanup pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupReason {
    /// Entry count exceeded the soft capacity.
    Full,
    /// Wall-clock interval since the last cleanup elapsed.
    Timeout,
}

/// An eviction candidate captured during a table scan.
#[derive(Clone)]
struct Candidate {
    last_used: u64,
    entry: Arc<PlanEntry>,
}

type CandidateCmp = fn(&Candidate, &Candidate) -> Ordering;

/// Oldest last-used sorts first, so the bounded reservoir retains the
/// least-recently-used candidates seen during the scan.
fn by_last_used(a: &Candidate, b: &Candidate) -> Ordering {
    a.last_used.cmp(&b.last_used)
}

struct CacheInner {
    config: Config,
    table: PlanTable,
    counters: CacheCounters,
    codec: Arc<dyn PlanCodec>,
    statistics: Arc<dyn StatisticsSource>,
    result_cache: Arc<dyn ResultCacheHook>,
    /// Single-flight guard: only one cleanup runs at a time.
    cleanup_running: AtomicBool,
    last_cleanup: AtomicU64,
    scratch_heap: Mutex<EvictionHeap<Candidate, CandidateCmp>>,
}

/// Process-wide compiled-plan cache. Cloning the handle shares the cache.
#[derive(Clone)]
pub struct PlanCache {
    inner: Arc<CacheInner>,
}

/// A fixed (reference-counted) hold on a cached plan.
///
/// The payload is guaranteed valid for the lifetime of this guard; dropping
/// it unfixes the entry, which may hand this thread the teardown of an
/// entry that went terminal while held.
pub struct FixedPlan {
    inner: Arc<CacheInner>,
    entry: Arc<PlanEntry>,
}

impl PlanCache {
    /// Build a cache from validated configuration and its collaborators.
    pub fn new(
        config: Config,
        codec: Arc<dyn PlanCodec>,
        statistics: Arc<dyn StatisticsSource>,
        result_cache: Arc<dyn ResultCacheHook>,
    ) -> CacheResult<Self> {
        config.validate()?;
        info!(
            capacity = config.cache.capacity,
            clone_pool_max = config.cache.clone_pool_max,
            "plan_cache_created"
        );
        let cache = PlanCache {
            inner: Arc::new(CacheInner {
                config,
                table: PlanTable::new(),
                counters: CacheCounters::default(),
                codec,
                statistics,
                result_cache,
                cleanup_running: AtomicBool::new(false),
                last_cleanup: AtomicU64::new(now_millis()),
                scratch_heap: Mutex::new(EvictionHeap::with_capacity(
                    SCRATCH_HEAP_CAPACITY,
                    by_last_used,
                )),
            }),
        };
        // Hand the result-cache hook its reachability predicate. Weak so
        // the hook outliving the cache does not keep the table alive.
        let weak = Arc::downgrade(&cache.inner);
        cache
            .inner
            .result_cache
            .attach_reachability(Arc::new(move |handle| {
                weak.upgrade().is_some_and(|inner| inner.reaches(handle))
            }));
        Ok(cache)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Prepare-mode lookup by statement digest.
    ///
    /// A hit on an entry flagged `RECOMPILE_REQUESTED` comes back as
    /// [`Prepare::Recompile`]: the plan is still servable, but the caller
    /// must compile a replacement and re-insert it.
    pub fn lookup_prepare(&self, digest: &PlanDigest) -> Prepare {
        let inner = &self.inner;
        inner.counters.bump(&inner.counters.lookups);
        match inner.table.find(digest, Probe::NONE) {
            Some(entry) => {
                inner.counters.bump(&inner.counters.fixes);
                inner.counters.bump(&inner.counters.hits);
                entry.record_hit();
                let fixed = FixedPlan {
                    inner: Arc::clone(inner),
                    entry,
                };
                if fixed.entry.is_recompile_requested() {
                    Prepare::Recompile(fixed)
                } else {
                    Prepare::Hit(fixed)
                }
            }
            None => {
                inner.counters.bump(&inner.counters.misses);
                Prepare::Miss
            }
        }
    }

    /// Execute-mode lookup by exact `(digest, stored_at)` key.
    ///
    /// An entry whose drift check fired is silently unfixed and reported
    /// as not found, steering the session into the recompile path without
    /// a separate control channel.
    pub fn lookup_execute(&self, key: &PlanKey) -> Option<FixedPlan> {
        let inner = &self.inner;
        inner.counters.bump(&inner.counters.lookups);
        match inner.table.find_by_key(key, Probe::NONE) {
            Some(entry) => {
                inner.counters.bump(&inner.counters.fixes);
                if entry.is_recompile_requested() {
                    inner.counters.bump(&inner.counters.misses);
                    inner.unfix_entry(&entry);
                    return None;
                }
                inner.counters.bump(&inner.counters.hits);
                entry.record_execution();
                Some(FixedPlan {
                    inner: Arc::clone(inner),
                    entry,
                })
            }
            None => {
                inner.counters.bump(&inner.counters.misses);
                None
            }
        }
    }

    /// Insert a freshly compiled plan, or return the entry that beat us to
    /// it. With `recompile` set, replace the existing generation instead:
    /// the old entry is flipped to `WAS_RECOMPILED` once the new one is
    /// discoverable, and the new one inherits the old `stored_at` so
    /// execute-mode handles keep matching.
    ///
    /// The returned guard holds the inserted (or found) entry fixed.
    pub fn insert(
        &self,
        text: QueryText,
        serialized: SerializedPlan,
        related: Vec<RelatedObject>,
        recompile: bool,
    ) -> CacheResult<FixedPlan> {
        let inner = &self.inner;
        let digest = PlanDigest::of(&text.hashed);
        let mut stored_at = now_millis();
        let mut probe = Probe::NONE;
        let mut old_to_flip: Option<Arc<PlanEntry>> = None;
        let mut attempts: u32 = 0;

        loop {
            let shell = Arc::new(PlanEntry::new(
                PlanKey::new(digest, stored_at),
                text.clone(),
                serialized.clone(),
                related.clone(),
                inner.config.cache.clone_pool_max,
            ));

            match inner.table.insert_if_absent(Arc::clone(&shell), probe) {
                InsertOutcome::Inserted => {
                    inner.counters.bump(&inner.counters.inserts);
                    inner.counters.bump(&inner.counters.fixes);
                    inner
                        .counters
                        .live_entries
                        .fetch_add(1, AtomicOrdering::Relaxed);
                    if let Some(old) = old_to_flip.take() {
                        // Replacement is durably published; retire the old
                        // generation for everyone who fixes after this.
                        old.finish_recompile();
                        inner.counters.bump(&inner.counters.recompiles);
                        debug!(plan = %digest, stored_at, "plan_recompiled");
                        inner.unfix_entry(&old);
                    } else {
                        debug!(plan = %digest, stored_at, "plan_inserted");
                    }
                    self.maybe_cleanup();
                    return Ok(FixedPlan {
                        inner: Arc::clone(inner),
                        entry: shell,
                    });
                }
                InsertOutcome::Found(existing) => {
                    // The shell was never linked; dropping our Arc frees it.
                    inner.counters.bump(&inner.counters.fixes);
                    if !recompile {
                        inner.counters.bump(&inner.counters.hits);
                        existing.record_hit();
                        return Ok(FixedPlan {
                            inner: Arc::clone(inner),
                            entry: existing,
                        });
                    }
                    // Keep key continuity across the replacement.
                    stored_at = existing.key().stored_at;
                    if existing.begin_recompile() {
                        // We own the transition; insert the replacement
                        // beside it, skipping the claimed generation.
                        old_to_flip = Some(existing);
                        probe = Probe::SKIP_RECOMPILING;
                        continue;
                    }
                    // Someone else is recompiling or deleting this
                    // generation; back off and retry the whole insert.
                    inner.counters.bump(&inner.counters.failed_recompiles);
                    inner.unfix_entry(&existing);
                    attempts += 1;
                    if attempts >= MAX_RECOMPILE_ATTEMPTS {
                        warn!(plan = %digest, attempts, "plan_recompile_contention");
                        return Err(CacheError::RecompileContention(digest.to_string()));
                    }
                    let jitter = rand::thread_rng().gen_range(10..100);
                    std::thread::sleep(Duration::from_micros(jitter));
                }
            }
        }
    }

    /// Mark every entry depending on `object_id` deleted (dropped table,
    /// altered index, revoked privilege). Entries with no current holders
    /// are torn down synchronously; the rest drain through their last
    /// unfix. Returns the number of entries invalidated.
    pub fn invalidate_object(&self, object_id: u64) -> usize {
        let inner = &self.inner;
        let mut victims = Vec::new();
        inner.table.for_each(|entry| {
            if entry
                .related_objects()
                .iter()
                .any(|o| o.object_id == object_id)
            {
                victims.push(Arc::clone(entry));
            }
        });

        let mut invalidated = 0;
        for entry in victims {
            match entry.mark_deleted() {
                MarkDeleted::SoleOwner => {
                    inner.teardown(&entry);
                    invalidated += 1;
                }
                MarkDeleted::Pending => invalidated += 1,
                MarkDeleted::AlreadyDeleted => {}
            }
        }
        if invalidated > 0 {
            info!(object_id, invalidated, "plans_invalidated_by_object");
        }
        invalidated
    }

    /// Drop every entry (shutdown, `ALTER SYSTEM FLUSH PLAN CACHE`).
    /// Held entries drain through their holders' unfixes.
    pub fn drop_all(&self) -> usize {
        let inner = &self.inner;
        let mut victims = Vec::new();
        inner.table.for_each(|entry| victims.push(Arc::clone(entry)));

        let mut dropped = 0;
        for entry in victims {
            match entry.mark_deleted() {
                MarkDeleted::SoleOwner => {
                    inner.teardown(&entry);
                    dropped += 1;
                }
                MarkDeleted::Pending => dropped += 1,
                MarkDeleted::AlreadyDeleted => {}
            }
        }
        info!(dropped, "plan_cache_dropped_all");
        dropped
    }

    /// Run a cleanup if a trigger condition holds and no other cleanup is
    /// already running. Returns the number of entries evicted.
    pub fn maybe_cleanup(&self) -> usize {
        let inner = &self.inner;
        let live = inner.counters.live_entries.load(AtomicOrdering::Relaxed);
        let live = usize::try_from(live).unwrap_or(0);
        let now = now_millis();
        let last = inner.last_cleanup.load(AtomicOrdering::Relaxed);
        let interval = inner.config.eviction.cleanup_interval_secs * 1000;

        let reason = if live > inner.config.cache.capacity {
            CleanupReason::Full
        } else if now.saturating_sub(last) >= interval {
            CleanupReason::Timeout
        } else {
            return 0;
        };

        // Busy-return, not a wait: concurrent callers skip the pass.
        if inner
            .cleanup_running
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return 0;
        }

        let evicted = match reason {
            CleanupReason::Full => inner.cleanup_full(live),
            CleanupReason::Timeout => inner.cleanup_timeout(now, interval),
        };

        inner.last_cleanup.store(now_millis(), AtomicOrdering::Relaxed);
        inner.counters.bump(&inner.counters.cleanups);
        inner.cleanup_running.store(false, AtomicOrdering::Release);
        info!(?reason, evicted, live_before = live, "plan_cache_cleanup");
        evicted
    }

    /// Diagnostic dump of every linked entry, for operational
    /// introspection only.
    pub fn dump(&self) -> String {
        let inner = &self.inner;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "plan cache: {} live / {} capacity",
            inner.counters.live_entries.load(AtomicOrdering::Relaxed),
            inner.config.cache.capacity
        );
        inner.table.for_each(|entry| {
            let _ = writeln!(
                out,
                "{} stored_at={} flags={:#018x} fixes={} hits={} execs={} clones={} last_used={}",
                entry.key().digest,
                entry.key().stored_at,
                entry.flags_word(),
                entry.fix_count(),
                entry.hit_count(),
                entry.execution_count(),
                entry.clones().len(),
                entry.last_used(),
            );
            for obj in entry.related_objects() {
                let _ = writeln!(
                    out,
                    "  object {} lock={:?} pages={}",
                    obj.object_id,
                    obj.lock_mode,
                    obj.page_count()
                );
            }
        });
        out
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.inner.counters.snapshot()
    }

    /// Discoverable-or-draining entries currently linked.
    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }
}

impl CacheInner {
    /// Drop one hold; on `LastOut` this thread owns the teardown.
    fn unfix_entry(&self, entry: &Arc<PlanEntry>) {
        self.counters.bump(&self.counters.unfixes);
        match entry.unfix() {
            Unfix::Remaining => {}
            Unfix::LastOut => self.teardown(entry),
        }
    }

    /// Unlink, invalidate companion results, release payload. Runs exactly
    /// once per entry: only the holder of the teardown sentinel gets here.
    fn teardown(&self, entry: &Arc<PlanEntry>) {
        if self.table.remove(entry) {
            self.counters.live_entries.fetch_sub(1, AtomicOrdering::Relaxed);
        }
        // Companion results go first: the hook may still read the entry's
        // payload while invalidating.
        if let Some(handle) = entry.take_result_cache_handle() {
            self.result_cache.invalidate(handle);
        }
        entry.release_payload();
        self.counters.bump(&self.counters.deletes);
        debug!(plan = %entry.key().digest, stored_at = entry.key().stored_at, "plan_entry_released");
    }

    /// Reachability predicate handed to the result-cache hook: a handle is
    /// reachable while a discoverable entry still points at it.
    fn reaches(&self, handle: ResultCacheHandle) -> bool {
        let mut found = false;
        self.table.for_each(|entry| {
            if !found
                && entry.is_discoverable()
                && entry.result_cache_handle() == Some(handle)
            {
                found = true;
            }
        });
        found
    }

    /// Capacity-pressure cleanup: bounded LRU selection over a full scan.
    fn cleanup_full(&self, live: usize) -> usize {
        let cfg = &self.config;
        let overage = live.saturating_sub(cfg.cache.capacity);
        let target = ((overage as f64) * cfg.eviction.overage_ratio
            + (cfg.cache.capacity as f64) * cfg.eviction.extra_ratio)
            .ceil() as usize;
        let target = target.max(1);

        // Reuse the preallocated heap when the batch fits, else build a
        // temporary one sized for this pass. Either way the heap's logical
        // bound is exactly `target`, which is what caps the eviction batch.
        let mut scratch;
        let mut temp;
        let heap: &mut EvictionHeap<Candidate, CandidateCmp> = if target <= SCRATCH_HEAP_CAPACITY {
            scratch = self.scratch_heap.lock();
            scratch.reset(target);
            &mut scratch
        } else {
            temp = EvictionHeap::with_capacity(target, by_last_used as CandidateCmp);
            &mut temp
        };

        self.table.for_each(|entry| {
            // Only completely idle entries are candidates: no holders, no
            // flags of any kind.
            if entry.flags_word() == 0 {
                let candidate = Candidate {
                    last_used: entry.last_used(),
                    entry: Arc::clone(entry),
                };
                // Rejections just mean the candidate is younger than the
                // current batch.
                let _ = heap.try_insert(candidate);
            }
        });

        let mut evicted = 0;
        for i in 0..heap.len() {
            if let Some(candidate) = heap.get(i) {
                if self.evict_candidate(&candidate.entry) {
                    evicted += 1;
                }
            }
        }
        heap.clear();
        evicted
    }

    /// Age-based cleanup: one pass removing entries idle past the
    /// threshold, capped at soft-capacity many.
    fn cleanup_timeout(&self, now: u64, idle_threshold_millis: u64) -> usize {
        let mut victims = Vec::new();
        self.table.for_each(|entry| {
            if victims.len() < self.config.cache.capacity
                && entry.flags_word() == 0
                && now.saturating_sub(entry.last_used()) >= idle_threshold_millis
            {
                victims.push(Arc::clone(entry));
            }
        });

        let mut evicted = 0;
        for entry in victims {
            if self.evict_candidate(&entry) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Re-validate and claim a cleanup candidate. A candidate fixed or
    /// flagged since the scan is retried once after a yield (a racing
    /// unfix may be mid-flight), then skipped.
    fn evict_candidate(&self, entry: &Arc<PlanEntry>) -> bool {
        if entry.try_claim_for_cleanup() {
            self.teardown(entry);
            return true;
        }
        std::thread::yield_now();
        if entry.try_claim_for_cleanup() {
            self.teardown(entry);
            return true;
        }
        debug!(
            plan = %entry.key().digest,
            fixes = entry.fix_count(),
            "eviction_candidate_busy_skipped"
        );
        false
    }
}

impl FixedPlan {
    pub fn key(&self) -> PlanKey {
        self.entry.key()
    }

    pub fn text(&self) -> &QueryText {
        self.entry.text()
    }

    pub fn related_objects(&self) -> &[RelatedObject] {
        self.entry.related_objects()
    }

    /// Serialized plan buffer. Present for the whole life of the guard.
    pub fn serialized(&self) -> CacheResult<Arc<SerializedPlan>> {
        self.entry
            .buffer()
            .ok_or(CacheError::Exhausted("plan buffer released"))
    }

    /// Draw a ready-to-run clone from the entry's pool, deserializing a
    /// fresh one when the pool is empty.
    pub fn checkout_clone(&self) -> CacheResult<PlanClone> {
        let buffer = self.serialized()?;
        self.entry.clones().checkout(self.inner.codec.as_ref(), &buffer)
    }

    /// Return a clone for reuse by other sessions. Silently dropped when
    /// the pool is full.
    pub fn put_back_clone(&self, clone: PlanClone) {
        self.entry.clones().put_back(clone);
    }

    /// Throttled cardinality-drift inspection against the statistics
    /// collaborator.
    pub fn check_recompile_threshold(&self) -> DriftCheck {
        check_drift(
            &self.entry,
            self.inner.statistics.as_ref(),
            &self.inner.config.recompile,
            now_millis(),
        )
    }

    /// True when a drift check has requested a recompile of this plan.
    pub fn recompile_requested(&self) -> bool {
        self.entry.is_recompile_requested()
    }

    /// True once a replacement generation has been published. The held
    /// payload stays valid; new lookups no longer find this generation.
    pub fn was_recompiled(&self) -> bool {
        self.entry.was_recompiled()
    }

    /// Attach the companion result-cache handle for rows cached against
    /// this plan. The handle is invalidated when the entry is torn down.
    pub fn set_result_cache_handle(&self, handle: ResultCacheHandle) {
        self.entry.set_result_cache_handle(handle);
    }

    #[cfg(test)]
    pub(crate) fn entry(&self) -> &Arc<PlanEntry> {
        &self.entry
    }
}

impl Drop for FixedPlan {
    fn drop(&mut self) {
        self.inner.unfix_entry(&self.entry);
    }
}

impl std::fmt::Debug for FixedPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedPlan").field("key", &self.key()).finish()
    }
}
