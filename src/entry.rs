//! Cache entry and its lock-free lifecycle state machine.
//!
//! Every entry carries a single atomic flag word: the low 32 bits are the
//! fix count (how many sessions currently hold the entry), the high bits
//! are status flags. All transitions are compare-and-swap retry loops; no
//! transition blocks or sleeps.
//!
//! ## State machine
//!
//! ```text
//! LIVE_DISCOVERABLE --begin_recompile--> TO_BE_RECOMPILED
//! TO_BE_RECOMPILED --finish_recompile--> WAS_RECOMPILED   (unreachable, still valid for holders)
//! LIVE/TO_BE/WAS  --mark_deleted------> MARKED_DELETED    (terminal, draining)
//! fix 0 + terminal flag --unfix/claim--> DELETE_BY_ME     (one thread owns teardown)
//! ```
//!
//! Invariants:
//! - A successful fix is required before the payload may be read, and the
//!   payload stays valid until the matching unfix.
//! - `MARKED_DELETED` is terminal: no new fixer succeeds after it is set.
//! - Exactly one thread observes the transition to "zero fixers + terminal
//!   flag" and becomes responsible for removal and payload release.

use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use std::sync::Arc;

use crate::clones::ClonePool;
use crate::external::ResultCacheHandle;
use crate::plan::{now_millis, PlanKey, QueryText, RelatedObject, SerializedPlan};

/// Low 32 bits of the flag word: concurrent holder count.
pub const FIX_MASK: u64 = 0xFFFF_FFFF;

/// Entry is being drained and must not be fixed again.
pub const MARKED_DELETED: u64 = 1 << 32;
/// A recompiler has claimed this entry; a replacement is on the way.
pub const TO_BE_RECOMPILED: u64 = 1 << 33;
/// Replacement inserted; entry is undiscoverable but valid for old holders.
pub const WAS_RECOMPILED: u64 = 1 << 34;
/// The drift check wants the next prepare to recompile this plan.
pub const RECOMPILE_REQUESTED: u64 = 1 << 35;

/// Probe-side hint: do not match entries currently being recompiled.
/// Never stored in an entry's flag word.
pub const SKIP_TO_BE_RECOMPILED: u64 = 1 << 36;

/// Private whole-word sentinel taken by the thread that wins teardown.
/// No CAS loop ever moves an entry out of this state.
const DELETE_BY_ME: u64 = (1 << 63) | MARKED_DELETED;

/// Lookup-side flags carried by a probe, in the same bit space as the
/// entry flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Probe(u64);

impl Probe {
    /// Plain probe: match any discoverable entry.
    pub const NONE: Probe = Probe(0);
    /// Skip entries flagged `TO_BE_RECOMPILED` (used while inserting the
    /// replacement so the old generation is not matched again).
    pub const SKIP_RECOMPILING: Probe = Probe(SKIP_TO_BE_RECOMPILED);

    pub fn skips_recompiling(self) -> bool {
        self.0 & SKIP_TO_BE_RECOMPILED != 0
    }
}

/// Result of a fix attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixResult {
    /// Fix count incremented; the caller may read the payload.
    Fixed,
    /// Entry is marked deleted; treat as no match.
    Deleted,
    /// Entry was replaced by a recompile; treat as no match.
    Recompiled,
    /// Entry is being recompiled and the probe opted to skip it.
    Skipped,
}

/// Result of an unfix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Unfix {
    /// Other holders remain, or the entry stays discoverable.
    Remaining,
    /// This thread drove the count to zero on a terminal entry and now owns
    /// removal from the table plus payload release.
    LastOut,
}

/// Result of marking an entry deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkDeleted {
    /// Fix count was zero: the caller owns teardown right now.
    SoleOwner,
    /// Holders remain; the last unfixer will tear the entry down.
    Pending,
    /// Already terminal; nothing to do.
    AlreadyDeleted,
}

/// One cached compiled plan plus its metadata.
pub struct PlanEntry {
    key: PlanKey,
    flags: AtomicU64,
    text: QueryText,
    related: Vec<RelatedObject>,
    /// Serialized plan; taken (set to `None`) by the deleting thread.
    buffer: ArcSwapOption<SerializedPlan>,
    clones: ClonePool,
    /// Back-pointer into the companion result cache, if any.
    result_cache: ArcSwapOption<ResultCacheHandle>,
    last_used: AtomicU64,
    last_recompile_check: AtomicU64,
    hits: AtomicU64,
    executions: AtomicU64,
}

impl PlanEntry {
    /// Build a new entry with fix count 1: the inserter's own hold.
    pub fn new(
        key: PlanKey,
        text: QueryText,
        buffer: SerializedPlan,
        related: Vec<RelatedObject>,
        clone_pool_max: usize,
    ) -> Self {
        let now = now_millis();
        PlanEntry {
            key,
            flags: AtomicU64::new(1),
            text,
            related,
            buffer: ArcSwapOption::from(Some(Arc::new(buffer))),
            clones: ClonePool::new(clone_pool_max),
            result_cache: ArcSwapOption::empty(),
            last_used: AtomicU64::new(now),
            last_recompile_check: AtomicU64::new(now),
            hits: AtomicU64::new(0),
            executions: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> PlanKey {
        self.key
    }

    pub fn text(&self) -> &QueryText {
        &self.text
    }

    pub fn related_objects(&self) -> &[RelatedObject] {
        &self.related
    }

    pub fn clones(&self) -> &ClonePool {
        &self.clones
    }

    /// Serialized plan buffer; `None` once the entry has been torn down.
    pub fn buffer(&self) -> Option<Arc<SerializedPlan>> {
        self.buffer.load_full()
    }

    pub fn result_cache_handle(&self) -> Option<ResultCacheHandle> {
        self.result_cache.load_full().map(|h| *h)
    }

    pub fn set_result_cache_handle(&self, handle: ResultCacheHandle) {
        self.result_cache.store(Some(Arc::new(handle)));
    }

    /// Raw flag word, for the diagnostic dump.
    pub fn flags_word(&self) -> u64 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn fix_count(&self) -> u64 {
        self.flags_word() & FIX_MASK
    }

    pub fn is_deleted(&self) -> bool {
        self.flags_word() & MARKED_DELETED != 0
    }

    pub fn is_recompiling(&self) -> bool {
        self.flags_word() & TO_BE_RECOMPILED != 0
    }

    pub fn was_recompiled(&self) -> bool {
        self.flags_word() & WAS_RECOMPILED != 0
    }

    /// True while the entry may be returned by a digest lookup.
    pub fn is_discoverable(&self) -> bool {
        self.flags_word() & (MARKED_DELETED | WAS_RECOMPILED) == 0
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    pub fn last_recompile_check(&self) -> u64 {
        self.last_recompile_check.load(Ordering::Relaxed)
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_used.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.last_used.store(now_millis(), Ordering::Relaxed);
    }

    /// Attempt to fix (reference-count) the entry for the given probe.
    ///
    /// Rejections are normal control flow: the caller treats them as
    /// "no match" and falls through to compiling fresh.
    pub fn try_fix(&self, probe: Probe) -> FixResult {
        let mut word = self.flags.load(Ordering::Acquire);
        loop {
            if word & MARKED_DELETED != 0 {
                return FixResult::Deleted;
            }
            if word & WAS_RECOMPILED != 0 {
                return FixResult::Recompiled;
            }
            if word & TO_BE_RECOMPILED != 0 && probe.skips_recompiling() {
                return FixResult::Skipped;
            }
            debug_assert!(word & FIX_MASK < FIX_MASK, "fix count overflow");
            match self.flags.compare_exchange_weak(
                word,
                word + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return FixResult::Fixed,
                Err(current) => word = current,
            }
        }
    }

    /// Drop one hold on the entry.
    ///
    /// When the count reaches zero on an entry flagged deleted or
    /// recompiled, this thread wins the `DELETE_BY_ME` sentinel and must
    /// remove the entry from the table and release its payload.
    pub fn unfix(&self) -> Unfix {
        let mut word = self.flags.load(Ordering::Acquire);
        loop {
            let fixes = word & FIX_MASK;
            if fixes == 0 {
                // Contract violation: unfix without a matching fix. Absorb
                // it by forcing the entry toward deletion rather than
                // underflowing the count.
                debug_assert!(fixes > 0, "unfix on an entry with fix count zero");
                match self.flags.compare_exchange_weak(
                    word,
                    DELETE_BY_ME,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Unfix::LastOut,
                    Err(current) => {
                        if current == DELETE_BY_ME {
                            return Unfix::Remaining;
                        }
                        word = current;
                        continue;
                    }
                }
            }
            let terminal = word & (MARKED_DELETED | WAS_RECOMPILED) != 0;
            let next = if fixes == 1 && terminal {
                DELETE_BY_ME
            } else {
                word - 1
            };
            match self
                .flags
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return if next == DELETE_BY_ME {
                        Unfix::LastOut
                    } else {
                        Unfix::Remaining
                    };
                }
                Err(current) => word = current,
            }
        }
    }

    /// OR in `MARKED_DELETED` (clearing `WAS_RECOMPILED` if present).
    ///
    /// Returns whether the caller immediately became sole owner of the
    /// teardown. Used by invalidation, drop-all, and cleanup.
    pub fn mark_deleted(&self) -> MarkDeleted {
        let mut word = self.flags.load(Ordering::Acquire);
        loop {
            if word & MARKED_DELETED != 0 {
                return MarkDeleted::AlreadyDeleted;
            }
            let fixes = word & FIX_MASK;
            let next = if fixes == 0 {
                DELETE_BY_ME
            } else {
                (word | MARKED_DELETED) & !WAS_RECOMPILED
            };
            match self
                .flags
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return if fixes == 0 {
                        MarkDeleted::SoleOwner
                    } else {
                        MarkDeleted::Pending
                    };
                }
                Err(current) => word = current,
            }
        }
    }

    /// Cleanup-probe claim: succeeds only when the entry is completely idle
    /// (fix count zero, no flags at all), transitioning straight to the
    /// teardown sentinel.
    pub fn try_claim_for_cleanup(&self) -> bool {
        self.flags
            .compare_exchange(0, DELETE_BY_ME, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the entry for recompilation.
    ///
    /// Fails when the entry is already deleted, already replaced, or being
    /// recompiled by someone else; the caller backs off and retries its
    /// whole insert.
    pub fn begin_recompile(&self) -> bool {
        let mut word = self.flags.load(Ordering::Acquire);
        loop {
            if word & (MARKED_DELETED | WAS_RECOMPILED | TO_BE_RECOMPILED) != 0 {
                return false;
            }
            match self.flags.compare_exchange_weak(
                word,
                (word | TO_BE_RECOMPILED) & !RECOMPILE_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    /// Flip `TO_BE_RECOMPILED` to `WAS_RECOMPILED` once the replacement is
    /// durably inserted, preserving the fix count bits. The caller still
    /// holds its own fix and unfixes afterwards.
    pub fn finish_recompile(&self) {
        let mut word = self.flags.load(Ordering::Acquire);
        loop {
            debug_assert!(
                word & TO_BE_RECOMPILED != 0,
                "finish_recompile without begin_recompile"
            );
            if word & TO_BE_RECOMPILED == 0 {
                // Concurrently deleted; deletion wins.
                return;
            }
            let next = (word & !TO_BE_RECOMPILED) | WAS_RECOMPILED;
            match self
                .flags
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }
    }

    /// Raise the staleness flag. No-op when a terminal or recompile flag is
    /// already present.
    pub fn request_recompile(&self) -> bool {
        let mut word = self.flags.load(Ordering::Acquire);
        loop {
            if word & (MARKED_DELETED | WAS_RECOMPILED | TO_BE_RECOMPILED) != 0 {
                return false;
            }
            if word & RECOMPILE_REQUESTED != 0 {
                return true;
            }
            match self.flags.compare_exchange_weak(
                word,
                word | RECOMPILE_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    pub fn is_recompile_requested(&self) -> bool {
        self.flags_word() & RECOMPILE_REQUESTED != 0
    }

    /// Clear the staleness flag (the prepare that observed it is about to
    /// recompile).
    pub fn clear_recompile_request(&self) {
        let mut word = self.flags.load(Ordering::Acquire);
        loop {
            if word & RECOMPILE_REQUESTED == 0 {
                return;
            }
            match self.flags.compare_exchange_weak(
                word,
                word & !RECOMPILE_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }
    }

    /// Throttle gate for the drift check: CAS the last-checked stamp so at
    /// most one thread per interval does the work.
    pub fn claim_recompile_check(&self, now: u64, interval_millis: u64) -> bool {
        let last = self.last_recompile_check.load(Ordering::Relaxed);
        if now.saturating_sub(last) < interval_millis {
            return false;
        }
        self.last_recompile_check
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Detach the result-cache back-pointer, handing it to the caller for
    /// invalidation. On the teardown path this runs before
    /// [`PlanEntry::release_payload`].
    pub fn take_result_cache_handle(&self) -> Option<ResultCacheHandle> {
        self.result_cache.swap(None).map(|h| *h)
    }

    /// Release the payload: drain the clone pool and drop the serialized
    /// buffer. Only the thread holding `DELETE_BY_ME` calls this, after the
    /// result-cache handle has been taken and invalidated.
    pub fn release_payload(&self) {
        debug_assert_eq!(self.flags_word(), DELETE_BY_ME);
        self.clones.drain();
        self.buffer.store(None);
    }
}

impl std::fmt::Debug for PlanEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.flags_word();
        f.debug_struct("PlanEntry")
            .field("key", &self.key)
            .field("fix_count", &(word & FIX_MASK))
            .field("flags", &format_args!("{:#x}", word & !FIX_MASK))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{LockMode, PlanDigest};

    fn entry() -> PlanEntry {
        PlanEntry::new(
            PlanKey::new(PlanDigest::of("q"), 1),
            QueryText::default(),
            SerializedPlan(vec![1, 2, 3]),
            vec![RelatedObject::new(7, LockMode::Shared, 10)],
            4,
        )
    }

    // FIX / UNFIX
    #[test]
    fn test_new_entry_starts_fixed_once() {
        let e = entry();
        assert_eq!(e.fix_count(), 1);
        assert!(e.is_discoverable());
    }

    #[test]
    fn test_fix_unfix_balance() {
        let e = entry();
        assert_eq!(e.try_fix(Probe::NONE), FixResult::Fixed);
        assert_eq!(e.fix_count(), 2);
        assert_eq!(e.unfix(), Unfix::Remaining);
        assert_eq!(e.unfix(), Unfix::Remaining);
        assert_eq!(e.fix_count(), 0);
        // No terminal flag: the entry stays live at count zero.
        assert!(e.is_discoverable());
    }

    #[test]
    fn test_unfix_on_deleted_entry_hands_over_teardown() {
        let e = entry();
        assert_eq!(e.mark_deleted(), MarkDeleted::Pending);
        assert_eq!(e.try_fix(Probe::NONE), FixResult::Deleted);
        assert_eq!(e.unfix(), Unfix::LastOut);
        assert!(e.take_result_cache_handle().is_none());
        e.release_payload();
        assert!(e.buffer().is_none());
    }

    #[test]
    fn test_mark_deleted_when_idle_is_sole_owner() {
        let e = entry();
        assert_eq!(e.unfix(), Unfix::Remaining);
        assert_eq!(e.mark_deleted(), MarkDeleted::SoleOwner);
        assert_eq!(e.mark_deleted(), MarkDeleted::AlreadyDeleted);
    }

    // RECOMPILE FLAGS
    #[test]
    fn test_recompile_flow_preserves_holders() {
        let e = entry();
        // A second session holds the entry.
        assert_eq!(e.try_fix(Probe::NONE), FixResult::Fixed);

        assert!(e.begin_recompile());
        // Claimed entries are skipped by skip-probes but still fixable by
        // plain execute lookups.
        assert_eq!(e.try_fix(Probe::SKIP_RECOMPILING), FixResult::Skipped);
        assert_eq!(e.try_fix(Probe::NONE), FixResult::Fixed);
        assert_eq!(e.unfix(), Unfix::Remaining);

        e.finish_recompile();
        assert!(e.was_recompiled());
        assert!(!e.is_discoverable());
        // New fixers are rejected, old holders still drain normally.
        assert_eq!(e.try_fix(Probe::NONE), FixResult::Recompiled);
        assert_eq!(e.unfix(), Unfix::Remaining);
        assert_eq!(e.unfix(), Unfix::LastOut);
    }

    #[test]
    fn test_begin_recompile_is_exclusive() {
        let e = entry();
        assert!(e.begin_recompile());
        assert!(!e.begin_recompile());
    }

    #[test]
    fn test_mark_deleted_clears_was_recompiled() {
        let e = entry();
        assert!(e.begin_recompile());
        e.finish_recompile();
        assert_eq!(e.mark_deleted(), MarkDeleted::Pending);
        assert!(!e.was_recompiled());
        assert!(e.is_deleted());
    }

    #[test]
    fn test_request_recompile_only_on_live_entries() {
        let e = entry();
        assert!(e.request_recompile());
        assert!(e.is_recompile_requested());
        e.clear_recompile_request();
        assert!(!e.is_recompile_requested());

        e.mark_deleted();
        assert!(!e.request_recompile());
    }

    #[test]
    fn test_begin_recompile_clears_pending_request() {
        let e = entry();
        assert!(e.request_recompile());
        assert!(e.begin_recompile());
        assert!(!e.is_recompile_requested());
    }

    // CLEANUP CLAIM
    #[test]
    fn test_cleanup_claim_requires_idle() {
        let e = entry();
        // Still fixed by the inserter: claim must fail.
        assert!(!e.try_claim_for_cleanup());
        assert_eq!(e.unfix(), Unfix::Remaining);
        assert!(e.try_claim_for_cleanup());
        // Claimed entries reject all fixers.
        assert_eq!(e.try_fix(Probe::NONE), FixResult::Deleted);
    }

    #[test]
    fn test_cleanup_claim_rejects_flagged_entries() {
        let e = entry();
        assert_eq!(e.unfix(), Unfix::Remaining);
        assert!(e.request_recompile());
        assert!(!e.try_claim_for_cleanup());
    }

    #[test]
    fn test_result_cache_handle_taken_once() {
        let e = entry();
        e.set_result_cache_handle(ResultCacheHandle(9));
        assert_eq!(e.result_cache_handle(), Some(ResultCacheHandle(9)));
        assert_eq!(e.take_result_cache_handle(), Some(ResultCacheHandle(9)));
        assert_eq!(e.take_result_cache_handle(), None);
    }

    // THROTTLE GATE
    #[test]
    fn test_claim_recompile_check_throttles() {
        let e = entry();
        let now = e.last_recompile_check() + 10_000;
        assert!(e.claim_recompile_check(now, 5_000));
        // Second claim at the same instant loses.
        assert!(!e.claim_recompile_check(now, 5_000));
        // Within the interval: rejected.
        assert!(!e.claim_recompile_check(now + 1_000, 5_000));
        // Past the interval: accepted again.
        assert!(e.claim_recompile_check(now + 6_000, 5_000));
    }
}
