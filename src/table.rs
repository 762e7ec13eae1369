//! Concurrent entry table: identity digest -> cached plan generations.
//!
//! Backed by a sharded concurrent map. Each digest maps to a small vector
//! of entry generations: at most one discoverable entry plus any old
//! generations still draining their holders after a recompile or delete.
//!
//! ## Contract
//!
//! - `find`/`insert_if_absent` separate key match from fixing: the match
//!   is pure, and a matched entry is handed out only after a successful
//!   `try_fix` on it. Key equality never mutates an entry.
//! - Single discoverability: insertion scans the digest's generation list
//!   under the shard guard, so two discoverable entries for one digest can
//!   never coexist.
//! - Deferred reclamation: entries are `Arc`-shared. Removing one from the
//!   table while a reader still holds a fix only unlinks it; the payload
//!   lives until the holder count drains. Shard guards are released before
//!   any result is returned to the caller, and no user callback runs while
//!   a guard that it could re-enter is held.

use std::sync::Arc;

use dashmap::DashMap;

use crate::entry::{FixResult, PlanEntry, Probe};
use crate::plan::{PlanDigest, PlanKey};

/// Outcome of [`PlanTable::insert_if_absent`].
pub enum InsertOutcome {
    /// The offered entry is now discoverable.
    Inserted,
    /// A discoverable entry already existed; it has been fixed on the
    /// caller's behalf.
    Found(Arc<PlanEntry>),
}

/// The concurrent digest -> generations table.
pub struct PlanTable {
    map: DashMap<PlanDigest, Vec<Arc<PlanEntry>>>,
}

impl PlanTable {
    pub fn new() -> Self {
        PlanTable {
            map: DashMap::new(),
        }
    }

    /// Prepare-mode lookup: fix and return any matching entry the probe
    /// accepts.
    pub fn find(&self, digest: &PlanDigest, probe: Probe) -> Option<Arc<PlanEntry>> {
        let generations = self.map.get(digest)?;
        for entry in generations.iter() {
            if entry.try_fix(probe) == FixResult::Fixed {
                return Some(Arc::clone(entry));
            }
        }
        None
    }

    /// Execute-mode lookup: exact `(digest, stored_at)` match. Entries in
    /// `TO_BE_RECOMPILED` still match (the old generation stays servable
    /// until the replacement lands), replaced or deleted ones do not.
    pub fn find_by_key(&self, key: &PlanKey, probe: Probe) -> Option<Arc<PlanEntry>> {
        let generations = self.map.get(&key.digest)?;
        for entry in generations.iter() {
            if entry.key().stored_at == key.stored_at && entry.try_fix(probe) == FixResult::Fixed {
                return Some(Arc::clone(entry));
            }
        }
        None
    }

    /// Atomic publish: insert `entry` unless the probe matches an existing
    /// discoverable generation, which is then fixed for the caller.
    ///
    /// The offered entry arrives pre-fixed by its builder, so on the
    /// `Inserted` path the caller already holds it.
    pub fn insert_if_absent(&self, entry: Arc<PlanEntry>, probe: Probe) -> InsertOutcome {
        let mut generations = self.map.entry(entry.key().digest).or_default();
        for existing in generations.iter() {
            if existing.try_fix(probe) == FixResult::Fixed {
                return InsertOutcome::Found(Arc::clone(existing));
            }
        }
        generations.push(entry);
        InsertOutcome::Inserted
    }

    /// Unlink one generation, matched by identity rather than key: after a
    /// recompile the replacement carries the old generation's `stored_at`,
    /// so the key alone is ambiguous. Idempotent; only the first remover
    /// reports `true`.
    pub fn remove(&self, entry: &Arc<PlanEntry>) -> bool {
        let digest = entry.key().digest;
        let removed = match self.map.get_mut(&digest) {
            Some(mut generations) => {
                let before = generations.len();
                generations.retain(|e| !Arc::ptr_eq(e, entry));
                before != generations.len()
            }
            None => false,
        };
        // Drop empty digest slots so the table does not accumulate tombstone
        // vectors for one-shot statements.
        self.map
            .remove_if(&digest, |_, generations| generations.is_empty());
        removed
    }

    /// Visit every generation. The callback must not mutate the table;
    /// scans collect first and act afterwards.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<PlanEntry>)) {
        for generations in self.map.iter() {
            for entry in generations.value() {
                f(entry);
            }
        }
    }

    /// Total generations currently linked (including draining ones).
    pub fn len(&self) -> usize {
        self.map.iter().map(|g| g.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PlanTable {
    fn default() -> Self {
        Self::new()
    }
}
