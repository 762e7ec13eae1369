//! Per-entry pool of ready-to-run plan clones.
//!
//! Deserializing a flat plan buffer into an executable tree is the expensive
//! part of a cache hit, so each entry keeps a small pool of trees that
//! sessions check out, run, and put back. A clone is always a pair of the
//! runtime tree and its private arena; the two are pooled and dropped
//! together.
//!
//! The pool mutex guards nothing but a `Vec` push/pop, so the critical
//! section is a few instructions.

use parking_lot::Mutex;

use crate::error::CacheResult;
use crate::external::PlanCodec;
use crate::plan::{ExecutablePlan, PlanArena, SerializedPlan};

/// A ready-to-execute instantiation of a cached plan.
#[derive(Debug)]
pub struct PlanClone {
    pub plan: ExecutablePlan,
    pub arena: PlanArena,
}

/// Bounded pool of [`PlanClone`]s belonging to one cache entry.
pub struct ClonePool {
    ready: Mutex<Vec<PlanClone>>,
    max: usize,
}

impl ClonePool {
    pub fn new(max: usize) -> Self {
        ClonePool {
            ready: Mutex::new(Vec::new()),
            max,
        }
    }

    /// Pop a pooled clone, or deserialize a fresh pair from `buffer`.
    pub fn checkout(
        &self,
        codec: &dyn PlanCodec,
        buffer: &SerializedPlan,
    ) -> CacheResult<PlanClone> {
        if let Some(clone) = self.ready.lock().pop() {
            return Ok(clone);
        }
        let (plan, arena) = codec.deserialize(buffer)?;
        Ok(PlanClone { plan, arena })
    }

    /// Return a clone to the pool. Dropped on the floor when the pool is at
    /// its bound; the bound is what keeps idle entries from hoarding memory.
    pub fn put_back(&self, clone: PlanClone) {
        let mut ready = self.ready.lock();
        if ready.len() < self.max {
            ready.push(clone);
        }
    }

    /// Empty the pool. Used on the entry deletion path.
    pub fn drain(&self) -> usize {
        let mut ready = self.ready.lock();
        let drained = ready.len();
        ready.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.lock().is_empty()
    }
}

impl std::fmt::Debug for ClonePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClonePool")
            .field("ready", &self.len())
            .field("max", &self.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::IdentityCodec;

    fn buffer() -> SerializedPlan {
        SerializedPlan(vec![0xAB; 16])
    }

    #[test]
    fn test_checkout_deserializes_when_pool_empty() {
        let pool = ClonePool::new(4);
        let clone = pool.checkout(&IdentityCodec, &buffer()).unwrap();
        assert_eq!(clone.plan.repr, vec![0xAB; 16]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_put_back_then_checkout_reuses() {
        let pool = ClonePool::new(4);
        let clone = pool.checkout(&IdentityCodec, &buffer()).unwrap();
        pool.put_back(clone);
        assert_eq!(pool.len(), 1);

        let _again = pool.checkout(&IdentityCodec, &buffer()).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_never_exceeds_max() {
        let pool = ClonePool::new(2);
        for _ in 0..5 {
            let clone = pool.checkout(&IdentityCodec, &buffer()).unwrap();
            pool.put_back(clone);
        }
        // Sequential checkout/put_back keeps one in flight; overfill directly.
        let a = pool.checkout(&IdentityCodec, &buffer()).unwrap();
        let b = pool.checkout(&IdentityCodec, &buffer()).unwrap();
        let c = pool.checkout(&IdentityCodec, &buffer()).unwrap();
        pool.put_back(a);
        pool.put_back(b);
        pool.put_back(c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_drain_empties_pool() {
        let pool = ClonePool::new(4);
        let a = pool.checkout(&IdentityCodec, &buffer()).unwrap();
        let b = pool.checkout(&IdentityCodec, &buffer()).unwrap();
        pool.put_back(a);
        pool.put_back(b);
        assert_eq!(pool.drain(), 2);
        assert!(pool.is_empty());
    }
}
