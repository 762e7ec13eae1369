//! Plan identity and payload types.
//!
//! A cached plan is addressed by the content digest of its normalized
//! statement text plus the instant it was stored. The digest alone names a
//! statement; the `(digest, stored_at)` pair names one compiled generation
//! of it, which is what keeps execute-mode lookups valid across recompiles.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Width of the identity digest in bytes (SHA-256, truncated).
pub const DIGEST_LEN: usize = 16;

/// Content digest of a normalized statement: the plan cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanDigest([u8; DIGEST_LEN]);

impl PlanDigest {
    /// Digest the normalized statement text.
    pub fn of(normalized_text: &str) -> Self {
        let hash = Sha256::digest(normalized_text.as_bytes());
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&hash[..DIGEST_LEN]);
        PlanDigest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for PlanDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PlanDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlanDigest({self})")
    }
}

/// The effective cache key: digest plus store timestamp (millis since epoch).
///
/// `stored_at` is carried forward when a plan is recompiled, so a session
/// holding a prepared handle keeps matching the current generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PlanKey {
    pub digest: PlanDigest,
    pub stored_at: u64,
}

impl PlanKey {
    pub fn new(digest: PlanDigest, stored_at: u64) -> Self {
        PlanKey { digest, stored_at }
    }
}

/// Milliseconds since the Unix epoch; the cache's wall clock.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lock mode a plan requires on a related object when it executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Intent,
    Exclusive,
}

/// One catalog object a cached plan depends on.
///
/// The stored page count is the cardinality estimate the plan was compiled
/// against; the drift check refreshes it in place, so it is atomic.
#[derive(Debug)]
pub struct RelatedObject {
    /// Catalog object id (table, index, view)
    pub object_id: u64,
    /// Lock mode the plan takes on this object
    pub lock_mode: LockMode,
    /// Page-count estimate at compile time, refreshed on drift
    page_count: AtomicI64,
}

impl RelatedObject {
    pub fn new(object_id: u64, lock_mode: LockMode, page_count: i64) -> Self {
        RelatedObject {
            object_id,
            lock_mode,
            page_count: AtomicI64::new(page_count),
        }
    }

    pub fn page_count(&self) -> i64 {
        self.page_count.load(Ordering::Relaxed)
    }

    pub fn set_page_count(&self, pages: i64) {
        self.page_count.store(pages, Ordering::Relaxed);
    }
}

impl Clone for RelatedObject {
    fn clone(&self) -> Self {
        RelatedObject::new(self.object_id, self.lock_mode, self.page_count())
    }
}

/// Flat serialized form of a compiled plan, as produced by the codec
/// collaborator. Opaque to the cache: stored, handed out, never inspected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedPlan(pub Vec<u8>);

impl SerializedPlan {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// In-memory, ready-to-run instantiation of a plan. Opaque to the cache.
#[derive(Debug)]
pub struct ExecutablePlan {
    /// Codec-private representation
    pub repr: Vec<u8>,
}

/// Private allocation arena backing one [`ExecutablePlan`]. The pair is
/// always created and released together.
#[derive(Debug)]
pub struct PlanArena {
    /// Codec-private arena storage
    pub storage: Vec<u8>,
}

/// Human-readable forms of the cached statement, kept for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct QueryText {
    /// Normalized form the digest was computed over
    pub hashed: String,
    /// Statement as the user submitted it
    pub user: String,
    /// Rendered plan description, if the compiler provided one
    pub plan: String,
}
