//! # Plancache
//!
//! Process-wide compiled-plan cache for a relational query engine:
//! content-addressed reuse of compiled execution plans across concurrent
//! sessions, cardinality-drift detection for stale plans, and bounded-memory
//! LRU eviction.
//!
//! ## Architecture
//!
//! ```text
//! PlanCache
//!     |-- PlanTable                 (concurrent digest -> generations map)
//!     |     `-- PlanEntry           (atomic flag-word state machine)
//!     |           |-- ClonePool     (ready-to-run plan instantiations)
//!     |           `-- payload       (serialized plan, related objects, text)
//!     |-- EvictionHeap              (bounded LRU candidate selection)
//!     `-- collaborators             (PlanCodec, StatisticsSource, ResultCacheHook)
//! ```
//!
//! ## Concurrency model
//!
//! Parallel session threads, no internal blocking. An entry's lifecycle is
//! driven by one atomic flag word (fix count + status bits) updated through
//! compare-and-swap retry loops. A session that fixes an entry may read its
//! payload until the matching unfix; the last unfixer of a terminal entry
//! tears it down. Cleanup is single-flight and busy-returns when another
//! thread is already evicting.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plancache::{Config, PlanCache, Prepare};
//!
//! let cache = PlanCache::new(Config::load()?, codec, statistics, result_cache)?;
//!
//! // Session prepare path:
//! match cache.lookup_prepare(&digest) {
//!     Prepare::Hit(plan) => execute(plan),
//!     Prepare::Recompile(_old) | Prepare::Miss => {
//!         let compiled = compile(statement)?;
//!         let plan = cache.insert(text, compiled, related, /* recompile */ true)?;
//!         execute(plan)
//!     }
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `cache` | Manager protocol: lookup, insert-or-recompile, invalidate, cleanup |
//! | `entry` | Entry flag-word state machine (fix/unfix, delete, recompile) |
//! | `table` | Concurrent digest -> generations table |
//! | `heap` | Fixed-capacity binary max-heap for eviction selection |
//! | `clones` | Per-entry pool of ready-to-run plan clones |
//! | `recompile` | Throttled cardinality-drift check |
//! | `external` | Collaborator contracts (codec, statistics, result cache) |
//! | `plan` | Identity digests, keys, payload types |
//! | `config` | Figment-backed configuration |
//! | `stats` | Global event counters |

pub mod cache;
pub mod clones;
pub mod config;
pub mod entry;
pub mod error;
pub mod external;
pub mod heap;
pub mod plan;
pub mod recompile;
pub mod stats;
pub mod table;

// Re-export the types a session touches on the hot path.
pub use cache::{FixedPlan, PlanCache, Prepare};
pub use config::Config;
pub use error::{CacheError, CacheResult};
pub use plan::{PlanDigest, PlanKey};
pub use recompile::DriftCheck;
pub use stats::CountersSnapshot;
