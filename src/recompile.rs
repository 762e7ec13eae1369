//! Cardinality-drift check: decide when a cached plan has gone stale.
//!
//! A plan compiled against a 10-page table is usually the wrong plan once
//! that table holds 10,000 pages. Each fixed entry is re-inspected at most
//! once per configured interval (one thread wins a CAS on the last-checked
//! stamp, so the work is never duplicated). If any related object's current
//! page count has drifted past the growth factor, the stored estimate is
//! refreshed, the statistics collector is notified, and the entry is
//! flagged `RECOMPILE_REQUESTED`.
//!
//! The check only raises a flag. It never blocks other fixers and never
//! removes the entry; a later prepare-mode lookup acts on the flag.

use tracing::debug;

use crate::config::RecompileConfig;
use crate::entry::PlanEntry;
use crate::external::StatisticsSource;

/// Outcome of one drift inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftCheck {
    /// Another thread checked recently; nothing done.
    Throttled,
    /// Inspected, no related object drifted.
    Stable,
    /// Drift found: stored estimates refreshed, recompile requested.
    RecompileRequested,
}

/// Has `current` drifted past `factor` relative to `stored`?
///
/// Growth and shrink are symmetric, and estimates at or above the noise
/// ceiling are ignored: on already-huge objects another doubling does not
/// change plan shape.
fn drifted(stored: i64, current: i64, factor: f64, noise_ceiling: i64) -> bool {
    if stored >= noise_ceiling {
        return false;
    }
    // Page counts below 1 make the ratio meaningless; treat as 1.
    let stored = f64::max(stored as f64, 1.0);
    let current = f64::max(current as f64, 1.0);
    current >= stored * factor || stored >= current * factor
}

/// Run the throttled drift check on a fixed entry.
///
/// The caller must hold a fix on `entry`; the check reads the payload.
pub fn check_drift(
    entry: &PlanEntry,
    stats: &dyn StatisticsSource,
    cfg: &RecompileConfig,
    now_millis: u64,
) -> DriftCheck {
    if !entry.claim_recompile_check(now_millis, cfg.check_interval_secs * 1000) {
        return DriftCheck::Throttled;
    }

    let mut any_drift = false;
    for object in entry.related_objects() {
        let stored = object.page_count();
        let current = stats.current_page_count(object.object_id);
        if drifted(stored, current, cfg.growth_factor, cfg.noise_ceiling) {
            debug!(
                plan = %entry.key().digest,
                object_id = object.object_id,
                stored_pages = stored,
                current_pages = current,
                "plan_cardinality_drift"
            );
            object.set_page_count(current);
            stats.updated_cardinality(object.object_id, current);
            any_drift = true;
        }
    }

    if any_drift && entry.request_recompile() {
        return DriftCheck::RecompileRequested;
    }
    // request_recompile fails only when the entry went terminal while we
    // were checking, in which case the flag no longer matters.
    DriftCheck::Stable
}
