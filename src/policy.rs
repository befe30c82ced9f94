//! Cleaning-policy and promotion-policy hooks (§4.5 expansion).
//!
//! The core owns the *contracts* these collaborators satisfy and the
//! orchestration around them; ALRU/ACP-grade cleaning heuristics and
//! threshold-based promotion are the embedder's job. This module ships one
//! trivial built-in of each, matching the reference design's own NOP
//! cleaning policy and "always" promotion threshold.

use crate::types::{CacheLineId, CoreId, CoreLine};

/// Hook the core calls into as cache lines are inserted, dirtied, and
/// cleaned, so an embedder can drive its own cleaning heuristic (ALRU, ACP,
/// ...) off the same events the reference design's cleaning policies key
/// off of.
pub trait CleaningPolicy: Send + Sync {
    /// Called once when a cache line is first mapped.
    fn init_cache_block(&self, _line: CacheLineId) {}

    /// Called when a line's dirty bitmap clears to zero, whether from a
    /// flush or from a write that happens to clean every previously-dirty
    /// sector (§4.3).
    fn purge_cache_block(&self, _line: CacheLineId) {}

    /// Called by the write-back engine on a successful write (§4.1 "Wb").
    fn set_hot(&self, _line: CacheLineId) {}

    /// Proposes up to `budget` core lines worth of dirty data for the flush
    /// orchestrator to clean next. An empty result (the default, and the
    /// only thing [`NopCleaning`] ever returns) tells the orchestrator to
    /// fall back to its own default full scan.
    fn cores_to_clean(&self, _budget: usize) -> Vec<CoreLine> {
        Vec::new()
    }
}

/// The reference design's NOP cleaning policy: proposes nothing, reacts to
/// nothing. The default for a freshly built [`crate::Cache`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NopCleaning;

impl CleaningPolicy for NopCleaning {}

/// Hook consulted before a cache miss would trigger a remap, and notified
/// after one succeeds, so an embedder can implement threshold-based
/// promotion (only cache a core line once it's been missed N times) instead
/// of caching on first touch.
pub trait PromotionPolicy: Send + Sync {
    /// Whether a miss on `(core_id, core_line)` should be promoted into a
    /// fresh mapping. Consulted by the traversal step before a MISS
    /// triggers a remap (§4.5).
    fn should_promote(&self, core_id: CoreId, core_line: CoreLine) -> bool;

    /// Notified after a successful remap.
    fn on_insert(&self, _core_id: CoreId, _core_line: CoreLine) {}
}

/// The default promotion policy: every miss is eligible for mapping,
/// matching the reference promotion policy's "always" threshold mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysPromote;

impl PromotionPolicy for AlwaysPromote {
    fn should_promote(&self, _core_id: CoreId, _core_line: CoreLine) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_cleaning_proposes_nothing() {
        let policy = NopCleaning;
        assert!(policy.cores_to_clean(64).is_empty());
        policy.init_cache_block(0);
        policy.purge_cache_block(0);
        policy.set_hot(0);
    }

    #[test]
    fn always_promote_accepts_every_miss() {
        let policy = AlwaysPromote;
        assert!(policy.should_promote(0, 0));
        assert!(policy.should_promote(3, 9_999));
        policy.on_insert(0, 0);
    }
}
