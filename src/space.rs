//! Space management: segmented LRU lists and partition eviction (§4.4).
//!
//! Each partition owns `NUM_LRU_LISTS` parallel clean and dirty stripes; a
//! line's stripe is `line_index % NUM_LRU_LISTS`. The freelist is a
//! reserved partition with clean stripes only (`track_hot = false`).
//!
//! Concurrency note: the reference design protects each stripe with its own
//! reader/writer lock and additionally locks a victim's hash bucket before
//! evicting it. This crate coarsens that to a single cache-wide exclusive
//! section held by the caller (see `Cache`'s mapping lock in `cache.rs`) for
//! the duration of any mutating call in this module — §4.4's *victim
//! selection invariants* (not pinned, not in the requester's own range,
//! WR-lockable, no waiters) are still enforced per candidate, just without
//! per-bucket fan-out. This is recorded as a deliberate simplification in
//! `DESIGN.md`.

use crate::alock::{AsyncLock, LockRw};
use crate::arena_list::IndexList;
use crate::bitmap::BitWord;
use crate::metadata::{LruLinks, MetadataTable};
use crate::types::{CacheLineId, CoreId, CoreLine, PartitionId, INVALID};

/// Number of parallel LRU stripes per partition (§4.4).
pub const NUM_LRU_LISTS: u32 = 32;

/// `num_hot / num_nodes` target ratio: half the list stays hot.
pub const LRU_HOT_RATIO: u32 = 2;

/// One segmented-LRU stripe: a list plus hot/cold boundary bookkeeping.
#[derive(Debug, Clone)]
struct LruStripe {
    list: IndexList,
    num_hot: u32,
    track_hot: bool,
}

impl LruStripe {
    fn new(track_hot: bool) -> Self {
        LruStripe {
            list: IndexList::new(),
            num_hot: 0,
            track_hot,
        }
    }

    fn target_hot(&self) -> u32 {
        if !self.track_hot {
            return 0;
        }
        self.list.len() / LRU_HOT_RATIO
    }

    /// Adjusts `num_hot` towards the target by at most one step, flipping
    /// the `hot` bit of whichever node crosses the boundary (§4.4
    /// "Hot/cold balance").
    fn rebalance<W: BitWord>(&mut self, table: &mut MetadataTable<W>) {
        if !self.track_hot {
            return;
        }
        let target = self.target_hot();
        if self.num_hot < target {
            // Promote the first cold node (the one right after the
            // current hot prefix, i.e. `num_hot` nodes in from the head).
            if let Some(line) = self.list.iter(&LruLinks(table)).nth(self.num_hot as usize) {
                table.get_mut(line).hot = true;
                self.num_hot += 1;
            }
        } else if self.num_hot > target && self.num_hot > 0 {
            if let Some(line) = self
                .list
                .iter(&LruLinks(table))
                .nth((self.num_hot - 1) as usize)
            {
                table.get_mut(line).hot = false;
                self.num_hot -= 1;
            }
        }
    }

    fn push_front<W: BitWord>(&mut self, table: &mut MetadataTable<W>, line: CacheLineId) {
        self.list.push_front(&mut LruLinks(table), line);
        table.get_mut(line).hot = false;
        self.rebalance(table);
    }

    fn remove<W: BitWord>(&mut self, table: &mut MetadataTable<W>, line: CacheLineId) {
        if table.get(line).hot {
            self.num_hot = self.num_hot.saturating_sub(1);
        }
        self.list.remove(&mut LruLinks(table), line);
        self.rebalance(table);
    }

    fn pop_tail<W: BitWord>(&mut self, table: &mut MetadataTable<W>) -> CacheLineId {
        let victim = self.list.tail();
        if victim != INVALID {
            self.remove(table, victim);
        }
        victim
    }
}

/// Runtime state for one user partition: its configured bounds plus its
/// clean/dirty LRU stripes.
#[derive(Debug)]
struct PartitionState {
    id: PartitionId,
    priority: i32,
    pinned: bool,
    min_size: u32,
    max_size: u32,
    curr_size: core::sync::atomic::AtomicU32,
    clean: Vec<LruStripe>,
    dirty: Vec<LruStripe>,
}

impl PartitionState {
    fn new(id: PartitionId, priority: i32, pinned: bool, min_size: u32, max_size: u32) -> Self {
        PartitionState {
            id,
            priority,
            pinned,
            min_size,
            max_size,
            curr_size: core::sync::atomic::AtomicU32::new(0),
            clean: (0..NUM_LRU_LISTS).map(|_| LruStripe::new(true)).collect(),
            dirty: (0..NUM_LRU_LISTS).map(|_| LruStripe::new(true)).collect(),
        }
    }

    fn curr_size(&self) -> u32 {
        self.curr_size.load(core::sync::atomic::Ordering::Relaxed)
    }

    fn is_overflowing(&self) -> bool {
        self.curr_size() > self.max_size
    }
}

fn stripe_of(line: CacheLineId) -> usize {
    (line % NUM_LRU_LISTS) as usize
}

/// Owns every partition's LRU state plus the freelist, over a shared
/// [`MetadataTable`].
#[derive(Debug)]
pub struct SpaceManager {
    partitions: Vec<PartitionState>,
    freelist: Vec<LruStripe>,
    total_lines: u32,
}

/// One partition's configuration as seen by the space manager; mirrors
/// [`crate::config::PartitionConfig`] but already resolved to absolute
/// line counts.
#[derive(Debug, Clone, Copy)]
pub struct PartitionSizing {
    /// Partition identity.
    pub id: PartitionId,
    /// Eviction priority; lower serves first. Pinned partitions are
    /// skipped entirely by priority-based eviction.
    pub priority: i32,
    /// Never evict from this partition.
    pub pinned: bool,
    /// Minimum guaranteed cache lines.
    pub min_size: u32,
    /// Maximum allowed cache lines.
    pub max_size: u32,
}

impl SpaceManager {
    /// Builds a space manager for `total_lines` physical cache lines and
    /// the given partition sizings, with every line starting in the
    /// freelist (§4.4 "Freelist population").
    #[must_use]
    pub fn new<W: BitWord>(table: &mut MetadataTable<W>, partitions: &[PartitionSizing]) -> Self {
        let mut mgr = SpaceManager {
            partitions: partitions
                .iter()
                .map(|p| PartitionState::new(p.id, p.priority, p.pinned, p.min_size, p.max_size))
                .collect(),
            freelist: (0..NUM_LRU_LISTS).map(|_| LruStripe::new(false)).collect(),
            total_lines: table.len(),
        };
        for line in 0..table.len() {
            let stripe = stripe_of(line);
            mgr.freelist[stripe].push_front(table, line);
        }
        mgr
    }

    /// Total number of cache lines under management.
    #[must_use]
    pub fn total_lines(&self) -> u32 {
        self.total_lines
    }

    /// Number of lines still on the freelist.
    #[must_use]
    pub fn freelist_size(&self) -> u32 {
        self.freelist.iter().map(|s| s.list.len()).sum()
    }

    /// Current occupancy of `partition`.
    #[must_use]
    pub fn curr_size(&self, partition: PartitionId) -> u32 {
        self.partitions
            .iter()
            .find(|p| p.id == partition)
            .map_or(0, PartitionState::curr_size)
    }

    fn partition_mut(&mut self, id: PartitionId) -> &mut PartitionState {
        self.partitions
            .iter_mut()
            .find(|p| p.id == id)
            .expect("partition id must be configured")
    }

    fn partition(&self, id: PartitionId) -> &PartitionState {
        self.partitions
            .iter()
            .find(|p| p.id == id)
            .expect("partition id must be configured")
    }

    /// True if `partition` has room for one more line without overflowing
    /// its configured maximum.
    #[must_use]
    pub fn has_space(&self, partition: PartitionId) -> bool {
        self.partition(partition).curr_size() < self.partition(partition).max_size
    }

    /// Moves `line` from the freelist into `dst` (clean list), incrementing
    /// `dst`'s counter. Precondition: `line` is currently in the freelist.
    pub fn insert_from_freelist<W: BitWord>(
        &mut self,
        table: &mut MetadataTable<W>,
        line: CacheLineId,
        dst: PartitionId,
    ) {
        let stripe = stripe_of(line);
        self.freelist[stripe].remove(table, line);
        table.get_mut(line).partition = dst;
        self.partition_mut(dst)
            .clean
            .get_mut(stripe)
            .expect("stripe index in range")
            .push_front(table, line);
        self.partition_mut(dst)
            .curr_size
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }

    /// Moves `line` from `dst`'s LRU back onto the freelist, clearing its
    /// partition assignment.
    pub fn return_to_freelist<W: BitWord>(&mut self, table: &mut MetadataTable<W>, line: CacheLineId) {
        let src = table.get(line).partition;
        let stripe = stripe_of(line);
        let dirty = !table.get(line).is_clean();
        let part = self.partition_mut(src);
        if dirty {
            part.dirty[stripe].remove(table, line);
        } else {
            part.clean[stripe].remove(table, line);
        }
        part.curr_size.fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
        table.get_mut(line).partition = PartitionId::FREELIST;
        self.freelist[stripe].push_front(table, line);
    }

    /// `repart(line, src, dst)`: moves `line` from `src`'s LRU (clean or
    /// dirty, whichever it currently sits in) to the head of `dst`'s same
    /// sub-list, updating both partitions' counters (§4.4 "Repartition").
    pub fn repart<W: BitWord>(
        &mut self,
        table: &mut MetadataTable<W>,
        line: CacheLineId,
        dst: PartitionId,
    ) {
        let src = table.get(line).partition;
        if src == dst {
            return;
        }
        let stripe = stripe_of(line);
        let dirty = !table.get(line).is_clean();
        {
            let src_part = self.partition_mut(src);
            if dirty {
                src_part.dirty[stripe].remove(table, line);
            } else {
                src_part.clean[stripe].remove(table, line);
            }
            src_part
                .curr_size
                .fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
        }
        table.get_mut(line).partition = dst;
        {
            let dst_part = self.partition_mut(dst);
            if dirty {
                dst_part.dirty[stripe].push_front(table, line);
            } else {
                dst_part.clean[stripe].push_front(table, line);
            }
            dst_part
                .curr_size
                .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        }
    }

    /// `hot_cline`: on a HIT, moves `line` to the head of its current
    /// clean/dirty sub-list (§4.4 "Hot promotion"). A no-op on freelist
    /// lines, which never track recency.
    pub fn hot_cline<W: BitWord>(&mut self, table: &mut MetadataTable<W>, line: CacheLineId) {
        let part_id = table.get(line).partition;
        if part_id.is_freelist() {
            return;
        }
        let stripe = stripe_of(line);
        let dirty = !table.get(line).is_clean();
        let part = self.partition_mut(part_id);
        let list = if dirty {
            &mut part.dirty[stripe]
        } else {
            &mut part.clean[stripe]
        };
        list.list.move_to_front(&mut LruLinks(table), line);
        table.get_mut(line).hot = true;
        list.rebalance(table);
    }

    /// Moves `line` between its partition's dirty and clean sub-lists
    /// without changing partition, e.g. after the last dirty sector of a
    /// line is cleaned or the first dirtying write lands (§4.4 "Dirty ↔
    /// clean transitions"). `now_dirty` is the line's state *after* the
    /// bitmap mutation that triggered this call.
    pub fn move_dirty_clean<W: BitWord>(
        &mut self,
        table: &mut MetadataTable<W>,
        line: CacheLineId,
        now_dirty: bool,
    ) {
        let part_id = table.get(line).partition;
        if part_id.is_freelist() {
            return;
        }
        let stripe = stripe_of(line);
        let part = self.partition_mut(part_id);
        if now_dirty {
            part.clean[stripe].remove(table, line);
            part.dirty[stripe].push_front(table, line);
        } else {
            part.dirty[stripe].remove(table, line);
            part.clean[stripe].push_front(table, line);
        }
    }

    /// Pops one line off the freelist, round-robin across stripes starting
    /// at `start_stripe` (§4.4 "Free-next").
    pub fn free_next<W: BitWord>(
        &mut self,
        table: &mut MetadataTable<W>,
        start_stripe: u32,
    ) -> Option<CacheLineId> {
        for i in 0..NUM_LRU_LISTS {
            let idx = ((start_stripe + i) % NUM_LRU_LISTS) as usize;
            let victim = self.freelist[idx].pop_tail(table);
            if victim != INVALID {
                return Some(victim);
            }
        }
        None
    }

    /// Walks `partition`'s clean-then-dirty stripes from the tail looking
    /// for a victim that satisfies every eviction invariant in §4.4:
    /// not pinned, not within `in_request_range`, WR-lockable without
    /// blocking, and free of alock waiters. Returns the first acceptable
    /// victim, already WR-locked, or `None` if the partition has no
    /// acceptable candidate.
    pub fn evict_from_partition<W: BitWord>(
        &mut self,
        table: &mut MetadataTable<W>,
        alock: &AsyncLock,
        partition: PartitionId,
        start_stripe: u32,
        in_request_range: impl Fn(CoreId, CoreLine) -> bool,
    ) -> Option<CacheLineId> {
        if self.partition(partition).pinned {
            return None;
        }
        for i in 0..NUM_LRU_LISTS {
            let idx = ((start_stripe + i) % NUM_LRU_LISTS) as usize;
            // Clean lines are preferred eviction candidates; fall back to
            // dirty ones only once a stripe has none left. The caller is
            // responsible for writing a dirty victim's sectors back to its
            // current core line before reusing it.
            for dirty in [false, true] {
                let candidates: Vec<CacheLineId> = {
                    let part = self.partition(partition);
                    let list = if dirty { &part.dirty[idx] } else { &part.clean[idx] };
                    list.list.iter_rev(&LruLinks(table)).collect()
                };
                for candidate in candidates {
                    let meta = table.get(candidate);
                    if in_request_range(meta.core_id, meta.core_line) {
                        continue;
                    }
                    if !alock.try_lock(candidate, LockRw::Write) {
                        continue;
                    }
                    // Victim accepted: remove from this LRU so the caller
                    // can remap it. Partition membership is left as-is;
                    // the caller calls `repart`/`insert_from_freelist`
                    // style bookkeeping once the collision entry is
                    // rewritten.
                    let part = self.partition_mut(partition);
                    let list = if dirty { &mut part.dirty[idx] } else { &mut part.clean[idx] };
                    list.remove(table, candidate);
                    part.curr_size.fetch_sub(1, core::sync::atomic::Ordering::Relaxed);
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Places a line just returned by [`SpaceManager::evict_from_partition`]
    /// into `dst`'s clean list, assigning it to `dst`. The victim is already
    /// detached from its old partition's LRU and that partition's
    /// `curr_size` already reflects its removal, so this does not go through
    /// [`SpaceManager::repart`]/[`SpaceManager::insert_from_freelist`] (both
    /// of which assume the line is still linked wherever they expect to
    /// remove it from).
    pub fn place_evicted_line<W: BitWord>(
        &mut self,
        table: &mut MetadataTable<W>,
        line: CacheLineId,
        dst: PartitionId,
    ) {
        let stripe = stripe_of(line);
        table.get_mut(line).partition = dst;
        let part = self.partition_mut(dst);
        part.clean[stripe].push_front(table, line);
        part.curr_size.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }

    /// Finds the lowest-occupancy-relative-to-`max_size` partition that is
    /// currently overflowing, preferring the partition the caller names
    /// (`prefer`) when it is itself overflowing (§4.4 "Request-level
    /// remap": evict from overflown partitions across all parts, pinned
    /// included).
    #[must_use]
    pub fn any_overflowing_partition(&self, prefer: PartitionId) -> Option<PartitionId> {
        if self.partition(prefer).is_overflowing() {
            return Some(prefer);
        }
        self.partitions
            .iter()
            .find(|p| p.is_overflowing())
            .map(|p| p.id)
    }

    /// Partitions whose priority is numerically `<=` target's and which
    /// are not pinned, ordered by ascending priority (served first), for
    /// the "evict from parts with priority <= target priority" remap step.
    #[must_use]
    pub fn partitions_at_or_below_priority(&self, target_priority: i32) -> Vec<PartitionId> {
        let mut candidates: Vec<&PartitionState> = self
            .partitions
            .iter()
            .filter(|p| !p.pinned && p.priority <= target_priority)
            .collect();
        candidates.sort_by_key(|p| p.priority);
        candidates.into_iter().map(|p| p.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Width8;

    fn sizing(id: u16, priority: i32, max: u32) -> PartitionSizing {
        PartitionSizing {
            id: PartitionId(id),
            priority,
            pinned: false,
            min_size: 0,
            max_size: max,
        }
    }

    #[test]
    fn fresh_manager_puts_everything_on_freelist() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(64);
        let mgr = SpaceManager::new(&mut table, &[sizing(0, 0, 64)]);
        assert_eq!(mgr.freelist_size(), 64);
        assert_eq!(mgr.curr_size(PartitionId(0)), 0);
    }

    #[test]
    fn insert_from_freelist_moves_one_line() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(8);
        let mut mgr = SpaceManager::new(&mut table, &[sizing(0, 0, 8)]);
        let line = mgr.free_next(&mut table, 0).unwrap();
        mgr.insert_from_freelist(&mut table, line, PartitionId(0));
        assert_eq!(mgr.curr_size(PartitionId(0)), 1);
        assert_eq!(mgr.freelist_size(), 7);
        assert_eq!(table.get(line).partition, PartitionId(0));
    }

    #[test]
    fn hot_cline_promotes_and_rebalances() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(8);
        let mut mgr = SpaceManager::new(&mut table, &[sizing(0, 0, 8)]);
        let mut lines = Vec::new();
        for _ in 0..4 {
            let line = mgr.free_next(&mut table, 0).unwrap();
            mgr.insert_from_freelist(&mut table, line, PartitionId(0));
            lines.push(line);
        }
        mgr.hot_cline(&mut table, lines[3]);
        assert!(table.get(lines[3]).hot);
    }

    #[test]
    fn repart_moves_between_partitions() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(8);
        let mut mgr = SpaceManager::new(&mut table, &[sizing(0, 0, 8), sizing(1, 1, 8)]);
        let line = mgr.free_next(&mut table, 0).unwrap();
        mgr.insert_from_freelist(&mut table, line, PartitionId(0));
        mgr.repart(&mut table, line, PartitionId(1));
        assert_eq!(mgr.curr_size(PartitionId(0)), 0);
        assert_eq!(mgr.curr_size(PartitionId(1)), 1);
        assert_eq!(table.get(line).partition, PartitionId(1));
    }

    #[test]
    fn dirty_clean_transition_moves_sublist_not_partition() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(8);
        let mut mgr = SpaceManager::new(&mut table, &[sizing(0, 0, 8)]);
        let line = mgr.free_next(&mut table, 0).unwrap();
        mgr.insert_from_freelist(&mut table, line, PartitionId(0));
        table.get_mut(line).bitmaps.set_valid(0, 0);
        table.get_mut(line).bitmaps.set_dirty(0, 0);
        mgr.move_dirty_clean(&mut table, line, true);
        assert_eq!(mgr.curr_size(PartitionId(0)), 1);
        table.get_mut(line).bitmaps.clear_dirty(0, 0);
        mgr.move_dirty_clean(&mut table, line, false);
        assert_eq!(mgr.curr_size(PartitionId(0)), 1);
    }

    #[test]
    fn evict_skips_pinned_and_in_range_candidates() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(4);
        let mut mgr = SpaceManager::new(&mut table, &[sizing(0, 0, 4)]);
        let mut lines = Vec::new();
        for i in 0..4u64 {
            let line = mgr.free_next(&mut table, 0).unwrap();
            mgr.insert_from_freelist(&mut table, line, PartitionId(0));
            table.get_mut(line).core_id = 0;
            table.get_mut(line).core_line = i;
            lines.push(line);
        }
        let alock = AsyncLock::new(4);
        let victim = mgr.evict_from_partition(&mut table, &alock, PartitionId(0), 0, |core_id, core_line| {
            core_id == 0 && core_line == lines.len() as u64 - 1
        });
        assert!(victim.is_some());
        assert_ne!(table.get(victim.unwrap()).core_line, lines.len() as u64 - 1);
    }

    #[test]
    fn any_overflowing_partition_detects_overflow() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(4);
        let mut mgr = SpaceManager::new(&mut table, &[sizing(0, 0, 1)]);
        for _ in 0..2 {
            let line = mgr.free_next(&mut table, 0).unwrap();
            mgr.insert_from_freelist(&mut table, line, PartitionId(0));
        }
        assert_eq!(mgr.any_overflowing_partition(PartitionId(0)), Some(PartitionId(0)));
    }

    #[test]
    fn partitions_at_or_below_priority_orders_ascending() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(4);
        let mgr = SpaceManager::new(&mut table, &[sizing(2, 2, 4), sizing(0, 0, 4), sizing(1, 1, 4)]);
        let order = mgr.partitions_at_or_below_priority(2);
        assert_eq!(order, vec![PartitionId(0), PartitionId(1), PartitionId(2)]);
    }
}
