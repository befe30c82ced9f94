//! The cache-line metadata table: the arena every other subsystem indexes.
//!
//! One [`CacheLineMeta`] record exists per physical cache line. It carries
//! the mapping `(core_id, core_line)`, the sector bitmaps, and the two
//! pairs of links a line participates in simultaneously — a collision
//! chain and an LRU stripe — as plain `u32` indices (§9 Design Notes).

use crate::arena_list::LinkStore;
use crate::bitmap::{BitWord, LineBitmaps};
use crate::types::{PartitionId, CORE_ID_INVALID, INVALID};

/// One physical cache line's metadata.
#[derive(Debug, Clone)]
pub struct CacheLineMeta<W: BitWord> {
    /// The core this line is mapped to, or [`CORE_ID_INVALID`].
    pub core_id: u16,
    /// The core-relative line number this cache line holds, meaningless if
    /// `core_id == CORE_ID_INVALID`.
    pub core_line: u64,
    /// Partition this line currently belongs to.
    pub partition: PartitionId,
    /// Valid/dirty sector bitmaps.
    pub bitmaps: LineBitmaps<W>,
    /// Previous entry in this line's collision chain bucket.
    pub coll_prev: u32,
    /// Next entry in this line's collision chain bucket.
    pub coll_next: u32,
    /// Previous entry in this line's LRU stripe.
    pub lru_prev: u32,
    /// Next entry in this line's LRU stripe.
    pub lru_next: u32,
    /// Whether this line currently sits in the hot prefix of its LRU list.
    pub hot: bool,
}

impl<W: BitWord> CacheLineMeta<W> {
    /// A freshly allocated, unmapped line sitting in no chain or list yet.
    #[must_use]
    pub fn unmapped() -> Self {
        CacheLineMeta {
            core_id: CORE_ID_INVALID,
            core_line: 0,
            partition: PartitionId::FREELIST,
            bitmaps: LineBitmaps::empty(),
            coll_prev: INVALID,
            coll_next: INVALID,
            lru_prev: INVALID,
            lru_next: INVALID,
            hot: false,
        }
    }

    /// True if this line currently maps a core line.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.core_id != CORE_ID_INVALID
    }

    /// True if this line has no dirty sectors.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.bitmaps.is_clean()
    }
}

/// The full per-cache table, indexed by [`crate::types::CacheLineId`].
#[derive(Debug, Clone)]
pub struct MetadataTable<W: BitWord> {
    lines: Vec<CacheLineMeta<W>>,
}

impl<W: BitWord> MetadataTable<W> {
    /// Allocates `num_lines` unmapped entries.
    #[must_use]
    pub fn new(num_lines: u32) -> Self {
        MetadataTable {
            lines: (0..num_lines).map(|_| CacheLineMeta::unmapped()).collect(),
        }
    }

    /// Number of physical cache lines.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.lines.len() as u32
    }

    /// True if the table has zero lines (not a meaningful configuration,
    /// but a safe one).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Immutable access to one line's metadata.
    #[must_use]
    pub fn get(&self, line: u32) -> &CacheLineMeta<W> {
        &self.lines[line as usize]
    }

    /// Mutable access to one line's metadata.
    pub fn get_mut(&mut self, line: u32) -> &mut CacheLineMeta<W> {
        &mut self.lines[line as usize]
    }
}

/// Adapts a [`MetadataTable`] to the collision-chain [`LinkStore`].
pub struct CollisionLinks<'a, W: BitWord>(pub &'a mut MetadataTable<W>);

impl<'a, W: BitWord> LinkStore for CollisionLinks<'a, W> {
    fn prev(&self, index: u32) -> u32 {
        self.0.get(index).coll_prev
    }
    fn set_prev(&mut self, index: u32, value: u32) {
        self.0.get_mut(index).coll_prev = value;
    }
    fn next(&self, index: u32) -> u32 {
        self.0.get(index).coll_next
    }
    fn set_next(&mut self, index: u32, value: u32) {
        self.0.get_mut(index).coll_next = value;
    }
}

/// Read-only view of the collision-chain links, for chain traversal that
/// must not require exclusive access to the metadata table (lookup holds
/// only the bucket's read lock). `set_prev`/`set_next` are unreachable: the
/// [`IndexList`](crate::arena_list::IndexList) iterators never call them.
pub struct CollisionLinksRef<'a, W: BitWord>(pub &'a MetadataTable<W>);

impl<'a, W: BitWord> LinkStore for CollisionLinksRef<'a, W> {
    fn prev(&self, index: u32) -> u32 {
        self.0.get(index).coll_prev
    }
    fn set_prev(&mut self, _index: u32, _value: u32) {
        unreachable!("read-only collision chain view")
    }
    fn next(&self, index: u32) -> u32 {
        self.0.get(index).coll_next
    }
    fn set_next(&mut self, _index: u32, _value: u32) {
        unreachable!("read-only collision chain view")
    }
}

/// Adapts a [`MetadataTable`] to the LRU-stripe [`LinkStore`].
pub struct LruLinks<'a, W: BitWord>(pub &'a mut MetadataTable<W>);

impl<'a, W: BitWord> LinkStore for LruLinks<'a, W> {
    fn prev(&self, index: u32) -> u32 {
        self.0.get(index).lru_prev
    }
    fn set_prev(&mut self, index: u32, value: u32) {
        self.0.get_mut(index).lru_prev = value;
    }
    fn next(&self, index: u32) -> u32 {
        self.0.get(index).lru_next
    }
    fn set_next(&mut self, index: u32, value: u32) {
        self.0.get_mut(index).lru_next = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena_list::IndexList;
    use crate::bitmap::Width8;

    #[test]
    fn fresh_table_lines_are_unmapped_and_freelisted() {
        let table: MetadataTable<Width8> = MetadataTable::new(16);
        for i in 0..table.len() {
            let m = table.get(i);
            assert!(!m.is_mapped());
            assert_eq!(m.partition, PartitionId::FREELIST);
        }
    }

    #[test]
    fn collision_links_thread_independent_of_lru_links() {
        let mut table: MetadataTable<Width8> = MetadataTable::new(4);
        let mut coll = IndexList::new();
        let mut lru = IndexList::new();
        coll.push_front(&mut CollisionLinks(&mut table), 0);
        coll.push_front(&mut CollisionLinks(&mut table), 1);
        lru.push_back(&mut LruLinks(&mut table), 2);
        lru.push_back(&mut LruLinks(&mut table), 3);

        let coll_order: Vec<u32> = coll.iter(&CollisionLinks(&mut table)).collect();
        assert_eq!(coll_order, vec![1, 0]);
        let lru_order: Vec<u32> = lru.iter(&LruLinks(&mut table)).collect();
        assert_eq!(lru_order, vec![2, 3]);

        // The two chains never touch each other's link fields.
        assert_eq!(table.get(0).lru_prev, INVALID);
        assert_eq!(table.get(2).coll_prev, INVALID);
    }
}
