//! The host request object (§3 "Request").
//!
//! A `Request` is built once by the dispatcher from a host I/O and carries
//! every piece of per-core-line state an engine needs as it walks the
//! `lookup -> map/evict -> lock -> submit -> complete` pipeline (§4.1).

use crate::types::{CacheLineId, CacheMode, CoreId, CoreLine, Direction, LookupStatus, INVALID};

/// Per-core-line mapping entry populated during traversal (§3 `map[]`).
#[derive(Debug, Clone, Copy)]
pub struct MapEntry {
    /// Core this entry belongs to.
    pub core_id: CoreId,
    /// Core-relative line number this entry targets.
    pub core_line: CoreLine,
    /// Collision-table bucket this core line hashes to, filled in by the
    /// engine's first lookup and reused by any re-check on the same entry
    /// (e.g. WI's lock-then-recheck step) instead of rehashing.
    pub hash: u32,
    /// Physical cache line once resolved, or [`INVALID`].
    pub coll_idx: CacheLineId,
    /// Outcome of traversal/remap for this entry.
    pub status: LookupStatus,
    /// First sector touched by the host range within this line.
    pub start_sector: u8,
    /// Last sector touched by the host range within this line (inclusive).
    pub stop_sector: u8,
}

impl MapEntry {
    fn new(core_id: CoreId, core_line: CoreLine, start_sector: u8, stop_sector: u8) -> Self {
        MapEntry {
            core_id,
            core_line,
            hash: 0,
            coll_idx: INVALID,
            status: LookupStatus::Miss,
            start_sector,
            stop_sector,
        }
    }
}

/// Counters populated during traversal (§3 `info`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestInfo {
    /// Number of entries that were already mapped (HIT).
    pub hit_no: u32,
    /// Number of entries with no usable valid data in range.
    pub invalid_no: u32,
    /// Number of entries freshly mapped this request (REMAPPED).
    pub insert_no: u32,
}

/// One host I/O translated into cache-line operations.
#[derive(Debug)]
pub struct Request {
    /// Core this request targets.
    pub core_id: CoreId,
    /// First byte of the host range.
    pub byte_position: u64,
    /// Length of the host range, in bytes.
    pub byte_length: u64,
    /// First core line touched.
    pub core_line_first: CoreLine,
    /// Last core line touched (inclusive).
    pub core_line_last: CoreLine,
    /// Number of core lines touched: `core_line_last - core_line_first + 1`.
    pub core_line_count: u32,
    /// Read or write, from the host's perspective.
    pub direction: Direction,
    /// Effective cache mode resolved by the dispatcher.
    pub mode: CacheMode,
    /// Per-core-line mapping state.
    pub map: Vec<MapEntry>,
    /// Traversal counters.
    pub info: RequestInfo,
    /// Set when the request bypasses cache metadata entirely (D2C).
    pub d2c: bool,
    /// True once sequential cutoff has redirected this request to PT.
    pub seq_cutoff: bool,
    /// Error observed so far; cleared on internal re-entry per §9 design
    /// note 2 (`ocf_engine_push_req_front_if` behavior is preserved: an
    /// internal resubmission clears a stale error rather than surfacing a
    /// leftover one from an earlier pipeline stage).
    pub error: Option<crate::error::Error>,
}

impl Request {
    /// Builds a request for `[byte_position, byte_position + byte_length)`
    /// on `core_id`, precomputing the core-line range and one [`MapEntry`]
    /// per touched line with its in-line sector span.
    #[must_use]
    pub fn new(
        core_id: CoreId,
        byte_position: u64,
        byte_length: u64,
        direction: Direction,
        mode: CacheMode,
        cache_line_bytes: u64,
        sector_bytes: u64,
    ) -> Self {
        assert!(byte_length > 0, "empty requests are rejected by the dispatcher");
        let core_line_first = byte_position / cache_line_bytes;
        let byte_end = byte_position + byte_length - 1;
        let core_line_last = byte_end / cache_line_bytes;
        let core_line_count = (core_line_last - core_line_first + 1) as u32;

        let mut map = Vec::with_capacity(core_line_count as usize);
        for line in core_line_first..=core_line_last {
            let line_start_byte = line * cache_line_bytes;
            let line_end_byte = line_start_byte + cache_line_bytes - 1;
            let span_start = byte_position.max(line_start_byte) - line_start_byte;
            let span_end = byte_end.min(line_end_byte) - line_start_byte;
            let start_sector = (span_start / sector_bytes) as u8;
            let stop_sector = (span_end / sector_bytes) as u8;
            map.push(MapEntry::new(core_id, line, start_sector, stop_sector));
        }

        Request {
            core_id,
            byte_position,
            byte_length,
            core_line_first,
            core_line_last,
            core_line_count,
            direction,
            mode,
            map,
            info: RequestInfo::default(),
            d2c: false,
            seq_cutoff: false,
            error: None,
        }
    }

    /// True if every entry resolved to a hit (no miss and no remap needed).
    #[must_use]
    pub fn fully_mapped(&self) -> bool {
        self.map
            .iter()
            .all(|e| e.status != LookupStatus::Miss)
    }

    /// True if every entry is a [`LookupStatus::Hit`] (used by the fast
    /// read path, which never remaps).
    #[must_use]
    pub fn all_hit(&self) -> bool {
        self.map.iter().all(|e| e.status == LookupStatus::Hit)
    }

    /// Clears a stale error on internal re-entry. See §9 design note 2:
    /// the observable behavior (error cleared when an engine resubmits
    /// itself) is preserved even though the original's rationale for doing
    /// so unconditionally was never documented.
    pub fn clear_error_on_resubmit(&mut self) {
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_request_spans_one_entry() {
        let req = Request::new(0, 0, 512, Direction::Read, CacheMode::Wt, 4096, 512);
        assert_eq!(req.core_line_count, 1);
        assert_eq!(req.map.len(), 1);
        assert_eq!(req.map[0].start_sector, 0);
        assert_eq!(req.map[0].stop_sector, 0);
    }

    #[test]
    fn crossing_request_spans_two_lines_with_correct_sectors() {
        // 4 KiB lines, request from byte 3584 (sector 7 of line 0) through
        // byte 4607 (sector 1 of line 1): 1024 bytes total.
        let req = Request::new(0, 3584, 1024, Direction::Write, CacheMode::Wb, 4096, 512);
        assert_eq!(req.core_line_count, 2);
        assert_eq!(req.map[0].core_line, 0);
        assert_eq!(req.map[0].start_sector, 7);
        assert_eq!(req.map[0].stop_sector, 7);
        assert_eq!(req.map[1].core_line, 1);
        assert_eq!(req.map[1].start_sector, 0);
        assert_eq!(req.map[1].stop_sector, 1);
    }

    #[test]
    fn full_line_request_covers_every_sector() {
        let req = Request::new(0, 0, 4096, Direction::Read, CacheMode::Wt, 4096, 512);
        assert_eq!(req.map[0].start_sector, 0);
        assert_eq!(req.map[0].stop_sector, 7);
    }

    #[test]
    fn fully_mapped_requires_no_misses() {
        let mut req = Request::new(0, 0, 4096, Direction::Read, CacheMode::Wt, 4096, 512);
        assert!(!req.fully_mapped());
        req.map[0].status = LookupStatus::Hit;
        assert!(req.fully_mapped());
    }
}
