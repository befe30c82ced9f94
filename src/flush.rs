//! Interruptible cache-wide and per-core flush (§4.1 "Ops" engine, §5
//! "Cancellation & timeouts", §8 scenario S7).
//!
//! Flush walks every physical cache line looking for dirty sectors and
//! writes them back to core, checking [`Cache::flush_interrupt`] every
//! [`PORTION_SIZE`] lines so a long-running flush can be cut short without
//! waiting for the whole cache to drain. An interrupted flush leaves
//! whatever lines it already cleaned as clean — there is no rollback.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::alock::LockRw;
use crate::bitmap::Width128;
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::metadata::CacheLineMeta;
use crate::metrics::StatEvent;
use crate::types::{CacheLineId, CoreId};

/// Number of lines flushed between interruption checks.
const PORTION_SIZE: u32 = 64;

/// `cache_flush`: writes back every dirty line in the cache.
pub(crate) fn flush_cache(cache: &Arc<Cache>) -> Result<()> {
    flush_matching(cache, None)
}

/// `core_flush`: writes back dirty lines belonging to `core_id` only.
pub(crate) fn flush_core(cache: &Arc<Cache>, core_id: CoreId) -> Result<()> {
    flush_matching(cache, Some(core_id))
}

fn flush_matching(cache: &Arc<Cache>, only_core: Option<CoreId>) -> Result<()> {
    if !cache.is_running() {
        return Err(Error::CacheIncomplete);
    }
    if cache.flush_in_progress.swap(true, Ordering::AcqRel) {
        return Err(Error::FlushInProgress);
    }

    let result = run_flush(cache, only_core);

    cache.flush_in_progress.store(false, Ordering::Release);
    result
}

fn run_flush(cache: &Arc<Cache>, only_core: Option<CoreId>) -> Result<()> {
    cache.flushing_interrupted.store(false, Ordering::Release);
    let total_lines = cache.mapping.read().table.len();

    // Give the cleaning-policy hook first refusal on which core lines to
    // clean this round (§4.5). `NopCleaning` always proposes nothing, so a
    // cache left on the default policy sees exactly the old full linear
    // scan below; an embedder's own policy gets its candidates flushed
    // ahead of everything else.
    let hinted = cache.cleaning_policy.read().cores_to_clean(PORTION_SIZE as usize);
    if !hinted.is_empty() {
        let hinted: std::collections::HashSet<_> = hinted.into_iter().collect();
        for line in 0..total_lines {
            let matches = {
                let mapping = cache.mapping.read();
                let meta = mapping.table.get(line);
                meta.is_mapped() && hinted.contains(&meta.core_line)
            };
            if !matches {
                continue;
            }
            if cache.flushing_interrupted.load(Ordering::Acquire) {
                return Err(Error::FlushingInterrupted);
            }
            if let Some(e) = flush_one_line(cache, line, only_core) {
                return Err(e);
            }
        }
    }

    for line in 0..total_lines {
        if line % PORTION_SIZE == 0 && cache.flushing_interrupted.load(Ordering::Acquire) {
            return Err(Error::FlushingInterrupted);
        }
        if let Some(e) = flush_one_line(cache, line, only_core) {
            return Err(e);
        }
    }
    Ok(())
}

/// Flushes one line if it is mapped, matches `only_core` (when given), and
/// has at least one dirty sector. Returns `Some(error)` on I/O failure,
/// `None` on success (including the common case of nothing to do).
fn flush_one_line(cache: &Arc<Cache>, line: CacheLineId, only_core: Option<CoreId>) -> Option<Error> {
    let (core_id, core_line, runs, partition) = {
        let mapping = cache.mapping.read();
        let meta = mapping.table.get(line);
        if !meta.is_mapped() || meta.is_clean() {
            return None;
        }
        if let Some(want) = only_core {
            if meta.core_id != want {
                return None;
            }
        }
        let runs = dirty_sector_runs(meta);
        if runs.is_empty() {
            return None;
        }
        (meta.core_id, meta.core_line, runs, meta.partition)
    };

    crate::engine::blocking_lock(&cache.alock, line, LockRw::Write);

    // Re-check under the lock: the line may have been evicted, discarded,
    // or already cleaned between the scan above and acquiring the alock.
    let recheck = {
        let mapping = cache.mapping.read();
        let meta = mapping.table.get(line);
        meta.is_mapped() && meta.core_id == core_id && meta.core_line == core_line && !meta.is_clean()
    };
    if !recheck {
        cache.alock.unlock_wr(line);
        return None;
    }

    let core_volume = match cache.core_volume(core_id) {
        Ok(v) => v,
        Err(_) => {
            cache.alock.unlock_wr(line);
            return None;
        }
    };

    let (cache_line_bytes, sector_bytes) = {
        let config = cache.config.read();
        (config.cache_line_size.bytes(), crate::types::SECTOR_SIZE)
    };

    // Each contiguous dirty run is flushed on its own: the sectors between
    // two non-adjacent dirty runs may be invalid, and reading a `[min, max]`
    // span across them would stamp cache garbage over untouched core data
    // (§7 "Lost cache data never corrupts core data").
    let mut became_clean = false;
    for (start, stop) in runs {
        let span_len = (u64::from(stop - start + 1) * sector_bytes) as usize;
        let mut buf = vec![0u8; span_len];
        let cache_offset = u64::from(line) * cache_line_bytes + u64::from(start) * sector_bytes;
        let core_offset = core_line * cache_line_bytes + u64::from(start) * sector_bytes;

        let io_result = cache
            .cache_volume
            .read(cache_offset, &mut buf)
            .and_then(|()| core_volume.write(core_offset, &buf));

        match io_result {
            Ok(()) => {
                let mut mapping = cache.mapping.write();
                let meta = mapping.table.get_mut(line);
                let still_dirty = meta.bitmaps.clear_dirty(start, stop);
                became_clean = !still_dirty;
                if became_clean {
                    mapping.space.move_dirty_clean(&mut mapping.table, line, false);
                }
            }
            Err(e) => {
                cache.alock.unlock_wr(line);
                cache.record_cache_error(core_id);
                cache.record_core_error(core_id);
                return Some(e);
            }
        }
    }

    cache.alock.unlock_wr(line);

    if became_clean {
        cache.cleaning_policy.read().purge_cache_block(line);
        cache.stats.record(StatEvent::Cleaned { partition });
    }
    None
}

/// Finds each maximal contiguous inclusive `[start, stop]` run of dirty
/// bits, in ascending order. A line with non-contiguous dirty sectors (e.g.
/// sector 2 dirtied by one write and sector 6 by another, with 3-5 left
/// invalid) must be written back one run at a time rather than as a single
/// `[min, max]` span, since the sectors between two runs may never have
/// held valid data at all (§7 "Lost cache data never corrupts core data").
/// A linear scan over the full 128-bit width is cheap and stays correct
/// regardless of the configured cache-line size, since unused high bits for
/// a smaller line are never set (§4.3). Also used by `engine.rs`'s PT-mode
/// clean-before-passthrough step and by `engine.rs`'s eviction path, both of
/// which write back the same kind of dirty runs this module does.
pub(crate) fn dirty_sector_runs(meta: &CacheLineMeta<Width128>) -> Vec<(u8, u8)> {
    let mut runs = Vec::new();
    let mut start = None;
    for bit in 0..128u8 {
        let dirty = meta.bitmaps.dirty.test(bit, bit, false);
        match (dirty, start) {
            (true, None) => start = Some(bit),
            (false, Some(s)) => {
                runs.push((s, bit - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, 127));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CoreConfig};
    use crate::types::CacheMode;
    use crate::volume::MemVolume;

    fn wb_cache(num_lines: u32) -> (Arc<Cache>, Arc<MemVolume>) {
        let mut cfg = CacheConfig::default();
        cfg.num_cache_lines = num_lines;
        cfg.cache_mode = CacheMode::Wb;
        let cache_vol = Arc::new(MemVolume::new(u64::from(num_lines) * 4096));
        let cache = Cache::new(cfg, cache_vol).unwrap();
        let core_vol = Arc::new(MemVolume::new(1024 * 1024));
        cache.add_core(0, CoreConfig::default(), Arc::clone(&core_vol)).unwrap();
        (cache, core_vol)
    }

    #[test]
    fn flush_writes_back_dirty_lines() {
        let (cache, core_vol) = wb_cache(4);
        cache.write(0, 0, &[6u8; 512]).unwrap();
        assert_eq!(cache.dirty_line_count(), 1);

        flush_cache(&cache).unwrap();

        assert_eq!(cache.dirty_line_count(), 0);
        let mut buf = [0u8; 512];
        core_vol.read(0, &mut buf).unwrap();
        assert_eq!(buf, [6u8; 512]);
    }

    #[test]
    fn flush_interrupt_stops_at_next_portion() {
        let (cache, _core_vol) = wb_cache(4);
        cache.write(0, 0, &[1u8; 512]).unwrap();
        cache.flush_interrupt();
        assert_eq!(flush_cache(&cache), Err(Error::FlushingInterrupted));
    }

    #[test]
    fn concurrent_flush_is_rejected() {
        let (cache, _core_vol) = wb_cache(4);
        cache.write(0, 0, &[1u8; 512]).unwrap();
        cache.flush_in_progress.store(true, Ordering::Release);
        assert_eq!(flush_cache(&cache), Err(Error::FlushInProgress));
        cache.flush_in_progress.store(false, Ordering::Release);
    }

    #[test]
    fn dirty_runs_finds_single_contiguous_range() {
        let mut meta: CacheLineMeta<Width128> = CacheLineMeta::unmapped();
        meta.bitmaps.set_valid(2, 5);
        meta.bitmaps.set_dirty(2, 5);
        assert_eq!(dirty_sector_runs(&meta), vec![(2, 5)]);
    }

    #[test]
    fn dirty_runs_splits_non_contiguous_ranges() {
        let mut meta: CacheLineMeta<Width128> = CacheLineMeta::unmapped();
        meta.bitmaps.set_valid(2, 2);
        meta.bitmaps.set_dirty(2, 2);
        meta.bitmaps.set_valid(6, 6);
        meta.bitmaps.set_dirty(6, 6);
        assert_eq!(dirty_sector_runs(&meta), vec![(2, 2), (6, 6)]);
    }

    #[test]
    fn flush_writes_back_only_dirty_runs_leaving_gap_untouched() {
        let (cache, core_vol) = wb_cache(4);
        // Pre-seed core with a sentinel so the gap sectors (8..15, i.e. the
        // second 4 KiB half is really sectors 0..7 of line index 1 — use a
        // single line and two distinct byte ranges within it instead).
        core_vol.write(0, &[0xAAu8; 4096]).unwrap();

        cache.write(0, 0, &[1u8; 512]).unwrap();
        cache.write(0, 3 * 512, &[2u8; 512]).unwrap();
        assert_eq!(cache.dirty_line_count(), 1);

        flush_cache(&cache).unwrap();

        let mut buf = [0u8; 4096];
        core_vol.read(0, &mut buf).unwrap();
        assert_eq!(&buf[0..512], &[1u8; 512][..]);
        assert_eq!(&buf[3 * 512..4 * 512], &[2u8; 512][..]);
        // Sectors 1-2 were never written by the host and must still read
        // back the pre-existing core content, not cache-side garbage.
        assert_eq!(&buf[512..3 * 512], &[0xAAu8; 1024][..]);
    }
}
