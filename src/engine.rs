//! Dispatcher and per-mode engines (§4.1).
//!
//! Every host request resolves to one effective [`CacheMode`] and is then
//! walked one core line at a time through `lookup -> map/evict -> lock ->
//! submit -> complete` (§3, §9 Design Notes). The mapping step holds
//! [`Cache::mapping`]'s coarse lock only long enough to resolve or create a
//! line's collision-table entry and space-manager bookkeeping; the cache
//! and core I/O below runs with that lock released, serialized instead by
//! the per-line [`AsyncLock`] acquired for the duration of the I/O. This
//! crate always takes that per-line lock in [`LockRw::Write`] mode, even
//! for reads that only need to observe existing bitmaps — trading reader
//! parallelism on a single line for a substantially simpler pipeline; see
//! `DESIGN.md`.
//!
//! Six distinct per-mode engines (§4.1 Wt/Wb/Wa/Wi/Wo/Pt) are expressed here
//! as one pipeline parameterized by [`CacheMode`] rather than six separate
//! state machines, since this crate's synchronous volume model collapses
//! most of what differs between them to a handful of branches (whether a
//! write goes through to core immediately, whether a miss backfills the
//! whole line, whether a hit is even allowed to keep its mapping).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::alock::{AsyncLock, LockOutcome, LockRw};
use crate::cache::{Cache, Mapping};
use crate::error::{Error, Result};
use crate::metrics::StatEvent;
use crate::request::{MapEntry, Request};
use crate::types::{
    CacheLineId, CacheMode, CoreId, CoreLine, Direction, LookupStatus, PartitionId, SeqCutoffPolicy,
};
use crate::volume::Volume;

/// Blocks the calling thread until `entry` is acquired in mode `rw`. A thin
/// synchronous facade over [`AsyncLock`]'s callback contract, used by every
/// engine in this crate since [`Cache::read`]/[`Cache::write`] are
/// themselves synchronous (see the `cache` module doc).
pub(crate) fn blocking_lock(alock: &AsyncLock, entry: CacheLineId, rw: LockRw) {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let pair2 = Arc::clone(&pair);
    let outcome = alock.lock(
        entry,
        rw,
        Box::new(move || {
            let (m, cv) = &*pair2;
            *m.lock() = true;
            cv.notify_one();
        }),
    );
    if outcome == LockOutcome::Queued {
        let (m, cv) = &*pair;
        let mut done = m.lock();
        while !*done {
            cv.wait(&mut done);
        }
    }
}

/// Resolves the effective mode for one request, in order (§4.1 "Mode
/// resolution"): fallback pass-through latch, unaligned I/O under
/// `pt_unaligned_io`, a span too large to ever fit the whole cache,
/// sequential cutoff, then the partition's (or cache-wide) configured mode.
fn resolve_effective_mode(
    cache: &Cache,
    core_id: CoreId,
    offset: u64,
    length: u64,
    partition: PartitionId,
) -> Result<CacheMode> {
    if cache.is_fallback_pt() {
        return Ok(CacheMode::Pt);
    }

    let config = cache.config.read();
    let line_bytes = config.cache_line_size.bytes();
    if config.pt_unaligned_io && (offset % line_bytes != 0 || length % line_bytes != 0) {
        return Ok(CacheMode::Pt);
    }
    let core_line_count = (offset + length - 1) / line_bytes - offset / line_bytes + 1;
    if core_line_count > u64::from(config.num_cache_lines) {
        return Ok(CacheMode::Pt);
    }
    let default_mode = config
        .partitions
        .get(partition.0 as usize)
        .and_then(|p| p.cache_mode)
        .unwrap_or(config.cache_mode);
    drop(config);

    let cores = cache.cores.read();
    let core = cores
        .get(core_id as usize)
        .filter(|c| c.active.load(Ordering::Relaxed))
        .ok_or(Error::CoreNotAvail)?;
    let policy = core.config.seq_cutoff_policy;
    let seq_run = core.seq_run_length.load(Ordering::Relaxed);
    let threshold = core.config.seq_cutoff_threshold;
    drop(cores);

    let seq_cutoff = match policy {
        SeqCutoffPolicy::Never => false,
        SeqCutoffPolicy::Always => seq_run >= threshold,
        SeqCutoffPolicy::Full => {
            let cache_full = cache.mapping.read().space.freelist_size() == 0;
            cache_full && seq_run >= threshold
        }
    };
    if seq_cutoff {
        return Ok(CacheMode::Pt);
    }
    Ok(default_mode)
}

/// Updates a core's sequential-run counter: extends it across a request
/// that picks up exactly where the previous one left off, resets it
/// otherwise (§6 "Sequential cutoff").
fn record_sequential_run(cache: &Cache, core_id: CoreId, request: &Request) {
    let cores = cache.cores.read();
    let Some(core) = cores.get(core_id as usize) else {
        return;
    };
    let prev_end = core.last_end_line.swap(request.core_line_last, Ordering::Relaxed);
    if prev_end != u64::MAX && prev_end + 1 == request.core_line_first {
        core.seq_run_length.fetch_add(request.core_line_count, Ordering::Relaxed);
    } else {
        core.seq_run_length.store(request.core_line_count, Ordering::Relaxed);
    }
}

/// Reads a whole cache line's worth of data from `core_volume` into
/// `cache_volume`, used to backfill a line before returning data the
/// request itself does not fully cover.
fn backfill_line(
    cache_volume: &Arc<dyn Volume>,
    core_volume: &Arc<dyn Volume>,
    cache_line: CacheLineId,
    core_line: CoreLine,
    cache_line_bytes: u64,
) -> Result<()> {
    let mut buf = vec![0u8; cache_line_bytes as usize];
    core_volume.read(core_line * cache_line_bytes, &mut buf)?;
    cache_volume.write(u64::from(cache_line) * cache_line_bytes, &buf)
}

/// Resolves `(core_id, core_line)` to a cache line, creating a mapping if
/// none exists: first from the freelist, then by evicting from `partition`
/// (§4.4). The returned line is always already held exclusively in
/// [`AsyncLock`] — taken here for a freelist line (guaranteed idle) or
/// inherited from [`crate::space::SpaceManager::evict_from_partition`] for
/// an evicted one — so callers never need a separate acquisition for the
/// miss path.
///
/// When the freelist is empty, the eviction source is not always
/// `partition` itself: an overflowing partition elsewhere (§4.4 "Partition
/// overflow") is reclaimed first via
/// [`crate::space::SpaceManager::any_overflowing_partition`], then any
/// non-pinned partition at or below `partition_priority` via
/// [`crate::space::SpaceManager::partitions_at_or_below_priority`], before
/// falling back to evicting from `partition` directly.
fn allocate_line(
    cache: &Cache,
    mapping: &mut Mapping,
    alock: &AsyncLock,
    core_id: CoreId,
    core_line: CoreLine,
    partition: PartitionId,
    partition_priority: i32,
) -> Result<CacheLineId> {
    let bucket = mapping.collision.bucket_of(core_id, core_line);
    let stripe = (core_line % u64::from(crate::space::NUM_LRU_LISTS)) as u32;

    if let Some(line) = mapping.space.free_next(&mut mapping.table, stripe) {
        if !alock.try_lock(line, LockRw::Write) {
            return Err(Error::Inval);
        }
        mapping.collision.insert(&mut mapping.table, bucket, line, core_id, core_line);
        mapping.space.insert_from_freelist(&mut mapping.table, line, partition);
        return Ok(line);
    }

    let in_range = |_core_id: CoreId, _core_line: CoreLine| false;
    let source = mapping.space.any_overflowing_partition(partition).or_else(|| {
        mapping
            .space
            .partitions_at_or_below_priority(partition_priority)
            .into_iter()
            .find(|&p| p != partition)
    });
    let victim = match source {
        Some(source) => mapping
            .space
            .evict_from_partition(&mut mapping.table, alock, source, stripe, in_range)
            .or_else(|| mapping.space.evict_from_partition(&mut mapping.table, alock, partition, stripe, in_range)),
        None => mapping.space.evict_from_partition(&mut mapping.table, alock, partition, stripe, in_range),
    }
    .ok_or(Error::NoMem)?;

    // The victim may still carry dirty sectors (a WB/WO line never written
    // back yet): flush them to its *old* core line before its collision
    // entry and bitmaps are torn down below, or that data is lost for good
    // (§7 "dirty data ... is not silently discarded", §8 S2).
    if let Err(e) = flush_victim_before_reuse(cache, mapping, victim) {
        alock.unlock_wr(victim);
        return Err(e);
    }

    let (old_bucket, old_partition) = {
        let meta = mapping.table.get(victim);
        (mapping.collision.bucket_of(meta.core_id, meta.core_line), meta.partition)
    };
    mapping.collision.remove(&mut mapping.table, old_bucket, victim);
    mapping.collision.insert(&mut mapping.table, bucket, victim, core_id, core_line);
    mapping.space.place_evicted_line(&mut mapping.table, victim, partition);
    cache.stats.record(StatEvent::Eviction { partition: old_partition });
    Ok(victim)
}

/// Writes back every dirty sector still held by `victim` to the core line
/// it is currently mapped to, before its cache-side bytes are handed to a
/// new mapping. A no-op for a clean victim. Mirrors `flush::flush_one_line`'s
/// read-then-write, run-by-run pattern (§4.4 eviction, §7).
fn flush_victim_before_reuse(cache: &Cache, mapping: &Mapping, victim: CacheLineId) -> Result<()> {
    let (old_core_id, old_core_line, runs) = {
        let meta = mapping.table.get(victim);
        if meta.is_clean() {
            return Ok(());
        }
        (meta.core_id, meta.core_line, crate::flush::dirty_sector_runs(meta))
    };
    if runs.is_empty() {
        return Ok(());
    }

    let core_volume = cache.core_volume(old_core_id)?;
    let cache_line_bytes = cache.config.read().cache_line_size.bytes();
    let sector_bytes = crate::types::SECTOR_SIZE;

    for (start, stop) in runs {
        let span_len = (u64::from(stop - start + 1) * sector_bytes) as usize;
        let mut buf = vec![0u8; span_len];
        let cache_offset = u64::from(victim) * cache_line_bytes + u64::from(start) * sector_bytes;
        let core_offset = old_core_line * cache_line_bytes + u64::from(start) * sector_bytes;

        if let Err(e) = cache.cache_volume.read(cache_offset, &mut buf) {
            cache.record_cache_error(old_core_id);
            return Err(e);
        }
        if let Err(e) = core_volume.write(core_offset, &buf) {
            cache.record_core_error(old_core_id);
            return Err(e);
        }
    }
    Ok(())
}

/// Consults the promotion-policy hook before a miss is allowed to trigger
/// [`allocate_line`] (§4.5). A refusal is not an error: the caller falls
/// back to servicing the request straight against core, the same way a
/// partition-full remap failure does (§7 "Mapping/space").
fn should_promote(cache: &Cache, core_id: CoreId, core_line: CoreLine) -> bool {
    cache.promotion_policy.read().should_promote(core_id, core_line)
}

fn notify_insert(cache: &Cache, cache_line: CacheLineId, core_id: CoreId, core_line: CoreLine) {
    cache.cleaning_policy.read().init_cache_block(cache_line);
    cache.promotion_policy.read().on_insert(core_id, core_line);
}

/// Entry point for [`Cache::read`]/[`Cache::write`] and their `_d2c`
/// counterparts.
pub(crate) fn service(
    cache: &Arc<Cache>,
    core_id: CoreId,
    offset: u64,
    direction: Direction,
    io_class: PartitionId,
    mut read_buf: Option<&mut [u8]>,
    write_buf: Option<&[u8]>,
    d2c: bool,
) -> Result<()> {
    let core_volume = cache.core_volume(core_id)?;

    if d2c {
        return match direction {
            Direction::Read => core_volume.read(offset, read_buf.ok_or(Error::Inval)?),
            Direction::Write => core_volume.write(offset, write_buf.ok_or(Error::Inval)?),
        };
    }

    let length = match direction {
        Direction::Read => read_buf.as_ref().map_or(0, |b| b.len() as u64),
        Direction::Write => write_buf.map_or(0, |b| b.len() as u64),
    };
    if length == 0 {
        return Err(Error::Inval);
    }

    let mode = resolve_effective_mode(cache, core_id, offset, length, io_class)?;
    if mode == CacheMode::Pt {
        pt_clean_mapped_lines(cache, &core_volume, core_id, offset, length)?;
        return match direction {
            Direction::Read => core_volume.read(offset, read_buf.ok_or(Error::Inval)?),
            Direction::Write => core_volume.write(offset, write_buf.ok_or(Error::Inval)?),
        };
    }

    let (cache_line_bytes, sector_bytes, partition_priority) = {
        let config = cache.config.read();
        let priority = config.partitions.get(io_class.0 as usize).map_or(0, |p| p.priority);
        (config.cache_line_size.bytes(), crate::types::SECTOR_SIZE, priority)
    };

    let mut request = Request::new(core_id, offset, length, direction, mode, cache_line_bytes, sector_bytes);
    record_sequential_run(cache, core_id, &request);

    let mut cursor: usize = 0;
    for idx in 0..request.map.len() {
        let span_sectors = u64::from(request.map[idx].stop_sector - request.map[idx].start_sector + 1);
        let span_len = (span_sectors * sector_bytes) as usize;

        let outcome = match direction {
            Direction::Read => {
                let slice = &mut read_buf.as_deref_mut().expect("read buffer present")[cursor..cursor + span_len];
                service_read_entry(
                    cache,
                    &core_volume,
                    &mut request.map[idx],
                    mode,
                    io_class,
                    partition_priority,
                    cache_line_bytes,
                    sector_bytes,
                    slice,
                )
            }
            Direction::Write => {
                let buf = write_buf.expect("write buffer present");
                let slice = &buf[cursor..cursor + span_len];
                service_write_entry(
                    cache,
                    &core_volume,
                    &mut request.map[idx],
                    mode,
                    io_class,
                    partition_priority,
                    cache_line_bytes,
                    sector_bytes,
                    slice,
                )
            }
        };

        match request.map[idx].status {
            LookupStatus::Hit => request.info.hit_no += 1,
            LookupStatus::Remapped => request.info.insert_no += 1,
            LookupStatus::Miss => request.info.invalid_no += 1,
        }
        outcome?;
        cursor += span_len;
    }
    Ok(())
}

/// Cleans every dirty sector of any line mapped within `[offset, offset +
/// length)` before a PT-resolved request reaches core (§4.1 "Pt": "if any
/// lines are mapped, RD-lock them and (if dirty) clean them first, then
/// submit to core"). A line left dirty by an earlier Wb/Wo write must be
/// written back here, or a PT read would return stale core data while the
/// more recent copy sits in the cache (§4.1 invariant 10, round trip).
fn pt_clean_mapped_lines(
    cache: &Cache,
    core_volume: &Arc<dyn Volume>,
    core_id: CoreId,
    offset: u64,
    length: u64,
) -> Result<()> {
    let cache_line_bytes = cache.config.read().cache_line_size.bytes();
    let first_line = offset / cache_line_bytes;
    let last_line = (offset + length - 1) / cache_line_bytes;

    for core_line in first_line..=last_line {
        let found = {
            let mapping = cache.mapping.read();
            let bucket = mapping.collision.bucket_of(core_id, core_line);
            let lookup = mapping.collision.lookup(&mapping.table, bucket, core_id, core_line);
            (lookup.status == LookupStatus::Hit).then_some(lookup.line)
        };
        let Some(line) = found else { continue };

        blocking_lock(&cache.alock, line, LockRw::Write);

        let runs_and_partition = {
            let mapping = cache.mapping.read();
            let meta = mapping.table.get(line);
            if !meta.is_mapped() || meta.core_id != core_id || meta.core_line != core_line || meta.is_clean() {
                None
            } else {
                let runs = crate::flush::dirty_sector_runs(meta);
                (!runs.is_empty()).then_some((runs, meta.partition))
            }
        };
        let Some((runs, partition)) = runs_and_partition else {
            cache.alock.unlock_wr(line);
            continue;
        };

        let sector_bytes = crate::types::SECTOR_SIZE;
        // Each contiguous dirty run is written back on its own: the
        // sectors between two runs may be invalid, and flushing a single
        // `[min, max]` span across them would overwrite untouched core
        // data with cache garbage (§7 "Lost cache data never corrupts
        // core data").
        let mut became_clean = false;
        let mut io_err = None;
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
                    io_err = Some(e);
                    break;
                }
            }
        }

        cache.alock.unlock_wr(line);

        if let Some(e) = io_err {
            cache.record_cache_error(core_id);
            cache.record_core_error(core_id);
            return Err(e);
        }
        if became_clean {
            cache.cleaning_policy.read().purge_cache_block(line);
            cache.stats.record(StatEvent::Cleaned { partition });
        }
    }
    Ok(())
}

fn service_read_entry(
    cache: &Cache,
    core_volume: &Arc<dyn Volume>,
    entry: &mut MapEntry,
    mode: CacheMode,
    partition: PartitionId,
    partition_priority: i32,
    cache_line_bytes: u64,
    sector_bytes: u64,
    host_buf: &mut [u8],
) -> Result<()> {
    let core_line = entry.core_line;
    let core_id = entry.core_id;
    let core_offset = core_line * cache_line_bytes + u64::from(entry.start_sector) * sector_bytes;

    let mut was_hit = false;
    let mut pre_locked = false;
    let cache_line = {
        let mut mapping = cache.mapping.write();
        let bucket = mapping.collision.bucket_of(core_id, core_line);
        entry.hash = bucket;
        let lookup = mapping.collision.lookup(&mapping.table, bucket, core_id, core_line);
        if lookup.status == LookupStatus::Hit {
            mapping.space.hot_cline(&mut mapping.table, lookup.line);
            was_hit = true;
            lookup.line
        } else if mode == CacheMode::Wo || !should_promote(cache, core_id, core_line) {
            // Wo reads never instantiate a mapping on miss (§4.1 "Wo":
            // reads prefer core unless dirty). A promotion-policy refusal
            // (§4.5) takes the same path: service straight from core
            // without ever creating a mapping.
            drop(mapping);
            core_volume.read(core_offset, host_buf)?;
            entry.status = LookupStatus::Miss;
            cache.stats.record(StatEvent::Miss { mode });
            return Ok(());
        } else {
            pre_locked = true;
            let line = allocate_line(cache, &mut mapping, &cache.alock, core_id, core_line, partition, partition_priority)?;
            notify_insert(cache, line, core_id, core_line);
            line
        }
    };
    entry.coll_idx = cache_line;

    if mode == CacheMode::Wo && was_hit {
        let dirty = cache
            .mapping
            .read()
            .table
            .get(cache_line)
            .bitmaps
            .dirty
            .test(entry.start_sector, entry.stop_sector, false);
        if !dirty {
            core_volume.read(core_offset, host_buf)?;
            entry.status = LookupStatus::Hit;
            cache.stats.record(StatEvent::Hit { mode });
            return Ok(());
        }
    }

    if !pre_locked {
        blocking_lock(&cache.alock, cache_line, LockRw::Write);
    }

    let needs_backfill = if was_hit {
        !cache
            .mapping
            .read()
            .table
            .get(cache_line)
            .bitmaps
            .valid
            .test(entry.start_sector, entry.stop_sector, true)
    } else {
        true
    };

    let io_result = (|| -> Result<()> {
        if needs_backfill {
            backfill_line(&cache.cache_volume, core_volume, cache_line, core_line, cache_line_bytes)?;
        }
        let cache_offset = u64::from(cache_line) * cache_line_bytes + u64::from(entry.start_sector) * sector_bytes;
        cache.cache_volume.read(cache_offset, host_buf)
    })();

    cache.alock.unlock_wr(cache_line);

    if let Err(e) = io_result {
        cache.record_cache_error(core_id);
        return Err(e);
    }

    if needs_backfill {
        let mut mapping = cache.mapping.write();
        let total_sectors = (cache_line_bytes / sector_bytes) as u8;
        mapping.table.get_mut(cache_line).bitmaps.set_valid(0, total_sectors - 1);
    }

    entry.status = if was_hit { LookupStatus::Hit } else { LookupStatus::Remapped };
    cache
        .stats
        .record(if was_hit { StatEvent::Hit { mode } } else { StatEvent::Insertion { partition } });
    Ok(())
}

fn service_write_entry(
    cache: &Cache,
    core_volume: &Arc<dyn Volume>,
    entry: &mut MapEntry,
    mode: CacheMode,
    partition: PartitionId,
    partition_priority: i32,
    cache_line_bytes: u64,
    sector_bytes: u64,
    host_buf: &[u8],
) -> Result<()> {
    let core_line = entry.core_line;
    let core_id = entry.core_id;
    let core_offset = core_line * cache_line_bytes + u64::from(entry.start_sector) * sector_bytes;

    if mode == CacheMode::Wi {
        return service_write_invalidate(cache, core_volume, entry, core_offset, core_id, core_line, host_buf);
    }

    let mut was_hit = false;
    let mut pre_locked = false;
    let mut bypass_cache = false;
    let cache_line = {
        let mut mapping = cache.mapping.write();
        let bucket = mapping.collision.bucket_of(core_id, core_line);
        entry.hash = bucket;
        let lookup = mapping.collision.lookup(&mapping.table, bucket, core_id, core_line);
        if lookup.status == LookupStatus::Hit {
            mapping.space.hot_cline(&mut mapping.table, lookup.line);
            was_hit = true;
            lookup.line
        } else if mode == CacheMode::Wa || !should_promote(cache, core_id, core_line) {
            // Write-around: a write miss bypasses the cache entirely (§4.1
            // "Wa"); only a write *hit* keeps the line mapped. A
            // promotion-policy refusal (§4.5) takes the same bypass path.
            bypass_cache = true;
            0
        } else {
            pre_locked = true;
            let line = allocate_line(cache, &mut mapping, &cache.alock, core_id, core_line, partition, partition_priority)?;
            notify_insert(cache, line, core_id, core_line);
            line
        }
    };

    if bypass_cache {
        core_volume.write(core_offset, host_buf)?;
        entry.status = LookupStatus::Miss;
        cache.stats.record(StatEvent::Miss { mode });
        return Ok(());
    }
    entry.coll_idx = cache_line;

    if !pre_locked {
        blocking_lock(&cache.alock, cache_line, LockRw::Write);
    }

    let lazy = mode.is_write_back_like();
    let dirty_held = lazy && cache.try_enter_dirty();
    let write_through_core = !lazy || !dirty_held;
    // Wb/Wo misses skip the pre-read: the rest of the line simply stays
    // invalid until something else touches it (§4.1 "Wb"/"Wo"). Wt/Wa-hit
    // always write through, so their miss path (Wt only, since Wa misses
    // never reach here) backfills first to keep the whole line valid.
    let needs_backfill = !was_hit && !lazy;

    let io_result = (|| -> Result<()> {
        if needs_backfill {
            backfill_line(&cache.cache_volume, core_volume, cache_line, core_line, cache_line_bytes)?;
        }
        let cache_offset = u64::from(cache_line) * cache_line_bytes + u64::from(entry.start_sector) * sector_bytes;
        cache.cache_volume.write(cache_offset, host_buf)?;
        if write_through_core {
            core_volume.write(core_offset, host_buf)?;
        }
        Ok(())
    })();

    let mut became_dirty = false;
    let mut became_clean = false;
    if io_result.is_ok() {
        let mut mapping = cache.mapping.write();
        let meta = mapping.table.get_mut(cache_line);
        let was_clean = meta.is_clean();
        meta.bitmaps.set_valid(entry.start_sector, entry.stop_sector);
        if write_through_core {
            meta.bitmaps.clear_dirty(entry.start_sector, entry.stop_sector);
        } else {
            meta.bitmaps.set_dirty(entry.start_sector, entry.stop_sector);
        }
        let now_clean = meta.is_clean();
        if was_clean && !now_clean {
            mapping.space.move_dirty_clean(&mut mapping.table, cache_line, true);
            became_dirty = true;
        } else if !was_clean && now_clean {
            mapping.space.move_dirty_clean(&mut mapping.table, cache_line, false);
            became_clean = true;
        }
    }

    cache.alock.unlock_wr(cache_line);
    if dirty_held {
        cache.leave_dirty();
    }

    if let Err(e) = io_result {
        cache.record_cache_error(core_id);
        if write_through_core {
            cache.record_core_error(core_id);
        }
        return Err(e);
    }

    if lazy {
        // §4.1 "Wb": the cleaning-policy hook is notified of every
        // successful write-back-like write, not just ones that dirty a
        // previously-clean line, since a hot line's heuristic weight
        // should track access frequency, not just dirty transitions.
        cache.cleaning_policy.read().set_hot(cache_line);
    }
    if became_clean {
        cache.cleaning_policy.read().purge_cache_block(cache_line);
    }

    entry.status = if was_hit { LookupStatus::Hit } else { LookupStatus::Remapped };
    if became_dirty {
        cache.stats.record(StatEvent::Dirtied { partition });
    } else if became_clean {
        cache.stats.record(StatEvent::Cleaned { partition });
    }
    cache
        .stats
        .record(if was_hit { StatEvent::Hit { mode } } else { StatEvent::Insertion { partition } });
    Ok(())
}

/// Write-invalidate (§4.1 "Wi"): a mapped line is WR-locked *before* the
/// core write lands, so a concurrent reader can never observe the
/// still-valid mapping while the write is in flight (§8 scenario S5); only
/// once the write has succeeded is the mapping actually dropped.
fn service_write_invalidate(
    cache: &Cache,
    core_volume: &Arc<dyn Volume>,
    entry: &mut MapEntry,
    core_offset: u64,
    core_id: CoreId,
    core_line: CoreLine,
    host_buf: &[u8],
) -> Result<()> {
    let (mut was_hit, line) = {
        let mapping = cache.mapping.read();
        let bucket = mapping.collision.bucket_of(core_id, core_line);
        entry.hash = bucket;
        let lookup = mapping.collision.lookup(&mapping.table, bucket, core_id, core_line);
        (lookup.status == LookupStatus::Hit, lookup.line)
    };

    if was_hit {
        blocking_lock(&cache.alock, line, LockRw::Write);
        // Re-check under the lock: another writer may have already removed
        // this mapping between the lookup above and acquiring the alock. If
        // so, this entry is no longer mapped and the write proceeds as a
        // miss, with no lock held across it.
        let still_mapped = {
            let mapping = cache.mapping.read();
            let lookup = mapping.collision.lookup(&mapping.table, entry.hash, core_id, core_line);
            lookup.status == LookupStatus::Hit && lookup.line == line
        };
        if !still_mapped {
            cache.alock.unlock_wr(line);
            was_hit = false;
        }
    }

    let write_result = core_volume.write(core_offset, host_buf);
    if let Err(e) = write_result {
        if was_hit {
            cache.alock.unlock_wr(line);
        }
        cache.record_core_error(core_id);
        return Err(e);
    }

    if was_hit {
        let mut mapping = cache.mapping.write();
        let lookup = mapping.collision.lookup(&mapping.table, entry.hash, core_id, core_line);
        if lookup.status == LookupStatus::Hit && lookup.line == line {
            mapping.collision.remove(&mut mapping.table, entry.hash, line);
            mapping.space.return_to_freelist(&mut mapping.table, line);
        }
        drop(mapping);
        cache.alock.unlock_wr(line);
    }

    entry.status = if was_hit { LookupStatus::Hit } else { LookupStatus::Miss };
    cache.stats.record(if was_hit {
        StatEvent::Hit { mode: CacheMode::Wi }
    } else {
        StatEvent::Miss { mode: CacheMode::Wi }
    });
    Ok(())
}

/// `io_class_discard` / discard engine (§4.1 "Discard"): drops any cache
/// mapping for every core line in `[offset, offset + length)`, then
/// forwards the TRIM to the core itself.
pub(crate) fn discard(cache: &Arc<Cache>, core_id: CoreId, offset: u64, length: u64) -> Result<()> {
    if length == 0 {
        return Err(Error::Inval);
    }
    let core_volume = cache.core_volume(core_id)?;
    let cache_line_bytes = cache.config.read().cache_line_size.bytes();
    let first_line = offset / cache_line_bytes;
    let last_line = (offset + length - 1) / cache_line_bytes;

    for core_line in first_line..=last_line {
        let found = {
            let mapping = cache.mapping.read();
            let bucket = mapping.collision.bucket_of(core_id, core_line);
            let lookup = mapping.collision.lookup(&mapping.table, bucket, core_id, core_line);
            (lookup.status == LookupStatus::Hit).then_some(lookup.line)
        };
        let Some(line) = found else { continue };

        blocking_lock(&cache.alock, line, LockRw::Write);
        let mut mapping = cache.mapping.write();
        let bucket = mapping.collision.bucket_of(core_id, core_line);
        let lookup = mapping.collision.lookup(&mapping.table, bucket, core_id, core_line);
        if lookup.status == LookupStatus::Hit && lookup.line == line {
            mapping.collision.remove(&mut mapping.table, bucket, line);
            mapping.space.return_to_freelist(&mut mapping.table, line);
        }
        drop(mapping);
        cache.alock.unlock_wr(line);
    }

    core_volume.discard(offset, length)
}

/// `cache_purge`: drops every cached mapping across all cores and
/// partitions without touching any core volume (§6 "Host API").
pub(crate) fn purge_all(cache: &Arc<Cache>) -> Result<()> {
    let total_lines = cache.mapping.read().table.len();
    for line in 0..total_lines {
        let (core_id, core_line, is_mapped) = {
            let mapping = cache.mapping.read();
            let meta = mapping.table.get(line);
            (meta.core_id, meta.core_line, meta.is_mapped())
        };
        if !is_mapped {
            continue;
        }

        blocking_lock(&cache.alock, line, LockRw::Write);
        let mut mapping = cache.mapping.write();
        if mapping.table.get(line).is_mapped() && mapping.table.get(line).core_id == core_id {
            let bucket = mapping.collision.bucket_of(core_id, core_line);
            mapping.collision.remove(&mut mapping.table, bucket, line);
            mapping.space.return_to_freelist(&mut mapping.table, line);
        }
        drop(mapping);
        cache.alock.unlock_wr(line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CoreConfig};
    use crate::metrics::CountingStatsSink;
    use crate::volume::MemVolume;

    fn test_cache(num_lines: u32) -> Arc<Cache> {
        let mut cfg = CacheConfig::default();
        cfg.num_cache_lines = num_lines;
        let cache_vol = Arc::new(MemVolume::new(u64::from(num_lines) * 4096));
        let cache = Cache::with_stats(cfg, cache_vol, Arc::new(CountingStatsSink::default())).unwrap();
        let core_vol = Arc::new(MemVolume::new(1024 * 1024));
        cache.add_core(0, CoreConfig::default(), core_vol).unwrap();
        cache
    }

    #[test]
    fn write_then_read_round_trips_under_wt() {
        let cache = test_cache(16);
        cache.write(0, 0, &[7u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        cache.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
    }

    #[test]
    fn read_miss_backfills_from_core() {
        let cache = test_cache(16);
        let core_vol = cache.core_volume(0).unwrap();
        core_vol.write(0, &[9u8; 4096]).unwrap();
        let mut buf = [0u8; 512];
        cache.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 512]);
    }

    #[test]
    fn write_back_write_leaves_core_untouched_until_flush() {
        let mut cfg = CacheConfig::default();
        cfg.num_cache_lines = 16;
        cfg.cache_mode = CacheMode::Wb;
        let cache_vol = Arc::new(MemVolume::new(16 * 4096));
        let cache = Cache::new(cfg, cache_vol).unwrap();
        let core_vol = Arc::new(MemVolume::new(1024 * 1024));
        cache.add_core(0, CoreConfig::default(), Arc::clone(&core_vol)).unwrap();

        cache.write(0, 0, &[5u8; 512]).unwrap();
        let mut core_buf = [0u8; 512];
        core_vol.read(0, &mut core_buf).unwrap();
        assert_eq!(core_buf, [0u8; 512]);
        assert_eq!(cache.dirty_line_count(), 1);
    }

    #[test]
    fn discard_drops_mapping_and_forwards_trim() {
        let cache = test_cache(16);
        cache.write(0, 0, &[3u8; 512]).unwrap();
        discard(&cache, 0, 0, 4096).unwrap();
        assert_eq!(cache.dirty_line_count(), 0);
    }

    struct RefuseAll;
    impl crate::policy::PromotionPolicy for RefuseAll {
        fn should_promote(&self, _core_id: crate::types::CoreId, _core_line: crate::types::CoreLine) -> bool {
            false
        }
    }

    #[test]
    fn promotion_refusal_services_miss_without_mapping() {
        let cache = test_cache(16);
        cache.set_promotion_policy(Arc::new(RefuseAll));
        let core_vol = cache.core_volume(0).unwrap();
        core_vol.write(0, &[4u8; 4096]).unwrap();

        let mut buf = [0u8; 512];
        cache.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [4u8; 512]);
        assert_eq!(cache.dirty_line_count(), 0);

        // A second read still misses: the promotion policy never let a
        // mapping get created, so nothing was cached to hit.
        let mapped = {
            let mapping = cache.mapping.read();
            let bucket = mapping.collision.bucket_of(0, 0);
            mapping.collision.lookup(&mapping.table, bucket, 0, 0).status
        };
        assert_eq!(mapped, LookupStatus::Miss);
    }
}
