//! The top-level `Cache` object: host API (§6) and the glue between
//! mapping, space, alock, and the per-mode engines (§4.1-§4.4).
//!
//! Concurrency model (§5): the mechanism by which worker threads are
//! created is explicitly out of scope (§1 Non-goals), so [`IoQueue`] is
//! the data-structure contract only — a spin/condvar-protected FIFO an
//! embedder's own worker pool drains by calling [`IoQueue::pop_blocking`]
//! and servicing the result through [`crate::engine`]. [`Cache::read`] and
//! [`Cache::write`] are a synchronous convenience API for callers that
//! already run on a suitable worker thread (or a test harness): they call
//! straight into the engine rather than round-tripping through the queue.
//! Metadata access is protected by one cache-wide [`parking_lot::RwLock`]
//! playing the role the reference design splits across per-bucket
//! reader/writer semaphores, per-stripe LRU locks, and a sharded global
//! rwsem (§5 "Shared resources & locks") — see `space.rs`'s doc comment
//! for why this crate coarsens that fan-out. Per-cache-line concurrency
//! (the actual correctness-critical serialization between overlapping
//! requests) still goes through the real, fully fan-out [`AsyncLock`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use parking_lot::RwLock;

use crate::alock::AsyncLock;
use crate::bitmap::Width128;
use crate::collision::CollisionTable;
use crate::config::{CacheConfig, CoreConfig, FALLBACK_PT_INACTIVE};
use crate::error::{Error, Result};
use crate::metadata::MetadataTable;
use crate::metrics::{NullStatsSink, StatEvent, StatsSink};
use crate::policy::{AlwaysPromote, CleaningPolicy, NopCleaning, PromotionPolicy};
use crate::request::Request;
use crate::space::{PartitionSizing, SpaceManager};
use crate::types::{CoreId, Direction, PartitionId};
use crate::volume::Volume;

/// Everything protected by the cache-wide mapping lock.
pub(crate) struct Mapping {
    pub(crate) table: MetadataTable<Width128>,
    pub(crate) collision: CollisionTable,
    pub(crate) space: SpaceManager,
}

/// Per-core runtime state: its configuration, backing volume, and error
/// counters (§7 "Core I/O error").
pub(crate) struct CoreRuntime {
    pub(crate) config: CoreConfig,
    pub(crate) volume: Arc<dyn Volume>,
    pub(crate) cache_errors: AtomicU32,
    pub(crate) core_errors: AtomicU32,
    pub(crate) seq_run_length: AtomicU32,
    /// Last core line touched by the previous request, or `u64::MAX` if
    /// none yet; used to detect a contiguous sequential stream.
    pub(crate) last_end_line: AtomicU64,
    pub(crate) active: AtomicBool,
}

/// One queued unit of deferred work: a boxed closure an embedder's worker
/// pulls and runs. This stands in for the reference design's `io_if`
/// pointer swap — each closure captures whichever engine step should run
/// next, so an engine that needs to suspend (§5 "Suspension points") can
/// requeue a fresh closure for the resumed step instead of blocking the
/// worker.
pub(crate) type QueuedJob = Box<dyn FnOnce() + Send>;

/// A spin/condvar-protected FIFO, the data-structure contract behind
/// `io_new`'s "enqueue on a caller-supplied worker queue" (§4.1
/// "Queueing"). Spawning the worker threads that drain it is explicitly
/// out of scope (§1 Non-goals); [`Cache::read`]/[`Cache::write`] bypass it
/// entirely for synchronous callers.
pub(crate) struct IoQueue {
    inner: Mutex<VecDeque<QueuedJob>>,
    cv: Condvar,
}

impl IoQueue {
    fn new() -> Self {
        IoQueue {
            inner: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    /// Enqueues `job` at the tail and wakes one waiting worker ("kick").
    pub(crate) fn push_back(&self, job: QueuedJob) {
        self.inner.lock().expect("queue mutex poisoned").push_back(job);
        self.cv.notify_one();
    }

    /// Enqueues `job` at the head, for an engine re-submitting itself to
    /// run next rather than after whatever else is already queued.
    pub(crate) fn push_front(&self, job: QueuedJob) {
        self.inner.lock().expect("queue mutex poisoned").push_front(job);
        self.cv.notify_one();
    }

    /// Blocks the calling (worker) thread until a job is available, then
    /// pops and returns it.
    pub(crate) fn pop_blocking(&self) -> QueuedJob {
        let mut guard = self.inner.lock().expect("queue mutex poisoned");
        loop {
            if let Some(job) = guard.pop_front() {
                return job;
            }
            guard = self.cv.wait(guard).expect("queue condvar poisoned");
        }
    }
}

/// The block-level cache engine (§1 "PURPOSE & SCOPE").
pub struct Cache {
    pub(crate) config: RwLock<CacheConfig>,
    pub(crate) cache_volume: Arc<dyn Volume>,
    pub(crate) mapping: RwLock<Mapping>,
    pub(crate) alock: AsyncLock,
    pub(crate) cores: RwLock<Vec<CoreRuntime>>,
    pub(crate) fallback_pt: AtomicBool,
    /// Frozen == further dirty-refcount increments are refused (§5
    /// "Refcounts and quiescence"); lazy-write requests are demoted to WT
    /// while this is set.
    pub(crate) dirty_refcnt: AtomicU64,
    pub(crate) dirty_frozen: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) flushing_interrupted: AtomicBool,
    /// Guards against two concurrent [`Cache::flush`]/[`Cache::flush_core`]
    /// calls (§6 "Host API": flush is not reentrant).
    pub(crate) flush_in_progress: AtomicBool,
    pub(crate) stats: Arc<dyn StatsSink>,
    pub(crate) queue: IoQueue,
    pub(crate) cleaning_policy: RwLock<Arc<dyn CleaningPolicy>>,
    pub(crate) promotion_policy: RwLock<Arc<dyn PromotionPolicy>>,
}

impl fmt::Debug for Cache {
    /// Trait objects (`Volume`, `StatsSink`, the policy hooks) aren't
    /// `Debug`, so this reports shape rather than deriving it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("fallback_pt", &self.is_fallback_pt())
            .field("dirty_line_count", &self.dirty_line_count())
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// `cache_init`: builds a cache over `cache_volume` with no cores
    /// attached yet (§6 "Host API").
    pub fn new(config: CacheConfig, cache_volume: Arc<dyn Volume>) -> Result<Arc<Self>> {
        Self::with_stats(config, cache_volume, Arc::new(NullStatsSink))
    }

    /// Like [`Cache::new`] but with a caller-supplied [`StatsSink`].
    pub fn with_stats(
        config: CacheConfig,
        cache_volume: Arc<dyn Volume>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let mut table: MetadataTable<Width128> = MetadataTable::new(config.num_cache_lines);
        let sizing: Vec<PartitionSizing> = config
            .partitions
            .iter()
            .enumerate()
            .map(|(i, p)| PartitionSizing {
                id: PartitionId(i as u16),
                priority: p.priority,
                pinned: p.is_pinned(),
                min_size: config.num_cache_lines * u32::from(p.min_size_percent) / 100,
                max_size: config.num_cache_lines * u32::from(p.max_size_percent) / 100,
            })
            .collect();
        let space = SpaceManager::new(&mut table, &sizing);
        let collision = CollisionTable::new(config.num_cache_lines.max(1));
        let alock = AsyncLock::new(config.num_cache_lines);

        let cache = Cache {
            mapping: RwLock::new(Mapping { table, collision, space }),
            alock,
            cores: RwLock::new(Vec::new()),
            fallback_pt: AtomicBool::new(false),
            dirty_refcnt: AtomicU64::new(0),
            dirty_frozen: AtomicBool::new(false),
            running: AtomicBool::new(true),
            flushing_interrupted: AtomicBool::new(false),
            flush_in_progress: AtomicBool::new(false),
            stats,
            queue: IoQueue::new(),
            config: RwLock::new(config),
            cache_volume,
            cleaning_policy: RwLock::new(Arc::new(NopCleaning)),
            promotion_policy: RwLock::new(Arc::new(AlwaysPromote)),
        };
        Ok(Arc::new(cache))
    }

    /// `cache_set_cleaning_policy`: installs a cleaning-policy hook,
    /// replacing [`NopCleaning`] (§4.5, §5 "Management pipeline").
    pub fn set_cleaning_policy(&self, policy: Arc<dyn CleaningPolicy>) {
        *self.cleaning_policy.write() = policy;
    }

    /// Installs a promotion-policy hook, replacing [`AlwaysPromote`] (§4.5).
    pub fn set_promotion_policy(&self, policy: Arc<dyn PromotionPolicy>) {
        *self.promotion_policy.write() = policy;
    }

    /// `cache_add_core`: attaches a backing core volume under `core_id`.
    pub fn add_core(&self, core_id: CoreId, config: CoreConfig, volume: Arc<dyn Volume>) -> Result<()> {
        config.validate()?;
        let mut cores = self.cores.write();
        let idx = core_id as usize;
        if idx < cores.len() && cores[idx].active.load(Ordering::Relaxed) {
            return Err(Error::CoreExist);
        }
        if cores.iter().any(|c| c.active.load(Ordering::Relaxed) && c.config.uuid == config.uuid) {
            return Err(Error::CoreUuidExists);
        }
        while cores.len() <= idx {
            cores.push(CoreRuntime {
                config: CoreConfig::default(),
                volume: Arc::new(crate::volume::MemVolume::new(0)),
                cache_errors: AtomicU32::new(0),
                core_errors: AtomicU32::new(0),
                seq_run_length: AtomicU32::new(0),
                last_end_line: AtomicU64::new(u64::MAX),
                active: AtomicBool::new(false),
            });
        }
        cores[idx] = CoreRuntime {
            config,
            volume,
            cache_errors: AtomicU32::new(0),
            core_errors: AtomicU32::new(0),
            seq_run_length: AtomicU32::new(0),
            last_end_line: AtomicU64::new(u64::MAX),
            active: AtomicBool::new(true),
        };
        Ok(())
    }

    /// `cache_remove_core` / `cache_detach_core`: deactivates `core_id`.
    /// Its cache lines are left mapped (detach) so a future attach of the
    /// same UUID could, in principle, reuse them; this crate does not
    /// implement that reattachment, only the deactivation contract.
    pub fn remove_core(&self, core_id: CoreId) -> Result<()> {
        let cores = self.cores.read();
        let idx = core_id as usize;
        let Some(core) = cores.get(idx) else {
            return Err(Error::CoreNotExist);
        };
        if !core.active.swap(false, Ordering::AcqRel) {
            return Err(Error::CoreNotExist);
        }
        Ok(())
    }

    pub(crate) fn core_volume(&self, core_id: CoreId) -> Result<Arc<dyn Volume>> {
        let cores = self.cores.read();
        cores
            .get(core_id as usize)
            .filter(|c| c.active.load(Ordering::Relaxed))
            .map(|c| Arc::clone(&c.volume))
            .ok_or(Error::CoreNotAvail)
    }

    /// `cache_set_cache_mode`: changes the cache-wide default mode.
    pub fn set_cache_mode(&self, mode: crate::types::CacheMode) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::CacheIncomplete);
        }
        self.config.write().cache_mode = mode;
        Ok(())
    }

    /// True once a metadata I/O error has latched the cache non-running
    /// (§7 "Metadata I/O error").
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Marks the cache non-running after a fatal metadata error.
    pub(crate) fn latch_metadata_error(&self) {
        self.running.store(false, Ordering::Release);
        self.stats.record(StatEvent::MetadataError);
    }

    /// Counts one cache I/O error for `core_id` and engages the fallback
    /// pass-through latch if the configured threshold is reached (§7
    /// "Cache I/O error").
    pub(crate) fn record_cache_error(&self, core_id: CoreId) {
        let threshold = self.config.read().fallback_pt_error_threshold;
        if threshold == FALLBACK_PT_INACTIVE {
            return;
        }
        let cores = self.cores.read();
        if let Some(core) = cores.get(core_id as usize) {
            let n = core.cache_errors.fetch_add(1, Ordering::Relaxed) + 1;
            if n >= threshold && !self.fallback_pt.swap(true, Ordering::AcqRel) {
                self.stats.record(StatEvent::FallbackPtLatched);
            }
        }
    }

    pub(crate) fn record_core_error(&self, core_id: CoreId) {
        let cores = self.cores.read();
        if let Some(core) = cores.get(core_id as usize) {
            core.core_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True once the fallback pass-through latch has engaged (§4.1
    /// "Failure semantics").
    #[must_use]
    pub fn is_fallback_pt(&self) -> bool {
        self.fallback_pt.load(Ordering::Acquire)
    }

    /// Attempts to increment the dirty refcount; fails if dirty I/O is
    /// currently frozen (§4.1: "Write requests ... fail to increment the
    /// cache's dirty-refcount ... are demoted to WT").
    pub(crate) fn try_enter_dirty(&self) -> bool {
        if self.dirty_frozen.load(Ordering::Acquire) {
            return false;
        }
        self.dirty_refcnt.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn leave_dirty(&self) {
        self.dirty_refcnt.fetch_sub(1, Ordering::AcqRel);
    }

    /// Freezes dirty-refcount increments, e.g. before a cache mode switch
    /// away from a lazy-write mode.
    pub fn freeze_dirty(&self) {
        self.dirty_frozen.store(true, Ordering::Release);
    }

    /// Un-freezes dirty-refcount increments.
    pub fn unfreeze_dirty(&self) {
        self.dirty_frozen.store(false, Ordering::Release);
    }

    /// `cache_flush_interrupt`: requests that any in-flight [`Cache::flush`]
    /// stop at the next portion boundary (§5 "Cancellation & timeouts").
    pub fn flush_interrupt(&self) {
        self.flushing_interrupted.store(true, Ordering::Release);
    }

    /// Submits a host read on the default partition. Synchronous: returns
    /// once the request has fully completed. See the module doc for the
    /// synchronous-volume simplification this crate makes relative to the
    /// reference design's asynchronous I/O completion model.
    pub fn read(self: &Arc<Self>, core_id: CoreId, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.read_io_class(core_id, offset, buf, PartitionId::DEFAULT)
    }

    /// Submits a host write on the default partition.
    pub fn write(self: &Arc<Self>, core_id: CoreId, offset: u64, buf: &[u8]) -> Result<()> {
        self.write_io_class(core_id, offset, buf, PartitionId::DEFAULT)
    }

    /// `io_new` with an explicit I/O class (§3 "Partition", §6 "Host API"):
    /// the request's effective mode and eviction target are resolved
    /// against `io_class`'s configured partition rather than the default.
    pub fn read_io_class(self: &Arc<Self>, core_id: CoreId, offset: u64, buf: &mut [u8], io_class: PartitionId) -> Result<()> {
        self.submit(core_id, offset, buf.len() as u64, Direction::Read, io_class, Some(buf), None)
    }

    /// Like [`Cache::write`] but targeting an explicit I/O class.
    pub fn write_io_class(self: &Arc<Self>, core_id: CoreId, offset: u64, buf: &[u8], io_class: PartitionId) -> Result<()> {
        self.submit(core_id, offset, buf.len() as u64, Direction::Write, io_class, None, Some(buf))
    }

    fn submit(
        self: &Arc<Self>,
        core_id: CoreId,
        offset: u64,
        length: u64,
        direction: Direction,
        io_class: PartitionId,
        read_buf: Option<&mut [u8]>,
        write_buf: Option<&[u8]>,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(Error::CacheIncomplete);
        }
        if length == 0 {
            return Err(Error::Inval);
        }
        if io_class.0 as usize >= self.config.read().partitions.len() {
            return Err(Error::Inval);
        }
        crate::engine::service(self, core_id, offset, direction, io_class, read_buf, write_buf, false)
    }

    /// Submits a direct-to-core request, bypassing cache metadata (§4.1
    /// "D2C").
    pub fn read_d2c(self: &Arc<Self>, core_id: CoreId, offset: u64, buf: &mut [u8]) -> Result<()> {
        crate::engine::service(self, core_id, offset, Direction::Read, PartitionId::DEFAULT, Some(buf), None, true)
    }

    /// Submits a direct-to-core write, bypassing cache metadata.
    pub fn write_d2c(self: &Arc<Self>, core_id: CoreId, offset: u64, buf: &[u8]) -> Result<()> {
        crate::engine::service(self, core_id, offset, Direction::Write, PartitionId::DEFAULT, None, Some(buf), true)
    }

    /// `io_class_discard` / discard engine (§4.1 "Discard"): purges cache
    /// mappings for `[offset, offset + length)` and forwards a TRIM to the
    /// core.
    pub fn discard(self: &Arc<Self>, core_id: CoreId, offset: u64, length: u64) -> Result<()> {
        crate::engine::discard(self, core_id, offset, length)
    }

    /// `cache_purge`: discards every cached line without touching the
    /// core, used by admin paths.
    pub fn purge(self: &Arc<Self>) -> Result<()> {
        crate::engine::purge_all(self)
    }

    /// `cache_flush` / Ops engine: writes back every dirty line across all
    /// partitions, honoring [`Cache::flush_interrupt`] (§4.1 "Ops", §5).
    pub fn flush(self: &Arc<Self>) -> Result<()> {
        crate::flush::flush_cache(self)
    }

    /// `core_flush`: flushes dirty lines belonging to one core only.
    pub fn flush_core(self: &Arc<Self>, core_id: CoreId) -> Result<()> {
        crate::flush::flush_core(self, core_id)
    }

    /// CRC32 over the fields of the cache's current configuration,
    /// mirroring the reference design's superblock checksum
    /// (`ocf_metadata_calculate_crc_sb_config`): a caller persisting this
    /// cache's configuration alongside its own metadata can store this
    /// value and detect, on reload, whether the configuration it is about
    /// to reattach with has drifted (§6 "Environment contract").
    #[must_use]
    pub fn config_checksum(&self) -> u32 {
        let config = self.config.read();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(config.cache_mode as u8).to_le_bytes());
        hasher.update(&config.cache_line_size.bytes().to_le_bytes());
        hasher.update(&config.num_cache_lines.to_le_bytes());
        hasher.update(&config.fallback_pt_error_threshold.to_le_bytes());
        hasher.update(&[u8::from(config.pt_unaligned_io), u8::from(config.use_submit_io_fast)]);
        hasher.update(&config.backfill.max_queue_size.to_le_bytes());
        hasher.update(&config.backfill.queue_unblock_size.to_le_bytes());
        for partition in &config.partitions {
            hasher.update(partition.name.as_bytes());
            hasher.update(&partition.priority.to_le_bytes());
            hasher.update(&[partition.min_size_percent, partition.max_size_percent, u8::from(partition.pinned)]);
            hasher.update(&[partition.cache_mode.map_or(u8::MAX, |m| m as u8)]);
        }
        hasher.finalize()
    }

    /// Number of cache lines currently dirty, summed across partitions.
    /// Exposed for tests exercising §8 scenario S7.
    #[must_use]
    pub fn dirty_line_count(&self) -> usize {
        let mapping = self.mapping.read();
        (0..mapping.table.len())
            .filter(|&l| mapping.table.get(l).is_mapped() && !mapping.table.get(l).is_clean())
            .count()
    }
}
