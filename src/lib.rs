//! A block-level cache engine sitting between a core (backing) volume and a
//! faster cache volume.
//!
//! The cache maps fixed-size core-lines onto cache-lines through a
//! hash/collision-chain table (§3 "Mapping"), tracks validity and dirtiness
//! per sector within a line (§4.3), and reclaims space with a segmented-LRU
//! policy split across priority-ordered partitions (§3 "Partition"). Six
//! cache modes govern how reads and writes interact with the core volume:
//!
//! - [`CacheMode::Wt`] (write-through): every write lands on both the cache
//!   and the core before completing.
//! - [`CacheMode::Wb`] (write-back): writes land on the cache only; dirty
//!   lines are written back to core lazily, or explicitly via [`Cache::flush`].
//! - [`CacheMode::Wa`] (write-around): write-misses bypass the cache
//!   entirely; write-hits and all reads behave like write-through.
//! - [`CacheMode::Wi`] (write-invalidate): writes always go straight to
//!   core, then drop any existing mapping for that core-line.
//! - [`CacheMode::Wo`] (write-only): writes behave like write-back, but a
//!   read only consults the cache when the requested sectors are dirty.
//! - [`CacheMode::Pt`] (pass-through): no metadata is touched at all.
//!
//! ## Example
//!
//! ```
//! use cachelines_rs::config::{CacheConfig, CoreConfig};
//! use cachelines_rs::Cache;
//! use cachelines_rs::volume::MemVolume;
//! use std::sync::Arc;
//!
//! let cache_vol = Arc::new(MemVolume::new(4096 * 1024));
//! let cache = Cache::new(CacheConfig::default(), cache_vol).unwrap();
//!
//! let core_vol = Arc::new(MemVolume::new(4096 * 1024));
//! cache.add_core(0, CoreConfig::default(), core_vol).unwrap();
//!
//! cache.write(0, 0, &[0xabu8; 512]).unwrap();
//! let mut buf = [0u8; 512];
//! cache.read(0, 0, &mut buf).unwrap();
//! assert_eq!(buf, [0xabu8; 512]);
//! ```

#[cfg(test)]
extern crate scoped_threadpool;

/// Arena-indexed intrusive doubly-linked list used by the collision table
/// and the LRU/freelist machinery.
///
/// This module is internal infrastructure: it exposes raw index-based links
/// that require the caller to maintain arena invariants. Use [`Cache`]
/// instead of reaching for this directly.
pub(crate) mod arena_list;

/// Per-sector valid/dirty bitmap, generic over bit width.
pub mod bitmap;

/// Cache, core, and partition configuration.
pub mod config;

/// Hash/collision-chain core-line-to-cache-line mapping table.
pub(crate) mod collision;

/// Cache-wide and per-operation error type.
pub mod error;

/// Async per-cache-line reader/writer lock.
pub(crate) mod alock;

/// Per-cache-line metadata: mapping identity, bitmaps, and intrusive links.
pub(crate) mod metadata;

/// Cache performance and event metrics.
pub mod metrics;

/// Cleaning-policy and promotion-policy hooks (§4.5).
pub mod policy;

/// In-flight request decomposition into per-cache-line work items.
pub(crate) mod request;

/// Segmented-LRU space management: partitions, freelist, eviction.
pub(crate) mod space;

/// Shared identifiers and small value types used throughout the crate.
pub mod types;

/// The backing-store abstraction cache and core volumes both implement.
pub mod volume;

/// Per-mode read/write dispatch: the engine proper.
mod engine;

/// Interruptible cache-wide and per-core flush.
mod flush;

mod cache;

pub use cache::Cache;
pub use config::{BackfillConfig, CacheConfig, CoreConfig, MetadataLayout, PartitionConfig};
pub use error::{Error, Result};
pub use metrics::{CountingStatsSink, NullStatsSink, StatEvent, StatsSink};
pub use policy::{AlwaysPromote, CleaningPolicy, NopCleaning, PromotionPolicy};
pub use types::{
    CacheLineId, CacheLineSize, CacheMode, CoreId, CoreLine, Direction, LookupStatus, PartitionId,
    SeqCutoffPolicy,
};
pub use volume::Volume;
