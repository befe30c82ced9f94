//! Cache, core, and partition configuration (§6 "Configuration").
//!
//! Every config struct derives [`serde::Serialize`]/[`Deserialize`] so an
//! embedder can load a cache's configuration from TOML/JSON, and validates
//! itself synchronously at construction with no partial state mutation on
//! failure (§7 "Invalid configuration").

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CacheLineSize, CacheMode, SeqCutoffPolicy};

/// `fallback_pt_error_threshold` is either a count or this sentinel, meaning
/// the fallback-pass-through latch can never trigger.
pub const FALLBACK_PT_INACTIVE: u32 = u32::MAX;

/// Upper bound on `fallback_pt_error_threshold` (§6).
pub const FALLBACK_PT_MAX_THRESHOLD: u32 = 10_000_000;

/// How the logical (collision-table) line index maps to a physical
/// cache-device page (§3 "Mapping").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataLayout {
    /// Logical index equals physical index.
    Sequential,
    /// Interleaved across `ssd_pages` pages of `entries_in_page` lines each.
    Striped {
        /// Number of physical pages interleaved across.
        ssd_pages: u32,
        /// Number of cache lines per physical page.
        entries_in_page: u32,
    },
}

/// Backfill admission hysteresis (§4.1 "Backfill").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Read-misses are refused once the backfill queue reaches this depth.
    pub max_queue_size: u32,
    /// Admission resumes once the queue drains back to this depth.
    pub queue_unblock_size: u32,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        BackfillConfig {
            max_queue_size: 65_536,
            queue_unblock_size: 60_000,
        }
    }
}

impl BackfillConfig {
    fn validate(&self) -> Result<()> {
        if self.queue_unblock_size > self.max_queue_size {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

/// Priority value reserved for a partition that is never evicted.
pub const PARTITION_PRIORITY_PINNED: i32 = -1;

/// Maximum number of user partitions (§3 "Partition").
pub const MAX_USER_PARTITIONS: u16 = 32_768;

/// Configuration for one I/O class / partition (§6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Human-readable name, unique within a cache.
    pub name: String,
    /// Lower number is served first during eviction; [`PARTITION_PRIORITY_PINNED`]
    /// means never-evict.
    pub priority: i32,
    /// Minimum guaranteed share of total cache lines, as a percentage `[0, 100]`.
    pub min_size_percent: u8,
    /// Maximum allowed share of total cache lines, as a percentage `[0, 100]`.
    pub max_size_percent: u8,
    /// Cache mode used for requests resolved into this partition; `None`
    /// means "use the cache-wide default".
    pub cache_mode: Option<CacheMode>,
    /// Whether this partition's lines are exempt from eviction entirely.
    pub pinned: bool,
}

impl PartitionConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Inval);
        }
        if self.min_size_percent > 100 || self.max_size_percent > 100 {
            return Err(Error::Inval);
        }
        if self.min_size_percent > self.max_size_percent {
            return Err(Error::Inval);
        }
        if self.priority != PARTITION_PRIORITY_PINNED && self.priority < 0 {
            return Err(Error::Inval);
        }
        Ok(())
    }

    /// True if this partition's priority sentinel marks it never-evict,
    /// independent of the `pinned` flag (either is sufficient, §3).
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned || self.priority == PARTITION_PRIORITY_PINNED
    }
}

/// Configuration for one attached core (backing device), §6.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Human-readable name.
    pub name: String,
    /// Stable identity used to detect re-attaching the same backing device.
    pub uuid: String,
    /// Sequential-cutoff policy.
    pub seq_cutoff_policy: SeqCutoffPolicy,
    /// Core-line stream length (in cache lines) after which sequential
    /// cutoff triggers, if the policy is not [`SeqCutoffPolicy::Never`].
    pub seq_cutoff_threshold: u32,
    /// Number of consecutive sequential requests before promotion back into
    /// the cache is allowed again.
    pub seq_cutoff_promotion_count: u32,
}

impl CoreConfig {
    /// Validates this core's configuration (§7 "Invalid configuration").
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.uuid.is_empty() {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            name: String::from("core0"),
            uuid: String::from("core0-uuid"),
            seq_cutoff_policy: SeqCutoffPolicy::Full,
            seq_cutoff_threshold: 1024,
            seq_cutoff_promotion_count: 8,
        }
    }
}

/// Top-level cache configuration (§6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache-wide default mode, used by partitions that do not override it
    /// and by the dispatcher's fallback step.
    pub cache_mode: CacheMode,
    /// Size of one cache line.
    pub cache_line_size: CacheLineSize,
    /// Logical-to-physical line layout.
    pub metadata_layout: MetadataLayout,
    /// Number of physical cache lines this instance manages.
    pub num_cache_lines: u32,
    /// Cache-write (and, by extension, core-write) error count at which the
    /// fallback pass-through latch engages. [`FALLBACK_PT_INACTIVE`] disables it.
    pub fallback_pt_error_threshold: u32,
    /// If true, I/O that is not 4 KiB aligned in offset and length is
    /// resolved to pass-through rather than split at cache-line boundaries.
    pub pt_unaligned_io: bool,
    /// If true, engines may attempt the non-blocking fast path before
    /// falling back to the full state machine.
    pub use_submit_io_fast: bool,
    /// Backfill admission hysteresis.
    pub backfill: BackfillConfig,
    /// Partitions configured for this cache. Must include at least the
    /// default partition (id 0).
    pub partitions: Vec<PartitionConfig>,
}

impl CacheConfig {
    /// Validates the configuration, synchronously and without mutating any
    /// external state. See §7 "Invalid configuration".
    pub fn validate(&self) -> Result<()> {
        if self.num_cache_lines == 0 {
            return Err(Error::Inval);
        }
        if self.fallback_pt_error_threshold != FALLBACK_PT_INACTIVE
            && self.fallback_pt_error_threshold > FALLBACK_PT_MAX_THRESHOLD
        {
            return Err(Error::Inval);
        }
        self.backfill.validate()?;
        if self.partitions.is_empty() {
            return Err(Error::Inval);
        }
        if self.partitions.len() > MAX_USER_PARTITIONS as usize {
            return Err(Error::TooManyCores);
        }
        for p in &self.partitions {
            p.validate()?;
        }
        let total_min: u32 = self.partitions.iter().map(|p| u32::from(p.min_size_percent)).sum();
        if total_min > 100 {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_mode: CacheMode::Wt,
            cache_line_size: CacheLineSize::Kb4,
            metadata_layout: MetadataLayout::Sequential,
            num_cache_lines: 1024,
            fallback_pt_error_threshold: FALLBACK_PT_INACTIVE,
            pt_unaligned_io: false,
            use_submit_io_fast: true,
            backfill: BackfillConfig::default(),
            partitions: vec![PartitionConfig {
                name: String::from("default"),
                priority: 0,
                min_size_percent: 0,
                max_size_percent: 100,
                cache_mode: None,
                pinned: false,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_cache_lines_is_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.num_cache_lines = 0;
        assert_eq!(cfg.validate(), Err(Error::Inval));
    }

    #[test]
    fn overlapping_min_size_percent_is_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.partitions.push(PartitionConfig {
            name: String::from("extra"),
            priority: 1,
            min_size_percent: 60,
            max_size_percent: 100,
            cache_mode: None,
            pinned: false,
        });
        cfg.partitions[0].min_size_percent = 50;
        assert_eq!(cfg.validate(), Err(Error::Inval));
    }

    #[test]
    fn threshold_above_max_is_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.fallback_pt_error_threshold = FALLBACK_PT_MAX_THRESHOLD + 1;
        assert_eq!(cfg.validate(), Err(Error::Inval));
    }

    #[test]
    fn inactive_threshold_sentinel_is_allowed() {
        let mut cfg = CacheConfig::default();
        cfg.fallback_pt_error_threshold = FALLBACK_PT_INACTIVE;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn min_greater_than_max_partition_size_is_rejected() {
        let mut cfg = CacheConfig::default();
        cfg.partitions[0].min_size_percent = 80;
        cfg.partitions[0].max_size_percent = 50;
        assert_eq!(cfg.validate(), Err(Error::Inval));
    }
}
