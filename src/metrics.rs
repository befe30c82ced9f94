//! Statistics hook (§1.1 ambient stack).
//!
//! The statistics counters themselves are explicitly out of scope (§1); the
//! core only needs a narrow seam to notify whatever embedder-owned metrics
//! subsystem is listening. [`StatsSink`] is that seam.

use crate::types::{CacheMode, PartitionId};

/// A structured event the engines and space manager emit as they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    /// A request's core-line lookup found an existing mapping.
    Hit {
        /// Mode the request was serviced under.
        mode: CacheMode,
    },
    /// A request's core-line lookup found no mapping.
    Miss {
        /// Mode the request was serviced under.
        mode: CacheMode,
    },
    /// A cache line was newly mapped into `partition`.
    Insertion {
        /// Destination partition.
        partition: PartitionId,
    },
    /// A cache line was evicted out of `partition`.
    Eviction {
        /// Source partition.
        partition: PartitionId,
    },
    /// A line transitioned from clean to dirty.
    Dirtied {
        /// Owning partition.
        partition: PartitionId,
    },
    /// A line transitioned from dirty to clean.
    Cleaned {
        /// Owning partition.
        partition: PartitionId,
    },
    /// The fallback pass-through latch just engaged.
    FallbackPtLatched,
    /// A metadata I/O failed, putting the cache in the non-running state.
    MetadataError,
}

/// Receives [`StatEvent`]s as the core runs. Implementations must not
/// block or panic; this is called from the request hot path.
pub trait StatsSink: Send + Sync {
    /// Record one event. The default no-op lets implementors override only
    /// the events they care about (none of them, in [`NullStatsSink`]'s case).
    fn record(&self, event: StatEvent);
}

/// The default sink: discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn record(&self, _event: StatEvent) {}
}

/// A sink that accumulates simple atomic counters, used heavily by tests
/// to assert on engine behavior without scraping log output.
#[derive(Debug, Default)]
pub struct CountingStatsSink {
    /// Number of [`StatEvent::Hit`] events observed.
    pub hits: core::sync::atomic::AtomicU64,
    /// Number of [`StatEvent::Miss`] events observed.
    pub misses: core::sync::atomic::AtomicU64,
    /// Number of [`StatEvent::Insertion`] events observed.
    pub insertions: core::sync::atomic::AtomicU64,
    /// Number of [`StatEvent::Eviction`] events observed.
    pub evictions: core::sync::atomic::AtomicU64,
    /// Number of [`StatEvent::Dirtied`] events observed.
    pub dirtied: core::sync::atomic::AtomicU64,
    /// Number of [`StatEvent::Cleaned`] events observed.
    pub cleaned: core::sync::atomic::AtomicU64,
    /// Number of times the fallback pass-through latch engaged.
    pub fallback_pt_latches: core::sync::atomic::AtomicU64,
    /// Number of metadata errors observed.
    pub metadata_errors: core::sync::atomic::AtomicU64,
}

impl StatsSink for CountingStatsSink {
    fn record(&self, event: StatEvent) {
        use core::sync::atomic::Ordering::Relaxed;
        match event {
            StatEvent::Hit { .. } => self.hits.fetch_add(1, Relaxed),
            StatEvent::Miss { .. } => self.misses.fetch_add(1, Relaxed),
            StatEvent::Insertion { .. } => self.insertions.fetch_add(1, Relaxed),
            StatEvent::Eviction { .. } => self.evictions.fetch_add(1, Relaxed),
            StatEvent::Dirtied { .. } => self.dirtied.fetch_add(1, Relaxed),
            StatEvent::Cleaned { .. } => self.cleaned.fetch_add(1, Relaxed),
            StatEvent::FallbackPtLatched => self.fallback_pt_latches.fetch_add(1, Relaxed),
            StatEvent::MetadataError => self.metadata_errors.fetch_add(1, Relaxed),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering::Relaxed;

    #[test]
    fn counting_sink_tallies_by_kind() {
        let sink = CountingStatsSink::default();
        sink.record(StatEvent::Hit { mode: CacheMode::Wt });
        sink.record(StatEvent::Hit { mode: CacheMode::Wt });
        sink.record(StatEvent::Miss { mode: CacheMode::Wt });
        sink.record(StatEvent::FallbackPtLatched);
        assert_eq!(sink.hits.load(Relaxed), 2);
        assert_eq!(sink.misses.load(Relaxed), 1);
        assert_eq!(sink.fallback_pt_latches.load(Relaxed), 1);
    }

    #[test]
    fn null_sink_does_nothing_observable() {
        let sink = NullStatsSink;
        sink.record(StatEvent::MetadataError);
    }
}
