//! Error taxonomy for the cache engine.
//!
//! A single [`Error`] enum covers the exhaustive error space the core can
//! raise. Every fallible operation in this crate returns `Result<T, Error>`;
//! there is no panicking path outside of construction-time invariants that
//! are already checked elsewhere (e.g. indexing an arena with a sentinel).

use thiserror::Error;

/// The result type used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors the cache engine can surface to a host.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A request or configuration argument was invalid.
    #[error("invalid argument")]
    Inval,
    /// A memory or waiter-list allocation failed.
    #[error("out of memory")]
    NoMem,
    /// The operation should be retried; no permanent state change occurred.
    #[error("try again")]
    Again,
    /// A volume I/O failed.
    #[error("I/O error")]
    Io,
    /// The requested core is not currently available (e.g. detaching).
    #[error("core not available")]
    CoreNotAvail,
    /// The requested core does not exist in this cache.
    #[error("core does not exist")]
    CoreNotExist,
    /// A core with this identity is already attached.
    #[error("core already exists")]
    CoreExist,
    /// A core with this UUID is already attached to another cache.
    #[error("core UUID already exists")]
    CoreUuidExists,
    /// The cache has reached its maximum number of attached cores.
    #[error("too many cores")]
    TooManyCores,
    /// The operation is disallowed while the cache is write-caching.
    #[error("cache is writing back dirty data")]
    WriteCache,
    /// The cache's metadata is in an incomplete state.
    #[error("cache is in an incomplete state")]
    CacheIncomplete,
    /// The target core is inactive.
    #[error("core is in an inactive state")]
    CoreInactive,
    /// A flush is already running.
    #[error("flush already in progress")]
    FlushInProgress,
    /// A running flush was interrupted by [`crate::cache::Cache::flush_interrupt`].
    #[error("flushing was interrupted")]
    FlushingInterrupted,
    /// A cache-line lock could not be acquired.
    #[error("could not acquire lock")]
    NoLock,
    /// The cache has no valid metadata.
    #[error("no metadata")]
    NoMetadata,
    /// The on-disk metadata version does not match this build.
    #[error("metadata version mismatch")]
    MetadataVersion,
    /// The configured volume type is not a valid choice.
    #[error("invalid volume type")]
    InvalVolumeType,
    /// The cache volume failed validation.
    #[error("invalid cache device")]
    InvalCacheDev,
    /// The named I/O class (partition) does not exist.
    #[error("I/O class does not exist")]
    IoClassNotExist,
    /// The requested operation is not supported by this build.
    #[error("not supported")]
    NotSupp,
}
