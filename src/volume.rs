//! Volume interface: the environment contract for cache/core block devices
//! (§6 "Environment contract").
//!
//! The engines never touch a concrete storage backend; they only call
//! through [`Volume`]. This crate is agnostic to whether a `Volume` is a
//! raw block device, a file, or (as in the test suite) a plain in-memory
//! byte buffer.

use crate::error::{Error, Result};

/// A contiguous byte range `[offset, offset + data.len())` to read or write.
#[derive(Debug)]
pub struct IoRequest<'a> {
    /// Byte offset into the volume.
    pub offset: u64,
    /// Data to write, or the buffer to fill on a read.
    pub data: &'a mut [u8],
}

/// A block device backing either the cache or a core. All operations are
/// synchronous from the engine's point of view; an embedder wiring this to
/// real asynchronous hardware is expected to block the calling worker
/// thread for the duration of the call (§5 "Scheduling model" already
/// assumes a per-queue worker pool sized for this).
pub trait Volume: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` starting at `offset`.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flushes any volatile write cache to stable storage.
    fn flush(&self) -> Result<()>;

    /// Discards (TRIMs) `[offset, offset + length)`. Implementations that
    /// cannot discard may simply report success without releasing storage.
    fn discard(&self, offset: u64, length: u64) -> Result<()>;

    /// Writes zeroes to `[offset, offset + length)`.
    fn write_zeroes(&self, offset: u64, length: u64) -> Result<()>;

    /// Total addressable length of the volume, in bytes.
    fn length(&self) -> u64;

    /// Largest single I/O this volume accepts, in bytes.
    fn max_io_size(&self) -> u64;
}

/// A plain in-memory [`Volume`], used by the test suite to stand in for
/// both the cache device and core devices without real I/O.
#[derive(Debug)]
pub struct MemVolume {
    data: parking_lot::Mutex<Vec<u8>>,
    max_io_size: u64,
}

impl MemVolume {
    /// Builds a zero-filled volume of `len` bytes.
    #[must_use]
    pub fn new(len: u64) -> Self {
        MemVolume {
            data: parking_lot::Mutex::new(vec![0u8; len as usize]),
            max_io_size: 1024 * 1024,
        }
    }

    /// Fills the whole volume with a repeating byte pattern derived from
    /// `seed`, useful for giving each core offset a distinguishable value
    /// in tests.
    pub fn fill_pattern(&self, seed: u8) {
        let mut data = self.data.lock();
        for (i, b) in data.iter_mut().enumerate() {
            *b = seed.wrapping_add((i % 251) as u8);
        }
    }
}

impl Volume for MemVolume {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Error::Inval)?;
        if end > data.len() {
            return Err(Error::Io);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Error::Inval)?;
        if end > data.len() {
            return Err(Error::Io);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn discard(&self, offset: u64, length: u64) -> Result<()> {
        self.write_zeroes(offset, length)
    }

    fn write_zeroes(&self, offset: u64, length: u64) -> Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start.checked_add(length as usize).ok_or(Error::Inval)?;
        if end > data.len() {
            return Err(Error::Io);
        }
        for b in &mut data[start..end] {
            *b = 0;
        }
        Ok(())
    }

    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn max_io_size(&self) -> u64 {
        self.max_io_size
    }
}

/// A [`Volume`] wrapper that fails every Nth operation, used to exercise
/// the error-handling paths of §7 (fallback pass-through, metadata error).
#[derive(Debug)]
pub struct FlakyVolume<V> {
    inner: V,
    fail_every: u64,
    calls: core::sync::atomic::AtomicU64,
}

impl<V: Volume> FlakyVolume<V> {
    /// Wraps `inner`, failing every `fail_every`-th call (1-indexed). A
    /// `fail_every` of 0 never fails.
    #[must_use]
    pub fn new(inner: V, fail_every: u64) -> Self {
        FlakyVolume {
            inner,
            fail_every,
            calls: core::sync::atomic::AtomicU64::new(0),
        }
    }

    fn should_fail(&self) -> bool {
        if self.fail_every == 0 {
            return false;
        }
        let n = self.calls.fetch_add(1, core::sync::atomic::Ordering::Relaxed) + 1;
        n % self.fail_every == 0
    }
}

impl<V: Volume> Volume for FlakyVolume<V> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.should_fail() {
            return Err(Error::Io);
        }
        self.inner.read(offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.should_fail() {
            return Err(Error::Io);
        }
        self.inner.write(offset, buf)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn discard(&self, offset: u64, length: u64) -> Result<()> {
        self.inner.discard(offset, length)
    }

    fn write_zeroes(&self, offset: u64, length: u64) -> Result<()> {
        self.inner.write_zeroes(offset, length)
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn max_io_size(&self) -> u64 {
        self.inner.max_io_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_volume_round_trips() {
        let vol = MemVolume::new(4096);
        vol.write(0, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        vol.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn mem_volume_rejects_out_of_range() {
        let vol = MemVolume::new(16);
        let mut buf = [0u8; 4];
        assert!(vol.read(14, &mut buf).is_err());
    }

    #[test]
    fn discard_zeroes_range() {
        let vol = MemVolume::new(16);
        vol.write(0, &[9; 16]).unwrap();
        vol.discard(4, 8).unwrap();
        let mut buf = [0u8; 16];
        vol.read(0, &mut buf).unwrap();
        assert_eq!(&buf[4..12], &[0; 8]);
        assert_eq!(&buf[0..4], &[9; 4]);
    }

    #[test]
    fn flaky_volume_fails_on_schedule() {
        let vol = FlakyVolume::new(MemVolume::new(16), 3);
        assert!(vol.write(0, &[1]).is_ok());
        assert!(vol.write(0, &[1]).is_ok());
        assert!(vol.write(0, &[1]).is_err());
        assert!(vol.write(0, &[1]).is_ok());
    }
}
