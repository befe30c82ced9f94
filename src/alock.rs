//! Asynchronous per-cache-line reader/writer lock (§4.2).
//!
//! Every engine serializes conflicting access to a cache line through an
//! [`AsyncLock`]. The lock never blocks the calling thread: a failed fast
//! acquisition enqueues a [`Waiter`] and returns; the eventual unlock walks
//! the waiter list and invokes each woken waiter's callback, which is the
//! only path that resumes a suspended request (§9 Design Notes).

use core::sync::atomic::{AtomicU32, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{CacheLineId, INVALID};

const IDLE: u32 = 0;
const ONE_RD: u32 = 1;
const WR: u32 = u32::MAX;

/// Read or write, the mode an [`AsyncLock`] entry is held/requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRw {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Acquired synchronously; the caller may proceed immediately.
    Acquired,
    /// Enqueued; the caller must wait for its callback to fire.
    Queued,
    /// The waiter-list allocator would not accept a new waiter.
    NoMem,
}

/// A callback invoked exactly once when a queued waiter is finally granted
/// the lock. Implementations typically decrement a request's
/// `lock_remaining` counter and, on reaching zero, resume the request.
pub type LockCallback = Box<dyn FnOnce() + Send>;

struct Waiter {
    entry: CacheLineId,
    rw: LockRw,
    callback: LockCallback,
}

/// One atomic-counter entry plus the shard it is waited on through.
struct Shard {
    waiters: Mutex<VecDeque<Waiter>>,
}

/// A scalable per-entry reader/writer lock over `num_entries` cache lines.
///
/// Two independently sized instances are typically constructed: one keyed
/// by cache-line index, one keyed by metadata-page index for serializing
/// metadata write-back.
pub struct AsyncLock {
    state: Vec<AtomicU32>,
    shards: Vec<Shard>,
}

impl core::fmt::Debug for AsyncLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncLock")
            .field("num_entries", &self.state.len())
            .field("num_shards", &self.shards.len())
            .finish()
    }
}

fn shard_count_for(num_entries: usize) -> usize {
    // Power-of-two shard count, capped so tiny caches don't over-allocate
    // mutexes and large ones still get real parallelism.
    num_entries.min(4096).next_power_of_two().max(16)
}

impl AsyncLock {
    /// Builds a lock covering `num_entries` indices, all initially idle.
    #[must_use]
    pub fn new(num_entries: u32) -> Self {
        let n = num_entries as usize;
        let shard_count = shard_count_for(n.max(1));
        AsyncLock {
            state: (0..n).map(|_| AtomicU32::new(IDLE)).collect(),
            shards: (0..shard_count)
                .map(|_| Shard {
                    waiters: Mutex::new(VecDeque::new()),
                })
                .collect(),
        }
    }

    fn shard_index(&self, entry: CacheLineId) -> usize {
        entry as usize & (self.shards.len() - 1)
    }

    fn try_wr(&self, entry: CacheLineId) -> bool {
        self.state[entry as usize]
            .compare_exchange(IDLE, WR, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn try_rd_idle(&self, entry: CacheLineId) -> bool {
        self.state[entry as usize]
            .compare_exchange(IDLE, ONE_RD, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn try_rd(&self, entry: CacheLineId) -> bool {
        let cell = &self.state[entry as usize];
        let mut cur = cell.load(Ordering::Relaxed);
        loop {
            if cur == WR {
                return false;
            }
            match cell.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    fn unlock_wr_raw(&self, entry: CacheLineId) {
        let prev = self.state[entry as usize].swap(IDLE, Ordering::AcqRel);
        debug_assert_eq!(prev, WR, "unlock_wr on an entry not held exclusively");
    }

    fn unlock_rd_raw(&self, entry: CacheLineId) {
        let prev = self.state[entry as usize].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(
            prev > IDLE && prev <= WR,
            "unlock_rd on an entry with no readers"
        );
    }

    /// Attempts to acquire `entry` without ever touching the waiter list.
    /// This is the fair path only when `entry` has no pending waiters,
    /// since [`LockRw::Read`] deliberately refuses to join an occupied
    /// entry unless it can prove the waiter list is empty.
    #[must_use]
    pub fn try_lock(&self, entry: CacheLineId, rw: LockRw) -> bool {
        match rw {
            LockRw::Write => self.try_wr(entry),
            LockRw::Read => self.try_rd_idle(entry),
        }
    }

    /// Acquires `entry` in mode `rw`, invoking `callback` exactly once: on
    /// the calling thread if the lock is free, or later from whichever
    /// thread's [`AsyncLock::unlock`] call hands it off.
    pub fn lock(&self, entry: CacheLineId, rw: LockRw, callback: LockCallback) -> LockOutcome {
        let fast = match rw {
            LockRw::Write => self.try_wr(entry),
            LockRw::Read => self.try_rd_idle(entry),
        };
        if fast {
            callback();
            return LockOutcome::Acquired;
        }

        let shard = &self.shards[self.shard_index(entry)];
        let mut waiters = shard.waiters.lock();

        // Close the race: the entry may have been released between the
        // fast attempt above and taking the shard lock.
        let retry = match rw {
            LockRw::Write => self.try_wr(entry),
            LockRw::Read => {
                waiters.iter().all(|w| w.entry != entry) && self.try_rd(entry)
            }
        };
        if retry {
            drop(waiters);
            callback();
            return LockOutcome::Acquired;
        }

        waiters.push_back(Waiter {
            entry,
            rw,
            callback,
        });
        LockOutcome::Queued
    }

    /// Releases a write hold on `entry`, handing it off to queued waiters
    /// per the fairness rule in §4.2: the waiter list is walked head-first,
    /// waking every waiter whose mode is compatible with the running grant
    /// until the first incompatible one is found.
    pub fn unlock_wr(&self, entry: CacheLineId) {
        let shard = &self.shards[self.shard_index(entry)];
        let mut waiters = shard.waiters.lock();
        self.unlock_common(entry, &mut waiters, true);
    }

    /// Releases one read hold on `entry`, performing the same handoff walk
    /// as [`AsyncLock::unlock_wr`] but starting from the reader-release
    /// transitions (`rd2wr`/`rd2rd`).
    pub fn unlock_rd(&self, entry: CacheLineId) {
        let shard = &self.shards[self.shard_index(entry)];
        let mut waiters = shard.waiters.lock();
        self.unlock_common(entry, &mut waiters, false);
    }

    fn unlock_common(&self, entry: CacheLineId, waiters: &mut VecDeque<Waiter>, from_wr: bool) {
        let mut exchanged = true;
        let mut to_wake: Vec<LockCallback> = Vec::new();

        loop {
            let Some(pos) = waiters.iter().position(|w| w.entry == entry) else {
                break;
            };
            let rw = waiters[pos].rw;

            let locked = if exchanged {
                match rw {
                    LockRw::Write => {
                        if from_wr {
                            self.wr_to_wr(entry)
                        } else {
                            self.try_rd_to_wr(entry)
                        }
                    }
                    LockRw::Read => {
                        if from_wr {
                            self.try_wr_to_rd(entry)
                        } else {
                            self.try_rd_to_rd(entry)
                        }
                    }
                }
            } else {
                match rw {
                    LockRw::Write => self.try_wr(entry),
                    LockRw::Read => self.try_rd(entry),
                }
            };

            if locked {
                exchanged = false;
                let waiter = waiters.remove(pos).expect("position just located");
                to_wake.push(waiter.callback);
            } else {
                break;
            }
        }

        if exchanged {
            // No waiter could be promoted: release fully.
            if from_wr {
                self.unlock_wr_raw(entry);
            } else {
                self.unlock_rd_raw(entry);
            }
        }

        drop(waiters);
        for cb in to_wake {
            cb();
        }
    }

    /// `WR -> WR`: handing an exclusive hold directly to a queued writer.
    /// The atomic value does not change; the release and the grant cancel
    /// out, so this always succeeds given the caller still holds `WR`.
    fn wr_to_wr(&self, entry: CacheLineId) -> bool {
        self.state[entry as usize].load(Ordering::Relaxed) == WR
    }

    /// `WR -> RD`: valid only as the first handoff step out of a write
    /// hold, since the releasing writer was the sole holder.
    fn try_wr_to_rd(&self, entry: CacheLineId) -> bool {
        self.state[entry as usize]
            .compare_exchange(WR, ONE_RD, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// `RD(1) -> WR`: valid only when exactly one reader remains (the one
    /// releasing).
    fn try_rd_to_wr(&self, entry: CacheLineId) -> bool {
        self.state[entry as usize]
            .compare_exchange(ONE_RD, WR, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// `RD(n) -> RD(n)`: releasing one reader while immediately granting
    /// another, i.e. the count does not change across the handoff.
    fn try_rd_to_rd(&self, entry: CacheLineId) -> bool {
        let cur = self.state[entry as usize].load(Ordering::Relaxed);
        cur != IDLE && cur != WR
    }

    /// Removes a still-queued waiter (request cancellation). Returns true
    /// if a waiter was found and dropped unfired; false if no matching
    /// waiter was queued (it may already have been granted).
    pub fn cancel(&self, entry: CacheLineId) -> bool {
        let shard = &self.shards[self.shard_index(entry)];
        let mut waiters = shard.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.entry == entry) {
            waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Number of entries this lock covers.
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.state.len()
    }
}

/// A self-contained blocking facade over [`AsyncLock`] for call sites that
/// want to wait synchronously (tests, and the fast-path engines that never
/// suspend). Internally still goes through the async callback contract.
#[must_use]
pub fn lock_blocking(lock: &Arc<AsyncLock>, entry: CacheLineId, rw: LockRw) {
    let pair = Arc::new((Mutex::new(false), parking_lot::Condvar::new()));
    let pair2 = Arc::clone(&pair);
    let outcome = lock.lock(
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn write_then_write_queues_second() {
        let lock = AsyncLock::new(4);
        assert!(lock.try_lock(0, LockRw::Write));
        assert!(!lock.try_lock(0, LockRw::Write));
        lock.unlock_wr(0);
        assert!(lock.try_lock(0, LockRw::Write));
    }

    #[test]
    fn multiple_readers_share_entry() {
        let lock = AsyncLock::new(4);
        assert!(lock.try_lock(0, LockRw::Read));
        assert!(lock.try_lock(0, LockRw::Read));
        assert!(!lock.try_lock(0, LockRw::Write));
        lock.unlock_rd(0);
        lock.unlock_rd(0);
        assert!(lock.try_lock(0, LockRw::Write));
    }

    #[test]
    fn queued_writer_is_woken_on_unlock() {
        let lock = Arc::new(AsyncLock::new(4));
        assert!(lock.try_lock(0, LockRw::Write));

        let woken = Arc::new(AtomicUsize::new(0));
        let woken2 = Arc::clone(&woken);
        let outcome = lock.lock(
            0,
            LockRw::Write,
            Box::new(move || {
                woken2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(outcome, LockOutcome::Queued);
        assert_eq!(woken.load(Ordering::SeqCst), 0);

        lock.unlock_wr(0);
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writer_waiting_blocks_new_readers_from_fast_path() {
        // trylock_rd_idle requires an empty waiter list, so once a writer
        // is queued, fast-path readers must fail and join the queue too.
        let lock = Arc::new(AsyncLock::new(4));
        assert!(lock.try_lock(0, LockRw::Read));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let outcome = lock.lock(0, LockRw::Write, Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(outcome, LockOutcome::Queued);

        // A fresh reader must not be able to fast-path in now.
        assert!(!lock.try_lock(0, LockRw::Read));

        lock.unlock_rd(0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_removes_unfired_waiter() {
        let lock = Arc::new(AsyncLock::new(4));
        assert!(lock.try_lock(0, LockRw::Write));
        let outcome = lock.lock(0, LockRw::Write, Box::new(|| {}));
        assert_eq!(outcome, LockOutcome::Queued);
        assert!(lock.cancel(0));
        assert!(!lock.cancel(0));
    }

    #[test]
    fn concurrent_stress_all_threads_make_progress() {
        use std::thread;

        let lock = Arc::new(AsyncLock::new(16));
        let mut handles = Vec::new();
        for t in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for i in 0..2000u32 {
                    let entry = (t * 31 + i) % 16;
                    let rw = if i % 3 == 0 { LockRw::Write } else { LockRw::Read };
                    lock_blocking(&lock, entry, rw);
                    if rw == LockRw::Write {
                        lock.unlock_wr(entry);
                    } else {
                        lock.unlock_rd(entry);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for e in 0..16 {
            assert!(lock.try_lock(e, LockRw::Write));
            lock.unlock_wr(e);
        }
    }
}
