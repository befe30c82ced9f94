//! Concurrent cache benchmarks.
//!
//! Measures throughput of [`Cache::read`]/[`Cache::write`] under contention
//! from multiple threads, across cache modes and overlap patterns.

use std::sync::Arc;
use std::thread;

use cachelines_rs::config::{CacheConfig, CoreConfig};
use cachelines_rs::volume::MemVolume;
use cachelines_rs::{Cache, CacheMode};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const CACHE_LINES: u32 = 4096;
const LINE_BYTES: u64 = 4096;
const OPS_PER_THREAD: usize = 1_000;

fn make_cache(mode: CacheMode, num_lines: u32) -> Arc<Cache> {
    let mut cfg = CacheConfig::default();
    cfg.num_cache_lines = num_lines;
    cfg.cache_mode = mode;
    let cache_vol = Arc::new(MemVolume::new(u64::from(num_lines) * LINE_BYTES));
    let cache = Cache::new(cfg, cache_vol).unwrap();
    let core_vol = Arc::new(MemVolume::new(u64::from(num_lines) * LINE_BYTES * 4));
    cache.add_core(0, CoreConfig::default(), core_vol).unwrap();
    cache
}

fn run_concurrent_reads(cache: Arc<Cache>, num_threads: usize) {
    let mut handles = Vec::with_capacity(num_threads);
    for t in 0..num_threads {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            let mut buf = [0u8; 512];
            for i in 0..OPS_PER_THREAD {
                let line = (t * OPS_PER_THREAD + i) as u64 % u64::from(CACHE_LINES);
                black_box(cache.read(0, line * LINE_BYTES, &mut buf).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

fn run_concurrent_writes(cache: Arc<Cache>, num_threads: usize) {
    let payload = [0x42u8; 512];
    let mut handles = Vec::with_capacity(num_threads);
    for t in 0..num_threads {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..OPS_PER_THREAD {
                let line = (t * OPS_PER_THREAD + i) as u64 % u64::from(CACHE_LINES);
                black_box(cache.write(0, line * LINE_BYTES, &payload).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Disjoint working sets per thread: little to no contention on any one
/// cache line's [`crate::alock`] shard.
fn concurrent_reads_disjoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("Concurrent Reads (disjoint)");
    group.throughput(Throughput::Elements((8 * OPS_PER_THREAD) as u64));

    let cache = make_cache(CacheMode::Wt, CACHE_LINES);
    for line in 0..CACHE_LINES {
        cache.write(0, u64::from(line) * LINE_BYTES, &[1u8; 512]).unwrap();
    }

    group.bench_function("8 threads", |b| {
        b.iter(|| run_concurrent_reads(Arc::clone(&cache), 8));
    });
    group.finish();
}

/// Every thread writes distinct offsets; contention comes only from shared
/// space-management state, not from overlapping per-line locks.
fn concurrent_writes_disjoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("Concurrent Writes (disjoint)");
    group.throughput(Throughput::Elements((8 * OPS_PER_THREAD) as u64));

    group.bench_function("Wt, 8 threads", |b| {
        let cache = make_cache(CacheMode::Wt, CACHE_LINES);
        b.iter(|| run_concurrent_writes(Arc::clone(&cache), 8));
    });

    group.bench_function("Wb, 8 threads", |b| {
        let cache = make_cache(CacheMode::Wb, CACHE_LINES);
        b.iter(|| run_concurrent_writes(Arc::clone(&cache), 8));
    });

    group.finish();
}

/// A small, deliberately undersized cache: every write forces eviction
/// under contention (§8 S2), exercising the space manager's locking.
fn concurrent_writes_high_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("Concurrent Writes (high contention)");
    group.throughput(Throughput::Elements((8 * OPS_PER_THREAD) as u64));

    group.bench_function("16 lines, 8 threads", |b| {
        let cache = make_cache(CacheMode::Wb, 16);
        b.iter(|| run_concurrent_writes(Arc::clone(&cache), 8));
    });

    group.finish();
}

/// Scaling the number of threads against a fixed, generously sized cache.
fn thread_count_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("Thread Count Scaling (writes)");

    for threads in [1, 2, 4, 8, 16] {
        group.throughput(Throughput::Elements((threads * OPS_PER_THREAD) as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &n| {
            let cache = make_cache(CacheMode::Wt, CACHE_LINES);
            b.iter(|| run_concurrent_writes(Arc::clone(&cache), n));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    concurrent_reads_disjoint,
    concurrent_writes_disjoint,
    concurrent_writes_high_contention,
    thread_count_scaling
);
criterion_main!(benches);
