use std::sync::Arc;

use cachelines_rs::config::{CacheConfig, CoreConfig};
use cachelines_rs::volume::MemVolume;
use cachelines_rs::{Cache, CacheMode, Volume};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const CACHE_LINES: u32 = 4096;
const LINE_BYTES: u64 = 4096;

fn make_cache(mode: CacheMode) -> (Arc<Cache>, Arc<MemVolume>) {
    let mut cfg = CacheConfig::default();
    cfg.num_cache_lines = CACHE_LINES;
    cfg.cache_mode = mode;
    let cache_vol = Arc::new(MemVolume::new(u64::from(CACHE_LINES) * LINE_BYTES));
    let cache = Cache::new(cfg, cache_vol).unwrap();
    let core_vol = Arc::new(MemVolume::new(u64::from(CACHE_LINES) * LINE_BYTES * 4));
    cache.add_core(0, CoreConfig::default(), Arc::clone(&core_vol)).unwrap();
    (cache, core_vol)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Cache Operations");

    // Write-through
    {
        let (cache, _core_vol) = make_cache(CacheMode::Wt);
        let payload = [0xabu8; 512];

        group.bench_function("Wt write miss", |b| {
            let mut offset = 0u64;
            b.iter(|| {
                black_box(cache.write(0, offset, &payload).unwrap());
                offset = (offset + LINE_BYTES) % (u64::from(CACHE_LINES) * LINE_BYTES);
            });
        });

        cache.write(0, 0, &payload).unwrap();
        group.bench_function("Wt read hit", |b| {
            let mut buf = [0u8; 512];
            b.iter(|| {
                black_box(cache.read(0, 0, &mut buf).unwrap());
            });
        });
    }

    // Write-back
    {
        let (cache, _core_vol) = make_cache(CacheMode::Wb);
        let payload = [0xcdu8; 512];

        group.bench_function("Wb write (no core I/O)", |b| {
            let mut offset = 0u64;
            b.iter(|| {
                black_box(cache.write(0, offset, &payload).unwrap());
                offset = (offset + LINE_BYTES) % (u64::from(CACHE_LINES) * LINE_BYTES);
            });
        });

        group.bench_function("Wb flush", |b| {
            b.iter(|| {
                // Fill a handful of dirty lines, then time writing them back.
                for i in 0..16u64 {
                    cache.write(0, i * LINE_BYTES, &payload).unwrap();
                }
                black_box(cache.flush().unwrap());
            });
        });
    }

    // Read-miss backfill
    {
        let (cache, core_vol) = make_cache(CacheMode::Wt);
        core_vol.write(0, &vec![0x11u8; (LINE_BYTES * u64::from(CACHE_LINES)) as usize]).unwrap();

        group.bench_function("Wt read miss (backfill)", |b| {
            let mut offset = 0u64;
            let mut buf = [0u8; 512];
            b.iter(|| {
                black_box(cache.read(0, offset, &mut buf).unwrap());
                offset = (offset + LINE_BYTES) % (u64::from(CACHE_LINES) * LINE_BYTES);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
