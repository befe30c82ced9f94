//! Property-based tests for the testable invariants of §8.

use proptest::prelude::*;
use std::sync::Arc;

use cachelines_rs::bitmap::{LineBitmaps, SectorBitmap, Width32};
use cachelines_rs::config::{CacheConfig, CoreConfig};
use cachelines_rs::volume::MemVolume;
use cachelines_rs::{Cache, CacheMode};

fn sector_pair() -> impl Strategy<Value = (u8, u8)> {
    (0u8..32, 0u8..32).prop_map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
}

proptest! {
    /// §8 invariant 8 — for callers that respect the "mark valid before
    /// dirty" contract (every caller in this crate does: see `engine.rs`),
    /// `dirty` never has a bit set that `valid` doesn't.
    #[test]
    fn dirty_implies_valid(ranges in proptest::collection::vec(sector_pair(), 1..16)) {
        let mut bm: LineBitmaps<Width32> = LineBitmaps::empty();
        for (start, stop) in ranges {
            bm.set_valid(start, stop);
            bm.set_dirty(start, stop);
            prop_assert!(!bm.dirty.test(start, stop, true) || bm.valid.test(start, stop, true));
        }
        for bit in 0..32u8 {
            if bm.dirty.test(bit, bit, false) {
                prop_assert!(bm.valid.test(bit, bit, false));
            }
        }
    }

    /// `clear_valid` also clears the corresponding dirty bits: a line can
    /// never end up "dirty but not valid" (§3/§8 invariant 8).
    #[test]
    fn clear_valid_also_clears_dirty(ranges in proptest::collection::vec(sector_pair(), 1..16)) {
        let mut bm: LineBitmaps<Width32> = LineBitmaps::empty();
        for (start, stop) in &ranges {
            bm.set_dirty(*start, *stop);
        }
        for (start, stop) in ranges {
            bm.clear_valid(start, stop);
            prop_assert!(!bm.dirty.test(start, stop, false));
        }
    }

    /// A raw [`SectorBitmap`] never reports bits outside `[start, stop]` as
    /// set just because `set` was called on that range.
    #[test]
    fn set_is_confined_to_its_range(start in 0u8..32, len in 1u8..8) {
        let stop = (start + len - 1).min(31);
        let mut bm: SectorBitmap<Width32> = SectorBitmap::empty();
        bm.set(start, stop);
        prop_assert!(bm.test(start, stop, true));
        if start > 0 {
            prop_assert!(!bm.test(0, start - 1, false));
        }
        if stop < 31 {
            prop_assert!(!bm.test(stop + 1, 31, false));
        }
    }
}

fn wt_wb_wa_mode() -> impl Strategy<Value = CacheMode> {
    prop_oneof![Just(CacheMode::Wt), Just(CacheMode::Wb), Just(CacheMode::Wa)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// §8 invariant 9 — round-trip: reading back exactly what was written
    /// returns the same bytes, regardless of cache mode.
    #[test]
    fn write_then_read_round_trips(mode in wt_wb_wa_mode(), byte in any::<u8>(), line in 0u64..8) {
        let mut cfg = CacheConfig::default();
        cfg.num_cache_lines = 8;
        cfg.cache_mode = mode;
        let cache_vol = Arc::new(MemVolume::new(8 * 4096));
        let cache = Cache::new(cfg, cache_vol).unwrap();
        let core_vol = Arc::new(MemVolume::new(64 * 4096));
        cache.add_core(0, CoreConfig::default(), core_vol).unwrap();

        let offset = line * 4096;
        cache.write(0, offset, &[byte; 512]).unwrap();
        let mut buf = [0u8; 512];
        cache.read(0, offset, &mut buf).unwrap();
        prop_assert_eq!(buf, [byte; 512]);
    }
}
