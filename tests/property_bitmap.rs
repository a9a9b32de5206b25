//! Property-based tests for the bitmap allocator and block addressing
//!
//! Uses proptest to verify allocator invariants hold across random
//! allocate/free sequences

use proptest::prelude::*;
use slabfs::core::allocator::Bitmap;
use slabfs::core::inode::{global_index, local_index, per_group};

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..40).prop_map(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn zero_bits(bitmap: &Bitmap) -> usize {
    bitmap
        .as_bytes()
        .iter()
        .map(|b| b.count_zeros() as usize)
        .sum()
}

proptest! {
    #[test]
    fn prop_free_bits_match_raw_bitmap(ops in prop::collection::vec(op(), 1..200)) {
        let mut bitmap = Bitmap::new(64);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(count) => {
                    if let Some(start) = bitmap.allocate(count).unwrap() {
                        live.push((start, count));
                    } else {
                        prop_assert!(!bitmap.can_allocate(count));
                    }
                }
                Op::Free(pick) if !live.is_empty() => {
                    let (start, count) = live.swap_remove(pick % live.len());
                    bitmap.free(start, count).unwrap();
                }
                Op::Free(_) => {}
            }
            prop_assert_eq!(bitmap.free_bits(), zero_bits(&bitmap));
        }
    }

    #[test]
    fn prop_allocations_never_overlap(sizes in prop::collection::vec(1usize..64, 1..60), frees in prop::collection::vec(any::<bool>(), 60)) {
        let mut bitmap = Bitmap::new(128);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for (i, count) in sizes.into_iter().enumerate() {
            if let Some(start) = bitmap.allocate(count).unwrap() {
                for &(other, other_count) in &live {
                    prop_assert!(
                        start + count <= other || other + other_count <= start,
                        "{}..{} overlaps {}..{}",
                        start, start + count, other, other + other_count
                    );
                }
                for bit in start..start + count {
                    prop_assert!(bitmap.is_set(bit));
                }
                live.push((start, count));
            }
            if frees[i] && live.len() > 1 {
                let (start, count) = live.remove(0);
                bitmap.free(start, count).unwrap();
            }
        }
    }

    #[test]
    fn prop_reloaded_bitmap_agrees(sizes in prop::collection::vec(1usize..32, 1..40)) {
        let mut bitmap = Bitmap::new(32);
        let mut live = Vec::new();
        for (i, count) in sizes.into_iter().enumerate() {
            if let Some(start) = bitmap.allocate(count).unwrap() {
                live.push((start, count));
            }
            if i % 3 == 2 && !live.is_empty() {
                let (start, count) = live.remove(live.len() / 2);
                bitmap.free(start, count).unwrap();
            }
        }

        let reloaded = Bitmap::load(bitmap.as_bytes().to_vec());
        prop_assert_eq!(reloaded.free_bits(), bitmap.free_bits());
        prop_assert_eq!(reloaded.boundary(), bitmap.boundary());
        prop_assert_eq!(reloaded.fragments().total(), bitmap.fragments().total());
    }

    #[test]
    fn prop_addressing_round_trip(
        block_size in prop_oneof![Just(128u16), Just(256u16), Just(512u16), Just(1024u16)],
        group in 0i32..2000,
        local_seed in any::<usize>(),
    ) {
        let local = local_seed % per_group(block_size);
        let global = global_index(group, local, block_size);
        prop_assert_eq!(local_index(global, block_size), (group, local));
    }
}

#[test]
fn test_double_free_is_detected() {
    let mut bitmap = Bitmap::new(8);
    let start = bitmap.allocate(4).unwrap().unwrap();
    bitmap.allocate(4).unwrap().unwrap();
    bitmap.free(start, 4).unwrap();
    let err = bitmap.free(start, 4).unwrap_err();
    assert!(err.is_internal());
}
