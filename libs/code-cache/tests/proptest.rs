// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use code_cache::{FreeBlock, RangeAllocator};
use proptest::prelude::*;

const CAPACITY: u32 = 64 * 1024;

#[derive(Debug, Clone)]
enum Op {
    Allocate(u32),
    /// Frees the live allocation at this index (modulo the number of live allocations).
    Free(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            3 => (1_u32..2048).prop_map(|size| Op::Allocate(size.next_multiple_of(4))),
            2 => any::<usize>().prop_map(Op::Free),
        ],
        0..256,
    )
}

fn assert_free_list_invariants(alloc: &RangeAllocator, live: &[(u32, u32)]) {
    let blocks = alloc.blocks();

    for block in blocks {
        assert!(block.size > 0, "empty free block {block:?}");
        assert!(block.end() <= alloc.capacity());
    }

    // sorted, and never touching (touching blocks must have been merged)
    for pair in blocks.windows(2) {
        let [a, b]: &[FreeBlock; 2] = pair.try_into().unwrap();
        assert!(a.end() < b.offset, "blocks {a:?} and {b:?} not coalesced");
    }

    // free and allocated space add up to the capacity without overlapping
    let allocated: u64 = live.iter().map(|(_, size)| u64::from(*size)).sum();
    assert_eq!(alloc.free_size() + allocated, u64::from(alloc.capacity()));

    for (offset, size) in live {
        let end = offset + size;
        for block in blocks {
            assert!(
                end <= block.offset || block.end() <= *offset,
                "live allocation {offset:#x}..{end:#x} overlaps free block {block:?}"
            );
        }
    }
}

proptest! {
    #[test]
    fn free_list_stays_sorted_and_coalesced(ops in ops()) {
        let mut alloc = RangeAllocator::new(CAPACITY);
        let mut live: Vec<(u32, u32)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(size) => {
                    if let Some(offset) = alloc.allocate(size) {
                        prop_assert_eq!(offset % 4, 0);
                        live.push((offset, size));
                    } else {
                        // first fit only fails if no block is large enough
                        prop_assert!(alloc.blocks().iter().all(|block| block.size < size));
                    }
                }
                Op::Free(index) => {
                    if !live.is_empty() {
                        let (offset, size) = live.swap_remove(index % live.len());
                        alloc.free(offset, size);
                    }
                }
            }

            assert_free_list_invariants(&alloc, &live);
        }

        for (offset, size) in live.drain(..) {
            alloc.free(offset, size);
        }
        prop_assert_eq!(alloc.blocks(), &[FreeBlock { offset: 0, size: CAPACITY }]);
    }
}
