// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

/// A free range of offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: u32,
    pub size: u32,
}

impl FreeBlock {
    #[inline]
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    #[inline]
    pub fn range(&self) -> Range<u32> {
        self.offset..self.end()
    }
}

/// First-fit allocator of offsets in `0..capacity`.
///
/// The free list is kept sorted by offset, and blocks that touch are always merged, so it never
/// contains two adjacent blocks.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    capacity: u32,
    blocks: Vec<FreeBlock>,
}

impl RangeAllocator {
    pub fn new(capacity: u32) -> Self {
        let blocks = if capacity > 0 {
            vec![FreeBlock {
                offset: 0,
                size: capacity,
            }]
        } else {
            Vec::new()
        };

        Self { capacity, blocks }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Allocates `size` bytes from the lowest block that can hold them.
    ///
    /// Returns `None` if no single free block is large enough.
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        debug_assert!(size > 0, "zero-sized allocation");

        let index = self.blocks.iter().position(|block| block.size >= size)?;
        let block = &mut self.blocks[index];
        let offset = block.offset;

        if block.size == size {
            self.blocks.remove(index);
        } else {
            block.offset += size;
            block.size -= size;
        }

        Some(offset)
    }

    /// Allocates `size` bytes starting at a multiple of `align` from the lowest block that can
    /// hold them. The part of the block in front of the allocation stays free.
    pub fn allocate_aligned(&mut self, size: u32, align: u32) -> Option<u32> {
        debug_assert!(size > 0, "zero-sized allocation");
        debug_assert!(align.is_power_of_two(), "alignment {align:#x} is not a power of two");

        let (index, offset) = self.blocks.iter().enumerate().find_map(|(index, block)| {
            let offset = block.offset.checked_next_multiple_of(align)?;
            (offset.checked_add(size)? <= block.end()).then_some((index, offset))
        })?;

        let block = self.blocks[index];
        let head = FreeBlock {
            offset: block.offset,
            size: offset - block.offset,
        };
        let tail = FreeBlock {
            offset: offset + size,
            size: block.end() - (offset + size),
        };

        match (head.size > 0, tail.size > 0) {
            (true, true) => {
                self.blocks[index] = head;
                self.blocks.insert(index + 1, tail);
            }
            (true, false) => self.blocks[index] = head,
            (false, true) => self.blocks[index] = tail,
            (false, false) => {
                self.blocks.remove(index);
            }
        }

        Some(offset)
    }

    /// Returns `offset..offset + size` to the free list, merging it with its neighbours.
    pub fn free(&mut self, offset: u32, size: u32) {
        debug_assert!(size > 0, "zero-sized free");
        debug_assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.capacity),
            "freed range {offset:#x}+{size:#x} outside of allocator capacity {:#x}",
            self.capacity
        );

        let freed = FreeBlock { offset, size };
        let index = self.blocks.partition_point(|block| block.offset < offset);

        debug_assert!(
            index == 0 || self.blocks[index - 1].end() <= freed.offset,
            "freed range {:?} overlaps free block {:?}",
            freed.range(),
            self.blocks[index - 1].range()
        );
        debug_assert!(
            index == self.blocks.len() || freed.end() <= self.blocks[index].offset,
            "freed range {:?} overlaps free block {:?}",
            freed.range(),
            self.blocks[index].range()
        );

        let merges_prev = index > 0 && self.blocks[index - 1].end() == freed.offset;
        let merges_next = index < self.blocks.len() && self.blocks[index].offset == freed.end();

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.blocks.remove(index);
                self.blocks[index - 1].size += freed.size + next.size;
            }
            (true, false) => self.blocks[index - 1].size += freed.size,
            (false, true) => {
                let next = &mut self.blocks[index];
                next.offset = freed.offset;
                next.size += freed.size;
            }
            (false, false) => self.blocks.insert(index, freed),
        }
    }

    /// Total number of free bytes.
    pub fn free_size(&self) -> u64 {
        self.blocks.iter().map(|block| u64::from(block.size)).sum()
    }

    /// The free list, sorted by offset.
    pub fn blocks(&self) -> &[FreeBlock] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_takes_the_low_end() {
        let mut alloc = RangeAllocator::new(0x100);

        assert_eq!(alloc.allocate(0x10), Some(0x0));
        assert_eq!(alloc.allocate(0x20), Some(0x10));
        assert_eq!(
            alloc.blocks(),
            &[FreeBlock {
                offset: 0x30,
                size: 0xd0
            }]
        );
    }

    #[test]
    fn exact_fit_removes_the_block() {
        let mut alloc = RangeAllocator::new(0x40);

        assert_eq!(alloc.allocate(0x40), Some(0));
        assert!(alloc.blocks().is_empty());
        assert_eq!(alloc.allocate(4), None);
    }

    #[test]
    fn reuses_the_first_hole_that_fits() {
        let mut alloc = RangeAllocator::new(0x100);

        let a = alloc.allocate(0x10).unwrap();
        let b = alloc.allocate(0x40).unwrap();
        let _c = alloc.allocate(0x10).unwrap();

        alloc.free(a, 0x10);
        alloc.free(b, 0x40);

        // a and b merged into one hole at the start
        assert_eq!(alloc.blocks()[0], FreeBlock { offset: 0, size: 0x50 });
        assert_eq!(alloc.allocate(0x30), Some(0));
        assert_eq!(alloc.allocate(0x20), Some(0x30));
        assert_eq!(alloc.allocate(0x20), Some(0x60));
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut alloc = RangeAllocator::new(0x30);

        let a = alloc.allocate(0x10).unwrap();
        let b = alloc.allocate(0x10).unwrap();
        let c = alloc.allocate(0x10).unwrap();

        alloc.free(a, 0x10);
        alloc.free(c, 0x10);
        assert_eq!(alloc.blocks().len(), 2);

        alloc.free(b, 0x10);
        assert_eq!(alloc.blocks(), &[FreeBlock { offset: 0, size: 0x30 }]);
        assert_eq!(alloc.free_size(), 0x30);
    }

    #[test]
    fn out_of_space() {
        let mut alloc = RangeAllocator::new(0x20);

        assert_eq!(alloc.allocate(0x21), None);
        alloc.allocate(0x18).unwrap();
        assert_eq!(alloc.allocate(0x10), None);
        assert_eq!(alloc.allocate(0x8), Some(0x18));
    }

    #[test]
    fn aligned_allocation_leaves_the_head_free() {
        let mut alloc = RangeAllocator::new(0x300);

        assert_eq!(alloc.allocate(0x10), Some(0));
        assert_eq!(alloc.allocate_aligned(0x100, 0x100), Some(0x100));
        assert_eq!(
            alloc.blocks(),
            &[
                FreeBlock {
                    offset: 0x10,
                    size: 0xf0
                },
                FreeBlock {
                    offset: 0x200,
                    size: 0x100
                },
            ]
        );

        // small allocations fill the head, never the aligned range
        assert_eq!(alloc.allocate(0x20), Some(0x10));
        // the tail is exactly one aligned block
        assert_eq!(alloc.allocate_aligned(0x100, 0x100), Some(0x200));
        assert_eq!(alloc.allocate_aligned(0x10, 0x100), None);

        alloc.free(0x100, 0x100);
        assert_eq!(alloc.allocate_aligned(0x80, 0x100), Some(0x100));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "overlaps")]
    fn double_free_is_caught() {
        let mut alloc = RangeAllocator::new(0x20);
        let a = alloc.allocate(0x10).unwrap();

        alloc.free(a, 0x10);
        alloc.free(a, 0x10);
    }
}
