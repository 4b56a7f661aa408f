// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;

use crate::sys::{self, Protection};
use crate::{Error, Result};

/// A block of address space reserved at full size up front and backed with memory from the
/// bottom up, so pointers into it stay valid for the lifetime of the region.
pub struct ReservedRegion {
    base: NonNull<u8>,
    capacity: usize,
    committed: usize,
    granularity: usize,
    page_size: usize,
}

// Safety: the region is plain memory, access to its contents is synchronized by the owner
unsafe impl Send for ReservedRegion {}
// Safety: see above
unsafe impl Sync for ReservedRegion {}

impl ReservedRegion {
    /// Reserves `capacity` bytes (rounded up to whole pages), committing in steps of
    /// `granularity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reserve`] if the OS refuses the reservation.
    pub fn new(capacity: usize, granularity: usize) -> Result<Self> {
        let page_size = sys::page_size();
        let capacity = sys::align_up(capacity, page_size);
        let granularity = sys::align_up(granularity.max(page_size), page_size);

        let base = sys::reserve(capacity).map_err(Error::Reserve)?;
        tracing::debug!(?base, capacity, "reserved code region");

        Ok(Self {
            base,
            capacity,
            committed: 0,
            granularity,
            page_size,
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Commits more of the reservation if `end` (an offset) is not yet backed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if `end` lies past the reservation and [`Error::Commit`]
    /// if the OS cannot back the memory.
    pub fn expand_if_needed(&mut self, end: usize) -> Result<()> {
        if end <= self.committed {
            return Ok(());
        }
        if end > self.capacity {
            return Err(Error::OutOfMemory {
                requested: end - self.committed,
            });
        }

        let new_committed = sys::align_up(end, self.granularity).min(self.capacity);
        // Safety: committed is always within the reservation
        let start = unsafe { self.base.add(self.committed) };

        // Safety: start..new_committed is page aligned and within the reservation
        unsafe { sys::commit(start, new_committed - self.committed) }.map_err(Error::Commit)?;

        tracing::debug!(
            from = self.committed,
            to = new_committed,
            "committed more of the code region"
        );
        self.committed = new_committed;
        Ok(())
    }

    /// Changes the protection of the pages covering `offset..offset + len`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protect`] if the OS rejects the protection change.
    ///
    /// # Safety
    ///
    /// The range must be committed, and when revoking write access no other thread may be writing
    /// to the covered pages. When revoking execute access no thread may be executing them.
    pub unsafe fn protect(&self, offset: usize, len: usize, protection: Protection) -> Result<()> {
        let start = sys::align_down(offset, self.page_size);
        let end = sys::align_up(offset + len, self.page_size);
        debug_assert!(end <= self.committed);

        // Safety: ensured by caller
        unsafe { sys::protect(self.base.add(start), end - start, protection) }
            .map_err(Error::Protect)
    }
}

impl Drop for ReservedRegion {
    fn drop(&mut self) {
        // Safety: the reservation is owned by this region and outlives all pointers into it
        unsafe { sys::release(self.base, self.capacity) };
    }
}

impl fmt::Debug for ReservedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservedRegion")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("committed", &self.committed)
            .field("granularity", &self.granularity)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_in_granularity_steps() {
        let page_size = sys::page_size();
        let mut region = ReservedRegion::new(page_size * 16, page_size * 4).unwrap();
        assert_eq!(region.committed(), 0);

        region.expand_if_needed(1).unwrap();
        assert_eq!(region.committed(), page_size * 4);

        // already backed
        region.expand_if_needed(page_size * 4).unwrap();
        assert_eq!(region.committed(), page_size * 4);

        region.expand_if_needed(page_size * 4 + 1).unwrap();
        assert_eq!(region.committed(), page_size * 8);

        // committed memory is usable
        // Safety: the first page was committed read/write above
        unsafe {
            region.base().write(0xAA);
            assert_eq!(region.base().read(), 0xAA);
        }
    }

    #[test]
    fn commit_is_clamped_to_capacity() {
        let page_size = sys::page_size();
        let mut region = ReservedRegion::new(page_size * 3, page_size * 4).unwrap();

        region.expand_if_needed(page_size).unwrap();
        assert_eq!(region.committed(), page_size * 3);

        assert!(matches!(
            region.expand_if_needed(page_size * 3 + 1),
            Err(Error::OutOfMemory { .. })
        ));
    }
}
