// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};

use crate::allocator::RangeAllocator;
use crate::region::ReservedRegion;
use crate::sys::{self, Protection};
use crate::unwind::UnwindInfo;
use crate::{Error, Result};

/// Alignment of every function placed into the cache.
pub const CODE_ALIGNMENT: usize = 4;

const DEFAULT_CAPACITY: usize = 2047 * 1024 * 1024;
const DEFAULT_COMMIT_GRANULARITY: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheConfig {
    capacity: usize,
    commit_granularity: usize,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            commit_granularity: DEFAULT_COMMIT_GRANULARITY,
        }
    }
}

impl CodeCacheConfig {
    /// Size of the address space reservation. Must fit into a `u32` offset.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// How much more memory is committed whenever a mapping runs past the committed part.
    #[must_use]
    pub fn with_commit_granularity(mut self, commit_granularity: usize) -> Self {
        self.commit_granularity = commit_granularity;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn commit_granularity(&self) -> usize {
        self.commit_granularity
    }
}

/// A function placed into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Offset of the first byte from the cache base.
    pub offset: u32,
    /// Size in bytes, rounded up to [`CODE_ALIGNMENT`].
    pub size: u32,
    pub unwind_info: UnwindInfo,
}

impl CacheEntry {
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub fn contains(&self, offset: usize) -> bool {
        (self.offset as usize..self.end() as usize).contains(&offset)
    }
}

/// Lock order: `allocator`, then `region` or `entries`.
pub(crate) struct Inner {
    region: Mutex<ReservedRegion>,
    allocator: Mutex<RangeAllocator>,
    // only write-locked around inserts and removals, so the unwinder can read it from an
    // exception raised anywhere else in the cache
    entries: RwLock<BTreeMap<u32, CacheEntry>>,
    base: NonNull<u8>,
    capacity: usize,
}

// Safety: `base` is only an address, all mutation goes through the locks
unsafe impl Send for Inner {}
// Safety: see above
unsafe impl Sync for Inner {}

impl Inner {
    #[cfg(all(windows, target_arch = "x86_64"))]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[cfg(all(windows, target_arch = "x86_64"))]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes `len` bytes at the very start of the cache out of circulation and commits them.
    #[cfg(all(windows, target_arch = "x86_64"))]
    pub(crate) fn reserve_prefix(&self, len: usize) -> Result<()> {
        let size = u32::try_from(len).map_err(|_| Error::CodeTooLarge { len })?;
        let mut allocator = self.allocator.lock();

        let offset = allocator
            .allocate(size)
            .ok_or(Error::OutOfMemory { requested: len })?;
        debug_assert_eq!(offset, 0, "prefix must be reserved before mapping anything");

        self.region.lock().expand_if_needed(len)
    }

    /// Runs `f` on the entry whose range contains `offset`.
    pub(crate) fn with_containing<R>(
        &self,
        offset: usize,
        f: impl FnOnce(&CacheEntry) -> R,
    ) -> Option<R> {
        let entries = self.entries.read();
        find_containing(&entries, offset).map(f)
    }

    /// Like [`with_containing`](Self::with_containing), but gives up instead of waiting if the
    /// directory is being changed. Used from exception context, where the thread raising the
    /// exception may be the one changing it.
    #[cfg(any(test, all(windows, target_arch = "x86_64")))]
    pub(crate) fn try_with_containing<R>(
        &self,
        offset: usize,
        f: impl FnOnce(&CacheEntry) -> R,
    ) -> Option<R> {
        let entries = self.entries.try_read_recursive()?;
        find_containing(&entries, offset).map(f)
    }
}

fn find_containing(entries: &BTreeMap<u32, CacheEntry>, offset: usize) -> Option<&CacheEntry> {
    let key = u32::try_from(offset).ok()?;
    let (_, entry) = entries.range(..=key).next_back()?;
    entry.contains(offset).then_some(entry)
}

/// Keeps the pages covering a range writable while code is copied into them.
///
/// The pages are made executable again when the window is dropped, also when the copy is
/// abandoned halfway.
struct WriteWindow<'a> {
    region: &'a ReservedRegion,
    offset: usize,
    len: usize,
    closed: bool,
}

impl<'a> WriteWindow<'a> {
    /// # Safety
    ///
    /// No thread may be executing code on the pages covering `offset..offset + len`.
    unsafe fn open(region: &'a ReservedRegion, offset: usize, len: usize) -> Result<Self> {
        let window = Self {
            region,
            offset,
            len,
            closed: false,
        };
        // Safety: ensured by caller. A partially applied change is undone when `window` drops.
        unsafe { region.protect(offset, len, Protection::ReadWrite) }?;
        Ok(window)
    }

    fn close(mut self) -> Result<()> {
        // Safety: the pages only ever held code that was complete before the window opened
        unsafe {
            self.region
                .protect(self.offset, self.len, Protection::ReadExecute)
        }?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for WriteWindow<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        // Safety: see `close`
        let res = unsafe {
            self.region
                .protect(self.offset, self.len, Protection::ReadExecute)
        };
        if let Err(err) = res {
            tracing::warn!(
                offset = self.offset,
                len = self.len,
                %err,
                "failed to make pages executable again"
            );
        }
    }
}

/// Executable memory for translated functions.
///
/// The whole address range is reserved when the cache is created and committed on demand, so a
/// pointer returned from [`map`](Self::map) stays valid until it is [unmapped](Self::unmap) or the
/// cache is dropped. Pages are only ever writable while a function is being copied in.
pub struct CodeCache {
    #[cfg(all(windows, target_arch = "x86_64"))]
    _function_table: crate::function_table::FunctionTable,
    inner: Box<Inner>,
}

impl CodeCache {
    /// The process-wide cache, created with the default configuration on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the address space for the cache cannot be reserved.
    pub fn global() -> Result<&'static CodeCache> {
        static GLOBAL: OnceLock<CodeCache> = OnceLock::new();

        if let Some(cache) = GLOBAL.get() {
            return Ok(cache);
        }

        let cache = CodeCache::new(CodeCacheConfig::default())?;
        // when racing another initializer the loser's reservation is released right here
        Ok(GLOBAL.get_or_init(|| cache))
    }

    /// Reserves the address space for a new cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CodeTooLarge`] if the configured capacity exceeds the 32-bit offset
    /// range, and an OS error if reserving the address space fails.
    pub fn new(config: CodeCacheConfig) -> Result<Self> {
        if u32::try_from(config.capacity).is_err() {
            return Err(Error::CodeTooLarge {
                len: config.capacity,
            });
        }

        let region = ReservedRegion::new(config.capacity, config.commit_granularity)?;
        // page rounding may push the reservation just past the last u32 offset
        let allocator_capacity = u32::try_from(region.capacity()).unwrap_or(u32::MAX);
        let capacity = allocator_capacity as usize;
        let allocator = RangeAllocator::new(allocator_capacity);

        let inner = Box::new(Inner {
            base: region.base(),
            capacity,
            region: Mutex::new(region),
            allocator: Mutex::new(allocator),
            entries: RwLock::new(BTreeMap::new()),
        });

        tracing::debug!(base = ?inner.base, capacity, "created code cache");

        cfg_if::cfg_if! {
            if #[cfg(all(windows, target_arch = "x86_64"))] {
                let function_table = crate::function_table::FunctionTable::install(&inner)?;
                Ok(Self {
                    _function_table: function_table,
                    inner,
                })
            } else {
                Ok(Self { inner })
            }
        }
    }

    /// Address of the first byte of the cache.
    pub fn base(&self) -> NonNull<u8> {
        self.inner.base
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn page_size(&self) -> usize {
        self.inner.region.lock().page_size()
    }

    /// Returns whether `ptr` points into the cache's address range.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Copies `code` into executable memory and records it with its unwind metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if no free range can hold the code, and an OS error if
    /// committing memory or changing protections fails. Callers are expected to treat both as
    /// fatal.
    pub fn map(&self, code: &[u8], unwind_info: UnwindInfo) -> Result<NonNull<u8>> {
        self.map_aligned(code, unwind_info, CODE_ALIGNMENT)
    }

    /// Like [`map`](Self::map), but gives the function pages of its own.
    ///
    /// Mapping other functions briefly makes the pages they are copied into non-executable.
    /// Code that must stay runnable at all times, such as a fault handler, is mapped with this.
    ///
    /// # Errors
    ///
    /// See [`map`](Self::map).
    pub fn map_isolated(&self, code: &[u8], unwind_info: UnwindInfo) -> Result<NonNull<u8>> {
        let page_size = self.inner.region.lock().page_size();
        self.map_aligned(code, unwind_info, page_size)
    }

    fn map_aligned(
        &self,
        code: &[u8],
        unwind_info: UnwindInfo,
        align: usize,
    ) -> Result<NonNull<u8>> {
        let too_large = || Error::CodeTooLarge { len: code.len() };
        let aligned = sys::align_up(code.len().max(1), align);
        let size = u32::try_from(aligned).map_err(|_| too_large())?;

        let mut allocator = self.inner.allocator.lock();

        let offset = if align == CODE_ALIGNMENT {
            allocator.allocate(size)
        } else {
            let align = u32::try_from(align).map_err(|_| too_large())?;
            allocator.allocate_aligned(size, align)
        }
        .ok_or(Error::OutOfMemory { requested: aligned })?;

        if let Err(err) = self.write_code(offset as usize, code) {
            allocator.free(offset, size);
            return Err(err);
        }

        let prev = self.inner.entries.write().insert(
            offset,
            CacheEntry {
                offset,
                size,
                unwind_info,
            },
        );
        debug_assert!(prev.is_none(), "allocator handed out {offset:#x} twice");
        drop(allocator);

        // Safety: offset is within the reservation
        let ptr = unsafe { self.inner.base.add(offset as usize) };
        tracing::trace!(?ptr, offset, size, "mapped function");
        Ok(ptr)
    }

    /// Like [`map`](Self::map), but treats failure as fatal.
    ///
    /// # Panics
    ///
    /// Panics if the function cannot be mapped.
    pub fn map_or_abort(&self, code: &[u8], unwind_info: UnwindInfo) -> NonNull<u8> {
        match self.map(code, unwind_info) {
            Ok(ptr) => ptr,
            Err(err) => panic!("failed to map function into the code cache: {err}"),
        }
    }

    fn write_code(&self, offset: usize, code: &[u8]) -> Result<()> {
        let mut region = self.inner.region.lock();
        region.expand_if_needed(offset + sys::align_up(code.len().max(1), CODE_ALIGNMENT))?;

        // Safety: the range was allocated to us and is committed. Functions sharing the first or
        // last page are not executable until the copy is done.
        unsafe {
            let window = WriteWindow::open(&region, offset, code.len())?;
            self.inner
                .base
                .add(offset)
                .copy_from_nonoverlapping(NonNull::from(code).cast(), code.len());
            window.close()?;
        }

        // Safety: offset is within the reservation
        sys::flush_icache(unsafe { self.inner.base.add(offset) }.as_ptr(), code.len());
        Ok(())
    }

    /// Releases the function starting at `ptr`.
    ///
    /// Pointers that are not the start of a mapped function are ignored.
    pub fn unmap(&self, ptr: NonNull<u8>) {
        let Some(offset) = self.offset_of(ptr.as_ptr()) else {
            tracing::warn!(?ptr, "ignoring unmap of pointer outside of the code cache");
            return;
        };

        let mut allocator = self.inner.allocator.lock();

        let entry = u32::try_from(offset)
            .ok()
            .and_then(|key| self.inner.entries.write().remove(&key));

        match entry {
            Some(entry) => {
                allocator.free(entry.offset, entry.size);
                tracing::trace!(?ptr, offset, size = entry.size, "unmapped function");
            }
            None => tracing::warn!(?ptr, offset, "ignoring unmap of unknown function"),
        }
    }

    /// Returns the function with the largest start offset not above `offset`.
    pub fn try_find(&self, offset: usize) -> Option<CacheEntry> {
        let key = u32::try_from(offset).ok()?;
        self.inner
            .entries
            .read()
            .range(..=key)
            .next_back()
            .map(|(_, entry)| entry.clone())
    }

    /// Returns the function containing `ptr`.
    pub fn try_find_by_address(&self, ptr: *const u8) -> Option<CacheEntry> {
        let offset = self.offset_of(ptr)?;
        self.inner.with_containing(offset, CacheEntry::clone)
    }

    /// Copies `len` bytes at `ptr` out of the cache.
    ///
    /// Returns `None` unless the whole range lies inside one mapped function.
    pub fn read_back(&self, ptr: NonNull<u8>, len: usize) -> Option<Vec<u8>> {
        let offset = self.offset_of(ptr.as_ptr())?;
        let end = offset.checked_add(len)?;

        self.inner.with_containing(offset, |entry| {
            (end <= entry.end() as usize).then(|| {
                let mut out = vec![0; len];
                // Safety: the range lies inside a mapped, readable function
                unsafe {
                    ptr.copy_to_nonoverlapping(NonNull::from(out.as_mut_slice()).cast(), len);
                }
                out
            })
        })?
    }

    /// Number of mapped functions.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes not handed out to any function.
    pub fn free_size(&self) -> u64 {
        self.inner.allocator.lock().free_size()
    }

    fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.inner.base.as_ptr() as usize)?;
        (offset < self.inner.capacity).then_some(offset)
    }
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let functions = self.len();
        let free = self.free_size();
        f.debug_struct("CodeCache")
            .field("base", &self.inner.base)
            .field("capacity", &self.inner.capacity)
            .field("region", &*self.inner.region.lock())
            .field("functions", &functions)
            .field("free", &free)
            .finish_non_exhaustive()
    }
}
