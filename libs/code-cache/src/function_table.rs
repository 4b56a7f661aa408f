// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Makes functions in the cache visible to the Windows x64 unwinder.
//!
//! A single function-table callback covers the whole reservation. When the unwinder asks for a
//! program counter inside the cache, the callback lowers the function's [`UnwindInfo`] into a
//! `RUNTIME_FUNCTION`/`UNWIND_INFO` pair in a scratch page at the start of the cache (the
//! structures must live inside the range the table was registered for) and returns it.
//!
//! Each thread writes into a scratch slot it owns, so concurrent unwinds never overwrite each
//! other's entries. Slots of exited threads are taken over once all slots are owned.
//!
//! [`UnwindInfo`]: crate::UnwindInfo

use core::ffi::c_void;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};
use std::io;

use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
use windows_sys::Win32::System::Diagnostics::Debug::{
    IMAGE_RUNTIME_FUNCTION_ENTRY, IMAGE_RUNTIME_FUNCTION_ENTRY_0, RtlDeleteFunctionTable,
    RtlInstallFunctionTableCallback,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentThreadId, GetExitCodeThread, OpenThread, THREAD_QUERY_LIMITED_INFORMATION,
};

use crate::cache::Inner;
use crate::sys;
use crate::unwind::MAX_WINDOWS_UNWIND_INFO_SIZE;
use crate::{Error, Result};

/// `RUNTIME_FUNCTION` followed by an `UNWIND_INFO`, rounded up to keep every slot 16 byte aligned.
const SLOT_SIZE: usize = (size_of::<IMAGE_RUNTIME_FUNCTION_ENTRY>().next_multiple_of(16)
    + MAX_WINDOWS_UNWIND_INFO_SIZE)
    .next_multiple_of(16);
const UNWIND_INFO_OFFSET: usize = size_of::<IMAGE_RUNTIME_FUNCTION_ENTRY>().next_multiple_of(16);

/// Owners of the scratch slots. `0` marks a free slot.
struct ScratchSlots {
    owners: Box<[AtomicU32]>,
}

impl ScratchSlots {
    fn new(count: usize) -> Self {
        Self {
            owners: (0..count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Returns the slot owned by `thread_id`, claiming a free one or one of an exited thread if
    /// it has none yet. Returns `None` if every slot belongs to a live thread.
    fn claim(&self, thread_id: u32, is_alive: impl Fn(u32) -> bool) -> Option<usize> {
        debug_assert_ne!(thread_id, 0);

        if let Some(index) = self
            .owners
            .iter()
            .position(|owner| owner.load(Ordering::Acquire) == thread_id)
        {
            return Some(index);
        }

        let take_over = |index: usize, current: u32| {
            self.owners[index]
                .compare_exchange(current, thread_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        };

        for index in 0..self.owners.len() {
            if take_over(index, 0) {
                return Some(index);
            }
        }

        for index in 0..self.owners.len() {
            let owner = self.owners[index].load(Ordering::Acquire);
            if owner != 0 && !is_alive(owner) && take_over(index, owner) {
                return Some(index);
            }
        }

        None
    }
}

/// What the lookup callback gets to see.
struct LookupContext {
    inner: *const Inner,
    slots: ScratchSlots,
}

// Safety: `inner` is only read, and the cache keeps it alive and shares it between threads anyway
unsafe impl Send for LookupContext {}
// Safety: see above
unsafe impl Sync for LookupContext {}

pub(crate) struct FunctionTable {
    identifier: usize,
    // registered with the OS until drop
    _context: Box<LookupContext>,
}

impl FunctionTable {
    /// Reserves the scratch page and registers the lookup callback for the cache.
    ///
    /// `inner` is boxed by the cache and outlives the table.
    pub(crate) fn install(inner: &Inner) -> Result<Self> {
        let scratch_size = sys::page_size();
        inner.reserve_prefix(scratch_size)?;

        let base = inner.base().as_ptr() as usize;
        // the low bits mark the identifier as a callback table
        let identifier = base | 0x3;
        let len = u32::try_from(inner.capacity()).map_err(|_| Error::CodeTooLarge {
            len: inner.capacity(),
        })?;

        let context = Box::new(LookupContext {
            inner: ptr::from_ref(inner),
            slots: ScratchSlots::new(scratch_size / SLOT_SIZE),
        });

        // Safety: the context stays valid until the table is deleted on drop
        let ok = unsafe {
            RtlInstallFunctionTableCallback(
                identifier as u64,
                base as u64,
                len,
                Some(lookup),
                ptr::from_ref(&*context).cast(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(Error::UnwindRegistration(io::Error::last_os_error()));
        }

        tracing::debug!(base, len, "installed function table callback");
        Ok(Self {
            identifier,
            _context: context,
        })
    }
}

impl Drop for FunctionTable {
    fn drop(&mut self) {
        // Safety: the identifier was registered in install
        let ok = unsafe { RtlDeleteFunctionTable(ptr::without_provenance(self.identifier)) };
        debug_assert_ne!(ok, 0);
    }
}

unsafe extern "system" fn lookup(
    control_pc: u64,
    context: *const c_void,
) -> *mut IMAGE_RUNTIME_FUNCTION_ENTRY {
    // Safety: the context is the `LookupContext` the table was installed with, and the cache
    // drops the table before its `Inner`
    let (inner, slots) = unsafe {
        let context = &*context.cast::<LookupContext>();
        (&*context.inner, &context.slots)
    };
    let base = inner.base();

    let Some(offset) = usize::try_from(control_pc)
        .ok()
        .and_then(|pc| pc.checked_sub(base.as_ptr() as usize))
    else {
        return ptr::null_mut();
    };

    // the exception may have been raised while this thread was changing the directory
    let found = inner.try_with_containing(offset, |entry| {
        let (unwind_info, len) = entry.unwind_info.encode_windows_x64()?;
        Some((entry.offset, entry.end(), unwind_info, len))
    });
    let Some(Some((begin, end, unwind_info, len))) = found else {
        return ptr::null_mut();
    };

    // Safety: GetCurrentThreadId has no preconditions
    let thread_id = unsafe { GetCurrentThreadId() };
    let Some(slot) = slots.claim(thread_id, is_thread_alive) else {
        return ptr::null_mut();
    };
    let slot_offset = slot * SLOT_SIZE;
    let Ok(unwind_rva) = u32::try_from(slot_offset + UNWIND_INFO_OFFSET) else {
        return ptr::null_mut();
    };

    // Safety: the slot lies inside the committed read/write scratch page
    unsafe {
        let slot: NonNull<u8> = base.add(slot_offset);
        #[expect(clippy::cast_ptr_alignment, reason = "slots are 16 byte aligned")]
        let function = slot.cast::<IMAGE_RUNTIME_FUNCTION_ENTRY>();
        function.write(IMAGE_RUNTIME_FUNCTION_ENTRY {
            BeginAddress: begin,
            EndAddress: end,
            Anonymous: IMAGE_RUNTIME_FUNCTION_ENTRY_0 {
                UnwindInfoAddress: unwind_rva,
            },
        });
        slot.add(UNWIND_INFO_OFFSET)
            .copy_from_nonoverlapping(NonNull::from(&unwind_info[..len]).cast(), len);

        function.as_ptr()
    }
}

#[expect(clippy::cast_sign_loss, reason = "STILL_ACTIVE is a small positive constant")]
fn is_thread_alive(thread_id: u32) -> bool {
    // Safety: OpenThread returns null for unknown ids, the handle is closed below
    unsafe {
        let handle = OpenThread(THREAD_QUERY_LIMITED_INFORMATION, 0, thread_id);
        if handle.is_null() {
            return false;
        }

        let mut exit_code = 0_u32;
        let ok = GetExitCodeThread(handle, &raw mut exit_code);
        CloseHandle(handle);

        ok != 0 && exit_code == STILL_ACTIVE as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_keep_their_slot() {
        let slots = ScratchSlots::new(3);

        assert_eq!(slots.claim(7, |_| true), Some(0));
        assert_eq!(slots.claim(9, |_| true), Some(1));
        assert_eq!(slots.claim(7, |_| true), Some(0));
        assert_eq!(slots.claim(11, |_| true), Some(2));
        assert_eq!(slots.claim(9, |_| true), Some(1));
    }

    #[test]
    fn live_owners_are_never_displaced() {
        let slots = ScratchSlots::new(2);

        assert_eq!(slots.claim(7, |_| true), Some(0));
        assert_eq!(slots.claim(9, |_| true), Some(1));
        assert_eq!(slots.claim(11, |_| true), None);

        // the owner of slot 1 exited
        assert_eq!(slots.claim(11, |id| id != 9), Some(1));
        assert_eq!(slots.claim(7, |_| true), Some(0));
        assert_eq!(slots.claim(11, |_| true), Some(1));
    }

    #[test]
    fn concurrent_claims_get_distinct_slots() {
        let slots = ScratchSlots::new(8);

        let claimed: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (1..=8_u32)
                .map(|id| {
                    let slots = &slots;
                    s.spawn(move || slots.claim(id, |_| true).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut sorted = claimed.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), claimed.len());
    }
}
