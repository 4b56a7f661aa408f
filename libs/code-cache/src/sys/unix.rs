// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::Error;
use std::ptr::{self, NonNull};

use super::Protection;

/// The size of a virtual memory page.
///
/// # Panics
///
/// Panics if the OS reports a page size that is not a power of two.
pub fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).unwrap_or(4096);
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Reserves `len` bytes of inaccessible address space.
pub fn reserve(len: usize) -> std::io::Result<NonNull<u8>> {
    // Safety: anonymous mapping at a kernel-chosen address, no existing memory is touched
    let mmap = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if mmap == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }

    NonNull::new(mmap.cast::<u8>()).ok_or_else(Error::last_os_error)
}

/// Backs `ptr..ptr + len` with memory and makes it read/write.
///
/// # Safety
///
/// The range must lie within a reservation returned by [`reserve`] and be page aligned.
pub unsafe fn commit(ptr: NonNull<u8>, len: usize) -> std::io::Result<()> {
    // Safety: ensured by caller
    unsafe { protect(ptr, len, Protection::ReadWrite) }
}

/// Changes the protection of `ptr..ptr + len`.
///
/// # Safety
///
/// The range must be committed and page aligned, and no live reference may rely on the access
/// rights being taken away.
pub unsafe fn protect(ptr: NonNull<u8>, len: usize, protection: Protection) -> std::io::Result<()> {
    let prot = match protection {
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    };

    // Safety: ensured by caller
    if unsafe { libc::mprotect(ptr.as_ptr().cast(), len, prot) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Gives a reservation back to the OS.
///
/// # Safety
///
/// `ptr` and `len` must describe a whole reservation returned by [`reserve`], and nothing may
/// reference it afterwards.
pub unsafe fn release(ptr: NonNull<u8>, len: usize) {
    // Safety: ensured by caller
    let ret = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    debug_assert_eq!(ret, 0);
}

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        /// Instruction and data caches are coherent on x86.
        pub fn flush_icache(_ptr: *const u8, _len: usize) {}
    } else if #[cfg(target_vendor = "apple")] {
        unsafe extern "C" {
            fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
        }

        /// Makes freshly written code at `ptr..ptr + len` visible to instruction fetch.
        pub fn flush_icache(ptr: *const u8, len: usize) {
            // Safety: only cache maintenance, the range is not dereferenced
            unsafe { sys_icache_invalidate(ptr.cast_mut().cast(), len) }
        }
    } else {
        unsafe extern "C" {
            fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
        }

        /// Makes freshly written code at `ptr..ptr + len` visible to instruction fetch.
        pub fn flush_icache(ptr: *const u8, len: usize) {
            let begin = ptr.cast_mut();
            // Safety: only cache maintenance, the range is not dereferenced
            unsafe { __clear_cache(begin.cast(), begin.wrapping_add(len).cast()) }
        }
    }
}
