// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::Error;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_NOACCESS, PAGE_READWRITE,
    VirtualAlloc, VirtualFree, VirtualProtect,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

use super::Protection;

/// The size of a virtual memory page.
///
/// # Panics
///
/// Panics if the OS reports a page size that is not a power of two.
pub fn page_size() -> usize {
    let mut info = MaybeUninit::<SYSTEM_INFO>::uninit();
    // Safety: GetSystemInfo fully initializes the struct
    let info = unsafe {
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init()
    };
    let pagesize = info.dwPageSize as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Reserves `len` bytes of inaccessible address space.
pub fn reserve(len: usize) -> std::io::Result<NonNull<u8>> {
    // Safety: reservation at a system-chosen address, no existing memory is touched
    let base = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
    NonNull::new(base.cast::<u8>()).ok_or_else(Error::last_os_error)
}

/// Backs `ptr..ptr + len` with memory and makes it read/write.
///
/// # Safety
///
/// The range must lie within a reservation returned by [`reserve`] and be page aligned.
pub unsafe fn commit(ptr: NonNull<u8>, len: usize) -> std::io::Result<()> {
    // Safety: ensured by caller
    let base = unsafe { VirtualAlloc(ptr.as_ptr().cast(), len, MEM_COMMIT, PAGE_READWRITE) };
    if base.is_null() {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Changes the protection of `ptr..ptr + len`.
///
/// # Safety
///
/// The range must be committed and page aligned, and no live reference may rely on the access
/// rights being taken away.
pub unsafe fn protect(ptr: NonNull<u8>, len: usize, protection: Protection) -> std::io::Result<()> {
    let prot = match protection {
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::ReadExecute => PAGE_EXECUTE_READ,
    };

    let mut old = 0;
    // Safety: ensured by caller
    if unsafe { VirtualProtect(ptr.as_ptr().cast(), len, prot, &raw mut old) } == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Gives a reservation back to the OS.
///
/// # Safety
///
/// `ptr` must be the base of a reservation returned by [`reserve`], and nothing may reference it
/// afterwards.
pub unsafe fn release(ptr: NonNull<u8>, _len: usize) {
    // Safety: ensured by caller
    let ret = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
    debug_assert_ne!(ret, 0);
}

/// Makes freshly written code at `ptr..ptr + len` visible to instruction fetch.
pub fn flush_icache(ptr: *const u8, len: usize) {
    // Safety: only cache maintenance, the range is not dereferenced
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), ptr.cast(), len);
    }
}
