// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Real access faults routed through the installed handler. The handler and the tracked range
//! table are process-wide, so everything happens in a single test.

#![cfg(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_vendor = "apple", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(windows, target_arch = "x86_64"),
))]

use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use fault_dispatch::{FaultDispatcher, MAX_TRACKED_RANGES, SignalHandlerConfig};

static BASE: AtomicUsize = AtomicUsize::new(0);
static CALLS: AtomicUsize = AtomicUsize::new(0);
static OFFSET: AtomicU64 = AtomicU64::new(u64::MAX);
static SIZE: AtomicU64 = AtomicU64::new(0);
static WRITE: AtomicU8 = AtomicU8::new(0xff);

/// Records the fault and makes the page accessible, so the access succeeds when retried.
unsafe extern "C" fn unprotect_on_fault(offset: u64, size: u64, write: u8, _precise: u8) -> u8 {
    OFFSET.store(offset, Ordering::SeqCst);
    SIZE.store(size, Ordering::SeqCst);
    WRITE.store(write, Ordering::SeqCst);
    CALLS.fetch_add(1, Ordering::SeqCst);

    let (Ok(offset), Ok(size)) = (usize::try_from(offset), usize::try_from(size)) else {
        return 0;
    };
    let page = BASE.load(Ordering::SeqCst) + offset;
    // Safety: the page belongs to the mapping created by the test
    u8::from(unsafe { make_accessible(page, size) })
}

#[cfg(unix)]
fn map_inaccessible(len: usize) -> usize {
    // Safety: anonymous mapping at a kernel-chosen address
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(ptr, libc::MAP_FAILED);
    ptr as usize
}

#[cfg(unix)]
unsafe fn make_accessible(page: usize, len: usize) -> bool {
    // Safety: ensured by caller
    unsafe {
        libc::mprotect(
            ptr::without_provenance_mut(page),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        ) == 0
    }
}

#[cfg(unix)]
fn unmap(base: usize, len: usize) {
    // Safety: the mapping was created by map_inaccessible
    unsafe { libc::munmap(ptr::without_provenance_mut(base), len) };
}

#[cfg(windows)]
fn map_inaccessible(len: usize) -> usize {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_NOACCESS, VirtualAlloc,
    };

    // Safety: fresh allocation at a system-chosen address
    let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE | MEM_COMMIT, PAGE_NOACCESS) };
    assert!(!ptr.is_null());
    ptr as usize
}

#[cfg(windows)]
unsafe fn make_accessible(page: usize, len: usize) -> bool {
    use windows_sys::Win32::System::Memory::{PAGE_READWRITE, VirtualProtect};

    let mut old = 0;
    // Safety: ensured by caller
    unsafe { VirtualProtect(ptr::without_provenance(page), len, PAGE_READWRITE, &mut old) != 0 }
}

#[cfg(windows)]
fn unmap(base: usize, _len: usize) {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    // Safety: the allocation was created by map_inaccessible
    unsafe { VirtualFree(ptr::without_provenance_mut(base), 0, MEM_RELEASE) };
}

#[test_log::test]
fn faults_in_tracked_ranges_reach_the_callback() {
    let dispatcher = FaultDispatcher::global();
    fault_dispatch::install().unwrap();
    // a second install is a no-op
    fault_dispatch::install().unwrap();
    assert!(dispatcher.is_installed());
    let trampoline = dispatcher.trampoline().unwrap();

    let page_size = code_cache::page_size();
    // code mapped after the handler lands on different pages
    let cache = code_cache::CodeCache::global().unwrap();
    let guest = cache
        .map(&[0xc3; 16], code_cache::UnwindInfo::default())
        .unwrap();
    assert_eq!(trampoline.as_ptr() as usize % page_size, 0);
    assert_ne!(
        guest.as_ptr() as usize / page_size,
        trampoline.as_ptr() as usize / page_size
    );
    cache.unmap(guest);

    let len = page_size * 2;
    let base = map_inaccessible(len);
    BASE.store(base, Ordering::SeqCst);
    assert!(fault_dispatch::add_tracked_range(
        base,
        base + len,
        unprotect_on_fault
    ));

    // Safety: the page is made accessible by the callback
    unsafe {
        ptr::without_provenance_mut::<u8>(base + 0x500).write_volatile(0x42);
    }
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(OFFSET.load(Ordering::SeqCst), 0);
    assert_eq!(SIZE.load(Ordering::SeqCst), page_size as u64);
    assert_eq!(WRITE.load(Ordering::SeqCst), 1);

    // Safety: the first page is accessible now
    let value = unsafe { ptr::without_provenance::<u8>(base + 0x500).read_volatile() };
    assert_eq!(value, 0x42);
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);

    // Safety: the page is made accessible by the callback
    let value = unsafe { ptr::without_provenance::<u8>(base + page_size + 0x10).read_volatile() };
    assert_eq!(value, 0);
    assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    assert_eq!(OFFSET.load(Ordering::SeqCst), page_size as u64);
    assert_eq!(WRITE.load(Ordering::SeqCst), 0);

    // table capacity is shared with the live handler
    let table = SignalHandlerConfig::global();
    let free = MAX_TRACKED_RANGES - table.active_ranges();
    for i in 0..free {
        let start = 0x1000 * (i + 1);
        assert!(fault_dispatch::add_tracked_range(
            start,
            start + 0x1000,
            unprotect_on_fault
        ));
    }
    assert!(!fault_dispatch::add_tracked_range(
        0x100_0000,
        0x100_1000,
        unprotect_on_fault
    ));
    for i in 0..free {
        assert!(fault_dispatch::remove_tracked_range(0x1000 * (i + 1)));
    }

    assert!(fault_dispatch::remove_tracked_range(base));
    assert!(!fault_dispatch::remove_tracked_range(base));
    unmap(base, len);

    fault_dispatch::uninstall().unwrap();
    assert!(!dispatcher.is_installed());
    assert!(code_cache::CodeCache::global()
        .unwrap()
        .try_find_by_address(trampoline.as_ptr())
        .is_none());
    // uninstalling twice is a no-op
    fault_dispatch::uninstall().unwrap();
}
