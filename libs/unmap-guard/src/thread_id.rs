// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! OS thread identity.
//!
//! Thread ids are squeezed into a non-zero `u32` because `0` marks a free slot in
//! [`ThreadLocalMap`](crate::ThreadLocalMap).

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Returns the kernel id of the calling thread. Async-signal-safe.
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "tids are positive pid_t values")]
        pub fn current_thread_id() -> u32 {
            // Safety: gettid has no preconditions and cannot fail
            let tid = unsafe { libc::syscall(libc::SYS_gettid) };
            tid as u32
        }

        /// Returns whether the thread with the given id is still part of this process.
        pub fn is_thread_alive(thread_id: u32) -> bool {
            std::path::Path::new(&format!("/proc/self/task/{thread_id}")).exists()
        }
    } else if #[cfg(target_vendor = "apple")] {
        /// Returns the low 32 bits of the calling thread's system-wide id. Async-signal-safe.
        #[expect(clippy::cast_possible_truncation, reason = "only the low bits are kept")]
        pub fn current_thread_id() -> u32 {
            let mut tid = 0_u64;
            // Safety: a null thread means the calling thread, `tid` is a valid out pointer
            unsafe {
                libc::pthread_threadid_np(0, &raw mut tid);
            }
            (tid as u32).max(1)
        }

        /// There is no cheap way to look up a Mach thread by its id, so slots are never trimmed.
        pub fn is_thread_alive(_thread_id: u32) -> bool {
            true
        }
    } else if #[cfg(windows)] {
        use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
        use windows_sys::Win32::System::Threading::{
            GetCurrentThreadId, GetExitCodeThread, OpenThread, THREAD_QUERY_LIMITED_INFORMATION,
        };

        /// Returns the id of the calling thread. Safe to call from a vectored exception handler.
        pub fn current_thread_id() -> u32 {
            // Safety: GetCurrentThreadId has no preconditions
            unsafe { GetCurrentThreadId() }
        }

        /// Returns whether the thread with the given id has not exited yet.
        #[expect(clippy::cast_sign_loss, reason = "STILL_ACTIVE is a small positive constant")]
        pub fn is_thread_alive(thread_id: u32) -> bool {
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
    } else {
        compile_error!("unsupported target: no way to identify OS threads");
    }
}
