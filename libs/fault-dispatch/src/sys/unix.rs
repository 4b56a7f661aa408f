// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ffi::c_void;
use core::fmt;
use core::ptr::{self, NonNull};
use core::{iter, mem};
use std::io;

use crate::table::{PreviousHandler, SignalHandlerConfig};
use crate::{Error, Result};

/// Signals an access to a tracked range can be delivered with.
fn fault_signals() -> impl Iterator<Item = libc::c_int> {
    // Darwin reports accesses to mapped but protected pages as SIGBUS
    let sigbus = cfg!(target_vendor = "apple").then_some(libc::SIGBUS);
    iter::once(libc::SIGSEGV).chain(sigbus)
}

fn previous_handler(table: &SignalHandlerConfig, signum: libc::c_int) -> &PreviousHandler {
    if signum == libc::SIGBUS {
        &table.sigbus
    } else {
        &table.sigsegv
    }
}

/// The dispositions replaced by the fault handler, restored on [`unregister`].
pub struct Registration {
    previous: Vec<(libc::c_int, libc::sigaction)>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field(
                "signals",
                &self
                    .previous
                    .iter()
                    .map(|(signum, _)| *signum)
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Installs `handler` for every fault signal, recording the previous dispositions in `table`.
///
/// # Safety
///
/// `handler` must point to code with the signature
/// `extern "C" fn(c_int, *mut siginfo_t, *mut c_void)` that stays executable until
/// [`unregister`] returned.
pub unsafe fn register(
    handler: NonNull<u8>,
    table: &'static SignalHandlerConfig,
) -> Result<Registration> {
    let mut registration = Registration {
        previous: Vec::new(),
    };

    for signum in fault_signals() {
        // Safety: sigaction is plain old data
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        // SA_ONSTACK lets the handler run on the alternate stack when the fault was a stack
        // overflow
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        action.sa_sigaction = handler.as_ptr() as usize;

        // Safety: both pointers are valid for the duration of the calls
        let res = unsafe {
            libc::sigemptyset(&raw mut action.sa_mask);
            let mut previous: libc::sigaction = mem::zeroed();

            // The table must know where to chain before the handler can run.
            if libc::sigaction(signum, ptr::null(), &raw mut previous) == 0 {
                remember_previous(previous_handler(table, signum), &previous);
                if libc::sigaction(signum, &raw const action, &raw mut previous) == 0 {
                    Ok(previous)
                } else {
                    Err(io::Error::last_os_error())
                }
            } else {
                Err(io::Error::last_os_error())
            }
        };

        match res {
            Ok(previous) => registration.previous.push((signum, previous)),
            Err(err) => {
                // Safety: the handlers registered so far are the ones being rolled back
                let _ = unsafe { unregister(registration, table) };
                return Err(Error::Registration(err));
            }
        }
    }

    Ok(registration)
}

/// Restores the dispositions that were in place before [`register`].
///
/// # Safety
///
/// No thread may rely on the fault handler anymore.
pub unsafe fn unregister(
    registration: Registration,
    table: &'static SignalHandlerConfig,
) -> Result<()> {
    let mut res = Ok(());

    for (signum, previous) in registration.previous.iter().rev() {
        // Safety: previous is a disposition the OS handed out earlier
        if unsafe { libc::sigaction(*signum, previous, ptr::null_mut()) } != 0 {
            res = Err(Error::Registration(io::Error::last_os_error()));
        }
        previous_handler(table, *signum).clear();
    }

    res
}

type SigactionHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void);

fn remember_previous(slot: &PreviousHandler, previous: &libc::sigaction) {
    if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
        // the retried access then terminates the process the default way
        slot.set(restore_default as SigactionHandler as usize, true);
    } else {
        slot.set(
            previous.sa_sigaction,
            previous.sa_flags & libc::SA_SIGINFO != 0,
        );
    }
}

extern "C" fn restore_default(signum: libc::c_int, _info: *mut libc::siginfo_t, _: *mut c_void) {
    // Safety: sigaction is async-signal-safe and the disposition is plain old data
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&raw mut action.sa_mask);
        libc::sigaction(signum, &raw const action, ptr::null_mut());
    }
}
