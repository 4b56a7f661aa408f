// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ffi::c_void;
use core::mem;
use core::ptr::NonNull;
use std::io;

use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, EXCEPTION_POINTERS, RemoveVectoredExceptionHandler,
};

use crate::table::SignalHandlerConfig;
use crate::{Error, Result};

type VectoredHandler = unsafe extern "system" fn(*mut EXCEPTION_POINTERS) -> i32;

/// Handle of the installed vectored exception handler.
#[derive(Debug)]
pub struct Registration {
    handle: NonNull<c_void>,
}

// Safety: the handle is an opaque token that may be removed from any thread
unsafe impl Send for Registration {}

/// Installs `handler` as the first vectored exception handler.
///
/// Unhandled exceptions continue the search, so nothing is recorded in the table.
///
/// # Safety
///
/// `handler` must point to code with the signature
/// `extern "system" fn(*mut EXCEPTION_POINTERS) -> i32` that stays executable until
/// [`unregister`] returned.
pub unsafe fn register(
    handler: NonNull<u8>,
    _table: &'static SignalHandlerConfig,
) -> Result<Registration> {
    // Safety: ensured by caller
    let handler = unsafe { mem::transmute::<*mut u8, VectoredHandler>(handler.as_ptr()) };
    // Safety: the handler is valid until removed
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(handler)) };

    NonNull::new(handle)
        .map(|handle| Registration { handle })
        .ok_or_else(|| Error::Registration(io::Error::last_os_error()))
}

/// Removes the handler installed by [`register`].
///
/// # Safety
///
/// No thread may rely on the fault handler anymore.
pub unsafe fn unregister(
    registration: Registration,
    _table: &'static SignalHandlerConfig,
) -> Result<()> {
    // Safety: the handle was returned by AddVectoredExceptionHandler
    if unsafe { RemoveVectoredExceptionHandler(registration.handle.as_ptr()) } == 0 {
        Err(Error::Registration(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}
