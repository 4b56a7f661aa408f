// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};
use std::io;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// No free range in the cache is large enough.
    OutOfMemory { requested: usize },
    /// Reserving the address space for the cache failed.
    Reserve(io::Error),
    /// Backing part of the reservation with memory failed.
    Commit(io::Error),
    /// Changing page protection failed.
    Protect(io::Error),
    /// The code blob is larger than any range the cache could ever hand out.
    CodeTooLarge { len: usize },
    /// Registering the cache with the OS unwinder failed.
    UnwindRegistration(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::OutOfMemory { requested } => {
                write!(f, "code cache out of memory ({requested} bytes requested)")
            }
            Error::Reserve(err) => write!(f, "failed to reserve code cache address space: {err}"),
            Error::Commit(err) => write!(f, "failed to commit code cache memory: {err}"),
            Error::Protect(err) => write!(f, "failed to change code cache protection: {err}"),
            Error::CodeTooLarge { len } => {
                write!(f, "code blob of {len} bytes does not fit into the code cache")
            }
            Error::UnwindRegistration(err) => {
                write!(f, "failed to register code cache with the unwinder: {err}")
            }
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Reserve(err)
            | Error::Commit(err)
            | Error::Protect(err)
            | Error::UnwindRegistration(err) => Some(err),
            Error::OutOfMemory { .. } | Error::CodeTooLarge { .. } => None,
        }
    }
}
