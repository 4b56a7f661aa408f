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
    /// Code generation for the fault handler failed.
    Compile(anyhow::Error),
    /// The compiled fault handler could not be placed into the code cache.
    Map(code_cache::Error),
    /// The OS refused to install or remove the fault handler.
    Registration(io::Error),
    /// The fault ABI of this OS/architecture combination is not known.
    UnsupportedPlatform,
}

impl From<code_cache::Error> for Error {
    fn from(err: code_cache::Error) -> Self {
        Self::Map(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Compile(err) => write!(f, "failed to compile fault handler: {err}"),
            Error::Map(err) => write!(f, "failed to map fault handler: {err}"),
            Error::Registration(err) => write!(f, "failed to register fault handler: {err}"),
            Error::UnsupportedPlatform => {
                f.write_str("fault handling is not supported on this platform")
            }
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Compile(err) => Some(err.as_ref()),
            Error::Map(err) => Some(err),
            Error::Registration(err) => Some(err),
            Error::UnsupportedPlatform => None,
        }
    }
}
