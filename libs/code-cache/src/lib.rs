// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executable memory for translated native code.
//!
//! A [`CodeCache`] reserves one large block of address space, places function bodies into it
//! with a first-fit [`RangeAllocator`] and keeps a directory of the mapped functions for reverse
//! lookup by program counter. Pages are flipped between writable and executable around each copy,
//! so the cache never holds memory that is writable and executable at the same time.

mod allocator;
mod cache;
mod error;
#[cfg(all(windows, target_arch = "x86_64"))]
mod function_table;
mod region;
mod sys;
mod unwind;

pub use allocator::{FreeBlock, RangeAllocator};
pub use cache::{CODE_ALIGNMENT, CacheEntry, CodeCache, CodeCacheConfig};
pub use error::{Error, Result};
pub use region::ReservedRegion;
pub use sys::{Protection, flush_icache, page_size};
pub use unwind::{
    MAX_UNWIND_CODES, MAX_WINDOWS_UNWIND_INFO_SIZE, UnwindInfo, UnwindPseudoOp, UnwindPushEntry,
};
