// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Dispatches hardware access faults to callbacks registered for memory ranges.
//!
//! The fault handler is generated at runtime with cranelift for the host's fault ABI and mapped
//! into the [`code_cache`]. It consults a fixed table of [`MAX_TRACKED_RANGES`] tracked ranges,
//! asks the [`unmap_guard`] whether an unclaimed fault raced a partial unmap, and otherwise passes
//! the fault on to whatever handler was installed before.

mod compiler;
mod config;
mod dispatcher;
mod error;
mod sys;
mod table;
mod trampoline;

pub use compiler::{
    CompiledFunction, CompilerConfig, CraneliftCompiler, FunctionCompiler, OptLevel,
};
pub use config::{FaultAbi, FaultAbiConfig, WriteFlagSource};
pub use dispatcher::{FaultDispatcher, add_tracked_range, install, remove_tracked_range, uninstall};
pub use error::{Error, Result};
pub use table::{
    MAX_TRACKED_RANGES, PreviousHandler, SignalHandlerConfig, TrackedRange, TrackingCallback,
};
pub use trampoline::{TrampolineSynthesizer, TrampolineTargets};
