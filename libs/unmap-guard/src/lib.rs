// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide bookkeeping that keeps fault handlers and partial unmaps out of each other's way.
//!
//! A *partial unmap* splits or resizes a live guest mapping while other threads may still be
//! touching it. If such a thread faults on the hole that briefly exists while the mapping is
//! rebuilt, the fault handler must not treat that as a genuine access violation. Instead it waits
//! for the remap to finish and retries the access.
//!
//! Everything in here is reachable from inside a hardware trap, so none of it allocates and all
//! state lives in statically allocated, fixed-size storage:
//!
//! - [`NativeRwLock`] is a spinning reader/writer lock. Fault handlers are readers, remaps are
//!   writers. It supports upgrading and downgrading without releasing ownership.
//! - [`ThreadLocalMap`] maps OS thread ids to a small per-thread counter slot.
//! - [`PartialUnmapState`] ties the two together with the handler entry/exit counters that let a
//!   remapper wait for in-flight handlers to drain.

mod backoff;
mod loom;
mod rw_lock;
mod state;
mod thread_id;
mod thread_map;

pub use backoff::Backoff;
pub use rw_lock::{
    NativeRwLock, RawNativeRwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
pub use state::{PartialUnmapGuard, PartialUnmapState, retry_from_access_violation};
pub use thread_id::{current_thread_id, is_thread_alive};
pub use thread_map::{MAP_SIZE, ThreadLocalMap};
