// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The statically allocated table the compiled fault handler reads.
//!
//! Everything in here has a fixed `#[repr(C)]` layout and lives at a fixed address, because the
//! handler accesses it through constant addresses and field offsets baked into its code. Slots are
//! updated with plain atomic stores and no lock. A handler racing an update either sees the slot
//! inactive and passes the fault on, or sees a complete slot.

use core::fmt;
use core::mem::offset_of;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Number of ranges that can be tracked at the same time.
pub const MAX_TRACKED_RANGES: usize = 8;

/// Invoked from the fault handler for an access inside a tracked range.
///
/// Receives the page-aligned offset of the access from the range start, the page size, whether the
/// access was a write and whether the reported address is exact. A non-zero return value marks the
/// fault as handled and the access is retried. Runs in signal context: it must not allocate, take
/// locks that the faulting thread could hold, or unwind.
pub type TrackingCallback =
    unsafe extern "C" fn(offset: u64, size: u64, write: u8, precise: u8) -> u8;

const SLOT_FREE: u32 = 0;
const SLOT_ACTIVE: u32 = 1;
const SLOT_WRITING: u32 = 2;

/// One slot of the table. Only `is_active == 1` slots are considered by the handler.
#[repr(C)]
pub struct TrackedRange {
    is_active: AtomicU32,
    start: AtomicUsize,
    end: AtomicUsize,
    callback: AtomicUsize,
}

impl TrackedRange {
    pub const IS_ACTIVE_OFFSET: usize = offset_of!(TrackedRange, is_active);
    pub const START_OFFSET: usize = offset_of!(TrackedRange, start);
    pub const END_OFFSET: usize = offset_of!(TrackedRange, end);
    pub const CALLBACK_OFFSET: usize = offset_of!(TrackedRange, callback);

    /// The value of `is_active` that marks a complete, matchable slot.
    pub const ACTIVE: u32 = SLOT_ACTIVE;

    const fn new() -> Self {
        Self {
            is_active: AtomicU32::new(SLOT_FREE),
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            callback: AtomicUsize::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire) == SLOT_ACTIVE
    }

    pub fn start(&self) -> usize {
        self.start.load(Ordering::Relaxed)
    }

    pub fn end(&self) -> usize {
        self.end.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TrackedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRange")
            .field("is_active", &self.is_active.load(Ordering::Relaxed))
            .field("start", &format_args!("{:#x}", self.start()))
            .field("end", &format_args!("{:#x}", self.end()))
            .field(
                "callback",
                &format_args!("{:#x}", self.callback.load(Ordering::Relaxed)),
            )
            .finish()
    }
}

/// The disposition a signal had before the fault handler was installed.
#[repr(C)]
pub struct PreviousHandler {
    /// Address of the previous handler function, `0` if there is nothing to chain to.
    pub action: AtomicUsize,
    /// Non-zero if the previous handler takes `(signum, siginfo, context)`, zero if it only takes
    /// `signum`.
    pub siginfo: AtomicU32,
}

impl PreviousHandler {
    pub const ACTION_OFFSET: usize = offset_of!(PreviousHandler, action);
    pub const SIGINFO_OFFSET: usize = offset_of!(PreviousHandler, siginfo);

    const fn new() -> Self {
        Self {
            action: AtomicUsize::new(0),
            siginfo: AtomicU32::new(0),
        }
    }

    pub fn set(&self, action: usize, siginfo: bool) {
        self.siginfo.store(u32::from(siginfo), Ordering::Relaxed);
        self.action.store(action, Ordering::Release);
    }

    pub fn clear(&self) {
        self.action.store(0, Ordering::Release);
        self.siginfo.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for PreviousHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviousHandler")
            .field(
                "action",
                &format_args!("{:#x}", self.action.load(Ordering::Relaxed)),
            )
            .field("siginfo", &(self.siginfo.load(Ordering::Relaxed) != 0))
            .finish()
    }
}

static GLOBAL: SignalHandlerConfig = SignalHandlerConfig::new();

#[repr(C)]
pub struct SignalHandlerConfig {
    /// Chained to for unhandled `SIGSEGV`s.
    pub sigsegv: PreviousHandler,
    /// Chained to for unhandled `SIGBUS`es.
    pub sigbus: PreviousHandler,
    ranges: [TrackedRange; MAX_TRACKED_RANGES],
}

impl SignalHandlerConfig {
    pub const SIGSEGV_OFFSET: usize = offset_of!(SignalHandlerConfig, sigsegv);
    pub const SIGBUS_OFFSET: usize = offset_of!(SignalHandlerConfig, sigbus);
    const RANGES_OFFSET: usize = offset_of!(SignalHandlerConfig, ranges);

    pub const fn new() -> Self {
        Self {
            sigsegv: PreviousHandler::new(),
            sigbus: PreviousHandler::new(),
            ranges: [const { TrackedRange::new() }; MAX_TRACKED_RANGES],
        }
    }

    /// The table consulted by the installed fault handler.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Offset of slot `index` from the start of the table.
    pub const fn range_offset(index: usize) -> usize {
        Self::RANGES_OFFSET + index * size_of::<TrackedRange>()
    }

    pub fn ranges(&self) -> &[TrackedRange; MAX_TRACKED_RANGES] {
        &self.ranges
    }

    /// Starts routing faults in `start..end` to `callback`.
    ///
    /// Returns `false` if the range is empty or every slot is taken.
    pub fn add_tracked_range(&self, start: usize, end: usize, callback: TrackingCallback) -> bool {
        if start >= end {
            tracing::warn!(start, end, "refusing to track an empty range");
            return false;
        }

        for slot in &self.ranges {
            // claim the slot first so the handler never matches a half-written one
            if slot
                .is_active
                .compare_exchange(SLOT_FREE, SLOT_WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            slot.start.store(start, Ordering::Relaxed);
            slot.end.store(end, Ordering::Relaxed);
            slot.callback.store(callback as usize, Ordering::Relaxed);
            slot.is_active.store(SLOT_ACTIVE, Ordering::Release);

            tracing::trace!(start, end, "tracking range");
            return true;
        }

        tracing::warn!(start, end, "all tracked range slots are in use");
        false
    }

    /// Stops routing faults for the range starting at `start`.
    ///
    /// Returns `false` if no active range starts there.
    pub fn remove_tracked_range(&self, start: usize) -> bool {
        for slot in &self.ranges {
            if slot.start() == start
                && slot
                    .is_active
                    .compare_exchange(SLOT_ACTIVE, SLOT_FREE, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                tracing::trace!(start, end = slot.end(), "no longer tracking range");
                return true;
            }
        }

        false
    }

    /// Number of active slots.
    pub fn active_ranges(&self) -> usize {
        self.ranges.iter().filter(|slot| slot.is_active()).count()
    }
}

impl Default for SignalHandlerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SignalHandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHandlerConfig")
            .field("sigsegv", &self.sigsegv)
            .field("sigbus", &self.sigbus)
            .field("ranges", &self.ranges)
            .finish()
    }
}

static_assertions::const_assert_eq!(TrackedRange::IS_ACTIVE_OFFSET, 0);
static_assertions::const_assert_eq!(
    size_of::<TrackedRange>(),
    4 * size_of::<usize>()
);
