// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::rw_lock::{
    NativeRwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use crate::{Backoff, ThreadLocalMap, current_thread_id, is_thread_alive};

/// Number of fully backed-off waiting rounds after which a remapper waiting for fault handlers
/// to drain reports that it is still waiting.
const QUIESCENCE_REPORT_ROUNDS: u32 = 1 << 12;

static GLOBAL: PartialUnmapState = PartialUnmapState::new();

/// Process-wide state shared between fault handlers and code that splits or resizes live
/// mappings.
///
/// The protocol works like this:
///
/// 1. A remapper calls [`begin_partial_unmap`](Self::begin_partial_unmap). That waits for every
///    fault handler that entered before the call to complete, then takes the lock exclusively and
///    bumps the partial unmap generation.
/// 2. While the returned guard is alive the mapping may briefly have holes. Threads touching
///    a hole fault, the handler finds no tracked range and calls
///    [`retry_from_access_violation`](Self::retry_from_access_violation), which blocks on the lock
///    until the remap is done.
/// 3. Each thread remembers the last generation it retried at. A fault at a newer generation is
///    retried once, a second fault at the same generation is a genuine access violation.
#[repr(C)]
pub struct PartialUnmapState {
    lock: NativeRwLock<()>,
    writer_thread: AtomicU32,
    partial_unmaps: AtomicU32,
    handlers_entered: AtomicU64,
    handlers_completed: AtomicU64,
    local_counts: ThreadLocalMap,
}

impl PartialUnmapState {
    pub const fn new() -> Self {
        Self {
            lock: NativeRwLock::new(()),
            writer_thread: AtomicU32::new(0),
            partial_unmaps: AtomicU32::new(0),
            handlers_entered: AtomicU64::new(0),
            handlers_completed: AtomicU64::new(0),
            local_counts: ThreadLocalMap::new(),
        }
    }

    /// The process-wide instance consulted by the fault handler.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Returns all counters and thread slots to their initial state.
    ///
    /// Must not be called while a partial unmap or a fault handler is in flight.
    pub fn reset(&self) {
        debug_assert!(!self.lock.is_locked(), "reset while the lock is held");

        self.writer_thread.store(0, Ordering::Relaxed);
        self.partial_unmaps.store(0, Ordering::Relaxed);
        self.handlers_entered.store(0, Ordering::Relaxed);
        self.handlers_completed.store(0, Ordering::Relaxed);
        self.local_counts.clear();
    }

    /// The current partial unmap generation.
    pub fn partial_unmaps(&self) -> u32 {
        self.partial_unmaps.load(Ordering::Acquire)
    }

    pub fn local_counts(&self) -> &ThreadLocalMap {
        &self.local_counts
    }

    /// Records that a fault handler started running. Returns the new entered count.
    #[inline]
    pub fn handler_entered(&self) -> u64 {
        self.handlers_entered.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Records that a fault handler finished running.
    #[inline]
    pub fn handler_completed(&self) {
        self.handlers_completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of fault handlers that have started running so far.
    pub fn handlers_entered(&self) -> u64 {
        self.handlers_entered.load(Ordering::Acquire)
    }

    /// Number of handlers that have entered but not yet completed.
    pub fn handlers_in_flight(&self) -> u64 {
        let completed = self.handlers_completed.load(Ordering::Acquire);
        let entered = self.handlers_entered.load(Ordering::Acquire);
        entered.saturating_sub(completed)
    }

    /// Address of the handlers-entered counter, bumped directly by generated handler code.
    pub fn handlers_entered_ptr(&self) -> *const AtomicU64 {
        &raw const self.handlers_entered
    }

    /// Address of the handlers-completed counter, bumped directly by generated handler code.
    pub fn handlers_completed_ptr(&self) -> *const AtomicU64 {
        &raw const self.handlers_completed
    }

    /// Waits until at least `snapshot` handlers have completed.
    ///
    /// Every handler that entered before `snapshot` was taken finishes in bounded time, so this
    /// makes forward progress as long as handlers are not entered faster than they complete
    /// forever. Must not be called from a fault handler.
    pub fn wait_for_quiescence(&self, snapshot: u64) {
        let mut boff = Backoff::new();
        let mut rounds = 0_u32;

        while self.handlers_completed.load(Ordering::Acquire) < snapshot {
            boff.snooze();

            if boff.is_completed() {
                rounds += 1;
                if rounds == QUIESCENCE_REPORT_ROUNDS {
                    tracing::debug!(
                        snapshot,
                        in_flight = self.handlers_in_flight(),
                        "still waiting for fault handlers to drain"
                    );
                }
            }
        }
    }

    /// Starts changing the layout of a live mapping.
    ///
    /// Waits for in-flight fault handlers, then holds the lock exclusively until the returned
    /// guard is dropped or [downgraded](PartialUnmapGuard::downgrade). Slots of threads that have
    /// exited are [trimmed](Self::trim_threads) before the generation is bumped.
    pub fn begin_partial_unmap(&self) -> PartialUnmapGuard<'_> {
        let snapshot = self.handlers_entered();
        self.wait_for_quiescence(snapshot);

        // Announce the upgrade first so no new handler can slip in, then wait for the handlers
        // currently holding the lock shared to leave.
        let upgradable = self.lock.upgradable_read();
        let write = RwLockUpgradableReadGuard::upgrade(upgradable);

        // no handler can reserve a slot while the lock is held exclusively
        self.trim_threads();

        self.writer_thread
            .store(current_thread_id(), Ordering::Relaxed);
        let generation = self.partial_unmaps.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::trace!(generation, "partial unmap started");

        PartialUnmapGuard {
            generation,
            lock: GuardLock::Write {
                mark: WriterMark { state: self },
                guard: write,
            },
        }
    }

    /// Decides whether a fault nobody claimed was caused by a racing partial unmap.
    ///
    /// Returns `true` if the faulting access should simply be retried. Safe to call from a fault
    /// handler: it only spins, and never allocates.
    pub fn retry_from_access_violation(&self) -> bool {
        let thread_id = current_thread_id();

        // The remapping thread faulting on its own hole would otherwise wait for itself forever.
        if self.writer_thread.load(Ordering::Relaxed) == thread_id {
            return false;
        }

        let _guard = self.lock.read();

        let Some(index) = self.local_counts.get_or_reserve(thread_id, 0) else {
            // No slot means no memory of earlier retries, so always retry.
            return true;
        };

        let local = self.local_counts.value(index);
        let current = self.partial_unmaps.load(Ordering::Acquire);

        if local.load(Ordering::Relaxed) == current {
            false
        } else {
            local.store(current, Ordering::Relaxed);
            true
        }
    }

    /// Frees the slots of threads that have exited. Returns how many were freed.
    pub fn trim_threads(&self) -> usize {
        let mut trimmed = 0;
        for (_, thread_id) in self.local_counts.reserved() {
            if !is_thread_alive(thread_id) && self.local_counts.release(thread_id) {
                trimmed += 1;
            }
        }

        if trimmed > 0 {
            tracing::debug!(trimmed, "trimmed partial unmap slots of exited threads");
        }
        trimmed
    }
}

impl Default for PartialUnmapState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PartialUnmapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialUnmapState")
            .field("locked", &self.lock.is_locked())
            .field("partial_unmaps", &self.partial_unmaps)
            .field("handlers_entered", &self.handlers_entered)
            .field("handlers_completed", &self.handlers_completed)
            .field("local_counts", &self.local_counts)
            .finish_non_exhaustive()
    }
}

/// Trampoline entry point for [`PartialUnmapState::retry_from_access_violation`] on the global
/// state. Returns `1` to retry the faulting access, `0` otherwise.
pub extern "C" fn retry_from_access_violation() -> u8 {
    u8::from(PartialUnmapState::global().retry_from_access_violation())
}

/// Marks the current thread as the remapper until dropped.
struct WriterMark<'a> {
    state: &'a PartialUnmapState,
}

impl Drop for WriterMark<'_> {
    fn drop(&mut self) {
        self.state.writer_thread.store(0, Ordering::Relaxed);
    }
}

enum GuardLock<'a> {
    // the mark must be cleared before the lock is released
    Write {
        mark: WriterMark<'a>,
        guard: RwLockWriteGuard<'a, ()>,
    },
    Read(RwLockReadGuard<'a, ()>),
}

/// Keeps a partial unmap in progress. Dropping it lets fault handlers continue.
pub struct PartialUnmapGuard<'a> {
    generation: u32,
    lock: GuardLock<'a>,
}

impl PartialUnmapGuard<'_> {
    /// The generation this partial unmap bumped the state to.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the mapping may still be mutated through this guard.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.lock, GuardLock::Write { .. })
    }

    /// Lets fault handlers run again while keeping other remappers out until the guard is
    /// dropped.
    pub fn downgrade(self) -> Self {
        let lock = match self.lock {
            GuardLock::Write { mark, guard } => {
                drop(mark);
                GuardLock::Read(RwLockWriteGuard::downgrade(guard))
            }
            read @ GuardLock::Read(_) => read,
        };

        tracing::trace!(generation = self.generation, "partial unmap downgraded");

        Self {
            generation: self.generation,
            lock,
        }
    }
}

impl fmt::Debug for PartialUnmapGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialUnmapGuard")
            .field("generation", &self.generation)
            .field("exclusive", &self.is_exclusive())
            .finish_non_exhaustive()
    }
}
