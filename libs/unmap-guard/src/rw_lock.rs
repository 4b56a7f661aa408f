// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A spinning reader/writer lock whose entire state is one machine word.
//!
//! The lock never parks a thread, never allocates and has a fixed `#[repr(C)]` layout, so it can
//! be taken from inside a signal handler and its address can be handed to generated code.
//!
//! State layout:
//!
//! ```text
//!  63                          2   1   0
//! ┌─────────────────────────────┬───┬───┐
//! │        reader count         │ U │ W │
//! └─────────────────────────────┴───┴───┘
//! ```
//!
//! `W` is set while the lock is held exclusively. `U` is set while an upgradable reader holds the
//! lock; new readers are turned away while it is set so a pending upgrade cannot be starved by a
//! steady stream of fault handlers.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::Backoff;

const WRITER: usize = 1;
const UPGRADABLE: usize = 1 << 1;
const READER: usize = 1 << 2;

pub type NativeRwLock<T> = lock_api::RwLock<RawNativeRwLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawNativeRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawNativeRwLock, T>;
pub type RwLockUpgradableReadGuard<'a, T> =
    lock_api::RwLockUpgradableReadGuard<'a, RawNativeRwLock, T>;

#[repr(C)]
pub struct RawNativeRwLock {
    state: AtomicUsize,
}

impl fmt::Debug for RawNativeRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.state.load(Ordering::Relaxed);
        f.debug_struct("RawNativeRwLock")
            .field("writer", &(v & WRITER != 0))
            .field("upgradable", &(v & UPGRADABLE != 0))
            .field("readers", &(v / READER))
            .finish()
    }
}

impl RawNativeRwLock {
    /// Number of shared owners currently holding the lock.
    pub fn reader_count(&self) -> usize {
        self.state.load(Ordering::Relaxed) / READER
    }

    /// Address of the state word, for code that manipulates the lock directly.
    pub fn state_ptr(&self) -> *const AtomicUsize {
        &raw const self.state
    }

    #[inline]
    fn try_set_bit_if_free(&self, bit: usize) -> bool {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur & (WRITER | UPGRADABLE) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur | bit,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

// Safety: exclusive ownership is only handed out when the state transitions from 0 (or from a lone
// upgradable owner) to WRITER, shared ownership only while neither WRITER nor UPGRADABLE are set.
unsafe impl lock_api::RawRwLock for RawNativeRwLock {
    #[expect(clippy::declare_interior_mutable_const, reason = "required by lock_api")]
    const INIT: Self = Self {
        state: AtomicUsize::new(0),
    };
    type GuardMarker = lock_api::GuardSend;

    fn lock_shared(&self) {
        let mut boff = Backoff::new();
        while !self.try_lock_shared() {
            boff.spin();
        }
    }

    fn try_lock_shared(&self) -> bool {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur & (WRITER | UPGRADABLE) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + READER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    unsafe fn unlock_shared(&self) {
        let prev = self.state.fetch_sub(READER, Ordering::Release);
        debug_assert!(prev >= READER, "unlock_shared without shared owner");
    }

    fn lock_exclusive(&self) {
        let mut boff = Backoff::new();
        while !self.try_lock_exclusive() {
            boff.spin();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        let prev = self.state.fetch_sub(WRITER, Ordering::Release);
        debug_assert_eq!(prev, WRITER, "unlock_exclusive without exclusive owner");
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }
}

// Safety: the upgradable owner excludes other upgradable owners and writers, and is only turned
// into a writer once every shared owner has left.
unsafe impl lock_api::RawRwLockUpgrade for RawNativeRwLock {
    fn lock_upgradable(&self) {
        let mut boff = Backoff::new();
        while !self.try_lock_upgradable() {
            boff.spin();
        }
    }

    fn try_lock_upgradable(&self) -> bool {
        self.try_set_bit_if_free(UPGRADABLE)
    }

    unsafe fn unlock_upgradable(&self) {
        self.state.fetch_sub(UPGRADABLE, Ordering::Release);
    }

    unsafe fn upgrade(&self) {
        let mut boff = Backoff::new();
        // Safety: ensured by caller
        while !unsafe { self.try_upgrade() } {
            boff.spin();
        }
    }

    unsafe fn try_upgrade(&self) -> bool {
        self.state
            .compare_exchange(UPGRADABLE, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

// Safety: a writer is the only owner, so swapping WRITER for one READER keeps ownership continuous.
unsafe impl lock_api::RawRwLockDowngrade for RawNativeRwLock {
    unsafe fn downgrade(&self) {
        self.state
            .fetch_add(READER.wrapping_sub(WRITER), Ordering::Release);
    }
}

// Safety: see the individual transitions, none of them pass through an unlocked state.
unsafe impl lock_api::RawRwLockUpgradeDowngrade for RawNativeRwLock {
    unsafe fn downgrade_upgradable(&self) {
        self.state
            .fetch_add(READER.wrapping_sub(UPGRADABLE), Ordering::Release);
    }

    unsafe fn downgrade_to_upgradable(&self) {
        self.state
            .fetch_add(UPGRADABLE.wrapping_sub(WRITER), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use lock_api::{
        RawRwLock as _, RawRwLockDowngrade, RawRwLockUpgrade, RawRwLockUpgradeDowngrade,
    };

    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;
    use crate::loom::thread;

    const FAULT_HANDLERS: usize = 16;

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn remap_excludes_fault_handlers() {
        let l = RawNativeRwLock::INIT;

        for _ in 0..FAULT_HANDLERS {
            assert!(l.try_lock_shared());
        }
        assert_eq!(l.reader_count(), FAULT_HANDLERS);
        assert!(!l.try_lock_exclusive());

        for _ in 0..FAULT_HANDLERS {
            // Safety: acquired above
            unsafe { l.unlock_shared() };
        }
        assert!(l.try_lock_exclusive());
        assert!(!l.try_lock_shared());
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn failed_readers_leave_no_trace() {
        let l = RawNativeRwLock::INIT;
        assert!(l.try_lock_exclusive());

        for _ in 0..FAULT_HANDLERS {
            assert!(!l.try_lock_shared());
        }
        assert_eq!(l.reader_count(), 0);

        // Safety: acquired above
        unsafe { l.unlock_exclusive() };
        assert!(!l.is_locked());
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn upgrade_waits_for_in_flight_handlers() {
        let l = RawNativeRwLock::INIT;

        assert!(l.try_lock_shared());
        assert!(l.try_lock_upgradable());

        // new handlers are held back while the upgrade is pending
        assert!(!l.try_lock_shared());
        // Safety: we hold the upgradable lock
        assert!(!unsafe { l.try_upgrade() });

        // Safety: acquired above
        unsafe { l.unlock_shared() };

        // Safety: we hold the upgradable lock
        assert!(unsafe { l.try_upgrade() });
        assert!(l.is_locked_exclusive());
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn downgrade_keeps_ownership() {
        let l = RawNativeRwLock::INIT;

        assert!(l.try_lock_exclusive());
        // Safety: we hold the write lock
        unsafe { l.downgrade() };

        assert_eq!(l.reader_count(), 1);
        assert!(!l.try_lock_exclusive());
        assert!(l.try_lock_shared());

        // Safety: both shared locks were acquired above
        unsafe {
            l.unlock_shared();
            l.unlock_shared();
        }
        assert!(!l.is_locked());
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn upgradable_round_trip() {
        let l = RawNativeRwLock::INIT;

        assert!(l.try_lock_upgradable());
        assert!(!l.try_lock_upgradable());
        assert!(!l.try_lock_exclusive());

        // Safety: we hold the upgradable lock
        unsafe { l.upgrade() };
        // Safety: we hold the write lock
        unsafe { l.downgrade_to_upgradable() };
        assert!(!l.is_locked_exclusive());
        // Safety: we hold the upgradable lock
        unsafe { l.downgrade_upgradable() };
        assert_eq!(l.reader_count(), 1);

        // Safety: downgraded into a shared lock above
        unsafe { l.unlock_shared() };
        assert!(!l.is_locked());
    }

    #[test]
    fn writers_serialize_with_readers() {
        loom::model(|| {
            let lock = Arc::new(NativeRwLock::new(0_usize));

            let writers: Vec<_> = (0..2)
                .map(|_| {
                    let lock = lock.clone();
                    thread::spawn(move || {
                        let guard = lock.upgradable_read();
                        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
                        *guard += 1;
                        let guard = RwLockWriteGuard::downgrade(guard);
                        assert!(*guard >= 1);
                    })
                })
                .collect();

            let reader = {
                let lock = lock.clone();
                thread::spawn(move || {
                    let v = *lock.read();
                    assert!(v <= 2);
                })
            };

            for w in writers {
                w.join().unwrap();
            }
            reader.join().unwrap();

            assert_eq!(*lock.read(), 2);
        });
    }
}
