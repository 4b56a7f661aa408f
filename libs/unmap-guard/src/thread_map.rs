// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicU32, Ordering};

/// Number of threads that can hold a slot at the same time.
pub const MAP_SIZE: usize = 20;

/// A fixed-capacity map from OS thread id to a per-thread `u32` slot.
///
/// Reserving a slot is a single compare-and-swap on the id array, so it works from inside a fault
/// handler. A slot, once reserved, is only ever written by the thread that owns it; other threads
/// may read it. Id `0` marks a free slot.
#[repr(C)]
pub struct ThreadLocalMap {
    thread_ids: [AtomicU32; MAP_SIZE],
    values: [AtomicU32; MAP_SIZE],
}

impl ThreadLocalMap {
    pub const fn new() -> Self {
        Self {
            thread_ids: [const { AtomicU32::new(0) }; MAP_SIZE],
            values: [const { AtomicU32::new(0) }; MAP_SIZE],
        }
    }

    /// Returns the slot index owned by `thread_id`, reserving a free slot initialized to
    /// `initial` if the thread has none yet.
    ///
    /// Returns `None` when every slot is taken.
    pub fn get_or_reserve(&self, thread_id: u32, initial: u32) -> Option<usize> {
        debug_assert_ne!(thread_id, 0, "thread id 0 is reserved for free slots");

        if let Some(index) = self.index_of(thread_id) {
            return Some(index);
        }

        for (index, id) in self.thread_ids.iter().enumerate() {
            if id
                .compare_exchange(0, thread_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.values[index].store(initial, Ordering::Release);
                return Some(index);
            }
        }

        None
    }

    /// Returns the slot index owned by `thread_id`, if any.
    pub fn index_of(&self, thread_id: u32) -> Option<usize> {
        self.thread_ids
            .iter()
            .position(|id| id.load(Ordering::Acquire) == thread_id)
    }

    /// The value cell of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= MAP_SIZE`.
    pub fn value(&self, index: usize) -> &AtomicU32 {
        &self.values[index]
    }

    /// The id of the thread owning slot `index`, `0` if the slot is free.
    ///
    /// # Panics
    ///
    /// Panics if `index >= MAP_SIZE`.
    pub fn thread_id(&self, index: usize) -> u32 {
        self.thread_ids[index].load(Ordering::Acquire)
    }

    /// Frees the slot owned by `thread_id`. Returns `false` if the thread had none.
    pub fn release(&self, thread_id: u32) -> bool {
        let Some(index) = self.index_of(thread_id) else {
            return false;
        };

        self.values[index].store(0, Ordering::Relaxed);
        self.thread_ids[index]
            .compare_exchange(thread_id, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Iterates over `(index, thread_id)` of all reserved slots.
    pub fn reserved(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.thread_ids
            .iter()
            .enumerate()
            .filter_map(|(index, id)| {
                let id = id.load(Ordering::Acquire);
                (id != 0).then_some((index, id))
            })
    }

    /// Frees every slot.
    pub fn clear(&self) {
        for (id, value) in self.thread_ids.iter().zip(&self.values) {
            value.store(0, Ordering::Relaxed);
            id.store(0, Ordering::Release);
        }
    }
}

impl Default for ThreadLocalMap {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ThreadLocalMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(
                self.reserved()
                    .map(|(index, id)| (id, self.values[index].load(Ordering::Relaxed))),
            )
            .finish()
    }
}
