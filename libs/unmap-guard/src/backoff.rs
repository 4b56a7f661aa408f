// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// An [exponential backoff] for the spin loops in this crate.
///
/// There are two flavours of waiting here. Code that may run inside a fault handler must only ever
/// [`spin`](Self::spin), because the OS scheduler is off limits there. Ordinary threads waiting for
/// fault handlers to drain should [`snooze`](Self::snooze) instead, which falls back to yielding
/// the thread once spinning stops paying off.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
    max: u8,
}

impl Backoff {
    /// The default maximum exponent (2^8 spins per round).
    pub const DEFAULT_MAX_EXPONENT: u8 = 8;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Returns a backoff with the provided max exponent.
    ///
    /// # Panics
    ///
    /// Panics if `max` is larger than [`Self::DEFAULT_MAX_EXPONENT`].
    #[must_use]
    pub fn with_max_exponent(max: u8) -> Self {
        assert!(max <= Self::DEFAULT_MAX_EXPONENT);
        Self { exp: 0, max }
    }

    /// Busy-waits for `2^exp` spin loop hints and bumps the exponent.
    ///
    /// Safe to call from a signal handler.
    #[inline(always)]
    pub fn spin(&mut self) {
        let spins = 1_u32 << self.exp;

        for _ in 0..spins {
            // Under loom the spinning thread has to hand control back to the model so the thread
            // we are waiting on can make progress.
            #[cfg(any(test, loom))]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1;
        }
    }

    /// Like [`Self::spin`], but yields the time slice once the maximum exponent was reached.
    ///
    /// Must not be called from trap context.
    pub fn snooze(&mut self) {
        if self.is_completed() {
            crate::loom::thread::yield_now();
        } else {
            self.spin();
        }
    }

    /// Returns `true` once spinning has reached the maximum exponent.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.exp >= self.max
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.exp = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
