// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use unmap_guard::{PartialUnmapState, retry_from_access_violation};

const HANDLER_THREADS: usize = 8;
const ROUNDS: u32 = 200;

// Fault handlers hammering the retry path while a remapper keeps bumping the generation. Every
// remap must get through, and each thread retries at most once per generation.
#[test_log::test]
#[cfg_attr(loom, ignore = "not concurrency-relevant")]
fn handlers_and_remapper_make_progress() {
    let state = PartialUnmapState::global();
    state.reset();

    let stop = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(HANDLER_THREADS + 1));

    let handlers: Vec<_> = (0..HANDLER_THREADS)
        .map(|_| {
            let stop = stop.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let mut retries = 0_u32;
                while !stop.load(Ordering::Acquire) {
                    state.handler_entered();
                    if retry_from_access_violation() != 0 {
                        retries += 1;
                    }
                    state.handler_completed();
                }
                retries
            })
        })
        .collect();

    start.wait();
    for round in 1..=ROUNDS {
        let guard = state.begin_partial_unmap();
        assert_eq!(guard.generation(), round);
        assert!(guard.is_exclusive());
        thread::yield_now();
        drop(guard);
    }
    thread::sleep(Duration::from_millis(10));
    stop.store(true, Ordering::Release);

    let retries: u32 = handlers.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(state.partial_unmaps(), ROUNDS);
    assert_eq!(state.handlers_in_flight(), 0);
    // every thread retries at most once per generation
    assert!(retries <= ROUNDS * u32::try_from(HANDLER_THREADS).unwrap());
    assert!(retries > 0);

    state.reset();
}
