// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shutdown policy. Lives in its own binary: once the pool is stopped,
//! no other test could share the process.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft_rt as weft;
use weft_rt::{Event, WaitGroup};

#[test]
fn stop_abandons_parked_coroutines() {
    let finished = Arc::new(AtomicU32::new(0));
    let wg = WaitGroup::new(4);
    for _ in 0..4 {
        let finished = finished.clone();
        let wg = wg.clone();
        weft::go(move || {
            finished.fetch_add(1, Ordering::Relaxed);
            wg.done();
        });
    }
    wg.wait();

    // Park a coroutine on an event nobody will ever signal.
    let ev = Event::new(false, false);
    let parked = Arc::new(AtomicU32::new(0));
    {
        let ev = ev.clone();
        let parked = parked.clone();
        weft::go(move || {
            parked.store(1, Ordering::Release);
            ev.wait();
            // Never reached: the runtime stops first.
            parked.store(2, Ordering::Release);
        });
    }
    while parked.load(Ordering::Acquire) == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    // Stop is best-effort: it returns once the loops exited, leaving
    // the parked coroutine behind, and is idempotent.
    weft::stop_scheds();
    weft::stop_scheds();

    assert_eq!(finished.load(Ordering::Relaxed), 4);
    assert_eq!(parked.load(Ordering::Acquire), 1);
}
