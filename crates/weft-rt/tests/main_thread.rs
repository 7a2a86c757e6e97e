// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler 0 on the caller's thread. Own binary: the mode must be
//! chosen before the pool exists, and the test ends by stopping it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use weft_rt as weft;
use weft_rt::WaitGroup;

fn thread_id_hash() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    thread::current().id().hash(&mut h);
    h.finish()
}

#[test]
fn scheduler_zero_runs_on_caller_thread() {
    let main_sched = weft::main_sched();
    let caller_tid = thread_id_hash();

    let seen_tid = Arc::new(AtomicU64::new(0));
    let wg = WaitGroup::new(1);
    {
        let seen_tid = seen_tid.clone();
        let wg = wg.clone();
        // Pin onto scheduler 0 explicitly.
        weft::scheds()[0].go(move || {
            assert_eq!(weft::sched_id(), Some(0));
            seen_tid.store(thread_id_hash(), Ordering::Release);
            wg.done();
        });
    }

    // Another thread waits for the work, then tears the pool down,
    // which makes run() below return.
    let stopper = thread::spawn(move || {
        wg.wait();
        weft::stop_scheds();
    });

    main_sched.run();
    stopper.join().unwrap();

    assert_eq!(seen_tid.load(Ordering::Acquire), caller_tid);
}
