// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wait group: an atomic counter over an auto-reset event.
//!
//! `done` on the last outstanding member signals the event; `wait`
//! blocks (coroutine-aware) until that happens. Decrementing past zero
//! is a programming error and aborts loudly.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::event::EventImpl;
use crate::sched::wait::INFINITE;

/// Counts outstanding members of a unit of work. Clones share the
/// counter.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<EventImpl>,
}

impl WaitGroup {
    /// Create with an initial count of `n`.
    pub fn new(n: u32) -> Self {
        Self {
            inner: Arc::new(EventImpl::new(false, false, n)),
        }
    }

    /// Add `n` members.
    pub fn add(&self, n: u32) {
        self.inner.counter().fetch_add(n, Ordering::Relaxed);
    }

    /// One member finished. Signals waiters when the counter hits zero.
    pub fn done(&self) {
        let prev = self.inner.counter().fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "wait_group: done() below zero");
        if prev == 1 {
            self.inner.signal();
        }
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        self.inner.wait_ms(INFINITE);
    }

    /// Current counter value.
    pub fn load(&self) -> u32 {
        self.inner.counter().load(Ordering::Acquire)
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn waits_for_all_members() {
        let wg = WaitGroup::new(4);
        for i in 0..4u64 {
            let wg = wg.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * i));
                wg.done();
            });
        }
        wg.wait();
        assert_eq!(wg.load(), 0);
    }

    #[test]
    fn add_extends_the_count() {
        let wg = WaitGroup::new(1);
        wg.add(2);
        assert_eq!(wg.load(), 3);
        wg.done();
        wg.done();
        assert_eq!(wg.load(), 1);
        wg.done();
        wg.wait();
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn underflow_panics() {
        let wg = WaitGroup::new(0);
        wg.done();
    }

    #[test]
    fn wait_after_zero_returns_immediately() {
        let wg = WaitGroup::new(1);
        wg.done();
        wg.wait();
    }
}
