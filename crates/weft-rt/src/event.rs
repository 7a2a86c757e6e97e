// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Events: manual- or auto-reset, coroutine-aware.
//!
//! [`Event`] can be waited on from coroutines and plain threads alike.
//! Coroutine waiters park on a wait record and race signalers against
//! their timer; thread waiters use the condvar with a signal sequence
//! number so a wake can be told apart from a spurious return.
//! [`SyncEvent`] is the thread-only variant.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sched::coro::CoHandle;
use crate::sched::manager;
use crate::sched::scheduler;
use crate::sched::wait::{WaitState, INFINITE, ST_TIMEOUT};

struct EvWaiter {
    co: CoHandle,
    state: Arc<WaitState>,
}

struct EventState {
    signaled: bool,
    /// Parked coroutines, FIFO.
    wc: VecDeque<EvWaiter>,
    /// Number of threads blocked on the condvar.
    wt: u32,
    /// Signal sequence number; bumped when thread waiters are released.
    sn: u32,
}

pub(crate) struct EventImpl {
    st: Mutex<EventState>,
    cv: Condvar,
    manual: bool,
    /// Extra payload for the wait-group built on top of this body.
    counter: AtomicU32,
}

impl EventImpl {
    pub(crate) fn new(manual_reset: bool, signaled: bool, counter: u32) -> Self {
        Self {
            st: Mutex::new(EventState {
                signaled,
                wc: VecDeque::new(),
                wt: 0,
                sn: 0,
            }),
            cv: Condvar::new(),
            manual: manual_reset,
            counter: AtomicU32::new(counter),
        }
    }

    pub(crate) fn counter(&self) -> &AtomicU32 {
        &self.counter
    }

    /// Wait up to `ms` milliseconds (`INFINITE` disables the timer).
    /// Returns true when the event was signaled, false on timeout.
    pub(crate) fn wait_ms(&self, ms: u32) -> bool {
        match scheduler::current_coroutine() {
            Some(co) => {
                let state = {
                    let mut st = self.st.lock().unwrap();
                    if st.signaled {
                        if !self.manual {
                            st.signaled = false;
                        }
                        return true;
                    }
                    if ms == 0 {
                        return false;
                    }
                    // Records whose timer already fired are dead weight;
                    // shed the leading ones while we are here.
                    while st
                        .wc
                        .front()
                        .is_some_and(|w| w.state.get() == ST_TIMEOUT)
                    {
                        st.wc.pop_front();
                    }
                    let state = Arc::new(WaitState::new());
                    st.wc.push_back(EvWaiter {
                        co,
                        state: state.clone(),
                    });
                    state
                };
                !scheduler::suspend_current(state, ms)
            }
            None => {
                let mut st = self.st.lock().unwrap();
                if st.signaled {
                    if !self.manual {
                        st.signaled = false;
                    }
                    return true;
                }
                if ms == 0 {
                    return false;
                }
                let sn = st.sn;
                st.wt += 1;
                if ms == INFINITE {
                    loop {
                        st = self.cv.wait(st).unwrap();
                        if st.sn != sn {
                            return true;
                        }
                    }
                } else {
                    let deadline = Instant::now() + Duration::from_millis(ms as u64);
                    loop {
                        if st.sn != sn {
                            return true;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            // Still registered; take ourselves back out.
                            st.wt -= 1;
                            return false;
                        }
                        st = self.cv.wait_timeout(st, deadline - now).unwrap().0;
                    }
                }
            }
        }
    }

    /// Wake every current waiter. When nobody is waiting, the signal
    /// sticks until the next waiter consumes it.
    pub(crate) fn signal(&self) {
        let mut to_wake: Vec<CoHandle> = Vec::new();
        {
            let mut st = self.st.lock().unwrap();
            let has_wt = st.wt > 0;
            if has_wt {
                st.wt = 0;
            }
            let mut has_wc = false;
            for w in st.wc.drain(..) {
                if w.state.try_ready() {
                    has_wc = true;
                    to_wake.push(w.co);
                }
                // A lost race means that waiter's timer already claimed
                // it; just drop the record.
            }
            if has_wt || has_wc {
                if st.signaled && !self.manual {
                    st.signaled = false;
                }
                if has_wt {
                    st.sn = st.sn.wrapping_add(1);
                    self.cv.notify_all();
                }
            } else if !st.signaled {
                st.signaled = true;
            }
        }
        for co in to_wake {
            manager::add_ready(co);
        }
    }

    pub(crate) fn reset(&self) {
        self.st.lock().unwrap().signaled = false;
    }
}

/// A manual- or auto-reset event usable from coroutines and threads.
/// Cheap to clone; clones share one event.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventImpl>,
}

impl Event {
    pub fn new(manual_reset: bool, signaled: bool) -> Self {
        Self {
            inner: Arc::new(EventImpl::new(manual_reset, signaled, 0)),
        }
    }

    /// Block until signaled.
    pub fn wait(&self) {
        self.inner.wait_ms(INFINITE);
    }

    /// Block up to `ms` milliseconds. Returns false on timeout. `0`
    /// polls without blocking; `u32::MAX` waits forever.
    pub fn wait_for(&self, ms: u32) -> bool {
        self.inner.wait_ms(ms)
    }

    pub fn signal(&self) {
        self.inner.signal();
    }

    /// Clear a pending signal (manual-reset events).
    pub fn reset(&self) {
        self.inner.reset();
    }
}

struct SyncState {
    signaled: bool,
    wt: u32,
    sn: u32,
}

/// Thread-only event. The scheduler uses one to join its own loop, so
/// this must not depend on any coroutine machinery.
pub struct SyncEvent {
    st: Mutex<SyncState>,
    cv: Condvar,
    manual: bool,
}

impl SyncEvent {
    pub fn new(manual_reset: bool, signaled: bool) -> Self {
        Self {
            st: Mutex::new(SyncState {
                signaled,
                wt: 0,
                sn: 0,
            }),
            cv: Condvar::new(),
            manual: manual_reset,
        }
    }

    pub fn wait(&self) {
        let mut st = self.st.lock().unwrap();
        if st.signaled {
            if !self.manual {
                st.signaled = false;
            }
            return;
        }
        let sn = st.sn;
        st.wt += 1;
        while st.sn == sn {
            st = self.cv.wait(st).unwrap();
        }
    }

    /// Returns false on timeout.
    pub fn wait_for(&self, ms: u32) -> bool {
        let mut st = self.st.lock().unwrap();
        if st.signaled {
            if !self.manual {
                st.signaled = false;
            }
            return true;
        }
        if ms == 0 {
            return false;
        }
        let sn = st.sn;
        st.wt += 1;
        let deadline = Instant::now() + Duration::from_millis(ms as u64);
        loop {
            if st.sn != sn {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                st.wt -= 1;
                return false;
            }
            st = self.cv.wait_timeout(st, deadline - now).unwrap().0;
        }
    }

    pub fn signal(&self) {
        let mut st = self.st.lock().unwrap();
        if st.wt > 0 {
            st.wt = 0;
            if st.signaled && !self.manual {
                st.signaled = false;
            }
            st.sn = st.sn.wrapping_add(1);
            self.cv.notify_all();
        } else if !st.signaled {
            st.signaled = true;
        }
    }

    pub fn reset(&self) {
        self.st.lock().unwrap().signaled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn initially_signaled_consumes_on_auto_reset() {
        let ev = Event::new(false, true);
        assert!(ev.wait_for(0));
        assert!(!ev.wait_for(0)); // consumed
    }

    #[test]
    fn manual_reset_stays_signaled_until_reset() {
        let ev = Event::new(true, true);
        assert!(ev.wait_for(0));
        assert!(ev.wait_for(0));
        ev.reset();
        assert!(!ev.wait_for(0));
    }

    #[test]
    fn sticky_signal_with_no_waiters() {
        let ev = Event::new(false, false);
        ev.signal();
        assert!(ev.wait_for(0));
        assert!(!ev.wait_for(0));
    }

    #[test]
    fn thread_wait_times_out() {
        let ev = Event::new(false, false);
        let start = Instant::now();
        assert!(!ev.wait_for(30));
        assert!(start.elapsed() >= Duration::from_millis(29));
    }

    #[test]
    fn signal_releases_blocked_thread() {
        let ev = Event::new(false, false);
        let ev2 = ev.clone();
        let h = thread::spawn(move || ev2.wait_for(5000));
        thread::sleep(Duration::from_millis(20));
        ev.signal();
        assert!(h.join().unwrap());
    }

    #[test]
    fn signal_releases_all_threads() {
        let ev = Event::new(true, false);
        let mut handles = vec![];
        for _ in 0..4 {
            let ev = ev.clone();
            handles.push(thread::spawn(move || ev.wait_for(5000)));
        }
        thread::sleep(Duration::from_millis(20));
        ev.signal();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn sync_event_signal_and_wait() {
        let ev = Arc::new(SyncEvent::new(true, false));
        let ev2 = ev.clone();
        let h = thread::spawn(move || ev2.wait());
        thread::sleep(Duration::from_millis(10));
        ev.signal();
        h.join().unwrap();
        // A signal with nobody waiting sticks.
        ev.signal();
        assert!(ev.wait_for(0));
    }

    #[test]
    fn sync_event_timeout() {
        let ev = SyncEvent::new(false, false);
        assert!(!ev.wait_for(20));
    }
}
