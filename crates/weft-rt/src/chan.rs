// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded channel.
//!
//! A ring of `cap` elements behind one mutex, with a FIFO queue of wait
//! records that holds writers while the ring is full and readers while
//! it is empty, never both. Writers parked with a value move it into
//! the record first, because a suspended coroutine's stack may be
//! evacuated from its slot. Every operation reports success through a
//! per-thread done flag, readable via [`Chan::done`].
//!
//! Timeouts use the same wait-record race as the events: the consumer
//! side claims a record with WAIT→READY, the timer (or a waiting
//! thread's own deadline) with WAIT→TIMEOUT; exactly one wins.

use std::cell::Cell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sched::coro::CoHandle;
use crate::sched::manager;
use crate::sched::scheduler;
use crate::sched::wait::{WaitState, INFINITE};

thread_local! {
    static DONE: Cell<bool> = const { Cell::new(false) };
}

fn set_done(v: bool) {
    DONE.with(|d| d.set(v));
}

const PENDING: u8 = 0;
const DELIVERED: u8 = 1;
const CLOSED: u8 = 2;

struct ChanWaiter<T> {
    /// None marks an OS-thread waiter.
    co: Option<CoHandle>,
    state: Arc<WaitState>,
    /// Element in flight: a parked writer's pending value, or the slot
    /// a parked reader receives into.
    slot: Mutex<Option<T>>,
    /// PENDING until the record is served: DELIVERED on a handoff,
    /// CLOSED when the channel shut down underneath a reader.
    outcome: AtomicU8,
}

impl<T> ChanWaiter<T> {
    fn new(co: Option<CoHandle>, value: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            co,
            state: Arc::new(WaitState::new()),
            slot: Mutex::new(value),
            outcome: AtomicU8::new(PENDING),
        })
    }
}

struct Ring<T> {
    buf: Box<[MaybeUninit<T>]>,
    rx: usize,
    wx: usize,
    full: bool,
}

impl<T> Ring<T> {
    fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            buf: (0..cap).map(|_| MaybeUninit::uninit()).collect(),
            rx: 0,
            wx: 0,
            full: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.rx == self.wx && !self.full
    }

    fn is_full(&self) -> bool {
        self.full
    }

    fn push(&mut self, v: T) {
        debug_assert!(!self.full);
        self.buf[self.wx].write(v);
        self.wx = (self.wx + 1) % self.buf.len();
        if self.wx == self.rx {
            self.full = true;
        }
    }

    fn pop(&mut self) -> T {
        debug_assert!(!self.is_empty());
        // SAFETY: the slot at rx was initialized by a prior push and is
        // vacated here exactly once.
        let v = unsafe { self.buf[self.rx].assume_init_read() };
        self.rx = (self.rx + 1) % self.buf.len();
        self.full = false;
        v
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while !self.is_empty() {
            drop(self.pop());
        }
    }
}

struct ChanState<T> {
    ring: Ring<T>,
    wq: VecDeque<Arc<ChanWaiter<T>>>,
}

struct ChanImpl<T> {
    ms: u32,
    st: Mutex<ChanState<T>>,
    cv: Condvar,
    /// 0 open, 1 close in progress, 2 closed.
    closed: AtomicU8,
}

/// A bounded channel for `T`. Clones are handles to the same channel;
/// any mix of coroutines and threads may read and write.
pub struct Chan<T: Send> {
    inner: Arc<ChanImpl<T>>,
}

impl<T: Send> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> Chan<T> {
    /// A channel holding up to `cap` elements (0 is coerced to 1).
    /// Blocking operations wait forever.
    pub fn new(cap: usize) -> Self {
        Self::with_timeout(cap, INFINITE)
    }

    /// Like [`Chan::new`] but every blocking read/write gives up after
    /// `ms` milliseconds (`u32::MAX` waits forever).
    pub fn with_timeout(cap: usize, ms: u32) -> Self {
        Self {
            inner: Arc::new(ChanImpl {
                ms,
                st: Mutex::new(ChanState {
                    ring: Ring::new(cap),
                    wq: VecDeque::new(),
                }),
                cv: Condvar::new(),
                closed: AtomicU8::new(0),
            }),
        }
    }

    /// Whether the last channel operation on this thread succeeded.
    pub fn done(&self) -> bool {
        DONE.with(|d| d.get())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) != 0
    }

    /// Send a value. Blocks while the ring is full; on timeout or on a
    /// closed channel the value is dropped and [`Chan::done`] reports
    /// false.
    pub fn write(&self, v: T) {
        self.inner.write(v);
    }

    /// Receive a value. `None` means timeout or channel closed (and
    /// drained); [`Chan::done`] distinguishes success.
    pub fn read(&self) -> Option<T> {
        self.inner.read()
    }

    /// Close the channel. Idempotent and safe to race: the first caller
    /// drains parked readers with closed status, concurrent callers
    /// wait until that drain finished. Buffered elements stay readable.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<T: Send> ChanImpl<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) != 0
    }

    fn write(&self, v: T) {
        let mut st = self.st.lock().unwrap();
        if self.is_closed() {
            set_done(false);
            return;
        }

        // Room in the ring and nobody starving: buffer it.
        if !st.ring.is_empty() && !st.ring.is_full() {
            st.ring.push(v);
            set_done(true);
            return;
        }

        if st.ring.is_empty() {
            // Hand off to the first reader still waiting.
            while let Some(w) = st.wq.pop_front() {
                if w.state.try_ready() {
                    *w.slot.lock().unwrap() = Some(v);
                    w.outcome.store(DELIVERED, Ordering::Release);
                    match w.co {
                        Some(co) => {
                            drop(st);
                            manager::add_ready(co);
                        }
                        None => {
                            self.cv.notify_all();
                            drop(st);
                        }
                    }
                    set_done(true);
                    return;
                }
                // Timed-out reader; drop the stale record.
            }
            st.ring.push(v);
            set_done(true);
            return;
        }

        // Ring is full: park.
        match scheduler::current_coroutine() {
            Some(co) => {
                let w = ChanWaiter::new(Some(co), Some(v));
                st.wq.push_back(w.clone());
                drop(st);
                let timed_out = scheduler::suspend_current(w.state.clone(), self.ms);
                if timed_out {
                    // Our value is still in the record and is dropped
                    // with it.
                    set_done(false);
                } else {
                    debug_assert_eq!(w.outcome.load(Ordering::Acquire), DELIVERED);
                    set_done(true);
                }
            }
            None => {
                let w = ChanWaiter::new(None, Some(v));
                st.wq.push_back(w.clone());
                let deadline = deadline_after(self.ms);
                loop {
                    st = match wait_step(&self.cv, st, deadline) {
                        (g, false) => g,
                        (g, true) => {
                            if w.outcome.load(Ordering::Acquire) == DELIVERED {
                                set_done(true);
                                return;
                            }
                            if w.state.try_timeout() {
                                set_done(false);
                                return;
                            }
                            g
                        }
                    };
                    if w.outcome.load(Ordering::Acquire) == DELIVERED {
                        set_done(true);
                        return;
                    }
                }
            }
        }
    }

    fn read(&self) -> Option<T> {
        let mut st = self.st.lock().unwrap();

        if !st.ring.is_empty() && !st.ring.is_full() {
            let v = st.ring.pop();
            set_done(true);
            return Some(v);
        }

        if st.ring.is_full() {
            let v = st.ring.pop();
            // Promote the longest-waiting writer into the vacated slot.
            while let Some(w) = st.wq.pop_front() {
                if w.state.try_ready() {
                    let pending = w.slot.lock().unwrap().take();
                    st.ring
                        .push(pending.expect("parked writer record without a value"));
                    w.outcome.store(DELIVERED, Ordering::Release);
                    match w.co {
                        Some(co) => {
                            drop(st);
                            manager::add_ready(co);
                        }
                        None => {
                            self.cv.notify_all();
                            drop(st);
                        }
                    }
                    set_done(true);
                    return Some(v);
                }
            }
            set_done(true);
            return Some(v);
        }

        // Ring is empty.
        if self.is_closed() {
            set_done(false);
            return None;
        }
        match scheduler::current_coroutine() {
            Some(co) => {
                let w = ChanWaiter::new(Some(co), None);
                st.wq.push_back(w.clone());
                drop(st);
                let timed_out = scheduler::suspend_current(w.state.clone(), self.ms);
                if timed_out {
                    set_done(false);
                    return None;
                }
                match w.outcome.load(Ordering::Acquire) {
                    DELIVERED => {
                        set_done(true);
                        Some(w.slot.lock().unwrap().take().expect("delivered without value"))
                    }
                    _ => {
                        // Channel closed under us.
                        set_done(false);
                        None
                    }
                }
            }
            None => {
                let w = ChanWaiter::new(None, None);
                st.wq.push_back(w.clone());
                let deadline = deadline_after(self.ms);
                loop {
                    st = match wait_step(&self.cv, st, deadline) {
                        (g, false) => g,
                        (g, true) => {
                            match w.outcome.load(Ordering::Acquire) {
                                DELIVERED => {
                                    set_done(true);
                                    return Some(
                                        w.slot.lock().unwrap().take().expect("delivered without value"),
                                    );
                                }
                                CLOSED => {
                                    set_done(false);
                                    return None;
                                }
                                _ => {}
                            }
                            if w.state.try_timeout() {
                                set_done(false);
                                return None;
                            }
                            g
                        }
                    };
                    match w.outcome.load(Ordering::Acquire) {
                        DELIVERED => {
                            set_done(true);
                            return Some(
                                w.slot.lock().unwrap().take().expect("delivered without value"),
                            );
                        }
                        CLOSED => {
                            set_done(false);
                            return None;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn close(&self) {
        match self
            .closed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let mut to_wake: Vec<CoHandle> = Vec::new();
                {
                    let mut st = self.st.lock().unwrap();
                    if st.ring.is_empty() {
                        // Only readers can be parked on an empty ring;
                        // stamp them closed.
                        let mut notify = false;
                        while let Some(w) = st.wq.pop_front() {
                            if w.state.try_ready() {
                                w.outcome.store(CLOSED, Ordering::Release);
                                match w.co {
                                    Some(co) => to_wake.push(co),
                                    None => notify = true,
                                }
                            }
                        }
                        if notify {
                            self.cv.notify_all();
                        }
                    }
                    self.closed.store(2, Ordering::Release);
                }
                for co in to_wake {
                    manager::add_ready(co);
                }
            }
            Err(1) => {
                // Another closer is mid-drain; wait it out.
                while self.closed.load(Ordering::Acquire) != 2 {
                    crate::sleep(1);
                }
            }
            Err(_) => {}
        }
    }
}

fn deadline_after(ms: u32) -> Option<Instant> {
    (ms != INFINITE).then(|| Instant::now() + Duration::from_millis(ms as u64))
}

/// One condvar wait step against an optional deadline. Returns the
/// reacquired guard and whether the deadline has passed.
fn wait_step<'a, T>(
    cv: &Condvar,
    guard: std::sync::MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> (std::sync::MutexGuard<'a, T>, bool) {
    match deadline {
        None => (cv.wait(guard).unwrap(), false),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return (guard, true);
            }
            let (g, _) = cv.wait_timeout(guard, d - now).unwrap();
            (g, Instant::now() >= d)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn buffered_write_then_read() {
        let ch = Chan::<i32>::new(4);
        ch.write(7);
        assert!(ch.done());
        assert_eq!(ch.read(), Some(7));
        assert!(ch.done());
    }

    #[test]
    fn fifo_order_per_direction() {
        let ch = Chan::<i32>::new(8);
        for i in 0..8 {
            ch.write(i);
        }
        for i in 0..8 {
            assert_eq!(ch.read(), Some(i));
        }
    }

    #[test]
    fn capacity_zero_still_buffers_one() {
        let ch = Chan::<i32>::new(0);
        ch.write(42);
        assert!(ch.done());
        assert_eq!(ch.read(), Some(42));
    }

    #[test]
    fn read_timeout_on_empty() {
        let ch = Chan::<i32>::with_timeout(2, 20);
        let start = Instant::now();
        assert_eq!(ch.read(), None);
        assert!(!ch.done());
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn write_timeout_on_full_drops_value() {
        let ch = Chan::<Arc<i32>>::with_timeout(1, 20);
        let v = Arc::new(1);
        ch.write(v.clone());
        assert!(ch.done());
        let parked = Arc::new(2);
        ch.write(parked.clone());
        assert!(!ch.done());
        // The next read pops the stale record and drops its value.
        assert_eq!(ch.read().as_deref(), Some(&1));
        assert_eq!(Arc::strong_count(&parked), 1);
    }

    #[test]
    fn cross_thread_handoff() {
        let ch = Chan::<i32>::new(1);
        let tx = ch.clone();
        let h = thread::spawn(move || {
            for i in 0..100 {
                tx.write(i);
            }
        });
        for i in 0..100 {
            assert_eq!(ch.read(), Some(i));
        }
        h.join().unwrap();
    }

    #[test]
    fn close_fails_writes_and_drains_reads() {
        let ch = Chan::<i32>::new(8);
        for i in 0..5 {
            ch.write(i);
        }
        ch.close();
        assert!(ch.is_closed());
        ch.write(99);
        assert!(!ch.done());
        for i in 0..5 {
            assert_eq!(ch.read(), Some(i));
            assert!(ch.done());
        }
        assert_eq!(ch.read(), None);
        assert!(!ch.done());
    }

    #[test]
    fn close_is_idempotent() {
        let ch = Chan::<i32>::new(1);
        ch.close();
        ch.close();
        assert!(ch.is_closed());
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let ch = Chan::<i32>::new(1);
        let rx = ch.clone();
        let h = thread::spawn(move || rx.read());
        thread::sleep(Duration::from_millis(20));
        ch.close();
        assert_eq!(h.join().unwrap(), None);
    }

    #[test]
    fn drop_releases_buffered_elements() {
        let v = Arc::new(0);
        let ch = Chan::<Arc<i32>>::new(4);
        ch.write(v.clone());
        ch.write(v.clone());
        assert_eq!(Arc::strong_count(&v), 3);
        drop(ch);
        assert_eq!(Arc::strong_count(&v), 1);
    }
}
