// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine-aware mutex.
//!
//! Contended locks park the caller on a FIFO queue that mixes
//! coroutines and OS threads. Unlock hands the mutex directly to the
//! front waiter: a coroutine is pushed onto its scheduler's ready
//! mailbox with the lock already transferred, a thread gets the
//! handoff state plus a condvar nudge. The internal `std` mutex only
//! guards the tiny state word and the queue, never anything blocking.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar};
use std::sync::Mutex as StdMutex;

use crate::sched::coro::CoHandle;
use crate::sched::manager;
use crate::sched::scheduler;

const UNLOCKED: u8 = 0;
const HELD: u8 = 1;
/// Unlock has popped a thread waiter; that thread claims the lock when
/// it observes this on wake.
const HANDOFF: u8 = 2;

struct MutexState {
    lock: u8,
    /// FIFO of waiters; None marks an OS-thread waiter.
    wq: VecDeque<Option<CoHandle>>,
}

struct MutexImpl {
    st: StdMutex<MutexState>,
    cv: Condvar,
}

impl MutexImpl {
    fn lock(&self) {
        match scheduler::current_coroutine() {
            Some(co) => {
                let mut st = self.st.lock().unwrap();
                if st.lock == UNLOCKED {
                    st.lock = HELD;
                    return;
                }
                st.wq.push_back(Some(co));
                drop(st);
                // The unlocker transfers ownership before waking us, so
                // resuming here means the lock is ours.
                scheduler::try_with_current(|c| c.yield_running());
            }
            None => {
                let mut st = self.st.lock().unwrap();
                if st.lock == UNLOCKED {
                    st.lock = HELD;
                    return;
                }
                st.wq.push_back(None);
                loop {
                    st = self.cv.wait(st).unwrap();
                    if st.lock == HANDOFF {
                        st.lock = HELD;
                        return;
                    }
                }
            }
        }
    }

    fn try_lock(&self) -> bool {
        let mut st = self.st.lock().unwrap();
        if st.lock == UNLOCKED {
            st.lock = HELD;
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        let mut st = self.st.lock().unwrap();
        match st.wq.pop_front() {
            None => st.lock = UNLOCKED,
            Some(Some(co)) => {
                // Lock stays held; it now belongs to `co`.
                drop(st);
                manager::add_ready(co);
            }
            Some(None) => {
                st.lock = HANDOFF;
                drop(st);
                self.cv.notify_one();
            }
        }
    }
}

/// A mutual-exclusion lock shareable across coroutines and threads.
/// Clones are handles to the same lock.
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexImpl>,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MutexImpl {
                st: StdMutex::new(MutexState {
                    lock: UNLOCKED,
                    wq: VecDeque::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Acquire the lock, parking the current coroutine (or blocking the
    /// current thread) until it is available.
    pub fn lock(&self) -> MutexGuard<'_> {
        self.inner.lock();
        MutexGuard { owner: &self.inner }
    }

    /// Acquire without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        if self.inner.try_lock() {
            Some(MutexGuard { owner: &self.inner })
        } else {
            None
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the lock on drop.
pub struct MutexGuard<'a> {
    owner: &'a MutexImpl,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.owner.unlock();
    }
}
