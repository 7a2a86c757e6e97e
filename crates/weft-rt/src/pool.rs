// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-scheduler object pool.
//!
//! One free list per scheduler, so pops and pushes from coroutines
//! never contend across threads. An optional create callback services
//! pops from an empty list; an optional destroy callback disposes of
//! pushes beyond the capacity cap.

use std::sync::{Arc, Mutex};

use crate::sched::manager;
use crate::sched::scheduler;
use crate::wait_group::WaitGroup;

type CreateFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type DestroyFn<T> = Box<dyn Fn(T) + Send + Sync>;

struct PoolImpl<T> {
    lists: Box<[Mutex<Vec<T>>]>,
    cap: usize,
    ccb: Option<CreateFn<T>>,
    dcb: Option<DestroyFn<T>>,
}

impl<T> PoolImpl<T> {
    fn drain_list(&self, i: usize) {
        let drained: Vec<T> = {
            let mut list = self.lists[i].lock().unwrap();
            std::mem::take(&mut *list)
        };
        for v in drained {
            match &self.dcb {
                Some(dcb) => dcb(v),
                None => drop(v),
            }
        }
    }
}

/// Pool of reusable `T`s with scheduler-local free lists. Clones share
/// the pool. `pop`, `push` and `size` must be called from a coroutine,
/// where the scheduler id is defined.
pub struct Pool<T: Send + 'static> {
    inner: Arc<PoolImpl<T>>,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// A pool with no callbacks and no capacity cap.
    pub fn new() -> Self {
        Self::build(None, None, usize::MAX)
    }

    /// A pool that creates elements with `ccb` when a pop finds its
    /// list empty, and destroys with `dcb` when a push finds the list
    /// at `cap`.
    pub fn with_callbacks(
        ccb: impl Fn() -> T + Send + Sync + 'static,
        dcb: impl Fn(T) + Send + Sync + 'static,
        cap: usize,
    ) -> Self {
        Self::build(Some(Box::new(ccb)), Some(Box::new(dcb)), cap)
    }

    fn build(ccb: Option<CreateFn<T>>, dcb: Option<DestroyFn<T>>, cap: usize) -> Self {
        let n = manager::manager().scheds().len();
        let lists = (0..n).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            inner: Arc::new(PoolImpl {
                lists,
                cap,
                ccb,
                dcb,
            }),
        }
    }

    fn sched_id(&self, what: &str) -> usize {
        scheduler::current_coroutine()
            .unwrap_or_else(|| panic!("Pool::{} must be called from a coroutine", what))
            .sched as usize
    }

    /// Take an element from this scheduler's list, or create one.
    pub fn pop(&self) -> Option<T> {
        let i = self.sched_id("pop");
        let from_list = self.inner.lists[i].lock().unwrap().pop();
        from_list.or_else(|| self.inner.ccb.as_ref().map(|ccb| ccb()))
    }

    /// Return an element to this scheduler's list; over-capacity pushes
    /// go to the destroy callback instead.
    pub fn push(&self, v: T) {
        let i = self.sched_id("push");
        let mut list = self.inner.lists[i].lock().unwrap();
        if list.len() < self.inner.cap || self.inner.dcb.is_none() {
            list.push(v);
        } else {
            drop(list);
            // Cap reached; dispose instead of growing.
            (self.inner.dcb.as_ref().unwrap())(v);
        }
    }

    /// Elements currently cached for this scheduler.
    pub fn size(&self) -> usize {
        let i = self.sched_id("size");
        self.inner.lists[i].lock().unwrap().len()
    }

    /// Empty every scheduler's list. While the runtime is active, one
    /// coroutine per scheduler drains its own list under a wait-group
    /// barrier; otherwise the lists are drained inline.
    pub fn clear(&self) {
        if manager::is_active() {
            let scheds = manager::manager().scheds();
            let wg = WaitGroup::new(scheds.len() as u32);
            for s in scheds {
                let wg = wg.clone();
                let inner = self.inner.clone();
                s.push_task(Box::new(move || {
                    let i = scheduler::current_coroutine()
                        .expect("pool drain runs as a coroutine")
                        .sched as usize;
                    inner.drain_list(i);
                    wg.done();
                }));
            }
            wg.wait();
        } else {
            for i in 0..self.inner.lists.len() {
                self.inner.drain_list(i);
            }
        }
    }
}

impl<T: Send + 'static> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}
