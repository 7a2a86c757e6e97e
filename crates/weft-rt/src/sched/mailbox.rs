// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task mailboxes.
//!
//! Two MPSC queues feed each scheduler: closures not yet running as
//! coroutines, and live coroutines made ready by another thread.
//! Producers are arbitrary threads; the only consumer is the owning
//! scheduler, which drains both queues with one lock and a buffer swap.

use std::mem;
use std::sync::Mutex;

use super::coro::CoIdx;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

struct Inner {
    new_q: Vec<Task>,
    ready_q: Vec<CoIdx>,
}

pub(crate) struct Mailbox {
    inner: Mutex<Inner>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                new_q: Vec::new(),
                ready_q: Vec::new(),
            }),
        }
    }

    /// Queue a closure to be spawned. Returns true when the mailbox was
    /// empty, i.e. the scheduler may be asleep and needs a wake signal.
    pub fn push_new(&self, task: Task) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let was_empty = inner.new_q.is_empty() && inner.ready_q.is_empty();
        inner.new_q.push(task);
        was_empty
    }

    /// Queue a suspended coroutine for resumption. Same wake contract
    /// as `push_new`.
    pub fn push_ready(&self, co: CoIdx) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let was_empty = inner.new_q.is_empty() && inner.ready_q.is_empty();
        inner.ready_q.push(co);
        was_empty
    }

    /// Swap both queues out under a single lock. The caller's buffers
    /// must be empty; their capacity is donated to the mailbox, which
    /// is how drain buffers get reused across iterations.
    pub fn drain(&self, new_out: &mut Vec<Task>, ready_out: &mut Vec<CoIdx>) {
        debug_assert!(new_out.is_empty() && ready_out.is_empty());
        let mut inner = self.inner.lock().unwrap();
        mem::swap(&mut inner.new_q, new_out);
        mem::swap(&mut inner.ready_q, ready_out);
    }
}
