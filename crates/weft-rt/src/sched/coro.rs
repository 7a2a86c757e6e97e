// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine descriptors and the per-scheduler descriptor pool.
//!
//! Descriptors live in a scheduler-local slab and are addressed by a
//! stable local index; recycled descriptors keep their index and spill
//! buffer. Index 0 is reserved for the scheduler's own main context.

use std::os::raw::c_void;
use std::ptr;
use std::sync::Arc;

use super::timer::TimerId;
use super::wait::WaitState;

pub(crate) type CoIdx = u32;

/// Opaque, thread-safe reference to a coroutine: the owning scheduler
/// plus the local descriptor index. This is what wait queues, mailboxes
/// and user code hold; only the owning scheduler touches the descriptor
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoHandle {
    pub(crate) sched: u32,
    pub(crate) idx: CoIdx,
}

impl CoHandle {
    /// The coroutine's process-unique id: scheduler id in the high
    /// bits, local index in the low bits.
    pub fn id(self) -> u64 {
        ((self.sched as u64) << 32) | self.idx as u64
    }
}

pub(crate) struct Coroutine {
    /// Saved machine context; null until the first suspension and while
    /// the closure has not started.
    pub ctx: *mut c_void,
    /// Closure to run on first resume. Taken by the trampoline.
    pub closure: Option<Box<dyn FnOnce() + Send>>,
    /// Evacuated stack bytes while another coroutine occupies our slot.
    pub spill: Vec<u8>,
    /// Wait record state while parked on a primitive or channel.
    pub waitx: Option<Arc<WaitState>>,
    /// Pending timer wheel entry, if any.
    pub timer: Option<TimerId>,
}

impl Coroutine {
    fn empty() -> Self {
        Self {
            ctx: ptr::null_mut(),
            closure: None,
            spill: Vec::new(),
            waitx: None,
            timer: None,
        }
    }
}

/// Slab of descriptors with an index free list. Never shrinks; a
/// descriptor's index stays stable for the lifetime of the pool.
pub(crate) struct CoPool {
    cos: Vec<Coroutine>,
    free: Vec<CoIdx>,
}

impl CoPool {
    pub fn new() -> Self {
        // Slot 0 stands in for the scheduler's main context.
        Self {
            cos: vec![Coroutine::empty()],
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, closure: Box<dyn FnOnce() + Send>) -> CoIdx {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.cos.push(Coroutine::empty());
                (self.cos.len() - 1) as CoIdx
            }
        };
        self.cos[idx as usize].closure = Some(closure);
        idx
    }

    pub fn get(&mut self, idx: CoIdx) -> &mut Coroutine {
        &mut self.cos[idx as usize]
    }

    /// Return a descriptor to the free list. The spill buffer keeps its
    /// capacity for the next occupant.
    pub fn recycle(&mut self, idx: CoIdx) {
        debug_assert_ne!(idx, 0);
        let co = &mut self.cos[idx as usize];
        co.ctx = ptr::null_mut();
        co.closure = None;
        co.spill.clear();
        co.waitx = None;
        co.timer = None;
        self.free.push(idx);
    }
}
