// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The per-thread scheduler: event loop, resume/yield, stack shuffling.
//!
//! Each scheduler owns its coroutine pool, stack arena, timer wheel and
//! epoll instance outright; the only cross-thread surface is
//! [`SchedShared`] (mailbox, CPU-time counter, stop plumbing). One loop
//! iteration: poll the backend, dispatch I/O readiness, drain the
//! mailbox (new closures, then ready coroutines), then fire due timers
//! with the timeout flag raised.

use std::cell::{Cell, UnsafeCell};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::event::SyncEvent;

use super::context::{self, Transfer};
use super::coro::{CoHandle, CoIdx, CoPool};
use super::epoll::{Epoll, Ev, WakeHandle};
use super::mailbox::{Mailbox, Task};
use super::stack::{StackArena, StackSlot};
use super::timer::{now_ms, TimerWheel};
use super::wait::{WaitState, INFINITE};

macro_rules! sched_trace {
    ($core:expr, $($arg:tt)*) => {
        if $core.log {
            log::trace!(target: "weft::sched", $($arg)*);
        }
    };
}

/// The cross-thread face of a scheduler. Producers push work and wake
/// the loop; `stop` tears it down.
pub(crate) struct SchedShared {
    pub id: u32,
    pub mailbox: Mailbox,
    cputime: AtomicI64,
    stopped: AtomicBool,
    started: AtomicBool,
    stop_ev: SyncEvent,
    wake: WakeHandle,
}

impl SchedShared {
    /// Queue a closure to run as a new coroutine on this scheduler.
    pub fn push_task(&self, task: Task) {
        if self.mailbox.push_new(task) {
            self.wake.signal();
        }
    }

    /// Queue a suspended coroutine of this scheduler for resumption.
    pub fn push_ready(&self, co: CoIdx) {
        if self.mailbox.push_ready(co) {
            self.wake.signal();
        }
    }

    /// Cumulative loop time in microseconds; the manager's load metric.
    pub fn cputime(&self) -> i64 {
        self.cputime.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Ask the loop to exit and wait until it has. Idempotent; later
    /// callers return without waiting. Coroutines still parked when the
    /// loop exits are abandoned.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.wake.signal();
            if self.started.load(Ordering::Acquire) {
                self.stop_ev.wait();
            }
        }
    }
}

/// Scheduler-local state. Only the loop thread touches the
/// `UnsafeCell` fields; every access is a short, scoped borrow so that
/// nothing is held across a context jump.
pub(crate) struct SchedCore {
    shared: Arc<SchedShared>,
    sched_num: u32,
    log: bool,
    pool: UnsafeCell<CoPool>,
    arena: UnsafeCell<StackArena>,
    timers: UnsafeCell<TimerWheel>,
    epoll: UnsafeCell<Epoll>,
    running: Cell<CoIdx>,
    timeout_flag: Cell<bool>,
    wait_ms: Cell<i32>,
    main_ctx: Cell<*mut c_void>,
}

// SAFETY: the core is created on one thread and handed to the thread
// that runs its loop; after that, the UnsafeCell/Cell fields are only
// touched from that thread. Cross-thread traffic goes through the
// Sync `SchedShared`.
unsafe impl Send for SchedCore {}

thread_local! {
    static CURRENT: Cell<*const SchedCore> = const { Cell::new(ptr::null()) };
}

/// Run `f` against the scheduler owning the current thread, if any.
pub(crate) fn try_with_current<R>(f: impl FnOnce(&SchedCore) -> R) -> Option<R> {
    let p = CURRENT.with(|c| c.get());
    if p.is_null() {
        None
    } else {
        // SAFETY: the pointer is installed for the duration of
        // SchedCore::run on this very thread and cleared on exit.
        Some(f(unsafe { &*p }))
    }
}

/// The coroutine executing on the current thread, if any.
pub(crate) fn current_coroutine() -> Option<CoHandle> {
    try_with_current(|c| c.running_handle()).flatten()
}

/// Park the running coroutine on a wait record: publish the record for
/// the timer wheel, optionally arm a timer, and yield. Returns true if
/// the timer claimed the record.
pub(crate) fn suspend_current(state: Arc<WaitState>, ms: u32) -> bool {
    try_with_current(|core| {
        core.set_running_waitx(Some(state));
        if ms != INFINITE {
            core.add_timer_running(ms);
        }
        core.yield_running();
        core.set_running_waitx(None);
        core.timeout()
    })
    .expect("cannot suspend outside a scheduler thread")
}

impl SchedCore {
    pub(crate) fn new(id: u32, cfg: &Config) -> std::io::Result<Box<SchedCore>> {
        let epoll = Epoll::new()?;
        let wake = epoll.wake_handle();
        let shared = Arc::new(SchedShared {
            id,
            mailbox: Mailbox::new(),
            cputime: AtomicI64::new(0),
            stopped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stop_ev: SyncEvent::new(true, false),
            wake,
        });
        Ok(Box::new(SchedCore {
            shared,
            sched_num: cfg.sched_num,
            log: cfg.sched_log,
            pool: UnsafeCell::new(CoPool::new()),
            arena: UnsafeCell::new(StackArena::new(cfg.stack_num, cfg.stack_size)),
            timers: UnsafeCell::new(TimerWheel::new()),
            epoll: UnsafeCell::new(epoll),
            running: Cell::new(0),
            timeout_flag: Cell::new(false),
            wait_ms: Cell::new(-1),
            main_ctx: Cell::new(ptr::null_mut()),
        }))
    }

    pub(crate) fn shared(&self) -> &Arc<SchedShared> {
        &self.shared
    }

    /// The event loop. Returns when `stop` was requested.
    pub(crate) fn run(&self) {
        CURRENT.with(|c| c.set(self as *const SchedCore));
        self.shared.started.store(true, Ordering::Release);
        let multi = self.sched_num > 1;
        let mut new_tasks: Vec<Task> = Vec::with_capacity(512);
        let mut ready: Vec<CoIdx> = Vec::with_capacity(512);
        let mut due: Vec<CoIdx> = Vec::with_capacity(512);

        while !self.shared.is_stopped() {
            let n = {
                // SAFETY: loop-thread exclusive access.
                let epoll = unsafe { &mut *self.epoll.get() };
                match epoll.wait(self.wait_ms.get()) {
                    Ok(n) => n,
                    Err(e) => {
                        log::error!(
                            target: "weft::sched",
                            "sched-{}: backend wait failed: {}",
                            self.shared.id,
                            e
                        );
                        continue;
                    }
                }
            };
            if self.shared.is_stopped() {
                break;
            }
            let iter_start = if multi { Some(Instant::now()) } else { None };

            // I/O readiness first. The epoll borrow must end before a
            // resumed coroutine can re-register events.
            for i in 0..n {
                let (rco, wco) = {
                    // SAFETY: loop-thread exclusive access, scoped borrow.
                    let epoll = unsafe { &*self.epoll.get() };
                    let (fd, readable, writable) = epoll.event(i);
                    if epoll.is_wake(fd) {
                        epoll.drain_wake();
                        continue;
                    }
                    (
                        if readable { epoll.waiter(fd, Ev::Read) } else { 0 },
                        if writable { epoll.waiter(fd, Ev::Write) } else { 0 },
                    )
                };
                if rco != 0 {
                    self.wake_io(rco);
                }
                if wco != 0 {
                    self.wake_io(wco);
                }
            }

            // Then the mailbox: new closures before ready coroutines.
            self.shared.mailbox.drain(&mut new_tasks, &mut ready);
            let (cap, len) = (new_tasks.capacity(), new_tasks.len());
            for task in new_tasks.drain(..) {
                // SAFETY: loop-thread exclusive access.
                let idx = {
                    let pool = unsafe { &mut *self.pool.get() };
                    pool.alloc(task)
                };
                sched_trace!(self, "sched-{}: spawn co {}", self.shared.id, idx);
                self.resume(idx);
            }
            if cap >= 8192 && len <= cap / 2 {
                new_tasks = Vec::with_capacity(len.max(512));
            }
            let (cap, len) = (ready.capacity(), ready.len());
            for idx in ready.drain(..) {
                self.resume(idx);
            }
            if cap >= 8192 && len <= cap / 2 {
                ready = Vec::with_capacity(len.max(512));
            }

            // Timers last; the batch resumes with the timeout flag up.
            let next = {
                // SAFETY: loop-thread exclusive access; the wheel and the
                // pool are distinct fields.
                let timers = unsafe { &mut *self.timers.get() };
                let pool = unsafe { &mut *self.pool.get() };
                timers.check_due(now_ms(), pool, &mut due)
            };
            self.wait_ms.set(next);
            if !due.is_empty() {
                self.timeout_flag.set(true);
                for idx in due.drain(..) {
                    self.resume(idx);
                }
                self.timeout_flag.set(false);
            }

            self.running.set(0);
            if let Some(t0) = iter_start {
                self.shared
                    .cputime
                    .fetch_add(t0.elapsed().as_micros() as i64, Ordering::Relaxed);
            }
        }

        CURRENT.with(|c| c.set(ptr::null()));
        self.shared.stop_ev.signal();
    }

    /// An fd became ready for `idx`. If the coroutine parked with a
    /// wait record, the signaler CAS decides against a racing timer.
    fn wake_io(&self, idx: CoIdx) {
        let claimed = {
            // SAFETY: loop-thread exclusive access.
            let pool = unsafe { &mut *self.pool.get() };
            match &pool.get(idx).waitx {
                Some(state) => state.try_ready(),
                None => true,
            }
        };
        if claimed {
            self.resume(idx);
        }
    }

    /// Jump into a coroutine. Handles the three cases: first entry
    /// (build a context on the slot, evicting its occupant), resumption
    /// (cancel timer, reload evacuated stack bytes), and, after the
    /// jump returns, yield vs termination.
    fn resume(&self, idx: CoIdx) {
        self.running.set(idx);
        let target = {
            // SAFETY: loop-thread exclusive access; these borrows end
            // before the jump below.
            let pool = unsafe { &mut *self.pool.get() };
            let arena = unsafe { &mut *self.arena.get() };
            let slot_i = arena.slot_index(idx);
            if let Err(e) = arena.ensure_mapped(slot_i) {
                panic!(
                    "sched-{}: failed to map coroutine stack: {}",
                    self.shared.id, e
                );
            }
            if !pool.get(idx).ctx.is_null() {
                if let Some(t) = pool.get(idx).timer.take() {
                    // SAFETY: as above; wheel is a distinct field.
                    let timers = unsafe { &mut *self.timers.get() };
                    timers.cancel(&t);
                }
            }
            let owner = arena.slot(slot_i).owner;
            if owner != idx {
                if owner != 0 {
                    Self::evacuate(pool, arena.slot(slot_i), owner);
                }
                arena.slot_mut(slot_i).owner = idx;
            }
            let (base, size, top) = {
                let slot = arena.slot(slot_i);
                (slot.base(), slot.size(), slot.top())
            };
            let co = pool.get(idx);
            if co.ctx.is_null() {
                sched_trace!(self, "sched-{}: first resume of co {}", self.shared.id, idx);
                // SAFETY: the slot is mapped and now owned by `idx`.
                co.ctx = unsafe { context::make_context(base, size, co_entry) };
            } else if !co.spill.is_empty() {
                let sp = co.ctx as usize;
                if sp + co.spill.len() != top as usize {
                    panic!(
                        "sched-{}: stack restore corrupted for co {}",
                        self.shared.id, idx
                    );
                }
                // SAFETY: [sp, top) is inside the mapped slot this
                // coroutine previously occupied, now vacant again.
                unsafe {
                    ptr::copy_nonoverlapping(co.spill.as_ptr(), sp as *mut u8, co.spill.len());
                }
                co.spill.clear();
            }
            co.ctx
        };
        // SAFETY: `target` is a context living on this scheduler's arena
        // (or the spill-restored image of one).
        let t = unsafe { context::jump_context(target, ptr::null_mut()) };
        let idx = self.running.get();
        if !t.arg.is_null() {
            // SAFETY: loop-thread exclusive access.
            let pool = unsafe { &mut *self.pool.get() };
            pool.get(idx).ctx = t.ctx;
            sched_trace!(self, "sched-{}: co {} yielded", self.shared.id, idx);
        } else {
            // SAFETY: loop-thread exclusive access.
            let pool = unsafe { &mut *self.pool.get() };
            let arena = unsafe { &mut *self.arena.get() };
            let slot_i = arena.slot_index(idx);
            if arena.slot(slot_i).owner == idx {
                arena.slot_mut(slot_i).owner = 0;
            }
            pool.recycle(idx);
            sched_trace!(self, "sched-{}: recycled co {}", self.shared.id, idx);
        }
    }

    /// Copy the live stack bytes of `owner` out of `slot` into its
    /// spill buffer, so the slot can host another coroutine.
    fn evacuate(pool: &mut CoPool, slot: &StackSlot, owner: CoIdx) {
        let co = pool.get(owner);
        let top = slot.top() as usize;
        let sp = co.ctx as usize;
        debug_assert!(sp > slot.base() as usize && sp <= top);
        let len = top - sp;
        co.spill.clear();
        // SAFETY: [sp, top) is the live portion of the suspended
        // coroutine's stack inside the mapped slot.
        let bytes = unsafe { std::slice::from_raw_parts(sp as *const u8, len) };
        co.spill.extend_from_slice(bytes);
    }

    /// Jump back to the scheduler's main context. Only legal on a
    /// coroutine stack.
    pub(crate) fn yield_running(&self) {
        let idx = self.running.get();
        debug_assert_ne!(idx, 0, "yield outside a coroutine");
        let marker = idx as usize as *mut c_void;
        // SAFETY: main_ctx is the scheduler context that last resumed us.
        let t = unsafe { context::jump_context(self.main_ctx.get(), marker) };
        // Resumed again: the scheduler suspended at a fresh location.
        self.main_ctx.set(t.ctx);
    }

    pub(crate) fn running_handle(&self) -> Option<CoHandle> {
        let idx = self.running.get();
        (idx != 0).then(|| CoHandle {
            sched: self.shared.id,
            idx,
        })
    }

    /// Did the last resume happen because a timer fired?
    pub(crate) fn timeout(&self) -> bool {
        self.timeout_flag.get()
    }

    pub(crate) fn add_timer_running(&self, ms: u32) {
        let idx = self.running.get();
        debug_assert_ne!(idx, 0, "timer outside a coroutine");
        // SAFETY: loop-thread exclusive access.
        let timers = unsafe { &mut *self.timers.get() };
        let id = timers.add(now_ms() + ms as u64, idx);
        let pool = unsafe { &mut *self.pool.get() };
        pool.get(idx).timer = Some(id);
    }

    pub(crate) fn set_running_waitx(&self, state: Option<Arc<WaitState>>) {
        let idx = self.running.get();
        debug_assert_ne!(idx, 0, "wait record outside a coroutine");
        // SAFETY: loop-thread exclusive access.
        let pool = unsafe { &mut *self.pool.get() };
        pool.get(idx).waitx = state;
    }

    /// Whether `p` points into the running coroutine's stack slot.
    pub(crate) fn on_stack(&self, p: *const u8) -> bool {
        let idx = self.running.get();
        debug_assert_ne!(idx, 0, "on_stack outside a coroutine");
        // SAFETY: loop-thread exclusive access.
        let arena = unsafe { &*self.arena.get() };
        let slot = arena.slot(arena.slot_index(idx));
        let p = p as usize;
        p >= slot.base() as usize && p < slot.top() as usize
    }

    pub(crate) fn sleep_running(&self, ms: u32) {
        self.add_timer_running(ms);
        self.yield_running();
    }

    pub(crate) fn add_io_event(&self, fd: RawFd, ev: Ev) -> bool {
        let idx = self.running.get();
        debug_assert_ne!(idx, 0, "io event outside a coroutine");
        // SAFETY: loop-thread exclusive access.
        let epoll = unsafe { &mut *self.epoll.get() };
        match epoll.add_ev(fd, ev, idx) {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    target: "weft::sched",
                    "sched-{}: add_ev({}, {:?}) failed: {}",
                    self.shared.id,
                    fd,
                    ev,
                    e
                );
                false
            }
        }
    }

    pub(crate) fn del_io_event(&self, fd: RawFd, ev: Ev) {
        // SAFETY: loop-thread exclusive access.
        let epoll = unsafe { &mut *self.epoll.get() };
        epoll.del_ev(fd, ev);
    }

    pub(crate) fn del_io_events(&self, fd: RawFd) {
        // SAFETY: loop-thread exclusive access.
        let epoll = unsafe { &mut *self.epoll.get() };
        epoll.del_ev_all(fd);
    }
}

/// Trampoline every coroutine starts in: stash the scheduler context,
/// run the closure with panic isolation, then jump back with a null
/// argument to report termination.
extern "C" fn co_entry(t: Transfer) -> ! {
    let core = CURRENT.with(|c| c.get());
    debug_assert!(!core.is_null());
    // SAFETY: a fresh context is only entered from resume() on the
    // scheduler thread, where CURRENT is installed.
    let core = unsafe { &*core };
    core.main_ctx.set(t.ctx);
    let idx = core.running.get();
    let closure = {
        // SAFETY: loop-thread exclusive access (we are the running
        // coroutine of this scheduler's thread).
        let pool = unsafe { &mut *core.pool.get() };
        pool.get(idx).closure.take()
    };
    if let Some(f) = closure {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            log::error!(
                target: "weft::sched",
                "sched-{}: coroutine {} panicked: {}",
                core.shared.id,
                idx,
                panic_message(&payload)
            );
        }
    }
    // SAFETY: main_ctx is the scheduler context that resumed us last.
    unsafe {
        context::jump_context(core.main_ctx.get(), ptr::null_mut());
    }
    // A terminated context can never be resumed.
    std::process::abort()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
