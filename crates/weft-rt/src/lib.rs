// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! weft: a stackful coroutine runtime.
//!
//! A pool of per-core schedulers multiplexes lightweight coroutines
//! with real call stacks over OS threads. Blocking is cooperative:
//! coroutines suspend at channel/mutex/event waits, timers, and I/O
//! readiness, and never migrate off the scheduler that first ran them.
//!
//! Components:
//! - [`go`] and friends — spawn/yield/sleep/timers, scheduler handles
//! - [`Mutex`], [`Event`], [`WaitGroup`] — coroutine-aware sync
//! - [`Chan`] — bounded channel with per-operation timeouts
//! - [`Pool`] — per-scheduler object cache
//! - [`Config`]/[`configure`] — tunables
//!
//! ```no_run
//! use weft_rt as weft;
//!
//! let wg = weft::WaitGroup::new(1);
//! let ch = weft::Chan::<i32>::new(8);
//! let (wg2, ch2) = (wg.clone(), ch.clone());
//! weft::go(move || {
//!     ch2.write(42);
//!     wg2.done();
//! });
//! wg.wait();
//! assert_eq!(ch.read(), Some(42));
//! ```

pub mod chan;
pub mod config;
pub mod event;
pub mod mutex;
pub mod pool;
mod sched;
pub mod wait_group;

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use sched::manager;
use sched::scheduler::{self, SchedCore, SchedShared};

pub use chan::Chan;
pub use config::{configure, Config, ConfigError};
pub use event::{Event, SyncEvent};
pub use mutex::{Mutex, MutexGuard};
pub use pool::Pool;
pub use sched::coro::CoHandle;
pub use sched::epoll::Ev;
pub use wait_group::WaitGroup;

/// Spawn a closure as a coroutine. Thread-safe; the scheduler is picked
/// by load.
pub fn go<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    manager::spawn(Box::new(f));
}

fn with_coroutine<R>(api: &str, f: impl FnOnce(&SchedCore) -> R) -> R {
    scheduler::try_with_current(|core| {
        if core.running_handle().is_none() {
            panic!("{} must be called from a coroutine", api);
        }
        f(core)
    })
    .unwrap_or_else(|| panic!("{} must be called from a coroutine", api))
}

/// Suspend the running coroutine until something resumes it: a timer
/// armed with [`add_timer`], an I/O event from [`add_io_event`], or an
/// explicit [`resume`].
pub fn yield_now() {
    with_coroutine("yield_now", |core| core.yield_running());
}

/// Sleep for `ms` milliseconds. Suspends the running coroutine, or
/// blocks the thread when called outside the runtime.
pub fn sleep(ms: u32) {
    let slept = scheduler::try_with_current(|core| {
        if core.running_handle().is_some() {
            core.sleep_running(ms);
            true
        } else {
            false
        }
    })
    .unwrap_or(false);
    if !slept {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Whether the last resume of the running coroutine was caused by a
/// timer. Check right after a timed wait returns.
pub fn timeout() -> bool {
    with_coroutine("timeout", |core| core.timeout())
}

/// Arm a one-shot timer for the running coroutine, then [`yield_now`]
/// to actually suspend; the scheduler resumes it when the timer fires.
pub fn add_timer(ms: u32) {
    with_coroutine("add_timer", |core| core.add_timer_running(ms));
}

/// Whether `p` points into the running coroutine's stack. Data that
/// fails this check survives the coroutine's suspensions; data that
/// passes it may be evacuated with the stack.
pub fn on_stack<T>(p: *const T) -> bool {
    with_coroutine("on_stack", |core| core.on_stack(p as *const u8))
}

/// Register the running coroutine for readiness of `fd` in direction
/// `ev`, then [`yield_now`]; the scheduler resumes it when the fd is
/// ready. Returns false if registration failed.
pub fn add_io_event(fd: RawFd, ev: Ev) -> bool {
    with_coroutine("add_io_event", |core| core.add_io_event(fd, ev))
}

/// Drop an I/O registration for one direction.
pub fn del_io_event(fd: RawFd, ev: Ev) {
    with_coroutine("del_io_event", |core| core.del_io_event(fd, ev));
}

/// Drop both I/O registrations of `fd`.
pub fn del_io_events(fd: RawFd) {
    with_coroutine("del_io_events", |core| core.del_io_events(fd));
}

/// Monotonic milliseconds since process start; the clock every timeout
/// in this crate is measured against.
pub fn now_ms() -> u64 {
    sched::timer::now_ms()
}

/// Handle to the running coroutine, usable from any thread to
/// [`resume`] it later. None when called outside a coroutine.
pub fn current() -> Option<CoHandle> {
    scheduler::current_coroutine()
}

/// Id of the running coroutine (scheduler id in the high 32 bits).
pub fn coroutine_id() -> Option<u64> {
    scheduler::current_coroutine().map(|h| h.id())
}

/// Id of the scheduler running the current thread.
pub fn sched_id() -> Option<u32> {
    scheduler::try_with_current(|core| core.shared().id)
}

/// Make a suspended coroutine ready again. Thread-safe. The coroutine
/// must have suspended itself with a bare [`yield_now`] (after
/// [`add_timer`] or by arrangement with the resumer).
pub fn resume(co: CoHandle) {
    manager::add_ready(co);
}

/// Number of schedulers in the pool. Starts the runtime if needed.
pub fn sched_num() -> usize {
    manager::manager().scheds().len()
}

/// A handle to one scheduler, for pinning related coroutines together.
#[derive(Clone)]
pub struct SchedRef {
    shared: Arc<SchedShared>,
}

impl SchedRef {
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// This scheduler's published load metric: cumulative loop time in
    /// microseconds. Zero while only one scheduler exists.
    pub fn cpu_time_us(&self) -> i64 {
        self.shared.cputime()
    }

    /// Spawn `f` on this specific scheduler.
    pub fn go<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push_task(Box::new(f));
    }
}

/// The scheduler the load balancer would pick next.
pub fn next_sched() -> SchedRef {
    SchedRef {
        shared: manager::manager().next().clone(),
    }
}

/// Handles to all schedulers.
pub fn scheds() -> Vec<SchedRef> {
    manager::manager()
        .scheds()
        .iter()
        .map(|s| SchedRef { shared: s.clone() })
        .collect()
}

/// Token for running scheduler 0 on the calling thread. Obtain it with
/// [`main_sched`] before any coroutine is spawned, then call
/// [`MainSched::run`] after spawning the initial work.
pub struct MainSched {
    _priv: (),
}

impl MainSched {
    /// Run scheduler 0's event loop on this thread. Returns when the
    /// runtime is stopped.
    pub fn run(self) {
        let core = manager::take_main_core().expect(
            "main_sched() must be called before the runtime starts, and run() only once",
        );
        core.run();
    }
}

/// Mark the calling thread as the future home of scheduler 0. Must be
/// called before the first coroutine is spawned.
pub fn main_sched() -> MainSched {
    manager::mark_main_thread_sched();
    let _ = manager::manager();
    MainSched { _priv: () }
}

/// Stop every scheduler and join their threads. Idempotent and
/// best-effort: coroutines still suspended are abandoned. Must be
/// called from outside the runtime's own threads.
pub fn stop_scheds() {
    if let Some(m) = manager::try_manager() {
        m.stop();
    }
}
