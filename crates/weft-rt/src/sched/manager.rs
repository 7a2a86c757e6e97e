// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The process-wide scheduler pool and its routing policy.
//!
//! Created lazily on first use, torn down by an exit hook (or an
//! explicit `stop_scheds`). New coroutines are handed out round-robin
//! until every scheduler has received one; after that, routing samples
//! two schedulers and picks the less loaded by CPU time, with a
//! thread-local snapshot table so a scheduler that has not burned any
//! CPU since we last looked is treated as idle.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use once_cell::sync::Lazy;

use crate::config;
use crate::sched::coro::CoHandle;
use crate::sched::mailbox::Task;
use crate::sched::scheduler::{self, SchedCore, SchedShared};

pub(crate) struct SchedManager {
    scheds: Vec<Arc<SchedShared>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    main_core: Mutex<Option<Box<SchedCore>>>,
    pow2: bool,
    active: AtomicBool,
}

static MAIN_THREAD_SCHED: AtomicBool = AtomicBool::new(false);
static ROUND_ROBIN: AtomicU32 = AtomicU32::new(0);
static MANAGER: Lazy<SchedManager> = Lazy::new(SchedManager::start);

extern "C" fn stop_at_exit() {
    if let Some(m) = Lazy::get(&MANAGER) {
        m.stop();
    }
}

impl SchedManager {
    fn start() -> Self {
        let cfg = config::effective();
        let n = cfg.sched_num;
        let mut scheds = Vec::with_capacity(n as usize);
        let mut threads = Vec::new();
        let mut main_core = None;
        for i in 0..n {
            let core = SchedCore::new(i, &cfg)
                .unwrap_or_else(|e| panic!("failed to create scheduler {}: {}", i, e));
            scheds.push(core.shared().clone());
            if i == 0 && MAIN_THREAD_SCHED.load(Ordering::Acquire) {
                // Held back; the caller runs this one on its own thread.
                main_core = Some(core);
            } else {
                let h = thread::Builder::new()
                    .name(format!("weft-sched-{}", i))
                    .spawn(move || core.run())
                    .expect("failed to spawn scheduler thread");
                threads.push(h);
            }
        }
        // SAFETY: registering a plain extern "C" exit hook.
        unsafe {
            libc::atexit(stop_at_exit);
        }
        SchedManager {
            scheds,
            threads: Mutex::new(threads),
            main_core: Mutex::new(main_core),
            pow2: n.is_power_of_two(),
            active: AtomicBool::new(true),
        }
    }

    pub fn scheds(&self) -> &[Arc<SchedShared>] {
        &self.scheds
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop every scheduler and join their threads. Idempotent. Must
    /// not be called from a scheduler thread, which could never join
    /// itself.
    pub fn stop(&self) {
        assert!(
            scheduler::try_with_current(|_| ()).is_none(),
            "stop_scheds must not be called from a scheduler thread"
        );
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        for s in &self.scheds {
            s.stop();
        }
        for h in self.threads.lock().unwrap().drain(..) {
            let _ = h.join();
        }
        // A stashed main-thread core that never ran can go now.
        let _ = self.main_core.lock().unwrap().take();
    }

    /// Pick the scheduler for the next new coroutine.
    pub fn next(&self) -> &Arc<SchedShared> {
        let v = &self.scheds;
        let n = v.len();
        if n == 1 {
            return &v[0];
        }
        // First pass: one coroutine to each scheduler, in order.
        if (ROUND_ROBIN.load(Ordering::Relaxed) as usize) < n {
            let i = ROUND_ROBIN.fetch_add(1, Ordering::Relaxed) as usize;
            if i < n {
                return &v[i];
            }
        }
        // Steady state: two-choice by CPU time.
        SCHED_INFO.with(|info| {
            let mut info = info.borrow_mut();
            if info.cputime.len() < n {
                info.cputime.resize(n, 0);
            }
            let r = xorshift64(&mut info.seed) as usize;
            let (i, k) = if self.pow2 {
                let x = n - 1;
                let i = r & x;
                (i, if i != x { i + 1 } else { 0 })
            } else {
                let i = r % n;
                (i, if i != n - 1 { i + 1 } else { 0 })
            };
            let ti = v[i].cputime();
            let tk = v[k].cputime();
            let snap = &mut info.cputime[k];
            // The neighbor only wins if it both looked busy before and
            // has now fallen behind: an unchanged counter means idle.
            let keep_first = if *snap == tk {
                true
            } else {
                *snap = tk;
                ti <= tk
            };
            if keep_first {
                &v[i]
            } else {
                &v[k]
            }
        })
    }
}

struct SchedInfo {
    cputime: Vec<i64>,
    seed: u64,
}

thread_local! {
    static SCHED_INFO: RefCell<SchedInfo> = RefCell::new(SchedInfo {
        cputime: Vec::new(),
        seed: entropy_seed(),
    });
}

fn entropy_seed() -> u64 {
    let addr = &SCHED_INFO as *const _ as u64;
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    (addr.wrapping_mul(0x9E3779B97F4A7C15) ^ nanos) | 1
}

/// Simple xorshift64 for random scheduler sampling.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

pub(crate) fn manager() -> &'static SchedManager {
    &MANAGER
}

pub(crate) fn try_manager() -> Option<&'static SchedManager> {
    Lazy::get(&MANAGER)
}

/// Whether the runtime is up (created and not stopped).
pub(crate) fn is_active() -> bool {
    try_manager().map(|m| m.is_active()).unwrap_or(false)
}

/// Hand a woken coroutine to its owning scheduler's ready mailbox.
pub(crate) fn add_ready(co: CoHandle) {
    let m = manager();
    if let Some(s) = m.scheds.get(co.sched as usize) {
        s.push_ready(co.idx);
    }
}

/// Route a new closure by load.
pub(crate) fn spawn(task: Task) {
    manager().next().push_task(task);
}

/// Mark that scheduler 0 will run on the caller's thread. Must happen
/// before the pool is created.
pub(crate) fn mark_main_thread_sched() {
    MAIN_THREAD_SCHED.store(true, Ordering::Release);
}

pub(crate) fn take_main_core() -> Option<Box<SchedCore>> {
    manager().main_core.lock().unwrap().take()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xorshift_is_nonzero_and_varies() {
        let mut s = 0x9E3779B97F4A7C15u64;
        let a = xorshift64(&mut s);
        let b = xorshift64(&mut s);
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn entropy_seed_is_odd() {
        assert_eq!(entropy_seed() & 1, 1);
    }
}
