// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler internals.
//!
//! Components:
//! - `context`   — machine context make/jump (per-arch asm)
//! - `coro`      — coroutine descriptors + per-scheduler pool
//! - `stack`     — fixed stack slots, evacuation, guard pages
//! - `timer`     — deadline-ordered timer wheel
//! - `mailbox`   — MPSC feeds of new closures and ready coroutines
//! - `epoll`     — readiness backend + cross-thread wake
//! - `wait`      — the signaler/timer race cell
//! - `scheduler` — the event loop, resume/yield
//! - `manager`   — scheduler pool + load-based routing

pub(crate) mod context;
pub(crate) mod coro;
pub(crate) mod epoll;
pub(crate) mod mailbox;
pub(crate) mod manager;
pub(crate) mod scheduler;
pub(crate) mod stack;
pub(crate) mod timer;
pub(crate) mod wait;
