// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness backend: epoll.
//!
//! One instance per scheduler. Owns the epoll fd, an eventfd used to
//! wake the scheduler from another thread, and the per-fd record of
//! which coroutine waits for which direction. A single fd can carry two
//! waiters, one reader and one writer. Level-triggered.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::coro::CoIdx;

/// I/O direction a coroutine waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ev {
    Read,
    Write,
}

#[derive(Default, Clone, Copy)]
struct FdWaiters {
    rd: CoIdx,
    wr: CoIdx,
}

impl FdWaiters {
    fn mask(&self) -> u32 {
        let mut m = 0;
        if self.rd != 0 {
            m |= libc::EPOLLIN as u32;
        }
        if self.wr != 0 {
            m |= libc::EPOLLOUT as u32;
        }
        m
    }
}

/// Cross-thread wake half of the backend: writes the eventfd, with an
/// atomic flag so back-to-back signals cost one syscall.
#[derive(Clone)]
pub(crate) struct WakeHandle {
    fd: RawFd,
    pending: Arc<AtomicBool>,
}

impl WakeHandle {
    pub fn signal(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            let one: u64 = 1;
            // SAFETY: fd is a valid eventfd; the write either succeeds
            // or fails with EAGAIN when the counter is saturated, which
            // still leaves the fd readable.
            unsafe {
                libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8);
            }
        }
    }
}

const MAX_EVENTS: usize = 1024;

pub(crate) struct Epoll {
    ep: RawFd,
    wake_fd: RawFd,
    wake_pending: Arc<AtomicBool>,
    events: Vec<libc::epoll_event>,
    n: usize,
    fds: HashMap<RawFd, FdWaiters>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscalls; results are checked below.
        let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(ep) };
            return Err(err);
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(ep, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(ep);
            }
            return Err(err);
        }
        Ok(Self {
            ep,
            wake_fd,
            wake_pending: Arc::new(AtomicBool::new(false)),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
            n: 0,
            fds: HashMap::new(),
        })
    }

    pub fn wake_handle(&self) -> WakeHandle {
        WakeHandle {
            fd: self.wake_fd,
            pending: self.wake_pending.clone(),
        }
    }

    /// Block up to `timeout_ms` (-1 = indefinitely) for events.
    /// Interrupted waits report zero events; the loop just runs another
    /// iteration.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        // SAFETY: events has MAX_EVENTS valid slots; the kernel fills
        // at most that many.
        let n = unsafe {
            libc::epoll_wait(
                self.ep,
                self.events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                self.n = 0;
                return Ok(0);
            }
            return Err(err);
        }
        self.n = n as usize;
        Ok(self.n)
    }

    /// Decode event `i` of the last `wait`: the fd plus which
    /// directions fired. A pure error event wakes both directions.
    pub fn event(&self, i: usize) -> (RawFd, bool, bool) {
        debug_assert!(i < self.n);
        let ev = &self.events[i];
        let has_in = ev.events & libc::EPOLLIN as u32 != 0;
        let has_out = ev.events & libc::EPOLLOUT as u32 != 0;
        (ev.u64 as RawFd, has_in || !has_out, has_out || !has_in)
    }

    pub fn is_wake(&self, fd: RawFd) -> bool {
        fd == self.wake_fd
    }

    /// Absorb a pending wake signal.
    pub fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        // SAFETY: reading our own nonblocking eventfd.
        unsafe {
            libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
        self.wake_pending.store(false, Ordering::Release);
    }

    /// Register coroutine `co` as the waiter for `ev` on `fd`.
    pub fn add_ev(&mut self, fd: RawFd, ev: Ev, co: CoIdx) -> io::Result<()> {
        let entry = self.fds.entry(fd).or_default();
        let had = entry.mask();
        match ev {
            Ev::Read => entry.rd = co,
            Ev::Write => entry.wr = co,
        }
        let want = entry.mask();
        if want == had {
            return Ok(());
        }
        let op = if had == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut e = libc::epoll_event {
            events: want,
            u64: fd as u64,
        };
        // SAFETY: valid epoll fd and a live event struct.
        let ret = unsafe { libc::epoll_ctl(self.ep, op, fd, &mut e) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match ev {
                Ev::Read => entry.rd = 0,
                Ev::Write => entry.wr = 0,
            }
            if entry.mask() == 0 {
                self.fds.remove(&fd);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Drop the waiter for one direction; deregisters the fd when no
    /// direction remains.
    pub fn del_ev(&mut self, fd: RawFd, ev: Ev) {
        let Some(entry) = self.fds.get_mut(&fd) else {
            return;
        };
        let had = entry.mask();
        match ev {
            Ev::Read => entry.rd = 0,
            Ev::Write => entry.wr = 0,
        }
        let want = entry.mask();
        if want == had {
            return;
        }
        if want == 0 {
            self.fds.remove(&fd);
            // SAFETY: valid epoll fd; a missing or already-closed fd is
            // not an error worth surfacing here.
            unsafe {
                libc::epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        } else {
            let mut e = libc::epoll_event {
                events: want,
                u64: fd as u64,
            };
            // SAFETY: as above.
            unsafe {
                libc::epoll_ctl(self.ep, libc::EPOLL_CTL_MOD, fd, &mut e);
            }
        }
    }

    /// Drop both waiters of an fd.
    pub fn del_ev_all(&mut self, fd: RawFd) {
        if self.fds.remove(&fd).is_some() {
            // SAFETY: as in del_ev.
            unsafe {
                libc::epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    /// Which coroutine waits on `fd` for `ev`, 0 if none.
    pub fn waiter(&self, fd: RawFd, ev: Ev) -> CoIdx {
        match (self.fds.get(&fd), ev) {
            (Some(w), Ev::Read) => w.rd,
            (Some(w), Ev::Write) => w.wr,
            (None, _) => 0,
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // The wake eventfd is deliberately left open: cross-thread
        // wakes may still arrive after the scheduler stopped, and a
        // write to a recycled fd number would be worse than leaking one
        // descriptor until process exit.
        // SAFETY: ep is ours and still open.
        unsafe {
            libc::close(self.ep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        // SAFETY: out-param syscall with a properly sized array.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn signal_wakes_the_wait() {
        let mut ep = Epoll::new().unwrap();
        ep.wake_handle().signal();
        let n = ep.wait(1000).unwrap();
        assert_eq!(n, 1);
        let (fd, _, _) = ep.event(0);
        assert!(ep.is_wake(fd));
        ep.drain_wake();
        // Drained: the next short wait times out.
        assert_eq!(ep.wait(10).unwrap(), 0);
    }

    #[test]
    fn readable_fd_resolves_to_registered_waiter() {
        let mut ep = Epoll::new().unwrap();
        let (rd, wr) = pipe_pair();
        ep.add_ev(rd, Ev::Read, 42).unwrap();
        // SAFETY: writing one byte into our own pipe.
        unsafe {
            libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let n = ep.wait(1000).unwrap();
        assert_eq!(n, 1);
        let (fd, readable, _) = ep.event(0);
        assert_eq!(fd, rd);
        assert!(readable);
        assert_eq!(ep.waiter(fd, Ev::Read), 42);
        ep.del_ev_all(rd);
        assert_eq!(ep.waiter(rd, Ev::Read), 0);
        // SAFETY: closing our own pipe fds.
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn two_directions_one_fd() {
        let mut ep = Epoll::new().unwrap();
        let (rd, wr) = pipe_pair();
        ep.add_ev(wr, Ev::Write, 7).unwrap();
        ep.add_ev(wr, Ev::Read, 9).unwrap();
        assert_eq!(ep.waiter(wr, Ev::Write), 7);
        assert_eq!(ep.waiter(wr, Ev::Read), 9);
        ep.del_ev(wr, Ev::Read);
        assert_eq!(ep.waiter(wr, Ev::Write), 7);
        assert_eq!(ep.waiter(wr, Ev::Read), 0);
        // SAFETY: closing our own pipe fds.
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn coalesced_signals_need_one_drain() {
        let mut ep = Epoll::new().unwrap();
        let wake = ep.wake_handle();
        wake.signal();
        wake.signal();
        wake.signal();
        assert_eq!(ep.wait(1000).unwrap(), 1);
        ep.drain_wake();
        assert_eq!(ep.wait(10).unwrap(), 0);
    }
}
