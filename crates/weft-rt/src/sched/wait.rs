// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wait-record state cell.
//!
//! Every suspension on a sync primitive or channel races a signaler
//! against a timer. Both sides try a single compare-exchange on this
//! cell, so exactly one of them claims the waiter; the loser backs off
//! and drops its handle.

use std::sync::atomic::{AtomicU8, Ordering};

pub(crate) const ST_WAIT: u8 = 0;
pub(crate) const ST_READY: u8 = 1;
pub(crate) const ST_TIMEOUT: u8 = 2;

/// Millisecond timeout value meaning "no timer".
pub(crate) const INFINITE: u32 = u32::MAX;

/// Atomic state of one suspension. Shared between the parked waiter,
/// the primitive's wait queue, and the owning scheduler's timer wheel.
#[derive(Debug)]
pub(crate) struct WaitState(AtomicU8);

impl WaitState {
    pub fn new() -> Self {
        Self(AtomicU8::new(ST_WAIT))
    }

    /// Signaler side: claim the waiter. Returns false if a timer beat us.
    pub fn try_ready(&self) -> bool {
        self.0
            .compare_exchange(ST_WAIT, ST_READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Timer side: expire the waiter. Returns false if a signaler beat us.
    pub fn try_timeout(&self) -> bool {
        self.0
            .compare_exchange(ST_WAIT, ST_TIMEOUT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_side_wins() {
        let s = WaitState::new();
        assert!(s.try_ready());
        assert!(!s.try_timeout());
        assert_eq!(s.get(), ST_READY);

        let s = WaitState::new();
        assert!(s.try_timeout());
        assert!(!s.try_ready());
        assert_eq!(s.get(), ST_TIMEOUT);
    }

    #[test]
    fn terminal_state_is_sticky() {
        let s = WaitState::new();
        assert!(s.try_ready());
        assert!(!s.try_ready());
    }
}
