// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer wheel.
//!
//! An ordered map from (deadline, insertion sequence) to coroutine
//! index; the sequence breaks ties so same-millisecond timers fire in
//! insertion order. The wheel is scheduler-local and is only touched by
//! its owning thread; the cross-thread race against signalers happens
//! on the wait record, not here.

use std::collections::BTreeMap;
use std::time::Instant;

use once_cell::sync::Lazy;

use super::coro::{CoIdx, CoPool};

/// Stable handle to a pending timer: its map key.
pub(crate) type TimerId = (u64, u64);

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since process start.
pub(crate) fn now_ms() -> u64 {
    START.elapsed().as_millis() as u64
}

pub(crate) struct TimerWheel {
    map: BTreeMap<TimerId, CoIdx>,
    seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn add(&mut self, deadline_ms: u64, co: CoIdx) -> TimerId {
        self.seq += 1;
        let id = (deadline_ms, self.seq);
        self.map.insert(id, co);
        id
    }

    pub fn cancel(&mut self, id: &TimerId) -> bool {
        self.map.remove(id).is_some()
    }

    /// Pop every entry due at `now_ms` and collect the coroutines to
    /// resume. A coroutine parked on a primitive is claimed with the
    /// WAIT→TIMEOUT exchange; if the signaler already won, the entry is
    /// dropped silently. Returns the backend poll timeout for the next
    /// iteration: milliseconds until the next deadline, or -1 when the
    /// wheel is empty.
    pub fn check_due(&mut self, now_ms: u64, pool: &mut CoPool, due: &mut Vec<CoIdx>) -> i32 {
        loop {
            let Some((&id, &idx)) = self.map.first_key_value() else {
                break;
            };
            if id.0 > now_ms {
                break;
            }
            self.map.pop_first();
            let co = pool.get(idx);
            if co.timer == Some(id) {
                co.timer = None;
            }
            match &co.waitx {
                None => due.push(idx),
                Some(state) => {
                    if state.try_timeout() {
                        due.push(idx);
                    }
                }
            }
        }
        match self.map.first_key_value() {
            None => -1,
            Some((&(deadline, _), _)) => (deadline - now_ms).min(i32::MAX as u64) as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::wait::WaitState;
    use std::sync::Arc;

    fn pool_with(n: usize) -> CoPool {
        let mut pool = CoPool::new();
        for _ in 0..n {
            pool.alloc(Box::new(|| {}));
        }
        pool
    }

    #[test]
    fn due_in_deadline_then_insertion_order() {
        let mut wheel = TimerWheel::new();
        let mut pool = pool_with(3);
        wheel.add(20, 2);
        wheel.add(10, 1);
        wheel.add(10, 3);
        let mut due = Vec::new();
        let next = wheel.check_due(25, &mut pool, &mut due);
        assert_eq!(due, vec![1, 3, 2]);
        assert_eq!(next, -1);
    }

    #[test]
    fn add_cancel_add_leaves_no_stale_entry() {
        let mut wheel = TimerWheel::new();
        let mut pool = pool_with(1);
        let id = wheel.add(10, 1);
        assert!(wheel.cancel(&id));
        let _ = wheel.add(50, 1);
        let mut due = Vec::new();
        let next = wheel.check_due(20, &mut pool, &mut due);
        assert!(due.is_empty());
        assert_eq!(next, 30);
    }

    #[test]
    fn claimed_waiter_is_dropped_silently() {
        let mut wheel = TimerWheel::new();
        let mut pool = pool_with(1);
        let state = Arc::new(WaitState::new());
        pool.get(1).waitx = Some(state.clone());
        wheel.add(5, 1);
        assert!(state.try_ready()); // signaler wins first
        let mut due = Vec::new();
        wheel.check_due(10, &mut pool, &mut due);
        assert!(due.is_empty());
    }

    #[test]
    fn parked_waiter_is_claimed_by_timeout() {
        let mut wheel = TimerWheel::new();
        let mut pool = pool_with(1);
        let state = Arc::new(WaitState::new());
        pool.get(1).waitx = Some(state.clone());
        wheel.add(5, 1);
        let mut due = Vec::new();
        wheel.check_due(10, &mut pool, &mut due);
        assert_eq!(due, vec![1]);
        assert!(!state.try_ready()); // timer already claimed it
    }

    #[test]
    fn next_deadline_sizes_the_poll() {
        let mut wheel = TimerWheel::new();
        let mut pool = pool_with(2);
        wheel.add(100, 1);
        wheel.add(40, 2);
        let mut due = Vec::new();
        let next = wheel.check_due(10, &mut pool, &mut due);
        assert!(due.is_empty());
        assert_eq!(next, 30);
    }
}
