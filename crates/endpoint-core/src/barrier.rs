//! One-Shot State Barrier
//!
//! A [`StateBarrier`] is a messenger state listener that is also a wait
//! primitive. It captures the first state matching its mask and releases every
//! blocked waiter. Callers must register the barrier *before* looking at the
//! messenger's current state; if that state already matches, they call
//! [`StateBarrier::expire`] and use it directly instead of waiting.

use alloc::sync::Arc;
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

use crate::errors::{EndpointError, Result};
use crate::notifier::MessengerStateListener;
use crate::state::{MessengerState, StateMask};
use crate::waiters::Interruptible;

#[derive(Debug, Default)]
struct BarrierState {
    matched: Option<MessengerState>,
    expired: bool,
    interrupted: bool,
}

/// Single-use wait for a messenger to reach one of a set of states
#[derive(Debug)]
pub struct StateBarrier {
    mask: StateMask,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl StateBarrier {
    /// Create a barrier waiting for any state in `mask`
    pub fn new(mask: StateMask) -> Self {
        Self {
            mask,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    /// The states this barrier waits for
    pub fn mask(&self) -> StateMask {
        self.mask
    }

    /// Listener callback: record the first matching state.
    ///
    /// Returns `false` (unregister) once the barrier has expired.
    pub fn messenger_state_changed(&self, new_state: MessengerState) -> bool {
        let mut state = self.state.lock();
        if state.expired {
            return false;
        }
        if !new_state.matches(self.mask) {
            return true;
        }
        state.matched = Some(new_state);
        state.expired = true;
        self.released.notify_all();
        false
    }

    /// Wrap this barrier as a listener for a state notifier
    pub fn listener(self: &Arc<Self>) -> MessengerStateListener {
        let barrier = Arc::clone(self);
        Arc::new(move |new_state: &MessengerState| barrier.messenger_state_changed(*new_state))
    }

    /// Block until a match is recorded or `timeout` elapses (zero waits forever).
    ///
    /// Returns `Ok(None)` on timeout or when the barrier was expired without a
    /// match, and [`EndpointError::Interrupted`] once [`interrupt`](Self::interrupt)
    /// has been called on this (single-use) barrier.
    pub fn await_match(&self, timeout: Duration) -> Result<Option<MessengerState>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut state = self.state.lock();

        loop {
            if state.expired {
                return Ok(state.matched);
            }
            if state.interrupted {
                return Err(EndpointError::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut state, deadline).timed_out() {
                        if state.expired {
                            return Ok(state.matched);
                        }
                        return Ok(None);
                    }
                }
                None => self.released.wait(&mut state),
            }
        }
    }

    /// Mark the barrier done without a match; waiters return `None`
    pub fn expire(&self) {
        let mut state = self.state.lock();
        if !state.expired {
            state.expired = true;
            self.released.notify_all();
        }
    }

    /// Whether a match was recorded or the barrier was expired
    pub fn is_expired(&self) -> bool {
        self.state.lock().expired
    }

    /// The recorded match, if any
    pub fn matched(&self) -> Option<MessengerState> {
        self.state.lock().matched
    }
}

impl Interruptible for StateBarrier {
    fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.released.notify_all();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_match_before_await_returns_immediately() {
        let barrier = StateBarrier::new(StateMask::CLOSED | StateMask::BROKEN);
        assert!(barrier.messenger_state_changed(MessengerState::Sending));
        assert!(!barrier.messenger_state_changed(MessengerState::Closed));

        let matched = barrier.await_match(Duration::ZERO).unwrap();
        assert_eq!(matched, Some(MessengerState::Closed));
    }

    #[test]
    fn test_first_match_wins() {
        let barrier = StateBarrier::new(StateMask::TERMINAL);
        barrier.messenger_state_changed(MessengerState::Broken);
        assert!(!barrier.messenger_state_changed(MessengerState::Closed));
        assert_eq!(barrier.matched(), Some(MessengerState::Broken));
    }

    #[test]
    fn test_timeout_returns_no_match() {
        let barrier = StateBarrier::new(StateMask::CLOSED);
        let start = Instant::now();
        let matched = barrier.await_match(Duration::from_millis(30)).unwrap();
        assert_eq!(matched, None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_expired_barrier_always_unregisters() {
        let barrier = StateBarrier::new(StateMask::CLOSED);
        barrier.expire();
        assert!(!barrier.messenger_state_changed(MessengerState::Sending));
        assert!(!barrier.messenger_state_changed(MessengerState::Closed));
        assert_eq!(barrier.await_match(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn test_release_from_other_thread() {
        let barrier = Arc::new(StateBarrier::new(StateMask::CONNECTED));
        let listener = barrier.listener();

        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.await_match(Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(listener(&MessengerState::Sending));
        assert!(!listener(&MessengerState::Connected));

        let matched = waiter.join().unwrap().unwrap();
        assert_eq!(matched, Some(MessengerState::Connected));
    }

    #[test]
    fn test_interrupt_unblocks_waiter() {
        let barrier = Arc::new(StateBarrier::new(StateMask::CLOSED));
        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.await_match(Duration::ZERO))
        };
        while !waiter.is_finished() {
            barrier.interrupt();
            thread::sleep(Duration::from_millis(5));
        }

        let result = waiter.join().unwrap();
        assert_eq!(result, Err(EndpointError::Interrupted));
    }
}
