//! One-shot initialization barrier gating evaluations until the first
//! asynchronous source delivers data (or the caller's timeout fires).

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Outcome of waiting on the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitResult {
    Ready,
    TimedOut,
}

/// Policy applied when the latch times out before any async source reports
/// ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnInitializationFailure {
    /// Surface an initialization-timeout error on the first timed-out call;
    /// subsequent calls proceed without blocking.
    #[default]
    ReturnError,
    /// Proceed against whatever the store contains (typically empty);
    /// subsequent calls are unblocked.
    ReturnNilMatch,
}

/// A one-shot latch. Multiple parties may race to close it (the first async
/// source reporting ready, a waiter timing out, a second waiter racing the
/// timeout); the open→closed transition happens exactly once, and readers
/// after close never block.
#[derive(Default)]
pub struct InitializationLatch {
    closed: Mutex<bool>,
    condvar: Condvar,
}

impl InitializationLatch {
    pub fn new() -> InitializationLatch {
        InitializationLatch::default()
    }

    /// Close the latch and wake every waiter. Idempotent.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let mut closed = self
            .closed
            .lock()
            .expect("thread holding latch lock should not panic");
        if *closed {
            return false;
        }
        *closed = true;
        self.condvar.notify_all();
        true
    }

    pub fn is_closed(&self) -> bool {
        *self
            .closed
            .lock()
            .expect("thread holding latch lock should not panic")
    }

    /// Block until the latch closes or `timeout` elapses. Returns
    /// immediately once the latch has closed.
    pub fn wait_timeout(&self, timeout: Duration) -> AwaitResult {
        let mut closed = self
            .closed
            .lock()
            .expect("thread holding latch lock should not panic");
        let deadline = std::time::Instant::now() + timeout;

        while !*closed {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return AwaitResult::TimedOut;
            }
            let (guard, wait_result) = self
                .condvar
                .wait_timeout(closed, remaining)
                .expect("thread holding latch lock should not panic");
            closed = guard;
            if wait_result.timed_out() && !*closed {
                return AwaitResult::TimedOut;
            }
        }

        AwaitResult::Ready
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn close_transitions_exactly_once() {
        let latch = InitializationLatch::new();

        assert!(!latch.is_closed());
        assert!(latch.close());
        assert!(!latch.close());
        assert!(latch.is_closed());
    }

    #[test]
    fn waiters_unblock_on_close() {
        let latch = Arc::new(InitializationLatch::new());

        let waiter = {
            let latch = latch.clone();
            std::thread::spawn(move || latch.wait_timeout(Duration::from_secs(5)))
        };

        latch.close();
        assert_eq!(waiter.join().unwrap(), AwaitResult::Ready);
    }

    #[test]
    fn wait_times_out_when_never_closed() {
        let latch = InitializationLatch::new();

        let start = Instant::now();
        let result = latch.wait_timeout(Duration::from_millis(50));

        assert_eq!(result, AwaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!latch.is_closed());
    }

    #[test]
    fn wait_after_close_returns_immediately() {
        let latch = InitializationLatch::new();
        latch.close();

        let start = Instant::now();
        assert_eq!(latch.wait_timeout(Duration::from_secs(5)), AwaitResult::Ready);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn racing_closers_produce_a_single_transition() {
        let latch = Arc::new(InitializationLatch::new());

        let closers: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.close())
            })
            .collect();

        let transitions = closers
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|performed| *performed)
            .count();

        assert_eq!(transitions, 1);
        assert!(latch.is_closed());
    }
}
