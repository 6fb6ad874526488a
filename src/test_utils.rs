//! Shared helpers for unit and integration tests.
//!
//! - [`TestClock`]: a clock source on virtual time, advanced manually, so
//!   retry schedules run deterministically
//! - [`CountingCollector`]: a stream collector that counts every event and
//!   returns the final tally
//!
//! These ship in the library (rather than a test-only module) so
//! integration suites and downstream crates can drive retry and collection
//! deterministically.

use std::sync::Arc;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::clock::{ClockSource, TimerAction};
use crate::combinator::stream::StreamCollector;
use crate::types::Time;

/// A clock source on virtual time.
///
/// `now` only moves when [`TestClock::advance`] is called; scheduled
/// actions run during the advance that reaches their deadline, on the
/// advancing thread, in deadline order.
pub struct TestClock {
    state: Mutex<TestClockState>,
}

struct TestClockState {
    now: Time,
    next_seq: u64,
    pending: Vec<PendingAction>,
}

struct PendingAction {
    due: Time,
    seq: u64,
    action: TimerAction,
}

impl TestClock {
    /// Creates a clock at the epoch with nothing scheduled.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TestClockState {
                now: Time::ZERO,
                next_seq: 0,
                pending: Vec::new(),
            }),
        })
    }

    /// Number of actions waiting for a future deadline.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Advances virtual time by `delta`, running every action whose
    /// deadline is reached, in deadline order.
    ///
    /// Actions run outside the clock lock, so they may schedule follow-up
    /// actions; follow-ups within the advanced window run in the same
    /// call.
    pub fn advance(&self, delta: Duration) {
        let deadline = self.state.lock().now.saturating_add(delta);
        loop {
            let action = {
                let mut state = self.state.lock();
                let next = state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, pending)| pending.due <= deadline)
                    .min_by_key(|(_, pending)| (pending.due, pending.seq))
                    .map(|(index, _)| index);
                match next {
                    Some(index) => {
                        let pending = state.pending.swap_remove(index);
                        state.now = pending.due.max(state.now);
                        pending.action
                    }
                    None => {
                        state.now = deadline;
                        return;
                    }
                }
            };
            action();
        }
    }
}

impl ClockSource for TestClock {
    fn now(&self) -> Time {
        self.state.lock().now
    }

    fn schedule(&self, delay: Duration, action: TimerAction) {
        let mut state = self.state.lock();
        let due = state.now.saturating_add(delay);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(PendingAction { due, seq, action });
    }
}

/// Stream collector that counts events and returns the final tally as
/// `(resolved, failed, cancelled)`.
#[derive(Debug, Default)]
pub struct CountingCollector {
    resolved: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl CountingCollector {
    /// Creates a collector with zeroed counters.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `resolved` notifications received so far.
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.resolved.load(Ordering::Acquire)
    }

    /// Number of `failed` notifications received so far.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    /// Number of `cancelled` notifications received so far.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<S, E> StreamCollector<S, E> for CountingCollector
where
    S: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = (usize, usize, usize);

    fn resolved(&self, _value: S) {
        self.resolved.fetch_add(1, Ordering::AcqRel);
    }

    fn failed(&self, _cause: E) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self, resolved: usize, failed: usize, cancelled: usize) -> Result<Self::Output, E> {
        Ok((resolved, failed, cancelled))
    }
}
