//! Clock sources for retry backoff.
//!
//! Retry never sleeps on the calling thread; it asks a [`ClockSource`] to
//! run an action after a delay. The source also supplies [`Time`] for
//! elapsed-time computation, so deterministic test clocks can drive retry
//! schedules on virtual time.

use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use core::cmp::Ordering as CmpOrdering;
use core::fmt;
use parking_lot::{Condvar, Mutex};

use crate::types::Time;

/// A deferred action handed to a clock source.
pub type TimerAction = Box<dyn FnOnce() + Send>;

/// Supplies monotonic time and delayed execution.
pub trait ClockSource: Send + Sync + 'static {
    /// The current monotonic instant.
    fn now(&self) -> Time;

    /// Runs `action` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, action: TimerAction);
}

/// Clock source backed by the OS monotonic clock and a timer thread.
///
/// The timer thread is spawned on the first `schedule` call and parks on a
/// condvar between deadlines. Dropping the last handle shuts the thread
/// down; actions still queued at that point are discarded.
#[derive(Clone)]
pub struct SystemClock {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    anchor: Instant,
    state: Mutex<TimerState>,
    tick: Condvar,
}

struct TimerState {
    queue: BinaryHeap<TimerEntry>,
    next_seq: u64,
    running: bool,
    shutdown: bool,
}

struct TimerEntry {
    due: Time,
    seq: u64,
    action: TimerAction,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the earliest deadline sits at the top of the heap,
        // with submission order as the tie-break.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl SystemClock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                anchor: Instant::now(),
                state: Mutex::new(TimerState {
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                    running: false,
                    shutdown: false,
                }),
                tick: Condvar::new(),
            }),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemClock")
            .field("pending", &self.shared.state.lock().queue.len())
            .finish()
    }
}

impl TimerShared {
    fn now(&self) -> Time {
        let nanos = u64::try_from(self.anchor.elapsed().as_nanos()).unwrap_or(u64::MAX);
        Time::from_nanos(nanos)
    }
}

impl ClockSource for SystemClock {
    fn now(&self) -> Time {
        self.shared.now()
    }

    fn schedule(&self, delay: Duration, action: TimerAction) {
        let shared = Arc::clone(&self.shared);
        let mut state = self.shared.state.lock();
        let due = self.shared.now().saturating_add(delay);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(TimerEntry { due, seq, action });
        if state.running {
            drop(state);
            self.shared.tick.notify_all();
        } else {
            state.running = true;
            drop(state);
            let spawned = thread::Builder::new()
                .name("eventually-timer".to_owned())
                .spawn(move || timer_loop(&shared));
            if let Err(error) = spawned {
                tracing::error!(%error, "failed to spawn timer thread");
                self.shared.state.lock().running = false;
            }
        }
    }
}

fn timer_loop(shared: &Arc<TimerShared>) {
    loop {
        let action = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let now = shared.now();
                match state.queue.peek() {
                    Some(entry) if entry.due <= now => {
                        break state.queue.pop().map(|entry| entry.action);
                    }
                    Some(entry) => {
                        let wait = entry.due.saturating_duration_since(now);
                        shared.tick.wait_for(&mut state, wait);
                    }
                    None => shared.tick.wait(&mut state),
                }
            }
        };
        if let Some(action) = action {
            if panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
                tracing::error!("scheduled action panicked");
            }
        }
    }
}

impl Drop for SystemClock {
    fn drop(&mut self) {
        // Two handles remain at this point: this one and the timer thread's.
        if Arc::strong_count(&self.shared) <= 2 {
            self.shared.state.lock().shutdown = true;
            self.shared.tick.notify_all();
        }
    }
}
