//! The eventual value: a thread-safe handle to a not-yet-known outcome.
//!
//! [`Eventual`] is the one concrete primitive of this library. A pending
//! value is a completion cell: the current state plus a list of pending
//! observers, guarded by a mutex, with a condvar for blocking joins.
//! Already-completed values take a second, cheaper representation that
//! skips the observer-list machinery entirely.
//!
//! # State Machine
//!
//! A cell is born `Running` with an empty observer list and leaves
//! `Running` at most once, through exactly one of [`Eventual::resolve`],
//! [`Eventual::fail`], or [`Eventual::cancel`]. The winning call installs
//! the terminal completion, detaches the observer list, and notifies the
//! detached observers outside the lock; losing calls are no-ops that
//! return `false`.
//!
//! # Lock Discipline
//!
//! User observers never run while the cell lock is held. Registration on a
//! terminal value releases the lock first and then dispatches through the
//! configured caller, so an observer added after completion still runs
//! before the registration call returns (for a direct caller).

mod observer;
mod poll;

use std::sync::Arc;

use core::fmt;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::caller::Caller;
use crate::types::Completion;

pub(crate) use observer::Observer;

/// Error returned by [`Eventual::join_now`] when the value is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotReady;

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eventual value is not ready")
    }
}

impl std::error::Error for NotReady {}

/// A thread-safe handle to an eventually-completed value.
///
/// Handles are cheaply cloneable; clones observe and complete the same
/// underlying cell. All methods may be called from any thread at any time.
pub struct Eventual<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Eventual<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for Eventual<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner {
            Inner::Immediate { completion, .. } => completion.lock().kind(),
            Inner::Cell(cell) => match &*cell.state.lock() {
                CellState::Running(observers) => {
                    return f
                        .debug_struct("Eventual")
                        .field("state", &"running")
                        .field("observers", &observers.len())
                        .finish();
                }
                CellState::Terminal(completion) => completion.kind(),
            },
        };
        f.debug_struct("Eventual").field("state", &state).finish()
    }
}

enum Inner<T, E> {
    /// Completed at construction; no observer list is ever needed. The
    /// mutex only makes the payload shareable without a `Sync` bound on
    /// the value type; it is never contended.
    Immediate {
        completion: Mutex<Completion<T, E>>,
        caller: Arc<dyn Caller>,
    },
    /// A resolvable completion cell.
    Cell(Cell<T, E>),
}

struct Cell<T, E> {
    state: Mutex<CellState<T, E>>,
    done: Condvar,
    caller: Arc<dyn Caller>,
}

enum CellState<T, E> {
    /// Still running; holds the pending observers.
    Running(SmallVec<[Observer<T, E>; 2]>),
    /// Frozen terminal state.
    Terminal(Completion<T, E>),
}

impl<T, E> Eventual<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a pending value that dispatches observers through `caller`.
    #[must_use]
    pub fn pending(caller: Arc<dyn Caller>) -> Self {
        Self {
            inner: Arc::new(Inner::Cell(Cell {
                state: Mutex::new(CellState::Running(SmallVec::new())),
                done: Condvar::new(),
                caller,
            })),
        }
    }

    /// Creates a value completed at construction.
    ///
    /// Immediate values skip the observer-list machinery; registration
    /// dispatches straight through the caller.
    #[must_use]
    pub fn immediate(completion: Completion<T, E>, caller: Arc<dyn Caller>) -> Self {
        Self {
            inner: Arc::new(Inner::Immediate {
                completion: Mutex::new(completion),
                caller,
            }),
        }
    }

    pub(crate) fn caller(&self) -> &Arc<dyn Caller> {
        match &*self.inner {
            Inner::Immediate { caller, .. } => caller,
            Inner::Cell(cell) => &cell.caller,
        }
    }

    /// Resolves the value.
    ///
    /// Returns `true` iff this call performed the `Running` → `Resolved`
    /// transition; otherwise the call has no effect.
    pub fn resolve(&self, value: T) -> bool {
        self.complete_with(Completion::Resolved(value))
    }

    /// Fails the value with `cause`.
    ///
    /// Returns `true` iff this call performed the `Running` → `Failed`
    /// transition; otherwise the call has no effect.
    pub fn fail(&self, cause: E) -> bool {
        self.complete_with(Completion::Failed(cause))
    }

    /// Cancels the value.
    ///
    /// Returns `true` iff this call performed the `Running` → `Cancelled`
    /// transition; otherwise the call has no effect.
    pub fn cancel(&self) -> bool {
        self.complete_with(Completion::Cancelled)
    }

    /// Installs `completion` as the terminal state, whatever its kind.
    pub(crate) fn complete_with(&self, completion: Completion<T, E>) -> bool {
        let Inner::Cell(cell) = &*self.inner else {
            return false;
        };
        let observers = {
            let mut state = cell.state.lock();
            match &mut *state {
                CellState::Terminal(_) => return false,
                CellState::Running(observers) => {
                    let detached = std::mem::take(observers);
                    *state = CellState::Terminal(completion.clone());
                    detached
                }
            }
        };
        cell.done.notify_all();
        tracing::trace!(
            kind = completion.kind(),
            observers = observers.len(),
            "eventual completed"
        );
        for observer in observers {
            observer.notify(&completion, &cell.caller);
        }
        true
    }

    /// Returns true if the value has reached any terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.peek(|c| c.is_some())
    }

    /// Returns true if the value is resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.peek(|c| c.is_some_and(Completion::is_resolved))
    }

    /// Returns true if the value is failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.peek(|c| c.is_some_and(Completion::is_failed))
    }

    /// Returns true if the value is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.peek(|c| c.is_some_and(Completion::is_cancelled))
    }

    fn peek<R>(&self, f: impl FnOnce(Option<&Completion<T, E>>) -> R) -> R {
        match &*self.inner {
            Inner::Immediate { completion, .. } => f(Some(&completion.lock())),
            Inner::Cell(cell) => match &*cell.state.lock() {
                CellState::Running(_) => f(None),
                CellState::Terminal(completion) => f(Some(completion)),
            },
        }
    }

    /// Blocks the calling thread until the value completes.
    #[must_use]
    pub fn join(&self) -> Completion<T, E> {
        match &*self.inner {
            Inner::Immediate { completion, .. } => completion.lock().clone(),
            Inner::Cell(cell) => {
                let mut state = cell.state.lock();
                loop {
                    match &*state {
                        CellState::Terminal(completion) => return completion.clone(),
                        CellState::Running(_) => cell.done.wait(&mut state),
                    }
                }
            }
        }
    }

    /// Returns the completion if the value is already terminal.
    pub fn join_now(&self) -> Result<Completion<T, E>, NotReady> {
        self.peek(|c| c.cloned().ok_or(NotReady))
    }

    /// Registers an observer for the resolved state.
    ///
    /// If the value is already resolved, the observer is dispatched through
    /// the caller before this call returns.
    pub fn on_resolved(&self, f: impl FnOnce(T) + Send + 'static) -> &Self {
        self.subscribe(Observer::Resolved(Box::new(f)))
    }

    /// Registers an observer for the failed state.
    pub fn on_failed(&self, f: impl FnOnce(E) + Send + 'static) -> &Self {
        self.subscribe(Observer::Failed(Box::new(f)))
    }

    /// Registers an observer for the cancelled state.
    pub fn on_cancelled(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        self.subscribe(Observer::Cancelled(Box::new(f)))
    }

    /// Registers an observer invoked on any terminal state, without the
    /// completion payload.
    pub fn on_finished(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        self.subscribe(Observer::Finished(Box::new(f)))
    }

    /// Registers an observer invoked on any terminal state with the full
    /// completion.
    pub fn on_done(&self, f: impl FnOnce(Completion<T, E>) + Send + 'static) -> &Self {
        self.subscribe(Observer::Done(Box::new(f)))
    }

    fn subscribe(&self, observer: Observer<T, E>) -> &Self {
        let (completion, caller) = match &*self.inner {
            Inner::Immediate { completion, caller } => (completion.lock().clone(), caller),
            Inner::Cell(cell) => {
                let mut state = cell.state.lock();
                match &mut *state {
                    CellState::Running(observers) => {
                        observers.push(observer);
                        return self;
                    }
                    CellState::Terminal(completion) => (completion.clone(), &cell.caller),
                }
            }
        };
        observer.notify(&completion, caller);
        self
    }

    /// Links `other` to this value: cancelling this value cancels `other`.
    ///
    /// Combinators call this on the value they hand out, with the upstream
    /// as `other`, so cancellation flows back to inflight work. The link
    /// holds `other` until this value completes.
    pub fn bind<S, F>(&self, other: &Eventual<S, F>) -> &Self
    where
        S: Clone + Send + 'static,
        F: Clone + Send + 'static,
    {
        let other = other.clone();
        self.on_cancelled(move || {
            other.cancel();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::DirectCaller;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn direct() -> Arc<dyn Caller> {
        Arc::new(DirectCaller::default())
    }

    fn pending() -> Eventual<u32, &'static str> {
        Eventual::pending(direct())
    }

    // =========================================================================
    // Completion Transition Tests
    // =========================================================================

    #[test]
    fn resolve_wins_once() {
        let value = pending();
        assert!(value.resolve(1));
        assert!(!value.resolve(2));
        assert!(!value.fail("late"));
        assert!(!value.cancel());
        assert!(matches!(value.join(), Completion::Resolved(1)));
    }

    #[test]
    fn fail_wins_once() {
        let value = pending();
        assert!(value.fail("boom"));
        assert!(!value.resolve(1));
        assert!(!value.cancel());
        assert!(matches!(value.join(), Completion::Failed("boom")));
    }

    #[test]
    fn cancel_wins_once() {
        let value = pending();
        assert!(value.cancel());
        assert!(!value.resolve(1));
        assert!(!value.fail("late"));
        assert!(value.is_cancelled());
    }

    #[test]
    fn predicates_track_state() {
        let value = pending();
        assert!(!value.is_done());
        assert!(!value.is_resolved());
        value.resolve(7);
        assert!(value.is_done());
        assert!(value.is_resolved());
        assert!(!value.is_failed());
        assert!(!value.is_cancelled());
    }

    #[test]
    fn concurrent_completions_one_winner() {
        for _ in 0..64 {
            let value: Eventual<u32, u32> = Eventual::pending(direct());
            let winners = Arc::new(AtomicUsize::new(0));
            let threads: Vec<_> = (0..4)
                .map(|i| {
                    let value = value.clone();
                    let winners = Arc::clone(&winners);
                    std::thread::spawn(move || {
                        let won = match i % 3 {
                            0 => value.resolve(i),
                            1 => value.fail(i),
                            _ => value.cancel(),
                        };
                        if won {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().expect("thread");
            }
            assert_eq!(winners.load(Ordering::SeqCst), 1);
        }
    }

    // =========================================================================
    // Observer Tests
    // =========================================================================

    #[test]
    fn observer_notified_exactly_once_on_matching_kind() {
        let value = pending();
        let resolved = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&resolved);
        value.on_resolved(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let f = Arc::clone(&failed);
        value.on_failed(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        value.resolve(3);
        assert!(!value.resolve(4));

        assert_eq!(resolved.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observer_after_complete_runs_before_registration_returns() {
        let value = pending();
        value.resolve(9);

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        value.on_resolved(move |v| {
            s.store(v as usize, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn finished_fires_for_every_terminal_kind() {
        for completion in [
            Completion::Resolved(1),
            Completion::Failed("x"),
            Completion::Cancelled,
        ] {
            let value = pending();
            let fired = Arc::new(AtomicUsize::new(0));
            let f = Arc::clone(&fired);
            value.on_finished(move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
            value.complete_with(completion);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn done_observer_receives_completion() {
        let value = pending();
        let got = Arc::new(parking_lot::Mutex::new(None));
        let g = Arc::clone(&got);
        value.on_done(move |c| {
            *g.lock() = Some(c);
        });
        value.fail("cause");
        assert_eq!(*got.lock(), Some(Completion::Failed("cause")));
    }

    #[test]
    fn panicking_observer_does_not_poison_the_cell() {
        let value = pending();
        value.on_resolved(|_| panic!("observer fault"));
        let after = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&after);
        value.on_resolved(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        assert!(value.resolve(1));
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert!(value.is_resolved());
    }

    // =========================================================================
    // Join Tests
    // =========================================================================

    #[test]
    fn join_blocks_until_completion() {
        let value: Eventual<u32, &'static str> = Eventual::pending(direct());
        let writer = value.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.resolve(11);
        });
        assert!(matches!(value.join(), Completion::Resolved(11)));
        handle.join().expect("thread");
    }

    #[test]
    fn join_now_reports_not_ready() {
        let value = pending();
        assert_eq!(value.join_now(), Err(NotReady));
        value.cancel();
        assert_eq!(value.join_now(), Ok(Completion::Cancelled));
    }

    // =========================================================================
    // Immediate Value Tests
    // =========================================================================

    #[test]
    fn immediate_values_are_frozen() {
        let resolved: Eventual<u32, &'static str> =
            Eventual::immediate(Completion::Resolved(5), direct());
        assert!(resolved.is_resolved());
        assert!(!resolved.resolve(6));
        assert!(!resolved.fail("no"));
        assert!(!resolved.cancel());
        assert!(matches!(resolved.join(), Completion::Resolved(5)));
    }

    #[test]
    fn immediate_observer_dispatches_synchronously() {
        let failed: Eventual<u32, &'static str> =
            Eventual::immediate(Completion::Failed("gone"), direct());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        failed.on_failed(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Bind Tests
    // =========================================================================

    #[test]
    fn bind_propagates_cancel_to_other() {
        let downstream = pending();
        let upstream = pending();
        downstream.bind(&upstream);

        downstream.cancel();
        assert!(upstream.is_cancelled());
    }

    #[test]
    fn bind_does_not_fire_on_resolve() {
        let downstream = pending();
        let upstream = pending();
        downstream.bind(&upstream);

        downstream.resolve(1);
        assert!(!upstream.is_done());
    }

    #[test]
    fn bind_on_already_cancelled_fires_immediately() {
        let downstream = pending();
        downstream.cancel();
        let upstream = pending();
        downstream.bind(&upstream);
        assert!(upstream.is_cancelled());
    }
}
