//! Buffered collection: reduce N eventual values to one.
//!
//! The buffered collector waits for every upstream to reach a terminal
//! state, then decides the aggregate outcome by severity priority:
//! any failure dominates (the first captured cause wins), otherwise any
//! cancellation, otherwise the batch resolved and the results are handed
//! to the reduce step in input order.
//!
//! Cancelling the aggregate cancels every upstream still running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::caller::Caller;
use crate::future::Eventual;
use crate::types::Completion;

type Reduce<S, T, E> = Box<dyn FnOnce(Vec<S>) -> Result<T, E> + Send>;

struct CollectState<S, T, E> {
    /// Result slots, in input order.
    slots: Mutex<Vec<Option<S>>>,
    /// First captured failure cause.
    first_failure: Mutex<Option<E>>,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    countdown: AtomicUsize,
    reduce: Mutex<Option<Reduce<S, T, E>>>,
}

/// Collects `upstreams` into a single value of their results, in input
/// order.
pub(crate) fn collect<T, E>(
    caller: &Arc<dyn Caller>,
    upstreams: Vec<Eventual<T, E>>,
) -> Eventual<Vec<T>, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    collect_with(caller, upstreams, Ok)
}

/// Collects `upstreams` and reduces the successful results through
/// `reduce`, invoked once when every upstream has reported.
///
/// The reduce step only runs on the all-resolved path; failure and
/// cancellation outcomes bypass it.
pub(crate) fn collect_with<S, T, E>(
    caller: &Arc<dyn Caller>,
    upstreams: Vec<Eventual<S, E>>,
    reduce: impl FnOnce(Vec<S>) -> Result<T, E> + Send + 'static,
) -> Eventual<T, E>
where
    S: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let target = Eventual::pending(Arc::clone(caller));
    if upstreams.is_empty() {
        match reduce(Vec::new()) {
            Ok(value) => target.resolve(value),
            Err(cause) => target.fail(cause),
        };
        return target;
    }

    let count = upstreams.len();
    let state = Arc::new(CollectState {
        slots: Mutex::new((0..count).map(|_| None).collect()),
        first_failure: Mutex::new(None),
        failed: AtomicUsize::new(0),
        cancelled: AtomicUsize::new(0),
        countdown: AtomicUsize::new(count),
        reduce: Mutex::new(Some(Box::new(reduce))),
    });

    // Cancellation fan-out is installed before any upstream observer, so a
    // completion can never race past it.
    let cancel_fan = upstreams.clone();
    target.on_cancelled(move || {
        for upstream in &cancel_fan {
            upstream.cancel();
        }
    });

    for (index, upstream) in upstreams.iter().enumerate() {
        let state = Arc::clone(&state);
        let target = target.clone();
        upstream.on_done(move |completion| {
            match completion {
                Completion::Resolved(value) => {
                    state.slots.lock()[index] = Some(value);
                }
                Completion::Failed(cause) => {
                    let mut first = state.first_failure.lock();
                    if first.is_none() {
                        *first = Some(cause);
                    }
                    drop(first);
                    state.failed.fetch_add(1, Ordering::AcqRel);
                }
                Completion::Cancelled => {
                    state.cancelled.fetch_add(1, Ordering::AcqRel);
                }
            }
            if state.countdown.fetch_sub(1, Ordering::AcqRel) == 1 {
                settle(&state, &target);
            }
        });
    }
    target
}

/// Decides the aggregate outcome once every upstream has reported.
fn settle<S, T, E>(state: &CollectState<S, T, E>, target: &Eventual<T, E>)
where
    S: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let failed = state.failed.load(Ordering::Acquire);
    let cancelled = state.cancelled.load(Ordering::Acquire);
    tracing::trace!(failed, cancelled, "collect settled");

    if let Some(cause) = state.first_failure.lock().take() {
        target.fail(cause);
        return;
    }
    if cancelled > 0 {
        target.cancel();
        return;
    }
    let values: Vec<S> = state.slots.lock().drain(..).flatten().collect();
    let Some(reduce) = state.reduce.lock().take() else {
        return;
    };
    match reduce(values) {
        Ok(value) => {
            target.resolve(value);
        }
        Err(cause) => {
            target.fail(cause);
        }
    }
}
