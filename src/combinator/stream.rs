//! Streaming collection: reduce N eventual values without buffering them.
//!
//! A [`StreamCollector`] consumes results as they arrive, so per-result
//! memory stays constant beyond whatever the collector itself retains.
//! Each upstream completion is forwarded to the collector through the
//! caller; when every upstream has reported, `end` receives the tally and
//! its return value settles the aggregate.
//!
//! `collect_and_discard` is the payload-free specialization: results are
//! dropped and the aggregate settles with the buffered collector's
//! priority, failure first, then cancellation, then success.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::caller::Caller;
use crate::future::Eventual;
use crate::types::Completion;

/// Reduces a stream of completions as they arrive.
///
/// The per-item callbacks run through the caller, so a panic in one is
/// isolated and reported rather than corrupting the aggregate. `end` is
/// invoked exactly once, after every upstream has reported; its `Err`
/// fails the aggregate.
///
/// Implementations are shared across completing threads and use interior
/// mutability for any state they accumulate.
pub trait StreamCollector<S, E>: Send + Sync + 'static {
    /// The aggregate value produced by [`StreamCollector::end`].
    type Output;

    /// An upstream resolved with `value`.
    fn resolved(&self, value: S);

    /// An upstream failed with `cause`.
    fn failed(&self, cause: E);

    /// An upstream was cancelled.
    fn cancelled(&self);

    /// Every upstream has reported; produce the aggregate value.
    fn end(&self, resolved: usize, failed: usize, cancelled: usize) -> Result<Self::Output, E>;
}

struct StreamState {
    resolved: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    countdown: AtomicUsize,
}

/// Collects `upstreams` through a streaming collector.
pub(crate) fn collect_stream<S, E, C>(
    caller: &Arc<dyn Caller>,
    upstreams: Vec<Eventual<S, E>>,
    collector: Arc<C>,
) -> Eventual<C::Output, E>
where
    S: Clone + Send + 'static,
    E: Clone + Send + 'static,
    C: StreamCollector<S, E>,
    C::Output: Clone + Send + 'static,
{
    let target = Eventual::pending(Arc::clone(caller));
    if upstreams.is_empty() {
        finish::<S, E, C>(&collector, &StreamState::new(0), &target);
        return target;
    }

    let state = Arc::new(StreamState::new(upstreams.len()));

    let cancel_fan = upstreams.clone();
    target.on_cancelled(move || {
        for upstream in &cancel_fan {
            upstream.cancel();
        }
    });

    for upstream in &upstreams {
        let caller = Arc::clone(caller);
        let collector = Arc::clone(&collector);
        let state = Arc::clone(&state);
        let target = target.clone();
        upstream.on_done(move |completion| {
            forward(&caller, &collector, &state, completion);
            if state.countdown.fetch_sub(1, Ordering::AcqRel) == 1 {
                finish::<S, E, C>(&collector, &state, &target);
            }
        });
    }
    target
}

impl StreamState {
    fn new(count: usize) -> Self {
        Self {
            resolved: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            countdown: AtomicUsize::new(count),
        }
    }
}

/// Routes one completion into the collector through the caller and bumps
/// the matching tally.
fn forward<S, E, C>(
    caller: &Arc<dyn Caller>,
    collector: &Arc<C>,
    state: &StreamState,
    completion: Completion<S, E>,
) where
    S: Clone + Send + 'static,
    E: Clone + Send + 'static,
    C: StreamCollector<S, E>,
{
    match completion {
        Completion::Resolved(value) => {
            state.resolved.fetch_add(1, Ordering::AcqRel);
            let collector = Arc::clone(collector);
            caller.invoke("stream::resolved", Box::new(move || collector.resolved(value)));
        }
        Completion::Failed(cause) => {
            state.failed.fetch_add(1, Ordering::AcqRel);
            let collector = Arc::clone(collector);
            caller.invoke("stream::failed", Box::new(move || collector.failed(cause)));
        }
        Completion::Cancelled => {
            state.cancelled.fetch_add(1, Ordering::AcqRel);
            let collector = Arc::clone(collector);
            caller.invoke("stream::cancelled", Box::new(move || collector.cancelled()));
        }
    }
}

fn finish<S, E, C>(collector: &Arc<C>, state: &StreamState, target: &Eventual<C::Output, E>)
where
    S: Clone + Send + 'static,
    E: Clone + Send + 'static,
    C: StreamCollector<S, E>,
    C::Output: Clone + Send + 'static,
{
    let resolved = state.resolved.load(Ordering::Acquire);
    let failed = state.failed.load(Ordering::Acquire);
    let cancelled = state.cancelled.load(Ordering::Acquire);
    match collector.end(resolved, failed, cancelled) {
        Ok(value) => {
            target.resolve(value);
        }
        Err(cause) => {
            target.fail(cause);
        }
    }
}

struct DiscardState<E> {
    first_failure: Mutex<Option<E>>,
    cancelled: AtomicUsize,
    countdown: AtomicUsize,
}

/// Collects `upstreams`, discarding their results.
///
/// The aggregate settles by the same priority as the buffered collector:
/// the first failure cause, else cancellation if any upstream was
/// cancelled, else resolution with `()`.
pub(crate) fn collect_and_discard<S, E>(
    caller: &Arc<dyn Caller>,
    upstreams: Vec<Eventual<S, E>>,
) -> Eventual<(), E>
where
    S: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let target = Eventual::pending(Arc::clone(caller));
    if upstreams.is_empty() {
        target.resolve(());
        return target;
    }

    let state = Arc::new(DiscardState {
        first_failure: Mutex::new(None),
        cancelled: AtomicUsize::new(0),
        countdown: AtomicUsize::new(upstreams.len()),
    });

    let cancel_fan = upstreams.clone();
    target.on_cancelled(move || {
        for upstream in &cancel_fan {
            upstream.cancel();
        }
    });

    for upstream in &upstreams {
        let state = Arc::clone(&state);
        let target = target.clone();
        upstream.on_done(move |completion| {
            match completion {
                Completion::Resolved(_) => {}
                Completion::Failed(cause) => {
                    let mut first = state.first_failure.lock();
                    if first.is_none() {
                        *first = Some(cause);
                    }
                }
                Completion::Cancelled => {
                    state.cancelled.fetch_add(1, Ordering::AcqRel);
                }
            }
            if state.countdown.fetch_sub(1, Ordering::AcqRel) == 1 {
                if let Some(cause) = state.first_failure.lock().take() {
                    target.fail(cause);
                } else if state.cancelled.load(Ordering::Acquire) > 0 {
                    target.cancel();
                } else {
                    target.resolve(());
                }
            }
        });
    }
    target
}
