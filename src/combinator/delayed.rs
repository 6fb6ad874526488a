//! Bounded-parallelism lazy collection.
//!
//! Given an ordered sequence of factories and a parallelism bound P, the
//! coordinator keeps at most P produced values in flight at once, feeding
//! every completion into a streaming collector. Factories are invoked in
//! input order; completion order is unconstrained.
//!
//! # Abort Semantics
//!
//! On the first failure or cancellation of any started value, the
//! coordinator stops invoking further factories, cancels everything in
//! flight, and keeps observing until the counters drain. Factories that
//! were never invoked count as cancelled in the final tally and are
//! reported to the collector as cancellations. Cancelling the aggregate
//! triggers the same path.
//!
//! A factory that fails synchronously is expressed by returning an
//! already-failed value; the coordinator treats it exactly like an
//! asynchronous failure.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::caller::Caller;
use crate::combinator::stream::StreamCollector;
use crate::future::Eventual;
use crate::types::Completion;

/// A deferred producer of an eventual value.
pub type Factory<S, E> = Box<dyn FnOnce() -> Eventual<S, E> + Send>;

struct Coordinator<S, E, C>
where
    C: StreamCollector<S, E>,
{
    caller: Arc<dyn Caller>,
    collector: Arc<C>,
    target: Eventual<C::Output, E>,
    parallelism: usize,
    inner: Mutex<Inner<S, E>>,
}

struct Inner<S, E> {
    /// Factories not yet invoked, in input order.
    factories: VecDeque<Factory<S, E>>,
    /// Started values that have not reported yet.
    inflight: Vec<(u64, Eventual<S, E>)>,
    next_id: u64,
    /// Count of started-but-unfinished values.
    pending: usize,
    resolved: usize,
    failed: usize,
    cancelled: usize,
    aborted: bool,
    ended: bool,
}

/// Lazily collects the values produced by `factories`, keeping at most
/// `parallelism` of them in flight at once.
pub(crate) fn eventually_collect<S, E, C>(
    caller: &Arc<dyn Caller>,
    factories: Vec<Factory<S, E>>,
    collector: Arc<C>,
    parallelism: usize,
) -> Eventual<C::Output, E>
where
    S: Clone + Send + 'static,
    E: Clone + Send + 'static,
    C: StreamCollector<S, E>,
    C::Output: Clone + Send + 'static,
{
    let target = Eventual::pending(Arc::clone(caller));
    let coordinator = Arc::new(Coordinator {
        caller: Arc::clone(caller),
        collector,
        target: target.clone(),
        parallelism: parallelism.max(1),
        inner: Mutex::new(Inner {
            factories: factories.into(),
            inflight: Vec::new(),
            next_id: 0,
            pending: 0,
            resolved: 0,
            failed: 0,
            cancelled: 0,
            aborted: false,
            ended: false,
        }),
    });

    let on_cancel = Arc::clone(&coordinator);
    target.on_cancelled(move || Coordinator::abort(&on_cancel));

    Coordinator::pump(&coordinator);
    target
}

impl<S, E, C> Coordinator<S, E, C>
where
    S: Clone + Send + 'static,
    E: Clone + Send + 'static,
    C: StreamCollector<S, E>,
    C::Output: Clone + Send + 'static,
{
    /// Starts factories until the parallelism bound is reached or none
    /// remain, then settles if everything has already reported.
    fn pump(this: &Arc<Self>) {
        loop {
            let factory = {
                let mut inner = this.inner.lock();
                if inner.aborted || inner.pending >= this.parallelism {
                    break;
                }
                let Some(factory) = inner.factories.pop_front() else {
                    break;
                };
                inner.pending += 1;
                factory
            };
            Self::start(this, factory);
        }
        this.maybe_end();
    }

    fn start(this: &Arc<Self>, factory: Factory<S, E>) {
        // The factory is user code; it runs without any coordinator lock.
        let produced = factory();
        let id = {
            let mut inner = this.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.inflight.push((id, produced.clone()));
            id
        };
        let coordinator = Arc::clone(this);
        produced.on_done(move |completion| Self::upstream_done(&coordinator, id, completion));
        if this.inner.lock().aborted {
            produced.cancel();
        }
    }

    fn upstream_done(this: &Arc<Self>, id: u64, completion: Completion<S, E>) {
        let abort = {
            let mut inner = this.inner.lock();
            inner.pending -= 1;
            inner.inflight.retain(|(inflight_id, _)| *inflight_id != id);
            match &completion {
                Completion::Resolved(_) => inner.resolved += 1,
                Completion::Failed(_) => inner.failed += 1,
                Completion::Cancelled => inner.cancelled += 1,
            }
            !completion.is_resolved() && !inner.aborted
        };

        this.notify(completion);

        if abort {
            Self::abort(this);
        } else {
            Self::pump(this);
        }
    }

    /// Forwards one completion into the collector through the caller.
    fn notify(&self, completion: Completion<S, E>) {
        let collector = Arc::clone(&self.collector);
        match completion {
            Completion::Resolved(value) => self.caller.invoke(
                "stream::resolved",
                Box::new(move || collector.resolved(value)),
            ),
            Completion::Failed(cause) => self
                .caller
                .invoke("stream::failed", Box::new(move || collector.failed(cause))),
            Completion::Cancelled => self
                .caller
                .invoke("stream::cancelled", Box::new(move || collector.cancelled())),
        }
    }

    /// Stops invoking factories, tallies the uninvoked ones as cancelled,
    /// and cancels everything in flight.
    fn abort(this: &Arc<Self>) {
        let (uninvoked, inflight) = {
            let mut inner = this.inner.lock();
            if inner.aborted {
                (0, Vec::new())
            } else {
                inner.aborted = true;
                let uninvoked = inner.factories.len();
                inner.factories.clear();
                inner.cancelled += uninvoked;
                (uninvoked, inner.inflight.clone())
            }
        };
        if uninvoked > 0 || !inflight.is_empty() {
            tracing::debug!(
                uninvoked,
                inflight = inflight.len(),
                "lazy collect aborted"
            );
        }
        for _ in 0..uninvoked {
            let collector = Arc::clone(&this.collector);
            this.caller
                .invoke("stream::cancelled", Box::new(move || collector.cancelled()));
        }
        for (_, produced) in inflight {
            produced.cancel();
        }
        this.maybe_end();
    }

    /// Settles the aggregate once nothing is pending and nothing more will
    /// start.
    fn maybe_end(&self) {
        let (resolved, failed, cancelled) = {
            let mut inner = self.inner.lock();
            if inner.ended || inner.pending > 0 || !inner.factories.is_empty() {
                return;
            }
            inner.ended = true;
            (inner.resolved, inner.failed, inner.cancelled)
        };
        match self.collector.end(resolved, failed, cancelled) {
            Ok(value) => {
                self.target.resolve(value);
            }
            Err(cause) => {
                self.target.fail(cause);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::DirectCaller;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn direct() -> Arc<dyn Caller> {
        Arc::new(DirectCaller::default())
    }

    /// Counts stream events and records the final tally.
    #[derive(Default)]
    struct Recording {
        resolved: AtomicUsize,
        failed: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl StreamCollector<u32, &'static str> for Recording {
        type Output = (usize, usize, usize);

        fn resolved(&self, _value: u32) {
            self.resolved.fetch_add(1, Ordering::AcqRel);
        }

        fn failed(&self, _cause: &'static str) {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }

        fn cancelled(&self) {
            self.cancelled.fetch_add(1, Ordering::AcqRel);
        }

        fn end(
            &self,
            resolved: usize,
            failed: usize,
            cancelled: usize,
        ) -> Result<Self::Output, &'static str> {
            Ok((resolved, failed, cancelled))
        }
    }

    fn resolved_factory(value: u32) -> Factory<u32, &'static str> {
        Box::new(move || Eventual::immediate(Completion::Resolved(value), direct()))
    }

    fn failed_factory(cause: &'static str) -> Factory<u32, &'static str> {
        Box::new(move || Eventual::immediate(Completion::Failed(cause), direct()))
    }

    // =========================================================================
    // Basic Flow Tests
    // =========================================================================

    #[test]
    fn collects_all_with_parallelism_one() {
        let caller = direct();
        let out = eventually_collect(
            &caller,
            vec![resolved_factory(1), resolved_factory(2)],
            Arc::new(Recording::default()),
            1,
        );
        assert!(matches!(out.join(), Completion::Resolved((2, 0, 0))));
    }

    #[test]
    fn empty_factories_end_immediately() {
        let caller = direct();
        let out = eventually_collect(
            &caller,
            Vec::<Factory<u32, &'static str>>::new(),
            Arc::new(Recording::default()),
            4,
        );
        assert!(matches!(out.join(), Completion::Resolved((0, 0, 0))));
    }

    #[test]
    fn factories_invoked_in_input_order() {
        let caller = direct();
        let order = Arc::new(Mutex::new(Vec::new()));
        let factories: Vec<Factory<u32, &'static str>> = (0..4u32)
            .map(|i| {
                let order = Arc::clone(&order);
                Box::new(move || {
                    order.lock().push(i);
                    Eventual::immediate(Completion::Resolved(i), direct())
                }) as Factory<u32, &'static str>
            })
            .collect();

        let out = eventually_collect(&caller, factories, Arc::new(Recording::default()), 2);
        assert!(matches!(out.join(), Completion::Resolved((4, 0, 0))));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    // =========================================================================
    // Parallelism Bound Tests
    // =========================================================================

    #[test]
    fn never_exceeds_parallelism_bound() {
        let caller = direct();
        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let factories: Vec<Factory<u32, &'static str>> = (0..8)
            .map(|i| {
                let inflight = Arc::clone(&inflight);
                let peak = Arc::clone(&peak);
                Box::new(move || {
                    let now = inflight.fetch_add(1, Ordering::AcqRel) + 1;
                    peak.fetch_max(now, Ordering::AcqRel);
                    let value: Eventual<u32, &'static str> =
                        Eventual::pending(Arc::new(DirectCaller::default()));
                    let release = Arc::clone(&inflight);
                    value.on_finished(move || {
                        release.fetch_sub(1, Ordering::AcqRel);
                    });
                    value.resolve(i);
                    value
                }) as Factory<u32, &'static str>
            })
            .collect();

        let out = eventually_collect(&caller, factories, Arc::new(Recording::default()), 3);
        assert!(matches!(out.join(), Completion::Resolved((8, 0, 0))));
        assert!(peak.load(Ordering::Acquire) <= 3);
    }

    // =========================================================================
    // Abort Tests
    // =========================================================================

    #[test]
    fn failure_aborts_and_tallies_uninvoked_as_cancelled() {
        let caller = direct();
        let invoked = Arc::new(AtomicUsize::new(0));
        let counting = |value: u32| -> Factory<u32, &'static str> {
            let invoked = Arc::clone(&invoked);
            Box::new(move || {
                invoked.fetch_add(1, Ordering::AcqRel);
                Eventual::immediate(Completion::Resolved(value), direct())
            })
        };

        let factories = vec![
            counting(1),
            failed_factory("E"),
            counting(3),
            counting(4),
        ];
        let out = eventually_collect(&caller, factories, Arc::new(Recording::default()), 1);

        assert!(matches!(out.join(), Completion::Resolved((1, 1, 2))));
        // Only the first counting factory ran; the two after the failure
        // were never invoked.
        assert_eq!(invoked.load(Ordering::Acquire), 1);
    }

    #[test]
    fn cancelling_aggregate_stops_everything() {
        let caller = direct();
        let invoked = Arc::new(AtomicUsize::new(0));
        let gate: Eventual<u32, &'static str> = Eventual::pending(Arc::clone(&caller));

        let mut factories: Vec<Factory<u32, &'static str>> = Vec::new();
        let first_gate = gate.clone();
        factories.push(Box::new(move || first_gate));
        for i in 0..3 {
            let invoked = Arc::clone(&invoked);
            factories.push(Box::new(move || {
                invoked.fetch_add(1, Ordering::AcqRel);
                Eventual::immediate(Completion::Resolved(i), direct())
            }));
        }

        let collector = Arc::new(Recording::default());
        let out = eventually_collect(&caller, factories, collector, 1);

        out.cancel();

        // The gated value was cancelled and the remaining three factories
        // never ran.
        assert!(gate.is_cancelled());
        assert_eq!(invoked.load(Ordering::Acquire), 0);
    }

    #[test]
    fn abort_after_first_resolution_reports_remaining_as_cancelled() {
        let caller = direct();
        let gate: Eventual<u32, &'static str> = Eventual::pending(Arc::clone(&caller));

        let mut factories: Vec<Factory<u32, &'static str>> = vec![resolved_factory(7)];
        let second_gate = gate.clone();
        factories.push(Box::new(move || second_gate));
        factories.push(resolved_factory(8));
        factories.push(resolved_factory(9));

        let out = eventually_collect(&caller, factories, Arc::new(Recording::default()), 1);
        assert!(!out.is_done());

        // Abort while the second value is in flight.
        gate.cancel();

        assert!(matches!(out.join(), Completion::Resolved((1, 0, 3))));
    }
}
