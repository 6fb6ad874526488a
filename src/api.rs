//! The [`Futures`] facade: injected construction of eventual values.
//!
//! A `Futures` value bundles the pieces the primitives need (caller,
//! error sink, executor, clock) and is meant to be passed around the
//! application, preferably through dependency injection. There is no
//! global state: two `Futures` values are fully independent.
//!
//! # Example
//!
//! ```
//! use eventually::{Completion, Futures};
//!
//! let futures = Futures::builder().build();
//! let value = futures.resolved::<_, String>(7);
//! assert!(matches!(value.join(), Completion::Resolved(7)));
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use core::fmt;

use crate::caller::{Caller, DirectCaller, ErrorSink, LoggingErrorSink, PanicPayload, ThreadedCaller};
use crate::clock::{ClockSource, SystemClock};
use crate::combinator::delayed::{self, Factory};
use crate::combinator::retry::{self, RetryError, RetryPolicy, RetryResult};
use crate::combinator::stream::{self, StreamCollector};
use crate::combinator::transform::forward;
use crate::combinator::collect;
use crate::executor::Executor;
use crate::future::Eventual;
use crate::managed::{Managed, ManagedSetup, ReloadableManaged};
use crate::types::Completion;

/// Builder for [`Futures`].
///
/// Unset pieces take defaults: a direct caller, a logging error sink, and
/// the system clock. No executor is configured by default; `call` and the
/// threaded caller require one.
#[derive(Default)]
pub struct FuturesBuilder {
    sink: Option<Arc<dyn ErrorSink>>,
    executor: Option<Arc<dyn Executor>>,
    clock: Option<Arc<dyn ClockSource>>,
    threaded: bool,
}

impl FuturesBuilder {
    /// Creates a builder with every piece unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sink receiving observer faults and leak reports.
    #[must_use]
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the default executor used by `call` and the threaded caller.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the clock source used for retry backoff.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Dispatches observers through the executor instead of inline.
    ///
    /// Requires an executor to be configured.
    #[must_use]
    pub fn threaded_observers(mut self) -> Self {
        self.threaded = true;
        self
    }

    /// Builds the facade.
    ///
    /// # Panics
    ///
    /// Panics if threaded observers were requested without an executor.
    #[must_use]
    pub fn build(self) -> Futures {
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(LoggingErrorSink) as Arc<dyn ErrorSink>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn ClockSource>);
        let threaded_caller = self.executor.as_ref().map(|executor| {
            Arc::new(ThreadedCaller::new(Arc::clone(executor), Arc::clone(&sink)))
                as Arc<dyn Caller>
        });
        let direct_caller =
            Arc::new(DirectCaller::new(Arc::clone(&sink))) as Arc<dyn Caller>;
        let caller = if self.threaded {
            threaded_caller
                .clone()
                .expect("threaded observers require an executor")
        } else {
            Arc::clone(&direct_caller)
        };
        Futures {
            caller,
            threaded_caller,
            executor: self.executor,
            sink,
            clock,
        }
    }
}

impl fmt::Debug for FuturesBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuturesBuilder")
            .field("has_executor", &self.executor.is_some())
            .field("threaded", &self.threaded)
            .finish_non_exhaustive()
    }
}

/// The framework value: constructors, combinator entry points, managed
/// references, and retry, all wired to injected collaborators.
///
/// Cloning is cheap; clones share the same collaborators.
#[derive(Clone)]
pub struct Futures {
    caller: Arc<dyn Caller>,
    threaded_caller: Option<Arc<dyn Caller>>,
    executor: Option<Arc<dyn Executor>>,
    sink: Arc<dyn ErrorSink>,
    clock: Arc<dyn ClockSource>,
}

impl fmt::Debug for Futures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Futures")
            .field("has_executor", &self.executor.is_some())
            .finish_non_exhaustive()
    }
}

impl Futures {
    /// Starts building a facade.
    #[must_use]
    pub fn builder() -> FuturesBuilder {
        FuturesBuilder::new()
    }

    /// The default caller.
    #[must_use]
    pub fn caller(&self) -> &Arc<dyn Caller> {
        &self.caller
    }

    /// A caller that dispatches observers on the executor.
    ///
    /// # Panics
    ///
    /// Panics if no executor is configured.
    #[must_use]
    pub fn threaded_caller(&self) -> Arc<dyn Caller> {
        self.threaded_caller
            .clone()
            .expect("no default executor configured")
    }

    fn default_executor(&self) -> Arc<dyn Executor> {
        self.executor
            .clone()
            .expect("no default executor configured")
    }

    /// Creates a pending, externally completable value.
    #[must_use]
    pub fn future<T, E>(&self) -> Eventual<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        Eventual::pending(Arc::clone(&self.caller))
    }

    /// Creates an already-resolved value.
    #[must_use]
    pub fn resolved<T, E>(&self, value: T) -> Eventual<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        Eventual::immediate(Completion::Resolved(value), Arc::clone(&self.caller))
    }

    /// Creates an already-failed value.
    #[must_use]
    pub fn failed<T, E>(&self, cause: E) -> Eventual<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        Eventual::immediate(Completion::Failed(cause), Arc::clone(&self.caller))
    }

    /// Creates an already-cancelled value.
    #[must_use]
    pub fn cancelled<T, E>(&self) -> Eventual<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        Eventual::immediate(Completion::Cancelled, Arc::clone(&self.caller))
    }

    /// Collects `futures` into a single value of their results, in input
    /// order.
    #[must_use]
    pub fn collect<T, E>(&self, futures: Vec<Eventual<T, E>>) -> Eventual<Vec<T>, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        collect::collect(&self.caller, futures)
    }

    /// Collects `futures` and reduces the successful results through
    /// `reduce`.
    #[must_use]
    pub fn collect_with<S, T, E>(
        &self,
        futures: Vec<Eventual<S, E>>,
        reduce: impl FnOnce(Vec<S>) -> Result<T, E> + Send + 'static,
    ) -> Eventual<T, E>
    where
        S: Clone + Send + 'static,
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        collect::collect_with(&self.caller, futures, reduce)
    }

    /// Collects `futures` through a streaming collector, keeping per-result
    /// memory constant.
    #[must_use]
    pub fn collect_stream<S, E, C>(
        &self,
        futures: Vec<Eventual<S, E>>,
        collector: Arc<C>,
    ) -> Eventual<C::Output, E>
    where
        S: Clone + Send + 'static,
        E: Clone + Send + 'static,
        C: StreamCollector<S, E>,
        C::Output: Clone + Send + 'static,
    {
        stream::collect_stream(&self.caller, futures, collector)
    }

    /// Collects `futures`, discarding their results.
    #[must_use]
    pub fn collect_and_discard<S, E>(&self, futures: Vec<Eventual<S, E>>) -> Eventual<(), E>
    where
        S: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        stream::collect_and_discard(&self.caller, futures)
    }

    /// Lazily collects the values produced by `factories`, keeping at most
    /// `parallelism` in flight at once.
    ///
    /// A `parallelism` of zero is treated as one.
    #[must_use]
    pub fn eventually_collect<S, E, C>(
        &self,
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
        delayed::eventually_collect(&self.caller, factories, collector, parallelism)
    }

    /// Runs `f` on the default executor, tracking its result.
    ///
    /// A panicking callable is reported to the error sink and the returned
    /// value is cancelled.
    ///
    /// # Panics
    ///
    /// Panics if no default executor is configured.
    #[must_use]
    pub fn call<T, E>(
        &self,
        f: impl FnOnce() -> Result<T, E> + Send + 'static,
    ) -> Eventual<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        self.call_on(&self.default_executor(), f)
    }

    /// Runs `f` on the given executor, tracking its result.
    #[must_use]
    pub fn call_on<T, E>(
        &self,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce() -> Result<T, E> + Send + 'static,
    ) -> Eventual<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let target: Eventual<T, E> = Eventual::pending(Arc::clone(&self.caller));
        let task_target = target.clone();
        let sink = Arc::clone(&self.sink);
        executor.execute(Box::new(move || {
            if task_target.is_done() {
                // Cancelled before the executor got to it; skip the work.
                return;
            }
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(value)) => {
                    task_target.resolve(value);
                }
                Ok(Err(cause)) => {
                    task_target.fail(cause);
                }
                Err(payload) => {
                    sink.uncaught("call", PanicPayload::from_unwind(payload.as_ref()));
                    task_target.cancel();
                }
            }
        }));
        target
    }

    /// Runs `f` on the default executor and forwards the completion of the
    /// value it returns.
    ///
    /// # Panics
    ///
    /// Panics if no default executor is configured.
    #[must_use]
    pub fn lazy_call<T, E>(
        &self,
        f: impl FnOnce() -> Eventual<T, E> + Send + 'static,
    ) -> Eventual<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        self.lazy_call_on(&self.default_executor(), f)
    }

    /// Runs `f` on the given executor and forwards the completion of the
    /// value it returns.
    #[must_use]
    pub fn lazy_call_on<T, E>(
        &self,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce() -> Eventual<T, E> + Send + 'static,
    ) -> Eventual<T, E>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let target: Eventual<T, E> = Eventual::pending(Arc::clone(&self.caller));
        let task_target = target.clone();
        let sink = Arc::clone(&self.sink);
        executor.execute(Box::new(move || {
            if task_target.is_done() {
                return;
            }
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(produced) => forward(&produced, &task_target),
                Err(payload) => {
                    sink.uncaught("lazy_call", PanicPayload::from_unwind(payload.as_ref()));
                    task_target.cancel();
                }
            }
        }));
        target
    }

    /// Wraps `setup` in a managed reference.
    #[must_use]
    pub fn managed<T, E>(&self, setup: impl ManagedSetup<T, E>) -> Managed<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + 'static,
    {
        Managed::new(setup, Arc::clone(&self.caller))
    }

    /// Wraps `setup` in a reloadable managed reference.
    #[must_use]
    pub fn reloadable_managed<T, E>(
        &self,
        setup: impl ManagedSetup<T, E>,
    ) -> ReloadableManaged<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + 'static,
    {
        ReloadableManaged::new(setup, Arc::clone(&self.caller))
    }

    /// Re-invokes `factory` under `policy` until an attempt resolves,
    /// using the configured clock for backoff.
    #[must_use]
    pub fn retry_until_resolved<T, E>(
        &self,
        factory: impl Fn() -> Eventual<T, E> + Send + Sync + 'static,
        policy: Arc<dyn RetryPolicy>,
    ) -> Eventual<RetryResult<T, E>, RetryError<E>>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        retry::retry_until_resolved(&self.caller, factory, policy, Arc::clone(&self.clock))
    }

    /// Re-invokes `factory` under `policy`, with an explicit clock source.
    #[must_use]
    pub fn retry_until_resolved_with<T, E>(
        &self,
        factory: impl Fn() -> Eventual<T, E> + Send + Sync + 'static,
        policy: Arc<dyn RetryPolicy>,
        clock: Arc<dyn ClockSource>,
    ) -> Eventual<RetryResult<T, E>, RetryError<E>>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        retry::retry_until_resolved(&self.caller, factory, policy, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPoolExecutor;
    use std::time::Duration;

    #[test]
    fn constructors_produce_expected_states() {
        let futures = Futures::builder().build();

        let pending = futures.future::<u32, String>();
        assert!(!pending.is_done());

        assert!(futures.resolved::<_, String>(1).is_resolved());
        assert!(futures.failed::<u32, _>("x".to_owned()).is_failed());
        assert!(futures.cancelled::<u32, String>().is_cancelled());
    }

    #[test]
    fn call_tracks_result_on_executor() {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPoolExecutor::new(1));
        let futures = Futures::builder().executor(pool).build();

        let ok = futures.call(|| Ok::<_, String>(21 * 2));
        assert!(matches!(ok.join(), Completion::Resolved(42)));

        let err = futures.call(|| Err::<u32, _>("broke".to_owned()));
        assert!(matches!(err.join(), Completion::Failed(ref e) if e == "broke"));
    }

    #[test]
    fn call_panic_cancels_and_reports() {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPoolExecutor::new(1));
        let futures = Futures::builder().executor(pool).build();

        let out = futures.call::<u32, String>(|| panic!("callable fault"));
        assert!(matches!(out.join(), Completion::Cancelled));
    }

    #[test]
    fn cancelled_call_skips_the_work() {
        let pool = Arc::new(ThreadPoolExecutor::new(1));
        // Block the single worker so the call stays queued.
        let gate = Arc::new(std::sync::Barrier::new(2));
        let held = Arc::clone(&gate);
        pool.execute(Box::new(move || {
            held.wait();
        }));

        let futures = Futures::builder()
            .executor(Arc::clone(&pool) as Arc<dyn Executor>)
            .build();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let out = futures.call(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, String>(1)
        });

        out.cancel();
        gate.wait();
        pool.shutdown();

        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn lazy_call_forwards_inner_completion() {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPoolExecutor::new(1));
        let futures = Futures::builder().executor(pool).build();

        let inner_futures = futures.clone();
        let out = futures.lazy_call(move || inner_futures.resolved::<_, String>(9));
        assert!(matches!(out.join(), Completion::Resolved(9)));
    }

    #[test]
    #[should_panic(expected = "no default executor configured")]
    fn call_without_executor_panics() {
        let futures = Futures::builder().build();
        let _ = futures.call(|| Ok::<_, String>(1));
    }

    #[test]
    fn threaded_observers_dispatch_off_thread() {
        let pool: Arc<dyn Executor> = Arc::new(ThreadPoolExecutor::new(1));
        let futures = Futures::builder()
            .executor(pool)
            .threaded_observers()
            .build();

        let value = futures.future::<u32, String>();
        let (tx, rx) = std::sync::mpsc::channel();
        let completer = std::thread::current().id();
        value.on_resolved(move |_| {
            tx.send(std::thread::current().id()).ok();
        });
        value.resolve(1);

        let observer_thread = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("observer ran");
        assert_ne!(observer_thread, completer);
    }
}
