//! Retry: re-invoke a factory under a policy until success or abort.
//!
//! A [`RetryPolicy`] maps the time elapsed since the operation started to a
//! decision: retry after a backoff delay, or abort. The driver is a
//! non-blocking state machine: each failed attempt records its cause,
//! consults the policy, and either fails the aggregate with a composite
//! error or schedules the next attempt on the injected clock source.
//!
//! # Cancellation Handling
//!
//! - Cancelling the aggregate cancels the inflight attempt and prevents
//!   any further attempt from starting
//! - An attempt that is itself cancelled cancels the aggregate

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use core::fmt;
use parking_lot::Mutex;

use crate::caller::Caller;
use crate::clock::ClockSource;
use crate::future::Eventual;
use crate::types::Completion;
use crate::util::det_rng::DetRng;

/// A policy's verdict on one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given backoff delay.
    Retry(Duration),
    /// Give up; the aggregate fails with the accumulated causes.
    Abort,
}

/// Maps elapsed time to a retry decision.
///
/// Policies see only the time elapsed since the operation started, which
/// keeps them reusable across concurrent operations. Jittered policies may
/// perturb the delay through interior state.
pub trait RetryPolicy: Send + Sync + 'static {
    /// Decides whether to retry, given the time elapsed since the first
    /// attempt began.
    fn decide(&self, elapsed: Duration) -> RetryDecision;
}

/// Retries forever with a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct LinearPolicy {
    delay: Duration,
}

impl LinearPolicy {
    /// Creates a policy that always retries after `delay`.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryPolicy for LinearPolicy {
    fn decide(&self, _elapsed: Duration) -> RetryDecision {
        RetryDecision::Retry(self.delay)
    }
}

/// Retries forever with exponentially growing delays.
///
/// The delay starts at `initial` and grows by `multiplier` along the ideal
/// backoff timeline, capped at `max_delay`. The growth step is derived from
/// elapsed time, so the policy itself stays stateless.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialPolicy {
    initial: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl ExponentialPolicy {
    /// Creates a doubling policy starting at `initial`, capped at
    /// `initial * 2^10`.
    #[must_use]
    pub fn new(initial: Duration) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max_delay: initial.saturating_mul(1024),
        }
    }

    /// Sets the backoff multiplier; values below 1.0 are clamped to 1.0.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Caps the delay between attempts.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl RetryPolicy for ExponentialPolicy {
    #[allow(
        clippy::cast_possible_truncation, // delays are far below u64::MAX nanos
        clippy::cast_precision_loss,      // acceptable for backoff arithmetic
        clippy::cast_sign_loss,           // capped values are non-negative
    )]
    fn decide(&self, elapsed: Duration) -> RetryDecision {
        let initial = self.initial.as_nanos() as f64;
        if initial <= 0.0 || self.multiplier <= 1.0 {
            return RetryDecision::Retry(self.initial.min(self.max_delay));
        }
        // On the ideal timeline the k-th retry starts after
        // initial * (m^k - 1) / (m - 1); inverting that recovers the step.
        let elapsed = elapsed.as_nanos() as f64;
        let ratio = 1.0 + elapsed * (self.multiplier - 1.0) / initial;
        // The epsilon absorbs log rounding on exact powers of the multiplier.
        let step = (ratio.log(self.multiplier) + 1e-9).floor().max(0.0);
        let delay = initial * self.multiplier.powf(step);
        let capped = delay.min(self.max_delay.as_nanos() as f64);
        RetryDecision::Retry(Duration::from_nanos(capped as u64))
    }
}

/// Bounds another policy by total elapsed time.
///
/// Aborts once `limit` has elapsed; delegates to the inner policy below it.
pub struct TimedPolicy {
    limit: Duration,
    inner: Arc<dyn RetryPolicy>,
}

impl TimedPolicy {
    /// Creates a policy that aborts after `limit`, otherwise deferring to
    /// `inner`.
    #[must_use]
    pub fn new(limit: Duration, inner: Arc<dyn RetryPolicy>) -> Self {
        Self { limit, inner }
    }
}

impl fmt::Debug for TimedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedPolicy")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy for TimedPolicy {
    fn decide(&self, elapsed: Duration) -> RetryDecision {
        if elapsed >= self.limit {
            RetryDecision::Abort
        } else {
            self.inner.decide(elapsed)
        }
    }
}

/// Bounds another policy by failed-attempt count.
///
/// Permits `limit` retries, then aborts; within the limit it defers to
/// the inner policy for the backoff delay. The count is interior state,
/// so give each retried operation its own instance (the same sharing
/// caveat as [`JitteredPolicy`]'s generator).
pub struct MaxRetriesPolicy {
    limit: usize,
    used: AtomicUsize,
    inner: Arc<dyn RetryPolicy>,
}

impl MaxRetriesPolicy {
    /// Wraps `inner`, allowing at most `limit` retries.
    ///
    /// A `limit` of zero aborts on the first failure.
    #[must_use]
    pub fn new(limit: usize, inner: Arc<dyn RetryPolicy>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            inner,
        }
    }

    /// Number of retries granted so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire).min(self.limit)
    }
}

impl fmt::Debug for MaxRetriesPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaxRetriesPolicy")
            .field("limit", &self.limit)
            .field("used", &self.used())
            .finish_non_exhaustive()
    }
}

impl RetryPolicy for MaxRetriesPolicy {
    fn decide(&self, elapsed: Duration) -> RetryDecision {
        if self.used.fetch_add(1, Ordering::AcqRel) >= self.limit {
            return RetryDecision::Abort;
        }
        self.inner.decide(elapsed)
    }
}

/// Adds deterministic jitter on top of another policy's delays.
///
/// Each `Retry` delay is scaled by `1 + factor * u` where `u` is drawn
/// from a seeded deterministic generator, so test runs reproduce exactly.
pub struct JitteredPolicy {
    inner: Arc<dyn RetryPolicy>,
    factor: f64,
    rng: Mutex<DetRng>,
}

impl JitteredPolicy {
    /// Wraps `inner`, scaling delays by up to `factor` (clamped to
    /// `0.0..=1.0`), drawing jitter from `seed`.
    #[must_use]
    pub fn new(inner: Arc<dyn RetryPolicy>, factor: f64, seed: u64) -> Self {
        Self {
            inner,
            factor: factor.clamp(0.0, 1.0),
            rng: Mutex::new(DetRng::new(seed)),
        }
    }
}

impl fmt::Debug for JitteredPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitteredPolicy")
            .field("factor", &self.factor)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy for JitteredPolicy {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
    )]
    fn decide(&self, elapsed: Duration) -> RetryDecision {
        match self.inner.decide(elapsed) {
            RetryDecision::Abort => RetryDecision::Abort,
            RetryDecision::Retry(delay) => {
                let unit = self.rng.lock().next_f64();
                let scaled = delay.as_nanos() as f64 * (1.0 + self.factor * unit);
                RetryDecision::Retry(Duration::from_nanos(scaled as u64))
            }
        }
    }
}

/// The successful outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryResult<T, E> {
    /// The value of the first resolved attempt.
    pub value: T,
    /// Causes of the failed attempts that preceded it, in order.
    pub errors: Vec<E>,
}

/// Composite failure carrying every intermediate cause in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError<E> {
    errors: Vec<E>,
}

impl<E> RetryError<E> {
    pub(crate) fn new(errors: Vec<E>) -> Self {
        Self { errors }
    }

    /// Number of failed attempts.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.errors.len()
    }

    /// The cause of the final attempt, if any attempt ran.
    #[must_use]
    pub fn last(&self) -> Option<&E> {
        self.errors.last()
    }

    /// Every intermediate cause, in order of occurrence.
    #[must_use]
    pub fn causes(&self) -> &[E] {
        &self.errors
    }

    /// Consumes the error, returning the causes.
    #[must_use]
    pub fn into_causes(self) -> Vec<E> {
        self.errors
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry aborted after {} failed attempts", self.errors.len())?;
        if let Some(last) = self.errors.last() {
            write!(f, "; last cause: {last}")?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

struct RetryDriver<T, E> {
    factory: Box<dyn Fn() -> Eventual<T, E> + Send + Sync>,
    policy: Arc<dyn RetryPolicy>,
    clock: Arc<dyn ClockSource>,
    started: crate::types::Time,
    errors: Mutex<Vec<E>>,
    inflight: Mutex<Option<Eventual<T, E>>>,
    cancelled: AtomicBool,
    target: Eventual<RetryResult<T, E>, RetryError<E>>,
}

/// Re-invokes `factory` until an attempt resolves or `policy` aborts.
pub(crate) fn retry_until_resolved<T, E>(
    caller: &Arc<dyn Caller>,
    factory: impl Fn() -> Eventual<T, E> + Send + Sync + 'static,
    policy: Arc<dyn RetryPolicy>,
    clock: Arc<dyn ClockSource>,
) -> Eventual<RetryResult<T, E>, RetryError<E>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let target = Eventual::pending(Arc::clone(caller));
    let driver = Arc::new(RetryDriver {
        factory: Box::new(factory),
        policy,
        started: clock.now(),
        clock,
        errors: Mutex::new(Vec::new()),
        inflight: Mutex::new(None),
        cancelled: AtomicBool::new(false),
        target: target.clone(),
    });

    let on_cancel = Arc::clone(&driver);
    target.on_cancelled(move || {
        on_cancel.cancelled.store(true, Ordering::Release);
        let inflight = on_cancel.inflight.lock().clone();
        if let Some(attempt) = inflight {
            attempt.cancel();
        }
    });

    RetryDriver::attempt(&driver);
    target
}

impl<T, E> RetryDriver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn attempt(this: &Arc<Self>) {
        if this.cancelled.load(Ordering::Acquire) {
            return;
        }
        let produced = (this.factory)();
        *this.inflight.lock() = Some(produced.clone());
        if this.cancelled.load(Ordering::Acquire) {
            // Raced with a downstream cancel that missed the new attempt.
            produced.cancel();
        }
        let driver = Arc::clone(this);
        produced.on_done(move |completion| Self::attempt_done(&driver, completion));
    }

    fn attempt_done(this: &Arc<Self>, completion: Completion<T, E>) {
        match completion {
            Completion::Resolved(value) => {
                let errors = std::mem::take(&mut *this.errors.lock());
                this.target.resolve(RetryResult { value, errors });
            }
            Completion::Cancelled => {
                this.target.cancel();
            }
            Completion::Failed(cause) => {
                let attempts = {
                    let mut errors = this.errors.lock();
                    errors.push(cause);
                    errors.len()
                };
                let elapsed = this.clock.now().saturating_duration_since(this.started);
                match this.policy.decide(elapsed) {
                    RetryDecision::Abort => {
                        tracing::debug!(attempts, ?elapsed, "retry aborted by policy");
                        let errors = std::mem::take(&mut *this.errors.lock());
                        this.target.fail(RetryError::new(errors));
                    }
                    RetryDecision::Retry(delay) => {
                        tracing::debug!(attempts, ?delay, "retrying after backoff");
                        let driver = Arc::clone(this);
                        this.clock
                            .schedule(delay, Box::new(move || RetryDriver::attempt(&driver)));
                    }
                }
            }
        }
    }
}
