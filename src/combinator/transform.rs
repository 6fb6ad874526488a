//! Transformation and recovery combinators.
//!
//! The transform family produces a downstream value from an upstream one:
//!
//! - [`Eventual::transform`]: map the resolved value
//! - [`Eventual::lazy_transform`]: map the resolved value to another
//!   eventual value and forward its completion
//! - [`Eventual::catch_failed`] / [`Eventual::lazy_catch_failed`]: recover
//!   from failure
//! - [`Eventual::catch_cancelled`] / [`Eventual::lazy_catch_cancelled`]:
//!   recover from cancellation
//!
//! Non-matching completions pass through unchanged. User functions signal
//! failure by returning `Err`, which fails the downstream value. Every
//! combinator links the downstream to the upstream, so cancelling the
//! derived value cancels the upstream while it is still running.

use std::sync::Arc;

use crate::future::Eventual;
use crate::types::Completion;

impl<T, E> Eventual<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Maps the resolved value through `f`, producing a new eventual value.
    ///
    /// Failure and cancellation pass through unchanged. An `Err` from `f`
    /// fails the result.
    pub fn transform<U>(
        &self,
        f: impl FnOnce(T) -> Result<U, E> + Send + 'static,
    ) -> Eventual<U, E>
    where
        U: Clone + Send + 'static,
    {
        let target = Eventual::pending(Arc::clone(self.caller()));
        let downstream = target.clone();
        self.on_done(move |completion| match completion {
            Completion::Resolved(value) => match f(value) {
                Ok(mapped) => {
                    downstream.resolve(mapped);
                }
                Err(cause) => {
                    downstream.fail(cause);
                }
            },
            Completion::Failed(cause) => {
                downstream.fail(cause);
            }
            Completion::Cancelled => {
                downstream.cancel();
            }
        });
        target.bind(self);
        target
    }

    /// Maps the resolved value to another eventual value and forwards its
    /// completion.
    ///
    /// Cancelling the result cancels both the upstream and, once produced,
    /// the value returned by `f`.
    pub fn lazy_transform<U>(
        &self,
        f: impl FnOnce(T) -> Eventual<U, E> + Send + 'static,
    ) -> Eventual<U, E>
    where
        U: Clone + Send + 'static,
    {
        let target = Eventual::pending(Arc::clone(self.caller()));
        let downstream = target.clone();
        self.on_done(move |completion| match completion {
            Completion::Resolved(value) => {
                let produced = f(value);
                forward(&produced, &downstream);
            }
            Completion::Failed(cause) => {
                downstream.fail(cause);
            }
            Completion::Cancelled => {
                downstream.cancel();
            }
        });
        target.bind(self);
        target
    }

    /// Recovers from failure by mapping the cause through `f`.
    ///
    /// A resolved or cancelled upstream passes through unchanged.
    pub fn catch_failed(
        &self,
        f: impl FnOnce(E) -> Result<T, E> + Send + 'static,
    ) -> Eventual<T, E> {
        let target = Eventual::pending(Arc::clone(self.caller()));
        let downstream = target.clone();
        self.on_done(move |completion| match completion {
            Completion::Resolved(value) => {
                downstream.resolve(value);
            }
            Completion::Failed(cause) => match f(cause) {
                Ok(recovered) => {
                    downstream.resolve(recovered);
                }
                Err(cause) => {
                    downstream.fail(cause);
                }
            },
            Completion::Cancelled => {
                downstream.cancel();
            }
        });
        target.bind(self);
        target
    }

    /// Recovers from failure by mapping the cause to another eventual value.
    pub fn lazy_catch_failed(
        &self,
        f: impl FnOnce(E) -> Eventual<T, E> + Send + 'static,
    ) -> Eventual<T, E> {
        let target = Eventual::pending(Arc::clone(self.caller()));
        let downstream = target.clone();
        self.on_done(move |completion| match completion {
            Completion::Resolved(value) => {
                downstream.resolve(value);
            }
            Completion::Failed(cause) => {
                let produced = f(cause);
                forward(&produced, &downstream);
            }
            Completion::Cancelled => {
                downstream.cancel();
            }
        });
        target.bind(self);
        target
    }

    /// Recovers from cancellation by producing a replacement value.
    ///
    /// A resolved or failed upstream passes through unchanged.
    pub fn catch_cancelled(
        &self,
        f: impl FnOnce() -> Result<T, E> + Send + 'static,
    ) -> Eventual<T, E> {
        let target = Eventual::pending(Arc::clone(self.caller()));
        let downstream = target.clone();
        self.on_done(move |completion| match completion {
            Completion::Resolved(value) => {
                downstream.resolve(value);
            }
            Completion::Failed(cause) => {
                downstream.fail(cause);
            }
            Completion::Cancelled => match f() {
                Ok(recovered) => {
                    downstream.resolve(recovered);
                }
                Err(cause) => {
                    downstream.fail(cause);
                }
            },
        });
        target.bind(self);
        target
    }

    /// Recovers from cancellation by producing a replacement eventual value.
    pub fn lazy_catch_cancelled(
        &self,
        f: impl FnOnce() -> Eventual<T, E> + Send + 'static,
    ) -> Eventual<T, E> {
        let target = Eventual::pending(Arc::clone(self.caller()));
        let downstream = target.clone();
        self.on_done(move |completion| match completion {
            Completion::Resolved(value) => {
                downstream.resolve(value);
            }
            Completion::Failed(cause) => {
                downstream.fail(cause);
            }
            Completion::Cancelled => {
                let produced = f();
                forward(&produced, &downstream);
            }
        });
        target.bind(self);
        target
    }
}

/// Forwards the eventual completion of `produced` into `downstream`, and
/// links `downstream` so cancelling it cancels `produced`.
pub(crate) fn forward<U, E>(produced: &Eventual<U, E>, downstream: &Eventual<U, E>)
where
    U: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let into = downstream.clone();
    produced.on_done(move |completion| {
        into.complete_with(completion);
    });
    downstream.bind(produced);
}
