//! Observer records held by a running completion cell.

use std::sync::Arc;

use crate::caller::Caller;
use crate::types::Completion;

/// A pending observer: the completion kinds it subscribes to plus the
/// callback payload. Dispatch happens through the caller so user code is
/// panic-isolated and, for threaded callers, moved off the completing
/// thread.
pub(crate) enum Observer<T, E> {
    /// Fires only when the value resolves.
    Resolved(Box<dyn FnOnce(T) + Send>),
    /// Fires only when the value fails.
    Failed(Box<dyn FnOnce(E) + Send>),
    /// Fires only when the value is cancelled.
    Cancelled(Box<dyn FnOnce() + Send>),
    /// Fires on any terminal state, without the payload.
    Finished(Box<dyn FnOnce() + Send>),
    /// Fires on any terminal state with the full completion.
    Done(Box<dyn FnOnce(Completion<T, E>) + Send>),
}

impl<T, E> Observer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Dispatches this observer for `completion` if the kind matches.
    ///
    /// An observer whose subscription does not match the terminal state is
    /// dropped without being invoked.
    pub(crate) fn notify(self, completion: &Completion<T, E>, caller: &Arc<dyn Caller>) {
        match self {
            Self::Resolved(f) => {
                if let Completion::Resolved(value) = completion {
                    let value = value.clone();
                    caller.invoke("observer::resolved", Box::new(move || f(value)));
                }
            }
            Self::Failed(f) => {
                if let Completion::Failed(cause) = completion {
                    let cause = cause.clone();
                    caller.invoke("observer::failed", Box::new(move || f(cause)));
                }
            }
            Self::Cancelled(f) => {
                if completion.is_cancelled() {
                    caller.invoke("observer::cancelled", f);
                }
            }
            Self::Finished(f) => caller.invoke("observer::finished", f),
            Self::Done(f) => {
                let completion = completion.clone();
                caller.invoke("observer::done", Box::new(move || f(completion)));
            }
        }
    }
}
