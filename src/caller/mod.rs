//! Observer invocation with panic isolation.
//!
//! Every user observer runs through a [`Caller`]. The caller exists so that
//! a panicking observer is contained and reported without corrupting the
//! completion state machine: the panic is caught, converted to a
//! [`PanicPayload`], and handed to the configured [`ErrorSink`]; the future
//! that triggered the notification is unaffected.
//!
//! Two flavors are provided: [`DirectCaller`] runs observers inline on the
//! completing thread, and [`ThreadedCaller`] hands them to an [`Executor`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use core::fmt;

use crate::executor::Executor;

/// Payload from a caught observer panic.
///
/// Wraps the panic value for safe transport to the error sink.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a payload from the boxed value produced by `catch_unwind`.
    #[must_use]
    pub fn from_unwind(payload: &(dyn std::any::Any + Send)) -> Self {
        if let Some(message) = payload.downcast_ref::<&str>() {
            Self::new(*message)
        } else if let Some(message) = payload.downcast_ref::<String>() {
            Self::new(message.clone())
        } else {
            Self::new("opaque panic payload")
        }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// Sink for faults raised by user code that the library must not propagate.
///
/// Implementations must be cheap and must not panic; they are invoked from
/// completion paths.
pub trait ErrorSink: Send + Sync + 'static {
    /// An observer or stream-collector callback panicked during `op`.
    fn uncaught(&self, op: &'static str, fault: PanicPayload);

    /// A managed reference was dropped while still holding live state.
    fn leaked(&self, what: &'static str);
}

/// Error sink that reports faults as `tracing` error events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn uncaught(&self, op: &'static str, fault: PanicPayload) {
        tracing::error!(op, fault = %fault, "uncaught observer fault");
    }

    fn leaked(&self, what: &'static str) {
        tracing::error!(what, "reference leaked without teardown");
    }
}

/// Invokes user observers, isolating any panic they raise.
pub trait Caller: Send + Sync + 'static {
    /// Runs `f`, catching a panic and reporting it to the error sink under
    /// the operation label `op`. May run inline or on another thread.
    fn invoke(&self, op: &'static str, f: Box<dyn FnOnce() + Send>);

    /// The sink receiving faults from this caller.
    fn sink(&self) -> &Arc<dyn ErrorSink>;
}

/// Runs `f` under `catch_unwind`, routing a panic to `sink`.
fn run_isolated(op: &'static str, f: Box<dyn FnOnce() + Send>, sink: &Arc<dyn ErrorSink>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        sink.uncaught(op, PanicPayload::from_unwind(payload.as_ref()));
    }
}

/// Caller that runs observers inline on the completing thread.
#[derive(Clone)]
pub struct DirectCaller {
    sink: Arc<dyn ErrorSink>,
}

impl DirectCaller {
    /// Creates a direct caller reporting faults to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn ErrorSink>) -> Self {
        Self { sink }
    }
}

impl Default for DirectCaller {
    fn default() -> Self {
        Self::new(Arc::new(LoggingErrorSink))
    }
}

impl fmt::Debug for DirectCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectCaller").finish_non_exhaustive()
    }
}

impl Caller for DirectCaller {
    fn invoke(&self, op: &'static str, f: Box<dyn FnOnce() + Send>) {
        run_isolated(op, f, &self.sink);
    }

    fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.sink
    }
}

/// Caller that hands observer invocation to an executor.
#[derive(Clone)]
pub struct ThreadedCaller {
    executor: Arc<dyn Executor>,
    sink: Arc<dyn ErrorSink>,
}

impl ThreadedCaller {
    /// Creates a threaded caller submitting observers to `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, sink: Arc<dyn ErrorSink>) -> Self {
        Self { executor, sink }
    }
}

impl fmt::Debug for ThreadedCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedCaller").finish_non_exhaustive()
    }
}

impl Caller for ThreadedCaller {
    fn invoke(&self, op: &'static str, f: Box<dyn FnOnce() + Send>) {
        let sink = Arc::clone(&self.sink);
        self.executor
            .execute(Box::new(move || run_isolated(op, f, &sink)));
    }

    fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.sink
    }
}
