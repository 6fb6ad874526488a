//! Eventually: callback-driven eventual values for multi-threaded programs.
//!
//! # Overview
//!
//! An [`Eventual`] is a thread-safe handle to a computation whose outcome is
//! not yet known. It is produced, observed, transformed, and aggregated
//! without blocking; a consumer that wants the value synchronously calls
//! [`Eventual::join`]. Completion is monotonic: a value resolves, fails, or
//! is cancelled exactly once, and every observer sees exactly one
//! notification for the terminal state it subscribed to.
//!
//! # Core Guarantees
//!
//! - **At-most-once completion**: exactly one of `resolve`/`fail`/`cancel`
//!   wins; the rest are no-ops that return `false`
//! - **Exactly-once delivery**: each observer is notified once, and only for
//!   the completion kind it subscribed to
//! - **No user code under locks**: observers always run after internal locks
//!   are released, through a [`Caller`] that isolates panics
//! - **Cancellation flows both ways**: combinators propagate upstream
//!   cancellation downstream, and cancelling a derived value cancels the
//!   value it was derived from
//!
//! # Module Structure
//!
//! - [`types`]: core types (completion states, monotonic time)
//! - [`caller`]: observer invocation with panic isolation
//! - [`future`]: the eventual value itself
//! - [`combinator`]: transforms, collectors, bounded-parallelism collection,
//!   retry
//! - [`clock`]: clock sources for retry backoff
//! - [`executor`]: the executor contract and a small thread pool
//! - [`managed`]: reference-counted resources with async setup/teardown
//! - [`api`]: the [`Futures`] facade that wires the pieces together
//!
//! # Example
//!
//! ```
//! use eventually::{Completion, Futures};
//!
//! let futures = Futures::builder().build();
//!
//! let value = futures.future::<u32, String>();
//! let doubled = value.transform(|v| Ok(v * 2));
//!
//! value.resolve(21);
//! assert!(matches!(doubled.join(), Completion::Resolved(42)));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod caller;
pub mod clock;
pub mod combinator;
pub mod executor;
pub mod future;
pub mod managed;
pub mod test_utils;
pub mod types;
pub mod util;

pub use api::{Futures, FuturesBuilder};
pub use caller::{Caller, DirectCaller, ErrorSink, LoggingErrorSink, PanicPayload, ThreadedCaller};
pub use clock::{ClockSource, SystemClock};
pub use combinator::retry::{
    ExponentialPolicy, JitteredPolicy, LinearPolicy, MaxRetriesPolicy, RetryDecision, RetryError,
    RetryPolicy, RetryResult, TimedPolicy,
};
pub use combinator::stream::StreamCollector;
pub use executor::{Executor, ThreadPoolExecutor};
pub use future::{Eventual, NotReady};
pub use managed::{BorrowError, Borrowed, Managed, ManagedSetup, ReloadableManaged};
pub use types::{Aborted, Completion, Time};
