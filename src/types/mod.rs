//! Core types: completion states and monotonic time.

pub mod completion;
pub mod time;

pub use completion::{Aborted, Completion};
pub use time::Time;
