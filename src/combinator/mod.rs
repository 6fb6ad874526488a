//! Combinators: transforms, collectors, bounded-parallelism collection,
//! and retry.
//!
//! Every combinator follows the same shape: install an observer on the
//! upstream value(s) that writes into a fresh downstream cell, and link the
//! downstream back to the upstream so cancelling the derived value cancels
//! the work it was derived from.

pub mod collect;
pub mod delayed;
pub mod retry;
pub mod stream;
pub mod transform;
