//! Internal utilities.

pub mod det_rng;
