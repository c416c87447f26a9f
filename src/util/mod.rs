//! Internal utilities for the monosync kernel.
//!
//! Intentionally minimal and dependency-free so that scheduling stays
//! deterministic under test.

pub mod det_rng;

pub use det_rng::DetRng;
