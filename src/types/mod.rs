//! Core types for the monosync kernel.
//!
//! - [`time`]: monotonic [`Time`] instants and signed [`Span`] deltas
//! - [`priority`]: the two scheduling bands

pub mod priority;
pub mod time;

pub use priority::Priority;
pub use time::{Span, Time};
