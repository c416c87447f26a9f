//! Timed-event infrastructure.
//!
//! The [`wheel`] module holds the hierarchical timing wheel the scheduler
//! uses to store future-dated events. User-facing timed operations (`at`,
//! `after`, timeouts, intervals) live in [`crate::clock`] and are built on
//! the wheel plus the promise substrate.

pub mod wheel;

pub use wheel::{AlarmId, HorizonError, TimingWheel, TimingWheelConfig};
