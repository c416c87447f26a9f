//! Monosync: a single-threaded cooperative async kernel.
//!
//! # Overview
//!
//! Monosync coordinates thousands of fine-grained tasks on one logical
//! thread. Results flow through first-class single-assignment cells
//! ([`Ivar`]) read as [`Deferred`] values; failures are contained by a
//! supervision tree of [`Monitor`]s; timed work lives in a hierarchical
//! timing wheel; and coordination structures (pipes, throttles,
//! conditions) are layered entirely on the promise substrate.
//!
//! # Core Guarantees
//!
//! - **At-most-one resolution**: an ivar fills once; double fill is a
//!   detected programmer error
//! - **Step-ahead handlers**: determination enqueues handler jobs, never
//!   runs them synchronously — recursion stays bounded and interleaving
//!   stays fair
//! - **Strict FIFO bands**: within a priority band, jobs run in enqueue
//!   order; normal strictly precedes low, under a per-cycle fairness cap
//! - **Contained failures**: a panic in a job is caught at the boundary
//!   and routed through the job's monitor, never through a deferred
//! - **No ambient cancellation**: timeouts and aborts are composition
//!   ([`clock::with_timeout`], [`deferred::choose`], [`clock::Event`])
//! - **One shared surface**: foreign threads reach the kernel only
//!   through the external-job inbox
//!
//! # Module Structure
//!
//! - [`types`]: time, spans, priorities
//! - [`deferred`]: ivars, deferreds, and the combinator algebra
//! - [`monitor`]: supervision tree and error containment
//! - [`context`]: execution contexts attached to every job
//! - [`runtime`]: job pool, queues, external inbox, the scheduler cycle
//! - [`time`]: the hierarchical timing wheel
//! - [`clock`]: timed operations built over the wheel
//! - [`pipe`]: back-pressured ordered streams
//! - [`throttle`]: bounded concurrency
//! - [`condition`]: broadcast signaling
//! - [`config`]: the recognized options set
//! - [`error`]: the error taxonomy
//!
//! # Example
//!
//! ```
//! use monosync::clock;
//! use monosync::runtime::Scheduler;
//! use monosync::types::Span;
//!
//! let scheduler = Scheduler::current();
//! let woken = clock::after(Span::from_millis(5));
//! woken.upon(|()| tracing::info!("five virtual milliseconds later"));
//!
//! scheduler.advance_time(Span::from_millis(5));
//! scheduler.run_cycle().expect("cycle");
//! assert!(woken.is_determined());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

pub mod clock;
pub mod condition;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod monitor;
pub mod pipe;
pub mod runtime;
pub mod test_utils;
pub mod time;
pub mod throttle;
pub mod types;
pub mod util;

pub use clock::Event;
pub use condition::Condition;
pub use config::Config;
pub use context::ExecutionContext;
pub use deferred::{Deferred, Ivar};
pub use error::{Error, ErrorKind, Result};
pub use monitor::Monitor;
pub use runtime::{CycleSummary, ExternalHandle, Scheduler};
pub use throttle::{Sequencer, Throttle};
pub use types::{Priority, Span, Time};
