//! Supervision tree for error containment.
//!
//! A [`Monitor`] is a supervision node owning the error handlers for a
//! region of work. Monitors form a tree rooted at the scheduler's main
//! monitor; every execution context names the monitor its failures are
//! routed to.
//!
//! # Routing
//!
//! When a job fails (a panic caught at the job boundary, or an error sent
//! explicitly), the error is delivered to the job's context's monitor:
//!
//! - If the monitor has handlers, each handler is enqueued as a fresh job
//!   in the context it was registered from.
//! - Otherwise, if the monitor is still forwarding, the error propagates
//!   to its parent.
//! - An error that reaches the top unconsumed marks the scheduler fatal
//!   and invokes the installed uncaught-error hook.
//!
//! # Containment
//!
//! [`Monitor::try_with`] runs a computation under a fresh *detached*
//! monitor: the first error resolves the returned deferred to `Err`, and
//! nothing leaks to the parent. Errors arriving after the result is
//! determined go to the rest-error sink (logged at error level).

use crate::context::ExecutionContext;
use crate::deferred::{Deferred, Ivar};
use crate::error::{Error, RaisedPayload, Result};
use crate::runtime::Scheduler;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static MONITOR_COUNTER: AtomicU64 = AtomicU64::new(1);

struct ErrorHandler {
    context: ExecutionContext,
    run: Rc<dyn Fn(Error)>,
}

struct MonitorInner {
    id: u64,
    name: Cow<'static, str>,
    parent: Option<Monitor>,
    forwarding: Cell<bool>,
    has_seen_error: Cell<bool>,
    handlers: RefCell<Vec<ErrorHandler>>,
}

/// A supervision node owning error handlers for a region of work.
#[derive(Clone)]
pub struct Monitor {
    inner: Rc<MonitorInner>,
}

impl Monitor {
    fn alloc(name: Cow<'static, str>, parent: Option<Monitor>, forwarding: bool) -> Self {
        Self {
            inner: Rc::new(MonitorInner {
                id: MONITOR_COUNTER.fetch_add(1, Ordering::Relaxed),
                name,
                parent,
                forwarding: Cell::new(forwarding),
                has_seen_error: Cell::new(false),
                handlers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The root of a monitor tree. Used by the scheduler for its main
    /// monitor; errors reaching it with no handler go to the uncaught
    /// hook.
    pub(crate) fn root() -> Self {
        Self::alloc(Cow::Borrowed("main"), None, false)
    }

    /// Creates a monitor whose parent is the current context's monitor.
    #[must_use]
    pub fn create(name: impl Into<Cow<'static, str>>) -> Self {
        let parent = Self::current();
        Self::alloc(name.into(), Some(parent), true)
    }

    /// Creates a monitor under the current monitor that does not forward
    /// errors to it.
    #[must_use]
    pub fn create_detached(name: impl Into<Cow<'static, str>>) -> Self {
        let parent = Self::current();
        Self::alloc(name.into(), Some(parent), false)
    }

    /// Returns the current context's monitor.
    #[must_use]
    pub fn current() -> Self {
        Scheduler::current().current_context().monitor().clone()
    }

    /// Returns the monitor's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns a process-unique identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the parent monitor, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Monitor> {
        self.inner.parent.as_ref()
    }

    /// Stops forwarding errors to the parent. Errors are then delivered
    /// only to handlers attached to this monitor (or the uncaught hook if
    /// there are none).
    pub fn detach(&self) {
        self.inner.forwarding.set(false);
    }

    /// Returns true if errors no longer forward to the parent.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        !self.inner.forwarding.get()
    }

    /// Returns true if an error has ever been routed through this monitor.
    #[must_use]
    pub fn has_seen_error(&self) -> bool {
        self.inner.has_seen_error.get()
    }

    /// Returns true if both handles refer to the same monitor.
    #[must_use]
    pub fn same_monitor(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// Attaches a persistent error handler. Each delivered error runs the
    /// handler as a freshly scheduled job in the context that registered
    /// it.
    pub fn on_error(&self, f: impl Fn(Error) + 'static) {
        let context = Scheduler::current().current_context();
        self.inner.handlers.borrow_mut().push(ErrorHandler {
            context,
            run: Rc::new(f),
        });
    }

    /// Routes an error through this monitor per the rules in the module
    /// docs.
    pub fn send_error(&self, error: Error) {
        self.inner.has_seen_error.set(true);

        let handlers: Vec<(ExecutionContext, Rc<dyn Fn(Error)>)> = self
            .inner
            .handlers
            .borrow()
            .iter()
            .map(|h| (h.context.clone(), h.run.clone()))
            .collect();

        if !handlers.is_empty() {
            tracing::debug!(
                monitor = %self.inner.name,
                error = %error,
                handlers = handlers.len(),
                "delivering error to monitor handlers"
            );
            let scheduler = Scheduler::current();
            for (context, run) in handlers {
                let delivered = error.clone();
                scheduler.enqueue(context, Box::new(move || run(delivered)));
            }
            return;
        }

        match (&self.inner.parent, self.inner.forwarding.get()) {
            (Some(parent), true) => parent.send_error(error),
            _ => Scheduler::current().report_uncaught(error),
        }
    }

    /// Runs `f` under a fresh detached monitor, reifying its first failure.
    ///
    /// Returns a deferred that determines with `Ok(value)` when `f`'s
    /// deferred does, or `Err(error)` on the first failure raised within
    /// the monitored region — whether `f` fails synchronously or a job it
    /// scheduled fails later. Later failures go to the rest-error sink.
    pub fn try_with<T: Clone + 'static>(
        f: impl FnOnce() -> Deferred<T>,
    ) -> Deferred<Result<T>> {
        let scheduler = Scheduler::current();
        let monitor = Self::create_detached("try_with");
        let result: Ivar<Result<T>> = Ivar::create();

        {
            let result = result.clone();
            monitor.on_error(move |error| {
                if !result.fill_if_empty(Err(error.clone())) {
                    tracing::error!(
                        error = %error,
                        "error raised after try_with result was determined"
                    );
                }
            });
        }

        let context = scheduler.frame(
            scheduler.current_context().with_monitor(monitor.clone()),
            "try_with",
        );
        let outcome = scheduler.within_context(context, || catch_user(f));
        match outcome {
            Ok(body) => {
                let result = result.clone();
                body.upon(move |value| {
                    result.fill_if_empty(Ok(value));
                });
            }
            Err(error) => {
                result.fill_if_empty(Err(error));
            }
        }
        Deferred::of_ivar(result)
    }

    /// Runs `f` under a fresh monitor whose errors are delivered to
    /// `on_error` instead of the parent. Returns `f`'s deferred; if `f`
    /// itself fails, the error goes to `on_error` and the returned
    /// deferred never determines.
    pub fn handle_errors<T: Clone + 'static>(
        f: impl FnOnce() -> Deferred<T>,
        on_error: impl Fn(Error) + 'static,
    ) -> Deferred<T> {
        let scheduler = Scheduler::current();
        let monitor = Self::create("handle_errors");
        monitor.on_error(on_error);

        let context = scheduler.current_context().with_monitor(monitor.clone());
        match scheduler.within_context(context, || catch_user(f)) {
            Ok(body) => body,
            Err(error) => {
                monitor.send_error(error);
                Deferred::never()
            }
        }
    }

    /// Recovers the error as originally raised, stripping any context
    /// annotation added on the way.
    #[must_use]
    pub fn extract_error(error: Error) -> Error {
        error.without_context()
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("detached", &self.is_detached())
            .field("has_seen_error", &self.has_seen_error())
            .finish()
    }
}

/// Catches a panic inside user code and converts it to a `UserRaised`
/// error. Every job boundary runs through this.
pub(crate) fn catch_user<R>(f: impl FnOnce() -> R) -> Result<R> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| Error::user_raised(RaisedPayload::from_panic(payload.as_ref())))
}
