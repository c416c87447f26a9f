//! Execution contexts.
//!
//! Every job carries an [`ExecutionContext`]: the monitor that will receive
//! its failures, the priority band it runs in, an optional logical
//! call-site history, and typed local storage. Contexts are immutable and
//! cheaply shared; derivation is copy-on-change, so a derived context never
//! mutates the context it came from.
//!
//! A job's context is fixed at enqueue time and does not change during its
//! run.

use crate::monitor::Monitor;
use crate::types::Priority;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

type LocalStorage = HashMap<TypeId, Rc<dyn Any>>;

struct ContextInner {
    monitor: Monitor,
    priority: Priority,
    backtrace_history: Vec<&'static str>,
    local: LocalStorage,
}

/// The (monitor, priority, local data) bundle attached to every job.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Rc<ContextInner>,
}

impl ExecutionContext {
    /// Creates a root context for a monitor.
    pub(crate) fn new(monitor: Monitor, priority: Priority) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                monitor,
                priority,
                backtrace_history: Vec::new(),
                local: HashMap::new(),
            }),
        }
    }

    /// Returns the monitor failures are routed to.
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.inner.monitor
    }

    /// Returns the scheduling band.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    /// Returns the logical call-site history, newest last.
    ///
    /// Empty unless the scheduler was configured with `record_backtraces`.
    #[must_use]
    pub fn backtrace_history(&self) -> &[&'static str] {
        &self.inner.backtrace_history
    }

    /// Derives a context routed to a different monitor.
    #[must_use]
    pub fn with_monitor(&self, monitor: Monitor) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                monitor,
                priority: self.inner.priority,
                backtrace_history: self.inner.backtrace_history.clone(),
                local: self.inner.local.clone(),
            }),
        }
    }

    /// Derives a context in a different scheduling band.
    #[must_use]
    pub fn with_priority(&self, priority: Priority) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                monitor: self.inner.monitor.clone(),
                priority,
                backtrace_history: self.inner.backtrace_history.clone(),
                local: self.inner.local.clone(),
            }),
        }
    }

    /// Derives a context with a call-site tag appended to its history.
    #[must_use]
    pub fn with_frame(&self, tag: &'static str) -> Self {
        let mut history = self.inner.backtrace_history.clone();
        history.push(tag);
        Self {
            inner: Rc::new(ContextInner {
                monitor: self.inner.monitor.clone(),
                priority: self.inner.priority,
                backtrace_history: history,
                local: self.inner.local.clone(),
            }),
        }
    }

    /// Derives a context with a typed local value attached.
    ///
    /// At most one value per type; a second call with the same type
    /// replaces the first.
    #[must_use]
    pub fn with_local<T: Any>(&self, value: T) -> Self {
        let mut local = self.inner.local.clone();
        local.insert(TypeId::of::<T>(), Rc::new(value));
        Self {
            inner: Rc::new(ContextInner {
                monitor: self.inner.monitor.clone(),
                priority: self.inner.priority,
                backtrace_history: self.inner.backtrace_history.clone(),
                local,
            }),
        }
    }

    /// Looks up a typed local value.
    #[must_use]
    pub fn local<T: Any>(&self) -> Option<Rc<T>> {
        self.inner
            .local
            .get(&TypeId::of::<T>())
            .and_then(|any| any.clone().downcast::<T>().ok())
    }

    /// Returns true if both handles refer to the same context.
    #[must_use]
    pub fn same_context(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("monitor", &self.inner.monitor.name())
            .field("priority", &self.inner.priority)
            .field("frames", &self.inner.backtrace_history.len())
            .finish()
    }
}
