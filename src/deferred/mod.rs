//! Deferreds: read-only views over ivars, and the composition algebra.
//!
//! A [`Deferred`] is the read end of an [`Ivar`]. Equality is identity of
//! the underlying cell. The combinators here are the monadic core of the
//! kernel: `bind`/`map` sequence computations, `all`/`both`/`join`
//! aggregate, and [`choose`] races alternatives with O(1) removal of the
//! losers.
//!
//! Handler scheduling is step-ahead everywhere: determination enqueues
//! handler jobs; it never runs them synchronously.
//!
//! # Errors
//!
//! A failure raised inside a combinator callback is caught at the job
//! boundary and routed to the monitor of the context that attached the
//! callback. It is *not* surfaced through the returned deferred — a bind
//! chain downstream of a failed callback simply never determines. Use
//! [`Monitor::try_with`](crate::monitor::Monitor::try_with) to reify
//! failures as values.

pub mod ivar;

pub use ivar::Ivar;

use crate::runtime::Scheduler;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use ivar::HandlerToken;

/// A read-only view over an [`Ivar`].
pub struct Deferred<T> {
    ivar: Ivar<T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            ivar: self.ivar.clone(),
        }
    }
}

impl<T: 'static> Deferred<T> {
    pub(crate) fn of_ivar(ivar: Ivar<T>) -> Self {
        Self { ivar }
    }

    /// A deferred that never determines.
    #[must_use]
    pub fn never() -> Self {
        Self {
            ivar: Ivar::create(),
        }
    }

    /// Returns true once the underlying cell has been filled.
    #[must_use]
    pub fn is_determined(&self) -> bool {
        self.ivar.is_determined()
    }
}

impl<T: 'static> PartialEq for Deferred<T> {
    /// Identity of the underlying cell, not value equality.
    fn eq(&self, other: &Self) -> bool {
        Ivar::same_cell(&self.ivar, &other.ivar)
    }
}

impl<T: 'static> Eq for Deferred<T> {}

impl<T: Clone + 'static> Deferred<T> {
    /// A deferred determined from the start.
    #[must_use]
    pub fn ready(value: T) -> Self {
        let ivar = Ivar::create();
        ivar.fill(value);
        Self { ivar }
    }

    /// Returns the value if determined.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.ivar.peek()
    }

    /// Returns the value, failing with `NotDetermined` if still empty.
    pub fn value(&self) -> crate::error::Result<T> {
        self.ivar.value()
    }

    /// Runs `f(value)` as a job once determined. The current execution
    /// context is captured now and attached to that job.
    pub fn upon(&self, f: impl FnOnce(T) + 'static) {
        self.ivar.upon(f);
    }

    /// Monadic sequencing: returns a deferred that determines with the
    /// value of `f(x)`'s result once both steps have resolved.
    ///
    /// The intermediate cell is collapsed by indirection compression, so
    /// long bind chains forward through a single cell.
    pub fn bind<U: Clone + 'static>(
        &self,
        f: impl FnOnce(T) -> Deferred<U> + 'static,
    ) -> Deferred<U> {
        let result: Ivar<U> = Ivar::create();
        let forward = result.clone();
        let context = Scheduler::current().current_context();
        let _ = self.ivar.add_handler_in(
            context,
            Box::new(move |x| {
                let rhs = f(x);
                Ivar::connect(&forward, &rhs.ivar);
            }),
        );
        Deferred::of_ivar(result)
    }

    /// Applies `f` to the value. If this deferred is already determined,
    /// `f` runs now and no intermediate job is enqueued.
    pub fn map<U: Clone + 'static>(&self, f: impl FnOnce(T) -> U + 'static) -> Deferred<U> {
        if let Some(value) = self.peek() {
            return Deferred::ready(f(value));
        }
        let result: Ivar<U> = Ivar::create();
        let fill = result.clone();
        let context = Scheduler::current().current_context();
        let _ = self.ivar.add_handler_in(
            context,
            Box::new(move |x| {
                fill.fill(f(x));
            }),
        );
        Deferred::of_ivar(result)
    }

    /// Pairs two deferreds, determined when both are.
    #[must_use]
    pub fn both<U: Clone + 'static>(&self, other: &Deferred<U>) -> Deferred<(T, U)> {
        let other = other.clone();
        self.bind(move |t| other.map(move |u| (t, u)))
    }

    /// Discards the value.
    #[must_use]
    pub fn ignore_value(&self) -> Deferred<()> {
        self.map(|_| ())
    }
}

impl<T: Clone + 'static> Deferred<Deferred<T>> {
    /// Flattens one level of nesting.
    #[must_use]
    pub fn join(&self) -> Deferred<T> {
        self.bind(|inner| inner)
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deferred({:?})", self.ivar)
    }
}

/// Determined with every input's value, in input order, once all inputs
/// are determined.
pub fn all<T: Clone + 'static>(deferreds: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    if deferreds.is_empty() {
        return Deferred::ready(Vec::new());
    }
    let count = deferreds.len();
    let result: Ivar<Vec<T>> = Ivar::create();
    let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; count]));
    let remaining = Rc::new(Cell::new(count));
    for (index, deferred) in deferreds.into_iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let result = result.clone();
        deferred.upon(move |value| {
            slots.borrow_mut()[index] = Some(value);
            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                let values = slots
                    .borrow_mut()
                    .drain(..)
                    .map(|slot| slot.expect("every input determined"))
                    .collect();
                result.fill(values);
            }
        });
    }
    Deferred::of_ivar(result)
}

/// Determined once every input is, discarding values.
pub fn all_unit(deferreds: Vec<Deferred<()>>) -> Deferred<()> {
    if deferreds.is_empty() {
        return Deferred::ready(());
    }
    let result: Ivar<()> = Ivar::create();
    let remaining = Rc::new(Cell::new(deferreds.len()));
    for deferred in deferreds {
        let remaining = remaining.clone();
        let result = result.clone();
        deferred.upon(move |()| {
            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                result.fill(());
            }
        });
    }
    Deferred::of_ivar(result)
}

/// Determined with the first input to determine. Later determinations are
/// coalesced away; losing handlers are not removed (use [`choose`] when
/// that matters).
pub fn any<T: Clone + 'static>(deferreds: Vec<Deferred<T>>) -> Deferred<T> {
    let result: Ivar<T> = Ivar::create();
    for deferred in deferreds {
        let result = result.clone();
        deferred.upon(move |value| {
            result.fill_if_empty(value);
        });
    }
    Deferred::of_ivar(result)
}

/// Determined once any input is, discarding the value.
pub fn any_unit<T: Clone + 'static>(deferreds: Vec<Deferred<T>>) -> Deferred<()> {
    let result: Ivar<()> = Ivar::create();
    for deferred in deferreds {
        let result = result.clone();
        deferred.upon(move |_| {
            result.fill_if_empty(());
        });
    }
    Deferred::of_ivar(result)
}

trait ChoiceDyn<U> {
    fn attach(&self, wake: Rc<dyn Fn()>) -> HandlerToken;
    fn is_determined(&self) -> bool;
    fn take(&self) -> Option<U>;
}

struct ChoiceState<T, U> {
    deferred: Deferred<T>,
    map: RefCell<Option<Box<dyn FnOnce(T) -> U>>>,
}

impl<T: Clone + 'static, U: 'static> ChoiceDyn<U> for ChoiceState<T, U> {
    fn attach(&self, wake: Rc<dyn Fn()>) -> HandlerToken {
        let context = Scheduler::current().current_context();
        self.deferred
            .ivar
            .add_handler_in(context, Box::new(move |_| wake()))
    }

    fn is_determined(&self) -> bool {
        self.deferred.is_determined()
    }

    fn take(&self) -> Option<U> {
        let value = self.deferred.peek()?;
        let map = self.map.borrow_mut().take()?;
        Some(map(value))
    }
}

/// One alternative of a [`choose`]: a deferred plus the mapping applied to
/// its value if it wins.
pub struct Choice<U> {
    inner: Box<dyn ChoiceDyn<U>>,
}

/// Builds a [`Choice`] from a deferred and a winner mapping.
pub fn choice<T: Clone + 'static, U: 'static>(
    deferred: &Deferred<T>,
    map: impl FnOnce(T) -> U + 'static,
) -> Choice<U> {
    Choice {
        inner: Box::new(ChoiceState {
            deferred: deferred.clone(),
            map: RefCell::new(Some(Box::new(map))),
        }),
    }
}

/// Races alternatives: the first to determine wins and its mapping is
/// applied; every losing handler is removed in O(1). When several
/// alternatives are found determined at decision time, the earliest in
/// the argument order wins.
///
/// An empty set of choices never determines.
pub fn choose<U: Clone + 'static>(choices: Vec<Choice<U>>) -> Deferred<U> {
    let result: Ivar<U> = Ivar::create();
    let choices = Rc::new(choices);
    let tokens: Rc<RefCell<Vec<HandlerToken>>> = Rc::new(RefCell::new(Vec::new()));
    let decided = Rc::new(Cell::new(false));

    let wake: Rc<dyn Fn()> = {
        let choices = choices.clone();
        let tokens = tokens.clone();
        let decided = decided.clone();
        let result = result.clone();
        Rc::new(move || {
            if decided.get() {
                return;
            }
            for choice in choices.iter() {
                if choice.inner.is_determined() {
                    decided.set(true);
                    for token in tokens.borrow().iter() {
                        token.remove();
                    }
                    if let Some(value) = choice.inner.take() {
                        result.fill(value);
                    }
                    return;
                }
            }
        })
    };

    {
        let mut tokens = tokens.borrow_mut();
        for choice in choices.iter() {
            tokens.push(choice.inner.attach(wake.clone()));
        }
    }

    Deferred::of_ivar(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn ready_is_determined() {
        init_test("ready_is_determined");
        let d = Deferred::ready(17);
        crate::assert_with_log!(d.is_determined(), "determined", true, d.is_determined());
        crate::assert_with_log!(d.peek() == Some(17), "peek", 17, d.peek());
        crate::test_complete!("ready_is_determined");
    }

    #[test]
    fn never_is_not_determined() {
        init_test("never_is_not_determined");
        let d: Deferred<u32> = Deferred::never();
        assert!(!d.is_determined());
        assert!(d.value().is_err());
        crate::test_complete!("never_is_not_determined");
    }

    #[test]
    fn equality_is_cell_identity() {
        init_test("equality_is_cell_identity");
        let ivar: Ivar<u32> = Ivar::create();
        let a = ivar.read();
        let b = ivar.read();
        assert_eq!(a, b);
        let other = Deferred::ready(1);
        assert_ne!(a, other);
        crate::test_complete!("equality_is_cell_identity");
    }

    #[test]
    fn fill_if_empty_coalesces() {
        init_test("fill_if_empty_coalesces");
        let ivar: Ivar<u32> = Ivar::create();
        assert!(ivar.fill_if_empty(1));
        assert!(!ivar.fill_if_empty(2));
        assert_eq!(ivar.peek(), Some(1));
        crate::test_complete!("fill_if_empty_coalesces");
    }

    #[test]
    fn try_fill_reports_already_full() {
        init_test("try_fill_reports_already_full");
        let ivar: Ivar<u32> = Ivar::create();
        ivar.fill(1);
        let err = ivar.try_fill(2).expect_err("second fill must fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyFull);
        crate::test_complete!("try_fill_reports_already_full");
    }

    #[test]
    fn peek_is_stable_once_determined() {
        init_test("peek_is_stable_once_determined");
        let d = Deferred::ready("value");
        for _ in 0..3 {
            assert_eq!(d.peek(), Some("value"));
        }
        crate::test_complete!("peek_is_stable_once_determined");
    }
}
