//! Async condition variable: broadcast signaling over deferreds.
//!
//! [`Condition::wait`] parks the caller on a fresh deferred;
//! [`signal`](Condition::signal) determines the oldest waiter and
//! [`broadcast`](Condition::broadcast) determines every waiter present at
//! the call. Waiters that register afterwards wait for the next signal —
//! there is no stored wakeup.

use crate::deferred::{Deferred, Ivar};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// A broadcast point carrying values of type `T` to waiters.
pub struct Condition<T> {
    waiters: Rc<RefCell<VecDeque<Ivar<T>>>>,
}

impl<T> Clone for Condition<T> {
    fn clone(&self) -> Self {
        Self {
            waiters: self.waiters.clone(),
        }
    }
}

impl<T: Clone + 'static> Condition<T> {
    /// Creates a condition with no waiters.
    #[must_use]
    pub fn create() -> Self {
        Self {
            waiters: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Returns a deferred determined by the next signal or broadcast.
    pub fn wait(&self) -> Deferred<T> {
        let waiter = Ivar::create();
        self.waiters.borrow_mut().push_back(waiter.clone());
        waiter.read()
    }

    /// Wakes the oldest waiter with `value`. No-op without waiters.
    pub fn signal(&self, value: T) {
        let waiter = self.waiters.borrow_mut().pop_front();
        if let Some(waiter) = waiter {
            waiter.fill(value);
        }
    }

    /// Wakes every current waiter with a clone of `value`. Waiters that
    /// register after this call do not receive it.
    pub fn broadcast(&self, value: T) {
        let drained: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        for waiter in drained {
            waiter.fill(value.clone());
        }
    }

    /// Number of parked waiters.
    #[must_use]
    pub fn num_waiters(&self) -> usize {
        self.waiters.borrow().len()
    }
}

impl<T> fmt::Debug for Condition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("waiters", &self.waiters.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Scheduler;

    fn init_test(name: &str) -> Scheduler {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
        Scheduler::current()
    }

    #[test]
    fn broadcast_wakes_current_waiters_only() {
        let scheduler = init_test("broadcast_wakes_current_waiters_only");
        let condition: Condition<u32> = Condition::create();
        let first = condition.wait();
        let second = condition.wait();

        condition.broadcast(9);
        let late = condition.wait();

        scheduler.run_until_quiescent().expect("cycles");
        assert_eq!(first.peek(), Some(9));
        assert_eq!(second.peek(), Some(9));
        assert!(!late.is_determined(), "registered after the broadcast");
        crate::test_complete!("broadcast_wakes_current_waiters_only");
    }

    #[test]
    fn signal_wakes_oldest_waiter() {
        let scheduler = init_test("signal_wakes_oldest_waiter");
        let condition: Condition<&str> = Condition::create();
        let first = condition.wait();
        let second = condition.wait();

        condition.signal("first");
        scheduler.run_until_quiescent().expect("cycles");
        assert_eq!(first.peek(), Some("first"));
        assert!(!second.is_determined());
        assert_eq!(condition.num_waiters(), 1);
        crate::test_complete!("signal_wakes_oldest_waiter");
    }
}
