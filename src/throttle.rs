//! Bounded concurrency over the promise substrate.
//!
//! A [`Throttle`] admits at most `max_concurrent_jobs` invocations at a
//! time; excess submissions queue and are served FIFO. Each submitted
//! thunk runs isolated under [`Monitor::try_with`], so a failure resolves
//! that submission's deferred to `Err` without tearing down unrelated
//! work — unless the throttle was created with `continue_on_error =
//! false`, in which case the first failure kills it.
//!
//! [`Sequencer`] is the `max = 1` special case: mutual exclusion over a
//! resource, in submission order.

use crate::deferred::{Deferred, Ivar};
use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::runtime::Scheduler;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

struct QueuedJob {
    start: Box<dyn FnOnce()>,
    abort: Box<dyn FnOnce()>,
}

struct ThrottleInner {
    max_concurrent_jobs: usize,
    continue_on_error: bool,
    running: usize,
    dead: bool,
    queue: VecDeque<QueuedJob>,
}

/// A bounded-concurrency executor for an ordered queue of jobs.
#[derive(Clone)]
pub struct Throttle {
    inner: Rc<RefCell<ThrottleInner>>,
}

impl Throttle {
    /// Creates a throttle admitting up to `max_concurrent_jobs` at once.
    /// Zero is treated as 1.
    #[must_use]
    pub fn create(max_concurrent_jobs: usize, continue_on_error: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ThrottleInner {
                max_concurrent_jobs: max_concurrent_jobs.max(1),
                continue_on_error,
                running: 0,
                dead: false,
                queue: VecDeque::new(),
            })),
        }
    }

    /// Submits a thunk producing a deferred. Returns a deferred carrying
    /// the thunk's result: `Ok` on success, `Err(UserRaised)` if it
    /// failed, `Err(Aborted)` if the throttle was killed first.
    pub fn enqueue<T: Clone + 'static>(
        &self,
        f: impl FnOnce() -> Deferred<T> + 'static,
    ) -> Deferred<Result<T>> {
        let result: Ivar<Result<T>> = Ivar::create();

        {
            let inner = self.inner.borrow();
            if inner.dead {
                drop(inner);
                result.fill(Err(Error::aborted().with_context("throttle was killed")));
                return Deferred::of_ivar(result);
            }
        }

        let throttle = self.clone();
        let start: Box<dyn FnOnce()> = {
            let result = result.clone();
            Box::new(move || {
                let body = Monitor::try_with(f);
                let finish = result.clone();
                let throttle = throttle.clone();
                body.upon(move |outcome| {
                    let failed = outcome.is_err();
                    finish.fill_if_empty(outcome);
                    throttle.job_finished(failed);
                });
            })
        };
        let abort: Box<dyn FnOnce()> = {
            let result = result.clone();
            Box::new(move || {
                result.fill_if_empty(Err(Error::aborted().with_context("throttle was killed")));
            })
        };

        {
            let mut inner = self.inner.borrow_mut();
            if inner.running < inner.max_concurrent_jobs {
                inner.running += 1;
                drop(inner);
                // Admission already counted; the thunk itself still runs as a
                // fresh job.
                Scheduler::current().schedule(start);
            } else {
                inner.queue.push_back(QueuedJob { start, abort });
            }
        }
        Deferred::of_ivar(result)
    }

    /// Kills the throttle: queued jobs resolve `Err(Aborted)` and later
    /// submissions are rejected the same way. Jobs already running are
    /// not interrupted.
    pub fn kill(&self) {
        let drained = {
            let mut inner = self.inner.borrow_mut();
            if inner.dead {
                return;
            }
            inner.dead = true;
            std::mem::take(&mut inner.queue)
        };
        for job in drained {
            (job.abort)();
        }
    }

    /// True once the throttle has been killed.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.inner.borrow().dead
    }

    /// The admission limit.
    #[must_use]
    pub fn max_concurrent_jobs(&self) -> usize {
        self.inner.borrow().max_concurrent_jobs
    }

    /// Jobs currently admitted.
    #[must_use]
    pub fn num_jobs_running(&self) -> usize {
        self.inner.borrow().running
    }

    /// Jobs queued behind the limit.
    #[must_use]
    pub fn num_jobs_waiting(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    fn job_finished(&self, failed: bool) {
        if failed && !self.inner.borrow().continue_on_error {
            self.kill();
        }
        let next = {
            let mut inner = self.inner.borrow_mut();
            inner.running -= 1;
            if inner.dead {
                None
            } else if let Some(job) = inner.queue.pop_front() {
                inner.running += 1;
                Some(job)
            } else {
                None
            }
        };
        if let Some(job) = next {
            Scheduler::current().schedule(job.start);
        }
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Throttle")
            .field("max", &inner.max_concurrent_jobs)
            .field("running", &inner.running)
            .field("waiting", &inner.queue.len())
            .field("dead", &inner.dead)
            .finish()
    }
}

/// Mutual exclusion in submission order: a [`Throttle`] with
/// `max_concurrent_jobs = 1`.
#[derive(Clone, Debug)]
pub struct Sequencer {
    throttle: Throttle,
}

impl Sequencer {
    /// Creates a sequencer.
    #[must_use]
    pub fn create(continue_on_error: bool) -> Self {
        Self {
            throttle: Throttle::create(1, continue_on_error),
        }
    }

    /// Submits a thunk; it runs once every earlier submission finished.
    pub fn enqueue<T: Clone + 'static>(
        &self,
        f: impl FnOnce() -> Deferred<T> + 'static,
    ) -> Deferred<Result<T>> {
        self.throttle.enqueue(f)
    }

    /// Kills the underlying throttle.
    pub fn kill(&self) {
        self.throttle.kill();
    }

    /// True once killed.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.throttle.is_dead()
    }
}
