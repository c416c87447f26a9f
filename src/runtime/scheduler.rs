//! The scheduler: one cycle at a time, one thread, strict FIFO bands.
//!
//! The scheduler owns the job queues, the timing wheel, the current
//! execution context, and the cross-thread inbox. One [`run_cycle`] does,
//! in order:
//!
//! 1. Snapshot the time oracle and advance the timing wheel; fired events
//!    become jobs at the back of their bands.
//! 2. Splice externally-deposited jobs into the end of the normal band.
//! 3. Drain the normal band, then the low band, each up to the per-cycle
//!    fairness cap. Jobs left over stay queued for the next cycle.
//! 4. Run the configured invariant checks.
//!
//! Each job runs inside its captured context with panics caught at the
//! boundary and routed through the supervision tree. Time never advances
//! while a job is running; a computation suspends only by registering a
//! handler and returning.
//!
//! There is exactly one scheduler per thread, reached through
//! [`Scheduler::current`]. Handles are not `Send`; the external inbox is
//! the only cross-thread surface.
//!
//! [`run_cycle`]: Scheduler::run_cycle

use super::external::{ExternalHandle, ExternalShared};
use super::job::Job;
use super::queue::JobQueue;
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::{Error, ErrorKind, Result};
use crate::monitor::Monitor;
use crate::time::wheel::{AlarmId, HorizonError, TimingWheel};
use crate::types::{Priority, Span, Time};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

thread_local! {
    static CURRENT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// What one cycle did, and when the next one is needed.
#[derive(Debug, Clone, Copy)]
pub struct CycleSummary {
    /// Jobs executed this cycle across both bands.
    pub jobs_run: u64,
    /// Timing-wheel alarms fired at the top of the cycle.
    pub fired_alarms: usize,
    /// Earliest pending alarm, if any. Together with the external wakeup
    /// signal this is the wait target for a blocking driver.
    pub next_event_time: Option<Time>,
    /// True if jobs remained queued when the cycle ended (the fairness cap
    /// was reached, or draining enqueued more work).
    pub jobs_pending: bool,
}

struct SchedulerInner {
    config: Config,
    queue: RefCell<JobQueue>,
    wheel: RefCell<TimingWheel<Job>>,
    main_context: ExecutionContext,
    current_context: RefCell<ExecutionContext>,
    cycle_in_progress: Cell<bool>,
    now: Cell<Time>,
    cycle_start: Cell<Time>,
    cycle_count: Cell<u64>,
    jobs_run_total: Cell<u64>,
    max_jobs_per_priority: Cell<usize>,
    external: Arc<ExternalShared>,
    uncaught: RefCell<Option<Error>>,
    uncaught_hook: RefCell<Rc<dyn Fn(&Error)>>,
    owner_thread: ThreadId,
}

/// A cheap handle to this thread's scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    fn new(config: Config) -> Self {
        let main_monitor = Monitor::root();
        let main_context = ExecutionContext::new(main_monitor, Priority::Normal);
        let wheel = TimingWheel::with_config(Time::ZERO, config.timing_wheel.clone());
        let max_jobs = config.max_num_jobs_per_priority_per_cycle.max(1);
        Self {
            inner: Rc::new(SchedulerInner {
                config,
                queue: RefCell::new(JobQueue::new()),
                wheel: RefCell::new(wheel),
                current_context: RefCell::new(main_context.clone()),
                main_context,
                cycle_in_progress: Cell::new(false),
                now: Cell::new(Time::ZERO),
                cycle_start: Cell::new(Time::ZERO),
                cycle_count: Cell::new(0),
                jobs_run_total: Cell::new(0),
                max_jobs_per_priority: Cell::new(max_jobs),
                external: Arc::new(ExternalShared::default()),
                uncaught: RefCell::new(None),
                uncaught_hook: RefCell::new(Rc::new(|_| {})),
                owner_thread: thread::current().id(),
            }),
        }
    }

    /// Returns this thread's scheduler, creating one with the default
    /// configuration on first use.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|cell| {
            if let Some(scheduler) = &*cell.borrow() {
                return scheduler.clone();
            }
            let scheduler = Self::new(Config::default());
            *cell.borrow_mut() = Some(scheduler.clone());
            scheduler
        })
    }

    /// Creates this thread's scheduler with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if the thread already has a scheduler — configuration must
    /// happen before any kernel operation runs on the thread.
    #[must_use]
    pub fn init(config: Config) -> Self {
        CURRENT.with(|cell| {
            let mut slot = cell.borrow_mut();
            assert!(
                slot.is_none(),
                "scheduler already initialized on this thread"
            );
            let scheduler = Self::new(config);
            *slot = Some(scheduler.clone());
            scheduler
        })
    }

    // ------------------------------------------------------------------
    // Time oracle
    // ------------------------------------------------------------------

    /// Returns the oracle's current time. During a cycle this is the value
    /// snapshotted at cycle start.
    #[must_use]
    pub fn now(&self) -> Time {
        self.inner.now.get()
    }

    /// Advances the time oracle by a span. Nonpositive spans are ignored;
    /// the oracle is monotonic.
    pub fn advance_time(&self, span: Span) {
        if span.is_positive() {
            self.inner.now.set(self.inner.now.get() + span);
        }
    }

    /// Advances the time oracle to an absolute time, never backwards.
    pub fn advance_time_to(&self, time: Time) {
        if time > self.inner.now.get() {
            self.inner.now.set(time);
        }
    }

    // ------------------------------------------------------------------
    // The cycle
    // ------------------------------------------------------------------

    /// Runs one cycle. Fails with `CycleInProgress` if called re-entrantly
    /// (from inside a job).
    pub fn run_cycle(&self) -> Result<CycleSummary> {
        if self.inner.cycle_in_progress.get() {
            return Err(Error::new(ErrorKind::CycleInProgress));
        }
        self.check_access("run_cycle");
        self.inner.cycle_in_progress.set(true);
        let _guard = CycleGuard {
            scheduler: self.clone(),
        };

        let now = self.inner.now.get();
        self.inner.cycle_start.set(now);
        self.inner.cycle_count.set(self.inner.cycle_count.get() + 1);

        // 1. Fire due alarms; each fired payload is a job.
        let fired = self.inner.wheel.borrow_mut().advance_to(now);
        let fired_alarms = fired.len();
        {
            let mut queue = self.inner.queue.borrow_mut();
            for job in fired {
                queue.push(job);
            }
        }

        // 2. Splice the cross-thread inbox into the normal band.
        let external = self.inner.external.drain();
        if !external.is_empty() {
            let jobs: Vec<Job> = external
                .into_iter()
                .map(|thunk| {
                    let run: Box<dyn FnOnce()> = thunk;
                    Job::new(self.inner.main_context.clone(), run)
                })
                .collect();
            self.inner.queue.borrow_mut().splice(jobs);
        }

        // 3. Drain bands under the fairness cap.
        let cap = self.inner.max_jobs_per_priority.get() as u64;
        let normal_run = self.drain_band(Priority::Normal, cap);
        let low_run = self.drain_band(Priority::Low, cap);

        // 4. Optional consistency checks.
        if self.inner.config.check_invariants {
            self.check_invariants();
        }

        let summary = CycleSummary {
            jobs_run: normal_run + low_run,
            fired_alarms,
            next_event_time: self.inner.wheel.borrow_mut().min_alarm_time(),
            jobs_pending: !self.inner.queue.borrow().is_empty(),
        };
        tracing::trace!(
            cycle = self.inner.cycle_count.get(),
            now = %now,
            jobs_run = summary.jobs_run,
            fired_alarms = summary.fired_alarms,
            jobs_pending = summary.jobs_pending,
            "cycle complete"
        );
        Ok(summary)
    }

    /// Runs cycles (without advancing time) until no jobs remain queued.
    /// Returns the number of cycles run.
    pub fn run_until_quiescent(&self) -> Result<u64> {
        let mut cycles = 0;
        loop {
            let summary = self.run_cycle()?;
            cycles += 1;
            if !summary.jobs_pending && self.inner.external.is_empty() {
                return Ok(cycles);
            }
        }
    }

    /// True while a cycle is being run.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.cycle_in_progress.get()
    }

    /// True when no jobs are queued and the inbox is empty. Pending
    /// alarms do not count; they need time to advance.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.inner.queue.borrow().is_empty() && self.inner.external.is_empty()
    }

    /// Earliest pending timing-wheel alarm.
    #[must_use]
    pub fn next_upcoming_event_time(&self) -> Option<Time> {
        self.inner.wheel.borrow_mut().min_alarm_time()
    }

    /// The time snapshot taken when the most recent cycle started.
    #[must_use]
    pub fn cycle_start_time(&self) -> Time {
        self.inner.cycle_start.get()
    }

    /// Jobs run since the scheduler was created.
    #[must_use]
    pub fn num_jobs_run(&self) -> u64 {
        self.inner.jobs_run_total.get()
    }

    /// Adjusts the per-band fairness cap. A cap of zero is treated as 1.
    pub fn set_max_num_jobs_per_priority_per_cycle(&self, cap: usize) {
        self.inner.max_jobs_per_priority.set(cap.max(1));
    }

    fn drain_band(&self, band: Priority, cap: u64) -> u64 {
        let mut run = 0;
        while run < cap {
            let job = self.inner.queue.borrow_mut().pop(band);
            let Some(job) = job else { break };
            self.run_job(job);
            run += 1;
        }
        run
    }

    fn run_job(&self, job: Job) {
        let Job { context, run } = job;
        let outcome = self.within_context(context.clone(), || crate::monitor::catch_user(run));
        self.inner
            .jobs_run_total
            .set(self.inner.jobs_run_total.get() + 1);
        if let Err(error) = outcome {
            tracing::debug!(
                error = %error,
                monitor = %context.monitor().name(),
                "job failed; routing to its monitor"
            );
            context.monitor().send_error(error);
        }
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    /// Returns the context new work is attributed to right now.
    #[must_use]
    pub fn current_context(&self) -> ExecutionContext {
        self.inner.current_context.borrow().clone()
    }

    /// The context rooted at the main monitor.
    #[must_use]
    pub fn main_context(&self) -> ExecutionContext {
        self.inner.main_context.clone()
    }

    /// The monitor at the root of the supervision tree.
    #[must_use]
    pub fn main_monitor(&self) -> Monitor {
        self.inner.main_context.monitor().clone()
    }

    /// Sets the current context around `f`, restoring the previous one on
    /// every exit path, including unwinds.
    pub fn within_context<R>(&self, context: ExecutionContext, f: impl FnOnce() -> R) -> R {
        let prev = self.inner.current_context.replace(context);
        let _guard = ContextGuard {
            scheduler: self.clone(),
            prev: Some(prev),
        };
        f()
    }

    /// Appends a call-site tag to a context when backtrace recording is on.
    pub(crate) fn frame(&self, context: ExecutionContext, tag: &'static str) -> ExecutionContext {
        if self.inner.config.record_backtraces {
            context.with_frame(tag)
        } else {
            context
        }
    }

    // ------------------------------------------------------------------
    // Enqueueing
    // ------------------------------------------------------------------

    /// Enqueues a job under an explicit context.
    pub(crate) fn enqueue(&self, context: ExecutionContext, run: Box<dyn FnOnce()>) {
        self.check_access("enqueue");
        self.inner.queue.borrow_mut().push(Job::new(context, run));
    }

    /// Schedules `f` to run as a job in the current context.
    pub fn schedule(&self, f: impl FnOnce() + 'static) {
        self.enqueue(self.current_context(), Box::new(f));
    }

    /// Schedules `f` in the current context moved to another band.
    pub fn schedule_with_priority(&self, priority: Priority, f: impl FnOnce() + 'static) {
        self.enqueue(self.current_context().with_priority(priority), Box::new(f));
    }

    /// Returns the `Send` handle foreign threads use to deposit work and
    /// drivers use to sleep.
    #[must_use]
    pub fn external_handle(&self) -> ExternalHandle {
        ExternalHandle::new(self.inner.external.clone())
    }

    // ------------------------------------------------------------------
    // Alarms (used by the clock layer)
    // ------------------------------------------------------------------

    pub(crate) fn add_alarm(&self, at: Time, job: Job) -> std::result::Result<AlarmId, HorizonError> {
        self.inner.wheel.borrow_mut().try_add(at, job)
    }

    pub(crate) fn remove_alarm(&self, alarm: AlarmId) -> bool {
        self.inner.wheel.borrow_mut().remove(alarm).is_some()
    }

    pub(crate) fn reschedule_alarm(
        &self,
        alarm: AlarmId,
        at: Time,
    ) -> std::result::Result<Option<AlarmId>, HorizonError> {
        self.inner.wheel.borrow_mut().reschedule(alarm, at)
    }

    // ------------------------------------------------------------------
    // Failure surface
    // ------------------------------------------------------------------

    /// Installs the hook invoked when an unhandled error reaches the main
    /// monitor. The default hook only logs; embeddings that must not
    /// outlive an unhandled error typically install a terminating hook.
    pub fn install_uncaught_handler(&self, hook: impl Fn(&Error) + 'static) {
        *self.inner.uncaught_hook.borrow_mut() = Rc::new(hook);
    }

    /// The first unhandled error that reached the main monitor, if any.
    /// Once set, the scheduler is considered fatal.
    #[must_use]
    pub fn uncaught_error(&self) -> Option<Error> {
        self.inner.uncaught.borrow().clone()
    }

    pub(crate) fn report_uncaught(&self, error: Error) {
        tracing::error!(error = %error, "unhandled error reached the main monitor");
        {
            let mut slot = self.inner.uncaught.borrow_mut();
            if slot.is_none() {
                *slot = Some(error.clone());
            }
        }
        let hook = self.inner.uncaught_hook.borrow().clone();
        hook(&error);
    }

    // ------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------

    fn check_access(&self, operation: &str) {
        if self.inner.config.detect_invalid_access_from_thread
            && thread::current().id() != self.inner.owner_thread
        {
            panic!(
                "scheduler operation `{operation}` invoked from a foreign thread; \
                 cross-thread work must go through the external-job inbox"
            );
        }
    }

    /// Runs the consistency checks enabled by `check_invariants`.
    pub fn check_invariants(&self) {
        self.inner.queue.borrow().check_invariants();
        assert!(
            ExecutionContext::same_context(&self.current_context(), &self.inner.main_context),
            "current context must be the main context between jobs"
        );
    }
}

struct CycleGuard {
    scheduler: Scheduler,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.scheduler.inner.cycle_in_progress.set(false);
    }
}

struct ContextGuard {
    scheduler: Scheduler,
    prev: Option<ExecutionContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            self.scheduler.inner.current_context.replace(prev);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.inner.now.get())
            .field("cycles", &self.inner.cycle_count.get())
            .field("queued", &self.inner.queue.borrow().total_len())
            .field("alarms", &self.inner.wheel.borrow().len())
            .field("fatal", &self.inner.uncaught.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn jobs_run_in_fifo_order() {
        init_test("jobs_run_in_fifo_order");
        let scheduler = Scheduler::current();
        let log: Rc<StdRefCell<Vec<u32>>> = Rc::new(StdRefCell::new(Vec::new()));
        for i in 1..=3 {
            let log = log.clone();
            scheduler.schedule(move || log.borrow_mut().push(i));
        }
        let summary = scheduler.run_cycle().expect("cycle runs");
        crate::assert_with_log!(summary.jobs_run == 3, "three jobs", 3, summary.jobs_run);
        crate::assert_with_log!(
            *log.borrow() == vec![1, 2, 3],
            "fifo order",
            "[1, 2, 3]",
            format!("{:?}", log.borrow())
        );
        crate::test_complete!("jobs_run_in_fifo_order");
    }

    #[test]
    fn low_band_runs_after_normal() {
        init_test("low_band_runs_after_normal");
        let scheduler = Scheduler::current();
        let log: Rc<StdRefCell<Vec<&str>>> = Rc::new(StdRefCell::new(Vec::new()));
        {
            let log = log.clone();
            scheduler.schedule_with_priority(Priority::Low, move || log.borrow_mut().push("low"));
        }
        {
            let log = log.clone();
            scheduler.schedule(move || log.borrow_mut().push("normal"));
        }
        scheduler.run_cycle().expect("cycle runs");
        assert_eq!(*log.borrow(), vec!["normal", "low"]);
        crate::test_complete!("low_band_runs_after_normal");
    }

    #[test]
    fn fairness_cap_carries_jobs_to_next_cycle() {
        init_test("fairness_cap_carries_jobs_to_next_cycle");
        let scheduler = Scheduler::current();
        scheduler.set_max_num_jobs_per_priority_per_cycle(2);
        let counter = Rc::new(Cell::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            scheduler.schedule(move || counter.set(counter.get() + 1));
        }

        let first = scheduler.run_cycle().expect("cycle runs");
        crate::assert_with_log!(first.jobs_run == 2, "capped", 2, first.jobs_run);
        assert!(first.jobs_pending);
        assert_eq!(counter.get(), 2);

        scheduler.run_cycle().expect("cycle runs");
        let third = scheduler.run_cycle().expect("cycle runs");
        assert_eq!(counter.get(), 5);
        assert!(!third.jobs_pending);
        crate::test_complete!("fairness_cap_carries_jobs_to_next_cycle");
    }

    #[test]
    fn reentrant_run_cycle_fails() {
        init_test("reentrant_run_cycle_fails");
        let scheduler = Scheduler::current();
        let observed: Rc<StdRefCell<Option<ErrorKind>>> = Rc::new(StdRefCell::new(None));
        {
            let observed = observed.clone();
            scheduler.schedule(move || {
                let err = Scheduler::current()
                    .run_cycle()
                    .expect_err("re-entrant cycle must fail");
                *observed.borrow_mut() = Some(err.kind());
            });
        }
        scheduler.run_cycle().expect("outer cycle runs");
        assert_eq!(*observed.borrow(), Some(ErrorKind::CycleInProgress));
        crate::test_complete!("reentrant_run_cycle_fails");
    }

    #[test]
    fn external_jobs_spliced_in_arrival_order() {
        init_test("external_jobs_spliced_in_arrival_order");
        let scheduler = Scheduler::current();
        let handle = scheduler.external_handle();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let worker = {
            let handle = handle.clone();
            let log = log.clone();
            std::thread::spawn(move || {
                for i in 0..3 {
                    let log = log.clone();
                    handle.enqueue_external_job(move || log.lock().push(i));
                }
            })
        };
        worker.join().expect("worker thread");

        assert!(handle.wait_for_wakeup(Some(std::time::Duration::from_millis(50))));
        scheduler.run_cycle().expect("cycle runs");
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        crate::test_complete!("external_jobs_spliced_in_arrival_order");
    }

    #[test]
    fn failed_job_reaches_uncaught_hook() {
        init_test("failed_job_reaches_uncaught_hook");
        let scheduler = Scheduler::current();
        let seen: Rc<StdRefCell<Option<String>>> = Rc::new(StdRefCell::new(None));
        {
            let seen = seen.clone();
            scheduler.install_uncaught_handler(move |error| {
                *seen.borrow_mut() = Some(error.to_string());
            });
        }
        scheduler.schedule(|| panic!("kaboom"));
        scheduler.run_cycle().expect("cycle runs");

        assert_eq!(seen.borrow().as_deref(), Some("UserRaised: kaboom"));
        assert!(scheduler.uncaught_error().is_some());
        crate::test_complete!("failed_job_reaches_uncaught_hook");
    }

    #[test]
    fn context_restored_after_panicking_job() {
        init_test("context_restored_after_panicking_job");
        let scheduler = Scheduler::init(Config::new().check_invariants(true));
        scheduler.schedule(|| panic!("unwind through within_context"));
        scheduler.run_cycle().expect("cycle runs");
        // check_invariants asserts the current context is back to main.
        scheduler.check_invariants();
        crate::test_complete!("context_restored_after_panicking_job");
    }
}
