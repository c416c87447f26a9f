//! Error containment: try_with, handle_errors, detachment, the hook.

use monosync::test_utils::init_test_logging;
use monosync::{test_complete, test_phase};
use monosync::{Deferred, Ivar, Monitor, Scheduler};
use std::cell::RefCell;
use std::rc::Rc;

fn init_test(name: &str) -> Scheduler {
    init_test_logging();
    test_phase!(name);
    Scheduler::current()
}

#[test]
fn try_with_reifies_a_synchronous_failure() {
    let scheduler = init_test("try_with_reifies_a_synchronous_failure");
    let result = Monitor::try_with(|| -> Deferred<u32> {
        panic!("E");
    });

    scheduler.run_until_quiescent().expect("cycles");
    let err = result.peek().expect("determined").expect_err("failed");
    assert!(err.is_user_raised());
    assert_eq!(err.payload().expect("payload").message(), "E");

    // Nothing leaked to the parent.
    assert!(scheduler.uncaught_error().is_none());
    assert!(!scheduler.main_monitor().has_seen_error());
    test_complete!("try_with_reifies_a_synchronous_failure");
}

#[test]
fn try_with_catches_failures_in_scheduled_jobs() {
    let scheduler = init_test("try_with_catches_failures_in_scheduled_jobs");
    let result = Monitor::try_with(|| -> Deferred<u32> {
        // The job inherits the try_with context, so its failure routes to
        // the try_with monitor, not the parent.
        Scheduler::current().schedule(|| panic!("late failure"));
        Deferred::never()
    });

    scheduler.run_until_quiescent().expect("cycles");
    let err = result.peek().expect("determined").expect_err("failed");
    assert_eq!(err.payload().expect("payload").message(), "late failure");
    assert!(scheduler.uncaught_error().is_none());
    test_complete!("try_with_catches_failures_in_scheduled_jobs");
}

#[test]
fn try_with_success_resolves_ok() {
    let scheduler = init_test("try_with_success_resolves_ok");
    let gate: Ivar<u32> = Ivar::create();
    let result = {
        let gate = gate.clone();
        Monitor::try_with(move || gate.read())
    };

    scheduler.run_until_quiescent().expect("cycles");
    assert!(!result.is_determined());

    gate.fill(11);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(result.peek().expect("determined").expect("ok"), 11);
    test_complete!("try_with_success_resolves_ok");
}

#[test]
fn handle_errors_delivers_each_error_and_keeps_going() {
    let scheduler = init_test("handle_errors_delivers_each_error_and_keeps_going");
    let errors: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let _body = {
        let errors = errors.clone();
        Monitor::handle_errors(
            || {
                let scheduler = Scheduler::current();
                scheduler.schedule(|| panic!("first"));
                scheduler.schedule(|| panic!("second"));
                Deferred::ready(())
            },
            move |error| {
                errors
                    .borrow_mut()
                    .push(error.payload().expect("payload").message().to_string());
            },
        )
    };

    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(*errors.borrow(), vec!["first", "second"]);
    assert!(scheduler.uncaught_error().is_none());
    test_complete!("handle_errors_delivers_each_error_and_keeps_going");
}

#[test]
fn unhandled_error_forwards_to_parent_then_hook() {
    let scheduler = init_test("unhandled_error_forwards_to_parent_then_hook");
    let hook_calls: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let hook_calls = hook_calls.clone();
        scheduler.install_uncaught_handler(move |error| {
            hook_calls.borrow_mut().push(error.to_string());
        });
    }

    // A forwarding monitor with no handlers passes errors upward; the
    // main monitor has no handlers either, so the hook fires.
    let child = Monitor::create("forwarding-child");
    let context = scheduler.current_context().with_monitor(child.clone());
    scheduler.within_context(context, || {
        Scheduler::current().schedule(|| panic!("escapes"));
    });

    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(hook_calls.borrow().len(), 1);
    assert!(child.has_seen_error());
    assert!(scheduler.main_monitor().has_seen_error());
    assert!(scheduler.uncaught_error().is_some());
    test_complete!("unhandled_error_forwards_to_parent_then_hook");
}

#[test]
fn detached_monitor_does_not_forward() {
    let scheduler = init_test("detached_monitor_does_not_forward");
    let child = Monitor::create("to-detach");
    child.detach();

    let context = scheduler.current_context().with_monitor(child.clone());
    scheduler.within_context(context, || {
        Scheduler::current().schedule(|| panic!("contained"));
    });

    scheduler.run_until_quiescent().expect("cycles");
    assert!(child.has_seen_error());
    // Not forwarded to the parent, but with no handlers it still lands in
    // the uncaught hook rather than vanishing.
    assert!(!scheduler.main_monitor().has_seen_error());
    assert!(scheduler.uncaught_error().is_some());
    test_complete!("detached_monitor_does_not_forward");
}

#[test]
fn monitor_handlers_receive_errors_as_jobs() {
    let scheduler = init_test("monitor_handlers_receive_errors_as_jobs");
    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let monitor = Monitor::create_detached("observed");
    {
        let seen = seen.clone();
        monitor.on_error(move |error| {
            seen.borrow_mut().push(error.to_string());
        });
    }

    monitor.send_error(monosync::Error::aborted());
    assert!(seen.borrow().is_empty(), "handlers run as jobs, not inline");

    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(*seen.borrow(), vec!["Aborted".to_string()]);
    test_complete!("monitor_handlers_receive_errors_as_jobs");
}

#[test]
fn extract_error_recovers_the_original() {
    let _scheduler = init_test("extract_error_recovers_the_original");
    let annotated = monosync::Error::aborted().with_context("while shutting down");
    let original = Monitor::extract_error(annotated);
    assert_eq!(original.to_string(), "Aborted");
    test_complete!("extract_error_recovers_the_original");
}
