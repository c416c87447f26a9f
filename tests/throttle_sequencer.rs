//! Bounded concurrency: serial execution, kill, error policies.

use monosync::clock;
use monosync::test_utils::init_test_logging;
use monosync::{test_complete, test_phase};
use monosync::{Deferred, Ivar, Scheduler, Sequencer, Span, Throttle};
use std::cell::RefCell;
use std::rc::Rc;

fn init_test(name: &str) -> Scheduler {
    init_test_logging();
    test_phase!(name);
    Scheduler::current()
}

#[test]
fn sequencer_runs_tick_sleepers_serially_in_submission_order() {
    let scheduler = init_test("sequencer_runs_tick_sleepers_serially_in_submission_order");
    let throttle = Throttle::create(1, true);
    let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

    let results: Vec<_> = (0..4)
        .map(|i| {
            let order = order.clone();
            throttle.enqueue(move || {
                order.borrow_mut().push(i);
                // Sleep one tick before completing.
                clock::after(Span::from_millis(1))
            })
        })
        .collect();

    for _ in 0..4 {
        scheduler.run_until_quiescent().expect("cycles");
        scheduler.advance_time(Span::from_millis(1));
    }
    scheduler.run_until_quiescent().expect("cycles");

    assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    for (i, result) in results.iter().enumerate() {
        assert!(
            result.peek().expect("determined").is_ok(),
            "job {i} completed"
        );
    }
    test_complete!("sequencer_runs_tick_sleepers_serially_in_submission_order");
}

#[test]
fn at_most_max_jobs_admitted_concurrently() {
    let scheduler = init_test("at_most_max_jobs_admitted_concurrently");
    let throttle = Throttle::create(2, true);
    let gates: Vec<Ivar<()>> = (0..5).map(|_| Ivar::create()).collect();
    let active = Rc::new(RefCell::new(0_usize));
    let peak = Rc::new(RefCell::new(0_usize));

    let _results: Vec<_> = gates
        .iter()
        .map(|gate| {
            let gate = gate.clone();
            let active = active.clone();
            let peak = peak.clone();
            throttle.enqueue(move || {
                {
                    let mut active = active.borrow_mut();
                    *active += 1;
                    let mut peak = peak.borrow_mut();
                    *peak = (*peak).max(*active);
                }
                let active = active.clone();
                gate.read().map(move |()| {
                    *active.borrow_mut() -= 1;
                })
            })
        })
        .collect();

    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(*peak.borrow(), 2);

    for gate in gates {
        gate.fill(());
        scheduler.run_until_quiescent().expect("cycles");
    }
    assert_eq!(*active.borrow(), 0);
    assert_eq!(*peak.borrow(), 2, "never more than two at once");
    test_complete!("at_most_max_jobs_admitted_concurrently");
}

#[test]
fn failure_with_continue_on_error_keeps_the_throttle_alive() {
    let scheduler = init_test("failure_with_continue_on_error_keeps_the_throttle_alive");
    let throttle = Throttle::create(1, true);

    let failing = throttle.enqueue(|| -> Deferred<u32> { panic!("job failure") });
    let following = throttle.enqueue(|| Deferred::ready(2));

    scheduler.run_until_quiescent().expect("cycles");
    let err = failing.peek().expect("determined").expect_err("failed");
    assert!(err.is_user_raised());
    assert_eq!(following.peek().expect("determined").expect("ok"), 2);
    assert!(!throttle.is_dead());
    test_complete!("failure_with_continue_on_error_keeps_the_throttle_alive");
}

#[test]
fn first_failure_kills_throttle_when_not_continuing() {
    let scheduler = init_test("first_failure_kills_throttle_when_not_continuing");
    let throttle = Throttle::create(1, false);

    let failing = throttle.enqueue(|| -> Deferred<u32> { panic!("fatal job failure") });
    let queued = throttle.enqueue(|| Deferred::ready(2));

    scheduler.run_until_quiescent().expect("cycles");
    assert!(failing.peek().expect("determined").is_err());
    let err = queued.peek().expect("determined").expect_err("aborted");
    assert!(err.is_aborted());
    assert!(throttle.is_dead());

    let rejected = throttle.enqueue(|| Deferred::ready(3));
    assert!(rejected.peek().expect("determined").is_err());
    test_complete!("first_failure_kills_throttle_when_not_continuing");
}

#[test]
fn sequencer_is_mutual_exclusion() {
    let scheduler = init_test("sequencer_is_mutual_exclusion");
    let sequencer = Sequencer::create(true);
    let in_section = Rc::new(RefCell::new(false));
    let violations = Rc::new(RefCell::new(0_u32));

    let _results: Vec<_> = (0..3)
        .map(|_| {
            let in_section = in_section.clone();
            let violations = violations.clone();
            sequencer.enqueue(move || {
                if *in_section.borrow() {
                    *violations.borrow_mut() += 1;
                }
                *in_section.borrow_mut() = true;
                let in_section = in_section.clone();
                clock::after(Span::from_millis(1)).map(move |()| {
                    *in_section.borrow_mut() = false;
                })
            })
        })
        .collect();

    for _ in 0..3 {
        scheduler.run_until_quiescent().expect("cycles");
        scheduler.advance_time(Span::from_millis(1));
    }
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(*violations.borrow(), 0);
    test_complete!("sequencer_is_mutual_exclusion");
}
