//! Combinator algebra: monad laws, aggregation, racing.

use monosync::deferred::{self, choice, choose, Deferred};
use monosync::test_utils::init_test_logging;
use monosync::{test_complete, test_phase};
use monosync::{Ivar, Scheduler};
use std::cell::RefCell;
use std::rc::Rc;

fn init_test(name: &str) -> Scheduler {
    init_test_logging();
    test_phase!(name);
    Scheduler::current()
}

#[test]
fn bind_is_associative_up_to_determination() {
    let scheduler = init_test("bind_is_associative_up_to_determination");
    let ivar: Ivar<u32> = Ivar::create();
    let d = ivar.read();

    let f = |x: u32| Deferred::ready(x + 1);
    let g = |x: u32| Deferred::ready(x * 2);

    let left = d.bind(f).bind(g);
    let right = d.bind(move |x| f(x).bind(g));

    ivar.fill(3);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(left.peek(), Some(8));
    assert_eq!(right.peek(), Some(8));
    test_complete!("bind_is_associative_up_to_determination");
}

#[test]
fn ready_is_left_and_right_identity_of_bind() {
    let scheduler = init_test("ready_is_left_and_right_identity_of_bind");
    let f = |x: u32| Deferred::ready(x * 10);

    let left = Deferred::ready(4).bind(f);
    let direct = f(4);

    let ivar: Ivar<u32> = Ivar::create();
    let right = ivar.read().bind(Deferred::ready);
    ivar.fill(4);

    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(left.peek(), direct.peek());
    assert_eq!(right.peek(), Some(4));
    test_complete!("ready_is_left_and_right_identity_of_bind");
}

#[test]
fn long_bind_chains_compress() {
    let scheduler = init_test("long_bind_chains_compress");
    let ivar: Ivar<u64> = Ivar::create();
    let mut chain = ivar.read();
    for _ in 0..1000 {
        chain = chain.bind(|x| Deferred::ready(x + 1));
    }
    ivar.fill(0);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(chain.peek(), Some(1000));
    test_complete!("long_bind_chains_compress");
}

#[test]
fn map_on_determined_needs_no_job() {
    let _scheduler = init_test("map_on_determined_needs_no_job");
    let mapped = Deferred::ready(5).map(|x| x * 3);
    // No cycle has run; the special case applied.
    assert_eq!(mapped.peek(), Some(15));
    test_complete!("map_on_determined_needs_no_job");
}

#[test]
fn all_preserves_input_order_regardless_of_fill_order() {
    let scheduler = init_test("all_preserves_input_order_regardless_of_fill_order");
    let ivars: Vec<Ivar<u32>> = (0..4).map(|_| Ivar::create()).collect();
    let combined = deferred::all(ivars.iter().map(Ivar::read).collect());

    // Fill out of order.
    ivars[2].fill(2);
    ivars[0].fill(0);
    ivars[3].fill(3);
    scheduler.run_until_quiescent().expect("cycles");
    assert!(!combined.is_determined(), "one input still empty");

    ivars[1].fill(1);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(combined.peek(), Some(vec![0, 1, 2, 3]));
    test_complete!("all_preserves_input_order_regardless_of_fill_order");
}

#[test]
fn both_and_join() {
    let scheduler = init_test("both_and_join");
    let left: Ivar<&str> = Ivar::create();
    let right: Ivar<u32> = Ivar::create();
    let pair = left.read().both(&right.read());

    let nested: Ivar<Deferred<u32>> = Ivar::create();
    let flat = nested.read().join();

    right.fill(9);
    left.fill("go");
    nested.fill(Deferred::ready(7));

    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(pair.peek(), Some(("go", 9)));
    assert_eq!(flat.peek(), Some(7));
    test_complete!("both_and_join");
}

#[test]
fn any_takes_first_determination() {
    let scheduler = init_test("any_takes_first_determination");
    let a: Ivar<u32> = Ivar::create();
    let b: Ivar<u32> = Ivar::create();
    let first = deferred::any(vec![a.read(), b.read()]);

    b.fill(20);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(first.peek(), Some(20));

    // The later fill is coalesced away.
    a.fill(10);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(first.peek(), Some(20));
    test_complete!("any_takes_first_determination");
}

#[test]
fn choose_picks_first_determined_and_result_is_stable() {
    let scheduler = init_test("choose_picks_first_determined_and_result_is_stable");
    let a: Ivar<u32> = Ivar::create();
    let b: Ivar<u32> = Ivar::create();
    let raced = choose(vec![
        choice(&a.read(), |x| ("a", x)),
        choice(&b.read(), |x| ("b", x)),
    ]);

    b.fill(2);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(raced.peek(), Some(("b", 2)));

    // The losing alternative's handler was removed; a late fill neither
    // re-determines the result nor raises.
    a.fill(1);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(raced.peek(), Some(("b", 2)));
    assert!(scheduler.uncaught_error().is_none());
    test_complete!("choose_picks_first_determined_and_result_is_stable");
}

#[test]
fn choose_tie_break_is_argument_order() {
    let scheduler = init_test("choose_tie_break_is_argument_order");
    let a: Ivar<u32> = Ivar::create();
    let b: Ivar<u32> = Ivar::create();
    let raced = choose(vec![
        choice(&a.read(), |x| ("a", x)),
        choice(&b.read(), |x| ("b", x)),
    ]);

    // Both determined before any wake job runs: the earlier choice wins.
    b.fill(2);
    a.fill(1);
    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(raced.peek(), Some(("a", 1)));
    test_complete!("choose_tie_break_is_argument_order");
}

#[test]
fn peek_stability_and_identity_equality() {
    let scheduler = init_test("peek_stability_and_identity_equality");
    let ivar: Ivar<u32> = Ivar::create();
    let view_a = ivar.read();
    let view_b = ivar.read();
    assert_eq!(view_a, view_b, "views of one cell are equal");

    ivar.fill(42);
    scheduler.run_until_quiescent().expect("cycles");
    for _ in 0..5 {
        assert_eq!(view_a.peek(), Some(42));
    }
    test_complete!("peek_stability_and_identity_equality");
}

#[test]
fn ignore_value_and_all_unit() {
    let scheduler = init_test("ignore_value_and_all_unit");
    let a: Ivar<u32> = Ivar::create();
    let b: Ivar<u32> = Ivar::create();
    let done = deferred::all_unit(vec![a.read().ignore_value(), b.read().ignore_value()]);

    a.fill(1);
    scheduler.run_until_quiescent().expect("cycles");
    assert!(!done.is_determined());

    b.fill(2);
    scheduler.run_until_quiescent().expect("cycles");
    assert!(done.is_determined());
    test_complete!("ignore_value_and_all_unit");
}

#[test]
fn handlers_registered_before_fill_run_before_later_registrations() {
    let scheduler = init_test("handlers_registered_before_fill_run_before_later_registrations");
    let order: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));
    let ivar: Ivar<()> = Ivar::create();

    {
        let order = order.clone();
        ivar.read().upon(move |()| order.borrow_mut().push("early"));
    }
    ivar.fill(());
    {
        let order = order.clone();
        ivar.read().upon(move |()| order.borrow_mut().push("late"));
    }

    scheduler.run_until_quiescent().expect("cycles");
    assert_eq!(*order.borrow(), vec!["early", "late"]);
    test_complete!("handlers_registered_before_fill_run_before_later_registrations");
}
