mod common;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use evloop::{Break, Events, Loop, Readiness, RunMode};
use proptest::prelude::*;

use common::harness;

#[test]
fn test_feed_twice_coalesces_into_one_invocation() {
    let mut h = harness();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();

    let w = h.lp.check(move |_, _, ev| seen2.borrow_mut().push(ev));
    h.lp.feed_event(w, Events::READ);
    h.lp.feed_event(w, Events::WRITE);

    assert!(h.lp.is_pending(w));
    assert_eq!(h.lp.pending_count(), 1);

    h.lp.invoke_pending();
    assert_eq!(*seen.borrow(), vec![Events::READ | Events::WRITE]);
    assert!(!h.lp.is_pending(w));
}

#[test]
fn test_higher_priority_invoked_first() {
    let mut h = harness();
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut ids = Vec::new();
    for pri in [-1, 0, 2] {
        let order = order.clone();
        let id = h.lp.check(move |lp, id, _| order.borrow_mut().push(lp.priority(id)));
        h.lp.set_priority(id, pri);
        ids.push(id);
    }

    for &id in &ids {
        h.lp.feed_event(id, Events::CUSTOM);
    }
    h.lp.invoke_pending();

    assert_eq!(*order.borrow(), vec![2, 0, -1]);
}

#[test]
fn test_clear_pending_returns_events() {
    let mut h = harness();
    let called = Rc::new(Cell::new(false));
    let called2 = called.clone();

    let w = h.lp.idle(move |_, _, _| called2.set(true));
    h.lp.feed_event(w, Events::IDLE | Events::CUSTOM);

    assert_eq!(h.lp.clear_pending(w), Events::IDLE | Events::CUSTOM);
    assert_eq!(h.lp.pending_count(), 0);

    h.lp.invoke_pending();
    assert!(!called.get());
}

#[test]
fn test_start_and_stop_are_idempotent() {
    let mut h = harness();
    let t = h.lp.timer(5.0, 0.0, |_, _, _| {});

    h.lp.start(t);
    h.lp.start(t);
    assert_eq!(h.lp.active_count(), 1);
    h.lp.verify();

    h.lp.stop(t);
    h.lp.stop(t);
    assert_eq!(h.lp.active_count(), 0);
    assert!(!h.lp.is_active(t));
    h.lp.verify();
}

#[test]
fn test_shared_fd_single_backend_update() {
    let mut h = harness();
    let r = h.lp.io(7, Events::READ, |_, _, _| {});
    let w = h.lp.io(7, Events::WRITE, |_, _, _| {});
    h.lp.start(r);
    h.lp.start(w);

    h.lp.run(RunMode::NoWait);
    assert_eq!(
        *h.modifies.borrow(),
        vec![(7, Events::NONE, Events::READ | Events::WRITE)]
    );

    h.lp.stop(w);
    h.lp.run(RunMode::NoWait);
    assert_eq!(
        h.modifies.borrow().last(),
        Some(&(7, Events::READ | Events::WRITE, Events::READ))
    );
    assert_eq!(h.modifies.borrow().len(), 2);
}

#[test]
fn test_readiness_reaches_matching_watchers_only() {
    let mut h = harness();
    let got = Rc::new(RefCell::new(Vec::new()));

    for mask in [Events::READ, Events::WRITE] {
        let got = got.clone();
        let id = h.lp.io(7, mask, move |_, _, ev| got.borrow_mut().push(ev));
        h.lp.start(id);
    }

    h.lp.run(RunMode::NoWait);
    h.ready.borrow_mut().push(Readiness::Ready(7, Events::READ));
    h.lp.run(RunMode::NoWait);

    assert_eq!(*got.borrow(), vec![Events::READ]);
}

#[test]
fn test_fed_fd_event_masked_by_watcher_interest() {
    let mut h = harness();
    let got = Rc::new(RefCell::new(Vec::new()));

    for mask in [Events::READ, Events::WRITE] {
        let got = got.clone();
        let id = h.lp.io(7, mask, move |_, _, ev| got.borrow_mut().push(ev));
        h.lp.start(id);
    }

    h.lp.run(RunMode::NoWait);
    h.lp.feed_fd_event(7, Events::WRITE);
    h.lp.feed_fd_event(99, Events::READ);
    h.lp.invoke_pending();

    assert_eq!(*got.borrow(), vec![Events::WRITE]);
}

#[test]
fn test_invalid_fd_kills_watchers_with_error() {
    let mut h = harness();
    let got = Rc::new(Cell::new(Events::NONE));
    let got2 = got.clone();

    let w = h.lp.io(7, Events::READ, move |_, _, ev| got2.set(ev));
    h.lp.start(w);
    h.lp.run(RunMode::NoWait);

    h.ready.borrow_mut().push(Readiness::Invalid(7));
    h.lp.run(RunMode::NoWait);

    assert!(got.get().contains(Events::ERROR | Events::READ | Events::WRITE));
    assert!(!h.lp.is_active(w));
    assert_eq!(h.lp.active_count(), 0);
}

#[test]
fn test_rearm_resubmits_watched_fds() {
    let mut h = harness();
    let w = h.lp.io(7, Events::READ, |_, _, _| {});
    h.lp.start(w);
    h.lp.run(RunMode::NoWait);

    h.ready.borrow_mut().push(Readiness::Rearm);
    h.lp.run(RunMode::NoWait);
    h.lp.run(RunMode::NoWait);

    assert_eq!(
        *h.modifies.borrow(),
        vec![
            (7, Events::NONE, Events::READ),
            (7, Events::NONE, Events::READ)
        ]
    );
}

#[test]
fn test_idle_and_check_run_in_same_iteration() {
    let mut h = harness();
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    let i = h.lp.idle(move |_, _, ev| o.borrow_mut().push(ev));
    let o = order.clone();
    let c = h.lp.check(move |_, _, ev| o.borrow_mut().push(ev));
    h.lp.start(i);
    h.lp.start(c);

    h.lp.run(RunMode::NoWait);

    // same priority: the later feed (check) pops first
    assert_eq!(*order.borrow(), vec![Events::CHECK, Events::IDLE]);
}

#[test]
fn test_higher_priority_idle_runs_before_check() {
    let mut h = harness();
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    let i = h.lp.idle(move |_, _, ev| o.borrow_mut().push(ev));
    let o = order.clone();
    let c = h.lp.check(move |_, _, ev| o.borrow_mut().push(ev));
    h.lp.set_priority(i, 1);
    h.lp.start(i);
    h.lp.start(c);

    h.lp.run(RunMode::NoWait);

    assert_eq!(*order.borrow(), vec![Events::IDLE, Events::CHECK]);
}

#[test]
fn test_idle_suppressed_by_higher_priority_pending() {
    let mut h = harness();
    let idle_calls = Rc::new(Cell::new(0));
    let ic = idle_calls.clone();

    let i = h.lp.idle(move |_, _, _| ic.set(ic.get() + 1));
    h.lp.start(i);

    // an expired high priority timer is pending when idle watchers are considered
    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();
    let t = h.lp.timer(0.5, 0.0, move |_, _, _| f.set(true));
    h.lp.set_priority(t, 2);
    h.lp.start(t);
    h.clock.advance(1.0);

    h.lp.run(RunMode::NoWait);
    assert!(fired.get());
    assert_eq!(idle_calls.get(), 0);

    h.lp.run(RunMode::NoWait);
    assert_eq!(idle_calls.get(), 1);
}

#[test]
fn test_prepare_runs_before_check() {
    let mut h = harness();
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    let p = h.lp.prepare(move |_, _, ev| o.borrow_mut().push(ev));
    let o = order.clone();
    let c = h.lp.check(move |_, _, ev| o.borrow_mut().push(ev));
    h.lp.start(p);
    h.lp.start(c);

    h.lp.run(RunMode::NoWait);
    assert_eq!(*order.borrow(), vec![Events::PREPARE, Events::CHECK]);
    assert_eq!(h.lp.iteration(), 1);
}

#[test]
fn test_event_for_running_callback_deferred_until_it_returns() {
    let mut h = harness();
    let calls = Rc::new(Cell::new(0));
    let inside = Rc::new(Cell::new(false));
    let overlapped = Rc::new(Cell::new(false));

    let (c, i, o) = (calls.clone(), inside.clone(), overlapped.clone());
    let w = h.lp.check(move |lp, id, _| {
        if i.get() {
            o.set(true);
        }
        i.set(true);
        c.set(c.get() + 1);

        if c.get() == 1 {
            lp.feed_event(id, Events::CUSTOM);
            lp.run(RunMode::NoWait);
            assert_eq!(c.get(), 1);
        }
        i.set(false);
    });

    h.lp.feed_event(w, Events::CUSTOM);
    h.lp.run(RunMode::NoWait);

    assert_eq!(calls.get(), 2);
    assert!(!overlapped.get());
    assert!(!h.lp.is_pending(w));
    assert_eq!(h.lp.depth(), 0);
}

#[test]
fn test_stop_discards_deferred_event() {
    let mut h = harness();
    let calls = Rc::new(Cell::new(0));

    let c = calls.clone();
    let w = h.lp.check(move |lp, id, _| {
        c.set(c.get() + 1);
        if c.get() == 1 {
            lp.feed_event(id, Events::CUSTOM);
            lp.run(RunMode::NoWait);
            lp.stop(id);
        }
    });
    h.lp.start(w);

    h.lp.feed_event(w, Events::CUSTOM);
    h.lp.run(RunMode::NoWait);

    assert_eq!(calls.get(), 1);
    assert!(!h.lp.is_active(w));
}

#[test]
fn test_break_one_returns_with_active_watchers() {
    let mut h = harness();
    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();

    let t = h.lp.timer(1.0, 1.0, move |lp, _, _| {
        c.set(c.get() + 1);
        if c.get() == 3 {
            lp.break_loop(Break::One);
        }
    });
    h.lp.start(t);

    assert!(h.lp.run(RunMode::Default));
    assert_eq!(calls.get(), 3);
    assert!(h.lp.is_active(t));
}

#[test]
fn test_run_returns_when_nothing_active() {
    let mut h = harness();
    assert!(!h.lp.run(RunMode::Default));
    assert!(!h.lp.run(RunMode::Once));
}

#[test]
fn test_hooks_wrap_blocking_and_dispatch() {
    let mut h = harness();
    let released = Rc::new(Cell::new(0));
    let acquired = Rc::new(Cell::new(0));
    let dispatched = Rc::new(Cell::new(0));

    let (r, a, d) = (released.clone(), acquired.clone(), dispatched.clone());
    h.lp.set_loop_release_cb(
        Some(Box::new(move |_: &mut Loop| r.set(r.get() + 1))),
        Some(Box::new(move |_: &mut Loop| a.set(a.get() + 1))),
    );
    h.lp.set_invoke_pending_cb(Some(Box::new(move |lp: &mut Loop| {
        d.set(d.get() + 1);
        lp.invoke_pending();
    })));

    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();
    let c = h.lp.check(move |_, _, _| f.set(true));
    h.lp.start(c);

    h.lp.run(RunMode::NoWait);

    assert_eq!(released.get(), 1);
    assert_eq!(acquired.get(), 1);
    assert!(dispatched.get() >= 1);
    assert!(fired.get());
}

#[test]
fn test_cleanup_runs_on_drop_without_keeping_loop_alive() {
    let h = harness();
    let mut lp = h.lp;
    let cleaned = Rc::new(Cell::new(false));
    let c = cleaned.clone();

    let w = lp.cleanup(move |_, _, ev| {
        assert_eq!(ev, Events::CLEANUP);
        c.set(true);
    });
    lp.start(w);

    assert_eq!(lp.active_count(), 0);
    assert!(!lp.run(RunMode::Default));

    lp.destroy();
    assert!(cleaned.get());
}

#[test]
fn test_fork_watchers_run_after_loop_fork() {
    let mut h = harness();
    let forked = Rc::new(Cell::new(0));
    let f = forked.clone();

    let w = h.lp.fork_watcher(move |_, _, _| f.set(f.get() + 1));
    h.lp.start(w);

    h.lp.run(RunMode::NoWait);
    assert_eq!(forked.get(), 0);

    h.lp.loop_fork();
    h.lp.run(RunMode::NoWait);
    h.lp.run(RunMode::NoWait);
    assert_eq!(forked.get(), 1);
}

#[test]
fn test_walk_reports_active_watchers_by_kind() {
    let mut h = harness();
    let i = h.lp.idle(|_, _, _| {});
    let t = h.lp.timer(1.0, 0.0, |_, _, _| {});
    let stopped = h.lp.check(|_, _, _| {});
    h.lp.start(i);
    h.lp.start(t);

    let mut found = Vec::new();
    h.lp.walk(Events::ALL_KINDS, |_, kind, id| found.push((kind, id)));
    found.sort_by_key(|(kind, _)| kind.bits());

    assert_eq!(found, vec![(Events::TIMER, t), (Events::IDLE, i)]);
    assert!(!found.iter().any(|&(_, id)| id == stopped));

    let mut timers = 0;
    h.lp.walk(Events::TIMER, |_, _, _| timers += 1);
    assert_eq!(timers, 1);
}

#[test]
fn test_destroyed_handle_stops_resolving() {
    let mut h = harness();
    let t = h.lp.timer(1.0, 0.0, |_, _, _| {});
    h.lp.start(t);
    h.lp.destroy_watcher(t);

    assert!(!h.lp.is_active(t));
    assert_eq!(h.lp.active_count(), 0);

    let other = h.lp.timer(1.0, 0.0, |_, _, _| {});
    assert_ne!(other, t);
    h.lp.start(other);
    assert!(!h.lp.is_active(t));
    h.lp.verify();
}

#[derive(Clone, Copy, Debug)]
enum Op {
    Start(usize),
    Stop(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..6usize).prop_map(Op::Start),
        (0..6usize).prop_map(Op::Stop),
    ]
}

proptest! {
    #[test]
    fn prop_active_count_matches_started_watchers(ops in prop::collection::vec(op(), 1..100)) {
        let mut h = harness();
        let ids = [
            h.lp.idle(|_, _, _| {}),
            h.lp.prepare(|_, _, _| {}),
            h.lp.check(|_, _, _| {}),
            h.lp.timer(5.0, 1.0, |_, _, _| {}),
            h.lp.periodic(0.0, 60.0, None, |_, _, _| {}),
            h.lp.io(9, Events::READ, |_, _, _| {}),
        ];
        let mut model = HashSet::new();

        for op in ops {
            match op {
                Op::Start(k) => {
                    h.lp.start(ids[k]);
                    model.insert(k);
                }
                Op::Stop(k) => {
                    h.lp.stop(ids[k]);
                    model.remove(&k);
                }
            }

            prop_assert_eq!(h.lp.active_count(), model.len() as isize);
            h.lp.verify();
        }

        for k in 0..ids.len() {
            prop_assert_eq!(h.lp.is_active(ids[k]), model.contains(&k));
        }
    }
}
