mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use evloop::{Events, ManualClock, RescheduleFn, RunMode};

use common::{approx, harness, harness_with};

#[test]
fn test_repeating_timer_catches_up_one_interval_per_expiry() {
    let mut h = harness_with(ManualClock::new(0.0));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();

    let t = h.lp.timer(1.0, 1.0, move |lp, id, ev| {
        s.borrow_mut().push((ev, lp.timer_expirations(id)));
    });
    h.lp.start(t);

    h.clock.advance(3.4);
    h.lp.run(RunMode::NoWait);

    assert_eq!(*seen.borrow(), vec![(Events::TIMER, 3)]);
    assert_eq!(h.lp.timer_expirations(t), 0);
    assert!(approx(h.lp.timer_remaining(t), 0.6));
    assert!(h.lp.is_active(t));
}

#[test]
fn test_one_shot_timer_blocks_until_due_then_stops() {
    let mut h = harness();
    let fired_at = Rc::new(Cell::new(0.0));
    let f = fired_at.clone();

    let t = h.lp.timer(2.0, 0.0, move |lp, _, _| f.set(lp.now()));
    h.lp.start(t);

    assert!(!h.lp.run(RunMode::Default));
    assert!(!h.lp.is_active(t));
    assert!(fired_at.get() >= 1002.0);
    assert!(h.lp.timer_remaining(t) <= 0.0);
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let mut h = harness();
    let order = Rc::new(RefCell::new(Vec::new()));

    for after in [3.0, 1.0, 2.0] {
        let o = order.clone();
        let t = h.lp.timer(after, 0.0, move |_, _, _| o.borrow_mut().push(after));
        h.lp.start(t);
    }

    h.clock.advance(5.0);
    h.lp.run(RunMode::NoWait);

    assert_eq!(*order.borrow(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_backward_wall_jump_without_monotonic_shifts_timers() {
    let clock = ManualClock::new(1000.0);
    clock.disable_monotonic();
    let mut h = harness_with(clock);

    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();
    let t = h.lp.timer(10.0, 0.0, move |_, _, _| f.set(true));
    h.lp.start(t);

    h.clock.jump_wall(-600.0);
    h.lp.run(RunMode::NoWait);

    assert!(!fired.get());
    assert!(approx(h.lp.now(), 400.0));
    assert!(approx(h.lp.timer_remaining(t), 10.0));
    h.lp.verify();
}

#[test]
fn test_backward_wall_jump_without_monotonic_recomputes_periodics() {
    let clock = ManualClock::new(1000.0);
    clock.disable_monotonic();
    let mut h = harness_with(clock);

    let fired = Rc::new(Cell::new(0));
    let rescheduled = Rc::new(Cell::new(0));

    let f = fired.clone();
    let every = h.lp.periodic(0.0, 10.0, None, move |_, _, _| f.set(f.get() + 1));

    let r = rescheduled.clone();
    let next: RescheduleFn = Rc::new(move |now| {
        r.set(r.get() + 1);
        now + 7.0
    });
    let f = fired.clone();
    let custom = h.lp.periodic(0.0, 0.0, Some(next), move |_, _, _| f.set(f.get() + 1));

    h.lp.start(every);
    h.lp.start(custom);
    assert!(approx(h.lp.periodic_at(every), 1010.0));
    assert!(approx(h.lp.periodic_at(custom), 1007.0));

    h.clock.jump_wall(-600.0);
    h.lp.run(RunMode::NoWait);

    assert_eq!(fired.get(), 0);
    assert!(approx(h.lp.now(), 400.0));
    assert!(approx(h.lp.periodic_at(every), 410.0));
    assert!(approx(h.lp.periodic_at(custom), 407.0));
    assert_eq!(rescheduled.get(), 2);
    h.lp.verify();
}

#[test]
fn test_wall_jump_reschedules_periodics() {
    let mut h = harness();
    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();

    let p = h.lp.periodic(0.0, 3600.0, None, move |_, _, _| f.set(true));
    h.lp.start(p);
    assert!(approx(h.lp.periodic_at(p), 3600.0));

    h.clock.advance(1.0);
    h.clock.jump_wall(7200.0);
    h.lp.run(RunMode::NoWait);

    assert!(!fired.get());
    assert!(approx(h.lp.periodic_at(p), 10800.0));
}

#[test]
fn test_periodic_fires_on_interval_boundary() {
    let mut h = harness();
    let fired = Rc::new(Cell::new(0));
    let f = fired.clone();

    let p = h.lp.periodic(0.0, 10.0, None, move |_, _, ev| {
        assert_eq!(ev, Events::PERIODIC);
        f.set(f.get() + 1);
    });
    h.lp.start(p);
    assert!(approx(h.lp.periodic_at(p), 1010.0));

    h.lp.run(RunMode::Once);

    assert_eq!(fired.get(), 1);
    assert!(approx(h.lp.periodic_at(p), 1020.0));
}

#[test]
fn test_absolute_periodic_fires_once() {
    let mut h = harness();
    let fired = Rc::new(Cell::new(0));
    let f = fired.clone();

    let p = h.lp.periodic(1005.0, 0.0, None, move |_, _, _| f.set(f.get() + 1));
    h.lp.start(p);

    assert!(!h.lp.run(RunMode::Default));
    assert_eq!(fired.get(), 1);
    assert!(!h.lp.is_active(p));
}

#[test]
fn test_periodic_reschedule_fn_decides_deadline() {
    let mut h = harness();
    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();

    let next: RescheduleFn = Rc::new(move |now| {
        c.set(c.get() + 1);
        now + 7.0
    });
    let p = h.lp.periodic(0.0, 0.0, Some(next), |_, _, _| {});
    h.lp.start(p);

    assert_eq!(calls.get(), 1);
    assert!(approx(h.lp.periodic_at(p), 1007.0));
}

#[test]
fn test_timer_again_restarts_inactivity_timeout() {
    let mut h = harness();
    let t = h.lp.timer(0.0, 5.0, |_, _, _| {});

    // inactive with a repeat: starts it
    h.lp.timer_again(t);
    assert!(h.lp.is_active(t));
    assert!(approx(h.lp.timer_remaining(t), 5.0));

    h.clock.advance(3.0);
    h.lp.now_update();
    h.lp.timer_again(t);
    assert!(approx(h.lp.timer_remaining(t), 5.0));

    h.lp.set_timer_repeat(t, 0.0);
    h.lp.timer_again(t);
    assert!(!h.lp.is_active(t));
    h.lp.verify();
}

#[test]
fn test_resume_shifts_timers_by_suspended_time() {
    let mut h = harness();
    let t = h.lp.timer(10.0, 0.0, |_, _, _| {});
    h.lp.start(t);

    h.lp.suspend();
    h.clock.advance(100.0);
    h.lp.resume();

    assert!(approx(h.lp.timer_remaining(t), 10.0));
}

#[test]
fn test_stopped_timer_keeps_relative_delay() {
    let mut h = harness();
    let t = h.lp.timer(4.0, 0.0, |_, _, _| {});
    assert!(approx(h.lp.timer_remaining(t), 4.0));

    h.lp.start(t);
    h.clock.advance(1.0);
    h.lp.now_update();
    assert!(approx(h.lp.timer_remaining(t), 3.0));

    h.lp.stop(t);
    assert!(approx(h.lp.timer_remaining(t), 3.0));
}

#[test]
fn test_periodic_again_recomputes_deadline() {
    let mut h = harness();
    let delay = Rc::new(Cell::new(7.0));
    let d = delay.clone();

    let next: RescheduleFn = Rc::new(move |now| now + d.get());
    let p = h.lp.periodic(0.0, 0.0, Some(next), |_, _, _| {});
    h.lp.start(p);
    assert!(approx(h.lp.periodic_at(p), 1007.0));

    delay.set(20.0);
    h.lp.periodic_again(p);

    assert!(h.lp.is_active(p));
    assert!(approx(h.lp.periodic_at(p), 1020.0));
}

#[test]
fn test_repeat_below_clock_resolution_does_not_spin() {
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let clock = ManualClock::new(1.7e9);
        clock.disable_monotonic();
        let mut h = harness_with(clock);

        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        let t = h.lp.timer(0.0, 1e-7, move |lp, id, _| {
            assert_eq!(lp.timer_expirations(id), 1);
            f.set(f.get() + 1);
        });
        h.lp.start(t);

        h.clock.advance(0.5);
        let alive = h.lp.run(RunMode::NoWait);
        let _ = tx.send((alive, fired.get(), h.lp.timer_remaining(t)));
    });

    let (alive, fired, remaining) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("run did not return");
    assert!(alive);
    assert_eq!(fired, 1);
    assert!(remaining <= 0.0);
}

#[test]
fn test_far_behind_timer_snaps_to_now() {
    let mut h = harness_with(ManualClock::new(0.0));
    let seen = Rc::new(Cell::new(0));
    let s = seen.clone();

    let t = h.lp.timer(0.001, 0.001, move |lp, id, _| s.set(lp.timer_expirations(id)));
    h.lp.start(t);

    h.clock.advance(100.0);
    h.lp.run(RunMode::NoWait);

    assert_eq!(seen.get(), 1 << 16);
    assert!(approx(h.lp.timer_remaining(t), 0.0));
    h.lp.verify();
}
