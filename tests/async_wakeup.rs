use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use evloop::{Events, LoopBuilder, RunMode};

#[test]
fn test_send_from_other_thread_wakes_loop() {
    let mut lp = LoopBuilder::new().no_env().build().unwrap();
    let got = Rc::new(Cell::new(Events::NONE));
    let g = got.clone();

    let w = lp.async_watcher(move |lp, id, ev| {
        g.set(ev);
        lp.stop(id);
    });
    lp.start(w);
    // the internal wakeup watcher does not count
    assert_eq!(lp.active_count(), 1);

    let sender = lp.async_sender(w).unwrap();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        sender.send();
    });

    assert!(!lp.run(RunMode::Default));
    assert_eq!(got.get(), Events::ASYNC);
    assert!(!lp.async_pending(w));

    handle.join().unwrap();
}

#[test]
fn test_repeated_sends_merge() {
    let mut lp = LoopBuilder::new().no_env().build().unwrap();
    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();

    let w = lp.async_watcher(move |_, _, _| c.set(c.get() + 1));
    lp.start(w);

    let sender = lp.async_sender(w).unwrap();
    sender.send();
    sender.send();
    sender.send();
    assert!(lp.async_pending(w));

    lp.run(RunMode::NoWait);
    assert_eq!(calls.get(), 1);
    assert!(!sender.is_pending());
}

#[test]
fn test_sender_only_for_async_watchers() {
    let mut lp = LoopBuilder::new().no_env().build().unwrap();
    let w = lp.idle(|_, _, _| {});
    assert!(lp.async_sender(w).is_none());
}

#[test]
fn test_send_from_own_callback_survives_nested_run() {
    let mut lp = LoopBuilder::new().no_env().build().unwrap();
    let calls = Rc::new(Cell::new(0));
    let sender = Rc::new(Cell::new(None::<evloop::AsyncSender>));

    let (c, s) = (calls.clone(), sender.clone());
    let w = lp.async_watcher(move |lp, _, _| {
        c.set(c.get() + 1);
        if c.get() == 1 {
            if let Some(tx) = s.take() {
                tx.send();
            }
            lp.run(RunMode::NoWait);
        }
    });
    lp.start(w);
    sender.set(lp.async_sender(w));

    lp.async_sender(w).unwrap().send();
    for _ in 0..3 {
        lp.run(RunMode::NoWait);
    }

    assert_eq!(calls.get(), 2);
    assert!(!lp.async_pending(w));
}
