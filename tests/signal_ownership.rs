use std::cell::Cell;
use std::rc::Rc;

use evloop::{Error, LoopBuilder, RunMode, feed_signal};

#[test]
fn test_signal_belongs_to_one_loop_at_a_time() {
    let mut first = LoopBuilder::new().no_env().build().unwrap();
    let mut second = LoopBuilder::new().no_env().build().unwrap();

    assert!(matches!(
        first.signal(0, |_, _, _| {}),
        Err(Error::InvalidSignal(0))
    ));

    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();
    let w = first
        .signal(libc::SIGUSR2, move |_, _, _| c.set(c.get() + 1))
        .unwrap();
    first.start(w);

    assert!(matches!(
        second.signal(libc::SIGUSR2, |_, _, _| {}),
        Err(Error::SignalInUse(_))
    ));

    // delivered to the owning loop only
    feed_signal(libc::SIGUSR2);
    second.run(RunMode::NoWait);
    assert_eq!(calls.get(), 0);
    first.run(RunMode::NoWait);
    assert_eq!(calls.get(), 1);

    first.stop(w);
    let other = second.signal(libc::SIGUSR2, |_, _, _| {}).unwrap();
    second.start(other);
    assert!(second.is_active(other));
    second.stop(other);
}
