mod common;

use std::cell::Cell;
use std::rc::Rc;

use evloop::{Events, LoopBuilder, RunMode};

use common::{close, pipe, write_byte};

#[test]
fn test_once_times_out() {
    let mut lp = LoopBuilder::new().no_env().build().unwrap();
    let got = Rc::new(Cell::new(Events::NONE));
    let g = got.clone();

    let (rfd, wfd) = pipe();
    lp.once(Some(rfd), Events::READ, Some(0.02), move |_, ev| g.set(ev));

    assert!(!lp.run(RunMode::Default));
    assert_eq!(got.get(), Events::TIMER);
    assert_eq!(lp.active_count(), 0);

    close(rfd);
    close(wfd);
}

#[test]
fn test_once_fd_ready_cancels_timeout() {
    let mut lp = LoopBuilder::new().no_env().build().unwrap();
    let calls = Rc::new(Cell::new(0));
    let got = Rc::new(Cell::new(Events::NONE));
    let (c, g) = (calls.clone(), got.clone());

    let (rfd, wfd) = pipe();
    write_byte(wfd);
    lp.once(Some(rfd), Events::READ, Some(10.0), move |_, ev| {
        c.set(c.get() + 1);
        g.set(ev);
    });

    assert!(!lp.run(RunMode::Default));
    assert_eq!(calls.get(), 1);
    assert_eq!(got.get(), Events::READ);

    close(rfd);
    close(wfd);
}

#[test]
fn test_once_without_fd() {
    let mut lp = LoopBuilder::new().no_env().build().unwrap();
    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();

    lp.once(None, Events::NONE, Some(0.0), move |_, ev| {
        assert!(ev.contains(Events::TIMER));
        f.set(true);
    });

    lp.run(RunMode::Default);
    assert!(fired.get());
}
