mod common;

use std::cell::Cell;
use std::rc::Rc;

use evloop::{Backends, Events, LoopBuilder, RunMode};

use common::{close, pipe};

#[test]
fn test_closed_fd_gets_error_event() {
    for backend in [Backends::POLL, Backends::SELECT] {
        let mut lp = LoopBuilder::new().no_env().backends(backend).build().unwrap();
        let got = Rc::new(Cell::new(Events::NONE));
        let g = got.clone();

        let (rfd, wfd) = pipe();
        let w = lp.io(rfd, Events::READ, move |_, _, ev| g.set(ev));
        lp.start(w);
        lp.run(RunMode::NoWait);

        close(rfd);
        close(wfd);
        lp.run(RunMode::NoWait);

        assert!(got.get().contains(Events::ERROR), "{backend:?}: {:?}", got.get());
        assert!(!lp.is_active(w), "{backend:?}");
        assert_eq!(lp.active_count(), 0);
    }
}
