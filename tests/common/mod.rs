#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use evloop::{Backend, Backends, Events, Loop, LoopBuilder, ManualClock, Readiness, Timestamp};

/// One `modify` call seen by the mock.
pub type Modify = (RawFd, Events, Events);

/// Backend that records interest changes and "blocks" by advancing a
/// manual clock.
pub struct MockBackend {
    clock: ManualClock,
    pub modifies: Rc<RefCell<Vec<Modify>>>,
    pub ready: Rc<RefCell<Vec<Readiness>>>,
}

impl MockBackend {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            modifies: Rc::default(),
            ready: Rc::default(),
        }
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> Backends {
        Backends::empty()
    }

    fn modify(&mut self, fd: RawFd, old: Events, new: Events) -> io::Result<()> {
        self.modifies.borrow_mut().push((fd, old, new));
        Ok(())
    }

    fn poll(&mut self, timeout: Timestamp, out: &mut Vec<Readiness>) -> io::Result<()> {
        let mut ready = self.ready.borrow_mut();

        if ready.is_empty() {
            if timeout > 0.0 {
                // land just past the deadline the loop asked for
                self.clock.advance(timeout + 1e-6);
            }
        } else {
            out.append(&mut ready);
        }

        Ok(())
    }
}

pub struct Harness {
    pub lp: Loop,
    pub clock: ManualClock,
    pub modifies: Rc<RefCell<Vec<Modify>>>,
    pub ready: Rc<RefCell<Vec<Readiness>>>,
}

pub fn harness_with(clock: ManualClock) -> Harness {
    let backend = MockBackend::new(clock.clone());
    let modifies = backend.modifies.clone();
    let ready = backend.ready.clone();

    let lp = LoopBuilder::new()
        .no_env()
        .backend(backend)
        .clock(clock.clone())
        .build()
        .unwrap();

    Harness {
        lp,
        clock,
        modifies,
        ready,
    }
}

pub fn harness() -> Harness {
    harness_with(ManualClock::new(1000.0))
}

/// Creates a pipe, returning `(read, write)`.
pub fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe() failed");
    (fds[0], fds[1])
}

pub fn write_byte(fd: RawFd) {
    let buf = [1u8; 1];
    let wrote = unsafe { libc::write(fd, buf.as_ptr() as *const _, 1) };
    assert_eq!(wrote, 1);
}

pub fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

pub fn approx(a: Timestamp, b: Timestamp) -> bool {
    (a - b).abs() < 1e-6
}
