use super::{Backend, Backends, Readiness, last_error};
use crate::reactor::Timestamp;
use crate::reactor::event::Events;

use libc::{
    EV_ADD, EV_DELETE, EV_ENABLE, EV_ERROR, EVFILT_READ, EVFILT_WRITE, FD_CLOEXEC, F_SETFD,
    NOTE_EOF, close, fcntl, kevent, kqueue, timespec,
};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

const INITIAL_EVENTS: usize = 64;

fn change(ident: RawFd, filter: i16, flags: u16, fflags: u32) -> kevent {
    let mut ev: kevent = unsafe { std::mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev.udata = ptr::null_mut();
    ev
}

fn create() -> io::Result<RawFd> {
    let kq = unsafe { kqueue() };
    if kq < 0 {
        return Err(last_error());
    }

    unsafe { fcntl(kq, F_SETFD, FD_CLOEXEC) };

    Ok(kq)
}

/// BSD/macOS `kqueue(2)` backend.
///
/// Interest changes are batched and submitted with the next `kevent` wait.
pub(crate) struct KqueueBackend {
    kqueue: RawFd,
    changes: Vec<kevent>,
    events: Vec<kevent>,
    /// Mask the loop last asked for, per fd.
    want: Vec<Events>,
}

impl KqueueBackend {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            kqueue: create()?,
            changes: Vec::new(),
            events: Vec::with_capacity(INITIAL_EVENTS),
            want: Vec::new(),
        })
    }

    fn queue(&mut self, fd: RawFd, old: Events, new: Events) {
        if old != new {
            if old.contains(Events::READ) {
                self.changes.push(change(fd, EVFILT_READ, EV_DELETE, 0));
            }
            if old.contains(Events::WRITE) {
                self.changes.push(change(fd, EVFILT_WRITE, EV_DELETE, 0));
            }
        }

        // re-add even when unchanged so a close/reopen is noticed
        if new.contains(Events::READ) {
            self.changes
                .push(change(fd, EVFILT_READ, EV_ADD | EV_ENABLE, NOTE_EOF));
        }
        if new.contains(Events::WRITE) {
            self.changes
                .push(change(fd, EVFILT_WRITE, EV_ADD | EV_ENABLE, NOTE_EOF));
        }
    }

    fn wanted(&self, fd: RawFd) -> Events {
        self.want.get(fd as usize).copied().unwrap_or_default()
    }
}

impl Backend for KqueueBackend {
    fn kind(&self) -> Backends {
        Backends::KQUEUE
    }

    fn modify(&mut self, fd: RawFd, old: Events, new: Events) -> io::Result<()> {
        let slot = fd as usize;
        if self.want.len() <= slot {
            self.want.resize(slot + 1, Events::NONE);
        }
        self.want[slot] = new;

        self.queue(fd, old, new);

        Ok(())
    }

    fn poll(&mut self, timeout: Timestamp, out: &mut Vec<Readiness>) -> io::Result<()> {
        // errors for submitted changes come back as events
        let capacity = self.changes.len().max(INITIAL_EVENTS).max(self.events.capacity());
        self.events.clear();
        self.events.reserve(capacity);

        let secs = timeout.trunc();
        let ts = timespec {
            tv_sec: secs as libc::time_t,
            tv_nsec: ((timeout - secs) * 1e9) as _,
        };

        let res = unsafe {
            kevent(
                self.kqueue,
                self.changes.as_ptr(),
                self.changes.len() as i32,
                self.events.as_mut_ptr(),
                capacity as i32,
                &ts,
            )
        };
        self.changes.clear();

        if res < 0 {
            return Err(last_error());
        }

        unsafe { self.events.set_len(res as usize) };

        for i in 0..res as usize {
            let ev = self.events[i];
            let fd = ev.ident as RawFd;

            if ev.flags & EV_ERROR != 0 {
                let want = self.wanted(fd);
                if want.is_empty() {
                    continue;
                }

                match ev.data as i32 {
                    libc::ENOENT => self.queue(fd, Events::NONE, want),
                    libc::EBADF if unsafe { fcntl(fd, libc::F_GETFD) } != -1 => {
                        self.queue(fd, Events::NONE, want)
                    }
                    _ => out.push(Readiness::Invalid(fd)),
                }
                continue;
            }

            let events = match ev.filter {
                EVFILT_READ => Events::READ,
                EVFILT_WRITE => Events::WRITE,
                _ => Events::NONE,
            };
            out.push(Readiness::Ready(fd, events));
        }

        if res as usize == capacity {
            self.events.reserve(capacity);
        }

        Ok(())
    }

    fn mintime(&self) -> Timestamp {
        1e-9
    }

    fn backend_fd(&self) -> Option<RawFd> {
        Some(self.kqueue)
    }

    fn fork(&mut self) -> io::Result<()> {
        // kqueue fds are not inherited across fork
        let kq = create()?;
        unsafe { close(self.kqueue) };
        self.kqueue = kq;
        self.changes.clear();

        Ok(())
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe { close(self.kqueue) };
    }
}
