use super::{Backend, Backends, Readiness, last_error, readiness_events, timeout_ms};
use crate::reactor::Timestamp;
use crate::reactor::event::Events;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, close, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::unix::io::RawFd;

const INITIAL_EVENTS: usize = 64;

#[derive(Clone, Copy, Default)]
struct FdState {
    /// Mask the loop last asked for.
    want: Events,
    /// Mask the kernel currently has.
    emask: Events,
    /// Bumped on every registration; stale events carry an older value.
    egen: u32,
}

/// Linux `epoll(7)` backend.
///
/// Removals are lazy: when the loop drops all interest in an fd the kernel
/// registration is left alone and cleaned up when it next reports an event.
/// Each registration stores a generation counter next to the fd so events
/// queued for a previous incarnation of a reused fd are recognised.
pub(crate) struct EpollBackend {
    epfd: RawFd,
    events: Vec<epoll_event>,
    fds: Vec<FdState>,
}

fn epoll_mask(events: Events) -> u32 {
    let mut mask = 0;
    if events.contains(Events::READ) {
        mask |= EPOLLIN as u32;
    }
    if events.contains(Events::WRITE) {
        mask |= EPOLLOUT as u32;
    }
    mask
}

fn create() -> io::Result<RawFd> {
    let epfd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
    if epfd < 0 {
        return Err(last_error());
    }

    Ok(epfd)
}

impl EpollBackend {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            epfd: create()?,
            events: vec![epoll_event { events: 0, u64: 0 }; INITIAL_EVENTS],
            fds: Vec::new(),
        })
    }

    fn state(&mut self, fd: RawFd) -> &mut FdState {
        let slot = fd as usize;
        if self.fds.len() <= slot {
            self.fds.resize(slot + 1, FdState::default());
        }

        &mut self.fds[slot]
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, ev: &mut epoll_event) -> io::Result<()> {
        if unsafe { epoll_ctl(self.epfd, op, fd, ev) } < 0 {
            return Err(last_error());
        }

        Ok(())
    }
}

impl Backend for EpollBackend {
    fn kind(&self) -> Backends {
        Backends::EPOLL
    }

    fn modify(&mut self, fd: RawFd, old: Events, new: Events) -> io::Result<()> {
        let state = self.state(fd);
        state.want = new;

        if new.is_empty() {
            return Ok(());
        }

        let oldmask = state.emask;
        state.emask = new;
        state.egen = state.egen.wrapping_add(1);
        let egen = state.egen;

        let mut ev = epoll_event {
            events: epoll_mask(new),
            u64: fd as u32 as u64 | (egen as u64) << 32,
        };

        let op = if !old.is_empty() && oldmask != new {
            EPOLL_CTL_MOD
        } else {
            EPOLL_CTL_ADD
        };

        let res = match self.ctl(op, fd, &mut ev) {
            Ok(()) => return Ok(()),
            // the fd was closed and reopened behind our back
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(EPOLL_CTL_ADD, fd, &mut ev)
            }
            // a lazily skipped removal left the old registration in place
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                if oldmask == new {
                    self.state(fd).egen = egen.wrapping_sub(1);
                    return Ok(());
                }
                self.ctl(EPOLL_CTL_MOD, fd, &mut ev)
            }
            Err(err) => Err(err),
        };

        if res.is_err() {
            self.state(fd).egen = egen.wrapping_sub(1);
        }

        res
    }

    fn poll(&mut self, timeout: Timestamp, out: &mut Vec<Readiness>) -> io::Result<()> {
        let n = unsafe {
            epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };

        if n < 0 {
            return Err(last_error());
        }

        for i in 0..n as usize {
            let ev = self.events[i];
            let data = ev.u64;
            let fd = data as u32 as RawFd;
            let flags = ev.events;

            let failed = flags & (EPOLLERR | EPOLLHUP) as u32 != 0;
            let got = readiness_events(
                failed || flags & EPOLLIN as u32 != 0,
                failed || flags & EPOLLOUT as u32 != 0,
            );

            let state = *self.state(fd);
            if state.egen != (data >> 32) as u32 {
                out.push(Readiness::Rearm);
                continue;
            }

            if !(got & !state.want).is_empty() {
                // the kernel reports more than we want: narrow it or drop it
                self.state(fd).emask = state.want;
                let mut narrowed = epoll_event {
                    events: epoll_mask(state.want),
                    u64: data,
                };
                let op = if state.want.is_empty() {
                    EPOLL_CTL_DEL
                } else {
                    EPOLL_CTL_MOD
                };

                if self.ctl(op, fd, &mut narrowed).is_err() {
                    out.push(Readiness::Rearm);
                    continue;
                }
            }

            out.push(Readiness::Ready(fd, got));
        }

        if n as usize == self.events.len() {
            let len = self.events.len() * 2;
            self.events.resize(len, epoll_event { events: 0, u64: 0 });
        }

        Ok(())
    }

    fn mintime(&self) -> Timestamp {
        1e-3
    }

    fn backend_fd(&self) -> Option<RawFd> {
        Some(self.epfd)
    }

    fn fork(&mut self) -> io::Result<()> {
        let epfd = create()?;
        unsafe { close(self.epfd) };
        self.epfd = epfd;

        for state in &mut self.fds {
            state.emask = Events::NONE;
        }

        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe { close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_ready_and_narrowing() {
        let (r, w) = pipe();
        let mut backend = EpollBackend::new().unwrap();

        backend.modify(w, Events::NONE, Events::WRITE).unwrap();
        let mut out = Vec::new();
        backend.poll(0.0, &mut out).unwrap();
        assert_eq!(out, vec![Readiness::Ready(w, Events::WRITE)]);

        // interest dropped lazily: the next event narrows and is still passed on
        backend.modify(w, Events::WRITE, Events::NONE).unwrap();
        out.clear();
        backend.poll(0.0, &mut out).unwrap();
        assert_eq!(out, vec![Readiness::Ready(w, Events::WRITE)]);

        // the registration is gone now
        out.clear();
        backend.poll(0.0, &mut out).unwrap();
        assert!(out.is_empty());

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_backend_fd_exposed() {
        let backend = EpollBackend::new().unwrap();
        assert!(backend.backend_fd().is_some_and(|fd| fd >= 0));
    }
}
