use super::{Backend, Backends, Readiness, last_error, readiness_events};
use crate::reactor::Timestamp;
use crate::reactor::event::Events;

use libc::{FD_CLR, FD_ISSET, FD_SET, FD_SETSIZE, FD_ZERO, fd_set, select, timeval};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// `select(2)` backend. Limited to fds below `FD_SETSIZE`.
pub(crate) struct SelectBackend {
    read: fd_set,
    write: fd_set,
    /// One past the highest fd ever registered.
    max: RawFd,
}

impl SelectBackend {
    pub(crate) fn new() -> Self {
        let mut read: fd_set = unsafe { mem::zeroed() };
        let mut write: fd_set = unsafe { mem::zeroed() };

        unsafe {
            FD_ZERO(&mut read);
            FD_ZERO(&mut write);
        }

        Self {
            read,
            write,
            max: 0,
        }
    }
}

impl Backend for SelectBackend {
    fn kind(&self) -> Backends {
        Backends::SELECT
    }

    fn modify(&mut self, fd: RawFd, old: Events, new: Events) -> io::Result<()> {
        if fd < 0 || fd as usize >= FD_SETSIZE as usize {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        if old == new {
            return Ok(());
        }

        unsafe {
            if new.contains(Events::READ) {
                FD_SET(fd, &mut self.read);
            } else {
                FD_CLR(fd, &mut self.read);
            }

            if new.contains(Events::WRITE) {
                FD_SET(fd, &mut self.write);
            } else {
                FD_CLR(fd, &mut self.write);
            }
        }

        self.max = self.max.max(fd + 1);

        Ok(())
    }

    fn poll(&mut self, timeout: Timestamp, out: &mut Vec<Readiness>) -> io::Result<()> {
        let mut read = self.read;
        let mut write = self.write;

        let secs = timeout.trunc();
        let mut tv = timeval {
            tv_sec: secs as libc::time_t,
            tv_usec: ((timeout - secs) * 1e6) as libc::suseconds_t,
        };

        let res = unsafe { select(self.max, &mut read, &mut write, ptr::null_mut(), &mut tv) };
        if res < 0 {
            return Err(last_error());
        }

        let mut left = res;
        for fd in 0..self.max {
            if left == 0 {
                break;
            }

            let (readable, writable) = unsafe { (FD_ISSET(fd, &read), FD_ISSET(fd, &write)) };
            let events = readiness_events(readable, writable);
            if !events.is_empty() {
                left -= readable as i32 + writable as i32;
                out.push(Readiness::Ready(fd, events));
            }
        }

        Ok(())
    }

    fn mintime(&self) -> Timestamp {
        1e-6
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
    fn test_reports_readable_pipe() {
        let (r, w) = pipe();
        let mut backend = SelectBackend::new();
        backend.modify(r, Events::NONE, Events::READ).unwrap();

        let mut out = Vec::new();
        backend.poll(0.0, &mut out).unwrap();
        assert!(out.is_empty());

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        backend.poll(1.0, &mut out).unwrap();
        assert_eq!(out, vec![Readiness::Ready(r, Events::READ)]);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_rejects_fd_beyond_setsize() {
        let mut backend = SelectBackend::new();
        let fd = FD_SETSIZE as RawFd;
        assert!(backend.modify(fd, Events::NONE, Events::READ).is_err());
    }
}
