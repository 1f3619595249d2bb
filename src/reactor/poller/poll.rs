use super::{Backend, Backends, Readiness, last_error, readiness_events, timeout_ms};
use crate::reactor::Timestamp;
use crate::reactor::event::Events;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, pollfd};
use std::io;
use std::os::unix::io::RawFd;

/// `poll(2)` backend over a dense `pollfd` array.
pub(crate) struct PollBackend {
    polls: Vec<pollfd>,
    /// fd -> index into `polls`, or `None` when not registered.
    index: Vec<Option<usize>>,
}

impl PollBackend {
    pub(crate) fn new() -> Self {
        Self {
            polls: Vec::new(),
            index: Vec::new(),
        }
    }
}

fn poll_mask(events: Events) -> libc::c_short {
    let mut mask = 0;
    if events.contains(Events::READ) {
        mask |= POLLIN;
    }
    if events.contains(Events::WRITE) {
        mask |= POLLOUT;
    }
    mask
}

impl Backend for PollBackend {
    fn kind(&self) -> Backends {
        Backends::POLL
    }

    fn modify(&mut self, fd: RawFd, old: Events, new: Events) -> io::Result<()> {
        if old == new {
            return Ok(());
        }

        let slot = fd as usize;
        if self.index.len() <= slot {
            self.index.resize(slot + 1, None);
        }

        let idx = match self.index[slot] {
            Some(idx) => idx,
            None => {
                self.polls.push(pollfd {
                    fd,
                    events: 0,
                    revents: 0,
                });
                let idx = self.polls.len() - 1;
                self.index[slot] = Some(idx);
                idx
            }
        };

        if !new.is_empty() {
            self.polls[idx].events = poll_mask(new);
            return Ok(());
        }

        self.index[slot] = None;
        self.polls.swap_remove(idx);
        if let Some(moved) = self.polls.get(idx) {
            self.index[moved.fd as usize] = Some(idx);
        }

        Ok(())
    }

    fn poll(&mut self, timeout: Timestamp, out: &mut Vec<Readiness>) -> io::Result<()> {
        let res = unsafe {
            libc::poll(
                self.polls.as_mut_ptr(),
                self.polls.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };

        if res < 0 {
            return Err(last_error());
        }

        let mut left = res;
        for p in &self.polls {
            if left == 0 {
                break;
            }
            if p.revents == 0 {
                continue;
            }

            left -= 1;
            if p.revents & POLLNVAL != 0 {
                out.push(Readiness::Invalid(p.fd));
                continue;
            }

            let failed = p.revents & (POLLERR | POLLHUP) != 0;
            out.push(Readiness::Ready(
                p.fd,
                readiness_events(
                    failed || p.revents & POLLIN != 0,
                    failed || p.revents & POLLOUT != 0,
                ),
            ));
        }

        Ok(())
    }

    fn mintime(&self) -> Timestamp {
        1e-3
    }
}
