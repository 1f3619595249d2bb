//! Child process status watchers.
//!
//! Only the default loop reaps children. It keeps a hidden `SIGCHLD` watcher
//! whose callback collects one status per invocation with `waitpid` and
//! refeeds itself until nothing is left to reap.

use crate::error::{Error, Result};
use crate::reactor::core::Loop;
use crate::reactor::event::Events;
use crate::reactor::watcher::{Kind, MAXPRI, Role, WatcherId};
use crate::trace::trace;

use libc::pid_t;

pub(crate) const PID_HASHSIZE: usize = 16;

fn bucket(pid: pid_t) -> usize {
    pid as usize & (PID_HASHSIZE - 1)
}

fn reap_one() -> Option<(pid_t, i32)> {
    let mut status = 0;
    let mut pid = unsafe {
        libc::waitpid(-1, &mut status, libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED)
    };

    if pid < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINVAL) {
        // no support for WCONTINUED
        pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG | libc::WUNTRACED) };
    }

    (pid > 0).then_some((pid, status))
}

impl Loop {
    /// Child watcher for `pid` (0 for any child). With `trace`, stopped and
    /// continued children are reported too, not only terminated ones.
    ///
    /// # Errors
    /// [`Error::NotDefaultLoop`] unless called on the default loop.
    ///
    /// # Example
    /// ```ignore
    /// let c = lp.child(pid, false, |lp, id, _| {
    ///     let (pid, status) = lp.child_status(id).unwrap();
    ///     println!("{pid} exited with {status}");
    /// })?;
    /// lp.start(c);
    /// ```
    pub fn child<F>(&mut self, pid: pid_t, trace: bool, cb: F) -> Result<WatcherId>
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        if !self.is_default {
            return Err(Error::NotDefaultLoop);
        }

        Ok(self.insert_user(
            Kind::Child {
                pid,
                trace,
                rpid: 0,
                rstatus: 0,
            },
            cb,
        ))
    }

    /// Pid and raw `waitpid` status of the last change the watcher saw.
    pub fn child_status(&self, id: WatcherId) -> Option<(pid_t, i32)> {
        match self.watchers.get(id.0).map(|w| &w.kind) {
            Some(&Kind::Child { rpid, rstatus, .. }) if rpid != 0 => Some((rpid, rstatus)),
            _ => None,
        }
    }

    pub(crate) fn child_start(&mut self, id: WatcherId) {
        debug_assert!(self.is_default, "child watcher started on a non-default loop");

        let Some(w) = self.watchers.get_mut(id.0) else {
            return;
        };
        let Kind::Child { pid, .. } = w.kind else {
            return;
        };

        if w.pending == 0 {
            w.priority = MAXPRI;
        }
        self.activate(id);
        self.children[bucket(pid)].push(id);
    }

    pub(crate) fn child_stop(&mut self, id: WatcherId) {
        let Some(&Kind::Child { pid, .. }) = self.watchers.get(id.0).map(|w| &w.kind) else {
            return;
        };

        self.children[bucket(pid)].retain(|&w| w != id);
    }

    /// Starts the hidden `SIGCHLD` watcher of the default loop.
    pub(crate) fn child_init(&mut self) {
        let id = self.insert(
            Kind::Signal {
                signum: libc::SIGCHLD,
            },
            Role::ChildReaper,
            None,
        );

        if let Some(w) = self.watchers.get_mut(id.0) {
            w.priority = MAXPRI;
        }

        self.childev = Some(id);
        self.start(id);
        self.unref_loop();
    }

    pub(crate) fn child_cb(&mut self, reaper: WatcherId) {
        let Some((pid, status)) = reap_one() else {
            return;
        };

        trace!(pid, status, "child status collected");

        // come back until every child has been reaped
        self.feed_event(reaper, Events::SIGNAL);

        self.child_reap(bucket(pid), pid, status);
        if bucket(pid) != 0 {
            self.child_reap(0, pid, status);
        }
    }

    fn child_reap(&mut self, chain: usize, rpid: pid_t, status: i32) {
        let traced = libc::WIFSTOPPED(status) || libc::WIFCONTINUED(status);

        for id in self.children[chain].clone() {
            let Some(w) = self.watchers.get_mut(id.0) else {
                continue;
            };
            let Kind::Child {
                pid,
                trace,
                rpid: wrpid,
                rstatus,
            } = &mut w.kind
            else {
                continue;
            };

            if (*pid == rpid || *pid == 0) && (!traced || *trace) {
                *wrpid = rpid;
                *rstatus = status;
                self.feed_event(id, Events::CHILD);
            }
        }
    }
}
