//! One-shot wait for an fd and/or a timeout.

use crate::reactor::Timestamp;
use crate::reactor::core::Loop;
use crate::reactor::event::Events;
use crate::reactor::watcher::{Kind, Role, WatcherId};
use crate::utils::slab::Key;

use std::os::unix::io::RawFd;

pub(crate) type OnceFn = Box<dyn FnOnce(&mut Loop, Events)>;

pub(crate) struct OnceRecord {
    io: Option<WatcherId>,
    timer: Option<WatcherId>,
    cb: Option<OnceFn>,
}

impl Loop {
    /// Calls `cb` once, when `fd` becomes ready for `events` or `timeout`
    /// seconds have passed, whichever happens first. The callback receives
    /// every event that was pending by then (`READ`, `WRITE`, `TIMER`).
    ///
    /// # Example
    /// ```ignore
    /// lp.once(Some(sock), Events::READ, Some(5.0), |_, ev| {
    ///     if ev.contains(Events::TIMER) {
    ///         println!("timed out");
    ///     }
    /// });
    /// ```
    pub fn once<F>(&mut self, fd: Option<RawFd>, events: Events, timeout: Option<Timestamp>, cb: F)
    where
        F: FnOnce(&mut Loop, Events) + 'static,
    {
        let key = self.onces.insert(OnceRecord {
            io: None,
            timer: None,
            cb: Some(Box::new(cb)),
        });

        let io = fd.filter(|&fd| fd >= 0).map(|fd| {
            self.insert(
                Kind::Io {
                    fd,
                    events: events.io() | Events::IOFDSET,
                },
                Role::OnceIo(key),
                None,
            )
        });

        let timer = timeout.filter(|&t| t >= 0.0).map(|after| {
            self.insert(
                Kind::Timer {
                    at: after,
                    repeat: 0.0,
                    expirations: 0,
                },
                Role::OnceTimer(key),
                None,
            )
        });

        if let Some(rec) = self.onces.get_mut(key) {
            rec.io = io;
            rec.timer = timer;
        }

        for id in io.into_iter().chain(timer) {
            self.start(id);
        }
    }

    pub(crate) fn once_cb(&mut self, key: Key, role: Role, mut events: Events) {
        let Some(rec) = self.onces.remove(key) else {
            return;
        };

        let sibling = match role {
            Role::OnceIo(_) => rec.timer,
            _ => rec.io,
        };
        if let Some(sibling) = sibling {
            events |= self.clear_pending(sibling);
        }

        for id in rec.io.into_iter().chain(rec.timer) {
            self.destroy_watcher(id);
        }

        if let Some(cb) = rec.cb {
            cb(self, events);
        }
    }
}
