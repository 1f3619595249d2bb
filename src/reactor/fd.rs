//! Per-fd state and the change list between the loop and the backend.
//!
//! Io watcher starts and stops only mark their fd dirty. Before blocking the
//! loop "reifies" every dirty fd: it unions the masks of the fd's watchers and
//! tells the backend when that union differs from what the backend has.

use crate::error::has_syserr_cb;
use crate::reactor::core::Loop;
use crate::reactor::event::Events;
use crate::reactor::watcher::{Kind, WatcherId};
use crate::trace::{debug, warn};

use std::os::unix::io::RawFd;

/// The fd's watcher set changed and must be reified.
pub(crate) const REIFY: u8 = 0x01;
/// Resubmit the fd to the backend even if the mask looks unchanged.
pub(crate) const FDSET: u8 = 0x80;

#[derive(Default)]
pub(crate) struct FdSlot {
    pub(crate) watchers: Vec<WatcherId>,
    /// Mask the backend was last told about.
    pub(crate) events: Events,
    pub(crate) reify: u8,
}

#[derive(Default)]
pub(crate) struct FdTable {
    slots: Vec<FdSlot>,
    changes: Vec<RawFd>,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slot(&self, fd: RawFd) -> Option<&FdSlot> {
        usize::try_from(fd).ok().and_then(|k| self.slots.get(k))
    }

    pub(crate) fn slot_mut(&mut self, fd: RawFd) -> &mut FdSlot {
        let k = fd as usize;
        if self.slots.len() <= k {
            self.slots.resize_with(k + 1, FdSlot::default);
        }

        &mut self.slots[k]
    }

    /// Marks `fd` dirty. Each fd appears in the change list at most once.
    pub(crate) fn change(&mut self, fd: RawFd, flags: u8) {
        let slot = self.slot_mut(fd);
        let was_dirty = slot.reify != 0;
        slot.reify |= flags;

        if !was_dirty {
            self.changes.push(fd);
        }
    }

    pub(crate) fn is_dirty(&self, fd: RawFd) -> bool {
        self.slot(fd).is_some_and(|slot| slot.reify != 0)
    }

    pub(crate) fn take_changes(&mut self) -> Vec<RawFd> {
        std::mem::take(&mut self.changes)
    }

    pub(crate) fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Fds the backend currently watches, in ascending order.
    pub(crate) fn watched(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.events.is_empty())
            .map(|(fd, _)| fd as RawFd)
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (RawFd, &FdSlot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(fd, slot)| (fd as RawFd, slot))
    }
}

fn fd_valid(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

impl Loop {
    pub(crate) fn io_start(&mut self, id: WatcherId) {
        let Some(w) = self.watchers.get_mut(id.0) else {
            return;
        };
        let Kind::Io { fd, events } = &mut w.kind else {
            return;
        };

        let fd = *fd;
        debug_assert!(fd >= 0, "io watcher started with negative fd");
        debug_assert!(
            (*events & !(Events::READ | Events::WRITE | Events::IOFDSET)).is_empty(),
            "io watcher started with illegal event mask"
        );

        let flags = if events.contains(Events::IOFDSET) {
            FDSET | REIFY
        } else {
            REIFY
        };
        *events &= !Events::IOFDSET;

        if fd < 0 {
            return;
        }

        self.activate(id);
        self.fds.slot_mut(fd).watchers.push(id);
        self.fds.change(fd, flags);
    }

    pub(crate) fn io_stop(&mut self, id: WatcherId) {
        let Some(&Kind::Io { fd, .. }) = self.watchers.get(id.0).map(|w| &w.kind) else {
            return;
        };

        self.fds.slot_mut(fd).watchers.retain(|&w| w != id);
        self.fds.change(fd, REIFY);
    }

    /// Changes the fd and mask of an inactive io watcher.
    pub fn io_set(&mut self, id: WatcherId, fd: RawFd, events: Events) {
        let Some(w) = self.watchers.get_mut(id.0) else {
            debug_assert!(false, "io_set on destroyed watcher");
            return;
        };
        debug_assert!(!w.is_active(), "io_set on active watcher");

        if let Kind::Io {
            fd: wfd,
            events: wevents,
        } = &mut w.kind
        {
            *wfd = fd;
            *wevents = events.io() | Events::IOFDSET;
        }
    }

    /// Pushes every dirty fd's watcher mask to the backend.
    pub(crate) fn fd_reify(&mut self) {
        let changes = self.fds.take_changes();

        for fd in changes {
            let slot = self.fds.slot_mut(fd);
            let old = slot.events;
            let mut reify = slot.reify;
            slot.reify = 0;

            let watchers = &slot.watchers;
            let new = watchers
                .iter()
                .filter_map(|id| match self.watchers.get(id.0).map(|w| &w.kind) {
                    Some(Kind::Io { events, .. }) => Some(*events),
                    _ => None,
                })
                .fold(Events::NONE, |acc, ev| acc | ev);

            let slot = self.fds.slot_mut(fd);
            slot.events = new;
            if old != new {
                reify |= FDSET;
            }

            if reify & FDSET != 0
                && let Err(err) = self.backend.modify(fd, old, new)
            {
                warn!(fd, %err, "backend rejected fd");
                self.fd_kill(fd);
            }
        }
    }

    /// Feeds backend readiness, unless the fd changed since the backend saw it.
    pub(crate) fn fd_event(&mut self, fd: RawFd, revents: Events) {
        if !self.fds.is_dirty(fd) {
            self.fd_event_nocheck(fd, revents);
        }
    }

    fn fd_event_nocheck(&mut self, fd: RawFd, revents: Events) {
        let Some(slot) = self.fds.slot(fd) else {
            return;
        };

        let watchers = slot.watchers.clone();
        for id in watchers {
            let ev = match self.watchers.get(id.0).map(|w| &w.kind) {
                Some(Kind::Io { events, .. }) => *events & revents,
                _ => Events::NONE,
            };

            if !ev.is_empty() {
                self.feed_event(id, ev);
            }
        }
    }

    /// Feeds `revents` to the io watchers of `fd` as if the backend had
    /// reported them.
    pub fn feed_fd_event(&mut self, fd: RawFd, revents: Events) {
        if fd >= 0 && (fd as usize) < self.fds.len() {
            self.fd_event_nocheck(fd, revents);
        }
    }

    /// Stops every watcher on `fd` and hands them an `ERROR` event.
    pub(crate) fn fd_kill(&mut self, fd: RawFd) {
        debug!(fd, "killing fd watchers");

        while let Some(&id) = self.fds.slot(fd).and_then(|slot| slot.watchers.first()) {
            self.stop(id);
            self.feed_event(id, Events::ERROR | Events::READ | Events::WRITE);
        }
    }

    /// Kills every watched fd that is no longer open.
    pub(crate) fn fd_ebadf(&mut self) {
        for fd in self.fds.watched() {
            if !fd_valid(fd) {
                self.fd_kill(fd);
            }
        }
    }

    /// Out of kernel memory: give up the highest watched fd.
    pub(crate) fn fd_enomem(&mut self) {
        if let Some(&fd) = self.fds.watched().last() {
            warn!(fd, "backend out of memory, dropping fd");
            self.fd_kill(fd);
        }
    }

    /// Resubmits every watched fd, after a fork or a lost backend state.
    pub(crate) fn fd_rearm_all(&mut self) {
        for fd in self.fds.watched() {
            self.fds.slot_mut(fd).events = Events::NONE;
            self.fds.change(fd, FDSET | REIFY);
        }
    }

    /// Maps a failed backend poll to the matching recovery.
    pub(crate) fn poll_error(&mut self, err: std::io::Error) {
        match err.raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::EBADF) => self.fd_ebadf(),
            Some(libc::ENOMEM) if !has_syserr_cb() => self.fd_enomem(),
            _ => crate::error::syserr("backend poll failed"),
        }
    }
}
