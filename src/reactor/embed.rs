//! Embedding one loop into another.
//!
//! The embedded loop's backend fd is watched by the outer loop. When it turns
//! readable the embed watcher either feeds `EMBED` to its callback or, when it
//! has none, runs the inner loop once without blocking.

use crate::error::{Error, Result};
use crate::reactor::core::{Loop, RunMode};
use crate::reactor::event::Events;
use crate::reactor::poller::embeddable_backends;
use crate::reactor::watcher::{Callback, Kind, MINPRI, Role, WatcherId};
use crate::trace::{debug, warn};

use std::cell::RefCell;
use std::rc::Rc;

pub(crate) struct EmbedState {
    other: Rc<RefCell<Loop>>,
    automatic: bool,
    pub(crate) io: WatcherId,
    pub(crate) prepare: WatcherId,
    pub(crate) fork: WatcherId,
}

/// Runs `f` on the embedded loop unless it is already running further up
/// the stack.
fn with_other(other: &Rc<RefCell<Loop>>, f: impl FnOnce(&mut Loop)) {
    match other.try_borrow_mut() {
        Ok(mut lp) => f(&mut lp),
        Err(_) => warn!("embedded loop busy, skipping"),
    }
}

impl Loop {
    /// Embeds `other` into this loop.
    ///
    /// With a callback, the callback gets `EMBED` whenever the inner loop has
    /// events and should call [`embed_sweep`](Loop::embed_sweep). Without
    /// one, the inner loop is swept automatically.
    ///
    /// # Errors
    /// [`Error::NotEmbeddable`] if the other loop's backend cannot be
    /// embedded (see [`embeddable_backends`]).
    ///
    /// # Example
    /// ```ignore
    /// let inner = Rc::new(RefCell::new(
    ///     LoopBuilder::new().backends(embeddable_backends()).build()?,
    /// ));
    /// let e = lp.embed(inner.clone(), None)?;
    /// lp.start(e);
    /// ```
    pub fn embed(&mut self, other: Rc<RefCell<Loop>>, cb: Option<Callback>) -> Result<WatcherId> {
        let (kind, fd) = {
            let lp = other.borrow();
            (lp.backend(), lp.backend_fd())
        };

        let Some(fd) = fd.filter(|_| embeddable_backends().contains(kind)) else {
            return Err(Error::NotEmbeddable(kind));
        };

        let io = self.insert(
            Kind::Io {
                fd,
                events: Events::READ | Events::IOFDSET,
            },
            Role::User,
            None,
        );
        let prepare = self.insert(Kind::Prepare, Role::User, None);
        let fork = self.insert(Kind::Fork, Role::User, None);

        let automatic = cb.is_none();
        let id = self.insert(
            Kind::Embed(Box::new(EmbedState {
                other,
                automatic,
                io,
                prepare,
                fork,
            })),
            Role::User,
            cb,
        );

        for (helper, role) in [
            (io, Role::EmbedIo(id)),
            (prepare, Role::EmbedPrepare(id)),
            (fork, Role::EmbedFork(id)),
        ] {
            if let Some(w) = self.watchers.get_mut(helper.0) {
                w.role = role;
            }
        }

        Ok(id)
    }

    fn embed_state(&self, id: WatcherId) -> Option<&EmbedState> {
        match self.watchers.get(id.0).map(|w| &w.kind) {
            Some(Kind::Embed(state)) => Some(state),
            _ => None,
        }
    }

    /// The loop embedded by watcher `id`.
    pub fn embed_other(&self, id: WatcherId) -> Option<Rc<RefCell<Loop>>> {
        self.embed_state(id).map(|s| s.other.clone())
    }

    /// Runs the embedded loop once without blocking.
    pub fn embed_sweep(&mut self, id: WatcherId) {
        if let Some(other) = self.embed_other(id) {
            with_other(&other, |lp| {
                lp.run(RunMode::NoWait);
            });
        }
    }

    pub(crate) fn embed_start(&mut self, id: WatcherId) {
        let priority = self.priority(id);
        let Some((other, io, prepare, fork)) = self
            .embed_state(id)
            .map(|s| (s.other.clone(), s.io, s.prepare, s.fork))
        else {
            return;
        };

        let Some(fd) = other.try_borrow().ok().and_then(|lp| lp.backend_fd()) else {
            debug_assert!(false, "embedded loop lost its backend fd");
            return;
        };

        self.io_set(io, fd, Events::READ);
        self.set_priority(io, priority);
        self.start(io);

        self.set_priority(prepare, MINPRI);
        self.start(prepare);

        self.start(fork);

        debug!(fd, "embedded loop attached");
        self.activate(id);
    }

    pub(crate) fn embed_stop(&mut self, id: WatcherId) {
        let Some((io, prepare, fork)) = self.embed_state(id).map(|s| (s.io, s.prepare, s.fork))
        else {
            return;
        };

        self.stop(io);
        self.stop(prepare);
        self.stop(fork);
    }

    pub(crate) fn embed_io_cb(&mut self, id: WatcherId) {
        match self.embed_state(id).map(|s| s.automatic) {
            Some(false) => self.feed_event(id, Events::EMBED),
            Some(true) => self.embed_sweep(id),
            None => {}
        }
    }

    /// Pushes the inner loop's pending fd changes to its backend so the
    /// outer loop blocks on an up-to-date backend fd.
    pub(crate) fn embed_prepare_cb(&mut self, id: WatcherId) {
        if let Some(other) = self.embed_other(id) {
            with_other(&other, |lp| {
                while lp.fds.has_changes() {
                    lp.fd_reify();
                    lp.run(RunMode::NoWait);
                }
            });
        }
    }

    pub(crate) fn embed_fork_cb(&mut self, id: WatcherId) {
        let Some(other) = self.embed_other(id) else {
            return;
        };

        self.stop(id);

        with_other(&other, |lp| {
            lp.loop_fork();
            lp.run(RunMode::NoWait);
        });

        self.start(id);
    }
}
