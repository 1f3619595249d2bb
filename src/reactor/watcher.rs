//! Watcher records stored in the loop's arena.
//!
//! Applications never hold a watcher directly: constructors on [`Loop`]
//! return a [`WatcherId`] that indexes the arena. The loop keeps watcher
//! positions in its own structures (`active`, `pending`) so that start and
//! stop stay O(1) or O(log n).

use crate::reactor::Timestamp;
use crate::reactor::core::Loop;
use crate::reactor::embed::EmbedState;
use crate::reactor::event::Events;
use crate::reactor::heap::Backref;
use crate::reactor::stat::StatState;
use crate::utils::slab::{Key, Slab};

use libc::pid_t;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Lowest watcher priority.
pub const MINPRI: i32 = -2;
/// Highest watcher priority.
pub const MAXPRI: i32 = 2;
pub(crate) const NUMPRI: usize = (MAXPRI - MINPRI + 1) as usize;

/// Handle to a watcher owned by a [`Loop`].
///
/// Handles are generational: once the watcher is destroyed, the handle stops
/// resolving even if its arena slot gets reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub(crate) Key);

/// Watcher callback: receives the loop, the watcher that fired and the events.
pub type Callback = Box<dyn FnMut(&mut Loop, WatcherId, Events)>;

/// Computes the next periodic deadline from the current wall-clock time.
pub type RescheduleFn = Rc<dyn Fn(Timestamp) -> Timestamp>;

/// Who a watcher belongs to. Internal helpers have no callback of their own;
/// the loop dispatches them by role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    User,
    Pipe,
    ChildReaper,
    EmbedIo(WatcherId),
    EmbedPrepare(WatcherId),
    EmbedFork(WatcherId),
    StatTimer(WatcherId),
    OnceIo(Key),
    OnceTimer(Key),
}

pub(crate) enum Kind {
    Io {
        fd: RawFd,
        events: Events,
    },
    Timer {
        at: Timestamp,
        repeat: Timestamp,
        expirations: u32,
    },
    Periodic {
        at: Timestamp,
        offset: Timestamp,
        interval: Timestamp,
        reschedule: Option<RescheduleFn>,
    },
    Signal {
        signum: i32,
    },
    Child {
        pid: pid_t,
        trace: bool,
        rpid: pid_t,
        rstatus: i32,
    },
    Stat(Box<StatState>),
    Idle,
    Prepare,
    Check,
    Fork,
    Cleanup,
    Async {
        sent: Arc<AtomicBool>,
    },
    Embed(Box<EmbedState>),
}

impl Kind {
    /// The event bit that names this kind of watcher.
    pub(crate) fn type_bit(&self) -> Events {
        match self {
            Kind::Io { .. } => Events::IO,
            Kind::Timer { .. } => Events::TIMER,
            Kind::Periodic { .. } => Events::PERIODIC,
            Kind::Signal { .. } => Events::SIGNAL,
            Kind::Child { .. } => Events::CHILD,
            Kind::Stat(_) => Events::STAT,
            Kind::Idle => Events::IDLE,
            Kind::Prepare => Events::PREPARE,
            Kind::Check => Events::CHECK,
            Kind::Fork => Events::FORK,
            Kind::Cleanup => Events::CLEANUP,
            Kind::Async { .. } => Events::ASYNC,
            Kind::Embed(_) => Events::EMBED,
        }
    }
}

pub(crate) struct Watcher {
    /// 0 when stopped, otherwise the 1-based slot in the owning structure.
    pub(crate) active: usize,
    /// 0 when not queued, otherwise the 1-based slot in its pending level.
    pub(crate) pending: usize,
    pub(crate) priority: i32,
    pub(crate) role: Role,
    pub(crate) kind: Kind,
    pub(crate) cb: Option<Callback>,
    /// Set while the callback is executing.
    pub(crate) running: bool,
    /// Events that arrived while the callback was executing.
    pub(crate) deferred: Events,
}

impl Watcher {
    pub(crate) fn new(kind: Kind, role: Role, cb: Option<Callback>) -> Self {
        Self {
            active: 0,
            pending: 0,
            priority: 0,
            role,
            kind,
            cb,
            running: false,
            deferred: Events::NONE,
        }
    }

    pub(crate) fn pri_index(&self) -> usize {
        (self.priority.clamp(MINPRI, MAXPRI) - MINPRI) as usize
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active != 0
    }

    /// Deadline of a timer or periodic watcher.
    pub(crate) fn at(&self) -> Option<Timestamp> {
        match self.kind {
            Kind::Timer { at, .. } | Kind::Periodic { at, .. } => Some(at),
            _ => None,
        }
    }

    pub(crate) fn set_at(&mut self, value: Timestamp) {
        if let Kind::Timer { at, .. } | Kind::Periodic { at, .. } = &mut self.kind {
            *at = value;
        }
    }
}

impl Backref<WatcherId> for Slab<Watcher> {
    fn set_slot(&mut self, item: WatcherId, slot: usize) {
        if let Some(w) = self.get_mut(item.0) {
            w.active = slot;
        }
    }
}

/// Flat arrays of watcher ids where `active` is the 1-based index.
pub(crate) fn array_push(list: &mut Vec<WatcherId>, watchers: &mut Slab<Watcher>, id: WatcherId) {
    list.push(id);
    if let Some(w) = watchers.get_mut(id.0) {
        w.active = list.len();
    }
}

/// Removes the entry at the 1-based `slot` by moving the last one into it.
pub(crate) fn array_remove(list: &mut Vec<WatcherId>, watchers: &mut Slab<Watcher>, slot: usize) {
    list.swap_remove(slot - 1);

    if let Some(&moved) = list.get(slot - 1)
        && let Some(w) = watchers.get_mut(moved.0)
    {
        w.active = slot;
    }
}
