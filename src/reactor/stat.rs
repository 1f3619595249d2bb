//! Path attribute watchers.
//!
//! A stat watcher polls `lstat` on a hidden timer and feeds `STAT` when any
//! attribute differs from the previous sample. A missing path is reported
//! with `nlink == 0`.

use crate::reactor::Timestamp;
use crate::reactor::core::Loop;
use crate::reactor::event::Events;
use crate::reactor::watcher::{Kind, Role, WatcherId};
use crate::trace::trace;

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Shortest poll interval.
const MIN_STAT_INTERVAL: Timestamp = 0.1074891;
/// Poll interval used when none is given.
const DEF_STAT_INTERVAL: Timestamp = 5.0074891;

/// Attributes compared between two samples of a watched path.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatAttrs {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    /// 0 when the path does not exist.
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl StatAttrs {
    fn sample(path: &Path) -> Self {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return Self::default();
        };

        let time = |secs: i64, nsecs: i64| secs as Timestamp + nsecs as Timestamp * 1e-9;

        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink().max(1),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            atime: time(meta.atime(), meta.atime_nsec()),
            mtime: time(meta.mtime(), meta.mtime_nsec()),
            ctime: time(meta.ctime(), meta.ctime_nsec()),
        }
    }

    /// Whether the path existed when sampled.
    pub fn exists(&self) -> bool {
        self.nlink != 0
    }
}

pub(crate) struct StatState {
    path: PathBuf,
    interval: Timestamp,
    attr: StatAttrs,
    prev: StatAttrs,
    pub(crate) timer: WatcherId,
}

impl Loop {
    /// Watcher for changes to the attributes of `path`, checked every
    /// `interval` seconds (0 picks a default of about five seconds).
    ///
    /// # Example
    /// ```ignore
    /// let s = lp.stat("/etc/passwd", 0.0, |lp, id, _| {
    ///     if !lp.stat_attr(id).is_some_and(|a| a.exists()) {
    ///         println!("deleted");
    ///     }
    /// });
    /// lp.start(s);
    /// ```
    pub fn stat<P, F>(&mut self, path: P, interval: Timestamp, cb: F) -> WatcherId
    where
        P: Into<PathBuf>,
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        let timer = self.insert(
            Kind::Timer {
                at: 0.0,
                repeat: 0.0,
                expirations: 0,
            },
            Role::User,
            None,
        );

        let id = self.insert_user(
            Kind::Stat(Box::new(StatState {
                path: path.into(),
                interval,
                attr: StatAttrs::default(),
                prev: StatAttrs::default(),
                timer,
            })),
            cb,
        );

        if let Some(w) = self.watchers.get_mut(timer.0) {
            w.role = Role::StatTimer(id);
        }

        id
    }

    fn stat_state(&self, id: WatcherId) -> Option<&StatState> {
        match self.watchers.get(id.0).map(|w| &w.kind) {
            Some(Kind::Stat(state)) => Some(state),
            _ => None,
        }
    }

    fn stat_state_mut(&mut self, id: WatcherId) -> Option<&mut StatState> {
        match self.watchers.get_mut(id.0).map(|w| &mut w.kind) {
            Some(Kind::Stat(state)) => Some(state),
            _ => None,
        }
    }

    /// Attributes from the latest sample.
    pub fn stat_attr(&self, id: WatcherId) -> Option<StatAttrs> {
        self.stat_state(id).map(|s| s.attr)
    }

    /// Attributes from the sample before the last change.
    pub fn stat_prev(&self, id: WatcherId) -> Option<StatAttrs> {
        self.stat_state(id).map(|s| s.prev)
    }

    pub fn stat_path(&self, id: WatcherId) -> Option<&Path> {
        self.stat_state(id).map(|s| s.path.as_path())
    }

    /// Samples the path now, updating [`stat_attr`](Loop::stat_attr)
    /// without feeding an event.
    pub fn stat_stat(&mut self, id: WatcherId) {
        if let Some(state) = self.stat_state_mut(id) {
            state.attr = StatAttrs::sample(&state.path);
        }
    }

    pub(crate) fn stat_start(&mut self, id: WatcherId) {
        self.stat_stat(id);

        let priority = self.priority(id);
        let Some(state) = self.stat_state_mut(id) else {
            return;
        };

        if state.interval != 0.0 && state.interval < MIN_STAT_INTERVAL {
            state.interval = MIN_STAT_INTERVAL;
        }

        let timer = state.timer;
        let repeat = if state.interval != 0.0 {
            state.interval
        } else {
            DEF_STAT_INTERVAL
        };

        self.timer_set(timer, 0.0, repeat);
        self.set_priority(timer, priority);
        self.timer_again(timer);
        self.unref_loop();

        self.activate(id);
    }

    pub(crate) fn stat_stop(&mut self, id: WatcherId) {
        let Some(timer) = self.stat_state(id).map(|s| s.timer) else {
            return;
        };

        if self.is_active(timer) {
            self.ref_loop();
            self.stop(timer);
        }
    }

    pub(crate) fn stat_timer_cb(&mut self, id: WatcherId) {
        let Some(state) = self.stat_state_mut(id) else {
            return;
        };

        let prev = state.attr;
        state.attr = StatAttrs::sample(&state.path);

        if state.attr != prev {
            trace!(path = %state.path.display(), "path attributes changed");
            state.prev = prev;
            self.feed_event(id, Events::STAT);
        }
    }
}
