//! The event loop.
//!
//! A [`Loop`] owns every watcher, the fd table, the timer heaps and the
//! pending queues. One call to [`Loop::run`] iterates: it runs fork and
//! prepare watchers, pushes fd changes to the backend, blocks until the
//! nearest deadline or readiness, turns whatever happened into pending
//! events, and invokes them highest priority first.

use crate::error::{Result, syserr};
use crate::reactor::Timestamp;
use crate::reactor::child::PID_HASHSIZE;
use crate::reactor::clock::{Jump, LoopClock};
use crate::reactor::event::Events;
use crate::reactor::fd::FdTable;
use crate::reactor::heap::Heap;
use crate::reactor::once::OnceRecord;
use crate::reactor::pending::PendingQueue;
use crate::reactor::poller::{Backend, Backends, Readiness};
use crate::reactor::wakeup::Wakeup;
use crate::reactor::watcher::{
    Callback, Kind, MAXPRI, MINPRI, NUMPRI, Role, Watcher, WatcherId, array_push, array_remove,
};
use crate::time::{self, Clock};
use crate::trace::{debug, trace};
use crate::utils::slab::Slab;
use crate::LoopBuilder;

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, fence};

/// Longest the loop blocks in one go, even with nothing scheduled.
pub(crate) const MAX_BLOCKTIME: Timestamp = 59.743;

/// Effectively infinite blocking time used for the pre-poll time update.
const HUGE_BLOCKTIME: Timestamp = 1e100;

/// How [`Loop::run`] iterates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Iterate until no active watcher references the loop or it is broken.
    #[default]
    Default,
    /// One iteration without blocking.
    NoWait,
    /// One iteration, blocking if nothing is pending.
    Once,
}

/// How far [`Loop::break_loop`] unwinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Break {
    /// Undo an earlier break request.
    #[default]
    Cancel,
    /// Return from the innermost `run`.
    One,
    /// Return from every nested `run`.
    All,
}

/// Hook called with the loop, see [`Loop::set_invoke_pending_cb`].
pub type LoopHook = Box<dyn FnMut(&mut Loop)>;

/// A single-threaded event loop.
///
/// Watchers are created through the constructor methods (`io`, `timer`,
/// `signal`, ...), which return a [`WatcherId`]. A watcher does nothing until
/// [`start`](Loop::start)ed; active watchers keep [`run`](Loop::run) going.
///
/// # Example
/// ```ignore
/// let mut lp = Loop::new()?;
/// let t = lp.timer(1.0, 0.0, |_, _, _| println!("one second"));
/// lp.start(t);
/// lp.run(RunMode::Default);
/// ```
pub struct Loop {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) time: LoopClock,
    pub(crate) watchers: Slab<Watcher>,
    pub(crate) fds: FdTable,
    pub(crate) pending: PendingQueue,
    pub(crate) timers: Heap<WatcherId>,
    pub(crate) periodics: Heap<WatcherId>,
    pub(crate) idles: [Vec<WatcherId>; NUMPRI],
    pub(crate) idleall: usize,
    pub(crate) prepares: Vec<WatcherId>,
    pub(crate) checks: Vec<WatcherId>,
    pub(crate) forks: Vec<WatcherId>,
    pub(crate) cleanups: Vec<WatcherId>,
    pub(crate) asyncs: Vec<WatcherId>,
    /// Signal watchers indexed by signal number.
    pub(crate) signals: Vec<Vec<WatcherId>>,
    pub(crate) children: [Vec<WatcherId>; PID_HASHSIZE],
    pub(crate) childev: Option<WatcherId>,
    pub(crate) wakeup: Arc<Wakeup>,
    pub(crate) pipe_w: Option<WatcherId>,
    pub(crate) onces: Slab<OnceRecord>,
    /// Reverse feed buffer for expired timers and periodics.
    rfeeds: Vec<WatcherId>,
    readiness: Vec<Readiness>,
    pub(crate) activecnt: isize,
    loop_done: Break,
    loop_count: u64,
    loop_depth: u32,
    in_release: bool,
    io_blocktime: Timestamp,
    timeout_blocktime: Timestamp,
    backend_mintime: Timestamp,
    /// Pid at creation when fork checking is on, else 0.
    curpid: libc::pid_t,
    postfork: bool,
    rearm: bool,
    pub(crate) is_default: bool,
    invoke_cb: Option<LoopHook>,
    release_cb: Option<LoopHook>,
    acquire_cb: Option<LoopHook>,
}

impl Loop {
    /// Creates a loop with the recommended backend and the system clock.
    ///
    /// # Example
    /// ```ignore
    /// let mut lp = Loop::new()?;
    /// ```
    pub fn new() -> Result<Self> {
        LoopBuilder::new().build()
    }

    pub(crate) fn with_parts(
        backend: Box<dyn Backend>,
        clock: Box<dyn Clock>,
        forkcheck: bool,
    ) -> Self {
        let time = LoopClock::new(&*clock);
        let backend_mintime = backend.mintime();

        Self {
            backend,
            clock,
            time,
            watchers: Slab::new(),
            fds: FdTable::new(),
            pending: PendingQueue::new(),
            timers: Heap::new(),
            periodics: Heap::new(),
            idles: Default::default(),
            idleall: 0,
            prepares: Vec::new(),
            checks: Vec::new(),
            forks: Vec::new(),
            cleanups: Vec::new(),
            asyncs: Vec::new(),
            signals: Vec::new(),
            children: Default::default(),
            childev: None,
            wakeup: Arc::new(Wakeup::new()),
            pipe_w: None,
            onces: Slab::new(),
            rfeeds: Vec::new(),
            readiness: Vec::new(),
            activecnt: 0,
            loop_done: Break::Cancel,
            loop_count: 0,
            loop_depth: 0,
            in_release: false,
            io_blocktime: 0.0,
            timeout_blocktime: 0.0,
            backend_mintime,
            curpid: if forkcheck { unsafe { libc::getpid() } } else { 0 },
            postfork: false,
            rearm: false,
            is_default: false,
            invoke_cb: None,
            release_cb: None,
            acquire_cb: None,
        }
    }

    /// Destroys the loop: runs cleanup watchers and releases every resource.
    pub fn destroy(self) {
        drop(self);
    }

    /// Runs the loop.
    ///
    /// Returns `true` if active watchers still reference the loop, which
    /// happens after a break or in the single-iteration modes.
    ///
    /// # Example
    /// ```ignore
    /// while lp.run(RunMode::Once) {
    ///     // handle something between iterations
    /// }
    /// ```
    pub fn run(&mut self, mode: RunMode) -> bool {
        self.loop_depth += 1;
        debug_assert!(!self.in_release, "run called from the loop release hook");

        self.loop_done = Break::Cancel;
        self.call_invoke_pending();

        loop {
            if self.curpid != 0 {
                let pid = unsafe { libc::getpid() };
                if pid != self.curpid {
                    self.curpid = pid;
                    self.postfork = true;
                }
            }

            if self.postfork && !self.forks.is_empty() {
                self.queue_events(&self.forks.clone(), Events::FORK);
                self.call_invoke_pending();
            }

            if !self.prepares.is_empty() {
                self.queue_events(&self.prepares.clone(), Events::PREPARE);
                self.call_invoke_pending();
            }

            if self.loop_done != Break::Cancel {
                break;
            }

            if self.postfork || self.rearm {
                self.loop_fork_reinit();
            }

            self.fd_reify();

            let (waittime, sleeptime) = self.wait_time(mode);

            self.loop_count += 1;
            self.block(waittime);

            self.wakeup.write_wanted.store(false, Ordering::SeqCst);
            fence(Ordering::Acquire);
            if self.wakeup.write_skipped.load(Ordering::SeqCst)
                && let Some(pipe) = self.pipe_w
            {
                debug_assert!(self.is_active(pipe), "wakeup skipped without a pipe watcher");
                self.feed_event(pipe, Events::CUSTOM);
            }

            self.time_update(waittime + sleeptime);

            self.timers_reify();
            self.periodics_reify();
            self.idle_reify();

            if !self.checks.is_empty() {
                self.queue_events(&self.checks.clone(), Events::CHECK);
            }

            self.call_invoke_pending();

            if self.activecnt <= 0 || self.loop_done != Break::Cancel || mode != RunMode::Default
            {
                break;
            }
        }

        if self.loop_done == Break::One {
            self.loop_done = Break::Cancel;
        }

        self.loop_depth -= 1;
        self.activecnt > 0
    }

    /// Computes how long to block, sleeping for the io collect interval first.
    /// Returns `(waittime, sleeptime)`.
    fn wait_time(&mut self, mode: RunMode) -> (Timestamp, Timestamp) {
        let prev_mn_now = self.time.mn_now;
        self.time_update(HUGE_BLOCKTIME);

        self.wakeup.write_wanted.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if mode == RunMode::NoWait
            || self.idleall > 0
            || self.activecnt <= 0
            || self.wakeup.write_skipped.load(Ordering::SeqCst)
        {
            return (0.0, 0.0);
        }

        let mut waittime = MAX_BLOCKTIME;

        if let Some(top) = self.timers.top() {
            waittime = waittime.min(top.at - self.time.mn_now);
        }

        if let Some(top) = self.periodics.top() {
            waittime = waittime.min(top.at - self.time.rt_now);
        }

        if waittime < self.timeout_blocktime {
            waittime = self.timeout_blocktime;
        }

        if waittime < self.backend_mintime {
            waittime = if waittime <= 0.0 {
                0.0
            } else {
                self.backend_mintime
            };
        }

        let mut sleeptime = 0.0;
        if self.io_blocktime > 0.0 {
            sleeptime = self.io_blocktime - (self.time.mn_now - prev_mn_now);
            sleeptime = sleeptime.min(waittime - self.backend_mintime);

            if sleeptime > 0.0 {
                time::sleep(sleeptime);
                waittime -= sleeptime;
            } else {
                sleeptime = 0.0;
            }
        }

        (waittime, sleeptime)
    }

    /// Blocks in the backend and feeds what it reports.
    fn block(&mut self, timeout: Timestamp) {
        self.in_release = true;

        if let Some(mut cb) = self.release_cb.take() {
            cb(self);
            if self.release_cb.is_none() {
                self.release_cb = Some(cb);
            }
        }

        let mut out = std::mem::take(&mut self.readiness);
        let res = self.backend.poll(timeout, &mut out);

        if let Some(mut cb) = self.acquire_cb.take() {
            cb(self);
            if self.acquire_cb.is_none() {
                self.acquire_cb = Some(cb);
            }
        }

        self.in_release = false;

        if let Err(err) = res {
            trace!(%err, "backend poll failed");
            self.poll_error(err);
        }

        for readiness in out.drain(..) {
            match readiness {
                Readiness::Ready(fd, events) => self.fd_event(fd, events),
                Readiness::Invalid(fd) => self.fd_kill(fd),
                Readiness::Rearm => self.rearm = true,
            }
        }

        self.readiness = out;
    }

    /// Rebuilds backend state after a fork or after the backend lost track.
    fn loop_fork_reinit(&mut self) {
        debug!(postfork = self.postfork, "reinitialising backend state");

        if self.backend.fork().is_err() {
            syserr("backend reinitialisation failed");
        }

        self.fd_rearm_all();

        if self.postfork {
            self.pipe_reinit();
        }

        self.postfork = false;
        self.rearm = false;
    }

    /// Tells the loop it is running in a forked child. The next iteration
    /// runs fork watchers and rebuilds kernel state.
    pub fn loop_fork(&mut self) {
        self.postfork = true;
    }

    pub(crate) fn time_update(&mut self, max_block: Timestamp) {
        match self.time.update(&*self.clock, max_block) {
            Jump::None => {}
            Jump::Wall => {
                debug!(rt_now = self.time.rt_now, "wall clock jumped");
                self.periodics_reschedule();
            }
            Jump::Both(offset) => {
                debug!(offset, "time jumped, shifting timers");
                self.timers_reschedule(offset);
                self.periodics_reschedule();
            }
        }
    }

    fn idle_reify(&mut self) {
        if self.idleall == 0 {
            return;
        }

        for pri in (0..NUMPRI).rev() {
            if self.pending.level_len(pri) > 0 {
                break;
            }

            if !self.idles[pri].is_empty() {
                self.queue_events(&self.idles[pri].clone(), Events::IDLE);
                break;
            }
        }
    }

    fn queue_events(&mut self, ids: &[WatcherId], events: Events) {
        for &id in ids {
            self.feed_event(id, events);
        }
    }

    pub(crate) fn feed_reverse(&mut self, id: WatcherId) {
        self.rfeeds.push(id);
    }

    /// Feeds the staged watchers so they run in the order they were staged.
    pub(crate) fn feed_reverse_done(&mut self, events: Events) {
        while let Some(id) = self.rfeeds.pop() {
            self.feed_event(id, events);
        }
    }

    fn call_invoke_pending(&mut self) {
        match self.invoke_cb.take() {
            Some(mut cb) => {
                cb(self);
                if self.invoke_cb.is_none() {
                    self.invoke_cb = Some(cb);
                }
            }
            None => self.invoke_pending(),
        }
    }

    /// Invokes every pending watcher, highest priority first.
    pub fn invoke_pending(&mut self) {
        self.pending.rewind();

        while let Some(record) = self.pending.pop() {
            let Some(id) = record.watcher else {
                continue;
            };

            if let Some(w) = self.watchers.get_mut(id.0) {
                w.pending = 0;
            }

            self.invoke(id, record.events);
        }
    }

    /// Calls the watcher's callback directly, bypassing the pending queue.
    pub fn invoke(&mut self, id: WatcherId, events: Events) {
        let Some(role) = self.watchers.get(id.0).map(|w| w.role) else {
            return;
        };

        match role {
            Role::User => self.invoke_user(id, events),
            Role::Pipe => self.pipe_cb(events),
            Role::ChildReaper => self.child_cb(id),
            Role::EmbedIo(parent) => self.embed_io_cb(parent),
            Role::EmbedPrepare(parent) => self.embed_prepare_cb(parent),
            Role::EmbedFork(parent) => self.embed_fork_cb(parent),
            Role::StatTimer(parent) => self.stat_timer_cb(parent),
            Role::OnceIo(key) | Role::OnceTimer(key) => self.once_cb(key, role, events),
        }
    }

    fn invoke_user(&mut self, id: WatcherId, events: Events) {
        let Some(w) = self.watchers.get_mut(id.0) else {
            return;
        };

        if w.running {
            trace!(?id, ?events, "callback already running, event deferred");
            w.deferred |= events;
            return;
        }

        let Some(mut cb) = w.cb.take() else {
            return;
        };
        w.running = true;

        cb(self, id, events);

        let Some(w) = self.watchers.get_mut(id.0) else {
            return;
        };

        w.running = false;
        // keep a callback installed by set_callback from inside cb
        if w.cb.is_none() {
            w.cb = Some(cb);
        }

        let deferred = std::mem::replace(&mut w.deferred, Events::NONE);
        if let Kind::Timer { expirations, .. } = &mut w.kind
            && !deferred.contains(Events::TIMER)
        {
            *expirations = 0;
        }

        if !deferred.is_empty() {
            self.feed_event(id, deferred);
        }
    }

    /// Queues `events` for the watcher as if they had happened.
    ///
    /// Feeding a watcher that is already pending merges the events into its
    /// existing entry. The watcher need not be active.
    pub fn feed_event(&mut self, id: WatcherId, events: Events) {
        let Some(w) = self.watchers.get_mut(id.0) else {
            debug_assert!(false, "feed_event on destroyed watcher");
            return;
        };

        w.pending = self.pending.feed(id, w.pri_index(), w.pending, events);
    }

    /// Removes the watcher from the pending queue and returns the events it
    /// was pending with.
    pub fn clear_pending(&mut self, id: WatcherId) -> Events {
        let Some(w) = self.watchers.get_mut(id.0) else {
            return Events::NONE;
        };

        if w.pending == 0 {
            return Events::NONE;
        }

        let events = self.pending.clear(w.pri_index(), w.pending);
        w.pending = 0;
        events
    }

    /// Starts the watcher. Starting an active watcher does nothing.
    pub fn start(&mut self, id: WatcherId) {
        let Some(w) = self.watchers.get(id.0) else {
            debug_assert!(false, "start on destroyed watcher");
            return;
        };

        if w.is_active() {
            return;
        }

        match w.kind.type_bit() {
            Events::IO => self.io_start(id),
            Events::TIMER => self.timer_start(id),
            Events::PERIODIC => self.periodic_start(id),
            Events::SIGNAL => self.signal_start(id),
            Events::CHILD => self.child_start(id),
            Events::STAT => self.stat_start(id),
            Events::IDLE => {
                let pri = w.pri_index();
                self.activate(id);
                array_push(&mut self.idles[pri], &mut self.watchers, id);
                self.idleall += 1;
            }
            Events::PREPARE => {
                self.activate(id);
                array_push(&mut self.prepares, &mut self.watchers, id);
            }
            Events::CHECK => {
                self.activate(id);
                array_push(&mut self.checks, &mut self.watchers, id);
            }
            Events::FORK => {
                self.activate(id);
                array_push(&mut self.forks, &mut self.watchers, id);
            }
            Events::CLEANUP => {
                self.activate(id);
                array_push(&mut self.cleanups, &mut self.watchers, id);
                // cleanup watchers never keep the loop alive
                self.unref_loop();
            }
            Events::ASYNC => self.async_start(id),
            Events::EMBED => self.embed_start(id),
            _ => {}
        }
    }

    /// Stops the watcher and clears any pending event. Stopping an inactive
    /// watcher only clears the pending event.
    pub fn stop(&mut self, id: WatcherId) {
        self.clear_pending(id);

        let Some(w) = self.watchers.get_mut(id.0) else {
            return;
        };
        w.deferred = Events::NONE;

        if !w.is_active() {
            return;
        }

        let slot = w.active;
        match w.kind.type_bit() {
            Events::IO => self.io_stop(id),
            Events::TIMER => self.timer_stop(id, slot),
            Events::PERIODIC => self.periodic_stop(slot),
            Events::SIGNAL => self.signal_stop(id),
            Events::CHILD => self.child_stop(id),
            Events::STAT => self.stat_stop(id),
            Events::IDLE => {
                let pri = w.pri_index();
                array_remove(&mut self.idles[pri], &mut self.watchers, slot);
                self.idleall -= 1;
            }
            Events::PREPARE => array_remove(&mut self.prepares, &mut self.watchers, slot),
            Events::CHECK => array_remove(&mut self.checks, &mut self.watchers, slot),
            Events::FORK => array_remove(&mut self.forks, &mut self.watchers, slot),
            Events::CLEANUP => {
                self.ref_loop();
                array_remove(&mut self.cleanups, &mut self.watchers, slot);
            }
            Events::ASYNC => self.async_stop(slot),
            Events::EMBED => self.embed_stop(id),
            _ => {}
        }

        self.deactivate(id);
    }

    /// Marks the watcher active and takes a loop reference for it.
    pub(crate) fn activate(&mut self, id: WatcherId) {
        if let Some(w) = self.watchers.get_mut(id.0) {
            w.priority = w.priority.clamp(MINPRI, MAXPRI);
            w.active = 1;
            self.activecnt += 1;
        }
    }

    fn deactivate(&mut self, id: WatcherId) {
        if let Some(w) = self.watchers.get_mut(id.0) {
            w.active = 0;
            self.activecnt -= 1;
        }
    }

    pub(crate) fn insert(&mut self, kind: Kind, role: Role, cb: Option<Callback>) -> WatcherId {
        WatcherId(self.watchers.insert(Watcher::new(kind, role, cb)))
    }

    pub(crate) fn insert_user<F>(&mut self, kind: Kind, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert(kind, Role::User, Some(Box::new(cb)))
    }

    /// Stops the watcher and frees it. The handle becomes invalid.
    pub fn destroy_watcher(&mut self, id: WatcherId) {
        self.stop(id);

        let helpers = match self.watchers.get(id.0).map(|w| &w.kind) {
            Some(Kind::Stat(state)) => vec![state.timer],
            Some(Kind::Embed(state)) => vec![state.io, state.prepare, state.fork],
            _ => Vec::new(),
        };

        for helper in helpers {
            self.stop(helper);
            self.watchers.remove(helper.0);
        }

        if self.watchers.remove(id.0).is_none() {
            debug_assert!(false, "destroy_watcher on destroyed watcher");
        }
    }

    /// Replaces the watcher's callback.
    pub fn set_callback<F>(&mut self, id: WatcherId, cb: F)
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        if let Some(w) = self.watchers.get_mut(id.0) {
            w.cb = Some(Box::new(cb));
        }
    }

    pub fn is_active(&self, id: WatcherId) -> bool {
        self.watchers.get(id.0).is_some_and(|w| w.is_active())
    }

    pub fn is_pending(&self, id: WatcherId) -> bool {
        self.watchers.get(id.0).is_some_and(|w| w.pending != 0)
    }

    pub fn priority(&self, id: WatcherId) -> i32 {
        self.watchers.get(id.0).map_or(0, |w| w.priority)
    }

    /// Sets the priority, clamped to `MINPRI..=MAXPRI`. Only allowed while
    /// the watcher is neither active nor pending.
    pub fn set_priority(&mut self, id: WatcherId, priority: i32) {
        if let Some(w) = self.watchers.get_mut(id.0) {
            debug_assert!(
                !w.is_active() && w.pending == 0,
                "priority changed on an active or pending watcher"
            );
            w.priority = priority.clamp(MINPRI, MAXPRI);
        }
    }

    pub fn idle<F>(&mut self, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert_user(Kind::Idle, cb)
    }

    pub fn prepare<F>(&mut self, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert_user(Kind::Prepare, cb)
    }

    pub fn check<F>(&mut self, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert_user(Kind::Check, cb)
    }

    /// Watcher invoked at the start of the first iteration after a fork.
    pub fn fork_watcher<F>(&mut self, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert_user(Kind::Fork, cb)
    }

    /// Watcher invoked when the loop is destroyed. Does not keep the loop
    /// running.
    pub fn cleanup<F>(&mut self, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert_user(Kind::Cleanup, cb)
    }

    /// Watcher triggered from any thread through an [`AsyncSender`](crate::AsyncSender).
    pub fn async_watcher<F>(&mut self, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert_user(
            Kind::Async {
                sent: Arc::new(AtomicBool::new(false)),
            },
            cb,
        )
    }

    /// Io watcher for `events` (`READ` and/or `WRITE`) on `fd`.
    pub fn io<F>(&mut self, fd: RawFd, events: Events, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert_user(
            Kind::Io {
                fd,
                events: events.io() | Events::IOFDSET,
            },
            cb,
        )
    }

    /// Calls `cb` for every active user watcher whose kind is in `types`.
    ///
    /// Internal helpers are not reported; a stat or embed watcher is
    /// reported as itself.
    pub fn walk<F>(&mut self, types: Events, mut cb: F)
    where
        F: FnMut(&mut Loop, Events, WatcherId),
    {
        let found: Vec<(Events, WatcherId)> = self
            .watchers
            .iter()
            .filter(|(_, w)| w.role == Role::User && w.is_active())
            .map(|(key, w)| (w.kind.type_bit(), WatcherId(key)))
            .filter(|(kind, _)| types.intersects(*kind))
            .collect();

        for (kind, id) in found {
            if self.is_active(id) {
                cb(self, kind, id);
            }
        }
    }

    /// Requests `run` to return after the current iteration.
    pub fn break_loop(&mut self, how: Break) {
        self.loop_done = how;
    }

    /// Number of times the loop has polled the backend.
    pub fn iteration(&self) -> u64 {
        self.loop_count
    }

    /// How many `run` calls are currently on the stack.
    pub fn depth(&self) -> u32 {
        self.loop_depth
    }

    /// Wall-clock time the current iteration started.
    pub fn now(&self) -> Timestamp {
        self.time.rt_now
    }

    /// Refreshes [`now`](Loop::now).
    pub fn now_update(&mut self) {
        self.time_update(HUGE_BLOCKTIME);
    }

    /// Prepares for the process being suspended; pair with [`resume`](Loop::resume).
    pub fn suspend(&mut self) {
        self.now_update();
    }

    /// Shifts timers by the time spent suspended so they do not all fire at
    /// once, and reschedules periodics.
    pub fn resume(&mut self) {
        let mn_prev = self.time.mn_now;
        self.now_update();
        self.timers_reschedule(self.time.mn_now - mn_prev);
        self.periodics_reschedule();
    }

    /// Takes a reference: the loop keeps running while it is held.
    pub fn ref_loop(&mut self) {
        self.activecnt += 1;
    }

    /// Drops a reference, e.g. so a watcher does not keep the loop alive.
    pub fn unref_loop(&mut self) {
        self.activecnt -= 1;
    }

    /// Number of references keeping the loop running.
    pub fn active_count(&self) -> isize {
        self.activecnt
    }

    /// Sleeps this long before polling to collect more io events per
    /// iteration.
    pub fn set_io_collect_interval(&mut self, interval: Timestamp) {
        self.io_blocktime = interval.max(0.0);
    }

    /// Never blocks for less than this when timers are due, to batch them.
    pub fn set_timeout_collect_interval(&mut self, interval: Timestamp) {
        self.timeout_blocktime = interval.max(0.0);
    }

    /// Replaces pending-event dispatch. The hook should eventually call
    /// [`invoke_pending`](Loop::invoke_pending).
    pub fn set_invoke_pending_cb(&mut self, cb: Option<LoopHook>) {
        self.invoke_cb = cb;
    }

    /// Hooks called right before and after the loop blocks.
    pub fn set_loop_release_cb(&mut self, release: Option<LoopHook>, acquire: Option<LoopHook>) {
        self.release_cb = release;
        self.acquire_cb = acquire;
    }

    /// Number of watchers waiting for their callback.
    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }

    pub fn backend(&self) -> Backends {
        self.backend.kind()
    }

    pub fn backend_fd(&self) -> Option<RawFd> {
        self.backend.backend_fd()
    }

    pub fn is_default_loop(&self) -> bool {
        self.is_default
    }

    /// Checks internal consistency.
    ///
    /// # Panics
    /// On any violated invariant.
    pub fn verify(&self) {
        for (fd, slot) in self.fds.iter() {
            for id in &slot.watchers {
                let w = self.watchers.get(id.0);
                assert!(w.is_some_and(|w| w.is_active()), "inactive io watcher on fd {fd}");
                assert!(
                    matches!(w.map(|w| &w.kind), Some(Kind::Io { fd: wfd, .. }) if *wfd == fd),
                    "io watcher on wrong fd list {fd}"
                );
            }
        }

        for (name, heap) in [("timer", &self.timers), ("periodic", &self.periodics)] {
            assert_eq!(heap.violation(), None, "{name} heap out of order");

            for (k, node) in heap.nodes().iter().enumerate() {
                let w = self.watchers.get(node.item.0);
                assert_eq!(w.map(|w| w.active), Some(k + 1), "{name} heap index mismatch");
                assert_eq!(w.and_then(|w| w.at()), Some(node.at), "{name} heap cache mismatch");
            }
        }

        for pri in 0..NUMPRI {
            for (k, record) in self.pending.records(pri).iter().enumerate() {
                if let Some(id) = record.watcher {
                    let w = self.watchers.get(id.0);
                    assert_eq!(w.map(|w| w.pending), Some(k + 1), "pending index mismatch");
                    assert_eq!(w.map(|w| w.pri_index()), Some(pri), "pending level mismatch");
                }
            }
        }

        let mut arrays: Vec<&Vec<WatcherId>> = self.idles.iter().collect();
        arrays.extend([
            &self.prepares,
            &self.checks,
            &self.forks,
            &self.cleanups,
            &self.asyncs,
        ]);

        for list in arrays {
            for (k, id) in list.iter().enumerate() {
                let active = self.watchers.get(id.0).map(|w| w.active);
                assert_eq!(active, Some(k + 1), "watcher array index mismatch");
            }
        }

        assert_eq!(
            self.idleall,
            self.idles.iter().map(Vec::len).sum::<usize>(),
            "idle count mismatch"
        );

        for list in self.signals.iter().chain(self.children.iter()) {
            for id in list {
                assert!(self.is_active(*id), "inactive watcher in signal/child list");
            }
        }
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        if !self.cleanups.is_empty() {
            self.queue_events(&self.cleanups.clone(), Events::CLEANUP);
            self.invoke_pending();
        }

        if let Some(id) = self.childev
            && self.is_active(id)
        {
            self.ref_loop();
            self.stop(id);
        }

        self.signals_detach_all();
        self.wakeup.close();
        self.pending.clear_all();

        debug!(backend = ?self.backend.kind(), "loop destroyed");
    }
}
