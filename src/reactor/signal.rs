//! Signal delivery through the wakeup pipe.
//!
//! The process has one table slot per signal number. A slot holds a pending
//! flag and a reference to the wakeup object of the loop the signal is
//! attached to. The installed handler only sets the flag and signals that
//! wakeup; the loop later turns the flag into `SIGNAL` events for its
//! watchers. A signal belongs to at most one loop at a time.

use crate::error::{Error, Result};
use crate::reactor::core::Loop;
use crate::reactor::event::Events;
use crate::reactor::wakeup::Wakeup;
use crate::reactor::watcher::{Kind, WatcherId};
use crate::trace::{debug, warn};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::{mem, ptr};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const NSIG: usize = 65;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) const NSIG: usize = 33;

struct SignalSlot {
    pending: AtomicBool,
    /// Owning loop's wakeup, leaked from an `Arc` while attached.
    wakeup: AtomicPtr<Wakeup>,
}

impl SignalSlot {
    const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            wakeup: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

static SIGNALS: [SignalSlot; NSIG] = [const { SignalSlot::new() }; NSIG];

fn slot(signum: i32) -> Option<&'static SignalSlot> {
    if signum <= 0 || signum as usize >= NSIG {
        return None;
    }

    SIGNALS.get(signum as usize)
}

pub(crate) fn validate(signum: i32) -> Result<()> {
    slot(signum).map(|_| ()).ok_or(Error::InvalidSignal(signum))
}

/// Whether `signum` is attached to a loop other than the one owning `wake`.
pub(crate) fn attached_elsewhere(signum: i32, wake: &Arc<Wakeup>) -> bool {
    slot(signum).is_some_and(|s| {
        let cur = s.wakeup.load(Ordering::Acquire);
        !cur.is_null() && !ptr::eq(cur, Arc::as_ptr(wake))
    })
}

fn attach(signum: i32, wake: &Arc<Wakeup>) -> Result<()> {
    let s = slot(signum).ok_or(Error::InvalidSignal(signum))?;
    let ours = Arc::into_raw(wake.clone()) as *mut Wakeup;

    match s
        .wakeup
        .compare_exchange(ptr::null_mut(), ours, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => Ok(()),
        Err(cur) => {
            // already attached: release the extra reference we took
            drop(unsafe { Arc::from_raw(ours) });

            if ptr::eq(cur, Arc::as_ptr(wake)) {
                Ok(())
            } else {
                Err(Error::SignalInUse(signum))
            }
        }
    }
}

fn detach(signum: i32, wake: &Arc<Wakeup>) {
    let Some(s) = slot(signum) else {
        return;
    };

    let ours = Arc::as_ptr(wake) as *mut Wakeup;
    if let Ok(old) =
        s.wakeup
            .compare_exchange(ours, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
    {
        drop(unsafe { Arc::from_raw(old) });
    }
}

extern "C" fn handler(signum: libc::c_int) {
    feed_signal(signum);
}

/// Delivers `signum` as if the process had received it.
///
/// Safe to call from a signal handler or any thread. Does nothing unless a
/// loop has a watcher for this signal.
pub fn feed_signal(signum: i32) {
    let Some(s) = slot(signum) else {
        return;
    };

    let wake = s.wakeup.load(Ordering::Acquire);
    if wake.is_null() {
        return;
    }

    s.pending.store(true, Ordering::SeqCst);
    let wake = unsafe { &*wake };
    wake.signal(&wake.sig_pending);
}

fn install(signum: i32) {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigfillset(&mut sa.sa_mask);
        sa.sa_flags = libc::SA_RESTART;
        libc::sigaction(signum, &sa, ptr::null_mut());

        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signum);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
    }
}

fn uninstall(signum: i32) {
    unsafe { libc::signal(signum, libc::SIG_DFL) };
}

impl Loop {
    /// Watcher for `signum`.
    ///
    /// # Errors
    /// [`Error::InvalidSignal`] for a number outside `1..NSIG`,
    /// [`Error::SignalInUse`] if another loop is watching the signal.
    ///
    /// # Example
    /// ```ignore
    /// let s = lp.signal(libc::SIGINT, |lp, _, _| lp.break_loop(Break::All))?;
    /// lp.start(s);
    /// ```
    pub fn signal<F>(&mut self, signum: i32, cb: F) -> Result<WatcherId>
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        validate(signum)?;

        if attached_elsewhere(signum, &self.wakeup) {
            return Err(Error::SignalInUse(signum));
        }

        Ok(self.insert_user(Kind::Signal { signum }, cb))
    }

    pub(crate) fn signal_start(&mut self, id: WatcherId) {
        let Some(&Kind::Signal { signum }) = self.watchers.get(id.0).map(|w| &w.kind) else {
            return;
        };

        if let Err(err) = attach(signum, &self.wakeup) {
            warn!(%err, "signal watcher not started");
            debug_assert!(false, "signal {signum} is attached to another loop");
            return;
        }

        let idx = signum as usize;
        if self.signals.len() <= idx {
            self.signals.resize_with(idx + 1, Vec::new);
        }

        self.activate(id);
        self.signals[idx].push(id);

        if self.signals[idx].len() == 1 {
            self.pipe_init();
            install(signum);
            debug!(signum, "signal handler installed");
        }
    }

    pub(crate) fn signal_stop(&mut self, id: WatcherId) {
        let Some(&Kind::Signal { signum }) = self.watchers.get(id.0).map(|w| &w.kind) else {
            return;
        };

        let idx = signum as usize;
        let Some(list) = self.signals.get_mut(idx) else {
            return;
        };
        list.retain(|&w| w != id);

        if list.is_empty() {
            detach(signum, &self.wakeup);
            uninstall(signum);
            debug!(signum, "signal handler removed");
        }
    }

    /// Feeds `SIGNAL` to every watcher of `signum` on this loop.
    ///
    /// Does nothing if the signal is attached to a different loop or to none.
    pub fn feed_signal_event(&mut self, signum: i32) {
        let Some(s) = slot(signum) else {
            return;
        };

        if !ptr::eq(s.wakeup.load(Ordering::Acquire), Arc::as_ptr(&self.wakeup)) {
            return;
        }

        s.pending.store(false, Ordering::SeqCst);

        let watchers = self.signals.get(signum as usize).cloned().unwrap_or_default();
        for id in watchers {
            self.feed_event(id, Events::SIGNAL);
        }
    }

    pub(crate) fn feed_pending_signals(&mut self) {
        for signum in (1..NSIG as i32).rev() {
            if slot(signum).is_some_and(|s| s.pending.load(Ordering::SeqCst)) {
                self.feed_signal_event(signum);
            }
        }
    }

    /// Detaches every signal still owned by this loop.
    pub(crate) fn signals_detach_all(&mut self) {
        for (signum, list) in self.signals.iter_mut().enumerate() {
            if !list.is_empty() {
                list.clear();
                detach(signum as i32, &self.wakeup);
                uninstall(signum as i32);
            }
        }
    }
}
