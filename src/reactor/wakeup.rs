//! Cross-thread and signal-handler wakeup of a blocked loop.
//!
//! A loop owns one [`Wakeup`]: an eventfd (Linux) or a nonblocking pipe that
//! its internal pipe watcher reads from. Writers set a flag first and write
//! only if the loop announced that it is about to block (`write_wanted`);
//! otherwise they record `write_skipped` and the loop feeds the pipe watcher
//! itself after polling. Everything a writer touches is an atomic, so
//! [`Wakeup::signal`] is safe from signal handlers and other threads.

use crate::error::syserr;
use crate::reactor::core::Loop;
use crate::reactor::event::Events;
use crate::reactor::watcher::{Kind, Role, Watcher, WatcherId, array_push, array_remove};
use crate::trace::trace;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering, fence};

pub(crate) struct Wakeup {
    /// Read end of the pipe, or -1 when an eventfd serves both ends.
    read_fd: AtomicI32,
    write_fd: AtomicI32,
    pub(crate) write_wanted: AtomicBool,
    pub(crate) write_skipped: AtomicBool,
    pub(crate) async_pending: AtomicBool,
    pub(crate) sig_pending: AtomicBool,
}

/// Saves `errno` on creation and restores it on drop.
struct ErrnoGuard(Option<libc::c_int>);

impl ErrnoGuard {
    fn save() -> Self {
        Self(errno_location().map(|p| unsafe { *p }))
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        if let (Some(value), Some(p)) = (self.0, errno_location()) {
            unsafe { *p = value };
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> Option<*mut libc::c_int> {
    Some(unsafe { libc::__errno_location() })
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> Option<*mut libc::c_int> {
    Some(unsafe { libc::__error() })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn errno_location() -> Option<*mut libc::c_int> {
    None
}

/// Marks an fd close-on-exec and nonblocking.
pub(crate) fn fd_intern(fd: RawFd) {
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn eventfd() -> Option<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    (fd >= 0).then_some(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn eventfd() -> Option<RawFd> {
    None
}

/// Returns `(read, write)`; `read` is -1 for an eventfd.
fn create_fds() -> io::Result<(RawFd, RawFd)> {
    if let Some(fd) = eventfd() {
        return Ok((-1, fd));
    }

    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    fd_intern(fds[0]);
    fd_intern(fds[1]);

    Ok((fds[0], fds[1]))
}

impl Wakeup {
    pub(crate) fn new() -> Self {
        Self {
            read_fd: AtomicI32::new(-1),
            write_fd: AtomicI32::new(-1),
            write_wanted: AtomicBool::new(false),
            write_skipped: AtomicBool::new(false),
            async_pending: AtomicBool::new(false),
            sig_pending: AtomicBool::new(false),
        }
    }

    /// Creates the fds, or replaces them after a fork. The write fd keeps its
    /// number so concurrent writers never see it change.
    pub(crate) fn open(&self) -> io::Result<RawFd> {
        let (read, write) = create_fds()?;

        let old_write = self.write_fd.load(Ordering::SeqCst);
        if old_write < 0 {
            self.write_fd.store(write, Ordering::SeqCst);
        } else {
            unsafe {
                libc::dup2(write, old_write);
                libc::close(write);
            }
        }

        let old_read = self.read_fd.swap(read, Ordering::SeqCst);
        if old_read >= 0 {
            unsafe { libc::close(old_read) };
        }

        Ok(self.watch_fd())
    }

    /// The fd the loop watches for readability.
    pub(crate) fn watch_fd(&self) -> RawFd {
        let read = self.read_fd.load(Ordering::SeqCst);
        if read >= 0 {
            read
        } else {
            self.write_fd.load(Ordering::SeqCst)
        }
    }

    /// Sets `flag` and wakes the loop if it is blocked. Async-signal-safe.
    pub(crate) fn signal(&self, flag: &AtomicBool) {
        fence(Ordering::SeqCst);
        if flag.load(Ordering::SeqCst) {
            return;
        }

        flag.store(true, Ordering::SeqCst);
        self.write_skipped.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if self.write_wanted.load(Ordering::SeqCst) {
            self.write_skipped.store(false, Ordering::SeqCst);
            fence(Ordering::Release);

            let _errno = ErrnoGuard::save();
            let fd = self.write_fd.load(Ordering::SeqCst);

            if self.read_fd.load(Ordering::SeqCst) < 0 {
                let counter: u64 = 1;
                unsafe { libc::write(fd, &counter as *const u64 as *const _, 8) };
            } else {
                let byte = 1u8;
                unsafe { libc::write(fd, &byte as *const u8 as *const _, 1) };
            }
        }
    }

    /// Empties the pipe or resets the eventfd counter.
    pub(crate) fn drain(&self) {
        let fd = self.watch_fd();
        let mut buf = [0u8; 64];

        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 || (n as usize) < buf.len() {
                break;
            }
        }
    }

    pub(crate) fn close(&self) {
        for fd in [&self.read_fd, &self.write_fd] {
            let old = fd.swap(-1, Ordering::SeqCst);
            if old >= 0 {
                unsafe { libc::close(old) };
            }
        }
    }
}

/// Handle that wakes a loop's async watcher from any thread.
///
/// Obtained from [`Loop::async_sender`]. Sending is cheap and can be repeated;
/// sends that arrive before the loop notices the first are merged into a
/// single `ASYNC` event.
///
/// # Example
/// ```ignore
/// let id = lp.async_watcher(|lp, _, _| lp.break_loop(Break::All));
/// lp.start(id);
/// let sender = lp.async_sender(id).unwrap();
/// std::thread::spawn(move || sender.send());
/// lp.run(RunMode::Default);
/// ```
#[derive(Clone)]
pub struct AsyncSender {
    wake: Arc<Wakeup>,
    sent: Arc<AtomicBool>,
}

impl AsyncSender {
    pub fn send(&self) {
        self.sent.store(true, Ordering::SeqCst);
        self.wake.signal(&self.wake.async_pending);
    }

    /// Whether a send has not been delivered yet.
    pub fn is_pending(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }
}

impl Loop {
    /// Makes sure the wakeup fd exists and the pipe watcher is running.
    pub(crate) fn pipe_init(&mut self) {
        if self.pipe_w.is_some_and(|id| self.is_active(id)) {
            return;
        }

        let fd = match self.wakeup.open() {
            Ok(fd) => fd,
            Err(_) => {
                syserr("error creating signal/async pipe");
                return;
            }
        };

        let id = match self.pipe_w {
            Some(id) => id,
            None => {
                let kind = Kind::Io {
                    fd,
                    events: Events::READ,
                };
                let id = WatcherId(self.watchers.insert(Watcher::new(kind, Role::Pipe, None)));
                self.pipe_w = Some(id);
                id
            }
        };

        self.io_set(id, fd, Events::READ);
        self.start(id);
        self.unref_loop();
        trace!(fd, "wakeup pipe ready");
    }

    /// Reopens the wakeup fds in a forked child.
    pub(crate) fn pipe_reinit(&mut self) {
        let Some(id) = self.pipe_w.filter(|&id| self.is_active(id)) else {
            return;
        };

        self.ref_loop();
        self.stop(id);
        self.pipe_init();
        // catch anything signalled while the old pipe was being replaced
        self.feed_event(id, Events::CUSTOM);
    }

    pub(crate) fn pipe_cb(&mut self, events: Events) {
        if events.contains(Events::READ) {
            self.wakeup.drain();
        }

        self.wakeup.write_skipped.store(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if self.wakeup.sig_pending.swap(false, Ordering::SeqCst) {
            self.feed_pending_signals();
        }

        if self.wakeup.async_pending.swap(false, Ordering::SeqCst) {
            let asyncs = self.asyncs.clone();
            for id in asyncs.into_iter().rev() {
                let sent = match self.watchers.get(id.0).map(|w| &w.kind) {
                    Some(Kind::Async { sent }) => sent.swap(false, Ordering::SeqCst),
                    _ => false,
                };

                if sent {
                    self.feed_event(id, Events::ASYNC);
                }
            }
        }
    }

    pub(crate) fn async_start(&mut self, id: WatcherId) {
        if let Some(Kind::Async { sent }) = self.watchers.get(id.0).map(|w| &w.kind) {
            sent.store(false, Ordering::SeqCst);
        }

        self.pipe_init();
        self.activate(id);
        array_push(&mut self.asyncs, &mut self.watchers, id);
    }

    pub(crate) fn async_stop(&mut self, slot: usize) {
        array_remove(&mut self.asyncs, &mut self.watchers, slot);
    }

    /// Returns a thread-safe handle that triggers the async watcher `id`.
    ///
    /// Returns `None` if `id` is not an async watcher.
    pub fn async_sender(&self, id: WatcherId) -> Option<AsyncSender> {
        match self.watchers.get(id.0).map(|w| &w.kind) {
            Some(Kind::Async { sent }) => Some(AsyncSender {
                wake: self.wakeup.clone(),
                sent: sent.clone(),
            }),
            _ => None,
        }
    }

    /// Whether the async watcher has been sent to but not yet delivered.
    pub fn async_pending(&self, id: WatcherId) -> bool {
        match self.watchers.get(id.0).map(|w| &w.kind) {
            Some(Kind::Async { sent }) => sent.load(Ordering::SeqCst),
            _ => false,
        }
    }
}
