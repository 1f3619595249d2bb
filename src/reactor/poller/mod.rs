//! OS polling backends.
//!
//! The loop only talks to a backend through [`Backend`]: it tells it which
//! fds it cares about (`modify`) and asks it to block for readiness (`poll`).
//! Everything else (fd bookkeeping, timers, callbacks) stays in the loop.
//!
//! - [`select`]: portable `select(2)` backend
//! - [`poll`]: `poll(2)` backend
//! - `epoll`: Linux `epoll(7)` backend
//! - `kqueue`: BSD/macOS `kqueue(2)` backend

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) mod kqueue;
pub(crate) mod poll;
pub(crate) mod select;

use crate::error::{Error, Result};
use crate::reactor::Timestamp;
use crate::reactor::event::Events;
use crate::trace::debug;

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, Not};
use std::os::unix::io::RawFd;

/// Set of polling backends, used both to request and to report them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Backends(u32);

impl Backends {
    pub const SELECT: Self = Self(0x01);
    pub const POLL: Self = Self(0x02);
    pub const EPOLL: Self = Self(0x04);
    pub const KQUEUE: Self = Self(0x08);
    pub const ALL: Self = Self(0x0f);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Backends {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for Backends {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for Backends {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SELECT, "SELECT"),
            (Self::POLL, "POLL"),
            (Self::EPOLL, "EPOLL"),
            (Self::KQUEUE, "KQUEUE"),
        ];

        let mut list = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }

        list.finish()
    }
}

/// One result reported by [`Backend::poll`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// The fd is ready for the given `READ`/`WRITE` events.
    Ready(RawFd, Events),
    /// The backend found the fd to be invalid; its watchers get an `ERROR`.
    Invalid(RawFd),
    /// The backend's kernel state went stale and must be rebuilt.
    Rearm,
}

/// A readiness notification mechanism the loop can block in.
///
/// Backends keep whatever per-fd state they need privately. Dropping a
/// backend releases its kernel resources.
pub trait Backend {
    /// Which backend this is. Custom backends may report an empty set.
    fn kind(&self) -> Backends;

    /// Changes the interest set for `fd` from `old` to `new`.
    ///
    /// Called only for fds whose mask changed, or that need to be resubmitted
    /// (`old` may equal `new`). An error makes the loop kill the fd.
    fn modify(&mut self, fd: RawFd, old: Events, new: Events) -> io::Result<()>;

    /// Blocks for at most `timeout` seconds and appends readiness to `out`.
    fn poll(&mut self, timeout: Timestamp, out: &mut Vec<Readiness>) -> io::Result<()>;

    /// Shortest timeout the backend can honour.
    fn mintime(&self) -> Timestamp {
        0.0
    }

    /// The fd the backend itself polls on, if it has one.
    fn backend_fd(&self) -> Option<RawFd> {
        None
    }

    /// Rebuilds kernel state in a child process. The loop resubmits every
    /// watched fd through `modify` afterwards.
    fn fork(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Backends compiled in for this platform.
pub fn supported_backends() -> Backends {
    let mut flags = Backends::SELECT | Backends::POLL;

    if cfg!(any(target_os = "linux", target_os = "android")) {
        flags = flags | Backends::EPOLL;
    }

    if cfg!(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )) {
        flags = flags | Backends::KQUEUE;
    }

    flags
}

/// Backends that are known to work well for arbitrary fds on this platform.
pub fn recommended_backends() -> Backends {
    let mut flags = supported_backends();

    // kqueue mishandles anything but sockets and pipes outside NetBSD.
    if !cfg!(target_os = "netbsd") {
        flags = flags & !Backends::KQUEUE;
    }

    if cfg!(any(target_os = "macos", target_os = "ios")) {
        flags = flags & !Backends::POLL;
    }

    if cfg!(target_os = "freebsd") {
        flags = flags & !Backends::POLL;
    }

    flags
}

/// Backends whose fd can itself be watched by another loop.
pub fn embeddable_backends() -> Backends {
    let mut flags = Backends::EPOLL | Backends::KQUEUE;

    // epoll-in-epoll is unreliable before 2.6.32
    if linux_version() < 0x02_06_20 {
        flags = flags & !Backends::EPOLL;
    }

    flags & supported_backends()
}

/// Linux kernel version as `0xMMmmpp`, or 0 on other systems.
fn linux_version() -> u32 {
    if !cfg!(any(target_os = "linux", target_os = "android")) {
        return 0;
    }

    let mut buf: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut buf) } != 0 {
        return 0;
    }

    let release = unsafe { std::ffi::CStr::from_ptr(buf.release.as_ptr()) };
    let release = release.to_string_lossy();

    release
        .split(|c: char| !c.is_ascii_digit())
        .take(3)
        .fold((0u32, 0), |(version, n), part| {
            let part = part.parse::<u32>().unwrap_or(0).min(0xff);
            (version | part << (16 - 8 * n), n + 1)
        })
        .0
}

/// Creates the first backend in `flags` that initialises, in order of
/// preference: kqueue, epoll, poll, select.
///
/// Fails with the last OS error if a candidate was tried and none came up,
/// or with [`Error::NoBackend`] if `flags` named nothing usable here.
pub(crate) fn init(flags: Backends) -> Result<Box<dyn Backend>> {
    #[allow(unused_mut)]
    let mut failure: Option<io::Error> = None;

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    if flags.contains(Backends::KQUEUE) {
        match kqueue::KqueueBackend::new() {
            Ok(backend) => return Ok(Box::new(backend)),
            Err(err) => {
                debug!(%err, "kqueue backend unavailable");
                failure = Some(err);
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if flags.contains(Backends::EPOLL) {
        match epoll::EpollBackend::new() {
            Ok(backend) => return Ok(Box::new(backend)),
            Err(err) => {
                debug!(%err, "epoll backend unavailable");
                failure = Some(err);
            }
        }
    }

    if flags.contains(Backends::POLL) {
        return Ok(Box::new(poll::PollBackend::new()));
    }

    if flags.contains(Backends::SELECT) {
        return Ok(Box::new(select::SelectBackend::new()));
    }

    Err(match failure {
        Some(err) => Error::Io(err),
        None => Error::NoBackend { requested: flags },
    })
}

/// `select`/`poll` style result bits to loop events.
pub(crate) fn readiness_events(readable: bool, writable: bool) -> Events {
    let mut events = Events::NONE;
    if readable {
        events |= Events::READ;
    }
    if writable {
        events |= Events::WRITE;
    }
    events
}

/// Timeout in milliseconds, rounded up so short waits never become busy loops.
pub(crate) fn timeout_ms(timeout: Timestamp) -> libc::c_int {
    (timeout * 1e3 + 0.9999).min(libc::c_int::MAX as f64) as libc::c_int
}

pub(crate) fn last_error() -> io::Error {
    io::Error::last_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_is_subset_of_supported() {
        let supported = supported_backends();
        let recommended = recommended_backends();
        assert_eq!(recommended & !supported, Backends::empty());
        assert!(supported.contains(Backends::SELECT));
    }

    #[test]
    fn test_init_falls_back_to_select() {
        let backend = init(Backends::SELECT).expect("select always initialises");
        assert_eq!(backend.kind(), Backends::SELECT);
        assert!(matches!(
            init(Backends::empty()),
            Err(Error::NoBackend { .. })
        ));
    }

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_ms(0.0), 0);
        assert_eq!(timeout_ms(0.0001), 1);
        assert_eq!(timeout_ms(1.5), 1500);
    }

    #[test]
    fn test_debug_lists_backends() {
        let flags = Backends::POLL | Backends::EPOLL;
        assert_eq!(format!("{flags:?}"), "{POLL, EPOLL}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_version_parsed() {
        assert!(linux_version() >= 0x02_06_00);
    }
}
