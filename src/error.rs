//! Error types and the fatal system-error hook.
//!
//! Recoverable conditions inside a running loop never surface here: they are
//! handled internally and at most reach a watcher as an `ERROR` event. This type
//! covers construction-time failures (no usable backend, bad signal number, ...).

use crate::reactor::poller::Backends;
use crate::trace::error;

use std::io;
use std::sync::RwLock;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by loop and watcher construction.
#[derive(Error, Debug)]
pub enum Error {
    /// An operating system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// None of the requested backends could be initialised.
    #[error("no usable backend among {requested:?}")]
    NoBackend {
        /// The backend mask that was tried.
        requested: Backends,
    },

    /// The signal number is outside `1..NSIG`.
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),

    /// The signal is already attached to another loop.
    #[error("signal {0} is attached to a different loop")]
    SignalInUse(i32),

    /// Child watchers only work on the default loop.
    #[error("child watchers are only supported on the default loop")]
    NotDefaultLoop,

    /// The default loop exists on another thread, or failed to initialise.
    #[error("the default loop is not available on this thread")]
    DefaultLoopUnavailable,

    /// The loop to embed does not use an embeddable backend.
    #[error("loop backend {0:?} cannot be embedded")]
    NotEmbeddable(Backends),
}

type SyserrHook = fn(&str);

static SYSERR_CB: RwLock<Option<SyserrHook>> = RwLock::new(None);

/// Installs a hook that is called on fatal system errors instead of aborting.
///
/// The hook receives a short description of the failed operation; `errno` is
/// still set when it runs. If the hook returns, the loop carries on as if the
/// failing call had returned no events.
pub fn set_syserr_cb(cb: Option<SyserrHook>) {
    if let Ok(mut hook) = SYSERR_CB.write() {
        *hook = cb;
    }
}

pub(crate) fn has_syserr_cb() -> bool {
    SYSERR_CB.read().map(|hook| hook.is_some()).unwrap_or(false)
}

/// Reports a fatal system error: calls the installed hook or logs and aborts.
pub(crate) fn syserr(msg: &str) {
    let err = io::Error::last_os_error();
    let hook = SYSERR_CB.read().ok().and_then(|hook| *hook);

    match hook {
        Some(cb) => cb(msg),
        None => {
            error!(%err, "{msg}");
            eprintln!("{msg}: {err}");
            std::process::abort();
        }
    }
}
