//! Internal logging macros.
//!
//! Forwards to `tracing` when the `tracing` feature is enabled and expands to
//! nothing otherwise, so the hot paths carry no logging cost in lean builds.

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, trace, warn};

#[cfg(not(feature = "tracing"))]
mod noop {
    macro_rules! trace {
        ($($tt:tt)*) => {
            ()
        };
    }

    macro_rules! debug {
        ($($tt:tt)*) => {
            ()
        };
    }

    macro_rules! log_warn {
        ($($tt:tt)*) => {
            ()
        };
    }

    macro_rules! error {
        ($($tt:tt)*) => {
            ()
        };
    }

    pub(crate) use {debug, error, trace};
    pub(crate) use log_warn as warn;
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop::*;
