//! The event loop and its watchers.
//!
//! - [`core`]: the [`Loop`](core::Loop) and one iteration of it
//! - [`watcher`]: watcher records and handles
//! - [`event`]: event bit masks
//! - [`poller`]: OS polling backends
//! - [`heap`], [`pending`], [`fd`]: internal scheduling structures
//! - per-kind modules: [`timer`], [`signal`], [`child`], [`stat`], [`embed`], [`once`]

pub mod core;
pub mod event;
pub mod poller;
pub mod watcher;

pub(crate) mod child;
pub(crate) mod clock;
pub(crate) mod default;
pub(crate) mod embed;
pub(crate) mod fd;
pub(crate) mod heap;
pub(crate) mod once;
pub(crate) mod pending;
pub(crate) mod signal;
pub(crate) mod stat;
pub(crate) mod timer;
pub(crate) mod wakeup;

/// Time in seconds, as a floating point number.
pub type Timestamp = f64;
