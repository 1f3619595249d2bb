//! Single-threaded event loop dispatching to watcher callbacks.
//!
//! A [`Loop`] waits for file descriptor readiness, timers, wall-clock
//! periodics, signals, child process changes, path attribute changes and
//! cross-thread wakeups, and calls the callbacks of the watchers interested
//! in them.
//!
//! # Architecture
//!
//! - **Loop**: owns all watchers and runs iterations (`run`)
//! - **Watchers**: created through `Loop` methods, referred to by [`WatcherId`]
//! - **Backends**: `select`, `poll`, `epoll` or `kqueue` behind the [`Backend`] trait
//! - **LoopBuilder**: fluent configuration of backends, clock and intervals
//! - **Default loop**: the one loop that reaps children, see [`default_loop`]
//! - **AsyncSender**: thread-safe handle waking an async watcher
//!
//! # Example
//!
//! ```ignore
//! use evloop::{Loop, RunMode, Events};
//!
//! let mut lp = Loop::new()?;
//! let w = lp.io(0, Events::READ, |lp, id, _| {
//!     println!("stdin is readable");
//!     lp.stop(id);
//! });
//! lp.start(w);
//! lp.run(RunMode::Default);
//! ```

mod builder;
mod error;
mod reactor;
mod trace;
mod utils;

pub mod time;

pub use builder::{ENV_FLAGS, FLAG_FORKCHECK, LoopBuilder};
pub use error::{Error, Result, set_syserr_cb};
pub use reactor::Timestamp;
pub use reactor::core::{Break, Loop, LoopHook, RunMode};
pub use reactor::default::{default_loop, destroy_default_loop};
pub use reactor::event::Events;
pub use reactor::poller::{
    Backend, Backends, Readiness, embeddable_backends, recommended_backends, supported_backends,
};
pub use reactor::signal::feed_signal;
pub use reactor::stat::StatAttrs;
pub use reactor::wakeup::AsyncSender;
pub use reactor::watcher::{Callback, MAXPRI, MINPRI, RescheduleFn, WatcherId};
pub use time::{Clock, ManualClock, SystemClock};
