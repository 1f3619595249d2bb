//! Time utilities.
//!
//! - [`Clock`] and its implementations [`SystemClock`] and [`ManualClock`]
//! - [`time`] for the current wall-clock time
//! - [`sleep`] for blocking the calling thread
//!
//! All times are `f64` seconds ([`Timestamp`](crate::Timestamp)).
//!
//! # Example
//!
//! ```ignore
//! use evloop::time::{sleep, time};
//!
//! let start = time();
//! sleep(0.01);
//! assert!(time() - start >= 0.01);
//! ```

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::reactor::Timestamp;

use std::time::Duration;

/// Current wall-clock time in seconds since the Unix epoch.
pub fn time() -> Timestamp {
    SystemClock.realtime()
}

/// Blocks the calling thread for `delay` seconds. Non-positive delays return
/// immediately.
pub fn sleep(delay: Timestamp) {
    if delay > 0.0 && delay.is_finite() {
        std::thread::sleep(Duration::from_secs_f64(delay));
    }
}
