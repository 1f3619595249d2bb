//! Clock sources a loop reads its notion of time from.
//!
//! [`SystemClock`] reads the operating system clocks. [`ManualClock`] is a
//! simulated clock for tests and replay: it only moves when told to, and can
//! make the wall clock jump independently of the monotonic one.

use crate::reactor::Timestamp;

use std::cell::Cell;
use std::rc::Rc;

/// Source of wall-clock and monotonic time, in seconds.
pub trait Clock {
    /// Wall-clock time since the Unix epoch.
    fn realtime(&self) -> Timestamp;

    /// Monotonic time, or `None` when no monotonic clock is available.
    fn monotonic(&self) -> Option<Timestamp>;
}

fn clock_gettime(id: libc::clockid_t) -> Option<Timestamp> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    if unsafe { libc::clock_gettime(id, &mut ts) } != 0 {
        return None;
    }

    Some(ts.tv_sec as Timestamp + ts.tv_nsec as Timestamp * 1e-9)
}

/// Operating system clocks (`CLOCK_REALTIME` and `CLOCK_MONOTONIC`).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn realtime(&self) -> Timestamp {
        clock_gettime(libc::CLOCK_REALTIME).unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        })
    }

    fn monotonic(&self) -> Option<Timestamp> {
        clock_gettime(libc::CLOCK_MONOTONIC)
    }
}

#[derive(Debug)]
struct ManualState {
    realtime: Cell<Timestamp>,
    monotonic: Cell<Timestamp>,
    has_monotonic: Cell<bool>,
}

/// Simulated clock. Clones share the same time.
///
/// # Example
/// ```ignore
/// let clock = ManualClock::new(1000.0);
/// let lp = LoopBuilder::new().clock(clock.clone()).build()?;
/// clock.advance(5.0);
/// ```
#[derive(Clone, Debug)]
pub struct ManualClock {
    state: Rc<ManualState>,
}

impl ManualClock {
    /// Creates a clock whose wall and monotonic time both start at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            state: Rc::new(ManualState {
                realtime: Cell::new(start),
                monotonic: Cell::new(start),
                has_monotonic: Cell::new(true),
            }),
        }
    }

    /// Moves both clocks forward.
    pub fn advance(&self, secs: Timestamp) {
        let s = &self.state;
        s.realtime.set(s.realtime.get() + secs);
        s.monotonic.set(s.monotonic.get() + secs);
    }

    /// Moves only the wall clock, as if the system time had been set.
    pub fn jump_wall(&self, secs: Timestamp) {
        let s = &self.state;
        s.realtime.set(s.realtime.get() + secs);
    }

    /// Makes [`Clock::monotonic`] report `None`. Takes effect for loops
    /// created afterwards.
    pub fn disable_monotonic(&self) {
        self.state.has_monotonic.set(false);
    }

    pub fn now(&self) -> Timestamp {
        self.state.realtime.get()
    }
}

impl Clock for ManualClock {
    fn realtime(&self) -> Timestamp {
        self.state.realtime.get()
    }

    fn monotonic(&self) -> Option<Timestamp> {
        self.state
            .has_monotonic
            .get()
            .then(|| self.state.monotonic.get())
    }
}
