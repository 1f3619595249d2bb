//! Loop time bookkeeping and time-jump detection.
//!
//! The loop keeps two clocks: `mn_now` (monotonic, drives timers) and
//! `rt_now` (wall clock, drives periodics). With a monotonic source the wall
//! clock is only resampled every half `MIN_TIMEJUMP` and interpolated in
//! between; a change of the offset between the two beyond `MIN_TIMEJUMP`
//! means the wall clock was set and periodics are rescheduled. Without one,
//! the wall clock doubles as monotonic time and any jump is corrected by
//! shifting every timer.

use crate::reactor::Timestamp;
use crate::time::Clock;

/// Smallest wall-clock change treated as a jump.
pub(crate) const MIN_TIMEJUMP: Timestamp = 1.0;

/// What a time update detected.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Jump {
    None,
    /// The wall clock moved relative to the monotonic clock.
    Wall,
    /// No monotonic clock: timers must move by the given offset.
    Both(Timestamp),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LoopClock {
    pub(crate) rt_now: Timestamp,
    pub(crate) mn_now: Timestamp,
    pub(crate) now_floor: Timestamp,
    pub(crate) rtmn_diff: Timestamp,
    pub(crate) have_monotonic: bool,
}

impl LoopClock {
    pub(crate) fn new(clock: &dyn Clock) -> Self {
        let monotonic = clock.monotonic();
        let rt_now = clock.realtime();
        let mn_now = monotonic.unwrap_or(rt_now);

        Self {
            rt_now,
            mn_now,
            now_floor: mn_now,
            rtmn_diff: rt_now - mn_now,
            have_monotonic: monotonic.is_some(),
        }
    }

    /// Refreshes both clocks. `max_block` is how long the caller may have
    /// blocked since the last update; larger forward steps count as jumps.
    pub(crate) fn update(&mut self, clock: &dyn Clock, max_block: Timestamp) -> Jump {
        if self.have_monotonic {
            self.update_monotonic(clock)
        } else {
            self.update_realtime(clock, max_block)
        }
    }

    fn update_monotonic(&mut self, clock: &dyn Clock) -> Jump {
        let odiff = self.rtmn_diff;
        self.mn_now = clock.monotonic().unwrap_or(self.mn_now);

        if self.mn_now - self.now_floor < MIN_TIMEJUMP * 0.5 {
            self.rt_now = self.rtmn_diff + self.mn_now;
            return Jump::None;
        }

        self.now_floor = self.mn_now;
        self.rt_now = clock.realtime();

        // the two reads are not atomic, so retry a few times before deciding
        for _ in 0..3 {
            self.rtmn_diff = self.rt_now - self.mn_now;
            if (odiff - self.rtmn_diff).abs() < MIN_TIMEJUMP {
                return Jump::None;
            }

            self.rt_now = clock.realtime();
            self.mn_now = clock.monotonic().unwrap_or(self.mn_now);
            self.now_floor = self.mn_now;
        }

        Jump::Wall
    }

    fn update_realtime(&mut self, clock: &dyn Clock, max_block: Timestamp) -> Jump {
        self.rt_now = clock.realtime();

        let jump = if self.mn_now > self.rt_now
            || self.rt_now > self.mn_now + max_block + MIN_TIMEJUMP
        {
            Jump::Both(self.rt_now - self.mn_now)
        } else {
            Jump::None
        };

        self.mn_now = self.rt_now;
        jump
    }
}
