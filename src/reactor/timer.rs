//! Relative timers and wall-clock periodics.
//!
//! Timers live in a heap keyed by monotonic time, periodics in one keyed by
//! wall-clock time. Both store absolute deadlines while active; an inactive
//! timer keeps its deadline relative to "now".

use crate::reactor::Timestamp;
use crate::reactor::core::Loop;
use crate::reactor::event::Events;
use crate::reactor::watcher::{Kind, RescheduleFn, WatcherId};

/// Smallest periodic interval; shorter ones are rounded up.
const MIN_INTERVAL: Timestamp = 1.0 / 8192.0;

/// Expirations a repeating timer may accumulate before it is moved to "now"
/// instead of catching up interval by interval.
const MAX_CATCHUP: u32 = 1 << 16;

/// Next multiple of `interval` (counted from `offset`) strictly after `now`.
fn recalc(offset: Timestamp, interval: Timestamp, now: Timestamp) -> Timestamp {
    let interval = interval.max(MIN_INTERVAL);
    let mut at = offset + interval * ((now - offset) / interval).floor();

    while at <= now {
        let next = at + interval;

        // interval too small to move at this magnitude
        if next == at {
            at = now;
            break;
        }

        at = next;
    }

    at
}

impl Loop {
    /// Timer firing `after` seconds from start, then every `repeat` seconds
    /// (`repeat == 0` means once).
    ///
    /// # Example
    /// ```ignore
    /// let t = lp.timer(0.5, 1.0, |lp, id, _| {
    ///     if lp.timer_expirations(id) > 1 {
    ///         println!("running late");
    ///     }
    /// });
    /// lp.start(t);
    /// ```
    pub fn timer<F>(&mut self, after: Timestamp, repeat: Timestamp, cb: F) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        debug_assert!(repeat >= 0.0, "negative timer repeat");

        self.insert_user(
            Kind::Timer {
                at: after,
                repeat,
                expirations: 0,
            },
            cb,
        )
    }

    /// Reconfigures an inactive timer.
    pub fn timer_set(&mut self, id: WatcherId, after: Timestamp, repeat: Timestamp) {
        debug_assert!(!self.is_active(id), "timer_set on active timer");

        if let Some(w) = self.watchers.get_mut(id.0)
            && let Kind::Timer {
                at, repeat: wrepeat, ..
            } = &mut w.kind
        {
            *at = after;
            *wrepeat = repeat;
        }
    }

    pub(crate) fn timer_start(&mut self, id: WatcherId) {
        let mn_now = self.time.mn_now;
        let Some(w) = self.watchers.get_mut(id.0) else {
            return;
        };
        let Kind::Timer { at, repeat, .. } = &mut w.kind else {
            return;
        };

        *at += mn_now;
        let at = *at;
        debug_assert!(*repeat >= 0.0, "negative timer repeat");

        self.activate(id);
        self.timers.push(at, id, &mut self.watchers);
    }

    pub(crate) fn timer_stop(&mut self, id: WatcherId, slot: usize) {
        self.timers.remove(slot, &mut self.watchers);

        let mn_now = self.time.mn_now;
        if let Some(w) = self.watchers.get_mut(id.0)
            && let Kind::Timer { at, .. } = &mut w.kind
        {
            *at -= mn_now;
        }
    }

    /// Restarts a repeating timer `repeat` seconds from now, or stops it if
    /// it does not repeat.
    ///
    /// Useful as an inactivity timeout: call it whenever there is activity.
    pub fn timer_again(&mut self, id: WatcherId) {
        self.clear_pending(id);

        let Some(w) = self.watchers.get(id.0) else {
            return;
        };
        let Kind::Timer { repeat, .. } = w.kind else {
            return;
        };
        let (active, slot) = (w.is_active(), w.active);

        if active {
            if repeat > 0.0 {
                let deadline = self.time.mn_now + repeat;
                if let Some(w) = self.watchers.get_mut(id.0) {
                    w.set_at(deadline);
                }
                self.timers.set_at(slot, deadline, &mut self.watchers);
            } else {
                self.stop(id);
            }
        } else if repeat > 0.0 {
            self.timer_set(id, repeat, repeat);
            self.start(id);
        }
    }

    /// Seconds until the timer fires; for an inactive timer, the configured
    /// delay.
    pub fn timer_remaining(&self, id: WatcherId) -> Timestamp {
        match self.watchers.get(id.0) {
            Some(w) => match w.kind {
                Kind::Timer { at, .. } if w.is_active() => at - self.time.mn_now,
                Kind::Timer { at, .. } => at,
                _ => 0.0,
            },
            None => 0.0,
        }
    }

    /// Changes the repeat interval; takes effect at the next expiry.
    pub fn set_timer_repeat(&mut self, id: WatcherId, repeat: Timestamp) {
        if let Some(w) = self.watchers.get_mut(id.0)
            && let Kind::Timer { repeat: wrepeat, .. } = &mut w.kind
        {
            *wrepeat = repeat;
        }
    }

    /// How many times the timer expired since its callback last ran. More
    /// than one means the loop fell behind.
    pub fn timer_expirations(&self, id: WatcherId) -> u32 {
        match self.watchers.get(id.0).map(|w| &w.kind) {
            Some(Kind::Timer { expirations, .. }) => *expirations,
            _ => 0,
        }
    }

    pub(crate) fn timers_reify(&mut self) {
        while let Some(top) = self.timers.top()
            && top.at < self.time.mn_now
        {
            let id = top.item;
            let Some(w) = self.watchers.get_mut(id.0) else {
                break;
            };
            let Kind::Timer {
                at,
                repeat,
                expirations,
            } = &mut w.kind
            else {
                break;
            };

            *expirations = expirations.saturating_add(1);

            if *repeat > 0.0 {
                let next = *at + *repeat;
                // one interval per expiry; snap to now when that cannot progress
                *at = if next <= *at || *expirations >= MAX_CATCHUP {
                    self.time.mn_now
                } else {
                    next
                };
                let at = *at;
                self.timers.set_at(1, at, &mut self.watchers);
            } else {
                self.stop(id);
            }

            self.feed_reverse(id);
        }

        self.feed_reverse_done(Events::TIMER);
    }

    /// Moves every active timer by `offset`, after the clock jumped or the
    /// process was suspended.
    pub(crate) fn timers_reschedule(&mut self, offset: Timestamp) {
        for k in 0..self.timers.len() {
            let Some(node) = self.timers.get(k + 1) else {
                continue;
            };
            let at = node.at + offset;

            self.timers.set_at_unordered(k, at);
            if let Some(w) = self.watchers.get_mut(node.item.0) {
                w.set_at(at);
            }
        }
    }

    /// Periodic firing at `offset + k * interval` in wall-clock time, or
    /// once at `offset` when `interval` is 0.
    ///
    /// With a `reschedule` function, every deadline is computed by calling it
    /// with the current wall-clock time; it must return a later time.
    ///
    /// # Example
    /// ```ignore
    /// // on every full hour
    /// let p = lp.periodic(0.0, 3600.0, None, |_, _, _| println!("tick"));
    /// lp.start(p);
    /// ```
    pub fn periodic<F>(
        &mut self,
        offset: Timestamp,
        interval: Timestamp,
        reschedule: Option<RescheduleFn>,
        cb: F,
    ) -> WatcherId
    where
        F: FnMut(&mut Loop, WatcherId, Events) + 'static,
    {
        self.insert_user(
            Kind::Periodic {
                at: 0.0,
                offset,
                interval,
                reschedule,
            },
            cb,
        )
    }

    /// Reconfigures an inactive periodic.
    pub fn periodic_set(
        &mut self,
        id: WatcherId,
        offset: Timestamp,
        interval: Timestamp,
        reschedule: Option<RescheduleFn>,
    ) {
        debug_assert!(!self.is_active(id), "periodic_set on active periodic");

        if let Some(w) = self.watchers.get_mut(id.0)
            && let Kind::Periodic {
                offset: woffset,
                interval: winterval,
                reschedule: wreschedule,
                ..
            } = &mut w.kind
        {
            *woffset = offset;
            *winterval = interval;
            *wreschedule = reschedule;
        }
    }

    /// Next deadline of the periodic, `None` if it is not one, or `Some` of
    /// the stale value while it is stopped.
    fn periodic_next(&self, id: WatcherId) -> Option<Timestamp> {
        let now = self.time.rt_now;

        match &self.watchers.get(id.0)?.kind {
            Kind::Periodic {
                reschedule: Some(f),
                ..
            } => {
                let at = f(now);
                debug_assert!(at >= now, "periodic rescheduled into the past");
                Some(at.max(now))
            }
            Kind::Periodic {
                offset, interval, ..
            } if *interval > 0.0 => Some(recalc(*offset, *interval, now)),
            Kind::Periodic { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    pub(crate) fn periodic_start(&mut self, id: WatcherId) {
        let Some(at) = self.periodic_next(id) else {
            return;
        };

        if let Some(w) = self.watchers.get_mut(id.0) {
            w.set_at(at);
        }

        self.activate(id);
        self.periodics.push(at, id, &mut self.watchers);
    }

    pub(crate) fn periodic_stop(&mut self, slot: usize) {
        self.periodics.remove(slot, &mut self.watchers);
    }

    /// Stops and restarts the periodic, recomputing its deadline.
    pub fn periodic_again(&mut self, id: WatcherId) {
        self.stop(id);
        self.start(id);
    }

    /// Absolute wall-clock time of the next (or last) expiry.
    pub fn periodic_at(&self, id: WatcherId) -> Timestamp {
        match self.watchers.get(id.0).map(|w| &w.kind) {
            Some(Kind::Periodic { at, .. }) => *at,
            _ => 0.0,
        }
    }

    pub(crate) fn periodics_reify(&mut self) {
        while let Some(top) = self.periodics.top()
            && top.at < self.time.rt_now
        {
            let id = top.item;
            let one_shot = matches!(
                self.watchers.get(id.0).map(|w| &w.kind),
                Some(Kind::Periodic {
                    reschedule: None,
                    interval,
                    ..
                }) if *interval <= 0.0
            );

            if one_shot {
                self.stop(id);
            } else if let Some(at) = self.periodic_next(id) {
                if let Some(w) = self.watchers.get_mut(id.0) {
                    w.set_at(at);
                }
                self.periodics.set_at(1, at, &mut self.watchers);
            }

            self.feed_reverse(id);
        }

        self.feed_reverse_done(Events::PERIODIC);
    }

    /// Recomputes every periodic deadline after the wall clock changed.
    pub(crate) fn periodics_reschedule(&mut self) {
        for k in 0..self.periodics.len() {
            let Some(node) = self.periodics.get(k + 1) else {
                continue;
            };

            // absolute periodics recompute to their unchanged offset
            if let Some(at) = self.periodic_next(node.item) {
                self.periodics.set_at_unordered(k, at);
                if let Some(w) = self.watchers.get_mut(node.item.0) {
                    w.set_at(at);
                }
            }
        }

        self.periodics.rebuild(&mut self.watchers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recalc_next_multiple() {
        assert_eq!(recalc(0.0, 10.0, 25.0), 30.0);
        assert_eq!(recalc(5.0, 10.0, 25.0), 35.0);
        // exactly on a boundary moves to the next one
        assert_eq!(recalc(0.0, 10.0, 30.0), 40.0);
    }

    #[test]
    fn test_recalc_clamps_interval() {
        let at = recalc(0.0, 0.0, 1.0);
        assert!(at > 1.0);
        assert!(at - 1.0 <= MIN_INTERVAL);
    }
}
