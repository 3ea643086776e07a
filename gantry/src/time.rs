//! Monotonic tick time, timed events and poll timers.
//!
//! All time is a wrapping `u32` tick count from the platform clock; the
//! conversion factor lives in [`TimeConversion`] and is runtime
//! configuration. Ordering is by wrapping subtraction, so intervals must
//! stay well below half the counter range.

use serde::{Deserialize, Serialize};

const HALF_RANGE: u32 = 1 << 31;

/// A point in time, in clock ticks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    pub const fn from_ticks(ticks: u32) -> Self {
        Self(ticks)
    }

    pub const fn ticks(self) -> u32 {
        self.0
    }

    pub const fn wrapping_add(self, ticks: u32) -> Self {
        Self(self.0.wrapping_add(ticks))
    }

    /// Ticks elapsed since `earlier`, assuming `earlier` is in the past.
    pub const fn ticks_since(self, earlier: Instant) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Whether this point has been reached at `now`.
    pub const fn reached_by(self, now: Instant) -> bool {
        now.0.wrapping_sub(self.0) < HALF_RANGE
    }
}

/// Seconds-to-ticks conversion for the platform clock.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeConversion {
    pub ticks_per_second: f32,
}

impl TimeConversion {
    pub fn ticks(&self, seconds: f32) -> u32 {
        (seconds * self.ticks_per_second) as u32
    }
}

/// A one-shot absolute deadline, fired at most once per arming.
///
/// Re-arming with [`TimedEvent::append_after_previous`] advances the
/// deadline relative to the previous one rather than to now, so periodic
/// events do not accumulate drift.
#[derive(Copy, Clone, Debug, Default)]
pub struct TimedEvent {
    deadline: Instant,
    armed: bool,
}

impl TimedEvent {
    pub const fn new() -> Self {
        Self {
            deadline: Instant::from_ticks(0),
            armed: false,
        }
    }

    pub fn append_at(&mut self, deadline: Instant) {
        self.deadline = deadline;
        self.armed = true;
    }

    pub fn append_after_previous(&mut self, interval: u32) {
        self.deadline = self.deadline.wrapping_add(interval);
        self.armed = true;
    }

    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// True exactly once per arming, when the deadline has passed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.armed && self.deadline.reached_by(now) {
            self.armed = false;
            true
        } else {
            false
        }
    }
}

/// Free-running expiry check for periodic low-priority work.
#[derive(Copy, Clone, Debug, Default)]
pub struct PollTimer {
    time: Instant,
}

impl PollTimer {
    pub fn set_to(&mut self, time: Instant) {
        self.time = time;
    }

    pub fn add_time(&mut self, interval: u32) {
        self.time = self.time.wrapping_add(interval);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.time.reached_by(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_order() {
        let near_wrap = Instant::from_ticks(u32::MAX - 10);
        let after = near_wrap.wrapping_add(20);
        assert!(near_wrap.reached_by(after));
        assert!(!after.reached_by(near_wrap));
        assert_eq!(after.ticks_since(near_wrap), 20);
    }

    #[test]
    fn event_fires_once() {
        let mut ev = TimedEvent::new();
        ev.append_at(Instant::from_ticks(100));
        assert!(!ev.poll(Instant::from_ticks(99)));
        assert!(ev.poll(Instant::from_ticks(100)));
        assert!(!ev.poll(Instant::from_ticks(101)));
    }

    #[test]
    fn reschedule_is_drift_free() {
        let mut ev = TimedEvent::new();
        ev.append_at(Instant::from_ticks(100));
        // Serviced late; the next deadline is still previous + interval.
        assert!(ev.poll(Instant::from_ticks(130)));
        ev.append_after_previous(50);
        assert!(ev.poll(Instant::from_ticks(150)));
    }

    #[test]
    fn poll_timer_period() {
        let mut timer = PollTimer::default();
        timer.set_to(Instant::from_ticks(1000));
        assert!(timer.is_expired(Instant::from_ticks(1000)));
        timer.add_time(500);
        assert!(!timer.is_expired(Instant::from_ticks(1200)));
        assert!(timer.is_expired(Instant::from_ticks(1500)));
    }
}
