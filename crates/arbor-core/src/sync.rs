//! Periodic tick state with a soft minimum and hard maximum interval.
//!
//! The overlay wakes between `min` and `max` seconds to send keepalives
//! and to scan children for idleness. [`SyncTimer`] is pure arithmetic:
//! the driver asks for the next deadline, sleeps, and reports back when it
//! actually fired.

use std::time::{Duration, Instant};

/// Due-time arithmetic for the overlay sync tick.
#[derive(Debug, Clone, Copy)]
pub struct SyncTimer {
    min: Duration,
    max: Duration,
    last: Option<Instant>,
}

impl SyncTimer {
    /// Create a timer that is due every `min`, and never later than `max`
    /// after its last firing.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, last: None }
    }

    /// Earliest instant at which the tick should run. An unfired timer
    /// is due immediately.
    #[must_use]
    pub fn deadline(&self, now: Instant) -> Instant {
        match self.last {
            Some(last) => last + self.min,
            None => now,
        }
    }

    /// Latest acceptable instant for the tick.
    #[must_use]
    pub fn hard_deadline(&self, now: Instant) -> Instant {
        match self.last {
            Some(last) => last + self.max,
            None => now,
        }
    }

    /// Is the tick due at `now`?
    #[must_use]
    pub fn due(&self, now: Instant) -> bool {
        now >= self.deadline(now)
    }

    /// Has the tick been delayed past the hard maximum?
    #[must_use]
    pub fn overdue(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now >= last + self.max,
            None => false,
        }
    }

    /// Record a firing.
    pub fn fire(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfired_timer_is_due() {
        let t = SyncTimer::new(Duration::from_secs(1), Duration::from_secs(5));
        let now = Instant::now();
        assert!(t.due(now));
        assert!(!t.overdue(now));
        assert_eq!(t.deadline(now), now);
    }

    #[test]
    fn due_after_min() {
        let mut t = SyncTimer::new(Duration::from_secs(1), Duration::from_secs(5));
        let t0 = Instant::now();
        t.fire(t0);
        assert!(!t.due(t0));
        assert!(!t.due(t0 + Duration::from_millis(900)));
        assert!(t.due(t0 + Duration::from_secs(1)));
        assert_eq!(t.deadline(t0), t0 + Duration::from_secs(1));
    }

    #[test]
    fn overdue_after_max() {
        let mut t = SyncTimer::new(Duration::from_secs(1), Duration::from_secs(5));
        let t0 = Instant::now();
        t.fire(t0);
        assert!(!t.overdue(t0 + Duration::from_secs(4)));
        assert!(t.overdue(t0 + Duration::from_secs(5)));
        assert_eq!(t.hard_deadline(t0), t0 + Duration::from_secs(5));
    }

    #[test]
    fn max_clamped_to_min() {
        let t = SyncTimer::new(Duration::from_secs(5), Duration::from_secs(1));
        let now = Instant::now();
        assert_eq!(t.deadline(now), t.hard_deadline(now));
    }
}
