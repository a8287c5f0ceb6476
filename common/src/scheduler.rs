//! Cooperative waiting.
//!
//! Nothing in the node blocks outside [`run_for`]. Each pass of the wait
//! loop runs the maintenance step (watchdog, LED, broker, telemetry) so a
//! bounded wait never starves the watchdog.

use crate::clock::{elapsed, Millis};

pub trait Maintenance {
    fn now_ms(&self) -> Millis;

    /// One pass of background work. Must not block and must not wait.
    fn maintain(&mut self);

    /// Yields between passes.
    fn pause(&mut self);
}

/// Busy-polls `task` until `duration_ms` has elapsed. Runs at least one pass.
pub fn run_for<T: Maintenance + ?Sized>(task: &mut T, duration_ms: Millis) {
    let start = task.now_ms();
    loop {
        task.maintain();
        if elapsed(task.now_ms(), start) >= duration_ms {
            break;
        }
        task.pause();
    }
}

/// Rate-limits watchdog feeds to once per interval.
#[derive(Debug, Clone)]
pub struct FeedCadence {
    interval_ms: Millis,
    last_feed: Option<Millis>,
}

impl FeedCadence {
    pub fn new(interval_ms: Millis) -> Self {
        Self {
            interval_ms,
            last_feed: None,
        }
    }

    /// Returns true, and records `now`, when a feed is due.
    pub fn due(&mut self, now: Millis) -> bool {
        match self.last_feed {
            Some(mark) if elapsed(now, mark) < self.interval_ms => false,
            _ => {
                self.last_feed = Some(now);
                true
            }
        }
    }

    /// Records a feed performed outside the cadence.
    pub fn fed(&mut self, now: Millis) {
        self.last_feed = Some(now);
    }
}
