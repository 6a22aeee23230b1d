//! Window timestamps
//!
//! Timestamps are `f64` seconds on a monotonic clock anchored to wall time
//! when the owner is created. Within a process they never go backwards;
//! across restarts they stay comparable, so persisted windows survive a
//! restart. Reads go through `tokio::time::Instant` so paused-time tests
//! drive the window.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    origin: Instant,
    origin_secs: f64,
}

impl Clock {
    pub(crate) fn new() -> Self {
        let origin_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            origin: Instant::now(),
            origin_secs,
        }
    }

    pub(crate) fn now(&self) -> f64 {
        self.origin_secs + self.origin.elapsed().as_secs_f64()
    }
}
