//! Exponential backoff with self-tuning jitter
//!
//! `next_delay` doubles from `base_delay` per attempt up to `max_delay`,
//! stretches the delay further for persistent rate limits and timeouts, then
//! applies symmetric jitter. `record_result` tunes the jitter width: long
//! success streaks widen it (spread retries out), failure streaks narrow it
//! (retry closer to the computed delay).

use std::collections::HashMap;
use std::time::Duration;

use rand::RngExt;
use serde::Serialize;
use tracing::debug;

use crate::class::ErrorClass;

const DEFAULT_JITTER: f64 = 0.1;
const MIN_JITTER: f64 = 0.01;
const MAX_JITTER: f64 = 0.5;

/// Consecutive successes before jitter widens.
const SUCCESS_STREAK_TO_WIDEN: u32 = 5;
/// Consecutive failures before jitter narrows.
const FAILURE_STREAK_TO_NARROW: u32 = 3;
/// Errors of one class after which that class counts as persistent.
const PERSISTENT_ERROR_THRESHOLD: u64 = 3;

/// Snapshot of the delays issued so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackoffStats {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub avg_delay: Duration,
    pub current_jitter: f64,
    pub delays_issued: u64,
}

/// Backoff state for one logical retry session.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    base_delay: f64,
    max_delay: f64,
    jitter_factor: f64,
    success_streak: u32,
    failure_streak: u32,
    error_counts: HashMap<ErrorClass, u64>,
    issued: u64,
    min_issued: f64,
    max_issued: f64,
    sum_issued: f64,
    last_delay: Option<Duration>,
}

impl BackoffCalculator {
    /// `max_delay` below `base_delay` is raised to `base_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        let base_delay = base_delay.as_secs_f64();
        Self {
            base_delay,
            max_delay: max_delay.as_secs_f64().max(base_delay),
            jitter_factor: DEFAULT_JITTER,
            success_streak: 0,
            failure_streak: 0,
            error_counts: HashMap::new(),
            issued: 0,
            min_issued: 0.0,
            max_issued: 0.0,
            sum_issued: 0.0,
            last_delay: None,
        }
    }

    /// Delay to sleep before retry number `attempt` (0-based).
    ///
    /// When `class` is given it is counted before the delay is computed, so
    /// the fourth rate-limit error in a session is the first "persistent" one.
    pub fn next_delay(&mut self, attempt: u32, class: Option<&ErrorClass>) -> Duration {
        if let Some(class) = class {
            *self.error_counts.entry(class.clone()).or_insert(0) += 1;
        }

        let exponent = attempt.min(64) as i32;
        let mut delay = (self.base_delay * 2f64.powi(exponent)).min(self.max_delay);

        match class {
            Some(ErrorClass::RateLimit) => {
                let persistent =
                    self.error_count(&ErrorClass::RateLimit) > PERSISTENT_ERROR_THRESHOLD;
                let factor = if persistent { 2.0 } else { 1.5 };
                delay = (delay * factor).min(self.max_delay);
            }
            Some(ErrorClass::Timeout)
                if self.error_count(&ErrorClass::Timeout) > PERSISTENT_ERROR_THRESHOLD =>
            {
                delay = (delay * 1.5).min(self.max_delay);
            }
            _ => {}
        }

        let spread = delay * self.jitter_factor;
        let jittered = delay + rand::rng().random_range(-1.0..=1.0) * spread;
        let delay = jittered.min(self.max_delay).max(self.base_delay * 0.5);

        self.track(delay);
        let delay = Duration::from_secs_f64(delay);
        debug!(
            attempt,
            error_class = class.map(ErrorClass::as_str),
            delay_ms = delay.as_millis() as u64,
            "computed backoff delay"
        );
        delay
    }

    /// Feed back the outcome of an attempt to tune jitter.
    pub fn record_result(&mut self, success: bool) {
        if success {
            self.success_streak += 1;
            self.failure_streak = 0;
            if self.success_streak >= SUCCESS_STREAK_TO_WIDEN {
                self.jitter_factor = (self.jitter_factor * 1.5).min(MAX_JITTER);
                self.success_streak = 0;
            }
        } else {
            self.failure_streak += 1;
            self.success_streak = 0;
            if self.failure_streak >= FAILURE_STREAK_TO_NARROW {
                self.jitter_factor = (self.jitter_factor * 0.5).max(MIN_JITTER);
                self.failure_streak = 0;
            }
        }
    }

    pub fn stats(&self) -> BackoffStats {
        let avg = if self.issued == 0 {
            0.0
        } else {
            self.sum_issued / self.issued as f64
        };
        BackoffStats {
            min_delay: Duration::from_secs_f64(self.min_issued),
            max_delay: Duration::from_secs_f64(self.max_issued),
            avg_delay: Duration::from_secs_f64(avg),
            current_jitter: self.jitter_factor,
            delays_issued: self.issued,
        }
    }

    /// Number of errors of `class` recorded in this session.
    pub fn error_count(&self, class: &ErrorClass) -> u64 {
        self.error_counts.get(class).copied().unwrap_or(0)
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Forget streaks, error counts and delay history; jitter returns to default.
    pub fn reset(&mut self) {
        *self = Self {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            ..Self::new(Duration::ZERO, Duration::ZERO)
        };
    }

    fn track(&mut self, delay: f64) {
        if self.issued == 0 {
            self.min_issued = delay;
            self.max_issued = delay;
        } else {
            self.min_issued = self.min_issued.min(delay);
            self.max_issued = self.max_issued.max(delay);
        }
        self.issued += 1;
        self.sum_issued += delay;
        self.last_delay = Some(Duration::from_secs_f64(delay));
    }
}
