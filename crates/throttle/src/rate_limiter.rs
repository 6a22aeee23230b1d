//! Sliding-window rate limiter
//!
//! Admits at most `calls` operations in any trailing `period`. The window is
//! a sorted queue of admission timestamps; stale entries are cut off with a
//! binary search before every decision. A denial never waits: it reports
//! how long until the oldest admission leaves the window and lets the caller
//! decide (or use `wait_for_token`).
//!
//! A single tokio Mutex guards all window state, reads included. Its FIFO
//! wake order is the only fairness guarantee between competing callers.
//!
//! With a `StateStore` attached, the window is loaded once before first use
//! and saved on every denial, on every `SAVE_EVERY`th admission, and on
//! `close()`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::{StateStore, WindowSnapshot};

/// Admissions between periodic saves.
const SAVE_EVERY: u64 = 100;

/// Smallest `retry_after` reported for a full window.
const MIN_RETRY_AFTER: Duration = Duration::from_millis(1);

/// Point-in-time view of a limiter, as reported by `RateLimiter::metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterMetrics {
    pub key: String,
    pub calls: usize,
    pub period_secs: f64,
    pub total_requests: u64,
    pub total_throttled: u64,
    pub current_usage: usize,
    pub max_concurrent: usize,
    /// Seconds until the next admission is possible (0 with free capacity)
    pub window_reset_secs: f64,
    /// `current_usage / calls * 100`
    pub utilization: f64,
    pub is_closed: bool,
}

#[derive(Debug)]
struct WindowState {
    timestamps: VecDeque<f64>,
    total_requests: u64,
    total_throttled: u64,
    max_concurrent: usize,
    last_reset: f64,
}

impl WindowState {
    fn new(now: f64) -> Self {
        Self {
            timestamps: VecDeque::new(),
            total_requests: 0,
            total_throttled: 0,
            max_concurrent: 0,
            last_reset: now,
        }
    }

    /// Drop every timestamp at or before `now - period`.
    fn cleanup(&mut self, now: f64, period: f64) {
        let window_start = now - period;
        let stale = self.timestamps.partition_point(|&t| t <= window_start);
        if stale > 0 {
            self.timestamps.drain(..stale);
        }
    }

    fn retry_after(&self, now: f64, calls: usize, period: f64) -> Duration {
        if self.timestamps.len() < calls {
            return Duration::ZERO;
        }
        let Some(&oldest) = self.timestamps.front() else {
            return Duration::ZERO;
        };
        let until_slot = oldest - (now - period);
        Duration::from_secs_f64(until_slot.max(0.0)).max(MIN_RETRY_AFTER)
    }

    fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            request_timestamps: self.timestamps.iter().copied().collect(),
            total_requests: self.total_requests,
            total_throttled: self.total_throttled,
            max_concurrent: self.max_concurrent,
            last_reset: self.last_reset,
        }
    }

    /// Adopt a persisted snapshot, keeping only timestamps inside
    /// `(now - period, now]` and at most `calls` of the newest.
    fn restore(&mut self, snapshot: WindowSnapshot, now: f64, calls: usize, period: f64) {
        let mut timestamps: Vec<f64> = snapshot
            .request_timestamps
            .into_iter()
            .filter(|&t| t > now - period && t <= now)
            .collect();
        timestamps.sort_by(f64::total_cmp);
        if timestamps.len() > calls {
            timestamps.drain(..timestamps.len() - calls);
        }
        self.timestamps = timestamps.into();
        self.total_requests = snapshot.total_requests;
        self.total_throttled = snapshot.total_throttled.min(snapshot.total_requests);
        self.max_concurrent = snapshot.max_concurrent;
        self.last_reset = snapshot.last_reset;
    }
}

/// Sliding-window admission controller.
pub struct RateLimiter {
    key: String,
    calls: usize,
    period: Duration,
    store: Option<Arc<dyn StateStore>>,
    loaded: OnceCell<()>,
    closed: AtomicBool,
    clock: Clock,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    /// Create a limiter admitting `calls` operations per `period`.
    ///
    /// Both must be non-zero. The key defaults to `rate_limiter_<uuid>`; set
    /// a stable one with `with_key` when persisting state.
    pub fn new(calls: usize, period: Duration) -> Result<Self> {
        if calls == 0 {
            return Err(Error::InvalidConfig("calls must be positive".into()));
        }
        if period.is_zero() {
            return Err(Error::InvalidConfig("period must be positive".into()));
        }
        let clock = Clock::new();
        Ok(Self {
            key: format!("rate_limiter_{}", uuid::Uuid::new_v4()),
            calls,
            period,
            store: None,
            loaded: OnceCell::new(),
            closed: AtomicBool::new(false),
            state: Mutex::new(WindowState::new(clock.now())),
            clock,
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("rate limiter"));
        }
        Ok(())
    }

    fn period_secs(&self) -> f64 {
        self.period.as_secs_f64()
    }

    /// Load persisted state exactly once. A failed load is logged and the
    /// limiter starts with an empty window.
    async fn ensure_loaded(&self) {
        let Some(store) = &self.store else {
            return;
        };
        self.loaded
            .get_or_init(|| async {
                match store.load(&self.key).await {
                    Ok(Some(snapshot)) => {
                        let mut state = self.state.lock().await;
                        state.restore(snapshot, self.clock.now(), self.calls, self.period_secs());
                        info!(
                            key = %self.key,
                            in_window = state.timestamps.len(),
                            "restored rate window"
                        );
                    }
                    Ok(None) => debug!(key = %self.key, "no saved rate window"),
                    Err(e) => {
                        warn!(key = %self.key, error = %e, "failed to load rate window, starting empty")
                    }
                }
            })
            .await;
    }

    async fn persist(&self, state: &WindowState) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&self.key, &state.snapshot()).await,
            None => Ok(()),
        }
    }

    /// Try to take one admission from the window.
    ///
    /// Fails with `AdmissionDenied` when the window already holds `calls`
    /// entries; every call counts toward `total_requests`.
    pub async fn acquire(&self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_loaded().await;

        let mut state = self.state.lock().await;
        self.ensure_open()?;

        let now = self.clock.now();
        let period = self.period_secs();
        state.cleanup(now, period);

        state.total_requests += 1;
        let usage = state.timestamps.len();
        state.max_concurrent = state.max_concurrent.max(usage);

        if usage >= self.calls {
            state.total_throttled += 1;
            let retry_after = state.retry_after(now, self.calls, period);
            metrics::counter!("throttle_denials_total", "limiter" => self.key.clone())
                .increment(1);
            debug!(
                key = %self.key,
                retry_after_ms = retry_after.as_millis() as u64,
                "admission denied"
            );
            if let Err(e) = self.persist(&state).await {
                warn!(key = %self.key, error = %e, "failed to persist rate window");
            }
            return Err(Error::AdmissionDenied { retry_after });
        }

        state.timestamps.push_back(now);
        metrics::counter!("throttle_admissions_total", "limiter" => self.key.clone())
            .increment(1);

        let admitted = state.total_requests.saturating_sub(state.total_throttled);
        if admitted % SAVE_EVERY == 0
            && let Err(e) = self.persist(&state).await
        {
            warn!(key = %self.key, error = %e, "failed to persist rate window");
        }
        Ok(())
    }

    /// Acquire, sleeping through denials.
    ///
    /// Returns `Ok(false)` if `timeout` elapses first, `Ok(true)` once
    /// admitted. Without a timeout this waits as long as it takes.
    pub async fn wait_for_token(&self, timeout: Option<Duration>) -> Result<bool> {
        self.ensure_open()?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            match self.acquire().await {
                Ok(()) => return Ok(true),
                Err(Error::AdmissionDenied { retry_after }) => {
                    let wait = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                debug!(key = %self.key, "gave up waiting for admission");
                                return Ok(false);
                            }
                            retry_after.min(remaining)
                        }
                        None => retry_after,
                    };
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Time until the next admission is possible.
    pub async fn retry_after(&self) -> Duration {
        self.ensure_loaded().await;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.cleanup(now, self.period_secs());
        state.retry_after(now, self.calls, self.period_secs())
    }

    /// Admissions left in the current window.
    pub async fn capacity(&self) -> usize {
        self.ensure_loaded().await;
        let mut state = self.state.lock().await;
        state.cleanup(self.clock.now(), self.period_secs());
        self.calls.saturating_sub(state.timestamps.len())
    }

    pub async fn metrics(&self) -> Result<LimiterMetrics> {
        self.ensure_open()?;
        self.ensure_loaded().await;

        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let period = self.period_secs();
        state.cleanup(now, period);

        let usage = state.timestamps.len();
        Ok(LimiterMetrics {
            key: self.key.clone(),
            calls: self.calls,
            period_secs: period,
            total_requests: state.total_requests,
            total_throttled: state.total_throttled,
            current_usage: usage,
            max_concurrent: state.max_concurrent,
            window_reset_secs: state.retry_after(now, self.calls, period).as_secs_f64(),
            utilization: usage as f64 / self.calls as f64 * 100.0,
            is_closed: self.is_closed(),
        })
    }

    /// Zero the counters. The window itself is untouched.
    pub async fn reset_metrics(&self) {
        let mut state = self.state.lock().await;
        state.total_requests = 0;
        state.total_throttled = 0;
        state.max_concurrent = 0;
        state.last_reset = self.clock.now();
        debug!(key = %self.key, "reset limiter counters");
    }

    /// Close the limiter, flushing final state once.
    ///
    /// Idempotent. The pending lazy load is completed first so a limiter
    /// that was never used does not overwrite persisted state with an empty
    /// window.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ensure_loaded().await;
        let state = self.state.lock().await;
        let result = self.persist(&state).await;
        info!(key = %self.key, total_requests = state.total_requests, "rate limiter closed");
        result
    }
}
