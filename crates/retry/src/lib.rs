//! Adaptive retry support
//!
//! Leaf components that callers use to decide *when* to retry an operation
//! against a flaky upstream. Nothing here retries on its own: callers ask
//! `BackoffCalculator` for the next delay, feed failures into
//! `ErrorCorrelationAnalyzer` to spot systemic breakage, and record every
//! attempt in `RetryMetricsCollector` for reporting.
//!
//! All three are plain owned state (`&mut self`); share them behind a lock
//! if more than one task needs them.

pub mod backoff;
pub mod class;
pub mod collector;
pub mod correlation;

pub use backoff::{BackoffCalculator, BackoffStats};
pub use class::{ErrorClass, classify_status};
pub use collector::{RetryMetricsCollector, RetrySummary};
pub use correlation::ErrorCorrelationAnalyzer;
