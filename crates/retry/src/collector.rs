//! Retry metrics collection
//!
//! Append-only ledger of attempts keyed by logical request id, plus the
//! aggregates callers usually want: success rate, retries per request,
//! latency, error histogram and the current failure streak. Each attempt
//! is also emitted through the `metrics` facade:
//!
//! - `retry_attempts_total` (counter): labels `outcome`, `error_class`
//! - `retry_response_seconds` (histogram): label `outcome`

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::class::ErrorClass;

/// One recorded attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub request_id: String,
    pub response_time: Duration,
    pub error: Option<ErrorClass>,
    pub retry_count: u32,
    pub at: Instant,
}

/// Aggregated view over everything recorded so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrySummary {
    /// `1 - failed_attempts / total_attempts`, 1.0 with no attempts
    pub success_rate: f64,
    /// Mean over requests of the highest retry count seen for each
    pub avg_retries: f64,
    /// Mean over requests of each request's mean response time
    pub avg_response_time: Duration,
    pub error_counts: BTreeMap<String, u64>,
    pub avg_retry_interval: Duration,
    pub consecutive_failures: u64,
    pub time_since_last_success: Option<Duration>,
    /// Distinct request ids
    pub total_requests: usize,
    pub total_attempts: u64,
    pub failed_attempts: u64,
}

#[derive(Debug, Default)]
pub struct RetryMetricsCollector {
    ledger: Vec<AttemptRecord>,
    max_retries: HashMap<String, u32>,
    response_times: HashMap<String, Vec<Duration>>,
    error_counts: HashMap<ErrorClass, u64>,
    retry_intervals: Vec<Duration>,
    total_attempts: u64,
    failed_attempts: u64,
    consecutive_failures: u64,
    last_success: Option<Instant>,
}

impl RetryMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt of `request_id`.
    ///
    /// `error` is `None` for a successful attempt. `retry_count` is the
    /// retry number of this attempt; the collector keeps the maximum per id.
    pub fn record_attempt(
        &mut self,
        request_id: &str,
        response_time: Duration,
        error: Option<ErrorClass>,
        retry_count: u32,
    ) {
        let max = self.max_retries.entry(request_id.to_string()).or_insert(0);
        *max = (*max).max(retry_count);
        self.response_times
            .entry(request_id.to_string())
            .or_default()
            .push(response_time);

        self.total_attempts += 1;
        let outcome = match &error {
            Some(class) => {
                *self.error_counts.entry(class.clone()).or_insert(0) += 1;
                self.failed_attempts += 1;
                self.consecutive_failures += 1;
                "failure"
            }
            None => {
                self.consecutive_failures = 0;
                self.last_success = Some(Instant::now());
                "success"
            }
        };

        let class_label = error
            .as_ref()
            .map(|c| c.as_str().to_string())
            .unwrap_or_else(|| "none".to_string());
        metrics::counter!("retry_attempts_total", "outcome" => outcome, "error_class" => class_label)
            .increment(1);
        metrics::histogram!("retry_response_seconds", "outcome" => outcome)
            .record(response_time.as_secs_f64());

        self.ledger.push(AttemptRecord {
            request_id: request_id.to_string(),
            response_time,
            error,
            retry_count,
            at: Instant::now(),
        });
    }

    /// Record the time slept between two attempts.
    pub fn record_retry_interval(&mut self, interval: Duration) {
        self.retry_intervals.push(interval);
    }

    pub fn summary(&self) -> RetrySummary {
        let success_rate = if self.total_attempts == 0 {
            1.0
        } else {
            1.0 - self.failed_attempts as f64 / self.total_attempts as f64
        };

        let avg_retries = if self.max_retries.is_empty() {
            0.0
        } else {
            self.max_retries.values().map(|&r| r as f64).sum::<f64>()
                / self.max_retries.len() as f64
        };

        let avg_response_time = if self.response_times.is_empty() {
            Duration::ZERO
        } else {
            let sum_of_means: f64 = self
                .response_times
                .values()
                .map(|times| {
                    times.iter().map(Duration::as_secs_f64).sum::<f64>() / times.len() as f64
                })
                .sum();
            Duration::from_secs_f64(sum_of_means / self.response_times.len() as f64)
        };

        let avg_retry_interval = if self.retry_intervals.is_empty() {
            Duration::ZERO
        } else {
            self.retry_intervals.iter().sum::<Duration>() / self.retry_intervals.len() as u32
        };

        RetrySummary {
            success_rate,
            avg_retries,
            avg_response_time,
            error_counts: self
                .error_counts
                .iter()
                .map(|(class, count)| (class.as_str().to_string(), *count))
                .collect(),
            avg_retry_interval,
            consecutive_failures: self.consecutive_failures,
            time_since_last_success: self.last_success.map(|at| at.elapsed()),
            total_requests: self.max_retries.len(),
            total_attempts: self.total_attempts,
            failed_attempts: self.failed_attempts,
        }
    }

    /// Share of each error class among failed attempts.
    pub fn error_distribution(&self) -> HashMap<ErrorClass, f64> {
        let total: u64 = self.error_counts.values().sum();
        if total == 0 {
            return HashMap::new();
        }
        self.error_counts
            .iter()
            .map(|(class, count)| (class.clone(), *count as f64 / total as f64))
            .collect()
    }

    /// Number of requests per final retry count, zero-filled up to the max.
    pub fn retry_distribution(&self) -> BTreeMap<u32, usize> {
        let highest = self.max_retries.values().copied().max().unwrap_or(0);
        let mut distribution: BTreeMap<u32, usize> = (0..=highest).map(|n| (n, 0)).collect();
        for retries in self.max_retries.values() {
            *distribution.entry(*retries).or_insert(0) += 1;
        }
        distribution
    }

    /// Recorded attempts for one request, in order.
    pub fn attempts<'a>(&'a self, request_id: &'a str) -> impl Iterator<Item = &'a AttemptRecord> {
        self.ledger
            .iter()
            .filter(move |record| record.request_id == request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn empty_summary() {
        let collector = RetryMetricsCollector::new();
        let summary = collector.summary();
        assert_eq!(summary.success_rate, 1.0);
        assert_eq!(summary.avg_retries, 0.0);
        assert_eq!(summary.avg_response_time, Duration::ZERO);
        assert_eq!(summary.total_attempts, 0);
        assert!(summary.time_since_last_success.is_none());
        assert!(collector.error_distribution().is_empty());
        assert_eq!(collector.retry_distribution(), BTreeMap::from([(0, 0)]));
    }

    #[test]
    fn success_rate_counts_attempts() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("req-1", ms(100), Some(ErrorClass::Timeout), 0);
        collector.record_attempt("req-1", ms(100), Some(ErrorClass::Timeout), 1);
        collector.record_attempt("req-1", ms(100), None, 2);
        collector.record_attempt("req-2", ms(100), None, 0);

        let summary = collector.summary();
        assert_eq!(summary.total_attempts, 4);
        assert_eq!(summary.failed_attempts, 2);
        assert_eq!(summary.total_requests, 2);
        assert!((summary.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn avg_retries_uses_max_per_request() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("a", ms(10), Some(ErrorClass::Server), 0);
        collector.record_attempt("a", ms(10), Some(ErrorClass::Server), 1);
        collector.record_attempt("a", ms(10), None, 2);
        collector.record_attempt("b", ms(10), None, 0);

        assert!((collector.summary().avg_retries - 1.0).abs() < 1e-9);
    }

    #[test]
    fn retry_count_is_max_not_latest() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("a", ms(10), None, 3);
        collector.record_attempt("a", ms(10), None, 1);

        assert_eq!(collector.retry_distribution(), BTreeMap::from([(0, 0), (1, 0), (2, 0), (3, 1)]));
    }

    #[test]
    fn avg_response_time_is_mean_of_request_means() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("a", ms(100), None, 0);
        collector.record_attempt("a", ms(300), None, 1);
        collector.record_attempt("b", ms(400), None, 0);

        // a: 200ms, b: 400ms
        let avg = collector.summary().avg_response_time;
        assert!((avg.as_secs_f64() - 0.3).abs() < 1e-6, "avg {avg:?}");
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("a", ms(1), Some(ErrorClass::RateLimit), 0);
        collector.record_attempt("a", ms(1), Some(ErrorClass::RateLimit), 1);
        assert_eq!(collector.summary().consecutive_failures, 2);

        collector.record_attempt("a", ms(1), None, 2);
        let summary = collector.summary();
        assert_eq!(summary.consecutive_failures, 0);
        assert!(summary.time_since_last_success.is_some());
    }

    #[test]
    fn error_histogram_and_distribution() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("a", ms(1), Some(ErrorClass::Timeout), 0);
        collector.record_attempt("b", ms(1), Some(ErrorClass::Timeout), 0);
        collector.record_attempt("c", ms(1), Some(ErrorClass::Network), 0);

        let summary = collector.summary();
        assert_eq!(summary.error_counts["timeout"], 2);
        assert_eq!(summary.error_counts["network"], 1);

        let distribution = collector.error_distribution();
        assert!((distribution[&ErrorClass::Timeout] - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn retry_intervals_average() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_retry_interval(ms(100));
        collector.record_retry_interval(ms(300));
        assert_eq!(collector.summary().avg_retry_interval, ms(200));
    }

    #[test]
    fn ledger_keeps_attempts_in_order() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("a", ms(1), Some(ErrorClass::Server), 0);
        collector.record_attempt("b", ms(2), None, 0);
        collector.record_attempt("a", ms(3), None, 1);

        let retries: Vec<u32> = collector.attempts("a").map(|r| r.retry_count).collect();
        assert_eq!(retries, vec![0, 1]);
        assert_eq!(collector.attempts("missing").count(), 0);
    }

    #[test]
    fn summary_serializes() {
        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("a", ms(5), Some(ErrorClass::Auth), 0);
        let json = serde_json::to_value(collector.summary()).unwrap();
        assert_eq!(json["error_counts"]["auth"], 1);
        assert_eq!(json["total_attempts"], 1);
    }

    #[test]
    fn attempts_are_exported_as_metrics() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let mut collector = RetryMetricsCollector::new();
        collector.record_attempt("a", ms(20), Some(ErrorClass::RateLimit), 0);
        collector.record_attempt("a", ms(20), None, 1);

        let output = handle.render();
        assert!(output.contains("retry_attempts_total"), "output: {output}");
        assert!(output.contains("outcome=\"failure\""));
        assert!(output.contains("error_class=\"rate_limit\""));
        assert!(output.contains("outcome=\"success\""));
        assert!(output.contains("retry_response_seconds"));
    }
}
