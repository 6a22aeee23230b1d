//! Prometheus metrics exposition
//!
//! Besides the library counters (`throttle_*`, `batch_*`, `credential_*`,
//! `retry_*`) the service records:
//!
//! - `tollgate_wait_seconds` (histogram): labels `limiter`, `outcome`
//! - `tollgate_token_requests_total` (counter): label `outcome`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const WAIT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("tollgate_wait_seconds".to_string()),
            WAIT_BUCKETS,
        )
        .expect("failed to set histogram buckets")
        .set_buckets_for_metric(
            Matcher::Full("batch_size".to_string()),
            BATCH_SIZE_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Wait times and batch sizes get explicit buckets so they render as
/// Prometheus histograms rather than summaries.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record how long a `/wait` request blocked and whether it was admitted.
pub fn record_wait(limiter: &str, admitted: bool, duration_secs: f64) {
    let outcome = if admitted { "admitted" } else { "timeout" };
    metrics::histogram!(
        "tollgate_wait_seconds",
        "limiter" => limiter.to_string(),
        "outcome" => outcome
    )
    .record(duration_secs);
}

/// Record a token lookup: `ok`, `unknown_account` or `error`.
pub fn record_token_request(outcome: &'static str) {
    metrics::counter!("tollgate_token_requests_total", "outcome" => outcome).increment(1);
}
