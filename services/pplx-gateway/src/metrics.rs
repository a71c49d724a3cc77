//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `status`, `mode`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_attempts_total` (counter): label `outcome`
//! - `gateway_upstream_errors_total` (counter): label `error_type`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// Streaming responses can stay open for minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the global recorder and return the handle `/metrics` renders from.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a finished chat request. `mode` is `buffered`, `invalid`, or one of
/// `stream`, `stream_aborted` and `stream_cancelled` for committed streams.
pub fn record_request(status: u16, mode: &'static str, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status.clone(), "mode" => mode)
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status).record(duration_secs);
}

/// Record one failover attempt: `success`, `retryable` or `fatal`.
pub fn record_attempt(outcome: &'static str) {
    metrics::counter!("gateway_attempts_total", "outcome" => outcome).increment(1);
}

pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type).increment(1);
}
