//! Prometheus Metrics Definitions
//!
//! Defines all Hearth metrics with their labels and exposes the /metrics
//! endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<HearthMetrics>> = Lazy::new(HearthMetrics::new);

/// Container for all Hearth metrics.
#[derive(Clone)]
pub struct HearthMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Rate limiter decisions - labels: profile, decision (allowed/rejected/fail_open)
    pub rate_limit_decisions_total: CounterVec,

    /// Outbound HTTP attempts - labels: target, outcome
    pub http_attempts_total: CounterVec,

    /// Webhook delivery counter - labels: status (success/failure)
    pub webhook_deliveries_total: CounterVec,

    /// Usage reports sent to the billing provider - labels: outcome
    pub usage_reports_total: CounterVec,
}

impl HearthMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "hearth_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_requests_total: {}", e)))?,

            http_request_duration_seconds: register_histogram_vec!(
                "hearth_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_request_duration_seconds: {}", e)))?,

            rate_limit_decisions_total: register_counter_vec!(
                "hearth_rate_limit_decisions_total",
                "Rate limiter decisions by profile",
                &["profile", "decision"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register rate_limit_decisions_total: {}", e)))?,

            http_attempts_total: register_counter_vec!(
                "hearth_http_attempts_total",
                "Outbound HTTP attempts by target and outcome",
                &["target", "outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_attempts_total: {}", e)))?,

            webhook_deliveries_total: register_counter_vec!(
                "hearth_webhook_deliveries_total",
                "Total webhook deliveries",
                &["status"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register webhook_deliveries_total: {}", e)))?,

            usage_reports_total: register_counter_vec!(
                "hearth_usage_reports_total",
                "Usage reports sent to the billing provider",
                &["outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register usage_reports_total: {}", e)))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_rate_limit_decision(&self, profile: &str, decision: &str) {
        self.rate_limit_decisions_total
            .with_label_values(&[profile, decision])
            .inc();
    }

    pub fn record_http_attempt(&self, target: &str, outcome: &str) {
        self.http_attempts_total
            .with_label_values(&[target, outcome])
            .inc();
    }

    /// Record a webhook delivery.
    pub fn record_webhook_delivery(&self, success: bool) {
        let status = if success { "success" } else { "failure" };
        self.webhook_deliveries_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn record_usage_report(&self, outcome: &str) {
        self.usage_reports_total.with_label_values(&[outcome]).inc();
    }
}

/// Run `f` against the global metrics when they registered successfully.
pub(crate) fn with_metrics(f: impl FnOnce(&HearthMetrics)) {
    if let Ok(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    // Registration is lazy; touch it so an idle server still exports the families.
    Lazy::force(&METRICS);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}
