//! Prometheus Metrics Definitions
//!
//! Registered once in the default registry and exposed at `/metrics`.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use tessera_core::{ConsistencyReport, RebuildReport};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Rebuild duration buckets (seconds)
const REBUILD_LATENCY_BUCKETS: &[f64] =
    &[0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<ApiResult<TesseraMetrics>> = Lazy::new(TesseraMetrics::new);

fn registration(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, e))
}

#[derive(Clone)]
pub struct TesseraMetrics {
    /// labels: method, path, status
    pub http_requests_total: CounterVec,

    /// labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// labels: operation, outcome (clean/errors)
    pub rebuild_runs_total: CounterVec,

    /// labels: operation
    pub rebuild_duration_seconds: HistogramVec,

    /// Last audit result. labels: kind (orphan_cache/orphan_attr/expired/total_attr/total_cache)
    pub consistency_rows: GaugeVec,

    /// Last audit inconsistency percentage
    pub consistency_inconsistency_percent: Gauge,

    /// labels: job, counter. Mirrors the atomic counters kept by the
    /// publisher, subscriber and sweep job.
    pub component_counters: GaugeVec,
}

impl TesseraMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "tessera_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "tessera_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration("http_request_duration_seconds", e))?,

            rebuild_runs_total: register_counter_vec!(
                "tessera_rebuild_runs_total",
                "Completed cache rebuild runs",
                &["operation", "outcome"]
            )
            .map_err(|e| registration("rebuild_runs_total", e))?,

            rebuild_duration_seconds: register_histogram_vec!(
                "tessera_rebuild_duration_seconds",
                "Cache rebuild duration in seconds",
                &["operation"],
                REBUILD_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration("rebuild_duration_seconds", e))?,

            consistency_rows: register_gauge_vec!(
                "tessera_consistency_rows",
                "Row counts from the most recent consistency audit",
                &["kind"]
            )
            .map_err(|e| registration("consistency_rows", e))?,

            consistency_inconsistency_percent: register_gauge!(
                "tessera_consistency_inconsistency_percent",
                "Inconsistency percentage from the most recent consistency audit"
            )
            .map_err(|e| registration("consistency_inconsistency_percent", e))?,

            component_counters: register_gauge_vec!(
                "tessera_component_counters",
                "Cumulative counters reported by background components",
                &["component", "counter"]
            )
            .map_err(|e| registration("component_counters", e))?,
        })
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_rebuild(&self, report: &RebuildReport) {
        let operation = report.operation_type.as_str();
        let outcome = if report.is_clean() { "clean" } else { "errors" };
        self.rebuild_runs_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.rebuild_duration_seconds
            .with_label_values(&[operation])
            .observe(report.duration_seconds);
    }

    pub fn record_consistency(&self, report: &ConsistencyReport) {
        let rows = [
            ("orphan_cache", report.orphan_cache_count),
            ("orphan_attr", report.orphan_attr_count),
            ("expired", report.expired_cache_count),
            ("total_attr", report.total_attr),
            ("total_cache", report.total_cache),
        ];
        for (kind, value) in rows {
            self.consistency_rows
                .with_label_values(&[kind])
                .set(value as f64);
        }
        self.consistency_inconsistency_percent
            .set(report.inconsistency_percentage);
    }

    /// Publish a component's counter snapshot.
    pub fn record_counters(&self, component: &str, counters: &[(&str, u64)]) {
        for (counter, value) in counters {
            self.component_counters
                .with_label_values(&[component, counter])
                .set(*value as f64);
        }
    }
}

/// Run `f` against the global metrics, logging once-per-call if
/// registration failed.
pub fn with_metrics(f: impl FnOnce(&TesseraMetrics)) {
    match METRICS.as_ref() {
        Ok(metrics) => f(metrics),
        Err(e) => tracing::debug!(error = %e, "Metrics unavailable"),
    }
}

/// Handler for GET /metrics. Returns Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    // Touch the registry so an idle process still exposes its families.
    with_metrics(|_| {});

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
