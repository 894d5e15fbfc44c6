//! TESSERA Telemetry - Observability Infrastructure
//!
//! JSON structured logging and Prometheus metrics for the server binaries.

pub mod metrics;
pub mod middleware;
pub mod tracer;

pub use metrics::{metrics_handler, TesseraMetrics, METRICS};
pub use middleware::observability_middleware;
pub use tracer::{init_tracing, TelemetryConfig};
