//! Tracing/logging setup and the explicit metrics handle.
//!
//! There is no global metrics registry: a [`Metrics`] handle is built once at
//! startup and passed to every component that records measurements.

/// Initialize process-wide tracing/logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Measurement sinks.
pub mod metrics;

pub use metrics::{
    InMemoryMetrics, LatencyHistogram, Metrics, MetricsSink, MetricsSnapshot, NoopMetrics,
    TracingMetrics,
};
