//! Tracing and Prometheus metrics (shared setup).

/// Initialize the process-wide tracing subscriber.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Prometheus job metrics.
pub mod metrics;

pub use metrics::{JobMetrics, MetricsError};
