//! Tracing, logging and failure monitoring (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Failure reporting sink for terminal job errors.
pub mod monitoring;

pub use monitoring::{ErrorReport, Monitor, RecordingMonitor, TracingMonitor};
pub use tracing::{LogFormat, ObservabilityConfig, init_with};
