//! Monitoring sink for terminal failures.
//!
//! Jobs that give up (a child artifact that failed, a bundle that could not be
//! assembled) hand an [`ErrorReport`] to a [`Monitor`]. Deferrals are never
//! reported here.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// A failure worth an operator's attention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub error: String,
    /// Free-form context (job options, entity id, request id).
    pub context: JsonValue,
    pub reported_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(error: impl Into<String>, context: JsonValue) -> Self {
        Self {
            error: error.into(),
            context,
            reported_at: Utc::now(),
        }
    }
}

/// External monitoring sink.
pub trait Monitor: Send + Sync {
    fn notify(&self, report: ErrorReport);
}

impl<M> Monitor for Arc<M>
where
    M: Monitor + ?Sized,
{
    fn notify(&self, report: ErrorReport) {
        (**self).notify(report)
    }
}

/// Emits each report as an `error` tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn notify(&self, report: ErrorReport) {
        ::tracing::error!(
            error = %report.error,
            context = %report.context,
            "job failure reported"
        );
    }
}

/// Keeps reports in memory. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Monitor for RecordingMonitor {
    fn notify(&self, report: ErrorReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }
}
