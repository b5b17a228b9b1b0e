//! The diagnostics collaborator and its stock implementations.

use crate::tracing_compat::error;
use parking_lot::{Mutex, RwLock, const_rwlock};
use std::fmt;
use std::sync::Arc;

/// Records an unexpected fault together with a message.
///
/// Implementations must not panic; they are called from paths that are
/// already handling a fault.
pub trait Diagnostics: Send + Sync {
    /// Records `fault` with a short description of where it happened.
    fn log_exception(&self, message: &str, fault: &dyn fmt::Display);
}

/// Diagnostics that log at error level through `tracing`.
///
/// Reports are dropped when the `tracing-integration` feature is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn log_exception(&self, message: &str, fault: &dyn fmt::Display) {
        #[cfg(not(feature = "tracing-integration"))]
        let _ = (message, fault);
        error!(fault = %fault, "{message}");
    }
}

/// One report captured by [`RecordingDiagnostics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    /// Where the fault happened.
    pub message: String,
    /// The fault, rendered with `Display`.
    pub fault: String,
}

/// Diagnostics that keep every report in memory.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl RecordingDiagnostics {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every report so far, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().clone()
    }

    /// Number of reports so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Returns true if any report's message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|record| record.message.contains(needle))
    }

    /// Discards every report.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn log_exception(&self, message: &str, fault: &dyn fmt::Display) {
        self.records.lock().push(DiagnosticRecord {
            message: message.to_string(),
            fault: fault.to_string(),
        });
    }
}

static DEFAULT_DIAGNOSTICS: RwLock<Option<Arc<dyn Diagnostics>>> = const_rwlock(None);

/// Returns the process-wide diagnostics collaborator.
///
/// Falls back to [`TracingDiagnostics`] until one is installed.
#[must_use]
pub fn default_diagnostics() -> Arc<dyn Diagnostics> {
    DEFAULT_DIAGNOSTICS
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(TracingDiagnostics))
}

/// Installs the process-wide diagnostics collaborator.
///
/// Components capture the default when they are built, so this only affects
/// components built afterwards.
pub fn set_default_diagnostics(diagnostics: Arc<dyn Diagnostics>) {
    *DEFAULT_DIAGNOSTICS.write() = Some(diagnostics);
}

/// Restores [`TracingDiagnostics`] as the process-wide default.
pub fn reset_default_diagnostics() {
    *DEFAULT_DIAGNOSTICS.write() = None;
}
