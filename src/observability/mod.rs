//! Diagnostics for faults the framework swallows.
//!
//! User hooks that the framework itself invokes (cancel callbacks, finalizers,
//! sub-task cancellation) may panic. Those panics are caught at the call site
//! and reported through a [`Diagnostics`] collaborator instead of unwinding
//! through internal bookkeeping.
//!
//! - [`TracingDiagnostics`]: logs through `tracing` (the default)
//! - [`RecordingDiagnostics`]: keeps every report in memory
//! - [`default_diagnostics`] / [`set_default_diagnostics`]: the process-wide
//!   collaborator used by components built without an explicit one

pub mod diagnostics;

pub use diagnostics::{
    DiagnosticRecord, Diagnostics, RecordingDiagnostics, TracingDiagnostics, default_diagnostics,
    reset_default_diagnostics, set_default_diagnostics,
};
