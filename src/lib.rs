//! Calltask: callback-based task completion, cancellation, and fan-out for threaded Rust.
//!
//! # Overview
//!
//! Calltask models asynchronous work as operations that report to a listener
//! instead of returning futures. Every task settles exactly once, as a success,
//! a failure, or a cancellation, and its listener hears about it on a
//! caller-chosen dispatcher. Composite tasks collect the outcomes of many
//! sub-tasks and finish only when all of them have.
//!
//! # Core Guarantees
//!
//! - **Exactly once**: The first commit wins; a cancel overrides it only until the outcome is read
//! - **Ordered delivery**: The terminal callback and `on_finally` run inside one dispatched unit
//! - **Contained panics**: Panicking user work becomes a wrapped fault, never a lost result
//! - **Bounded fan-out**: At most the configured number of sub-tasks run at once
//! - **Cancel propagation**: Cancelling a composite cancels every sub-task still running
//!
//! # Module Structure
//!
//! - [`types`]: Core types (identifiers, outcomes, partial outcomes)
//! - [`error`](mod@error): Error types
//! - [`task`]: Completion cores, handles, listeners, and operations
//! - [`combinator`]: Fan-out scheduling, dynamic task sets, result reduction
//! - [`dispatch`]: Dispatchers that deliver listener notifications
//! - [`runtime`]: Work runners (worker pool, concurrency gate, thread-per-task)
//! - [`config`]: Worker pool configuration and environment overrides
//! - [`observability`]: Diagnostics for swallowed faults
//! - [`tracing_compat`]: Optional tracing integration (requires `tracing-integration` feature)
//!
//! # API Stability
//!
//! Calltask is currently in the 0.x series. Public items should be treated as
//! **unstable** and subject to change.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod combinator;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod task;
pub mod tracing_compat;
pub mod types;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use combinator::{
    AccumulatingListener, Collected, Concurrency, DynamicTaskSet, FanOutScheduler, Finalizer,
    ResultMap, SubTask,
};
pub use config::{ConfigError, PoolConfig};
pub use dispatch::{Dispatcher, EventLoop, QueueDispatcher, RunnerDispatcher, Work};
pub use error::{ExecuteError, GetError, UsageError};
pub use observability::{Diagnostics, RecordingDiagnostics, TracingDiagnostics};
pub use runtime::{ConcurrencyGate, ThreadPerTask, WorkRunner, WorkerPool, WorkerPoolHandle};
pub use task::{
    AsyncOperation, Callable, CallableOperation, Cancellable, CompletionCore, CompositeCore,
    CompositeHandle, CompositeListener, Listener, TaskHandle, block_for_result, execute_callable,
};
pub use types::{CompositeLog, CoreId, Failure, Fault, Outcome, PartialOutcome, SubtaskKey};
