//! Error types.
//!
//! Errors fall into three groups:
//!
//! - [`GetError`]: the result of blocking retrieval on a task handle.
//!   Cancellation shows up here as its own variant, never as a failure.
//! - [`UsageError`]: a programming mistake detected at the call site
//!   (forbidden dispatcher, duplicate registration, zero concurrency).
//! - [`ExecuteError`]: a work runner refused a unit of work.
//!
//! Configuration errors live in [`crate::config::ConfigError`].

use crate::types::{Failure, Fault, SubtaskKey};
use thiserror::Error;

/// Error returned by blocking retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GetError<E> {
    /// The task failed with its own error.
    #[error("task failed: {0}")]
    Failed(E),
    /// The task failed with a wrapped system-level fault.
    #[error(transparent)]
    Fault(Fault),
    /// The task was cancelled before an outcome was committed.
    #[error("task was cancelled")]
    Cancelled,
    /// This handle does not support blocking retrieval.
    #[error("blocking retrieval is not supported on this handle")]
    Unsupported,
}

impl<E> GetError<E> {
    /// Returns true if the task was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl<E> From<Failure<E>> for GetError<E> {
    fn from(failure: Failure<E>) -> Self {
        match failure {
            Failure::Error(e) => Self::Failed(e),
            Failure::Fault(fault) => Self::Fault(fault),
        }
    }
}

/// A programming mistake detected when wiring tasks together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsageError {
    /// A completion core was given a dispatcher that runs work inline.
    #[error("completion cores cannot deliver through a synchronous dispatcher")]
    SynchronousDispatcher,
    /// A sub-operation was registered under a key that is already outstanding.
    #[error("duplicate key {0} in outstanding set")]
    DuplicateKey(SubtaskKey),
    /// A concurrency width of zero would never start anything.
    #[error("concurrency width must be at least one")]
    ZeroConcurrency,
}

/// Error returned when a work runner refuses a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecuteError {
    /// The runner has been shut down.
    #[error("work runner has been shut down")]
    Shutdown,
    /// The OS refused to create a thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(String),
    /// The runner accepted the work but dropped it without running it.
    #[error("work was dropped without running")]
    Dropped,
}

impl From<std::io::Error> for ExecuteError {
    fn from(err: std::io::Error) -> Self {
        Self::Spawn(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PanicPayload;
    use crate::test_utils::init_test_logging;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    #[test]
    fn get_error_from_failure() {
        init_test("get_error_from_failure");
        let failed: GetError<&str> = Failure::Error("bad input").into();
        assert_eq!(failed, GetError::Failed("bad input"));
        assert_eq!(failed.to_string(), "task failed: bad input");

        let fault: GetError<&str> = Failure::Fault(Fault::Panicked(PanicPayload::new("x"))).into();
        assert_eq!(fault.to_string(), "unexpected fault: panic: x");
        assert!(!fault.is_cancelled());
        assert!(GetError::<&str>::Cancelled.is_cancelled());
        crate::test_complete!("get_error_from_failure");
    }

    #[test]
    fn usage_error_messages() {
        init_test("usage_error_messages");
        let dup = UsageError::DuplicateKey(SubtaskKey::new(3));
        crate::assert_with_log!(
            dup.to_string() == "duplicate key S3 in outstanding set",
            "duplicate key message",
            "duplicate key S3 in outstanding set",
            dup.to_string()
        );
        assert_eq!(
            UsageError::ZeroConcurrency.to_string(),
            "concurrency width must be at least one"
        );
        crate::test_complete!("usage_error_messages");
    }

    #[test]
    fn execute_error_from_io() {
        init_test("execute_error_from_io");
        let err: ExecuteError = std::io::Error::other("no threads").into();
        assert_eq!(err, ExecuteError::Spawn("no threads".to_string()));
        crate::test_complete!("execute_error_from_io");
    }
}
