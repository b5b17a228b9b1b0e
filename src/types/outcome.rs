//! Terminal outcomes of callback-driven tasks.
//!
//! - `Outcome::Ok(T)`: success with a value
//! - `Outcome::Err(Failure<E>)`: the task failed
//!
//! A [`Failure`] is either a recoverable task error `E` or a [`Fault`]: a
//! system-level fault (a caught panic, rejected work) that the framework wraps
//! before storing it, so listeners never see a raw panic payload.
//!
//! Cancellation is not an outcome. It is a separate terminal branch with its
//! own notification.

use crate::error::ExecuteError;
use core::fmt;
use std::any::Any;

/// Payload from a caught panic.
///
/// This wraps the panic value for safe transport across threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a message from the value carried by an unwinding panic.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// A system-level fault wrapped by the framework.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// User work panicked.
    #[error("unexpected fault: {0}")]
    Panicked(PanicPayload),
    /// The work runner refused the unit of work.
    #[error("work rejected: {0}")]
    Rejected(ExecuteError),
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// Recoverable task failure reported by the task itself.
    Error(E),
    /// Wrapped system-level fault.
    Fault(Fault),
}

impl<E> Failure<E> {
    /// Returns true if this failure is a wrapped fault.
    #[must_use]
    pub const fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    /// Returns the task error, if this is one.
    #[must_use]
    pub const fn as_error(&self) -> Option<&E> {
        match self {
            Self::Error(e) => Some(e),
            Self::Fault(_) => None,
        }
    }

    /// Maps the task error, leaving faults untouched.
    pub fn map_err<F, G: FnOnce(E) -> F>(self, g: G) -> Failure<F> {
        match self {
            Self::Error(e) => Failure::Error(g(e)),
            Self::Fault(fault) => Failure::Fault(fault),
        }
    }
}

impl<E> From<Fault> for Failure<E> {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e}"),
            Self::Fault(fault) => write!(f, "{fault}"),
        }
    }
}

/// The terminal outcome of a task that was not cancelled.
///
/// Exactly one side is populated; an outcome carrying both a value and a
/// failure cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    /// Success with a value.
    Ok(T),
    /// The task failed.
    Err(Failure<E>),
}

impl<T, E> Outcome<T, E> {
    /// Creates a failed outcome from a task error.
    #[must_use]
    pub const fn error(e: E) -> Self {
        Self::Err(Failure::Error(e))
    }

    /// Creates a failed outcome from a wrapped fault.
    #[must_use]
    pub const fn fault(fault: Fault) -> Self {
        Self::Err(Failure::Fault(fault))
    }

    /// Returns true if this is a success.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns true if this is a failure.
    #[must_use]
    pub const fn is_err(&self) -> bool {
        matches!(self, Self::Err(_))
    }

    /// Converts to a standard `Result`.
    pub fn into_result(self) -> Result<T, Failure<E>> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(failure) => Err(failure),
        }
    }

    /// Maps the success value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U, E> {
        match self {
            Self::Ok(v) => Outcome::Ok(f(v)),
            Self::Err(failure) => Outcome::Err(failure),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::error(e),
        }
    }
}

/// One sub-task's outcome, tagged with the caller-chosen context key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialOutcome<K, T, E> {
    /// The sub-task's outcome.
    pub outcome: Outcome<T, E>,
    /// The context key supplied when the sub-task was scheduled.
    pub context: K,
}

impl<K, T, E> PartialOutcome<K, T, E> {
    /// Bundles an outcome with its context key.
    #[must_use]
    pub const fn new(outcome: Outcome<T, E>, context: K) -> Self {
        Self { outcome, context }
    }

    /// Returns true if the sub-task succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Arrival-ordered partial outcomes of one composite task.
pub type CompositeLog<K, T, E> = Vec<PartialOutcome<K, T, E>>;
