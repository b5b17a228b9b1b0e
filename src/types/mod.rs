//! Core types for the task framework.
//!
//! - [`id`]: Identifier types (`CoreId`, `SubtaskKey`)
//! - [`outcome`]: Success-or-failure outcomes, wrapped faults, and partial
//!   outcomes tagged with a context key

pub mod id;
pub mod outcome;

pub use id::{CoreId, SubtaskKey};
pub use outcome::{CompositeLog, Failure, Fault, Outcome, PanicPayload, PartialOutcome};
