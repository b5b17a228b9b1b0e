//! Combinators over many sub-tasks.
//!
//! - [`fan_out`]: Run a fixed list of operations with bounded concurrency,
//!   collecting every outcome into a composite log
//! - [`dynamic`]: Track sub-tasks added at runtime and resolve once they have
//!   all finished
//! - [`reduce`]: Fold a composite log into a per-context [`ResultMap`]

pub mod dynamic;
pub mod fan_out;
pub mod reduce;

pub use dynamic::{DynamicTaskSet, DynamicTaskSetBuilder, Finalizer};
pub use fan_out::{Concurrency, FanOutScheduler, SubTask};
pub use reduce::{AccumulatingListener, Collected, Flatten, ResultMap, reduce};
