//! Tasks: the completion protocol and the contracts around it.
//!
//! - [`listener`]: [`Listener`] and [`CompositeListener`] plus small adapters
//! - [`handle`]: [`TaskHandle`] and the [`Cancellable`] capability
//! - [`core`]: [`CompletionCore`], the exactly-once state machine
//! - [`composite`]: [`CompositeCore`], which accumulates partial outcomes
//! - [`operation`]: [`AsyncOperation`], callable execution, blocking adapter

pub mod composite;
pub mod core;
pub mod handle;
pub mod listener;
pub mod operation;

pub use composite::{CompositeCore, CompositeCoreBuilder, CompositeHandle};
pub use core::{CompletionCore, CompletionCoreBuilder};
pub use handle::{CancelFn, Cancellable, NoopCancel, TaskControl, TaskHandle};
pub use listener::{CallbackListener, CompositeListener, FinallyHook, Listener, NullListener};
pub use operation::{
    AsyncOperation, Callable, CallableOperation, FnCallable, FnOperation, block_for_result,
    execute_callable, from_fn,
};
