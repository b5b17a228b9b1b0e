//! Task handles: the caller-facing capability over one completion core.

use crate::error::GetError;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

/// Something that can be asked to stop.
///
/// Cancellation is cooperative: implementations only request a stop.
pub trait Cancellable: Send + Sync {
    /// Requests cancellation. Idempotent.
    fn cancel(&self);
}

impl<C: Cancellable + ?Sized> Cancellable for Arc<C> {
    fn cancel(&self) {
        (**self).cancel();
    }
}

/// A cancellable that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCancel;

impl Cancellable for NoopCancel {
    fn cancel(&self) {}
}

/// Adapts a closure into a [`Cancellable`].
#[derive(Clone, Copy)]
pub struct CancelFn<F>(pub F);

impl<F: Fn() + Send + Sync> Cancellable for CancelFn<F> {
    fn cancel(&self) {
        (self.0)();
    }
}

impl<F> fmt::Debug for CancelFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelFn").finish_non_exhaustive()
    }
}

/// The control surface behind a [`TaskHandle`].
pub trait TaskControl<T, E>: Cancellable {
    /// Blocks until the task reaches a terminal state and returns its outcome.
    fn get(&self) -> Result<T, GetError<E>>;

    /// Returns true if the task was cancelled.
    fn is_cancelled(&self) -> bool;

    /// Returns true once the task has left the pending state.
    fn is_done(&self) -> bool;
}

/// Shared handle to one asynchronous operation's eventual outcome.
///
/// Clones refer to the same task. Every method is safe to call from any
/// holder on any thread.
pub struct TaskHandle<T, E> {
    control: Arc<dyn TaskControl<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    /// Wraps a control surface.
    #[must_use]
    pub fn new(control: Arc<dyn TaskControl<T, E>>) -> Self {
        Self { control }
    }

    /// Requests cancellation.
    ///
    /// A no-op once the task has reached a terminal state.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Blocks until the task reaches a terminal state and returns its outcome.
    ///
    /// Every caller, and the listener, observe the same recorded outcome.
    /// Must not be called from the context that is expected to deliver this
    /// task's result: that deadlocks.
    pub fn get(&self) -> Result<T, GetError<E>> {
        self.control.get()
    }

    /// Returns true if the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Returns true once the task has reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.control.is_done()
    }
}

impl<T, E> Clone for TaskHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
        }
    }
}

impl<T, E> Cancellable for TaskHandle<T, E> {
    fn cancel(&self) {
        self.control.cancel();
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancel hook whose target is bound after construction.
///
/// Composite drivers need their completion core to exist before the driver
/// state that the core's cancel hook points back to. The hook stays a no-op
/// until [`bind`](Self::bind) is called, and holds its target weakly.
#[derive(Default)]
pub(crate) struct DeferredCancel {
    target: OnceLock<Weak<dyn Cancellable>>,
}

impl DeferredCancel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Binds the target. Later calls are ignored.
    pub(crate) fn bind(&self, target: Weak<dyn Cancellable>) {
        let _ = self.target.set(target);
    }
}

impl Cancellable for DeferredCancel {
    fn cancel(&self) {
        if let Some(target) = self.target.get().and_then(Weak::upgrade) {
            target.cancel();
        }
    }
}
