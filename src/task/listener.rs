//! Listener contracts and small listener building blocks.
//!
//! A [`Listener`] hears exactly one of `on_success`, `on_error`, or
//! `on_cancel`, followed by `on_finally`, all inside one dispatched unit of
//! work. A [`CompositeListener`] additionally hears one partial notification
//! per sub-task outcome before its own terminal callbacks.
//!
//! Building blocks:
//!
//! - [`NullListener`]: accepts and ignores everything
//! - [`CallbackListener`]: assembled from closures
//! - [`FinallyHook`]: wraps another listener (single or composite) and runs an
//!   extra hook after its `on_finally`, delegating every other callback

use crate::types::{CompositeLog, Failure};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

/// Receives the terminal notification of one task.
pub trait Listener<T, E>: Send + Sync {
    /// The task produced a value.
    fn on_success(&self, value: T);

    /// The task failed.
    fn on_error(&self, failure: Failure<E>);

    /// The task was cancelled before an outcome was committed.
    fn on_cancel(&self) {}

    /// Runs after whichever terminal callback fired.
    fn on_finally(&self) {}
}

/// Receives partial outcomes and the terminal notification of a composite task.
pub trait CompositeListener<K, T, E>: Send + Sync {
    /// One sub-task produced a value.
    fn on_partial_success(&self, value: T, context: K);

    /// One sub-task failed.
    fn on_partial_error(&self, failure: Failure<E>, context: K);

    /// Receives a copy of the committed log once every sub-task finished.
    ///
    /// Not called when the composite is cancelled.
    fn on_complete(&self, log: CompositeLog<K, T, E>) {
        let _ = log;
    }

    /// The composite was cancelled.
    fn on_cancel(&self) {}

    /// Runs after `on_complete` or `on_cancel`.
    fn on_finally(&self) {}
}

impl<T, E, L: Listener<T, E> + ?Sized> Listener<T, E> for Arc<L> {
    fn on_success(&self, value: T) {
        (**self).on_success(value);
    }

    fn on_error(&self, failure: Failure<E>) {
        (**self).on_error(failure);
    }

    fn on_cancel(&self) {
        (**self).on_cancel();
    }

    fn on_finally(&self) {
        (**self).on_finally();
    }
}

impl<K, T, E, L: CompositeListener<K, T, E> + ?Sized> CompositeListener<K, T, E> for Arc<L> {
    fn on_partial_success(&self, value: T, context: K) {
        (**self).on_partial_success(value, context);
    }

    fn on_partial_error(&self, failure: Failure<E>, context: K) {
        (**self).on_partial_error(failure, context);
    }

    fn on_complete(&self, log: CompositeLog<K, T, E>) {
        (**self).on_complete(log);
    }

    fn on_cancel(&self) {
        (**self).on_cancel();
    }

    fn on_finally(&self) {
        (**self).on_finally();
    }
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl<T, E> Listener<T, E> for NullListener {
    fn on_success(&self, _value: T) {}

    fn on_error(&self, _failure: Failure<E>) {}
}

impl<K, T, E> CompositeListener<K, T, E> for NullListener {
    fn on_partial_success(&self, _value: T, _context: K) {}

    fn on_partial_error(&self, _failure: Failure<E>, _context: K) {}
}

type Callback<A> = Box<dyn Fn(A) + Send + Sync>;
type Hook = Box<dyn Fn() + Send + Sync>;

/// Listener assembled from closures.
///
/// Callbacks that are not set do nothing.
///
/// ```ignore
/// let listener = CallbackListener::new()
///     .with_success(|v: i32| println!("got {v}"))
///     .with_finally(|| println!("done"));
/// ```
pub struct CallbackListener<T, E> {
    success: Option<Callback<T>>,
    error: Option<Callback<Failure<E>>>,
    cancel: Option<Hook>,
    finally: Option<Hook>,
}

impl<T, E> Default for CallbackListener<T, E> {
    fn default() -> Self {
        Self {
            success: None,
            error: None,
            cancel: None,
            finally: None,
        }
    }
}

impl<T, E> CallbackListener<T, E> {
    /// Creates a listener with no callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the success callback.
    #[must_use]
    pub fn with_success(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.success = Some(Box::new(f));
        self
    }

    /// Sets the failure callback.
    #[must_use]
    pub fn with_error(mut self, f: impl Fn(Failure<E>) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Sets the cancellation callback.
    #[must_use]
    pub fn with_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.cancel = Some(Box::new(f));
        self
    }

    /// Sets the finalization callback.
    #[must_use]
    pub fn with_finally(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.finally = Some(Box::new(f));
        self
    }
}

impl<T, E> fmt::Debug for CallbackListener<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackListener")
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .field("cancel", &self.cancel.is_some())
            .field("finally", &self.finally.is_some())
            .finish()
    }
}

impl<T, E> Listener<T, E> for CallbackListener<T, E> {
    fn on_success(&self, value: T) {
        if let Some(f) = &self.success {
            f(value);
        }
    }

    fn on_error(&self, failure: Failure<E>) {
        if let Some(f) = &self.error {
            f(failure);
        }
    }

    fn on_cancel(&self) {
        if let Some(f) = &self.cancel {
            f();
        }
    }

    fn on_finally(&self) {
        if let Some(f) = &self.finally {
            f();
        }
    }
}

/// Delegating wrapper that runs `hook` after the inner listener's
/// `on_finally`.
///
/// Every other callback is forwarded unchanged. The hook runs even if the
/// inner `on_finally` panics; the panic is resumed afterwards.
pub struct FinallyHook<L, F> {
    inner: L,
    hook: F,
}

impl<L, F: Fn()> FinallyHook<L, F> {
    /// Wraps `inner`, running `hook` after its `on_finally`.
    pub fn new(inner: L, hook: F) -> Self {
        Self { inner, hook }
    }

    fn finally_then_hook(&self, inner_finally: impl FnOnce()) {
        let inner = catch_unwind(AssertUnwindSafe(inner_finally));
        (self.hook)();
        if let Err(payload) = inner {
            resume_unwind(payload);
        }
    }
}

impl<L: fmt::Debug, F> fmt::Debug for FinallyHook<L, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinallyHook")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<T, E, L, F> Listener<T, E> for FinallyHook<L, F>
where
    L: Listener<T, E>,
    F: Fn() + Send + Sync,
{
    fn on_success(&self, value: T) {
        self.inner.on_success(value);
    }

    fn on_error(&self, failure: Failure<E>) {
        self.inner.on_error(failure);
    }

    fn on_cancel(&self) {
        self.inner.on_cancel();
    }

    fn on_finally(&self) {
        self.finally_then_hook(|| self.inner.on_finally());
    }
}

impl<K, T, E, L, F> CompositeListener<K, T, E> for FinallyHook<L, F>
where
    L: CompositeListener<K, T, E>,
    F: Fn() + Send + Sync,
{
    fn on_partial_success(&self, value: T, context: K) {
        self.inner.on_partial_success(value, context);
    }

    fn on_partial_error(&self, failure: Failure<E>, context: K) {
        self.inner.on_partial_error(failure, context);
    }

    fn on_complete(&self, log: CompositeLog<K, T, E>) {
        self.inner.on_complete(log);
    }

    fn on_cancel(&self) {
        self.inner.on_cancel();
    }

    fn on_finally(&self) {
        self.finally_then_hook(|| self.inner.on_finally());
    }
}
