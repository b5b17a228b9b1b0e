//! Completion core for tasks made of many sub-tasks.
//!
//! A [`CompositeCore`] wraps a [`CompletionCore`] whose value is the
//! [`CompositeLog`]. Sub-task outcomes are appended with
//! [`add_partial`](CompositeCore::add_partial); each append dispatches one
//! partial notification. [`finish`](CompositeCore::finish) commits a copy of
//! the log, which reaches the listener through `on_complete`.
//!
//! Lock order is log, then core. Appends and the final commit both hold the
//! log lock while they check or change the core, so no partial can be
//! appended once the terminal transition has been taken, and every partial
//! unit is dispatched before the terminal unit.

use crate::dispatch::{Dispatcher, Work};
use crate::error::{GetError, UsageError};
use crate::observability::{Diagnostics, default_diagnostics};
use crate::task::core::CompletionCore;
use crate::task::handle::{Cancellable, TaskControl, TaskHandle};
use crate::task::listener::{CompositeListener, Listener};
use crate::tracing_compat::{debug, trace};
use crate::types::{CompositeLog, Failure, Fault, Outcome, PartialOutcome};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

/// Handle returned for composite tasks.
///
/// Cancellation and status queries work as usual; blocking retrieval fails
/// with [`GetError::Unsupported`]. Listen for `on_complete` instead.
pub type CompositeHandle<K, T, E> = TaskHandle<CompositeLog<K, T, E>, E>;

/// Routes the inner core's notifications to the composite listener.
struct CompletionBridge<K, T, E> {
    listener: Arc<dyn CompositeListener<K, T, E>>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl<K, T, E> Listener<CompositeLog<K, T, E>, Infallible> for CompletionBridge<K, T, E> {
    fn on_success(&self, log: CompositeLog<K, T, E>) {
        self.listener.on_complete(log);
    }

    fn on_error(&self, failure: Failure<Infallible>) {
        match failure {
            Failure::Error(never) => match never {},
            // The inner core is private and only `finish` commits to it, always
            // with a value. A fault here means that invariant was broken.
            Failure::Fault(fault) => self
                .diagnostics
                .log_exception("composite core recorded a fault", &fault),
        }
    }

    fn on_cancel(&self) {
        CompositeListener::on_cancel(self.listener.as_ref());
    }

    fn on_finally(&self) {
        CompositeListener::on_finally(self.listener.as_ref());
    }
}

struct Inner<K, T, E> {
    core: CompletionCore<CompositeLog<K, T, E>, Infallible>,
    log: Mutex<CompositeLog<K, T, E>>,
    listener: Arc<dyn CompositeListener<K, T, E>>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Accumulates partial outcomes and completes once with the whole log.
///
/// Cloning yields another reference to the same composite.
pub struct CompositeCore<K, T, E> {
    inner: Arc<Inner<K, T, E>>,
}

impl<K, T, E> Clone for CompositeCore<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`CompositeCore`].
pub struct CompositeCoreBuilder<K, T, E> {
    listener: Arc<dyn CompositeListener<K, T, E>>,
    dispatcher: Arc<dyn Dispatcher>,
    on_cancel: Option<Arc<dyn Cancellable>>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
}

impl<K, T, E> CompositeCoreBuilder<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Runs `hook` when the composite is cancelled, typically to cancel the
    /// sub-tasks still running.
    #[must_use]
    pub fn on_cancel(mut self, hook: Arc<dyn Cancellable>) -> Self {
        self.on_cancel = Some(hook);
        self
    }

    /// Reports hook panics to `diagnostics` instead of the process default.
    #[must_use]
    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Builds the composite. Rejects synchronous dispatchers.
    pub fn build(self) -> Result<CompositeCore<K, T, E>, UsageError> {
        if self.dispatcher.is_synchronous() {
            return Err(UsageError::SynchronousDispatcher);
        }
        let diagnostics = self.diagnostics.unwrap_or_else(default_diagnostics);
        let bridge = Arc::new(CompletionBridge {
            listener: Arc::clone(&self.listener),
            diagnostics: Arc::clone(&diagnostics),
        });
        let mut core = CompletionCore::<CompositeLog<K, T, E>, Infallible>::builder(
            bridge,
            Arc::clone(&self.dispatcher),
        );
        if let Some(hook) = self.on_cancel {
            core = core.on_cancel(hook);
        }
        Ok(CompositeCore {
            inner: Arc::new(Inner {
                core: core.diagnostics(diagnostics).build_unchecked(),
                log: Mutex::new(Vec::new()),
                listener: self.listener,
                dispatcher: self.dispatcher,
            }),
        })
    }
}

impl<K, T, E> CompositeCore<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Starts building a composite that notifies `listener` through
    /// `dispatcher`.
    #[must_use]
    pub fn builder(
        listener: Arc<dyn CompositeListener<K, T, E>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> CompositeCoreBuilder<K, T, E> {
        CompositeCoreBuilder {
            listener,
            dispatcher,
            on_cancel: None,
            diagnostics: None,
        }
    }

    /// Creates a composite with no cancel hook.
    pub fn new(
        listener: Arc<dyn CompositeListener<K, T, E>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, UsageError> {
        Self::builder(listener, dispatcher).build()
    }

    /// Appends one sub-task outcome and dispatches its partial notification.
    ///
    /// Returns false, appending nothing, once the composite has finished or
    /// been cancelled. A notification already dispatched is dropped at
    /// delivery if the composite has been cancelled by then.
    pub fn add_partial(&self, outcome: Outcome<T, E>, context: K) -> bool {
        let mut log = self.inner.log.lock();
        if self.inner.core.is_done() {
            trace!(core = %self.inner.core.id(), "partial ignored; composite resolved");
            return false;
        }
        log.push(PartialOutcome::new(outcome.clone(), context.clone()));
        trace!(core = %self.inner.core.id(), entries = log.len(), "partial appended");
        let inner = Arc::clone(&self.inner);
        let work: Work = Box::new(move || {
            if inner.core.is_cancelled() {
                return;
            }
            match outcome {
                Outcome::Ok(value) => inner.listener.on_partial_success(value, context),
                Outcome::Err(failure) => inner.listener.on_partial_error(failure, context),
            }
        });
        self.inner.dispatcher.dispatch(work);
        true
    }

    /// Appends a successful sub-task value.
    pub fn add_partial_success(&self, value: T, context: K) -> bool {
        self.add_partial(Outcome::Ok(value), context)
    }

    /// Appends a sub-task error.
    pub fn add_partial_error(&self, error: E, context: K) -> bool {
        self.add_partial(Outcome::error(error), context)
    }

    /// Appends a sub-task fault.
    pub fn add_partial_fault(&self, fault: Fault, context: K) -> bool {
        self.add_partial(Outcome::fault(fault), context)
    }

    /// Commits a copy of the log. Returns true if this call completed the
    /// composite.
    pub fn finish(&self) -> bool {
        let log = self.inner.log.lock();
        let committed = self.inner.core.commit_result(log.clone());
        if committed {
            debug!(core = %self.inner.core.id(), entries = log.len(), "composite finished");
        }
        committed
    }

    /// Cancels the composite unless its completion was already delivered,
    /// then runs the cancel hook.
    ///
    /// A cancel between [`finish`](Self::finish) and delivery wins: the
    /// listener hears `on_cancel` instead of `on_complete`.
    pub fn cancel(&self) -> bool {
        self.inner.core.cancel()
    }

    /// Returns true once the composite has finished or been cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.core.is_done()
    }

    /// Returns true if the composite was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.core.is_cancelled()
    }

    /// Number of partial outcomes appended so far.
    #[must_use]
    pub fn partial_count(&self) -> usize {
        self.inner.log.lock().len()
    }

    /// Copy of the log as it stands.
    #[must_use]
    pub fn log_snapshot(&self) -> CompositeLog<K, T, E> {
        self.inner.log.lock().clone()
    }

    /// Returns a shareable handle to this composite.
    #[must_use]
    pub fn handle(&self) -> CompositeHandle<K, T, E> {
        TaskHandle::new(Arc::new(self.clone()))
    }

    pub(crate) fn diagnostics(&self) -> &Arc<dyn Diagnostics> {
        self.inner.core.diagnostics()
    }
}

impl<K, T, E> Cancellable for CompositeCore<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn cancel(&self) {
        CompositeCore::cancel(self);
    }
}

impl<K, T, E> TaskControl<CompositeLog<K, T, E>, E> for CompositeCore<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn get(&self) -> Result<CompositeLog<K, T, E>, GetError<E>> {
        Err(GetError::Unsupported)
    }

    fn is_cancelled(&self) -> bool {
        CompositeCore::is_cancelled(self)
    }

    fn is_done(&self) -> bool {
        CompositeCore::is_done(self)
    }
}

impl<K, T, E> fmt::Debug for CompositeCore<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeCore")
            .field("core", &self.inner.core)
            .field("entries", &self.inner.log.lock().len())
            .finish_non_exhaustive()
    }
}
