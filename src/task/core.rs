//! The single-task completion state machine.
//!
//! A [`CompletionCore`] records the terminal resolution of one task and
//! delivers it to a [`Listener`] exactly once. The phase moves
//!
//! ```text
//! Pending       --commit--> Settled(Done)      --get/deliver--> Committed(Done)
//! Pending       --cancel--> Settled(Cancelled) --get/deliver--> Committed(Cancelled)
//! Settled(Done) --cancel--> Settled(Cancelled)
//! ```
//!
//! A commit only takes effect from `Pending`. A cancel takes effect until the
//! resolution has been handed to a consumer: it overrides an outcome that was
//! recorded but not yet read. Every other attempt is a no-op. Transitions are
//! checked and taken under the core's mutex.
//!
//! Leaving `Pending` dispatches one unit of work that runs the matching
//! terminal callback and then `on_finally`. Blocking retrieval and that unit
//! read the same recorded resolution; whichever reads first latches it as
//! `Committed`, and from then on it is only replayed.
//!
//! The user cancel hook runs after the cancellation has been recorded, outside
//! the lock. A panic in the hook is reported to the core's [`Diagnostics`] and
//! never unwinds into the caller.

use crate::dispatch::{Dispatcher, Work};
use crate::error::{GetError, UsageError};
use crate::observability::{Diagnostics, default_diagnostics};
use crate::task::handle::{Cancellable, TaskControl, TaskHandle};
use crate::task::listener::Listener;
use crate::tracing_compat::{debug, trace};
use crate::types::{CoreId, Fault, Outcome, PanicPayload};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution<T, E> {
    Done(Outcome<T, E>),
    Cancelled,
}

#[derive(Debug)]
enum Phase<T, E> {
    Pending,
    /// Resolved but not yet handed to any consumer.
    Settled(Resolution<T, E>),
    /// Handed to a consumer: read-only replay from here on.
    Committed(Resolution<T, E>),
}

impl<T, E> Phase<T, E> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Settled(_) => "settled",
            Self::Committed(_) => "committed",
        }
    }

    const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Settled(Resolution::Cancelled) | Self::Committed(Resolution::Cancelled)
        )
    }
}

struct Inner<T, E> {
    id: CoreId,
    phase: Mutex<Phase<T, E>>,
    settled: Condvar,
    listener: Arc<dyn Listener<T, E>>,
    dispatcher: Arc<dyn Dispatcher>,
    on_cancel: Option<Arc<dyn Cancellable>>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl<T, E> Inner<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Leaves `Pending` with `outcome`. Returns false if already resolved.
    fn settle(&self, outcome: Outcome<T, E>) -> bool {
        let mut phase = self.phase.lock();
        if !matches!(*phase, Phase::Pending) {
            return false;
        }
        *phase = Phase::Settled(Resolution::Done(outcome));
        drop(phase);
        self.settled.notify_all();
        true
    }

    /// Records a cancellation unless the resolution was already committed.
    ///
    /// Returns `None` if ignored. Otherwise returns true when the core left
    /// `Pending` and still needs a delivery unit; an overridden outcome
    /// already has one queued.
    fn settle_cancelled(&self) -> Option<bool> {
        let mut phase = self.phase.lock();
        let needs_delivery = match *phase {
            Phase::Pending => true,
            Phase::Settled(Resolution::Done(_)) => false,
            Phase::Settled(Resolution::Cancelled) | Phase::Committed(_) => return None,
        };
        *phase = Phase::Settled(Resolution::Cancelled);
        drop(phase);
        self.settled.notify_all();
        Some(needs_delivery)
    }

    /// Latches the resolution as committed and returns a copy of it.
    ///
    /// Returns `None` while still pending.
    fn commit_resolution(phase: &mut Phase<T, E>) -> Option<Resolution<T, E>> {
        let resolution = match phase {
            Phase::Pending => return None,
            Phase::Committed(resolution) => return Some(resolution.clone()),
            Phase::Settled(resolution) => resolution.clone(),
        };
        *phase = Phase::Committed(resolution.clone());
        Some(resolution)
    }

    fn deliver(&self) {
        let Some(resolution) = Self::commit_resolution(&mut self.phase.lock()) else {
            return;
        };
        trace!(core = %self.id, "delivering resolution");
        let listener = &self.listener;
        let branch = catch_unwind(AssertUnwindSafe(|| match resolution {
            Resolution::Done(Outcome::Ok(value)) => listener.on_success(value),
            Resolution::Done(Outcome::Err(failure)) => listener.on_error(failure),
            Resolution::Cancelled => listener.on_cancel(),
        }));
        let finally = catch_unwind(AssertUnwindSafe(|| listener.on_finally()));
        if let Err(payload) = branch.and(finally) {
            resume_unwind(payload);
        }
    }
}

/// Race-free, exactly-once completion of one task.
///
/// Cloning yields another reference to the same core.
pub struct CompletionCore<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for CompletionCore<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`CompletionCore`].
pub struct CompletionCoreBuilder<T, E> {
    listener: Arc<dyn Listener<T, E>>,
    dispatcher: Arc<dyn Dispatcher>,
    on_cancel: Option<Arc<dyn Cancellable>>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
}

impl<T, E> CompletionCoreBuilder<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Runs `hook` whenever a cancel takes effect.
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

    /// Builds the core.
    ///
    /// Fails with [`UsageError::SynchronousDispatcher`] if the dispatcher runs
    /// work inline: delivery would then re-enter the caller of `commit` or
    /// `cancel`.
    pub fn build(self) -> Result<CompletionCore<T, E>, UsageError> {
        if self.dispatcher.is_synchronous() {
            return Err(UsageError::SynchronousDispatcher);
        }
        Ok(self.build_unchecked())
    }

    /// Builds without checking the dispatcher.
    ///
    /// Callers must have validated the dispatcher already.
    pub(crate) fn build_unchecked(self) -> CompletionCore<T, E> {
        let id = CoreId::next();
        trace!(core = %id, "completion core created");
        CompletionCore {
            inner: Arc::new(Inner {
                id,
                phase: Mutex::new(Phase::Pending),
                settled: Condvar::new(),
                listener: self.listener,
                dispatcher: self.dispatcher,
                on_cancel: self.on_cancel,
                diagnostics: self.diagnostics.unwrap_or_else(default_diagnostics),
            }),
        }
    }
}

impl<T, E> CompletionCore<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Starts building a core that notifies `listener` through `dispatcher`.
    #[must_use]
    pub fn builder(
        listener: Arc<dyn Listener<T, E>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> CompletionCoreBuilder<T, E> {
        CompletionCoreBuilder {
            listener,
            dispatcher,
            on_cancel: None,
            diagnostics: None,
        }
    }

    /// Creates a core with no cancel hook.
    pub fn new(
        listener: Arc<dyn Listener<T, E>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, UsageError> {
        Self::builder(listener, dispatcher).build()
    }

    /// Process-unique identifier, for logs.
    #[must_use]
    pub fn id(&self) -> CoreId {
        self.inner.id
    }

    /// Records `outcome` if the core is still pending.
    ///
    /// Returns true if this call resolved the core. Later calls, and calls
    /// after a cancel, are no-ops.
    pub fn commit(&self, outcome: Outcome<T, E>) -> bool {
        if !self.inner.settle(outcome) {
            trace!(core = %self.inner.id, "commit ignored; already resolved");
            return false;
        }
        debug!(core = %self.inner.id, "outcome committed");
        self.schedule_delivery();
        true
    }

    /// Records a successful value. See [`commit`](Self::commit).
    pub fn commit_result(&self, value: T) -> bool {
        self.commit(Outcome::Ok(value))
    }

    /// Records a task error. See [`commit`](Self::commit).
    pub fn commit_error(&self, error: E) -> bool {
        self.commit(Outcome::error(error))
    }

    /// Records a wrapped system-level fault. See [`commit`](Self::commit).
    pub fn commit_fault(&self, fault: Fault) -> bool {
        self.commit(Outcome::fault(fault))
    }

    /// Cancels the core unless its resolution was already committed.
    ///
    /// A cancel from `Pending` schedules `on_cancel` delivery. A cancel that
    /// lands between a commit and its delivery replaces the recorded outcome,
    /// so the queued unit delivers `on_cancel` instead. Either way the cancel
    /// hook then runs outside the lock. Returns true if this call cancelled
    /// the core; once `get` or delivery has read the resolution, cancel is a
    /// no-op.
    pub fn cancel(&self) -> bool {
        let Some(needs_delivery) = self.inner.settle_cancelled() else {
            trace!(core = %self.inner.id, "cancel ignored; already committed or cancelled");
            return false;
        };
        if needs_delivery {
            debug!(core = %self.inner.id, "core cancelled");
            self.schedule_delivery();
        } else {
            debug!(core = %self.inner.id, "undelivered outcome replaced by cancel");
        }
        if let Some(hook) = &self.inner.on_cancel {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook.cancel())) {
                self.inner.diagnostics.log_exception(
                    "unexpected panic while cancelling",
                    &PanicPayload::from_panic(payload.as_ref()),
                );
            }
        }
        true
    }

    /// Blocks until the core is resolved and returns the recorded outcome.
    ///
    /// Latches the resolution as committed. Must not be called on the context
    /// that runs this core's dispatcher.
    pub fn get(&self) -> Result<T, GetError<E>> {
        let mut phase = self.inner.phase.lock();
        loop {
            if let Some(resolution) = Inner::commit_resolution(&mut phase) {
                return match resolution {
                    Resolution::Done(Outcome::Ok(value)) => Ok(value),
                    Resolution::Done(Outcome::Err(failure)) => Err(failure.into()),
                    Resolution::Cancelled => Err(GetError::Cancelled),
                };
            }
            self.inner.settled.wait(&mut phase);
        }
    }

    /// Returns true once the core has left `Pending`.
    #[must_use]
    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.phase.lock(), Phase::Pending)
    }

    /// Returns true if the core was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.phase.lock().is_cancelled()
    }

    /// Returns true once the resolution has been handed to a consumer.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(*self.inner.phase.lock(), Phase::Committed(_))
    }

    /// Returns a shareable handle to this core.
    #[must_use]
    pub fn handle(&self) -> TaskHandle<T, E> {
        TaskHandle::new(Arc::new(self.clone()))
    }

    pub(crate) fn diagnostics(&self) -> &Arc<dyn Diagnostics> {
        &self.inner.diagnostics
    }

    fn schedule_delivery(&self) {
        let inner = Arc::clone(&self.inner);
        let work: Work = Box::new(move || inner.deliver());
        self.inner.dispatcher.dispatch(work);
    }
}

impl<T, E> Cancellable for CompletionCore<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn cancel(&self) {
        CompletionCore::cancel(self);
    }
}

impl<T, E> TaskControl<T, E> for CompletionCore<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn get(&self) -> Result<T, GetError<E>> {
        CompletionCore::get(self)
    }

    fn is_cancelled(&self) -> bool {
        CompletionCore::is_cancelled(self)
    }

    fn is_done(&self) -> bool {
        CompletionCore::is_done(self)
    }
}

impl<T, E> fmt::Debug for CompletionCore<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCore")
            .field("id", &self.inner.id)
            .field("phase", &self.inner.phase.lock().name())
            .finish_non_exhaustive()
    }
}
