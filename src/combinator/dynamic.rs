//! Composite operations whose sub-task count is not known in advance.
//!
//! A [`DynamicTaskSet`] owns a parent [`CompletionCore`] and an outstanding
//! set of cancellable sub-operations. Sub-tasks may be added while others run.
//! When the last outstanding entry is removed and the parent is still pending,
//! the finalizer runs once and its returned outcome is committed. A local
//! commit, or a cancel of the parent, cancels everything still outstanding.
//!
//! The set can drain before every sub-task has been added. Callers adding
//! sub-tasks over time can hold a guard entry ([`reserve_key`] plus
//! [`add_cancellable`]) and remove it once no more will be added.
//!
//! [`reserve_key`]: DynamicTaskSet::reserve_key
//! [`add_cancellable`]: DynamicTaskSet::add_cancellable

use crate::dispatch::Dispatcher;
use crate::error::{GetError, UsageError};
use crate::observability::Diagnostics;
use crate::task::core::CompletionCore;
use crate::task::handle::{Cancellable, DeferredCancel, TaskControl, TaskHandle};
use crate::task::listener::{FinallyHook, Listener};
use crate::task::operation::AsyncOperation;
use crate::tracing_compat::{debug, trace};
use crate::types::{Fault, Outcome, PanicPayload, SubtaskKey};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Produces the parent's outcome once every sub-task has finished.
pub type Finalizer<T, E> = Box<dyn FnOnce() -> Outcome<T, E> + Send>;

/// Outstanding entries. `None` marks a sub-task whose handle is not known yet.
type Outstanding = HashMap<SubtaskKey, Option<Arc<dyn Cancellable>>>;

struct SetInner<T, E> {
    core: CompletionCore<T, E>,
    outstanding: Mutex<Outstanding>,
    finalizer: Mutex<Option<Finalizer<T, E>>>,
    on_cancel: Option<Arc<dyn Cancellable>>,
    next_key: AtomicU64,
}

impl<T, E> SetInner<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn cancel_outstanding(&self) {
        let targets: SmallVec<[Arc<dyn Cancellable>; 8]> =
            self.outstanding.lock().values().flatten().cloned().collect();
        if !targets.is_empty() {
            debug!(
                core = %self.core.id(),
                count = targets.len(),
                "cancelling outstanding sub-tasks"
            );
        }
        for target in targets {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| target.cancel())) {
                self.core.diagnostics().log_exception(
                    "unexpected panic while cancelling sub-task",
                    &PanicPayload::from_panic(payload.as_ref()),
                );
            }
        }
    }

    fn commit(&self, outcome: Outcome<T, E>) -> bool {
        if !self.core.commit(outcome) {
            return false;
        }
        self.cancel_outstanding();
        true
    }

    fn remove(&self, key: SubtaskKey) -> bool {
        let finalizer = {
            let mut outstanding = self.outstanding.lock();
            if outstanding.remove(&key).is_none() {
                return false;
            }
            trace!(key = %key, remaining = outstanding.len(), "sub-task removed");
            if !outstanding.is_empty() || self.core.is_done() {
                return true;
            }
            self.finalizer.lock().take()
        };
        if let Some(finalizer) = finalizer {
            self.finalize(finalizer);
        }
        true
    }

    fn finalize(&self, finalizer: Finalizer<T, E>) {
        debug!(core = %self.core.id(), "outstanding set drained; finalizing");
        match catch_unwind(AssertUnwindSafe(finalizer)) {
            Ok(outcome) => {
                self.commit(outcome);
            }
            Err(payload) => {
                let payload = PanicPayload::from_panic(payload.as_ref());
                self.core
                    .diagnostics()
                    .log_exception("unexpected panic while finalizing", &payload);
                self.commit(Outcome::fault(Fault::Panicked(payload)));
            }
        }
    }
}

impl<T, E> Cancellable for SetInner<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn cancel(&self) {
        self.cancel_outstanding();
        if let Some(hook) = &self.on_cancel {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook.cancel())) {
                self.core.diagnostics().log_exception(
                    "unexpected panic in task set cancel hook",
                    &PanicPayload::from_panic(payload.as_ref()),
                );
            }
        }
    }
}

/// Stands in for a sub-task whose operation panicked in `start`.
struct FailedStart(Fault);

impl Cancellable for FailedStart {
    fn cancel(&self) {}
}

impl<U, F> TaskControl<U, F> for FailedStart {
    fn get(&self) -> Result<U, GetError<F>> {
        Err(GetError::Fault(self.0.clone()))
    }

    fn is_cancelled(&self) -> bool {
        false
    }

    fn is_done(&self) -> bool {
        true
    }
}

/// Parent task over an open-ended set of sub-operations.
///
/// Cloning yields another reference to the same set.
pub struct DynamicTaskSet<T, E> {
    inner: Arc<SetInner<T, E>>,
}

impl<T, E> Clone for DynamicTaskSet<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`DynamicTaskSet`].
pub struct DynamicTaskSetBuilder<T, E> {
    listener: Arc<dyn Listener<T, E>>,
    dispatcher: Arc<dyn Dispatcher>,
    finalizer: Finalizer<T, E>,
    on_cancel: Option<Arc<dyn Cancellable>>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
}

impl<T, E> DynamicTaskSetBuilder<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Runs `hook` after the outstanding sub-tasks when the parent is
    /// cancelled.
    #[must_use]
    pub fn on_cancel(mut self, hook: Arc<dyn Cancellable>) -> Self {
        self.on_cancel = Some(hook);
        self
    }

    /// Reports hook and finalizer panics to `diagnostics`.
    #[must_use]
    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Builds the set. Rejects synchronous dispatchers.
    pub fn build(self) -> Result<DynamicTaskSet<T, E>, UsageError> {
        let hook = Arc::new(DeferredCancel::new());
        let mut core =
            CompletionCore::builder(self.listener, self.dispatcher).on_cancel(hook.clone());
        if let Some(diagnostics) = self.diagnostics {
            core = core.diagnostics(diagnostics);
        }
        let inner = Arc::new(SetInner {
            core: core.build()?,
            outstanding: Mutex::new(HashMap::new()),
            finalizer: Mutex::new(Some(self.finalizer)),
            on_cancel: self.on_cancel,
            next_key: AtomicU64::new(0),
        });
        let weak: Weak<SetInner<T, E>> = Arc::downgrade(&inner);
        hook.bind(weak);
        Ok(DynamicTaskSet { inner })
    }
}

impl<T, E> DynamicTaskSet<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Starts building a set whose parent notifies `listener` and whose
    /// outcome, once drained, comes from `finalizer`.
    #[must_use]
    pub fn builder(
        listener: Arc<dyn Listener<T, E>>,
        dispatcher: Arc<dyn Dispatcher>,
        finalizer: impl FnOnce() -> Outcome<T, E> + Send + 'static,
    ) -> DynamicTaskSetBuilder<T, E> {
        DynamicTaskSetBuilder {
            listener,
            dispatcher,
            finalizer: Box::new(finalizer),
            on_cancel: None,
            diagnostics: None,
        }
    }

    /// Returns a key no other entry of this set uses.
    pub fn reserve_key(&self) -> SubtaskKey {
        SubtaskKey::new(self.inner.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a hand-managed cancellable under `key`.
    ///
    /// Fails if `key` is outstanding. If the parent is already resolved the
    /// cancellable is cancelled at once.
    pub fn add_cancellable(
        &self,
        key: SubtaskKey,
        cancellable: Arc<dyn Cancellable>,
    ) -> Result<(), UsageError> {
        {
            let mut outstanding = self.inner.outstanding.lock();
            if outstanding.contains_key(&key) {
                return Err(UsageError::DuplicateKey(key));
            }
            outstanding.insert(key, Some(Arc::clone(&cancellable)));
        }
        if self.inner.core.is_done() {
            cancellable.cancel();
        }
        Ok(())
    }

    /// Removes `key`. Runs the finalizer if this drained the set while the
    /// parent is pending. Returns false if `key` was not outstanding.
    pub fn remove_cancellable(&self, key: SubtaskKey) -> bool {
        self.inner.remove(key)
    }

    /// Starts `operation` as a sub-task under a fresh key.
    ///
    /// `listener` hears the sub-task's own callbacks. The entry is removed
    /// after its `on_finally`. If `start` panics, the entry is removed, the
    /// parent is failed with [`Fault::Panicked`], and the returned handle
    /// reports the same fault.
    pub fn start_sub_task<U, F>(
        &self,
        operation: &dyn AsyncOperation<U, F>,
        listener: Arc<dyn Listener<U, F>>,
    ) -> TaskHandle<U, F>
    where
        U: 'static,
        F: 'static,
    {
        let key = self.reserve_key();
        self.inner.outstanding.lock().insert(key, None);
        self.launch(key, operation, listener)
    }

    /// Starts `operation` as a sub-task under `key`.
    ///
    /// Fails, starting nothing, if `key` is outstanding.
    pub fn start_keyed_sub_task<U, F>(
        &self,
        key: SubtaskKey,
        operation: &dyn AsyncOperation<U, F>,
        listener: Arc<dyn Listener<U, F>>,
    ) -> Result<TaskHandle<U, F>, UsageError>
    where
        U: 'static,
        F: 'static,
    {
        {
            let mut outstanding = self.inner.outstanding.lock();
            if outstanding.contains_key(&key) {
                return Err(UsageError::DuplicateKey(key));
            }
            outstanding.insert(key, None);
        }
        Ok(self.launch(key, operation, listener))
    }

    fn launch<U, F>(
        &self,
        key: SubtaskKey,
        operation: &dyn AsyncOperation<U, F>,
        listener: Arc<dyn Listener<U, F>>,
    ) -> TaskHandle<U, F>
    where
        U: 'static,
        F: 'static,
    {
        let inner = Arc::clone(&self.inner);
        let wrapped = FinallyHook::new(listener, move || {
            inner.remove(key);
        });
        let started = catch_unwind(AssertUnwindSafe(|| operation.start(Arc::new(wrapped))));
        let handle = match started {
            Ok(handle) => handle,
            Err(payload) => {
                let fault = Fault::Panicked(PanicPayload::from_panic(payload.as_ref()));
                debug!(key = %key, "sub-task start panicked; failing parent");
                // Committing first keeps the removal below from finalizing.
                self.inner.commit(Outcome::fault(fault.clone()));
                self.inner.remove(key);
                return TaskHandle::new(Arc::new(FailedStart(fault)));
            }
        };
        {
            let mut outstanding = self.inner.outstanding.lock();
            if let Some(entry) = outstanding.get_mut(&key) {
                *entry = Some(Arc::new(handle.clone()));
            }
        }
        trace!(key = %key, "sub-task started");
        if self.inner.core.is_done() {
            handle.cancel();
        }
        handle
    }

    /// Commits `outcome` to the parent and cancels everything outstanding.
    ///
    /// Returns false, cancelling nothing, if the parent was already resolved.
    pub fn commit(&self, outcome: Outcome<T, E>) -> bool {
        self.inner.commit(outcome)
    }

    /// Commits a value. See [`commit`](Self::commit).
    pub fn commit_result(&self, value: T) -> bool {
        self.commit(Outcome::Ok(value))
    }

    /// Commits an error. See [`commit`](Self::commit).
    pub fn commit_error(&self, error: E) -> bool {
        self.commit(Outcome::error(error))
    }

    /// Cancels the parent and everything outstanding.
    pub fn cancel(&self) -> bool {
        self.inner.core.cancel()
    }

    /// Returns true once the parent is resolved.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.core.is_done()
    }

    /// Returns true if the parent was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.core.is_cancelled()
    }

    /// Returns true if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.outstanding.lock().is_empty()
    }

    /// Number of outstanding entries.
    #[must_use]
    pub fn outstanding_len(&self) -> usize {
        self.inner.outstanding.lock().len()
    }

    /// Handle to the parent task.
    #[must_use]
    pub fn handle(&self) -> TaskHandle<T, E> {
        self.inner.core.handle()
    }
}

impl<T, E> fmt::Debug for DynamicTaskSet<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicTaskSet")
            .field("core", &self.inner.core)
            .field("outstanding", &self.inner.outstanding.lock().len())
            .finish_non_exhaustive()
    }
}
