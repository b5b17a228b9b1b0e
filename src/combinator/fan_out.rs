//! Bounded-width fan-out over a fixed list of sub-tasks.
//!
//! [`FanOutScheduler`] starts sub-tasks in list order, at most `width` at a
//! time, and appends each outcome to a [`CompositeCore`]. When the last
//! sub-task has finished the composite is finished exactly once. Cancelling
//! the returned handle stops further starts and cancels every sub-task that
//! is still running.
//!
//! Partial notifications arrive in completion order; only starts are ordered.

use crate::dispatch::Dispatcher;
use crate::error::UsageError;
use crate::observability::Diagnostics;
use crate::task::composite::{CompositeCore, CompositeHandle};
use crate::task::handle::{Cancellable, DeferredCancel, TaskHandle};
use crate::task::listener::{CompositeListener, Listener};
use crate::task::operation::AsyncOperation;
use crate::tracing_compat::{debug, trace};
use crate::types::{Failure, Fault, Outcome, PanicPayload};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

/// How many sub-tasks may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// At most this many. Zero is rejected when the fan-out starts.
    Limited(usize),
    /// All sub-tasks start immediately.
    Unlimited,
}

impl Concurrency {
    /// One sub-task at a time.
    #[must_use]
    pub const fn serial() -> Self {
        Self::Limited(1)
    }

    fn width(self, tasks: usize) -> Result<usize, UsageError> {
        match self {
            Self::Limited(0) => Err(UsageError::ZeroConcurrency),
            Self::Limited(n) => Ok(n),
            Self::Unlimited => Ok(tasks),
        }
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::serial()
    }
}

/// One entry of a fan-out: an operation and the context key its outcome is
/// tagged with.
pub struct SubTask<K, T, E> {
    operation: Arc<dyn AsyncOperation<T, E>>,
    context: K,
}

impl<K, T, E> SubTask<K, T, E> {
    /// Pairs `operation` with `context`.
    #[must_use]
    pub fn new(operation: Arc<dyn AsyncOperation<T, E>>, context: K) -> Self {
        Self { operation, context }
    }

    /// The context key.
    #[must_use]
    pub fn context(&self) -> &K {
        &self.context
    }
}

impl<K: fmt::Debug, T, E> fmt::Debug for SubTask<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTask")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Configures and starts a fan-out.
///
/// ```ignore
/// let handle = FanOutScheduler::new(listener, dispatcher)
///     .concurrency(Concurrency::Limited(4))
///     .tasks(requests)
///     .start()?;
/// ```
pub struct FanOutScheduler<K, T, E> {
    listener: Arc<dyn CompositeListener<K, T, E>>,
    dispatcher: Arc<dyn Dispatcher>,
    concurrency: Concurrency,
    tasks: Vec<SubTask<K, T, E>>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
}

impl<K, T, E> FanOutScheduler<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// A serial fan-out with no tasks that reports to `listener`.
    #[must_use]
    pub fn new(
        listener: Arc<dyn CompositeListener<K, T, E>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            concurrency: Concurrency::default(),
            tasks: Vec::new(),
            diagnostics: None,
        }
    }

    /// Sets the width.
    #[must_use]
    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Appends one sub-task.
    #[must_use]
    pub fn task(mut self, operation: Arc<dyn AsyncOperation<T, E>>, context: K) -> Self {
        self.tasks.push(SubTask::new(operation, context));
        self
    }

    /// Appends sub-tasks in iteration order.
    #[must_use]
    pub fn tasks(mut self, tasks: impl IntoIterator<Item = SubTask<K, T, E>>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Reports sub-task cancel panics to `diagnostics`.
    #[must_use]
    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Starts the first `width` sub-tasks and returns the composite handle.
    ///
    /// Fails on a zero width or a synchronous dispatcher; nothing is started
    /// in that case.
    pub fn start(self) -> Result<CompositeHandle<K, T, E>, UsageError> {
        let total = self.tasks.len();
        let width = self.concurrency.width(total)?;
        let hook = Arc::new(DeferredCancel::new());
        let mut builder =
            CompositeCore::builder(self.listener, self.dispatcher).on_cancel(hook.clone());
        if let Some(diagnostics) = self.diagnostics {
            builder = builder.diagnostics(diagnostics);
        }
        let composite = builder.build()?;
        let handle = composite.handle();

        let fan_out = Arc::new(FanOut {
            composite,
            progress: Mutex::new(Progress {
                pending: self.tasks.into(),
                running: HashMap::new(),
                next_slot: 0,
                finished: false,
            }),
        });
        let weak: Weak<FanOut<K, T, E>> = Arc::downgrade(&fan_out);
        hook.bind(weak);
        debug!(width, tasks = total, "fan-out started");

        for _ in 0..width.min(total) {
            fan_out.start_next();
        }
        fan_out.check_done();
        Ok(handle)
    }
}

impl<K, T, E> fmt::Debug for FanOutScheduler<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutScheduler")
            .field("concurrency", &self.concurrency)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

struct Progress<K, T, E> {
    pending: VecDeque<SubTask<K, T, E>>,
    /// Running sub-tasks by slot. `None` until `start` has returned.
    running: HashMap<u64, Option<TaskHandle<T, E>>>,
    next_slot: u64,
    finished: bool,
}

struct FanOut<K, T, E> {
    composite: CompositeCore<K, T, E>,
    progress: Mutex<Progress<K, T, E>>,
}

impl<K, T, E> FanOut<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Starts the next pending sub-task, if any and not cancelled.
    fn start_next(self: &Arc<Self>) {
        let (slot, task) = {
            let mut progress = self.progress.lock();
            if self.composite.is_cancelled() {
                return;
            }
            let Some(task) = progress.pending.pop_front() else {
                return;
            };
            let slot = progress.next_slot;
            progress.next_slot += 1;
            progress.running.insert(slot, None);
            (slot, task)
        };
        trace!(slot, "starting sub-task");

        let SubTask { operation, context } = task;
        let listener = Arc::new(SubTaskListener {
            fan_out: Arc::clone(self),
            slot,
            context: Mutex::new(Some(context.clone())),
        });
        let started = catch_unwind(AssertUnwindSafe(|| operation.start(listener)));
        let handle = match started {
            Ok(handle) => handle,
            Err(payload) => {
                self.composite.add_partial_fault(
                    Fault::Panicked(PanicPayload::from_panic(payload.as_ref())),
                    context,
                );
                self.finish_slot(slot);
                return;
            }
        };

        let cancel_now = {
            let mut progress = self.progress.lock();
            if let Some(entry) = progress.running.get_mut(&slot) {
                *entry = Some(handle.clone());
            }
            self.composite.is_cancelled()
        };
        if cancel_now {
            handle.cancel();
        }
    }

    /// Retires `slot`, starts its successor, and finishes if nothing is left.
    fn finish_slot(self: &Arc<Self>, slot: u64) {
        if self.progress.lock().running.remove(&slot).is_none() {
            return;
        }
        self.start_next();
        self.check_done();
    }

    fn check_done(&self) {
        {
            let mut progress = self.progress.lock();
            if progress.finished || !progress.running.is_empty() || !progress.pending.is_empty() {
                return;
            }
            progress.finished = true;
        }
        self.composite.finish();
    }
}

impl<K, T, E> Cancellable for FanOut<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Cancels every running sub-task.
    fn cancel(&self) {
        let handles: SmallVec<[TaskHandle<T, E>; 8]> = self
            .progress
            .lock()
            .running
            .values()
            .flatten()
            .cloned()
            .collect();
        debug!(running = handles.len(), "cancelling fan-out sub-tasks");
        for handle in handles {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handle.cancel())) {
                self.composite.diagnostics().log_exception(
                    "unexpected panic while cancelling sub-task",
                    &PanicPayload::from_panic(payload.as_ref()),
                );
            }
        }
    }
}

/// Routes one sub-task's outcome into the composite.
struct SubTaskListener<K, T, E> {
    fan_out: Arc<FanOut<K, T, E>>,
    slot: u64,
    context: Mutex<Option<K>>,
}

impl<K, T, E> SubTaskListener<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn append(&self, outcome: Outcome<T, E>) {
        if let Some(context) = self.context.lock().take() {
            self.fan_out.composite.add_partial(outcome, context);
        }
    }
}

impl<K, T, E> Listener<T, E> for SubTaskListener<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn on_success(&self, value: T) {
        self.append(Outcome::Ok(value));
    }

    fn on_error(&self, failure: Failure<E>) {
        self.append(Outcome::Err(failure));
    }

    fn on_finally(&self) {
        self.fan_out.finish_slot(self.slot);
    }
}
