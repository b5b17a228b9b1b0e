//! Dispatchers: where terminal notifications get delivered.
//!
//! A [`Dispatcher`] runs one unit of [`Work`] on some execution context. A
//! completion core hands every notification it produces to its dispatcher as
//! a single unit, so the dispatcher decides which thread observes callbacks.
//!
//! | Dispatcher | Behavior |
//! |------------|----------|
//! | [`Discard`] | drops the work (nobody is listening) |
//! | [`Synchronous`] | runs inline; rejected by completion cores |
//! | [`QueueDispatcher`] | FIFO queue drained explicitly by the owner |
//! | [`EventLoop`] | dedicated thread draining a FIFO queue |
//! | [`RunnerDispatcher`] | hands the work to a [`WorkRunner`] |
//!
//! Inline delivery is forbidden for completion cores: a commit performed from
//! inside a callback would re-enter listener code on the same stack.

use crate::error::ExecuteError;
use crate::observability::{Diagnostics, default_diagnostics};
use crate::runtime::WorkRunner;
use crate::tracing_compat::{debug, trace, warn};
use crate::types::PanicPayload;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// A boxed unit of work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Runs units of work on some execution context.
pub trait Dispatcher: Send + Sync {
    /// Schedules `work` to run.
    fn dispatch(&self, work: Work);

    /// Returns true if `dispatch` runs the work before returning.
    fn is_synchronous(&self) -> bool {
        false
    }
}

/// Dispatcher that drops all work.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl Dispatcher for Discard {
    fn dispatch(&self, work: Work) {
        drop(work);
    }
}

/// Dispatcher that runs work inline on the calling thread.
///
/// Useful for plain work queues; completion cores refuse it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Synchronous;

impl Dispatcher for Synchronous {
    fn dispatch(&self, work: Work) {
        work();
    }

    fn is_synchronous(&self) -> bool {
        true
    }
}

/// FIFO dispatcher drained explicitly by its owner.
///
/// Nothing runs until [`run_pending`](Self::run_pending) or
/// [`run_one`](Self::run_one) is called, which makes delivery order fully
/// deterministic in tests.
#[derive(Default)]
pub struct QueueDispatcher {
    queue: SegQueue<Work>,
}

impl QueueDispatcher {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Runs the oldest queued unit. Returns false if the queue was empty.
    pub fn run_one(&self) -> bool {
        self.queue.pop().is_some_and(|work| {
            work();
            true
        })
    }

    /// Runs queued units until the queue is empty, including units queued
    /// while draining. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Returns the number of queued units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl fmt::Debug for QueueDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self, work: Work) {
        self.queue.push(work);
    }
}

struct LoopState {
    queue: VecDeque<Work>,
    shutdown: bool,
}

struct LoopShared {
    state: Mutex<LoopState>,
    ready: Condvar,
    diagnostics: Arc<dyn Diagnostics>,
}

/// Dispatcher backed by one dedicated thread.
///
/// Work runs in dispatch order on the loop thread. A panicking unit is
/// reported through diagnostics and the loop keeps going. Dropping the loop
/// drains queued work and joins the thread.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Starts a loop thread with the given name.
    pub fn spawn(name: impl Into<String>) -> Result<Self, ExecuteError> {
        Self::spawn_with_diagnostics(name, default_diagnostics())
    }

    /// Starts a loop thread reporting panics to `diagnostics`.
    pub fn spawn_with_diagnostics(
        name: impl Into<String>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<Self, ExecuteError> {
        let shared = Arc::new(LoopShared {
            state: Mutex::new(LoopState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
            diagnostics,
        });
        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || run_loop(&loop_shared))?;
        let thread_id = handle.thread().id();
        debug!(thread = ?thread_id, "event loop started");
        Ok(Self {
            shared,
            thread_id,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Returns true if called from the loop thread.
    #[must_use]
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Returns the number of units waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stops accepting work, drains the queue, and joins the loop thread.
    ///
    /// When called from the loop thread itself the join is skipped.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.ready.notify_all();
        if self.is_loop_thread() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.thread_id)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Dispatcher for EventLoop {
    fn dispatch(&self, work: Work) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            drop(state);
            warn!("event loop is shut down; dropping work");
            return;
        }
        state.queue.push_back(work);
        drop(state);
        self.shared.ready.notify_one();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: &LoopShared) {
    loop {
        let work = {
            let mut state = shared.state.lock();
            loop {
                if let Some(work) = state.queue.pop_front() {
                    break Some(work);
                }
                if state.shutdown {
                    break None;
                }
                shared.ready.wait(&mut state);
            }
        };
        let Some(work) = work else {
            trace!("event loop exiting");
            return;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            shared.diagnostics.log_exception(
                "event loop work panicked",
                &PanicPayload::from_panic(payload.as_ref()),
            );
        }
    }
}

/// Dispatcher that hands each unit to a [`WorkRunner`].
///
/// Units the runner refuses are dropped and reported through diagnostics.
pub struct RunnerDispatcher<R> {
    runner: R,
    diagnostics: Arc<dyn Diagnostics>,
}

impl<R: WorkRunner> RunnerDispatcher<R> {
    /// Dispatches onto `runner`.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            diagnostics: default_diagnostics(),
        }
    }

    /// Reports refused work to `diagnostics` instead of the default.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Returns the wrapped runner.
    #[must_use]
    pub fn runner(&self) -> &R {
        &self.runner
    }
}

impl<R: fmt::Debug> fmt::Debug for RunnerDispatcher<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerDispatcher")
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

impl<R: WorkRunner> Dispatcher for RunnerDispatcher<R> {
    fn dispatch(&self, work: Work) {
        if let Err(err) = self.runner.execute(work) {
            self.diagnostics
                .log_exception("work runner refused a notification", &err);
        }
    }
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn dispatch(&self, work: Work) {
        (**self).dispatch(work);
    }

    fn is_synchronous(&self) -> bool {
        (**self).is_synchronous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::RecordingDiagnostics;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    #[test]
    fn discard_drops_work() {
        init_test("discard_drops_work");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        Discard.dispatch(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        crate::assert_with_log!(
            ran.load(Ordering::SeqCst) == 0,
            "discarded work never runs",
            0,
            ran.load(Ordering::SeqCst)
        );
        assert!(!Discard.is_synchronous());
        crate::test_complete!("discard_drops_work");
    }

    #[test]
    fn synchronous_runs_inline() {
        init_test("synchronous_runs_inline");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        Synchronous.dispatch(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(Synchronous.is_synchronous());
        let shared: Arc<dyn Dispatcher> = Arc::new(Synchronous);
        assert!(shared.is_synchronous());
        crate::test_complete!("synchronous_runs_inline");
    }

    #[test]
    fn queue_dispatcher_runs_in_fifo_order() {
        init_test("queue_dispatcher_runs_in_fifo_order");
        let queue = Arc::new(QueueDispatcher::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.dispatch(Box::new(move || order.lock().push(i)));
        }
        assert_eq!(queue.len(), 3);
        assert!(queue.run_one());
        assert_eq!(*order.lock(), vec![0]);
        assert_eq!(queue.run_pending(), 2);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(queue.is_empty());
        assert!(!queue.run_one());
        crate::test_complete!("queue_dispatcher_runs_in_fifo_order");
    }

    #[test]
    fn queue_dispatcher_drains_work_queued_while_draining() {
        init_test("queue_dispatcher_drains_work_queued_while_draining");
        let queue = Arc::new(QueueDispatcher::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let inner_queue = Arc::clone(&queue);
        let inner_ran = Arc::clone(&ran);
        queue.dispatch(Box::new(move || {
            inner_ran.fetch_add(1, Ordering::SeqCst);
            let again = Arc::clone(&inner_ran);
            inner_queue.dispatch(Box::new(move || {
                again.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        let ran_count = queue.run_pending();
        crate::assert_with_log!(ran_count == 2, "nested work drained", 2, ran_count);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        crate::test_complete!("queue_dispatcher_drains_work_queued_while_draining");
    }

    #[test]
    fn event_loop_runs_on_its_own_thread_in_order() {
        init_test("event_loop_runs_on_its_own_thread_in_order");
        let event_loop = Arc::new(EventLoop::spawn("test-loop").expect("spawn loop"));
        assert!(!event_loop.is_loop_thread());
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            let loop_ref = Arc::clone(&event_loop);
            event_loop.dispatch(Box::new(move || {
                tx.send((i, loop_ref.is_loop_thread())).expect("send");
            }));
        }
        let seen: Vec<(i32, bool)> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("recv"))
            .collect();
        assert_eq!(seen, vec![(0, true), (1, true), (2, true), (3, true)]);
        crate::test_complete!("event_loop_runs_on_its_own_thread_in_order");
    }

    #[test]
    fn event_loop_survives_panicking_work() {
        init_test("event_loop_survives_panicking_work");
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let event_loop = EventLoop::spawn_with_diagnostics("panicky-loop", diagnostics.clone())
            .expect("spawn loop");
        event_loop.dispatch(Box::new(|| panic!("unit failed")));
        let (tx, rx) = mpsc::channel();
        event_loop.dispatch(Box::new(move || tx.send(()).expect("send")));
        rx.recv_timeout(Duration::from_secs(5)).expect("loop kept running");
        let records = diagnostics.records();
        crate::assert_with_log!(records.len() == 1, "one panic reported", 1, records.len());
        assert_eq!(records[0].fault, "panic: unit failed");
        crate::test_complete!("event_loop_survives_panicking_work");
    }

    #[test]
    fn event_loop_shutdown_drains_and_then_drops() {
        init_test("event_loop_shutdown_drains_and_then_drops");
        let event_loop = EventLoop::spawn("drain-loop").expect("spawn loop");
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            event_loop.dispatch(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        event_loop.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 10);

        let late = Arc::clone(&ran);
        event_loop.dispatch(Box::new(move || {
            late.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        crate::test_complete!("event_loop_shutdown_drains_and_then_drops");
    }

    struct Refusing;

    impl WorkRunner for Refusing {
        fn execute(&self, _work: Work) -> Result<(), ExecuteError> {
            Err(ExecuteError::Shutdown)
        }
    }

    #[test]
    fn runner_dispatcher_reports_refused_work() {
        init_test("runner_dispatcher_reports_refused_work");
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let dispatcher = RunnerDispatcher::new(Refusing).with_diagnostics(diagnostics.clone());
        dispatcher.dispatch(Box::new(|| {}));
        assert!(diagnostics.contains("refused"));
        assert_eq!(diagnostics.records()[0].fault, "work runner has been shut down");
        crate::test_complete!("runner_dispatcher_reports_refused_work");
    }
}
