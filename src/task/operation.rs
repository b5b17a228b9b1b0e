//! Asynchronous operations and adapters around them.
//!
//! [`AsyncOperation`] is the shape of every asynchronous function: give it a
//! listener, get back a handle. [`execute_callable`] turns a blocking
//! [`Callable`] into one by running it on a [`WorkRunner`], and
//! [`block_for_result`] goes the other way.

use crate::dispatch::{Dispatcher, Work};
use crate::error::{ExecuteError, GetError, UsageError};
use crate::runtime::WorkRunner;
use crate::task::core::CompletionCore;
use crate::task::handle::{CancelFn, TaskHandle};
use crate::task::listener::Listener;
use crate::tracing_compat::trace;
use crate::types::{Failure, Fault, PanicPayload};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// An operation that reports its outcome to a listener.
pub trait AsyncOperation<T, E>: Send + Sync {
    /// Starts the operation. The listener hears exactly one terminal callback
    /// followed by `on_finally`.
    fn start(&self, listener: Arc<dyn Listener<T, E>>) -> TaskHandle<T, E>;
}

impl<T, E, O: AsyncOperation<T, E> + ?Sized> AsyncOperation<T, E> for Arc<O> {
    fn start(&self, listener: Arc<dyn Listener<T, E>>) -> TaskHandle<T, E> {
        (**self).start(listener)
    }
}

/// [`AsyncOperation`] backed by a closure. See [`from_fn`].
#[derive(Clone, Copy)]
pub struct FnOperation<F>(F);

impl<T, E, F> AsyncOperation<T, E> for FnOperation<F>
where
    F: Fn(Arc<dyn Listener<T, E>>) -> TaskHandle<T, E> + Send + Sync,
{
    fn start(&self, listener: Arc<dyn Listener<T, E>>) -> TaskHandle<T, E> {
        (self.0)(listener)
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation").finish_non_exhaustive()
    }
}

/// Wraps a closure as an [`AsyncOperation`].
pub fn from_fn<T, E, F>(f: F) -> FnOperation<F>
where
    F: Fn(Arc<dyn Listener<T, E>>) -> TaskHandle<T, E> + Send + Sync,
{
    FnOperation(f)
}

/// Blocking work that can be asked to stop early.
pub trait Callable<T, E>: Send + Sync + 'static {
    /// Runs the work to completion on the calling thread.
    fn call(&self) -> Result<T, E>;

    /// Asks a running `call` to stop. Called from another thread.
    fn cancel(&self) {}
}

/// [`Callable`] backed by a closure; `cancel` does nothing.
#[derive(Clone, Copy)]
pub struct FnCallable<F>(pub F);

impl<T, E, F> Callable<T, E> for FnCallable<F>
where
    F: Fn() -> Result<T, E> + Send + Sync + 'static,
{
    fn call(&self) -> Result<T, E> {
        (self.0)()
    }
}

impl<F> fmt::Debug for FnCallable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCallable").finish_non_exhaustive()
    }
}

/// Runs `callable` on `runner` and reports its outcome to `listener`.
///
/// Cancelling the returned handle forwards to [`Callable::cancel`]. A panic in
/// `call` is committed as [`Fault::Panicked`]. If the runner refuses the work,
/// or accepts it and later drops it unrun, the task fails with
/// [`Fault::Rejected`].
pub fn execute_callable<T, E>(
    callable: Arc<dyn Callable<T, E>>,
    listener: Arc<dyn Listener<T, E>>,
    dispatcher: Arc<dyn Dispatcher>,
    runner: &dyn WorkRunner,
) -> Result<TaskHandle<T, E>, UsageError>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let forward = Arc::clone(&callable);
    let core = CompletionCore::builder(listener, dispatcher)
        .on_cancel(Arc::new(CancelFn(move || forward.cancel())))
        .build()?;
    Ok(run_on(core, callable, runner))
}

const SUBMITTING: u8 = 0;
const ACCEPTED: u8 = 1;
const DROPPED_EARLY: u8 = 2;

/// Owns a task's unit of work until it runs.
///
/// Dropping it unrun after the runner accepted it fails the task with
/// [`ExecuteError::Dropped`]. A drop during submission is left to the
/// submitter, which knows whether the runner refused.
struct PendingRun<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    core: Option<CompletionCore<T, E>>,
    state: Arc<AtomicU8>,
}

impl<T, E> Drop for PendingRun<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn drop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        let early = self
            .state
            .compare_exchange(SUBMITTING, DROPPED_EARLY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !early {
            trace!(core = %core.id(), "accepted work dropped unrun");
            core.commit_fault(Fault::Rejected(ExecuteError::Dropped));
        }
    }
}

fn run_on<T, E>(
    core: CompletionCore<T, E>,
    callable: Arc<dyn Callable<T, E>>,
    runner: &dyn WorkRunner,
) -> TaskHandle<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let state = Arc::new(AtomicU8::new(SUBMITTING));
    let mut pending = PendingRun {
        core: Some(core.clone()),
        state: Arc::clone(&state),
    };
    let work: Work = Box::new(move || {
        let Some(worker) = pending.core.take() else {
            return;
        };
        if worker.is_done() {
            trace!(core = %worker.id(), "callable skipped; task already resolved");
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| callable.call())) {
            Ok(Ok(value)) => worker.commit_result(value),
            Ok(Err(error)) => worker.commit_error(error),
            Err(payload) => {
                worker.commit_fault(Fault::Panicked(PanicPayload::from_panic(payload.as_ref())))
            }
        };
    });
    match runner.execute(work) {
        Err(err) => {
            core.commit_fault(Fault::Rejected(err));
        }
        Ok(()) => {
            let dropped_early = state
                .compare_exchange(SUBMITTING, ACCEPTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err();
            if dropped_early {
                core.commit_fault(Fault::Rejected(ExecuteError::Dropped));
            }
        }
    }
    core.handle()
}

type CallableFactory<T, E> = Box<dyn Fn() -> Arc<dyn Callable<T, E>> + Send + Sync>;

/// [`AsyncOperation`] that runs a fresh callable on a runner per start.
pub struct CallableOperation<T, E> {
    factory: CallableFactory<T, E>,
    dispatcher: Arc<dyn Dispatcher>,
    runner: Arc<dyn WorkRunner>,
}

impl<T, E> CallableOperation<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Each [`start`](AsyncOperation::start) calls `factory` and runs the
    /// callable on `runner`, notifying through `dispatcher`.
    ///
    /// Rejects synchronous dispatchers up front.
    pub fn new(
        factory: impl Fn() -> Arc<dyn Callable<T, E>> + Send + Sync + 'static,
        dispatcher: Arc<dyn Dispatcher>,
        runner: Arc<dyn WorkRunner>,
    ) -> Result<Self, UsageError> {
        if dispatcher.is_synchronous() {
            return Err(UsageError::SynchronousDispatcher);
        }
        Ok(Self {
            factory: Box::new(factory),
            dispatcher,
            runner,
        })
    }
}

impl<T, E> AsyncOperation<T, E> for CallableOperation<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn start(&self, listener: Arc<dyn Listener<T, E>>) -> TaskHandle<T, E> {
        let callable = (self.factory)();
        let forward = Arc::clone(&callable);
        let core = CompletionCore::builder(listener, Arc::clone(&self.dispatcher))
            .on_cancel(Arc::new(CancelFn(move || forward.cancel())))
            .build_unchecked();
        run_on(core, callable, self.runner.as_ref())
    }
}

impl<T, E> fmt::Debug for CallableOperation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableOperation").finish_non_exhaustive()
    }
}

struct BlockingState<T, E> {
    result: Option<Result<T, GetError<E>>>,
    finished: bool,
}

/// Captures the outcome and wakes the waiter in `on_finally`.
struct BlockingListener<T, E> {
    state: Mutex<BlockingState<T, E>>,
    finished: Condvar,
}

impl<T: Send, E: Send> BlockingListener<T, E> {
    fn record(&self, result: Result<T, GetError<E>>) {
        self.state.lock().result = Some(result);
    }

    fn wait(&self) -> Result<T, GetError<E>> {
        let mut state = self.state.lock();
        while !state.finished {
            self.finished.wait(&mut state);
        }
        state.result.take().unwrap_or(Err(GetError::Cancelled))
    }
}

impl<T: Send, E: Send> Listener<T, E> for BlockingListener<T, E> {
    fn on_success(&self, value: T) {
        self.record(Ok(value));
    }

    fn on_error(&self, failure: Failure<E>) {
        self.record(Err(failure.into()));
    }

    fn on_cancel(&self) {
        self.record(Err(GetError::Cancelled));
    }

    fn on_finally(&self) {
        self.state.lock().finished = true;
        self.finished.notify_all();
    }
}

/// Starts `operation` and blocks until its listener has been finalized.
///
/// Deadlocks if the operation delivers on the calling thread's own
/// dispatcher.
pub fn block_for_result<T, E>(operation: &dyn AsyncOperation<T, E>) -> Result<T, GetError<E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let listener = Arc::new(BlockingListener {
        state: Mutex::new(BlockingState {
            result: None,
            finished: false,
        }),
        finished: Condvar::new(),
    });
    let _handle = operation.start(listener.clone());
    listener.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{EventLoop, QueueDispatcher, Synchronous};
    use crate::runtime::{ConcurrencyGate, ThreadPerTask};
    use crate::test_utils::{Event, RecordingListener, init_test_logging};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;
    use std::time::Duration;

    type Recorder = RecordingListener<(), i32, String>;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    struct RefusingRunner;

    impl WorkRunner for RefusingRunner {
        fn execute(&self, _work: Work) -> Result<(), ExecuteError> {
            Err(ExecuteError::Shutdown)
        }
    }

    /// Parks accepted work until the test runs it; refuses once closed.
    #[derive(Default)]
    struct ClosingRunner {
        parked: QueueDispatcher,
        closed: AtomicBool,
    }

    impl WorkRunner for ClosingRunner {
        fn execute(&self, work: Work) -> Result<(), ExecuteError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ExecuteError::Shutdown);
            }
            self.parked.dispatch(work);
            Ok(())
        }
    }

    /// Accepts work and throws it away.
    struct DiscardingRunner;

    impl WorkRunner for DiscardingRunner {
        fn execute(&self, work: Work) -> Result<(), ExecuteError> {
            drop(work);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Interruptible {
        stop: AtomicBool,
        cancels: AtomicUsize,
    }

    impl Callable<i32, String> for Interruptible {
        fn call(&self) -> Result<i32, String> {
            while !self.stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Err("interrupted".to_string())
        }

        fn cancel(&self) {
            self.stop.store(true, Ordering::SeqCst);
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn callable(f: fn() -> Result<i32, String>) -> Arc<dyn Callable<i32, String>> {
        Arc::new(FnCallable(f))
    }

    #[test]
    fn callable_value_reaches_get_and_listener() {
        init_test("callable_value_reaches_get_and_listener");
        let recorder = Arc::new(Recorder::new());
        let dispatcher = Arc::new(QueueDispatcher::new());
        let handle = execute_callable(
            callable(|| Ok(42)),
            recorder.clone(),
            dispatcher.clone(),
            &ThreadPerTask::new("callable-test"),
        )
        .expect("started");

        let got = handle.get();
        crate::assert_with_log!(got == Ok(42), "value retrieved", Ok::<i32, ()>(42), got);
        dispatcher.run_pending();
        assert_eq!(recorder.events(), vec![Event::Success(42), Event::Finally]);
        crate::test_complete!("callable_value_reaches_get_and_listener");
    }

    #[test]
    fn callable_error_and_panic_are_failures() {
        init_test("callable_error_and_panic_are_failures");
        let runner = ThreadPerTask::new("callable-test");
        let failing = execute_callable(
            callable(|| Err("nope".to_string())),
            Arc::new(Recorder::new()),
            Arc::new(QueueDispatcher::new()),
            &runner,
        )
        .expect("started");
        assert_eq!(failing.get(), Err(GetError::Failed("nope".to_string())));

        let panicking = execute_callable(
            callable(|| panic!("callable exploded")),
            Arc::new(Recorder::new()),
            Arc::new(QueueDispatcher::new()),
            &runner,
        )
        .expect("started");
        let got = panicking.get();
        crate::assert_with_log!(
            matches!(&got, Err(GetError::Fault(Fault::Panicked(p))) if p.message() == "callable exploded"),
            "panic wrapped as fault",
            "Fault(Panicked)",
            got
        );
        crate::test_complete!("callable_error_and_panic_are_failures");
    }

    #[test]
    fn refused_work_fails_with_rejected_fault() {
        init_test("refused_work_fails_with_rejected_fault");
        let recorder = Arc::new(Recorder::new());
        let dispatcher = Arc::new(QueueDispatcher::new());
        let handle = execute_callable(
            callable(|| Ok(1)),
            recorder.clone(),
            dispatcher.clone(),
            &RefusingRunner,
        )
        .expect("started");
        assert_eq!(
            handle.get(),
            Err(GetError::Fault(Fault::Rejected(ExecuteError::Shutdown)))
        );
        dispatcher.run_pending();
        assert_eq!(recorder.terminal_count(), 1);
        crate::test_complete!("refused_work_fails_with_rejected_fault");
    }

    #[test]
    fn gate_refusing_at_admission_fails_the_task() {
        init_test("gate_refusing_at_admission_fails_the_task");
        let dispatcher = Arc::new(QueueDispatcher::new());
        let gate = ConcurrencyGate::new(1, Arc::new(RefusingRunner)).expect("gate");
        let handle = execute_callable(
            callable(|| Ok(1)),
            Arc::new(Recorder::new()),
            dispatcher.clone(),
            &gate,
        )
        .expect("started");
        crate::assert_with_log!(
            handle.is_done(),
            "refusal resolves the task",
            true,
            handle.is_done()
        );
        assert_eq!(
            handle.get(),
            Err(GetError::Fault(Fault::Rejected(ExecuteError::Shutdown)))
        );
        crate::test_complete!("gate_refusing_at_admission_fails_the_task");
    }

    #[test]
    fn queued_work_refused_later_fails_the_task() {
        init_test("queued_work_refused_later_fails_the_task");
        let dispatcher = Arc::new(QueueDispatcher::new());
        let runner = Arc::new(ClosingRunner::default());
        let gate = ConcurrencyGate::new(1, runner.clone()).expect("gate");
        let first = execute_callable(
            callable(|| Ok(1)),
            Arc::new(Recorder::new()),
            dispatcher.clone(),
            &gate,
        )
        .expect("started");
        let recorder = Arc::new(Recorder::new());
        let queued = execute_callable(
            callable(|| Ok(2)),
            recorder.clone(),
            dispatcher.clone(),
            &gate,
        )
        .expect("started");
        assert_eq!(gate.queued(), 1);
        assert!(!queued.is_done());

        runner.closed.store(true, Ordering::SeqCst);
        runner.parked.run_pending();
        assert_eq!(first.get(), Ok(1));
        assert_eq!(
            queued.get(),
            Err(GetError::Fault(Fault::Rejected(ExecuteError::Dropped)))
        );
        dispatcher.run_pending();
        assert_eq!(recorder.terminal_count(), 1);
        crate::test_complete!("queued_work_refused_later_fails_the_task");
    }

    #[test]
    fn accepted_work_dropped_unrun_fails_the_task() {
        init_test("accepted_work_dropped_unrun_fails_the_task");
        let handle = execute_callable(
            callable(|| Ok(1)),
            Arc::new(Recorder::new()),
            Arc::new(QueueDispatcher::new()),
            &DiscardingRunner,
        )
        .expect("started");
        assert_eq!(
            handle.get(),
            Err(GetError::Fault(Fault::Rejected(ExecuteError::Dropped)))
        );
        crate::test_complete!("accepted_work_dropped_unrun_fails_the_task");
    }

    #[test]
    fn cancel_forwards_to_callable() {
        init_test("cancel_forwards_to_callable");
        let work = Arc::new(Interruptible::default());
        let recorder = Arc::new(Recorder::new());
        let dispatcher = Arc::new(QueueDispatcher::new());
        let as_callable: Arc<dyn Callable<i32, String>> = work.clone();
        let handle = execute_callable(
            as_callable,
            recorder.clone(),
            dispatcher.clone(),
            &ThreadPerTask::new("callable-test"),
        )
        .expect("started");

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.get(), Err(GetError::Cancelled));
        assert_eq!(work.cancels.load(Ordering::SeqCst), 1);
        dispatcher.run_pending();
        assert_eq!(recorder.events(), vec![Event::Cancel, Event::Finally]);
        crate::test_complete!("cancel_forwards_to_callable");
    }

    #[test]
    fn execute_callable_rejects_synchronous_dispatch() {
        init_test("execute_callable_rejects_synchronous_dispatch");
        let result = execute_callable(
            callable(|| Ok(1)),
            Arc::new(Recorder::new()),
            Arc::new(Synchronous),
            &ThreadPerTask::default(),
        );
        assert!(matches!(result, Err(UsageError::SynchronousDispatcher)));
        let op = CallableOperation::<i32, String>::new(
            || callable(|| Ok(1)),
            Arc::new(Synchronous),
            Arc::new(ThreadPerTask::default()),
        );
        assert!(matches!(op, Err(UsageError::SynchronousDispatcher)));
        crate::test_complete!("execute_callable_rejects_synchronous_dispatch");
    }

    #[test]
    fn block_for_result_waits_for_finally() {
        init_test("block_for_result_waits_for_finally");
        let event_loop = Arc::new(EventLoop::spawn("op-test-loop").expect("event loop"));
        let op = CallableOperation::new(
            || callable(|| Ok(7)),
            event_loop.clone(),
            Arc::new(ThreadPerTask::new("op-test")),
        )
        .expect("operation");
        assert_eq!(block_for_result::<i32, String>(&op), Ok(7));

        let failing = CallableOperation::new(
            || callable(|| Err("bad".to_string())),
            event_loop.clone(),
            Arc::new(ThreadPerTask::new("op-test")),
        )
        .expect("operation");
        assert_eq!(
            block_for_result::<i32, String>(&failing),
            Err(GetError::Failed("bad".to_string()))
        );
        event_loop.shutdown();
        crate::test_complete!("block_for_result_waits_for_finally");
    }

    #[test]
    fn from_fn_adapts_closures() {
        init_test("from_fn_adapts_closures");
        let event_loop = Arc::new(EventLoop::spawn("op-fn-loop").expect("event loop"));
        let dispatcher: Arc<dyn Dispatcher> = event_loop.clone();
        let op = from_fn(move |listener: Arc<dyn Listener<i32, String>>| {
            let core = CompletionCore::new(listener, Arc::clone(&dispatcher)).expect("core");
            core.commit_result(3);
            core.handle()
        });
        assert_eq!(block_for_result::<i32, String>(&op), Ok(3));
        event_loop.shutdown();
        crate::test_complete!("from_fn_adapts_closures");
    }
}
