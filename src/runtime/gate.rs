//! FIFO admission limit over another work runner.
//!
//! A [`ConcurrencyGate`] admits at most `limit` units of work to its
//! underlying runner at once. Excess units wait in a FIFO queue. When an
//! admitted unit finishes (or unwinds), the gate decrements its running count
//! and admits the next queued unit, all under the gate's own lock.
//!
//! A refusal by the underlying runner is returned to the submitter when the
//! unit was admitted straight away. Units refused after waiting in the queue
//! can only be reported; [`execute_callable`](crate::task::execute_callable)
//! fails their tasks when the dropped unit is released.

use crate::dispatch::Work;
use crate::error::{ExecuteError, UsageError};
use crate::observability::{Diagnostics, default_diagnostics};
use crate::runtime::{ThreadPerTask, WorkRunner};
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

struct GateState {
    queue: VecDeque<Work>,
    running: usize,
}

struct GateInner {
    limit: usize,
    runner: Arc<dyn WorkRunner>,
    state: Mutex<GateState>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl GateInner {
    /// Hands an admitted unit to the runner. The caller has already taken
    /// its slot; a refusal gives the slot back.
    fn start(self: &Arc<Self>, work: Work) -> Result<(), ExecuteError> {
        let gate = Arc::clone(self);
        let admitted: Work = Box::new(move || {
            let _release = Release { gate };
            work();
        });
        self.runner.execute(admitted).inspect_err(|_| {
            self.state.lock().running -= 1;
        })
    }

    /// Admits queued units until the limit is reached or the queue is empty.
    fn refill(self: &Arc<Self>) {
        loop {
            let work = {
                let mut state = self.state.lock();
                if state.running >= self.limit {
                    return;
                }
                let Some(work) = state.queue.pop_front() else {
                    return;
                };
                state.running += 1;
                work
            };
            if let Err(err) = self.start(work) {
                self.diagnostics
                    .log_exception("concurrency gate could not start queued work", &err);
            }
        }
    }
}

/// Releases one admission slot when an admitted unit ends.
struct Release {
    gate: Arc<GateInner>,
}

impl Drop for Release {
    fn drop(&mut self) {
        {
            let mut state = self.gate.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.gate.refill();
    }
}

/// Runner that admits at most `limit` units of work at a time.
///
/// Cloning yields another handle to the same gate.
#[derive(Clone)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

impl ConcurrencyGate {
    /// Gates `runner` to `limit` concurrent units.
    pub fn new(limit: usize, runner: Arc<dyn WorkRunner>) -> Result<Self, UsageError> {
        Self::with_diagnostics(limit, runner, default_diagnostics())
    }

    /// Gates a [`ThreadPerTask`] runner to `limit` concurrent units.
    pub fn with_threads(limit: usize) -> Result<Self, UsageError> {
        Self::new(limit, Arc::new(ThreadPerTask::default()))
    }

    /// Gates `runner`, reporting refused work to `diagnostics`.
    pub fn with_diagnostics(
        limit: usize,
        runner: Arc<dyn WorkRunner>,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<Self, UsageError> {
        if limit == 0 {
            return Err(UsageError::ZeroConcurrency);
        }
        Ok(Self {
            inner: Arc::new(GateInner {
                limit,
                runner,
                state: Mutex::new(GateState {
                    queue: VecDeque::new(),
                    running: 0,
                }),
                diagnostics,
            }),
        })
    }

    /// The admission limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Number of admitted units that have not finished.
    #[must_use]
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Number of units waiting for admission.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl WorkRunner for ConcurrencyGate {
    /// Admits `work` at once if a slot is free and nothing is queued,
    /// otherwise queues it.
    ///
    /// A unit admitted at once fails with the underlying runner's error if
    /// that runner refuses it. A queued unit that is refused later is
    /// reported through diagnostics and dropped.
    fn execute(&self, work: Work) -> Result<(), ExecuteError> {
        let direct = {
            let mut state = self.inner.state.lock();
            if state.running < self.inner.limit && state.queue.is_empty() {
                state.running += 1;
                Some(work)
            } else {
                state.queue.push_back(work);
                trace!(
                    queued = state.queue.len(),
                    running = state.running,
                    "work queued at gate"
                );
                None
            }
        };
        let result = direct.map_or(Ok(()), |work| self.inner.start(work));
        self.inner.refill();
        result
    }
}

impl fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConcurrencyGate")
            .field("limit", &self.inner.limit)
            .field("running", &state.running)
            .field("queued", &state.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::dispatch::{Dispatcher, QueueDispatcher, Synchronous};
    use crate::observability::RecordingDiagnostics;
    use crate::runtime::WorkerPool;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    /// Runner that parks work in a queue so tests can start units by hand.
    struct ManualRunner(QueueDispatcher);

    impl WorkRunner for ManualRunner {
        fn execute(&self, work: Work) -> Result<(), ExecuteError> {
            self.0.dispatch(work);
            Ok(())
        }
    }

    struct InlineRunner;

    impl WorkRunner for InlineRunner {
        fn execute(&self, work: Work) -> Result<(), ExecuteError> {
            Synchronous.dispatch(work);
            Ok(())
        }
    }

    struct RefusingRunner;

    impl WorkRunner for RefusingRunner {
        fn execute(&self, _work: Work) -> Result<(), ExecuteError> {
            Err(ExecuteError::Shutdown)
        }
    }

    #[test]
    fn zero_limit_is_a_usage_error() {
        init_test("zero_limit_is_a_usage_error");
        let result = ConcurrencyGate::new(0, Arc::new(InlineRunner));
        crate::assert_with_log!(
            matches!(result, Err(UsageError::ZeroConcurrency)),
            "zero limit rejected",
            "ZeroConcurrency",
            result.as_ref().map(ConcurrencyGate::limit)
        );
        crate::test_complete!("zero_limit_is_a_usage_error");
    }

    #[test]
    fn admits_up_to_limit_then_queues_fifo() {
        init_test("admits_up_to_limit_then_queues_fifo");
        let runner = Arc::new(ManualRunner(QueueDispatcher::new()));
        let gate = ConcurrencyGate::new(2, runner.clone()).expect("gate");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            gate.execute(Box::new(move || order.lock().push(i)))
                .expect("execute");
        }
        assert_eq!(gate.running(), 2);
        assert_eq!(gate.queued(), 3);
        assert_eq!(runner.0.len(), 2);

        // Finishing one admitted unit admits exactly one more.
        assert!(runner.0.run_one());
        assert_eq!(gate.running(), 2);
        assert_eq!(gate.queued(), 2);

        runner.0.run_pending();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(gate.running(), 0);
        assert_eq!(gate.queued(), 0);
        crate::test_complete!("admits_up_to_limit_then_queues_fifo");
    }

    #[test]
    fn panicking_unit_still_releases_its_slot() {
        init_test("panicking_unit_still_releases_its_slot");
        let runner = Arc::new(ManualRunner(QueueDispatcher::new()));
        let gate = ConcurrencyGate::new(1, runner.clone()).expect("gate");
        gate.execute(Box::new(|| panic!("admitted unit failed")))
            .expect("execute");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        gate.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("execute");
        assert_eq!(gate.queued(), 1);

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| runner.0.run_one()));
        assert!(unwound.is_err());
        assert_eq!(gate.running(), 1, "next unit admitted after unwind");
        runner.0.run_pending();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        crate::test_complete!("panicking_unit_still_releases_its_slot");
    }

    #[test]
    fn refusal_at_admission_is_returned_and_slot_released() {
        init_test("refusal_at_admission_is_returned_and_slot_released");
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let gate = ConcurrencyGate::with_diagnostics(1, Arc::new(RefusingRunner), diagnostics.clone())
            .expect("gate");
        let first = gate.execute(Box::new(|| {}));
        crate::assert_with_log!(
            first == Err(ExecuteError::Shutdown),
            "runner refusal surfaces",
            Err::<(), _>(ExecuteError::Shutdown),
            first
        );
        assert_eq!(gate.execute(Box::new(|| {})), Err(ExecuteError::Shutdown));
        assert!(diagnostics.is_empty(), "returned refusals are not also logged");
        assert_eq!(gate.running(), 0);
        assert_eq!(gate.queued(), 0);
        crate::test_complete!("refusal_at_admission_is_returned_and_slot_released");
    }

    /// Parks accepted work; refuses everything once closed.
    #[derive(Default)]
    struct ClosingRunner {
        parked: QueueDispatcher,
        closed: std::sync::atomic::AtomicBool,
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

    #[test]
    fn queued_refusal_is_reported_and_slot_released() {
        init_test("queued_refusal_is_reported_and_slot_released");
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let runner = Arc::new(ClosingRunner::default());
        let gate = ConcurrencyGate::with_diagnostics(1, runner.clone(), diagnostics.clone())
            .expect("gate");
        gate.execute(Box::new(|| {})).expect("admitted");
        gate.execute(Box::new(|| {})).expect("queued");
        assert_eq!(gate.queued(), 1);

        runner.closed.store(true, Ordering::SeqCst);
        runner.parked.run_pending();
        crate::assert_with_log!(
            diagnostics.contains("concurrency gate could not start queued work"),
            "queued refusal reported",
            1,
            diagnostics.len()
        );
        assert_eq!(gate.running(), 0);
        assert_eq!(gate.queued(), 0);
        crate::test_complete!("queued_refusal_is_reported_and_slot_released");
    }

    #[test]
    fn bounds_concurrency_on_real_threads() {
        init_test("bounds_concurrency_on_real_threads");
        let pool = WorkerPool::new(PoolConfig::default());
        let gate = ConcurrencyGate::new(3, Arc::new(pool.handle())).expect("gate");
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..20 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            gate.execute(Box::new(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).expect("send");
            }))
            .expect("execute");
        }
        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(10)).expect("unit finished");
        }
        let peak = peak.load(Ordering::SeqCst);
        crate::assert_with_log!(peak <= 3, "concurrency bounded by limit", 3, peak);
        crate::test_complete!("bounds_concurrency_on_real_threads");
    }

    #[test]
    fn with_threads_runs_everything() {
        init_test("with_threads_runs_everything");
        let gate = ConcurrencyGate::with_threads(2).expect("gate");
        let (tx, rx) = mpsc::channel();
        for i in 0..6 {
            let tx = tx.clone();
            gate.execute(Box::new(move || tx.send(i).expect("send")))
                .expect("execute");
        }
        let mut seen: Vec<i32> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).expect("recv"))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        crate::test_complete!("with_threads_runs_everything");
    }
}
