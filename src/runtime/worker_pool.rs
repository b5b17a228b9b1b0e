//! Cached pool of reusable worker threads.
//!
//! The pool grows on demand: a unit of work submitted while no thread is idle
//! gets a freshly spawned thread. When a thread finishes its unit it parks in
//! the idle cache, unless the cache already holds
//! [`cache_size`](crate::config::PoolConfig::cache_size) threads, in which
//! case it exits.
//!
//! ## Thread Lifecycle
//!
//! Every worker owns a slot (a mutex-guarded assignment plus a condvar).
//! Submitting work to an idle worker fills its slot and wakes it; nothing else
//! is shared between workers. The idle cache hands out the longest-idle
//! worker first.
//!
//! A unit that panics is reported through diagnostics and its worker retires.
//!
//! ## Shutdown
//!
//! [`WorkerPool::shutdown`] stops accepting work and retires idle workers.
//! Busy workers finish their current unit and then exit.
//! [`WorkerPool::shutdown_and_wait`] additionally waits for the last worker.
//!
//! # Example
//!
//! ```ignore
//! use calltask::config::PoolConfig;
//! use calltask::runtime::{WorkRunner, WorkerPool};
//!
//! let pool = WorkerPool::new(PoolConfig::default().cache_size(2));
//! pool.execute(Box::new(|| println!("hello from a worker")))?;
//! ```

use crate::config::PoolConfig;
use crate::dispatch::Work;
use crate::error::ExecuteError;
use crate::observability::{Diagnostics, default_diagnostics};
use crate::runtime::WorkRunner;
use crate::tracing_compat::{debug, trace};
use crate::types::PanicPayload;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

enum Assignment {
    Idle,
    Run(Work),
    Retire,
}

struct WorkerSlot {
    assignment: Mutex<Assignment>,
    wake: Condvar,
}

impl WorkerSlot {
    fn new(first: Work) -> Self {
        Self {
            assignment: Mutex::new(Assignment::Run(first)),
            wake: Condvar::new(),
        }
    }

    fn assign(&self, next: Assignment) {
        *self.assignment.lock() = next;
        self.wake.notify_one();
    }

    /// Blocks until work or a retirement notice arrives.
    fn next(&self) -> Option<Work> {
        let mut assignment = self.assignment.lock();
        loop {
            match std::mem::replace(&mut *assignment, Assignment::Idle) {
                Assignment::Run(work) => return Some(work),
                Assignment::Retire => return None,
                Assignment::Idle => self.wake.wait(&mut assignment),
            }
        }
    }
}

struct PoolState {
    idle: VecDeque<Arc<WorkerSlot>>,
    live: usize,
    shutdown: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    drained: Condvar,
    next_thread: AtomicU64,
    diagnostics: Arc<dyn Diagnostics>,
}

impl PoolInner {
    fn execute(self: &Arc<Self>, work: Work) -> Result<(), ExecuteError> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(ExecuteError::Shutdown);
        }
        if let Some(slot) = state.idle.pop_back() {
            drop(state);
            slot.assign(Assignment::Run(work));
            return Ok(());
        }
        state.live += 1;
        drop(state);

        let slot = Arc::new(WorkerSlot::new(work));
        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{id}", self.config.thread_name_prefix);
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || inner.worker_main(&slot));
        match spawned {
            Ok(_) => {
                trace!(worker = id, "worker thread spawned");
                Ok(())
            }
            Err(err) => {
                self.worker_exited();
                Err(err.into())
            }
        }
    }

    fn worker_main(&self, slot: &Arc<WorkerSlot>) {
        if let Some(hook) = &self.config.on_thread_start {
            hook();
        }
        while let Some(work) = slot.next() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
                self.diagnostics.log_exception(
                    "worker thread failed",
                    &PanicPayload::from_panic(payload.as_ref()),
                );
                self.worker_exited();
                break;
            }
            if !self.park(slot) {
                break;
            }
        }
        if let Some(hook) = &self.config.on_thread_stop {
            hook();
        }
    }

    /// Returns the worker to the idle cache. Returns false if it must exit.
    fn park(&self, slot: &Arc<WorkerSlot>) -> bool {
        let mut state = self.state.lock();
        if state.shutdown || state.idle.len() >= self.config.cache_size {
            drop(state);
            trace!("worker thread retiring");
            self.worker_exited();
            return false;
        }
        state.idle.push_front(Arc::clone(slot));
        true
    }

    fn worker_exited(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        if state.live == 0 {
            self.drained.notify_all();
        }
    }

    fn shutdown(&self) {
        let retired: Vec<Arc<WorkerSlot>> = {
            let mut state = self.state.lock();
            if !state.shutdown {
                debug!(live = state.live, "worker pool shutting down");
            }
            state.shutdown = true;
            state.idle.drain(..).collect()
        };
        for slot in retired {
            slot.assign(Assignment::Retire);
            self.worker_exited();
        }
    }
}

/// A cached pool of worker threads.
///
/// Dropping the pool shuts it down without waiting; call
/// [`shutdown_and_wait`](Self::shutdown_and_wait) to join the workers.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool with the given configuration.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self::with_diagnostics(config, default_diagnostics())
    }

    /// Creates a pool reporting worker panics to `diagnostics`.
    #[must_use]
    pub fn with_diagnostics(mut config: PoolConfig, diagnostics: Arc<dyn Diagnostics>) -> Self {
        config.normalize();
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                    shutdown: false,
                }),
                drained: Condvar::new(),
                next_thread: AtomicU64::new(0),
                diagnostics,
            }),
        }
    }

    /// Returns a cloneable handle that submits work to this pool.
    #[must_use]
    pub fn handle(&self) -> WorkerPoolHandle {
        WorkerPoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of threads currently alive (busy or idle).
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.inner.state.lock().live
    }

    /// Number of threads waiting in the idle cache.
    #[must_use]
    pub fn idle_threads(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Returns true once shutdown has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Stops accepting work and retires idle workers.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Shuts down and waits up to `timeout` for every worker to exit.
    ///
    /// Returns true if all workers exited in time.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.live > 0 {
            if self
                .inner
                .drained
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.live == 0;
            }
        }
        true
    }
}

impl WorkRunner for WorkerPool {
    fn execute(&self, work: Work) -> Result<(), ExecuteError> {
        self.inner.execute(work)
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkerPool")
            .field("live", &state.live)
            .field("idle", &state.idle.len())
            .field("shutdown", &state.shutdown)
            .field("cache_size", &self.inner.config.cache_size)
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A cloneable submission handle for a [`WorkerPool`].
///
/// Handles do not keep the pool running: once the pool is shut down or
/// dropped, submissions fail with [`ExecuteError::Shutdown`].
#[derive(Clone)]
pub struct WorkerPoolHandle {
    inner: Arc<PoolInner>,
}

impl WorkRunner for WorkerPoolHandle {
    fn execute(&self, work: Work) -> Result<(), ExecuteError> {
        self.inner.execute(work)
    }
}

impl fmt::Debug for WorkerPoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolHandle").finish_non_exhaustive()
    }
}
