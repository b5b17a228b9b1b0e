//! Work runners: threads that execute units of work.
//!
//! - [`WorkRunner`]: the leaf execution contract
//! - [`worker_pool`]: cached pool of reusable worker threads
//! - [`gate`]: FIFO admission limit over another runner
//! - [`ThreadPerTask`]: one fresh thread per unit

pub mod gate;
pub mod worker_pool;

pub use gate::ConcurrencyGate;
pub use worker_pool::{WorkerPool, WorkerPoolHandle};

use crate::dispatch::Work;
use crate::error::ExecuteError;
use crate::tracing_compat::trace;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Executes units of work, usually on other threads.
pub trait WorkRunner: Send + Sync {
    /// Accepts `work` for execution.
    ///
    /// On error the work has been dropped without running.
    fn execute(&self, work: Work) -> Result<(), ExecuteError>;
}

impl<R: WorkRunner + ?Sized> WorkRunner for Arc<R> {
    fn execute(&self, work: Work) -> Result<(), ExecuteError> {
        (**self).execute(work)
    }
}

/// Runner that spawns a new named thread for every unit of work.
#[derive(Debug)]
pub struct ThreadPerTask {
    name: String,
    spawned: AtomicU64,
}

impl ThreadPerTask {
    /// Names spawned threads `{name}-{n}`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spawned: AtomicU64::new(0),
        }
    }

    /// Number of threads spawned so far.
    #[must_use]
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl Default for ThreadPerTask {
    fn default() -> Self {
        Self::new("calltask-gate")
    }
}

impl WorkRunner for ThreadPerTask {
    fn execute(&self, work: Work) -> Result<(), ExecuteError> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{n}", self.name);
        trace!(thread = %name, "spawning thread for unit of work");
        thread::Builder::new().name(name).spawn(work)?;
        Ok(())
    }
}
