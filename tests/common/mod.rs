//! Helpers shared by the integration suites.

#![allow(dead_code)]

use calltask::dispatch::Dispatcher;
use calltask::task::Callable;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

pub use calltask::test_utils::init_test_logging;

/// Upper bound for any wait on another thread.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize logging and announce the test.
pub fn init_test(name: &str) {
    init_test_logging();
    calltask::test_phase!(name);
}

/// Waits until every unit queued on `dispatcher` before this call has run.
///
/// Only meaningful for dispatchers that run units in FIFO order.
pub fn flush(dispatcher: &dyn Dispatcher) -> bool {
    let (tx, rx) = mpsc::channel();
    dispatcher.dispatch(Box::new(move || {
        let _ = tx.send(());
    }));
    rx.recv_timeout(TIMEOUT).is_ok()
}

/// Counts how many callables are inside `call` at once.
#[derive(Debug, Default)]
pub struct ConcurrencyMeter {
    running: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl ConcurrencyMeter {
    pub fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

/// A gate that blocked callables wait on until the test opens it.
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Latch {
    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    /// Returns false if the latch stayed shut for [`TIMEOUT`].
    pub fn wait(&self) -> bool {
        let mut open = self.open.lock();
        while !*open {
            if self.changed.wait_for(&mut open, TIMEOUT).timed_out() {
                return *open;
            }
        }
        true
    }
}

/// Callable that records concurrency, sleeps briefly, and returns `value`.
pub struct MeteredWork {
    pub meter: std::sync::Arc<ConcurrencyMeter>,
    pub value: i32,
    pub pause: Duration,
}

impl Callable<i32, String> for MeteredWork {
    fn call(&self) -> Result<i32, String> {
        self.meter.enter();
        std::thread::sleep(self.pause);
        self.meter.exit();
        Ok(self.value)
    }
}
