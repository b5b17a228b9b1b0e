//! Test utilities for calltask.
//!
//! Shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A listener that records every callback it receives
//!
//! # Example
//! ```
//! use calltask::test_utils::init_test_logging;
//!
//! fn my_test() {
//!     init_test_logging();
//!     calltask::test_phase!("my_test");
//! }
//! ```

use crate::task::{CompositeListener, Listener};
use crate::types::{CompositeLog, Failure};
use parking_lot::{Condvar, Mutex};
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// One callback observed by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<K, T, E> {
    /// `on_success` fired.
    Success(T),
    /// `on_error` fired.
    Error(Failure<E>),
    /// `on_partial_success` fired.
    PartialSuccess(T, K),
    /// `on_partial_error` fired.
    PartialError(Failure<E>, K),
    /// `on_complete` fired with a log of this many entries.
    Complete(usize),
    /// `on_cancel` fired.
    Cancel,
    /// `on_finally` fired.
    Finally,
}

/// Listener that records every callback, in arrival order.
///
/// Implements both [`Listener`] and [`CompositeListener`], so one recorder can
/// observe single tasks and composites alike. `K` is unused for single tasks.
#[derive(Debug)]
pub struct RecordingListener<K, T, E> {
    events: Mutex<Vec<Event<K, T, E>>>,
    finished: Condvar,
}

impl<K, T, E> Default for RecordingListener<K, T, E> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            finished: Condvar::new(),
        }
    }
}

impl<K: Clone, T: Clone, E: Clone> RecordingListener<K, T, E> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the events seen so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event<K, T, E>> {
        self.events.lock().clone()
    }

    /// Number of `on_finally` callbacks seen so far.
    #[must_use]
    pub fn finally_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, Event::Finally))
            .count()
    }

    /// Number of terminal callbacks (success, error, or cancel) seen so far.
    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, Event::Success(_) | Event::Error(_) | Event::Cancel))
            .count()
    }

    /// Blocks until `on_finally` has fired or the timeout elapses.
    ///
    /// Returns `true` if finalization was observed.
    pub fn wait_finally(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        while !events.iter().any(|event| matches!(event, Event::Finally)) {
            if self.finished.wait_until(&mut events, deadline).timed_out() {
                return events.iter().any(|event| matches!(event, Event::Finally));
            }
        }
        true
    }

    fn push(&self, event: Event<K, T, E>) {
        let is_finally = matches!(event, Event::Finally);
        self.events.lock().push(event);
        if is_finally {
            self.finished.notify_all();
        }
    }
}

impl<K, T, E> Listener<T, E> for RecordingListener<K, T, E>
where
    K: Clone + Send,
    T: Clone + Send,
    E: Clone + Send,
{
    fn on_success(&self, value: T) {
        self.push(Event::Success(value));
    }

    fn on_error(&self, failure: Failure<E>) {
        self.push(Event::Error(failure));
    }

    fn on_cancel(&self) {
        self.push(Event::Cancel);
    }

    fn on_finally(&self) {
        self.push(Event::Finally);
    }
}

impl<K, T, E> CompositeListener<K, T, E> for RecordingListener<K, T, E>
where
    K: Clone + Send,
    T: Clone + Send,
    E: Clone + Send,
{
    fn on_partial_success(&self, value: T, context: K) {
        self.push(Event::PartialSuccess(value, context));
    }

    fn on_partial_error(&self, failure: Failure<E>, context: K) {
        self.push(Event::PartialError(failure, context));
    }

    fn on_complete(&self, log: CompositeLog<K, T, E>) {
        self.push(Event::Complete(log.len()));
    }

    fn on_cancel(&self) {
        self.push(Event::Cancel);
    }

    fn on_finally(&self) {
        self.push(Event::Finally);
    }
}
