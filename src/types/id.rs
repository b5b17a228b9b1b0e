//! Identifier types for task-framework entities.
//!
//! [`CoreId`] tags completion cores in log output. [`SubtaskKey`] names one
//! entry in a dynamic task set's outstanding map.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static CORE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier for one completion core.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId(u64);

impl CoreId {
    /// Allocates the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(CORE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CoreId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreId({})", self.0)
    }
}

impl fmt::Display for CoreId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Key of one outstanding sub-operation in a dynamic task set.
///
/// Keys are handed out by the set itself, so two live sub-tasks never share
/// one unless a caller registers the same key twice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubtaskKey(u64);

impl SubtaskKey {
    #[inline]
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SubtaskKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubtaskKey({})", self.0)
    }
}

impl fmt::Display for SubtaskKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}
