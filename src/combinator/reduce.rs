//! Folding a composite log into per-context results.
//!
//! [`ResultMap`] maps each context key to the outcome logged for it. Keys that
//! appear more than once keep the last entry. [`AccumulatingListener`] builds a
//! map from a composite's completion and hands it to an ordinary listener.

use crate::observability::Diagnostics;
use crate::task::listener::{CompositeListener, Listener};
use crate::types::{CompositeLog, Failure, Outcome};
use std::collections::HashMap;
use std::collections::hash_map;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Success values that can be spread one level into a flat list.
pub trait Flatten {
    /// Element type of the flattened list.
    type Item;

    /// Appends this value's elements to `out`.
    fn flatten_into(&self, out: &mut Vec<Self::Item>);
}

impl<U: Clone> Flatten for Vec<U> {
    type Item = U;

    fn flatten_into(&self, out: &mut Vec<U>) {
        out.extend(self.iter().cloned());
    }
}

/// A success value that is either one item or a batch of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collected<U> {
    /// Appended as-is.
    Single(U),
    /// Spread into the list. Nested batches are not spread further.
    Batch(Vec<U>),
}

impl<U: Clone> Flatten for Collected<U> {
    type Item = U;

    fn flatten_into(&self, out: &mut Vec<U>) {
        match self {
            Self::Single(item) => out.push(item.clone()),
            Self::Batch(items) => out.extend(items.iter().cloned()),
        }
    }
}

/// Context key to outcome, last write wins.
#[derive(Debug, Clone)]
pub struct ResultMap<K, T, E> {
    entries: HashMap<K, Outcome<T, E>>,
}

impl<K, T, E> Default for ResultMap<K, T, E> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, T, E> ResultMap<K, T, E> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `log` in arrival order.
    #[must_use]
    pub fn from_log(log: CompositeLog<K, T, E>) -> Self {
        let mut map = Self::new();
        for partial in log {
            map.insert(partial.context, partial.outcome);
        }
        map
    }

    /// Records `outcome` for `context`, returning the outcome it replaced.
    pub fn insert(&mut self, context: K, outcome: Outcome<T, E>) -> Option<Outcome<T, E>> {
        self.entries.insert(context, outcome)
    }

    /// The outcome recorded for `context`.
    #[must_use]
    pub fn get(&self, context: &K) -> Option<&Outcome<T, E>> {
        self.entries.get(context)
    }

    /// Number of distinct context keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates in arbitrary order.
    pub fn iter(&self) -> hash_map::Iter<'_, K, Outcome<T, E>> {
        self.entries.iter()
    }

    /// Failed entries, in arbitrary order.
    #[must_use]
    pub fn failures(&self) -> Vec<(&K, &Failure<E>)> {
        self.entries
            .iter()
            .filter_map(|(key, outcome)| match outcome {
                Outcome::Err(failure) => Some((key, failure)),
                Outcome::Ok(_) => None,
            })
            .collect()
    }

    /// Successful entries, in arbitrary order.
    #[must_use]
    pub fn successes(&self) -> Vec<(&K, &T)> {
        self.entries
            .iter()
            .filter_map(|(key, outcome)| match outcome {
                Outcome::Ok(value) => Some((key, value)),
                Outcome::Err(_) => None,
            })
            .collect()
    }

    /// Success values spread one level into a single list.
    #[must_use]
    pub fn flattened_successes(&self) -> Vec<T::Item>
    where
        T: Flatten,
    {
        let mut out = Vec::new();
        for (_, value) in self.successes() {
            value.flatten_into(&mut out);
        }
        out
    }

    /// Reports every failure to `diagnostics` as `"{message} : {key:?}"`.
    ///
    /// Returns true if there was at least one failure.
    pub fn log_failures(&self, message: &str, diagnostics: &dyn Diagnostics) -> bool
    where
        K: fmt::Debug,
        E: fmt::Display,
    {
        let failures = self.failures();
        for (key, failure) in &failures {
            diagnostics.log_exception(&format!("{message} : {key:?}"), failure);
        }
        !failures.is_empty()
    }

    /// Consumes the map.
    #[must_use]
    pub fn into_inner(self) -> HashMap<K, Outcome<T, E>> {
        self.entries
    }
}

impl<'a, K, T, E> IntoIterator for &'a ResultMap<K, T, E> {
    type Item = (&'a K, &'a Outcome<T, E>);
    type IntoIter = hash_map::Iter<'a, K, Outcome<T, E>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Folds `log` into a [`ResultMap`].
#[must_use]
pub fn reduce<K: Eq + Hash, T, E>(log: CompositeLog<K, T, E>) -> ResultMap<K, T, E> {
    ResultMap::from_log(log)
}

/// Composite listener that reduces the completed log and passes the map on.
///
/// Partial notifications are ignored. Completion becomes `on_success(map)`
/// downstream; cancellation and finalization are forwarded.
pub struct AccumulatingListener<K, T, E> {
    downstream: Arc<dyn Listener<ResultMap<K, T, E>, E>>,
}

impl<K, T, E> AccumulatingListener<K, T, E> {
    /// Reports reduced results to `downstream`.
    #[must_use]
    pub fn new(downstream: Arc<dyn Listener<ResultMap<K, T, E>, E>>) -> Self {
        Self { downstream }
    }
}

impl<K, T, E> fmt::Debug for AccumulatingListener<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingListener").finish_non_exhaustive()
    }
}

impl<K, T, E> CompositeListener<K, T, E> for AccumulatingListener<K, T, E>
where
    K: Eq + Hash,
{
    fn on_partial_success(&self, _value: T, _context: K) {}

    fn on_partial_error(&self, _failure: Failure<E>, _context: K) {}

    fn on_complete(&self, log: CompositeLog<K, T, E>) {
        self.downstream.on_success(ResultMap::from_log(log));
    }

    fn on_cancel(&self) {
        self.downstream.on_cancel();
    }

    fn on_finally(&self) {
        self.downstream.on_finally();
    }
}
