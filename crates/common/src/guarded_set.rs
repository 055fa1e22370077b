//! Thread-safe membership set
//!
//! Callers never see the lock: every operation takes it for exactly its own
//! duration, so each operation is atomic with respect to every other one on
//! the same set.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};

/// A set whose insert/erase/contains are linearizable
///
/// Membership checks share a read lock; insert and erase take the write lock.
#[derive(Debug)]
pub struct GuardedSet<T> {
    inner: RwLock<HashSet<T>>,
}

impl<T: Eq + Hash> GuardedSet<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashSet::new()),
        }
    }

    /// Insert `item`; returns false if it was already present
    pub fn insert(&self, item: T) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item)
    }

    /// Remove `item`; returns false if it was not present
    pub fn erase(&self, item: &T) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(item)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current members, taken atomically
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl<T: Eq + Hash> Default for GuardedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
