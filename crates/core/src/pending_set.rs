//! Set with O(1) insert and O(1) uniformly random removal.

use std::collections::HashSet;
use std::hash::Hash;

use rand::Rng;

use crate::error::PendingSetError;

/// Unordered set of values supporting idempotent insert and random pop.
///
/// Membership is tracked separately from the backing list so that a popped
/// slot can be refilled by swapping in the last element.
#[derive(Debug, Clone)]
pub struct RandomizedPendingSet<T> {
    list: Vec<T>,
    present: HashSet<T>,
}

impl<T> Default for RandomizedPendingSet<T> {
    fn default() -> Self {
        Self {
            list: Vec::new(),
            present: HashSet::new(),
        }
    }
}

impl<T: Copy + Eq + Hash> RandomizedPendingSet<T> {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` unless it is already present.
    pub fn insert(&mut self, value: T) {
        if self.present.insert(value) {
            self.list.push(value);
        }
    }

    /// Removes and returns a uniformly random member.
    pub fn pop_random(&mut self) -> Result<T, PendingSetError> {
        self.pop_random_with(&mut rand::rng())
    }

    /// [`Self::pop_random`] with an explicit source of randomness.
    pub fn pop_random_with<R: Rng>(&mut self, rng: &mut R) -> Result<T, PendingSetError> {
        if self.list.is_empty() {
            return Err(PendingSetError::Empty);
        }
        let index = rng.random_range(0..self.list.len());
        let value = self.list.swap_remove(index);
        self.present.remove(&value);
        Ok(value)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Removes every member.
    pub fn clear(&mut self) {
        self.list.clear();
        self.present.clear();
    }
}
