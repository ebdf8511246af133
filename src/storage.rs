//! Pluggable state storage.
//!
//! Admission logic that keeps its state in a [`StateStore`] only ever reads
//! a value and then writes it back with compare-and-swap, so any backend
//! offering an atomic CAS (an in-process map, a shared cache, ...) preserves
//! the same guarantees.

use std::hash::Hash;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Key-value storage with atomic compare-and-swap.
#[async_trait]
pub trait StateStore<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync,
{
    /// Read the current value for `key`.
    async fn get(&self, key: &K) -> Option<V>;

    /// Replace the value for `key` with `new` if it currently equals
    /// `expected` (`None` meaning "absent"). Returns whether the swap
    /// happened.
    async fn compare_and_swap(&self, key: &K, expected: Option<&V>, new: V) -> bool;
}

/// The default in-process backend.
///
/// Each compare-and-swap runs under the lock of the shard holding the key,
/// so unrelated keys do not serialize against each other.
#[derive(Debug)]
pub struct InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
}

impl<K, V> InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> StateStore<K, V> for InMemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: PartialEq + Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    async fn compare_and_swap(&self, key: &K, expected: Option<&V>, new: V) -> bool {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if expected == Some(occupied.get()) {
                    occupied.insert(new);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(new);
                    true
                } else {
                    false
                }
            }
        }
    }
}
