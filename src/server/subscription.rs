//! Counted subscription bag

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;

/// Concurrent multiset counting how often each item was added.
///
/// Membership is what matters to readers: an item added twice is still one
/// member, and it stays a member until it was removed as often as it was added.
#[derive(Debug)]
pub struct HashBag<T: Eq + Hash> {
    counts: DashMap<T, usize>,
}

impl<T: Eq + Hash + Clone> HashBag<T> {
    /// Create an empty bag
    pub fn new() -> Self {
        Self { counts: DashMap::new() }
    }

    /// Add one occurrence of `item`, returning its new count
    pub fn add(&self, item: T) -> usize {
        let mut count = self.counts.entry(item).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove one occurrence of `item`. Returns `false` if it was not present.
    pub fn remove(&self, item: &T) -> bool {
        match self.counts.entry(item.clone()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() <= 1 {
                    entry.remove();
                } else {
                    *entry.get_mut() -= 1;
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Whether at least one occurrence of `item` is present
    pub fn contains(&self, item: &T) -> bool {
        self.counts.contains_key(item)
    }

    /// Number of occurrences of `item`
    pub fn count(&self, item: &T) -> usize {
        self.counts.get(item).map(|count| *count).unwrap_or(0)
    }

    /// Number of distinct members
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the bag is empty
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Remove everything
    pub fn clear(&self) {
        self.counts.clear();
    }
}

impl<T: Eq + Hash + Clone> Default for HashBag<T> {
    fn default() -> Self {
        Self::new()
    }
}
