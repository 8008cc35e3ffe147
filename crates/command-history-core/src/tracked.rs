//! Containers that remember whether any mutator touched them.
//!
//! Every `&mut` accessor counts as a mutation, whether or not the caller
//! actually changes the value. Read accessors never set the flag.

use std::collections::btree_map::{self, BTreeMap};
use std::ops::Deref;

#[derive(Debug, Clone, PartialEq)]
pub struct Tracked<T> {
    value: T,
    dirty: bool,
}

impl<T> Tracked<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    #[must_use]
    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.value
    }

    pub fn set(&mut self, value: T) {
        self.dirty = true;
        self.value = value;
    }

    pub fn update<R>(&mut self, apply: impl FnOnce(&mut T) -> R) -> R {
        apply(self.get_mut())
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedMap<K, V> {
    entries: BTreeMap<K, V>,
    dirty: bool,
}

impl<K: Ord, V> Default for TrackedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> TrackedMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.entries.iter()
    }

    pub fn keys(&self) -> btree_map::Keys<'_, K, V> {
        self.entries.keys()
    }

    pub fn values(&self) -> btree_map::Values<'_, K, V> {
        self.entries.values()
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.dirty = true;
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.dirty = true;
        self.entries.remove(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.dirty = true;
        self.entries.get_mut(key)
    }

    pub fn get_or_insert_with(&mut self, key: K, create: impl FnOnce() -> V) -> &mut V {
        self.dirty = true;
        self.entries.entry(key).or_insert_with(create)
    }

    pub fn retain(&mut self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.dirty = true;
        self.entries.retain(keep);
    }

    pub fn clear(&mut self) {
        self.dirty = true;
        self.entries.clear();
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for TrackedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
            dirty: false,
        }
    }
}

impl<'a, K, V> IntoIterator for &'a TrackedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = btree_map::Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedList<T> {
    items: Vec<T>,
    dirty: bool,
}

impl<T> Default for TrackedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TrackedList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            dirty: false,
        }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn find(&self, predicate: impl FnMut(&&T) -> bool) -> Option<&T> {
        self.items.iter().find(predicate)
    }

    pub fn push(&mut self, item: T) {
        self.dirty = true;
        self.items.push(item);
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        self.dirty = true;
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.dirty = true;
        self.items.get_mut(index)
    }

    pub fn find_mut(&mut self, predicate: impl FnMut(&&mut T) -> bool) -> Option<&mut T> {
        self.dirty = true;
        self.items.iter_mut().find(predicate)
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.dirty = true;
        self.items.retain(keep);
    }

    pub fn clear(&mut self) {
        self.dirty = true;
        self.items.clear();
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

impl<T> FromIterator<T> for TrackedList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
            dirty: false,
        }
    }
}

impl<'a, T> IntoIterator for &'a TrackedList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_never_dirty_and_mutators_always_do() {
        let mut map: TrackedMap<u8, String> = [(1, "a".to_string())].into_iter().collect();
        assert!(!map.is_dirty());
        let _ = map.get(&1);
        let _ = map.len();
        assert!(!map.is_dirty());

        let _ = map.get_mut(&2);
        assert!(map.is_dirty(), "a mutable lookup counts even on a miss");
        map.clear_dirty();

        map.insert(3, "c".to_string());
        assert!(map.is_dirty());
    }

    #[test]
    fn list_mutators_set_the_flag() {
        let mut list: TrackedList<u8> = vec![1, 2, 3].into_iter().collect();
        assert!(!list.is_dirty());
        assert_eq!(list.find(|value| **value == 2), Some(&2));
        assert!(!list.is_dirty());

        assert_eq!(list.remove(10), None);
        assert!(list.is_dirty());
        list.clear_dirty();

        list.retain(|value| *value > 1);
        assert!(list.is_dirty());
        assert_eq!(list.as_slice(), &[2, 3]);
    }

    #[test]
    fn tracked_value_dirties_on_get_mut_only() {
        let mut tracked = Tracked::new(5_u32);
        assert_eq!(*tracked, 5);
        assert!(!tracked.is_dirty());
        *tracked.get_mut() += 1;
        assert!(tracked.is_dirty());
        tracked.clear_dirty();
        tracked.update(|value| *value *= 2);
        assert!(tracked.is_dirty());
        assert_eq!(tracked.into_inner(), 12);
    }
}
