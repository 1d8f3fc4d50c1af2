//! Insertion-ordered score counters
//!
//! Scores are accumulated in `Counter`s whose iteration order is the order in
//! which keys were first seen. Sorting by score is stable, so ties keep that
//! order and every ranking in the bootstrap loop is deterministic.

use rustc_hash::FxHashMap;
use std::hash::Hash;

/// Map from key to `f64` score that remembers insertion order
#[derive(Debug, Clone)]
pub struct Counter<K> {
    entries: Vec<(K, f64)>,
    index: FxHashMap<K, usize>,
}

impl<K: Clone + Eq + Hash> Default for Counter<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> PartialEq for Counter<K> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == v)
    }
}

impl<K: Clone + Eq + Hash> Counter<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Add `by` to the score of `key`, inserting it at 0.0 first if absent
    pub fn incr(&mut self, key: K, by: f64) -> f64 {
        match self.index.get(&key) {
            Some(&i) => {
                self.entries[i].1 += by;
                self.entries[i].1
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, by));
                by
            }
        }
    }

    pub fn set(&mut self, key: K, value: f64) {
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Score of `key`, 0.0 when absent
    pub fn get(&self, key: &K) -> f64 {
        self.index.get(key).map_or(0.0, |&i| self.entries[i].1)
    }

    pub fn get_opt(&self, key: &K) -> Option<f64> {
        self.index.get(key).map(|&i| self.entries[i].1)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<f64> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        for (k, _) in &self.entries[i..] {
            if let Some(pos) = self.index.get_mut(k) {
                *pos -= 1;
            }
        }
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, f64)> + '_ {
        self.entries.iter().map(|(k, v)| (k, *v))
    }

    pub fn total(&self) -> f64 {
        self.entries.iter().map(|(_, v)| v).sum()
    }

    /// Add every entry of `other` into this counter
    pub fn add_all(&mut self, other: &Counter<K>) {
        for (k, v) in other.iter() {
            self.incr(k.clone(), v);
        }
    }

    /// Entries sorted by descending score; ties keep insertion order
    pub fn sorted_desc(&self) -> Vec<(K, f64)> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        sorted
    }

    /// Highest-scoring entry, first inserted on ties
    pub fn argmax(&self) -> Option<(&K, f64)> {
        let mut best: Option<(&K, f64)> = None;
        for (k, v) in self.iter() {
            if best.is_none_or(|(_, b)| v > b) {
                best = Some((k, v));
            }
        }
        best
    }

    pub fn min_value(&self) -> Option<f64> {
        self.entries.iter().map(|(_, v)| *v).reduce(f64::min)
    }

    pub fn max_value(&self) -> Option<f64> {
        self.entries.iter().map(|(_, v)| *v).reduce(f64::max)
    }

    /// Keep only entries for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&K, f64) -> bool) {
        self.entries.retain(|(k, v)| keep(k, *v));
        self.index.clear();
        for (i, (k, _)) in self.entries.iter().enumerate() {
            self.index.insert(k.clone(), i);
        }
    }
}

impl<K: Clone + Eq + Hash> FromIterator<(K, f64)> for Counter<K> {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut counter = Counter::new();
        for (k, v) in iter {
            counter.incr(k, v);
        }
        counter
    }
}

impl<K: Clone + Eq + Hash> IntoIterator for Counter<K> {
    type Item = (K, f64);
    type IntoIter = std::vec::IntoIter<(K, f64)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Two-level counter: outer key to a `Counter` of inner keys
#[derive(Debug, Clone)]
pub struct TwoDimCounter<K1, K2> {
    rows: Counter<K1>,
    inner: FxHashMap<K1, Counter<K2>>,
}

impl<K1: Clone + Eq + Hash, K2: Clone + Eq + Hash> Default for TwoDimCounter<K1, K2> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K1: Clone + Eq + Hash, K2: Clone + Eq + Hash> TwoDimCounter<K1, K2> {
    pub fn new() -> Self {
        Self {
            rows: Counter::new(),
            inner: FxHashMap::default(),
        }
    }

    pub fn incr(&mut self, k1: K1, k2: K2, by: f64) {
        self.rows.incr(k1.clone(), by);
        self.inner.entry(k1).or_default().incr(k2, by);
    }

    pub fn get(&self, k1: &K1, k2: &K2) -> f64 {
        self.inner.get(k1).map_or(0.0, |row| row.get(k2))
    }

    pub fn row(&self, k1: &K1) -> Option<&Counter<K2>> {
        self.inner.get(k1)
    }

    /// Row total for `k1`
    pub fn total_for(&self, k1: &K1) -> f64 {
        self.rows.get(k1)
    }

    /// Outer keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &K1> + '_ {
        self.rows.keys()
    }

    pub fn rows(&self) -> impl Iterator<Item = (&K1, &Counter<K2>)> + '_ {
        self.rows
            .keys()
            .filter_map(move |k| self.inner.get(k).map(|row| (k, row)))
    }

    pub fn remove_row(&mut self, k1: &K1) -> Option<Counter<K2>> {
        self.rows.remove(k1);
        self.inner.remove(k1)
    }

    pub fn contains(&self, k1: &K1) -> bool {
        self.inner.contains_key(k1)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn add_all(&mut self, other: &TwoDimCounter<K1, K2>) {
        for (k1, row) in other.rows() {
            for (k2, v) in row.iter() {
                self.incr(k1.clone(), k2.clone(), v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incr_and_get() {
        let mut c = Counter::new();
        c.incr("a", 1.0);
        c.incr("b", 2.0);
        c.incr("a", 0.5);
        assert_eq!(c.get(&"a"), 1.5);
        assert_eq!(c.get(&"missing"), 0.0);
        assert_eq!(c.total(), 3.5);
    }

    #[test]
    fn test_sorted_ties_keep_insertion_order() {
        let mut c = Counter::new();
        c.set("second", 1.0);
        c.set("first", 2.0);
        c.set("third", 1.0);
        let keys: Vec<_> = c.sorted_desc().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut c: Counter<&str> = [("a", 1.0), ("b", 1.0), ("c", 1.0)].into_iter().collect();
        assert_eq!(c.remove(&"a"), Some(1.0));
        c.incr("c", 1.0);
        let keys: Vec<_> = c.keys().copied().collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(c.get(&"c"), 2.0);
    }

    #[test]
    fn test_argmax_first_on_tie() {
        let c: Counter<&str> = [("x", 3.0), ("y", 3.0)].into_iter().collect();
        assert_eq!(c.argmax(), Some((&"x", 3.0)));
    }

    #[test]
    fn test_retain() {
        let mut c: Counter<i32> = (0..5).map(|i| (i, i as f64)).collect();
        c.retain(|_, v| v >= 2.0);
        assert_eq!(c.len(), 3);
        assert!(!c.contains(&1));
        c.incr(4, 1.0);
        assert_eq!(c.get(&4), 5.0);
    }

    #[test]
    fn test_two_dim() {
        let mut c = TwoDimCounter::new();
        c.incr("p1", "flu", 1.0);
        c.incr("p1", "cold", 2.0);
        c.incr("p2", "flu", 1.0);
        assert_eq!(c.get(&"p1", &"cold"), 2.0);
        assert_eq!(c.total_for(&"p1"), 3.0);
        assert_eq!(c.row(&"p2").map(|r| r.len()), Some(1));
        assert_eq!(c.keys().copied().collect::<Vec<_>>(), vec!["p1", "p2"]);
        c.remove_row(&"p1");
        assert_eq!(c.len(), 1);
    }
}
