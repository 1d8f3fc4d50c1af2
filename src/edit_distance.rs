//! Bounded edit distance for fuzzy phrase matching
//!
//! Damerau-Levenshtein-like distance (optimal string alignment: an adjacent
//! transposition costs one edit) computed over a diagonal band of width
//! `2 * threshold + 1`. Anything farther apart than the threshold is reported
//! as `-1` without filling the whole table.
//!
//! Scratch rows are kept per thread, so the functions here can be called from
//! any number of workers at once.

use std::cell::RefCell;

/// Default bound used when comparing a phrase against a whole set
pub const DEFAULT_MAX_DISTANCE: usize = 100;

/// Default minimum token length for a one-edit fuzzy match
pub const DEFAULT_MIN_LEN: usize = 4;

thread_local! {
    static SCRATCH: RefCell<Scratch> = RefCell::new(Scratch::default());
}

#[derive(Default)]
struct Scratch {
    a: Vec<char>,
    b: Vec<char>,
    rows: [Vec<usize>; 3],
}

/// Edit distance between `a` and `b`, or `-1` if it exceeds `threshold`
pub fn distance(a: &str, b: &str, threshold: usize) -> i32 {
    SCRATCH.with(|cell| {
        let mut scratch = cell.borrow_mut();
        let Scratch { a: ca, b: cb, rows } = &mut *scratch;
        ca.clear();
        ca.extend(a.chars());
        cb.clear();
        cb.extend(b.chars());
        banded_distance(ca, cb, threshold, rows)
    })
}

fn banded_distance(a: &[char], b: &[char], k: usize, rows: &mut [Vec<usize>; 3]) -> i32 {
    let (n, m) = (a.len(), b.len());
    if n.abs_diff(m) > k {
        return -1;
    }
    if n == 0 || m == 0 {
        return n.max(m) as i32;
    }

    // Cells outside the band hold `inf`, which is already over the threshold.
    let inf = k + 1;
    for row in rows.iter_mut() {
        row.clear();
        row.resize(m + 1, inf);
    }
    let [before, prev, cur] = rows;

    for (j, cell) in prev.iter_mut().enumerate().take(k.min(m) + 1) {
        *cell = j;
    }

    for i in 1..=n {
        cur.fill(inf);
        if i <= k {
            cur[0] = i;
        }
        let lo = i.saturating_sub(k).max(1);
        let hi = (i + k).min(m);
        let mut row_min = cur[0];

        for j in lo..=hi {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut d = (prev[j - 1] + cost).min(prev[j] + 1).min(cur[j - 1] + 1);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                d = d.min(before[j - 2] + 1);
            }
            let d = d.min(inf);
            cur[j] = d;
            row_min = row_min.min(d);
        }

        if row_min > k {
            return -1;
        }

        std::mem::swap(before, prev);
        std::mem::swap(prev, cur);
    }

    let d = prev[m];
    if d > k { -1 } else { d as i32 }
}

/// Exact match, or one edit away when `candidate` is longer than `min_len`
pub fn is_fuzzy_match(word: &str, candidate: &str, min_len: usize) -> bool {
    if word == candidate {
        return true;
    }
    candidate.chars().count() > min_len && distance(word, candidate, 1) == 1
}

/// True if any member of `set` fuzzy-matches `word`
pub fn contains_fuzzy<'a, I>(set: I, word: &str, min_len: usize) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    set.into_iter().any(|s| is_fuzzy_match(s, word, min_len))
}

/// Smallest distance from `word` to any member of `set` within `threshold`
///
/// Returns early on an exact or one-edit hit.
pub fn min_distance<'a, I>(word: &str, set: I, threshold: usize) -> Option<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<usize> = None;
    for candidate in set {
        let d = distance(word, candidate, threshold);
        if d < 0 {
            continue;
        }
        let d = d as usize;
        if best.is_none_or(|b| d < b) {
            best = Some(d);
        }
        if d <= 1 {
            break;
        }
    }
    best
}

/// Distance relative to the length of `word` (1.0 when nothing is in range)
pub fn distance_ratio<'a, I>(word: &str, set: I, threshold: usize) -> f64
where
    I: IntoIterator<Item = &'a str>,
{
    let len = word.chars().count().max(1) as f64;
    match min_distance(word, set, threshold) {
        Some(d) => d as f64 / len,
        None => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical() {
        assert_eq!(distance("pneumonia", "pneumonia", 0), 0);
        assert_eq!(distance("", "", 3), 0);
    }

    #[test]
    fn test_substitution_insertion_deletion() {
        assert_eq!(distance("flu", "flue", 2), 1);
        assert_eq!(distance("cough", "couch", 2), 1);
        assert_eq!(distance("fever", "fver", 2), 1);
        assert_eq!(distance("kitten", "sitting", 3), 3);
    }

    #[test]
    fn test_transposition_is_one_edit() {
        assert_eq!(distance("asthma", "ashtma", 2), 1);
        assert_eq!(distance("ab", "ba", 1), 1);
    }

    #[test]
    fn test_over_threshold() {
        assert_eq!(distance("kitten", "sitting", 2), -1);
        assert_eq!(distance("a", "abcd", 2), -1);
        assert_eq!(distance("abc", "xyz", 2), -1);
    }

    #[test]
    fn test_empty_against_word() {
        assert_eq!(distance("", "abc", 3), 3);
        assert_eq!(distance("abc", "", 2), -1);
    }

    #[test]
    fn test_unicode() {
        assert_eq!(distance("café", "cafe", 1), 1);
    }

    #[test]
    fn test_fuzzy_match() {
        assert!(is_fuzzy_match("diabetes", "diabetes", 4));
        assert!(is_fuzzy_match("diabetes", "diabetis", 4));
        // too short for a fuzzy hit
        assert!(!is_fuzzy_match("flu", "flue", 4));
        assert!(!is_fuzzy_match("diabetes", "diabetics", 4));
    }

    #[test]
    fn test_contains_fuzzy() {
        let seeds = ["influenza", "measles"];
        assert!(contains_fuzzy(seeds, "influensa", 4));
        assert!(!contains_fuzzy(seeds, "mumps", 4));
    }

    #[test]
    fn test_min_distance() {
        let set = ["cold", "flu", "fever"];
        assert_eq!(min_distance("fevers", set, 3), Some(1));
        assert_eq!(min_distance("zzzzzzzz", set, 3), None);
        assert!((distance_ratio("fevers", set, 3) - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_threads() {
        let handles: Vec<_> = (0..4)
            .map(|i| std::thread::spawn(move || distance("bronchitis", &format!("bronchitis{}", i), 2)))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 1);
        }
    }
}
