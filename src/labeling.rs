//! Corpus labeling
//!
//! Marks every occurrence of a label's phrases in the corpus, records which
//! phrase matched each token, and reports the changed token positions so the
//! caller can refresh pattern caches and the index for those sentences only.
//! Labeling the same phrases twice leaves the tokens unchanged.

use crate::config::Config;
use crate::edit_distance;
use crate::phrase::CandidatePhrase;
use crate::store::SentenceStore;
use crate::token::{Sentence, Token};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Changed token positions per sentence id
pub type Changes = BTreeMap<String, BTreeSet<usize>>;

/// How phrase words are compared with token words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    pub ignore_case: bool,
    pub fuzzy: bool,
    /// Shortest token that may match with one edit
    pub min_len: usize,
}

impl MatchOptions {
    pub fn exact() -> Self {
        Self {
            ignore_case: false,
            fuzzy: false,
            min_len: edit_distance::DEFAULT_MIN_LEN,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            ignore_case: config.ignore_case_seed_match,
            fuzzy: config.fuzzy_match,
            min_len: config.min_len4_fuzzy_for_pattern,
        }
    }

    fn word_matches(&self, phrase_word: &str, token: &Token) -> bool {
        if phrase_word == token.word {
            return true;
        }
        if self.ignore_case {
            let (a, b) = (phrase_word.to_lowercase(), token.word.to_lowercase());
            if a == b {
                return true;
            }
            return self.fuzzy && edit_distance::is_fuzzy_match(&a, &b, self.min_len);
        }
        self.fuzzy && edit_distance::is_fuzzy_match(phrase_word, &token.word, self.min_len)
    }

    fn key(&self, word: &str) -> String {
        if self.ignore_case {
            word.to_lowercase()
        } else {
            word.to_string()
        }
    }
}

/// Phrases split into words, grouped by their first word
///
/// Fuzzy matching cannot use the grouping, so every phrase is tried.
#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    options: MatchOptions,
    by_first: FxHashMap<String, Vec<(String, Vec<String>)>>,
    all: Vec<(String, Vec<String>)>,
}

impl PhraseMatcher {
    pub fn new<'a>(phrases: impl IntoIterator<Item = &'a CandidatePhrase>, options: MatchOptions) -> Self {
        let mut by_first: FxHashMap<String, Vec<(String, Vec<String>)>> = FxHashMap::default();
        let mut all = Vec::new();
        for phrase in phrases {
            let words: Vec<String> = phrase.text().split_whitespace().map(str::to_string).collect();
            let Some(first) = words.first() else {
                continue;
            };
            let entry = (phrase.text().to_string(), words.clone());
            by_first.entry(options.key(first)).or_default().push(entry.clone());
            all.push(entry);
        }
        Self {
            options,
            by_first,
            all,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Every `(start, end, phrase)` occurrence in `sent`
    pub fn find(&self, sent: &Sentence) -> Vec<(usize, usize, &str)> {
        let mut found = Vec::new();
        for start in 0..sent.len() {
            let candidates: &[(String, Vec<String>)] = if self.options.fuzzy {
                &self.all
            } else {
                match self.by_first.get(&self.options.key(&sent.tokens[start].word)) {
                    Some(c) => c,
                    None => continue,
                }
            };
            for (text, words) in candidates {
                let end = start + words.len();
                if end > sent.len() {
                    continue;
                }
                let hit = words
                    .iter()
                    .zip(&sent.tokens[start..end])
                    .all(|(w, t)| self.options.word_matches(w, t));
                if hit {
                    found.push((start, end, text.as_str()));
                }
            }
        }
        found
    }
}

/// Label the occurrences found by `matcher` in one sentence
pub fn label_sentence(sent: &mut Sentence, label: &str, matcher: &PhraseMatcher) -> BTreeSet<usize> {
    let mut changed = BTreeSet::new();
    let found: Vec<(usize, usize, String)> = matcher
        .find(sent)
        .into_iter()
        .map(|(s, e, text)| (s, e, text.to_string()))
        .collect();
    for (start, end, text) in found {
        for i in start..end {
            let token = &mut sent.tokens[i];
            let before = (token.is_labeled(label), token.matched.get(label).cloned());
            token.set_label(label, true);
            token.matched.entry(label.to_string()).or_default().add(&text);
            if before != (true, token.matched.get(label).cloned()) {
                changed.insert(i);
            }
        }
    }
    changed
}

/// Label every occurrence of `phrases` with `label` across the store
///
/// Sentences are processed in parallel; each worker owns its sentences.
pub fn label_words<'a>(
    store: &mut SentenceStore,
    label: &str,
    phrases: impl IntoIterator<Item = &'a CandidatePhrase>,
    options: MatchOptions,
    pool: &rayon::ThreadPool,
) -> Changes {
    let matcher = PhraseMatcher::new(phrases, options);
    if matcher.is_empty() {
        return Changes::new();
    }
    let mut sents: Vec<&mut Sentence> = store.iter_mut().collect();
    let changes: Changes = pool.install(|| {
        sents
            .par_iter_mut()
            .filter_map(|sent| {
                let changed = label_sentence(sent, label, &matcher);
                (!changed.is_empty()).then(|| (sent.id.clone(), changed))
            })
            .collect()
    });
    debug!(
        label,
        sentences = changes.len(),
        tokens = changes.values().map(BTreeSet::len).sum::<usize>(),
        "labeled corpus"
    );
    changes
}

/// Remove `phrases` as matches of `label`, unlabeling tokens left with none
pub fn unlabel_words<'a>(
    store: &mut SentenceStore,
    label: &str,
    phrases: impl IntoIterator<Item = &'a str>,
) -> Changes {
    let phrases: BTreeSet<&str> = phrases.into_iter().collect();
    let mut changes = Changes::new();
    for sent in store.iter_mut() {
        for (i, token) in sent.tokens.iter_mut().enumerate() {
            let Some(matched) = token.matched.get_mut(label) else {
                continue;
            };
            let before = matched.all.len();
            for p in &phrases {
                matched.remove(p);
            }
            if matched.all.len() == before {
                continue;
            }
            if matched.is_empty() {
                token.set_label(label, false);
            }
            changes.entry(sent.id.clone()).or_default().insert(i);
        }
    }
    changes
}

/// Keep only the label with the longest matched phrase on multiply labeled tokens
pub fn remove_overlapping_labels(sent: &mut Sentence) -> BTreeSet<usize> {
    let mut changed = BTreeSet::new();
    for (i, token) in sent.tokens.iter_mut().enumerate() {
        let active: Vec<String> = token.active_labels().map(str::to_string).collect();
        if active.len() < 2 {
            continue;
        }
        let length = |label: &str| {
            token
                .longest_match(label)
                .map_or((0, 0), |p| (p.split_whitespace().count(), p.chars().count()))
        };
        // first label wins ties
        let mut keep = &active[0];
        for label in &active[1..] {
            if length(label) > length(keep) {
                keep = label;
            }
        }
        let keep = keep.clone();
        for label in active.iter().filter(|l| **l != keep) {
            token.set_label(label, false);
        }
        changed.insert(i);
    }
    changed
}

/// Set or clear `label` on explicit token positions
pub fn annotate_tokens(sent: &mut Sentence, token_ids: &[usize], label: &str, remove: bool) -> BTreeSet<usize> {
    let mut changed = BTreeSet::new();
    for &i in token_ids {
        let Some(token) = sent.tokens.get_mut(i) else {
            continue;
        };
        if token.is_labeled(label) == !remove {
            continue;
        }
        token.set_label(label, !remove);
        changed.insert(i);
    }
    changed
}
