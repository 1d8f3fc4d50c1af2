//! Bootstrap run state
//!
//! Everything that survives between iterations lives here: the seeds, the
//! learned words and patterns (with a per-iteration history), the background
//! word lists and the external statistics used by the phrase features. The
//! controller owns the state and passes it by reference to every phase.

use crate::config::{Config, ConfigError};
use crate::counter::Counter;
use crate::extract::{PatternId, PatternInterner};
use crate::features::word_shape;
use crate::pattern::Pattern;
use crate::pattern_parse::{PatternParseError, parse_pattern};
use crate::phrase::{CandidatePhrase, PhraseRegistry};
use crate::seeds::{self, SeedError};
use crate::store::SentenceStore;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info};

/// Weight given to n-grams never seen in any seed list
const OOV_ODDS: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Seed(#[from] SeedError),

    #[error(transparent)]
    Pattern(#[from] PatternParseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Mutable state of one bootstrap run
#[derive(Debug, Default)]
pub struct BootstrapState {
    pub labels: Vec<String>,
    pub registry: PhraseRegistry,
    pub interner: PatternInterner,

    pub seeds: BTreeMap<String, BTreeSet<CandidatePhrase>>,
    pub learned_words: BTreeMap<String, Counter<CandidatePhrase>>,
    pub learned_words_each_iter: BTreeMap<String, BTreeMap<usize, Counter<CandidatePhrase>>>,
    pub learned_patterns: BTreeMap<String, Counter<PatternId>>,
    pub learned_patterns_each_iter: BTreeMap<String, BTreeMap<usize, Counter<PatternId>>>,

    pub stop_words: FxHashSet<String>,
    pub fillers: FxHashSet<String>,
    pub other_semantic: FxHashSet<String>,
    pub english_words: FxHashSet<String>,
    pub common_words: FxHashSet<String>,
    pub function_words: FxHashSet<String>,
    /// label -> words never to learn
    pub ignore_words: BTreeMap<String, FxHashSet<String>>,
    pub ignore_patterns: Vec<Pattern>,
    /// label -> pattern used by `F1SeedPattern` scoring
    pub seed_patterns: BTreeMap<String, Pattern>,

    pub clusters: FxHashMap<String, i32>,
    pub dist_sim_weights: BTreeMap<String, FxHashMap<i32, f64>>,
    pub dict_odds: BTreeMap<String, FxHashMap<String, f64>>,
    pub word_shapes: BTreeMap<String, Counter<String>>,
    pub domain_ngrams: FxHashMap<String, f64>,
    pub google_ngrams: FxHashMap<String, f64>,
    /// Lowercased phrase -> count in this corpus
    pub corpus_freq: FxHashMap<String, f64>,

    pub allowed_tags: BTreeMap<String, Vec<String>>,
    pub allowed_ners: BTreeMap<String, Vec<String>>,

    /// Current pattern threshold, lowered when tuning keeps the run going
    pub threshold_select_pattern: f64,
    /// Iterations completed so far
    pub iteration: usize,
}

impl BootstrapState {
    /// Empty state for the given labels
    pub fn new(labels: impl IntoIterator<Item = String>) -> Self {
        let mut state = Self::default();
        for label in labels {
            state.ensure_label(&label);
        }
        state
    }

    fn ensure_label(&mut self, label: &str) {
        if !self.labels.iter().any(|l| l == label) {
            self.labels.push(label.to_string());
            self.labels.sort();
        }
        self.seeds.entry(label.to_string()).or_default();
        self.learned_words.entry(label.to_string()).or_default();
        self.learned_patterns.entry(label.to_string()).or_default();
        self.learned_words_each_iter.entry(label.to_string()).or_default();
        self.learned_patterns_each_iter.entry(label.to_string()).or_default();
        self.ignore_words.entry(label.to_string()).or_default();
    }

    /// Build the state described by `config`: seeds, word lists and statistics
    pub fn from_config(config: &Config) -> Result<Self, StateError> {
        let seeds = seeds::read_seed_manifest(&config.seed_words_files)?;
        config.validate_labels(seeds.keys().map(String::as_str))?;

        let mut state = Self::new(seeds.keys().cloned());
        for (label, phrases) in &seeds {
            state.add_seeds(label, phrases.iter().map(String::as_str));
        }

        state.stop_words = seeds::read_word_lists(&config.stop_words_files)?;
        state.english_words = seeds::read_word_lists(&config.english_words_files)?;
        state.common_words = seeds::read_word_lists(&config.common_words_files)?;
        state.other_semantic = seeds::read_word_lists(&config.other_semantic_classes_files)?;
        state.function_words = config.function_words.iter().map(|w| w.to_lowercase()).collect();
        state.fillers = config.filler_words.iter().map(|w| w.to_lowercase()).collect();

        if let Some(manifest) = &config.ignore_words_files {
            for (label, files) in seeds::parse_manifest(manifest) {
                let words = seeds::read_word_lists(&files)?;
                state.ignore_words.entry(label).or_default().extend(words);
            }
        }
        if let Some(path) = &config.ignore_patterns_file {
            state.ignore_patterns = seeds::read_patterns(path)?;
        }
        for (label, text) in &config.seed_patterns {
            state.seed_patterns.insert(label.clone(), parse_pattern(text)?);
        }

        if let Some(path) = &config.word_class_clusters_file {
            state.clusters = seeds::read_clusters(path)?;
        }
        if let Some(manifest) = &config.dist_sim_weights_files {
            for (label, files) in seeds::parse_manifest(manifest) {
                let entry = state.dist_sim_weights.entry(label).or_default();
                for file in files {
                    entry.extend(seeds::read_cluster_weights(&file)?);
                }
            }
        }
        if let Some(path) = &config.domain_ngrams_file {
            state.domain_ngrams = seeds::read_ngram_counts(path)?;
        }
        if let Some(path) = &config.google_ngrams_file {
            state.google_ngrams = seeds::read_ngram_counts(path)?;
        }

        state.allowed_tags = config.allowed_tags_initials.clone();
        state.allowed_ners = config.allowed_ners_for_labels.clone();
        state.threshold_select_pattern = config.threshold_select_pattern;
        state.refresh_seed_statistics();

        info!(
            labels = state.labels.len(),
            seeds = state.seeds.values().map(BTreeSet::len).sum::<usize>(),
            "loaded bootstrap state"
        );
        Ok(state)
    }

    /// Add seed phrases for `label`, creating the label if needed
    pub fn add_seeds<'a>(&mut self, label: &str, phrases: impl IntoIterator<Item = &'a str>) {
        self.ensure_label(label);
        let mut added = Vec::new();
        for text in phrases {
            let text = text.trim();
            if !text.is_empty() {
                added.push(self.registry.phrase(text));
            }
        }
        if let Some(seeds) = self.seeds.get_mut(label) {
            seeds.extend(added);
        }
    }

    /// Recompute the statistics derived from the seed lists
    pub fn refresh_seed_statistics(&mut self) {
        self.compute_word_shapes();
        self.compute_dict_odds();
        self.compute_default_dist_sim_weights();
    }

    pub fn other_labels<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.labels
            .iter()
            .map(String::as_str)
            .filter(move |l| *l != label)
    }

    /// Seeds and learned words of `label`
    pub fn identified_words<'a>(&'a self, label: &str) -> impl Iterator<Item = &'a CandidatePhrase> + 'a {
        let seeds = self.seeds.get(label).into_iter().flatten();
        let learned = self
            .learned_words
            .get(label)
            .into_iter()
            .flat_map(|c| c.keys());
        seeds.chain(learned)
    }

    pub fn is_identified(&self, label: &str, text: &str) -> bool {
        let phrase = CandidatePhrase::new(text);
        self.seeds.get(label).is_some_and(|s| s.contains(&phrase))
            || self
                .learned_words
                .get(label)
                .is_some_and(|c| c.contains(&phrase))
    }

    pub fn is_seed(&self, label: &str, text: &str) -> bool {
        self.seeds
            .get(label)
            .is_some_and(|s| s.contains(&CandidatePhrase::new(text)))
    }

    pub fn is_learned(&self, label: &str, text: &str) -> bool {
        self.learned_words
            .get(label)
            .is_some_and(|c| c.contains(&CandidatePhrase::new(text)))
    }

    /// Words never to learn for `label`
    pub fn is_ignored(&self, label: &str, text: &str) -> bool {
        self.ignore_words
            .get(label)
            .is_some_and(|w| w.contains(&text.to_lowercase()))
    }

    pub fn learned_pattern_list(&self, label: &str) -> Vec<(Pattern, f64)> {
        self.learned_patterns
            .get(label)
            .map(|c| {
                c.iter()
                    .map(|(id, score)| (self.interner.pattern(*id).clone(), score))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record the patterns accepted for `label` in `iteration`
    pub fn record_patterns(&mut self, label: &str, iteration: usize, patterns: &Counter<PatternId>) {
        self.ensure_label(label);
        if let Some(learned) = self.learned_patterns.get_mut(label) {
            learned.add_all(patterns);
        }
        if let Some(history) = self.learned_patterns_each_iter.get_mut(label) {
            history.entry(iteration).or_default().add_all(patterns);
        }
    }

    /// Record the words accepted for `label` in `iteration`
    pub fn record_words(&mut self, label: &str, iteration: usize, words: &Counter<CandidatePhrase>) {
        self.ensure_label(label);
        if let Some(learned) = self.learned_words.get_mut(label) {
            learned.add_all(words);
        }
        if let Some(history) = self.learned_words_each_iter.get_mut(label) {
            history.entry(iteration).or_default().add_all(words);
        }
    }

    /// Drop `phrases` from the seeds and learned words of `label`
    pub fn remove_phrases<'a>(&mut self, label: &str, phrases: impl IntoIterator<Item = &'a str>) {
        for text in phrases {
            let phrase = CandidatePhrase::new(text);
            if let Some(seeds) = self.seeds.get_mut(label) {
                seeds.remove(&phrase);
            }
            if let Some(learned) = self.learned_words.get_mut(label) {
                learned.remove(&phrase);
            }
            if let Some(history) = self.learned_words_each_iter.get_mut(label) {
                for words in history.values_mut() {
                    words.remove(&phrase);
                }
            }
        }
    }

    pub fn total_learned_words(&self) -> usize {
        self.learned_words.values().map(Counter::len).sum()
    }

    /// Count lowercased word n-grams up to `max_len` across the corpus
    pub fn compute_corpus_freq(&mut self, store: &SentenceStore, max_len: usize) {
        for sent in store.iter() {
            for start in 0..sent.len() {
                for end in start + 1..=(start + max_len.max(1)).min(sent.len()) {
                    *self
                        .corpus_freq
                        .entry(sent.span_text(start, end).to_lowercase())
                        .or_insert(0.0) += 1.0;
                }
            }
        }
        debug!(ngrams = self.corpus_freq.len(), "counted corpus n-grams");
    }

    fn compute_word_shapes(&mut self) {
        self.word_shapes.clear();
        for (label, seeds) in &self.seeds {
            let mut shapes = Counter::new();
            for seed in seeds {
                shapes.incr(word_shape(seed.text()), 1.0);
            }
            self.word_shapes.insert(label.clone(), shapes);
        }
    }

    /// Add-one odds of each seed n-gram belonging to its label
    fn compute_dict_odds(&mut self) {
        let mut counts: BTreeMap<&str, FxHashMap<String, f64>> = BTreeMap::new();
        for (label, seeds) in &self.seeds {
            let entry = counts.entry(label.as_str()).or_default();
            for seed in seeds {
                for ngram in ngrams(seed.text()) {
                    *entry.entry(ngram).or_insert(0.0) += 1.0;
                }
            }
        }
        let mut background: FxHashMap<String, f64> = FxHashMap::default();
        for word in &self.other_semantic {
            for ngram in ngrams(word) {
                *background.entry(ngram).or_insert(0.0) += 1.0;
            }
        }

        self.dict_odds.clear();
        for (label, own) in &counts {
            let mut odds = FxHashMap::default();
            for (ngram, count) in own {
                let others: f64 = counts
                    .iter()
                    .filter(|(l, _)| *l != label)
                    .map(|(_, c)| c.get(ngram).copied().unwrap_or(0.0))
                    .sum::<f64>()
                    + background.get(ngram).copied().unwrap_or(0.0);
                odds.insert(ngram.clone(), (count + 1.0) / (others + 1.0));
            }
            self.dict_odds.insert(label.to_string(), odds);
        }
    }

    /// Normalised cluster histogram of each label's seeds, when no weights were loaded
    fn compute_default_dist_sim_weights(&mut self) {
        if self.clusters.is_empty() {
            return;
        }
        for (label, seeds) in &self.seeds {
            if self.dist_sim_weights.get(label).is_some_and(|w| !w.is_empty()) {
                continue;
            }
            let mut hist: FxHashMap<i32, f64> = FxHashMap::default();
            for seed in seeds {
                if let Some(c) = self.clusters.get(&seed.text().to_lowercase()) {
                    *hist.entry(*c).or_insert(0.0) += 1.0;
                }
            }
            let total: f64 = hist.values().sum();
            if total > 0.0 {
                for w in hist.values_mut() {
                    *w /= total;
                }
            }
            self.dist_sim_weights.insert(label.clone(), hist);
        }
    }

    /// Dictionary odds of `text` for `label`, averaged over tokens when unseen
    pub fn dict_odds_for(&self, label: &str, text: &str) -> f64 {
        let Some(odds) = self.dict_odds.get(label) else {
            return OOV_ODDS;
        };
        let lower = text.to_lowercase();
        if let Some(o) = odds.get(&lower) {
            return *o;
        }
        let toks: Vec<&str> = lower.split_whitespace().collect();
        if toks.is_empty() {
            return OOV_ODDS;
        }
        toks.iter()
            .map(|t| odds.get(*t).copied().unwrap_or(OOV_ODDS))
            .sum::<f64>()
            / toks.len() as f64
    }
}

/// All contiguous word n-grams of `text`, lowercased
fn ngrams(text: &str) -> Vec<String> {
    let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
    let mut out = Vec::new();
    for start in 0..words.len() {
        for end in start + 1..=words.len() {
            out.push(words[start..end].join(" "));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Sentence;

    fn state() -> BootstrapState {
        let mut s = BootstrapState::new(["DISEASE".to_string(), "SYMPTOM".to_string()]);
        s.add_seeds("DISEASE", ["flu", "chronic pain"]);
        s.add_seeds("SYMPTOM", ["cough", "pain"]);
        s.refresh_seed_statistics();
        s
    }

    #[test]
    fn test_identified_words() {
        let mut s = state();
        assert!(s.is_identified("DISEASE", "flu"));
        assert!(!s.is_identified("SYMPTOM", "flu"));

        let mut words = Counter::new();
        words.set(s.registry.phrase("pneumonia"), 0.9);
        s.record_words("DISEASE", 1, &words);
        assert!(s.is_learned("DISEASE", "pneumonia"));
        assert_eq!(s.identified_words("DISEASE").count(), 3);
        assert_eq!(s.learned_words_each_iter["DISEASE"][&1].len(), 1);

        s.remove_phrases("DISEASE", ["pneumonia", "flu"]);
        assert!(!s.is_identified("DISEASE", "pneumonia"));
        assert!(!s.is_seed("DISEASE", "flu"));
    }

    #[test]
    fn test_other_labels() {
        let s = state();
        assert_eq!(s.other_labels("DISEASE").collect::<Vec<_>>(), vec!["SYMPTOM"]);
    }

    #[test]
    fn test_dict_odds() {
        let s = state();
        // "pain" is a SYMPTOM seed and part of a DISEASE seed.
        assert_eq!(s.dict_odds_for("DISEASE", "flu"), 2.0);
        assert_eq!(s.dict_odds_for("DISEASE", "pain"), 1.0);
        assert_eq!(s.dict_odds_for("SYMPTOM", "cough"), 2.0);
        let unseen = s.dict_odds_for("DISEASE", "flu season");
        assert!((unseen - (2.0 + OOV_ODDS) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_dist_sim_weights() {
        let mut s = state();
        s.clusters = [("flu", 1), ("pneumonia", 1), ("cough", 2)]
            .iter()
            .map(|(w, c)| (w.to_string(), *c))
            .collect();
        s.refresh_seed_statistics();
        assert_eq!(s.dist_sim_weights["DISEASE"][&1], 1.0);
        assert_eq!(s.dist_sim_weights["SYMPTOM"][&2], 1.0);
    }

    #[test]
    fn test_corpus_freq() {
        let mut s = state();
        let store = SentenceStore::from_sentences([
            Sentence::from_tagged("s1", "Flu and flu"),
            Sentence::from_tagged("s2", "chronic pain"),
        ]);
        s.compute_corpus_freq(&store, 2);
        assert_eq!(s.corpus_freq["flu"], 2.0);
        assert_eq!(s.corpus_freq["chronic pain"], 1.0);
    }
}
