//! Sufficient statistics for pattern scoring
//!
//! For one label, every token of every sentence is classified as a positive,
//! negative or unlabeled occurrence of its phrase, and each pattern firing
//! at the token is credited with that phrase. Workers scan contiguous
//! sentence batches and return their triples; the caller merges them.

use crate::config::Config;
use crate::counter::TwoDimCounter;
use crate::extract::{PatternId, PatternsForEachToken};
use crate::phrase::CandidatePhrase;
use crate::state::BootstrapState;
use crate::store::SentenceStore;
use crate::token::Token;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use regex::Regex;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("no patterns were computed for sentence {sent_id}")]
    NoPatternsForSentence { sent_id: String },
}

/// How a token's phrase relates to the label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Positive,
    Negative,
    Unlabeled,
}

/// Pattern -> phrase -> occurrences, split by polarity
#[derive(Debug, Clone, Default)]
pub struct SufficientStats {
    pub pos: TwoDimCounter<PatternId, CandidatePhrase>,
    pub neg: TwoDimCounter<PatternId, CandidatePhrase>,
    pub unlab: TwoDimCounter<PatternId, CandidatePhrase>,
}

impl SufficientStats {
    pub fn add(&mut self, pattern: PatternId, phrase: CandidatePhrase, polarity: Polarity) {
        let table = match polarity {
            Polarity::Positive => &mut self.pos,
            Polarity::Negative => &mut self.neg,
            Polarity::Unlabeled => &mut self.unlab,
        };
        table.incr(pattern, phrase, 1.0);
    }

    pub fn merge(&mut self, other: &SufficientStats) {
        self.pos.add_all(&other.pos);
        self.neg.add_all(&other.neg);
        self.unlab.add_all(&other.unlab);
    }

    /// Patterns with any support, in first-seen order
    pub fn patterns(&self) -> Vec<PatternId> {
        let mut seen = FxHashSet::default();
        self.pos
            .keys()
            .chain(self.neg.keys())
            .chain(self.unlab.keys())
            .filter(|p| seen.insert(**p))
            .copied()
            .collect()
    }

    /// Distinct phrases supporting `pattern` with `polarity`
    pub fn distinct(&self, pattern: PatternId, polarity: Polarity) -> usize {
        let table = match polarity {
            Polarity::Positive => &self.pos,
            Polarity::Negative => &self.neg,
            Polarity::Unlabeled => &self.unlab,
        };
        table.row(&pattern).map_or(0, |r| r.len())
    }

    /// Drop patterns below the positive or unlabeled support minimum
    pub fn enforce_min_support(&mut self, min_pos: usize, min_unlab: usize) -> usize {
        let mut dropped = 0;
        for p in self.patterns() {
            if self.distinct(p, Polarity::Positive) < min_pos
                || self.distinct(p, Polarity::Unlabeled) < min_unlab
            {
                self.pos.remove_row(&p);
                self.neg.remove_row(&p);
                self.unlab.remove_row(&p);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty() && self.neg.is_empty() && self.unlab.is_empty()
    }
}

/// Phrase a token stands for under `label`
pub fn token_phrase<'a>(token: &'a Token, label: &str, use_matching_phrase: bool) -> &'a str {
    if use_matching_phrase {
        if let Some(longest) = token.longest_match(label) {
            return longest;
        }
    }
    &token.word
}

/// Token passes the ignore regex and the label's tag and NER restrictions
pub fn token_allowed(token: &Token, label: &str, state: &BootstrapState, word_ignore: &Regex) -> bool {
    if word_ignore.is_match(&token.word) {
        return false;
    }
    let tag_ok = state
        .allowed_tags
        .get(label)
        .is_none_or(|tags| tags.is_empty() || tags.iter().any(|t| token.pos.starts_with(t.as_str())));
    let ner_ok = state
        .allowed_ners
        .get(label)
        .is_none_or(|ners| ners.is_empty() || ners.iter().any(|n| token.ner == *n));
    tag_ok && ner_ok
}

/// Polarity of a token for `label`
pub fn polarity(token: &Token, phrase: &str, label: &str, state: &BootstrapState, config: &Config) -> Polarity {
    if token.is_labeled(label) {
        return Polarity::Positive;
    }
    if state.other_semantic.contains(&phrase.to_lowercase()) {
        return Polarity::Negative;
    }
    let other_class = state.other_labels(label).any(|other| {
        state.is_seed(other, phrase)
            || (config.use_other_labels_words_as_negative
                && (token.is_labeled(other) || state.is_learned(other, phrase)))
    });
    if other_class {
        Polarity::Negative
    } else {
        Polarity::Unlabeled
    }
}

/// Sentence ids to scan, sampled when the configured fraction is below one
pub fn sample_sentences(store: &SentenceStore, fraction: f64, seed: u64) -> Vec<String> {
    if fraction >= 1.0 {
        return store.ids().cloned().collect();
    }
    let mut rng = SmallRng::seed_from_u64(seed);
    store
        .ids()
        .filter(|_| rng.gen_bool(fraction.max(0.0)))
        .cloned()
        .collect()
}

/// Collect sufficient statistics for `label` over one store
pub fn compute_stats(
    label: &str,
    store: &SentenceStore,
    pft: &PatternsForEachToken,
    state: &BootstrapState,
    config: &Config,
    word_ignore: &Regex,
    pool: &rayon::ThreadPool,
) -> Result<SufficientStats, StatsError> {
    let ids = sample_sentences(
        store,
        config.sample_sentences_for_sufficient_stats,
        config.random_seed.wrapping_add(state.iteration as u64),
    );
    let n = pool.current_num_threads().max(1);
    let chunk = ids.len().div_ceil(n).max(1);

    let partials: Vec<Vec<(PatternId, CandidatePhrase, Polarity)>> = pool.install(|| {
        ids.par_chunks(chunk)
            .map(|batch| {
                let mut triples = Vec::new();
                for id in batch {
                    let Some(sent) = store.get(id) else {
                        continue;
                    };
                    let Some(token_patterns) = pft.get(id) else {
                        return Err(StatsError::NoPatternsForSentence {
                            sent_id: id.clone(),
                        });
                    };
                    for (i, token) in sent.tokens.iter().enumerate() {
                        let Some(pats) = token_patterns.get(&i) else {
                            continue;
                        };
                        if !token_allowed(token, label, state, word_ignore) {
                            continue;
                        }
                        let text = token_phrase(token, label, config.use_matching_phrase);
                        let pol = polarity(token, text, label, state, config);
                        let phrase = state.registry.phrase(text);
                        for p in pats {
                            triples.push((*p, phrase.clone(), pol));
                        }
                    }
                }
                Ok(triples)
            })
            .collect::<Result<Vec<_>, StatsError>>()
    })?;

    let mut stats = SufficientStats::default();
    for (p, phrase, pol) in partials.into_iter().flatten() {
        stats.add(p, phrase, pol);
    }
    debug!(
        label,
        sentences = ids.len(),
        patterns = stats.patterns().len(),
        "computed sufficient statistics"
    );
    Ok(stats)
}

/// Patterns whose positive phrases include every phrase in `required`
pub fn patterns_covering(stats: &SufficientStats, required: &BTreeSet<CandidatePhrase>) -> Vec<PatternId> {
    stats
        .patterns()
        .into_iter()
        .filter(|p| {
            stats
                .pos
                .row(p)
                .is_some_and(|row| required.iter().all(|r| row.contains(r)))
        })
        .collect()
}
