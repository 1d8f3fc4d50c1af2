//! Phrase features
//!
//! Each feature maps a candidate phrase to a real number for one label. The
//! averaged scorer normalises and averages the enabled features; the learned
//! combiner uses them as inputs to a logistic regression.

use crate::config::Config;
use crate::counter::{Counter, TwoDimCounter};
use crate::edit_distance;
use crate::extract::PatternId;
use crate::phrase::CandidatePhrase;
use crate::state::BootstrapState;
use std::collections::BTreeMap;
use std::hash::Hash;

/// Largest edit distance looked at by the edit-distance features
const EDIT_DISTANCE_BOUND: usize = 3;
/// Phrases shorter than this get no edit-distance evidence
const EDIT_DISTANCE_MIN_CHARS: usize = 4;
/// Relative distance under which a phrase counts as close
const EDIT_DISTANCE_RATIO_CUTOFF: f64 = 0.2;
const SOFTMAX_CAP: f64 = 7.0;
const MIN_MAX_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhraseFeature {
    PatWtByFreq,
    DomainNgram,
    GoogleNgram,
    DistSim,
    EditDistSame,
    EditDistOther,
    WordShape,
    SemanticOdds,
}

impl PhraseFeature {
    pub const ALL: [PhraseFeature; 8] = [
        PhraseFeature::PatWtByFreq,
        PhraseFeature::DomainNgram,
        PhraseFeature::GoogleNgram,
        PhraseFeature::DistSim,
        PhraseFeature::EditDistSame,
        PhraseFeature::EditDistOther,
        PhraseFeature::WordShape,
        PhraseFeature::SemanticOdds,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PhraseFeature::PatWtByFreq => "PatWtByFreq",
            PhraseFeature::DomainNgram => "DomainNgram",
            PhraseFeature::GoogleNgram => "GoogleNgram",
            PhraseFeature::DistSim => "DistSim",
            PhraseFeature::EditDistSame => "EditDistSame",
            PhraseFeature::EditDistOther => "EditDistOther",
            PhraseFeature::WordShape => "WordShape",
            PhraseFeature::SemanticOdds => "SemanticOdds",
        }
    }

    pub fn enabled(&self, config: &Config) -> bool {
        match self {
            PhraseFeature::PatWtByFreq => config.use_phrase_eval_pat_wt_by_freq,
            PhraseFeature::DomainNgram => config.use_phrase_eval_domain_ngram,
            PhraseFeature::GoogleNgram => config.use_phrase_eval_google_ngram,
            PhraseFeature::DistSim => config.use_phrase_eval_word_class,
            PhraseFeature::EditDistSame => config.use_phrase_eval_edit_dist_same,
            PhraseFeature::EditDistOther => config.use_phrase_eval_edit_dist_other,
            PhraseFeature::WordShape => config.use_phrase_eval_word_shape,
            PhraseFeature::SemanticOdds => config.use_phrase_eval_sem_odds,
        }
    }

    /// Higher raw values mean a worse candidate
    pub fn one_minus(&self) -> bool {
        matches!(self, PhraseFeature::EditDistOther)
    }
}

pub fn enabled_features(config: &Config) -> Vec<PhraseFeature> {
    PhraseFeature::ALL
        .into_iter()
        .filter(|f| f.enabled(config))
        .collect()
}

/// Coarse shape of a word: `Flu-2` becomes `Xx-d`
pub fn word_shape(text: &str) -> String {
    let mut shape = String::with_capacity(text.len());
    let mut last = None;
    for c in text.chars() {
        let s = if c.is_uppercase() {
            'X'
        } else if c.is_lowercase() {
            'x'
        } else if c.is_ascii_digit() {
            'd'
        } else {
            c
        };
        if last != Some(s) {
            shape.push(s);
            last = Some(s);
        }
    }
    shape
}

/// Logistic squashing followed by min-max scaling
///
/// With `one_minus` the squashing is reversed, so large raw values end up
/// near zero. A flat distribution maps every value to the minimum.
pub fn normalize_soft_max_min_max<K: Clone + Eq + Hash>(
    scores: &Counter<K>,
    min_max: bool,
    softmax: bool,
    one_minus: bool,
) -> Counter<K> {
    let mut out: Counter<K> = scores
        .iter()
        .map(|(k, v)| {
            let v = if softmax {
                let capped = v.min(SOFTMAX_CAP);
                if one_minus {
                    1.0 / (1.0 + capped.exp())
                } else {
                    1.0 / (1.0 + (-capped).exp())
                }
            } else {
                v
            };
            (k.clone(), v)
        })
        .collect();

    if min_max && let (Some(min), Some(max)) = (out.min_value(), out.max_value()) {
        let keys: Vec<K> = out.keys().cloned().collect();
        for k in keys {
            let v = out.get(&k);
            let scaled = if max > min {
                (v - min + MIN_MAX_EPSILON) / (max - min)
            } else {
                min
            };
            out.set(k, scaled);
        }
    }
    out
}

/// Inputs shared by every feature of one label
pub struct FeatureContext<'a> {
    pub label: &'a str,
    pub state: &'a BootstrapState,
    pub config: &'a Config,
    /// Phrase -> extracting pattern -> count
    pub extracted: &'a TwoDimCounter<CandidatePhrase, PatternId>,
    pub pattern_weights: &'a Counter<PatternId>,
    same_words: Vec<String>,
    other_words: Vec<String>,
    domain_ratio: f64,
    google_ratio: f64,
}

impl<'a> FeatureContext<'a> {
    pub fn new(
        label: &'a str,
        state: &'a BootstrapState,
        config: &'a Config,
        extracted: &'a TwoDimCounter<CandidatePhrase, PatternId>,
        pattern_weights: &'a Counter<PatternId>,
    ) -> Self {
        let same_words = state
            .identified_words(label)
            .map(|p| p.text().to_lowercase())
            .collect();
        let other_words = state.other_semantic.iter().cloned().collect();

        let corpus_total: f64 = state.corpus_freq.values().sum();
        let ratio = |table: &rustc_hash::FxHashMap<String, f64>| {
            let total: f64 = table.values().sum();
            if corpus_total > 0.0 { total / corpus_total } else { 0.0 }
        };

        Self {
            label,
            state,
            config,
            extracted,
            pattern_weights,
            same_words,
            other_words,
            domain_ratio: ratio(&state.domain_ngrams),
            google_ratio: ratio(&state.google_ngrams),
        }
    }

    fn corpus_freq(&self, lower: &str) -> f64 {
        self.state.corpus_freq.get(lower).copied().unwrap_or(0.0)
    }

    /// Raw value of `feature` for `phrase`
    pub fn value(&self, feature: PhraseFeature, phrase: &CandidatePhrase) -> f64 {
        let lower = phrase.text().to_lowercase();
        match feature {
            PhraseFeature::PatWtByFreq => {
                let Some(row) = self.extracted.row(phrase) else {
                    return 0.0;
                };
                let support: f64 = row
                    .iter()
                    .map(|(p, count)| self.pattern_weights.get(p) * count)
                    .sum();
                let norm = self
                    .config
                    .freq_normalization
                    .apply(self.corpus_freq(&lower).max(1.0));
                support / norm
            }
            PhraseFeature::DomainNgram => {
                ngram_ratio(&self.state.domain_ngrams, &lower, self.corpus_freq(&lower), self.domain_ratio)
            }
            PhraseFeature::GoogleNgram => {
                ngram_ratio(&self.state.google_ngrams, &lower, self.corpus_freq(&lower), self.google_ratio)
            }
            PhraseFeature::DistSim => self.dist_sim(&lower),
            PhraseFeature::EditDistSame => close_to(&lower, &self.same_words),
            PhraseFeature::EditDistOther => close_to(&lower, &self.other_words),
            PhraseFeature::WordShape => {
                let Some(shapes) = self.state.word_shapes.get(self.label) else {
                    return 0.0;
                };
                let total = shapes.total();
                if total > 0.0 {
                    shapes.get(&word_shape(phrase.text())) / total
                } else {
                    0.0
                }
            }
            PhraseFeature::SemanticOdds => self.state.dict_odds_for(self.label, phrase.text()),
        }
    }

    fn dist_sim(&self, lower: &str) -> f64 {
        let Some(weights) = self.state.dist_sim_weights.get(self.label) else {
            return 0.0;
        };
        let weight = |w: &str| {
            self.state
                .clusters
                .get(w)
                .map(|c| weights.get(c).copied().unwrap_or(0.0))
        };
        if let Some(w) = weight(lower) {
            return w;
        }
        let found: Vec<f64> = lower.split_whitespace().filter_map(weight).collect();
        if found.is_empty() {
            0.0
        } else {
            found.iter().sum::<f64>() / found.len() as f64
        }
    }

    /// Enabled features by name, plus the phrase's own features
    pub fn feature_map(&self, phrase: &CandidatePhrase) -> BTreeMap<String, f64> {
        let mut map: BTreeMap<String, f64> = phrase.features().clone();
        for f in enabled_features(self.config) {
            map.insert(f.name().to_string(), self.value(f, phrase));
        }
        map
    }
}

fn ngram_ratio(
    table: &rustc_hash::FxHashMap<String, f64>,
    lower: &str,
    corpus_freq: f64,
    total_ratio: f64,
) -> f64 {
    match table.get(lower) {
        Some(df) => (1.0 + corpus_freq) * total_ratio / (1.0 + df),
        None => 0.0,
    }
}

fn close_to(lower: &str, words: &[String]) -> f64 {
    if lower.chars().count() < EDIT_DISTANCE_MIN_CHARS || words.is_empty() {
        return 0.0;
    }
    let ratio = edit_distance::distance_ratio(lower, words.iter().map(String::as_str), EDIT_DISTANCE_BOUND);
    if ratio < EDIT_DISTANCE_RATIO_CUTOFF { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BootstrapState {
        let mut s = BootstrapState::new(["DISEASE".to_string()]);
        s.add_seeds("DISEASE", ["influenza", "Flu"]);
        s.other_semantic.insert("hospital".to_string());
        s.refresh_seed_statistics();
        s
    }

    // ===== Word Shape Tests =====

    #[test]
    fn test_word_shape() {
        assert_eq!(word_shape("Flu"), "Xx");
        assert_eq!(word_shape("COVID-19"), "X-d");
        assert_eq!(word_shape("pneumonia"), "x");
        assert_eq!(word_shape(""), "");
    }

    // ===== Normalisation Tests =====

    #[test]
    fn test_normalize() {
        let scores: Counter<&str> = [("a", 0.0), ("b", 10.0), ("c", 2.0)].into_iter().collect();
        let n = normalize_soft_max_min_max(&scores, true, true, false);
        assert!(n.get(&"a") < n.get(&"c"));
        assert!(n.get(&"c") < n.get(&"b"));
        assert!((n.get(&"b") - 1.0).abs() < 1e-6);
        assert!(n.get(&"a") < 1e-6);

        let inv = normalize_soft_max_min_max(&scores, true, true, true);
        assert!(inv.get(&"a") > inv.get(&"b"));
    }

    #[test]
    fn test_normalize_flat() {
        let scores: Counter<&str> = [("a", 3.0), ("b", 3.0)].into_iter().collect();
        let n = normalize_soft_max_min_max(&scores, true, false, false);
        assert_eq!(n.get(&"a"), 3.0);
        assert_eq!(n.get(&"b"), 3.0);
    }

    // ===== Feature Tests =====

    #[test]
    fn test_pat_wt_by_freq() {
        let mut s = state();
        s.corpus_freq.insert("pneumonia".into(), 4.0);
        let phrase = s.registry.phrase("pneumonia");
        let mut extracted = TwoDimCounter::new();
        extracted.incr(phrase.clone(), PatternId(0), 2.0);
        extracted.incr(phrase.clone(), PatternId(1), 1.0);
        let weights: Counter<PatternId> = [(PatternId(0), 1.5), (PatternId(1), 1.0)].into_iter().collect();

        let mut config = Config::default();
        let ctx = FeatureContext::new("DISEASE", &s, &config, &extracted, &weights);
        assert_eq!(ctx.value(PhraseFeature::PatWtByFreq, &phrase), 1.0);

        config.freq_normalization = crate::config::FreqNormalization::Sqrt;
        let ctx = FeatureContext::new("DISEASE", &s, &config, &extracted, &weights);
        assert_eq!(ctx.value(PhraseFeature::PatWtByFreq, &phrase), 2.0);

        let unseen = s.registry.phrase("table");
        assert_eq!(ctx.value(PhraseFeature::PatWtByFreq, &unseen), 0.0);
    }

    #[test]
    fn test_edit_distance_features() {
        let s = state();
        let extracted = TwoDimCounter::new();
        let weights = Counter::new();
        let config = Config::default();
        let ctx = FeatureContext::new("DISEASE", &s, &config, &extracted, &weights);

        let near = s.registry.phrase("influenze");
        let far = s.registry.phrase("carpet");
        assert_eq!(ctx.value(PhraseFeature::EditDistSame, &near), 1.0);
        assert_eq!(ctx.value(PhraseFeature::EditDistSame, &far), 0.0);
        assert_eq!(ctx.value(PhraseFeature::EditDistOther, &s.registry.phrase("hospitals")), 1.0);
        // too short to judge
        assert_eq!(ctx.value(PhraseFeature::EditDistSame, &s.registry.phrase("flu")), 0.0);
    }

    #[test]
    fn test_ngram_and_shape_features() {
        let mut s = state();
        s.corpus_freq.insert("pneumonia".into(), 3.0);
        s.corpus_freq.insert("other".into(), 1.0);
        s.domain_ngrams.insert("pneumonia".into(), 1.0);
        s.domain_ngrams.insert("x".into(), 7.0);
        let extracted = TwoDimCounter::new();
        let weights = Counter::new();
        let config = Config::default();
        let ctx = FeatureContext::new("DISEASE", &s, &config, &extracted, &weights);

        let p = s.registry.phrase("pneumonia");
        // (1 + 3) * (8 / 4) / (1 + 1)
        assert_eq!(ctx.value(PhraseFeature::DomainNgram, &p), 4.0);
        assert_eq!(ctx.value(PhraseFeature::GoogleNgram, &p), 0.0);
        // one of two seed shapes is all lowercase
        assert_eq!(ctx.value(PhraseFeature::WordShape, &p), 0.5);
    }

    #[test]
    fn test_dist_sim() {
        let mut s = state();
        s.clusters.insert("influenza".into(), 4);
        s.clusters.insert("flu".into(), 4);
        s.clusters.insert("viral".into(), 4);
        s.clusters.insert("chair".into(), 9);
        s.refresh_seed_statistics();
        let extracted = TwoDimCounter::new();
        let weights = Counter::new();
        let config = Config::default();
        let ctx = FeatureContext::new("DISEASE", &s, &config, &extracted, &weights);

        assert_eq!(ctx.value(PhraseFeature::DistSim, &s.registry.phrase("viral")), 1.0);
        assert_eq!(ctx.value(PhraseFeature::DistSim, &s.registry.phrase("viral chair")), 0.5);
        assert_eq!(ctx.value(PhraseFeature::DistSim, &s.registry.phrase("unknown")), 0.0);
    }

    #[test]
    fn test_feature_map_includes_length() {
        let s = state();
        let extracted = TwoDimCounter::new();
        let weights = Counter::new();
        let config = Config::default();
        let ctx = FeatureContext::new("DISEASE", &s, &config, &extracted, &weights);
        let map = ctx.feature_map(&s.registry.phrase("chronic pain"));
        assert_eq!(map.get("LENGTH-2"), Some(&1.0));
        assert!(map.contains_key("PatWtByFreq"));
        assert!(!map.contains_key("WordShape"));
    }
}
