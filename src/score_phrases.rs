//! Pattern application, phrase scoring and word selection
//!
//! Accepted patterns are applied to the corpus to collect candidate phrases,
//! each remembered with the patterns that extracted it. A `PhraseScorer`
//! ranks the candidates and `choose_top_words` (or `choose_bpb_word`) picks
//! the ones to learn.

use crate::config::{Config, PhraseScorerKind};
use crate::counter::{Counter, TwoDimCounter};
use crate::edit_distance;
use crate::extract::{PatternId, PatternInterner, PatternsForEachToken};
use crate::features::{FeatureContext, PhraseFeature, enabled_features, normalize_soft_max_min_max};
use crate::index::SentenceIndex;
use crate::logistic::{Dataset, LogisticClassifier, TrainError, TrainOptions};
use crate::matcher::{MatchContext, Program, Span};
use crate::phrase::CandidatePhrase;
use crate::state::BootstrapState;
use crate::stats::token_phrase;
use crate::store::{Corpus, SentenceStore, StoreError};
use crate::token::Sentence;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Features seen in fewer datums than this are dropped before training
const MIN_FEATURE_COUNT: usize = 2;

#[derive(Debug, Error)]
pub enum PhraseScoreError {
    #[error(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a phrase was found: sentence id and token span
pub type MatchLocation = (String, usize, usize);

/// Result of applying patterns to the corpus
#[derive(Debug, Clone, Default)]
pub struct AppliedPatterns {
    /// Phrase -> extracting pattern -> count, for phrases not yet identified
    pub extracted: TwoDimCounter<CandidatePhrase, PatternId>,
    /// Every match, identified phrases included
    pub matches: BTreeMap<String, Vec<MatchLocation>>,
}

impl AppliedPatterns {
    pub fn merge(&mut self, other: AppliedPatterns) {
        self.extracted.add_all(&other.extracted);
        for (phrase, locs) in other.matches {
            self.matches.entry(phrase).or_default().extend(locs);
        }
    }

    pub fn candidates(&self) -> Vec<CandidatePhrase> {
        self.extracted.keys().cloned().collect()
    }
}

fn is_stop_word(state: &BootstrapState, word: &str) -> bool {
    state.stop_words.contains(&word.to_lowercase())
}

/// Apply the phrase filters to a matched span
///
/// Returns the span to extract, possibly trimmed of stop words, or `None`
/// when the match yields no phrase.
pub fn candidate_span(
    sent: &Sentence,
    span: Span,
    label: &str,
    state: &BootstrapState,
    config: &Config,
) -> Option<Span> {
    let Span { mut start, mut end } = span;
    if config.remove_stop_words_from_selected_phrases {
        while start < end && is_stop_word(state, &sent.tokens[start].word) {
            start += 1;
        }
        while end > start && is_stop_word(state, &sent.tokens[end - 1].word) {
            end -= 1;
        }
    }
    if start >= end {
        return None;
    }
    let tokens = &sent.tokens[start..end];
    if config.do_not_extract_phrase_any_word_labeled_other_class
        && tokens.iter().any(|t| t.labeled_other_than(label))
    {
        return None;
    }
    if config.remove_phrases_with_stop_words && tokens.iter().any(|t| is_stop_word(state, &t.word)) {
        return None;
    }
    Some(Span::new(start, end))
}

/// Phrase text of a span, preferring the label's matched phrase for one token
fn span_phrase(sent: &Sentence, span: Span, label: &str, config: &Config) -> String {
    if span.len() == 1 {
        token_phrase(&sent.tokens[span.start], label, config.use_matching_phrase).to_string()
    } else {
        sent.span_text(span.start, span.end)
    }
}

fn record(
    out: &mut AppliedPatterns,
    found: Vec<(PatternId, String, Span, String)>,
    label: &str,
    state: &BootstrapState,
    word_ignore: &Regex,
) {
    for (p, sent_id, span, text) in found {
        out.matches
            .entry(text.clone())
            .or_default()
            .push((sent_id, span.start, span.end));
        if state.is_identified(label, &text) || word_ignore.is_match(&text) {
            continue;
        }
        out.extracted.incr(state.registry.phrase(&text), p, 1.0);
    }
}

/// Run the matcher for `patterns` over the sentences the index proposes
#[allow(clippy::too_many_arguments)]
pub fn apply_patterns(
    label: &str,
    patterns: &[PatternId],
    store: &SentenceStore,
    index: &dyn SentenceIndex,
    state: &BootstrapState,
    config: &Config,
    word_ignore: &Regex,
    pool: &rayon::ThreadPool,
) -> AppliedPatterns {
    let pattern_list: Vec<_> = patterns
        .iter()
        .map(|p| state.interner.pattern(*p).clone())
        .collect();
    let candidates = index.query_index(&pattern_list);

    let work: Vec<(PatternId, Program, Vec<&Sentence>)> = patterns
        .iter()
        .zip(&pattern_list)
        .map(|(id, pattern)| {
            let sents = candidates
                .get(pattern)
                .into_iter()
                .flatten()
                .filter_map(|sid| store.get(sid))
                .collect();
            (*id, Program::compile(pattern), sents)
        })
        .collect();

    let ctx = MatchContext {
        fillers: Some(&state.fillers),
        stop_words: Some(&state.stop_words),
        lowercase: config.match_lower_case_context,
        num_words_compound: config.num_words_compound,
    };

    let found: Vec<Vec<(PatternId, String, Span, String)>> = pool.install(|| {
        work.par_iter()
            .map(|(id, program, sents)| {
                let mut hits = Vec::new();
                for sent in sents {
                    for span in program.find_spans(sent, &ctx) {
                        if let Some(span) = candidate_span(sent, span, label, state, config) {
                            let text = span_phrase(sent, span, label, config);
                            hits.push((*id, sent.id.clone(), span, text));
                        }
                    }
                }
                hits
            })
            .collect()
    });

    let mut out = AppliedPatterns::default();
    record(&mut out, found.into_iter().flatten().collect(), label, state, word_ignore);
    debug!(
        label,
        patterns = patterns.len(),
        candidates = out.extracted.len(),
        "applied patterns"
    );
    out
}

/// Count precomputed token patterns instead of running the matcher
///
/// Only single-token phrases can be found this way.
pub fn count_precomputed(
    label: &str,
    patterns: &[PatternId],
    store: &SentenceStore,
    pft: &PatternsForEachToken,
    state: &BootstrapState,
    config: &Config,
    word_ignore: &Regex,
) -> AppliedPatterns {
    let wanted: FxHashSet<PatternId> = patterns.iter().copied().collect();
    let mut found = Vec::new();
    for sent in store.iter() {
        let Some(token_patterns) = pft.get(&sent.id) else {
            continue;
        };
        for (i, pats) in token_patterns {
            let span = Span::new(*i, *i + 1);
            let Some(span) = candidate_span(sent, span, label, state, config) else {
                continue;
            };
            for p in pats.iter().filter(|p| wanted.contains(p)) {
                found.push((*p, sent.id.clone(), span, span_phrase(sent, span, label, config)));
            }
        }
    }
    let mut out = AppliedPatterns::default();
    record(&mut out, found, label, state, word_ignore);
    out
}

/// Everything a phrase scorer may look at
pub struct PhraseScoreInput<'a> {
    pub label: &'a str,
    pub candidates: &'a [CandidatePhrase],
    pub extracted: &'a TwoDimCounter<CandidatePhrase, PatternId>,
    pub pattern_weights: &'a Counter<PatternId>,
    pub state: &'a BootstrapState,
    pub config: &'a Config,
    pub corpus: &'a Corpus,
}

impl PhraseScoreInput<'_> {
    fn feature_context(&self) -> FeatureContext<'_> {
        FeatureContext::new(
            self.label,
            self.state,
            self.config,
            self.extracted,
            self.pattern_weights,
        )
    }

    /// Candidates not already learned or seeded for the label
    fn unseen(&self) -> impl Iterator<Item = &CandidatePhrase> + '_ {
        self.candidates
            .iter()
            .filter(|p| !self.state.is_identified(self.label, p.text()))
    }
}

/// Ranks candidate phrases for one label
pub trait PhraseScorer: Send {
    fn score(&mut self, input: &PhraseScoreInput) -> Result<Counter<CandidatePhrase>, PhraseScoreError>;
}

pub fn phrase_scorer_for(kind: PhraseScorerKind) -> Box<dyn PhraseScorer> {
    match kind {
        PhraseScorerKind::AverageFeatures => Box::new(AveragedFeatureScorer),
        PhraseScorerKind::LearnFeatWt => Box::new(LearnedFeatureScorer::default()),
    }
}

/// Mean of the normalised enabled features
#[derive(Debug, Clone, Copy, Default)]
pub struct AveragedFeatureScorer;

impl PhraseScorer for AveragedFeatureScorer {
    fn score(&mut self, input: &PhraseScoreInput) -> Result<Counter<CandidatePhrase>, PhraseScoreError> {
        let ctx = input.feature_context();
        let phrases: Vec<&CandidatePhrase> = input.unseen().collect();
        let mut features = enabled_features(input.config);
        if features.is_empty() {
            features.push(PhraseFeature::PatWtByFreq);
        }

        let mut total: Counter<CandidatePhrase> =
            phrases.iter().map(|p| ((*p).clone(), 0.0)).collect();
        for f in &features {
            let raw: Counter<CandidatePhrase> = phrases
                .iter()
                .map(|p| ((*p).clone(), ctx.value(*f, p)))
                .collect();
            let normalised = normalize_soft_max_min_max(&raw, true, true, f.one_minus());
            total.add_all(&normalised);
        }
        let n = features.len() as f64;
        Ok(total.into_iter().map(|(p, v)| (p, v / n)).collect())
    }
}

/// Logistic regression over phrase features
///
/// Feature maps are cached per phrase and label for the current iteration.
#[derive(Debug, Default)]
pub struct LearnedFeatureScorer {
    cache_iteration: usize,
    cache: FxHashMap<(String, CandidatePhrase), BTreeMap<String, f64>>,
    /// Last trained model per label
    pub models: BTreeMap<String, LogisticClassifier>,
}

impl LearnedFeatureScorer {
    fn features(&mut self, ctx: &FeatureContext, phrase: &CandidatePhrase) -> BTreeMap<String, f64> {
        self.cache
            .entry((ctx.label.to_string(), phrase.clone()))
            .or_insert_with(|| ctx.feature_map(phrase))
            .clone()
    }
}

impl PhraseScorer for LearnedFeatureScorer {
    fn score(&mut self, input: &PhraseScoreInput) -> Result<Counter<CandidatePhrase>, PhraseScoreError> {
        if self.cache_iteration != input.state.iteration {
            self.cache.clear();
            self.cache_iteration = input.state.iteration;
        }
        let examples = build_examples(input.label, input.corpus, input.state, input.config)?;
        let ctx = input.feature_context();

        let mut dataset = Dataset::new();
        for p in &examples.positives {
            let f = self.features(&ctx, p);
            dataset.add(f, true);
        }
        for p in &examples.negatives {
            let f = self.features(&ctx, p);
            dataset.add(f, false);
        }
        dataset.apply_feature_count_threshold(MIN_FEATURE_COUNT);
        debug!(
            label = input.label,
            positives = dataset.num_positive(),
            negatives = dataset.num_negative(),
            "built phrase classifier dataset"
        );

        let model = LogisticClassifier::train(
            &dataset,
            &TrainOptions {
                sigma: input.config.lr_sigma,
                ..TrainOptions::default()
            },
        )?;

        let mut scores = Counter::new();
        for p in input.unseen() {
            let f = self.features(&ctx, p);
            scores.set(p.clone(), model.prob(&f));
        }
        self.models.insert(input.label.to_string(), model);
        Ok(scores)
    }
}

/// Training phrases for the learned combiner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Examples {
    pub positives: BTreeSet<CandidatePhrase>,
    pub negatives: BTreeSet<CandidatePhrase>,
}

/// Highest Jaccard overlap between the word classes of `words` and any positive
fn word_class_similarity(state: &BootstrapState, words: &[String], positives: &[BTreeSet<i32>]) -> f64 {
    let classes: BTreeSet<i32> = words
        .iter()
        .filter_map(|w| state.clusters.get(&w.to_lowercase()).copied())
        .collect();
    if classes.is_empty() {
        return 0.0;
    }
    positives
        .iter()
        .map(|pos| {
            let inter = classes.intersection(pos).count() as f64;
            let union = classes.union(pos).count() as f64;
            if union > 0.0 { inter / union } else { 0.0 }
        })
        .fold(0.0, f64::max)
}

/// Collect positive and negative phrases for `label`
///
/// Positives are phrases of tokens labeled with the label, plus its learned
/// words. Negatives are phrases of other labels, other-semantic words,
/// function words and random unlabeled spans. Every negative passes a
/// `per_select_neg` draw and random spans an additional `per_select_rand`
/// draw. Negatives are capped at the number of positives.
pub fn build_examples(
    label: &str,
    corpus: &Corpus,
    state: &BootstrapState,
    config: &Config,
) -> Result<Examples, StoreError> {
    let mut rng = SmallRng::seed_from_u64(config.random_seed);
    let mut examples = Examples::default();
    let mut unknown_spans: Vec<Vec<String>> = Vec::new();

    corpus.for_each_batch(|store| {
        for sent in store.iter() {
            for (i, token) in sent.tokens.iter().enumerate() {
                let lower = token.word.to_lowercase();
                if token.is_labeled(label) {
                    let text = token_phrase(token, label, config.use_matching_phrase);
                    examples.positives.insert(state.registry.phrase(text));
                    continue;
                }
                let other = state
                    .other_labels(label)
                    .find_map(|l| token.longest_match(l));
                let negative = match other {
                    Some(text) => Some(text.to_string()),
                    None if state.other_semantic.contains(&lower)
                        || state.function_words.contains(&lower) =>
                    {
                        Some(token.word.clone())
                    }
                    None => None,
                };
                if let Some(text) = negative {
                    if rng.gen_bool(config.per_select_neg.clamp(0.0, 1.0)) {
                        examples.negatives.insert(state.registry.phrase(&text));
                    }
                    continue;
                }
                if token.has_any_label() || !rng.gen_bool(config.per_select_rand.clamp(0.0, 1.0)) {
                    continue;
                }
                let len = rng.gen_range(1..=config.num_words_compound.max(1));
                let end = (i + len).min(sent.len());
                if sent.tokens[i..end].iter().any(|t| t.is_labeled(label)) {
                    continue;
                }
                unknown_spans.push(sent.tokens[i..end].iter().map(|t| t.word.clone()).collect());
            }
        }
        Ok::<(), StoreError>(())
    })?;

    for learned in state.learned_words.get(label).into_iter().flat_map(|c| c.keys()) {
        examples.positives.insert(learned.clone());
    }

    let positive_classes: Vec<BTreeSet<i32>> = if config.subsample_unk_as_neg_using_sim {
        examples
            .positives
            .iter()
            .map(|p| {
                p.text()
                    .split_whitespace()
                    .filter_map(|w| state.clusters.get(&w.to_lowercase()).copied())
                    .collect()
            })
            .collect()
    } else {
        Vec::new()
    };
    for words in unknown_spans {
        if config.subsample_unk_as_neg_using_sim
            && word_class_similarity(state, &words, &positive_classes)
                >= config.positive_similarity_threshold_low_precision
        {
            continue;
        }
        if rng.gen_bool(config.per_select_neg.clamp(0.0, 1.0)) {
            examples.negatives.insert(state.registry.phrase(&words.join(" ")));
        }
    }

    examples.negatives.retain(|n| !examples.positives.contains(n));
    if examples.negatives.len() > examples.positives.len() {
        let mut negs: Vec<CandidatePhrase> = examples.negatives.iter().cloned().collect();
        negs.shuffle(&mut rng);
        negs.truncate(examples.positives.len());
        examples.negatives = negs.into_iter().collect();
    }
    Ok(examples)
}

/// Distinct extracting patterns of `phrase`, dropping redundant ones
pub fn non_redundant_patterns(
    phrase: &CandidatePhrase,
    extracted: &TwoDimCounter<CandidatePhrase, PatternId>,
    interner: &PatternInterner,
) -> Vec<PatternId> {
    let mut kept: Vec<PatternId> = Vec::new();
    let Some(row) = extracted.row(phrase) else {
        return kept;
    };
    for p in row.keys() {
        let pattern = interner.pattern(*p);
        if !kept.iter().any(|k| interner.pattern(*k).redundant_with(pattern)) {
            kept.push(*p);
        }
    }
    kept
}

/// Candidates that may be learned at all: finitely scored, not
/// other-semantic, not already identified, not a stop word
pub fn learnable_terms<'a>(
    label: &str,
    scores: &'a Counter<CandidatePhrase>,
    state: &BootstrapState,
) -> Vec<(&'a CandidatePhrase, f64)> {
    scores
        .iter()
        .filter(|(p, score)| {
            let lower = p.text().to_lowercase();
            score.is_finite()
                && !state.other_semantic.contains(&lower)
                && !state.stop_words.contains(&lower)
                && !state.is_identified(label, p.text())
        })
        .collect()
}

/// Words never to pick for `label`: ignore list, other-semantic words, seeds
/// and learned words, lowercased
pub fn ignore_words_all(label: &str, state: &BootstrapState) -> FxHashSet<String> {
    let mut ignore: FxHashSet<String> = state
        .ignore_words
        .get(label)
        .cloned()
        .unwrap_or_default();
    ignore.extend(state.other_semantic.iter().cloned());
    ignore.extend(state.identified_words(label).map(|p| p.text().to_lowercase()));
    ignore
}

/// Pick the best words in score order
///
/// Stops at `num_words_to_add`, at the first score below
/// `threshold_word_extract`, or when the label reaches
/// `max_extract_num_words`. Words with too few non-redundant extracting
/// patterns are skipped, as are words fuzzily matching an ignored word; the
/// latter are added to `ignore`.
pub fn choose_top_words(
    label: &str,
    scores: &Counter<CandidatePhrase>,
    extracted: &TwoDimCounter<CandidatePhrase, PatternId>,
    state: &BootstrapState,
    config: &Config,
    ignore: &mut FxHashSet<String>,
) -> Counter<CandidatePhrase> {
    let already = state.learned_words.get(label).map_or(0, Counter::len);
    let room = config.max_extract_num_words.saturating_sub(already);
    let limit = config.num_words_to_add.min(room);

    let mut terms = learnable_terms(label, scores, state);
    terms.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut chosen = Counter::new();
    for (phrase, score) in terms {
        if chosen.len() >= limit {
            break;
        }
        if score < config.threshold_word_extract {
            break;
        }
        let lower = phrase.text().to_lowercase();
        if ignore.contains(&lower) {
            continue;
        }
        let supporting = non_redundant_patterns(phrase, extracted, &state.interner).len();
        if supporting < config.threshold_num_patterns_applied {
            debug!(phrase = %phrase, supporting, "too few patterns");
            continue;
        }
        if config.min_len4_fuzzy_for_pattern > 0
            && edit_distance::contains_fuzzy(
                ignore.iter().map(String::as_str),
                &lower,
                config.min_len4_fuzzy_for_pattern,
            )
        {
            ignore.insert(lower);
            continue;
        }
        chosen.set(phrase.clone(), score);
    }
    chosen
}

/// The single word whose best extracting pattern weighs most
///
/// Ties go to the word extracted more often, then to the first seen.
pub fn choose_bpb_word(
    label: &str,
    scores: &Counter<CandidatePhrase>,
    extracted: &TwoDimCounter<CandidatePhrase, PatternId>,
    pattern_weights: &Counter<PatternId>,
    state: &BootstrapState,
    config: &Config,
) -> Counter<CandidatePhrase> {
    let mut chosen = Counter::new();
    let already = state.learned_words.get(label).map_or(0, Counter::len);
    if already >= config.max_extract_num_words {
        return chosen;
    }
    let mut best: Option<(&CandidatePhrase, f64, f64)> = None;
    for (phrase, _) in learnable_terms(label, scores, state) {
        if state.is_ignored(label, phrase.text()) {
            continue;
        }
        let Some(row) = extracted.row(phrase) else {
            continue;
        };
        let weight = row
            .keys()
            .map(|p| pattern_weights.get(p))
            .fold(f64::NEG_INFINITY, f64::max);
        let count = row.total();
        let better = best.is_none_or(|(_, w, c)| weight > w || (weight == w && count > c));
        if better {
            best = Some((phrase, weight, count));
        }
    }
    if let Some((phrase, weight, _)) = best {
        chosen.set(phrase.clone(), weight);
    } else {
        warn!(label, "no word to learn");
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryIndex;
    use crate::pattern_parse::parse_pattern;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn corpus() -> SentenceStore {
        let mut store = SentenceStore::from_sentences([
            Sentence::from_tagged("s1", "patients with flu and pneumonia"),
            Sentence::from_tagged("s2", "cases with pneumonia and cough"),
            Sentence::from_tagged("s3", "people with cough and fever"),
        ]);
        for sent in store.iter_mut() {
            sent.init_labels(["DISEASE", "SYMPTOM"]);
        }
        store.get_mut("s1").unwrap().tokens[2].set_label("DISEASE", true);
        store.get_mut("s3").unwrap().tokens[2].set_label("SYMPTOM", true);
        store
    }

    fn state() -> BootstrapState {
        let mut state = BootstrapState::new(["DISEASE".to_string(), "SYMPTOM".to_string()]);
        state.add_seeds("DISEASE", ["flu"]);
        state.add_seeds("SYMPTOM", ["cough"]);
        state
    }

    fn no_ignore() -> Regex {
        Regex::new("^(?:[^a-zA-Z]*)$").unwrap()
    }

    fn applied(state: &mut BootstrapState, store: &SentenceStore, config: &Config) -> (PatternId, AppliedPatterns) {
        let p = state
            .interner
            .intern(parse_pattern(r#"[l:"with"] {TARGET} [l:"and"]"#).unwrap());
        let mut index = InMemoryIndex::new(FxHashSet::default());
        index.add(store, false);
        let out = apply_patterns("DISEASE", &[p], store, &index, state, config, &no_ignore(), &pool());
        (p, out)
    }

    // ===== Application Tests =====

    #[test]
    fn test_apply_proposes_pneumonia() {
        let store = corpus();
        let mut state = state();
        let (p, out) = applied(&mut state, &store, &Config::default());

        let pneumonia = state.registry.phrase("pneumonia");
        assert_eq!(out.extracted.get(&pneumonia, &p), 1.0);
        // seeds are matched but not proposed
        assert!(!out.extracted.contains(&state.registry.phrase("flu")));
        assert_eq!(out.matches["flu"], vec![("s1".to_string(), 2, 3)]);
        // cough is labeled SYMPTOM
        assert!(!out.extracted.contains(&state.registry.phrase("cough")));
    }

    #[test]
    fn test_other_class_words_allowed_when_configured() {
        let store = corpus();
        let mut state = state();
        let config = Config {
            do_not_extract_phrase_any_word_labeled_other_class: false,
            ..Config::default()
        };
        let (_, out) = applied(&mut state, &store, &config);
        assert!(out.extracted.contains(&state.registry.phrase("cough")));
    }

    #[test]
    fn test_stop_word_trimming() {
        let sent = Sentence::from_tagged("s", "the flu season");
        let mut state = state();
        state.stop_words.insert("the".into());
        let config = Config {
            remove_stop_words_from_selected_phrases: true,
            ..Config::default()
        };
        assert_eq!(
            candidate_span(&sent, Span::new(0, 2), "DISEASE", &state, &config),
            Some(Span::new(1, 2))
        );
        assert_eq!(candidate_span(&sent, Span::new(0, 1), "DISEASE", &state, &config), None);

        let config = Config {
            remove_phrases_with_stop_words: true,
            ..Config::default()
        };
        assert_eq!(candidate_span(&sent, Span::new(0, 2), "DISEASE", &state, &config), None);
    }

    #[test]
    fn test_count_precomputed() {
        use crate::extract::ContextPatternExtractor;
        use crate::factory::{FactoryWords, SurfaceOptions, SurfacePatternFactory};

        let store = corpus();
        let mut state = state();
        let factory = SurfacePatternFactory::new(
            SurfaceOptions {
                min_window: 1,
                max_window: 1,
                use_next_context: true,
                use_pos: false,
                use_filler_words: false,
                num_words_compound: 1,
                ..SurfaceOptions::default()
            },
            FactoryWords::default(),
        );
        let mut pft = PatternsForEachToken::new();
        ContextPatternExtractor::new(&factory).extract(&store, &pool(), &mut state.interner, &mut pft);
        let p = state
            .interner
            .get(&parse_pattern(r#"[l:"with"] {TARGET} [l:"and"]"#).unwrap())
            .unwrap();
        let out = count_precomputed("DISEASE", &[p], &store, &pft, &state, &Config::default(), &no_ignore());
        assert_eq!(out.extracted.get(&state.registry.phrase("pneumonia"), &p), 1.0);
    }

    // ===== Scorer Tests =====

    #[test]
    fn test_averaged_scorer_excludes_identified() {
        let store = corpus();
        let mut state = state();
        let (p, out) = applied(&mut state, &store, &Config::default());
        let mut weights = Counter::new();
        weights.set(p, 1.0);
        let config = Config::default();
        let corpus = Corpus::in_memory(store);
        let mut candidates = out.candidates();
        candidates.push(state.registry.phrase("flu"));

        let input = PhraseScoreInput {
            label: "DISEASE",
            candidates: &candidates,
            extracted: &out.extracted,
            pattern_weights: &weights,
            state: &state,
            config: &config,
            corpus: &corpus,
        };
        let scores = AveragedFeatureScorer.score(&input).unwrap();
        assert!(scores.contains(&state.registry.phrase("pneumonia")));
        assert!(!scores.contains(&state.registry.phrase("flu")));
        assert!(scores.get(&state.registry.phrase("pneumonia")) > 0.0);
    }

    #[test]
    fn test_no_negatives_skips_training() {
        let store = corpus();
        let mut state = state();
        let (p, out) = applied(&mut state, &store, &Config::default());
        let weights: Counter<PatternId> = [(p, 1.0)].into_iter().collect();
        let config = Config {
            per_select_neg: 0.0,
            ..Config::default()
        };
        let corpus = Corpus::in_memory(store);

        let examples = build_examples("DISEASE", &corpus, &state, &config).unwrap();
        assert!(!examples.positives.is_empty());
        assert!(examples.negatives.is_empty());

        let candidates = out.candidates();
        let input = PhraseScoreInput {
            label: "DISEASE",
            candidates: &candidates,
            extracted: &out.extracted,
            pattern_weights: &weights,
            state: &state,
            config: &config,
            corpus: &corpus,
        };
        let result = LearnedFeatureScorer::default().score(&input);
        assert!(matches!(
            result,
            Err(PhraseScoreError::Train(TrainError::SingleClass(_)))
        ));
    }

    #[test]
    fn test_examples_use_other_labels() {
        let mut store = corpus();
        store.get_mut("s3").unwrap().tokens[2]
            .matched
            .entry("SYMPTOM".into())
            .or_default()
            .add("cough");
        let state = state();
        let config = Config {
            per_select_rand: 0.0,
            ..Config::default()
        };
        let corpus = Corpus::in_memory(store);
        let examples = build_examples("DISEASE", &corpus, &state, &config).unwrap();
        assert!(examples.positives.contains(&CandidatePhrase::new("flu")));
        assert!(examples.negatives.contains(&CandidatePhrase::new("cough")));
        assert!(examples.negatives.len() <= examples.positives.len());
    }

    // ===== Word Selection Tests =====

    fn selection_fixture() -> (BootstrapState, TwoDimCounter<CandidatePhrase, PatternId>, Counter<CandidatePhrase>) {
        let mut state = state();
        let a = state.interner.intern(parse_pattern(r#"[l:"with"] {TARGET}"#).unwrap());
        let b = state.interner.intern(parse_pattern(r#"[l:"with"] {TARGET} [l:"and"]"#).unwrap());
        let c = state.interner.intern(parse_pattern(r#"{TARGET} [l:"of"]"#).unwrap());
        let mut extracted = TwoDimCounter::new();
        let pneumonia = state.registry.phrase("pneumonia");
        let measles = state.registry.phrase("measles");
        let fever = state.registry.phrase("fever");
        // a and b are redundant
        extracted.incr(pneumonia.clone(), a, 1.0);
        extracted.incr(pneumonia.clone(), c, 1.0);
        extracted.incr(measles.clone(), a, 1.0);
        extracted.incr(measles.clone(), b, 1.0);
        extracted.incr(fever.clone(), a, 2.0);
        extracted.incr(fever.clone(), c, 1.0);
        let scores: Counter<CandidatePhrase> =
            [(pneumonia, 0.9), (measles, 0.8), (fever, 0.1)].into_iter().collect();
        (state, extracted, scores)
    }

    #[test]
    fn test_choose_top_words() {
        let (state, extracted, scores) = selection_fixture();
        let config = Config::default();
        let mut ignore = ignore_words_all("DISEASE", &state);
        let chosen = choose_top_words("DISEASE", &scores, &extracted, &state, &config, &mut ignore);
        // measles has one non-redundant pattern, fever is under the threshold
        assert_eq!(
            chosen.keys().map(|p| p.text()).collect::<Vec<_>>(),
            vec!["pneumonia"]
        );

        let config = Config {
            threshold_num_patterns_applied: 1,
            num_words_to_add: 1,
            ..Config::default()
        };
        let chosen = choose_top_words("DISEASE", &scores, &extracted, &state, &config, &mut ignore);
        assert_eq!(chosen.len(), 1);
    }

    #[test]
    fn test_non_finite_scores_never_chosen() {
        let (state, extracted, mut scores) = selection_fixture();
        scores.set(state.registry.phrase("pneumonia"), f64::NAN);
        scores.set(state.registry.phrase("fever"), f64::INFINITY);
        let config = Config {
            threshold_num_patterns_applied: 1,
            ..Config::default()
        };
        let mut ignore = ignore_words_all("DISEASE", &state);
        let chosen = choose_top_words("DISEASE", &scores, &extracted, &state, &config, &mut ignore);
        assert_eq!(
            chosen.keys().map(|p| p.text()).collect::<Vec<_>>(),
            vec!["measles"]
        );

        let weights: Counter<PatternId> = state.interner.iter().map(|(id, _)| (id, 1.0)).collect();
        let chosen = choose_bpb_word("DISEASE", &scores, &extracted, &weights, &state, &config);
        assert_eq!(chosen.keys().next().unwrap().text(), "measles");
    }

    #[test]
    fn test_fuzzy_ignore() {
        let (mut state, extracted, scores) = selection_fixture();
        state
            .ignore_words
            .get_mut("DISEASE")
            .unwrap()
            .insert("pneumonie".into());
        let config = Config {
            min_len4_fuzzy_for_pattern: 4,
            ..Config::default()
        };
        let mut ignore = ignore_words_all("DISEASE", &state);
        let chosen = choose_top_words("DISEASE", &scores, &extracted, &state, &config, &mut ignore);
        assert!(chosen.is_empty());
        assert!(ignore.contains("pneumonia"));
    }

    #[test]
    fn test_max_extract_num_words() {
        let (state, extracted, scores) = selection_fixture();
        let config = Config {
            max_extract_num_words: 0,
            ..Config::default()
        };
        let mut ignore = FxHashSet::default();
        assert!(choose_top_words("DISEASE", &scores, &extracted, &state, &config, &mut ignore).is_empty());
    }

    #[test]
    fn test_bpb() {
        let (mut state, extracted, scores) = selection_fixture();
        let weights: Counter<PatternId> = state
            .interner
            .iter()
            .map(|(id, _)| (id, 1.0))
            .collect();
        let config = Config::default();
        let chosen = choose_bpb_word("DISEASE", &scores, &extracted, &weights, &state, &config);
        // all weights tie; fever was extracted most often
        assert_eq!(chosen.keys().next().unwrap().text(), "fever");

        state.add_seeds("DISEASE", ["fever"]);
        let chosen = choose_bpb_word("DISEASE", &scores, &extracted, &weights, &state, &config);
        assert_eq!(chosen.len(), 1);
        assert_ne!(chosen.keys().next().unwrap().text(), "fever");
    }
}
