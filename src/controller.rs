//! Bootstrap driver
//!
//! `BootstrapController` owns the corpus, the sentence index, the per-token
//! patterns and the run state, and walks them through the phases of every
//! iteration:
//!
//! ```text
//! INIT -> { EXTRACT_PATTERNS -> SCORE_PATTERNS -> APPLY_PATTERNS
//!           -> SCORE_PHRASES -> LABEL_CORPUS } * n -> DONE
//! ```
//!
//! Worker pools only read the corpus. Every write to tokens, patterns or the
//! index happens here, between phases, and the index is brought up to date
//! before the next query.

use crate::config::{Config, ConfigError, PatternScoring, WordScoring};
use crate::conllu;
use crate::counter::{Counter, TwoDimCounter};
use crate::extract::{ContextPatternExtractor, ExtractError, PatternId, PatternInterner, PatternsForEachToken};
use crate::factory::{FactoryWords, PatternFactory, new_factory};
use crate::index::{IndexError, SentenceIndex, new_index};
use crate::labeling::{self, Changes, MatchOptions, label_words, remove_overlapping_labels, unlabel_words};
use crate::matcher::{MatchContext, Program};
use crate::output::{
    self, IterationJustification, OutputError, PatternEvidence, SavedLabel, WordJustification,
};
use crate::pattern::Pattern;
use crate::pattern_parse::{PatternParseError, parse_pattern};
use crate::phrase::CandidatePhrase;
use crate::score_patterns::{
    PhraseScoreSource, ScoreInput, SelectParams, phrase_score_source, score_and_select,
};
use crate::score_phrases::{
    AppliedPatterns, AveragedFeatureScorer, LearnedFeatureScorer, MatchLocation, PhraseScoreError,
    PhraseScoreInput, PhraseScorer, apply_patterns, choose_bpb_word, choose_top_words,
    count_precomputed, ignore_words_all, phrase_scorer_for,
};
use crate::seeds::SeedError;
use crate::state::{BootstrapState, StateError};
use crate::stats::{StatsError, SufficientStats, compute_stats};
use crate::store::{Corpus, SentenceStore, StoreError};
use crate::token::Sentence;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// Factor applied to the pattern threshold when an iteration accepts nothing
const THRESHOLD_DECAY: f64 = 0.8;

pub const LEARNED_WORDS_JSON: &str = "learned_words.json";
pub const MATCHED_TOKENS_JSON: &str = "matched_tokens.json";
pub const PATTERNS_JUSTIFICATION_JSON: &str = "patterns_justification.json";
pub const WORDS_JUSTIFICATION_JSON: &str = "words_justification.json";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Seed(#[from] SeedError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Pattern(#[from] PatternParseError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("Bootstrap error: no patterns were computed for sentence {sent_id}")]
    NoPatternsForSentence { sent_id: String },

    #[error("Bootstrap error: unknown label {0}")]
    UnknownLabel(String),

    #[error("Bootstrap error: bad corpus glob: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Bootstrap error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Bootstrap error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StatsError> for BootstrapError {
    fn from(e: StatsError) -> Self {
        match e {
            StatsError::NoPatternsForSentence { sent_id } => Self::NoPatternsForSentence { sent_id },
        }
    }
}

/// Where the controller is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ExtractPatterns,
    ScorePatterns,
    ApplyPatterns,
    ScorePhrases,
    LabelCorpus,
    Done,
}

/// A run of consecutive tokens carrying one label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Labeled runs of one sentence, ordered by label then position
pub fn sentence_annotations(sent: &Sentence, labels: &[String]) -> Vec<Annotation> {
    let mut out = Vec::new();
    for label in labels {
        let mut start = None;
        for i in 0..=sent.len() {
            let on = i < sent.len() && sent.tokens[i].is_labeled(label);
            match (start, on) {
                (None, true) => start = Some(i),
                (Some(s), false) => {
                    out.push(Annotation {
                        label: label.clone(),
                        start: s,
                        end: i,
                        text: sent.span_text(s, i),
                    });
                    start = None;
                }
                _ => {}
            }
        }
    }
    out
}

/// Refresh token patterns and index entries of changed sentences
fn commit_changes(
    store: &SentenceStore,
    changes: &Changes,
    extractor: &ContextPatternExtractor,
    radius: usize,
    interner: &mut PatternInterner,
    pft: &mut PatternsForEachToken,
    index: &mut dyn SentenceIndex,
) {
    for (sent_id, changed) in changes {
        let Some(sent) = store.get(sent_id) else {
            continue;
        };
        extractor.recompute(sent, changed, radius, interner, pft);
        index.update(&sent.tokens, sent_id);
    }
}

fn phrase_texts(table: &TwoDimCounter<PatternId, CandidatePhrase>, p: &PatternId) -> BTreeSet<String> {
    table
        .row(p)
        .map(|row| row.keys().map(|ph| ph.text().to_string()).collect())
        .unwrap_or_default()
}

fn create_file(path: &Path) -> Result<BufWriter<File>, BootstrapError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

pub struct BootstrapController {
    config: Config,
    state: BootstrapState,
    corpus: Corpus,
    index: Box<dyn SentenceIndex>,
    factory: Box<dyn PatternFactory>,
    pft: PatternsForEachToken,
    pool: rayon::ThreadPool,
    word_ignore: Regex,
    phrase_scorer: Box<dyn PhraseScorer>,
    phase: Phase,
    pattern_justification: BTreeMap<String, Vec<IterationJustification>>,
    word_justification: BTreeMap<String, Vec<WordJustification>>,
    /// label -> phrase -> where the label's patterns matched it
    matched: BTreeMap<String, BTreeMap<String, Vec<MatchLocation>>>,
}

impl BootstrapController {
    /// Controller over an already loaded state and corpus
    pub fn new(config: Config, mut state: BootstrapState, corpus: Corpus) -> Result<Self, BootstrapError> {
        config.validate()?;
        config.validate_labels(state.labels.iter().map(String::as_str))?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()?;
        let word_ignore = config.word_ignore_regex()?;
        let factory = new_factory(
            config.pattern_type,
            config.surface_options(),
            FactoryWords {
                stop_words: state.stop_words.clone(),
                fillers: state.fillers.clone(),
                word_ignore: Some(word_ignore.clone()),
            },
        );
        let index = new_index(
            config.index_backend,
            config.index_dir.as_deref(),
            state.stop_words.clone(),
        )?;
        let phrase_scorer = phrase_scorer_for(config.phrase_scorer);
        state.threshold_select_pattern = config.threshold_select_pattern;

        Ok(Self {
            config,
            state,
            corpus,
            index,
            factory,
            pft: PatternsForEachToken::new(),
            pool,
            word_ignore,
            phrase_scorer,
            phase: Phase::Init,
            pattern_justification: BTreeMap::new(),
            word_justification: BTreeMap::new(),
            matched: BTreeMap::new(),
        })
    }

    /// Read the corpus, seeds and word lists named by `config`
    pub fn from_config(config: Config) -> Result<Self, BootstrapError> {
        config.validate()?;
        let mut paths = Vec::new();
        for pattern in &config.corpus_files {
            paths.extend(conllu::glob_files(pattern)?);
        }
        let batch_dir = if config.batch_process_sents {
            Some(
                config
                    .batch_dir
                    .clone()
                    .unwrap_or_else(|| config.out_dir.join(&config.identifier).join("batches")),
            )
        } else {
            None
        };
        let corpus = Corpus::from_files(&paths, config.corpus_format, batch_dir.as_deref())?;
        info!(
            files = paths.len(),
            batched = corpus.is_batched(),
            "read corpus"
        );
        let state = BootstrapState::from_config(&config)?;
        Self::new(config, state, corpus)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn index(&self) -> &dyn SentenceIndex {
        self.index.as_ref()
    }

    pub fn patterns_for_each_token(&self) -> &PatternsForEachToken {
        &self.pft
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Learned words of `label` with their scores
    pub fn learned_words(&self, label: &str) -> Option<&Counter<CandidatePhrase>> {
        self.state.learned_words.get(label)
    }

    /// Learned patterns of `label`, best first
    pub fn learned_patterns(&self, label: &str) -> Vec<(Pattern, f64)> {
        self.state.learned_pattern_list(label)
    }

    /// Where each label's patterns matched, from the latest application
    pub fn matched_phrases(&self) -> &BTreeMap<String, BTreeMap<String, Vec<MatchLocation>>> {
        &self.matched
    }

    fn check_label(&self, label: &str) -> Result<(), BootstrapError> {
        if self.state.labels.iter().any(|l| l == label) {
            Ok(())
        } else {
            Err(BootstrapError::UnknownLabel(label.to_string()))
        }
    }

    fn match_context(&self) -> MatchContext<'_> {
        MatchContext {
            fillers: Some(&self.state.fillers),
            stop_words: Some(&self.state.stop_words),
            lowercase: self.config.match_lower_case_context,
            num_words_compound: self.config.num_words_compound,
        }
    }

    /// Tokens on each side whose patterns can see a label change
    fn context_radius(&self) -> usize {
        // every window token may be preceded by up to two fillers
        3 * self.config.max_window4_pattern + self.config.num_words_compound
    }

    /// Label seeds, count n-grams, build the index and the token patterns
    pub fn init(&mut self) -> Result<(), BootstrapError> {
        let _span = info_span!("init").entered();
        let labels = self.state.labels.clone();
        let options = MatchOptions::from_config(&self.config);
        let max_len = self
            .state
            .seeds
            .values()
            .flatten()
            .map(CandidatePhrase::num_words)
            .max()
            .unwrap_or(1)
            .max(self.config.num_words_compound);
        let add_processed = self.config.add_processed_text_feature;
        let remove_overlap = self.config.remove_overlapping_labels;

        let loaded = match &self.config.load_patterns_for_each_token_file {
            Some(path) => {
                let (interner, pft) = PatternsForEachToken::load(path)?;
                info!(sentences = pft.len(), patterns = interner.len(), "loaded token patterns");
                self.state.interner = interner;
                self.pft = pft;
                true
            }
            None => false,
        };

        let Self {
            state,
            corpus,
            index,
            factory,
            pft,
            pool,
            ..
        } = self;
        let extractor = ContextPatternExtractor::new(factory.as_ref());
        corpus.for_each_batch_mut(|store| {
            for sent in store.iter_mut() {
                sent.init_labels(labels.iter().map(String::as_str));
            }
            for label in &labels {
                if let Some(seeds) = state.seeds.get(label) {
                    label_words(store, label, seeds, options, pool);
                }
            }
            if remove_overlap {
                for sent in store.iter_mut() {
                    remove_overlapping_labels(sent);
                }
            }
            state.compute_corpus_freq(store, max_len);
            index.add(store, add_processed);
            if !loaded {
                extractor.extract(store, pool, &mut state.interner, pft);
            }
            Ok::<bool, BootstrapError>(true)
        })?;
        self.index.finish_updating()?;

        if let Some(path) = &self.config.save_patterns_for_each_token_file {
            self.pft.save(&self.state.interner, path)?;
        }
        info!(
            sentences = self.index.num_sentences(),
            patterns = self.state.interner.len(),
            "initialized"
        );
        self.phase = Phase::ExtractPatterns;
        Ok(())
    }

    /// Run every iteration
    pub fn run(&mut self) -> Result<(), BootstrapError> {
        self.run_with(|_, _| Ok(()))
    }

    /// Run every iteration, calling `after_iteration` once each commits
    pub fn run_with<F>(&mut self, mut after_iteration: F) -> Result<(), BootstrapError>
    where
        F: FnMut(&Self, usize) -> Result<(), BootstrapError>,
    {
        if self.phase == Phase::Init {
            self.init()?;
        }
        for iteration in self.state.iteration..self.config.num_iterations_for_patterns {
            let _span = info_span!("iteration", n = iteration).entered();
            self.state.iteration = iteration;
            let accepted = self.run_iteration(iteration)?;
            self.state.iteration = iteration + 1;
            after_iteration(self, iteration)?;
            info!(
                accepted,
                learned_words = self.state.total_learned_words(),
                "iteration done"
            );

            if accepted == 0 {
                if self.config.tune_threshold_keep_running {
                    self.state.threshold_select_pattern *= THRESHOLD_DECAY;
                    info!(
                        threshold = self.state.threshold_select_pattern,
                        "no new patterns, lowering threshold"
                    );
                } else {
                    info!("no new patterns, stopping");
                    break;
                }
            }
        }
        self.phase = Phase::Done;
        Ok(())
    }

    /// One iteration over every label; returns the number of accepted patterns
    fn run_iteration(&mut self, iteration: usize) -> Result<usize, BootstrapError> {
        let mut accepted = 0;
        for label in self.state.labels.clone() {
            let _span = info_span!("label", %label).entered();
            accepted += self.iterate_label(&label, iteration)?;
        }
        Ok(accepted)
    }

    fn iterate_label(&mut self, label: &str, iteration: usize) -> Result<usize, BootstrapError> {
        self.phase = Phase::ExtractPatterns;
        let mut stats = self.sufficient_stats(label)?;
        let dropped = stats.enforce_min_support(
            self.config.min_pos_phrase_support_for_pat,
            self.config.min_unlab_phrase_support_for_pat,
        );
        debug!(dropped, "applied minimum support");

        self.phase = Phase::ScorePatterns;
        let phrase_scores = match phrase_score_source(self.config.pattern_scoring) {
            PhraseScoreSource::None => None,
            source => match self.score_unlabeled(label, &stats, source) {
                Ok(scores) => Some(scores),
                Err(PhraseScoreError::Train(e)) => {
                    warn!(label, "Skipping label this iteration: {}", e);
                    return Ok(0);
                }
                Err(PhraseScoreError::Store(e)) => return Err(e.into()),
            },
        };
        let seed_pattern_phrases = if self.config.pattern_scoring == PatternScoring::F1SeedPattern {
            Some(self.seed_pattern_phrases(label)?)
        } else {
            None
        };

        let (scores, selection) = {
            let no_patterns = Counter::new();
            let learned = self.state.learned_patterns.get(label).unwrap_or(&no_patterns);
            let input = ScoreInput {
                label,
                stats: &stats,
                already_chosen: learned,
                phrase_scores: phrase_scores.as_ref(),
                seed_pattern_phrases: seed_pattern_phrases.as_ref(),
            };
            let params = SelectParams {
                threshold: self.state.threshold_select_pattern,
                num_patterns: self.config.num_patterns,
                ignore_patterns: &self.state.ignore_patterns,
            };
            score_and_select(&input, &self.config, &self.state.interner, &params)
        };

        if let Some(learned) = self.state.learned_patterns.get_mut(label) {
            for p in &selection.removed_learned {
                learned.remove(p);
            }
        }
        for p in &selection.removed_learned {
            debug!(pattern = %self.state.interner.pattern(*p), "replaced by a less restrictive pattern");
        }
        for (p, score) in selection.chosen.iter() {
            debug!(pattern = %self.state.interner.pattern(*p), score, "accepted pattern");
        }
        self.state.record_patterns(label, iteration, &selection.chosen);
        if self.config.write_justification() {
            self.justify_patterns(label, iteration, &selection.chosen, &stats);
        }
        info!(
            candidates = scores.len(),
            accepted = selection.chosen.len(),
            "scored patterns"
        );
        let accepted = selection.chosen.len();

        self.phase = Phase::ApplyPatterns;
        let weights = self
            .state
            .learned_patterns
            .get(label)
            .cloned()
            .unwrap_or_default();
        if weights.is_empty() {
            return Ok(accepted);
        }
        let patterns: Vec<PatternId> = weights.keys().copied().collect();
        let applied = self.apply(label, &patterns)?;
        self.matched.insert(label.to_string(), applied.matches.clone());

        self.phase = Phase::ScorePhrases;
        let candidates = applied.candidates();
        let input = PhraseScoreInput {
            label,
            candidates: &candidates,
            extracted: &applied.extracted,
            pattern_weights: &weights,
            state: &self.state,
            config: &self.config,
            corpus: &self.corpus,
        };
        let phrase_scores = match self.phrase_scorer.score(&input) {
            Ok(scores) => scores,
            Err(PhraseScoreError::Train(e)) => {
                warn!(label, "Skipping label this iteration: {}", e);
                return Ok(accepted);
            }
            Err(PhraseScoreError::Store(e)) => return Err(e.into()),
        };

        let words = match self.config.word_scoring {
            WordScoring::WeightedNorm => {
                let mut ignore = ignore_words_all(label, &self.state);
                choose_top_words(
                    label,
                    &phrase_scores,
                    &applied.extracted,
                    &self.state,
                    &self.config,
                    &mut ignore,
                )
            }
            WordScoring::Bpb => choose_bpb_word(
                label,
                &phrase_scores,
                &applied.extracted,
                &weights,
                &self.state,
                &self.config,
            ),
        };
        for (w, score) in words.iter() {
            debug!(word = %w, score, "learned word");
        }
        self.state.record_words(label, iteration, &words);
        if self.config.write_justification() {
            self.justify_words(label, &words, &applied, &stats);
        }
        info!(
            candidates = candidates.len(),
            learned = words.len(),
            "scored phrases"
        );

        self.phase = Phase::LabelCorpus;
        if self.config.use_pattern_result_as_label && !words.is_empty() {
            let phrases: Vec<CandidatePhrase> = words.keys().cloned().collect();
            let changed = self.relabel(label, &phrases)?;
            debug!(tokens = changed, "relabeled corpus");
        }
        Ok(accepted)
    }

    fn sufficient_stats(&self, label: &str) -> Result<SufficientStats, BootstrapError> {
        let mut stats = SufficientStats::default();
        self.corpus.for_each_batch(|store| {
            let batch = compute_stats(
                label,
                store,
                &self.pft,
                &self.state,
                &self.config,
                &self.word_ignore,
                &self.pool,
            )?;
            stats.merge(&batch);
            Ok::<(), BootstrapError>(())
        })?;
        Ok(stats)
    }

    /// Score the unlabeled phrases of `stats` for phrase-aware pattern scorers
    fn score_unlabeled(
        &self,
        label: &str,
        stats: &SufficientStats,
        source: PhraseScoreSource,
    ) -> Result<Counter<CandidatePhrase>, PhraseScoreError> {
        let mut extracted = TwoDimCounter::new();
        let mut weights = Counter::new();
        for p in stats.patterns() {
            weights.set(p, 1.0);
            if let Some(row) = stats.unlab.row(&p) {
                for (phrase, count) in row.iter() {
                    extracted.incr(phrase.clone(), p, count);
                }
            }
        }
        let candidates: Vec<CandidatePhrase> = extracted.keys().cloned().collect();
        let input = PhraseScoreInput {
            label,
            candidates: &candidates,
            extracted: &extracted,
            pattern_weights: &weights,
            state: &self.state,
            config: &self.config,
            corpus: &self.corpus,
        };
        let mut scorer: Box<dyn PhraseScorer> = match source {
            PhraseScoreSource::Learned => Box::new(LearnedFeatureScorer::default()),
            _ => Box::new(AveragedFeatureScorer),
        };
        scorer.score(&input)
    }

    /// Phrases extracted anywhere in the corpus by the label's seed pattern
    fn seed_pattern_phrases(&self, label: &str) -> Result<BTreeSet<CandidatePhrase>, BootstrapError> {
        let mut phrases = BTreeSet::new();
        let Some(pattern) = self.state.seed_patterns.get(label) else {
            return Ok(phrases);
        };
        let program = Program::compile(pattern);
        let ctx = self.match_context();
        self.corpus.for_each_batch(|store| {
            for sent in store.iter() {
                for span in program.find_spans(sent, &ctx) {
                    phrases.insert(self.state.registry.phrase(&sent.span_text(span.start, span.end)));
                }
            }
            Ok::<(), BootstrapError>(())
        })?;
        Ok(phrases)
    }

    /// Apply `patterns` over every batch
    fn apply(&self, label: &str, patterns: &[PatternId]) -> Result<AppliedPatterns, BootstrapError> {
        let mut applied = AppliedPatterns::default();
        self.corpus.for_each_batch(|store| {
            let found = if self.config.do_not_apply_patterns {
                count_precomputed(
                    label,
                    patterns,
                    store,
                    &self.pft,
                    &self.state,
                    &self.config,
                    &self.word_ignore,
                )
            } else {
                apply_patterns(
                    label,
                    patterns,
                    store,
                    self.index.as_ref(),
                    &self.state,
                    &self.config,
                    &self.word_ignore,
                    &self.pool,
                )
            };
            applied.merge(found);
            Ok::<(), BootstrapError>(())
        })?;
        Ok(applied)
    }

    /// Label `phrases` across the corpus and refresh everything around the
    /// changed tokens; returns the number of changed tokens
    fn relabel(&mut self, label: &str, phrases: &[CandidatePhrase]) -> Result<usize, BootstrapError> {
        let options = MatchOptions::from_config(&self.config);
        let radius = self.context_radius();
        let remove_overlap = self.config.remove_overlapping_labels;
        let mut total = 0;

        let Self {
            state,
            corpus,
            index,
            factory,
            pft,
            pool,
            ..
        } = self;
        let extractor = ContextPatternExtractor::new(factory.as_ref());
        corpus.for_each_batch_mut(|store| {
            let mut changes = label_words(store, label, phrases, options, pool);
            if remove_overlap {
                for sent in store.iter_mut() {
                    let removed = remove_overlapping_labels(sent);
                    if !removed.is_empty() {
                        changes.entry(sent.id.clone()).or_default().extend(removed);
                    }
                }
            }
            commit_changes(
                store,
                &changes,
                &extractor,
                radius,
                &mut state.interner,
                pft,
                &mut **index,
            );
            total += changes.values().map(BTreeSet::len).sum::<usize>();
            Ok::<bool, BootstrapError>(!changes.is_empty())
        })?;
        self.index.finish_updating()?;
        Ok(total)
    }

    fn justify_patterns(
        &mut self,
        label: &str,
        iteration: usize,
        chosen: &Counter<PatternId>,
        stats: &SufficientStats,
    ) {
        let patterns = chosen
            .iter()
            .map(|(p, score)| {
                let evidence = PatternEvidence {
                    positive: phrase_texts(&stats.pos, p),
                    negative: phrase_texts(&stats.neg, p),
                    unlabeled: phrase_texts(&stats.unlab, p),
                    score,
                };
                (self.state.interner.pattern(*p).to_string(), evidence)
            })
            .collect();
        self.pattern_justification
            .entry(label.to_string())
            .or_default()
            .push(IterationJustification { iteration, patterns });
    }

    fn justify_words(
        &mut self,
        label: &str,
        words: &Counter<CandidatePhrase>,
        applied: &AppliedPatterns,
        stats: &SufficientStats,
    ) {
        let interner = &self.state.interner;
        let justified = words.iter().map(|(phrase, score)| {
            let patterns: Vec<PatternId> = applied
                .extracted
                .row(phrase)
                .map(|row| row.keys().copied().collect())
                .unwrap_or_default();
            WordJustification {
                entity: phrase.text().to_string(),
                score,
                patterns: patterns.iter().map(|p| interner.pattern(*p).to_string()).collect(),
                reasonwords: patterns.iter().flat_map(|p| phrase_texts(&stats.pos, p)).collect(),
            }
        });
        self.word_justification
            .entry(label.to_string())
            .or_default()
            .extend(justified);
    }

    // ===== Outputs =====

    /// Rewrite the per-label learned words and patterns files
    pub fn write_iteration_outputs(&self) -> Result<(), BootstrapError> {
        for label in &self.state.labels {
            let no_words = Counter::new();
            let words = self.state.learned_words.get(label).unwrap_or(&no_words);
            let patterns: Vec<(String, f64)> = self
                .state
                .learned_pattern_list(label)
                .into_iter()
                .map(|(p, s)| (p.to_string(), s))
                .collect();
            output::write_label_files(&self.config.label_dir(label), words, &patterns)?;
        }
        Ok(())
    }

    /// Write everything the configuration asks for after a run
    pub fn write_outputs(&self) -> Result<(), BootstrapError> {
        self.write_iteration_outputs()?;
        let run_dir = self.config.out_dir.join(&self.config.identifier);
        output::write_learned_words_json(&run_dir.join(LEARNED_WORDS_JSON), &self.state.learned_words)?;

        if self.config.write_justification() {
            for (label, iterations) in &self.pattern_justification {
                output::write_pattern_justification(
                    &self.config.label_dir(label).join(PATTERNS_JUSTIFICATION_JSON),
                    iterations,
                )?;
            }
            for (label, words) in &self.word_justification {
                output::write_word_justification(
                    &self.config.label_dir(label).join(WORDS_JUSTIFICATION_JSON),
                    words,
                )?;
            }
        }

        if let Some(path) = &self.config.column_output_file {
            let mut w = create_file(path)?;
            self.corpus.for_each_batch(|store| {
                output::write_columns(&mut w, store)?;
                Ok::<(), BootstrapError>(())
            })?;
            w.flush()?;
            info!(path = %path.display(), "wrote column output");
        }
        if let Some(path) = &self.config.marked_output_text_file {
            let mut w = create_file(path)?;
            self.corpus.for_each_batch(|store| {
                output::write_marked_text(&mut w, store, &self.state.labels)?;
                Ok::<(), BootstrapError>(())
            })?;
            w.flush()?;
            info!(path = %path.display(), "wrote marked text");
        }
        if self.config.write_matched_tokens_files {
            output::write_matched_tokens(&run_dir.join(MATCHED_TOKENS_JSON), &self.matched)?;
        }
        Ok(())
    }

    // ===== Model persistence =====

    /// Save seeds, patterns and words of every label under `dir`
    pub fn save_model(&self, dir: &Path) -> Result<(), BootstrapError> {
        for label in &self.state.labels {
            let seeds: Vec<String> = self
                .state
                .seeds
                .get(label)
                .map(|s| s.iter().map(|p| p.text().to_string()).collect())
                .unwrap_or_default();
            let patterns_each_iter: BTreeMap<usize, Vec<(String, f64)>> = self
                .state
                .learned_patterns_each_iter
                .get(label)
                .map(|history| {
                    history
                        .iter()
                        .map(|(i, pats)| {
                            let pats: Vec<(String, f64)> = pats
                                .iter()
                                .map(|(p, s)| (self.state.interner.pattern(*p).to_string(), s))
                                .collect();
                            (*i, pats)
                        })
                        .collect()
                })
                .unwrap_or_default();
            let phrases_each_iter: BTreeMap<usize, Vec<(String, f64)>> = self
                .state
                .learned_words_each_iter
                .get(label)
                .map(|history| {
                    history
                        .iter()
                        .map(|(i, words)| {
                            (*i, words.iter().map(|(w, s)| (w.text().to_string(), s)).collect::<Vec<_>>())
                        })
                        .collect()
                })
                .unwrap_or_default();
            let saved = SavedLabel {
                seeds,
                patterns_each_iter,
                phrases_each_iter,
            };
            output::save_label_model(dir, label, &saved)?;
        }
        info!(dir = %dir.display(), "saved model");
        Ok(())
    }

    /// Restore a saved model, relabel the corpus with its words and apply
    /// its patterns
    pub fn load_model(&mut self, dir: &Path) -> Result<(), BootstrapError> {
        if self.phase == Phase::Init {
            self.init()?;
        }
        let max_iterations = self.config.num_iterations_of_saved_patterns_to_load;
        let labels = self.state.labels.clone();
        for label in &labels {
            let saved = output::load_label_model(dir, label, max_iterations)?;
            self.state.add_seeds(label, saved.seeds.iter().map(String::as_str));
            for (iteration, pats) in &saved.patterns_each_iter {
                let mut counter = Counter::new();
                for (text, score) in pats {
                    let id = self.state.interner.intern(parse_pattern(text)?);
                    counter.set(id, *score);
                }
                self.state.record_patterns(label, *iteration, &counter);
            }
            for (iteration, words) in &saved.phrases_each_iter {
                let counter: Counter<CandidatePhrase> = words
                    .iter()
                    .map(|(w, s)| (self.state.registry.phrase(w), *s))
                    .collect();
                self.state.record_words(label, *iteration, &counter);
            }
            debug!(
                label = label.as_str(),
                iterations = saved.patterns_each_iter.len(),
                "loaded label model"
            );
        }
        self.state.refresh_seed_statistics();

        for label in &labels {
            let mut phrases: Vec<CandidatePhrase> = self.state.identified_words(label).cloned().collect();
            let patterns: Vec<PatternId> = self
                .state
                .learned_patterns
                .get(label)
                .map(|c| c.keys().copied().collect())
                .unwrap_or_default();
            if !patterns.is_empty() {
                let applied = self.apply(label, &patterns)?;
                phrases.extend(applied.candidates());
                self.matched.insert(label.clone(), applied.matches);
            }
            let changed = self.relabel(label, &phrases)?;
            info!(label = label.as_str(), tokens = changed, "labeled corpus from model");
        }
        self.phase = Phase::Done;
        Ok(())
    }

    // ===== Runtime annotation =====

    /// Add seeds to `label` and label their occurrences; returns the number
    /// of changed tokens
    pub fn add_seed_words(&mut self, label: &str, phrases: &[&str]) -> Result<usize, BootstrapError> {
        self.check_label(label)?;
        self.state.add_seeds(label, phrases.iter().copied());
        self.state.refresh_seed_statistics();
        let phrases: Vec<CandidatePhrase> = phrases
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| self.state.registry.phrase(t))
            .collect();
        self.relabel(label, &phrases)
    }

    /// Forget `phrases` for `label` and unlabel tokens left with no match
    pub fn remove_phrases(&mut self, label: &str, phrases: &[&str]) -> Result<usize, BootstrapError> {
        self.check_label(label)?;
        self.state.remove_phrases(label, phrases.iter().copied());
        let radius = self.context_radius();
        let mut total = 0;

        let Self {
            state,
            corpus,
            index,
            factory,
            pft,
            ..
        } = self;
        let extractor = ContextPatternExtractor::new(factory.as_ref());
        corpus.for_each_batch_mut(|store| {
            let changes = unlabel_words(store, label, phrases.iter().copied());
            commit_changes(
                store,
                &changes,
                &extractor,
                radius,
                &mut state.interner,
                pft,
                &mut **index,
            );
            total += changes.values().map(BTreeSet::len).sum::<usize>();
            Ok::<bool, BootstrapError>(!changes.is_empty())
        })?;
        self.index.finish_updating()?;
        Ok(total)
    }

    /// Set or clear `label` on tokens of one sentence
    ///
    /// Returns false if the sentence does not exist.
    pub fn annotate_tokens(
        &mut self,
        sent_id: &str,
        token_ids: &[usize],
        label: &str,
        remove: bool,
    ) -> Result<bool, BootstrapError> {
        self.check_label(label)?;
        let radius = self.context_radius();
        let mut found = false;

        let Self {
            state,
            corpus,
            index,
            factory,
            pft,
            ..
        } = self;
        let extractor = ContextPatternExtractor::new(factory.as_ref());
        corpus.for_each_batch_mut(|store| {
            let Some(sent) = store.get_mut(sent_id) else {
                return Ok::<bool, BootstrapError>(false);
            };
            found = true;
            let changed = labeling::annotate_tokens(sent, token_ids, label, remove);
            if changed.is_empty() {
                return Ok(false);
            }
            extractor.recompute(sent, &changed, radius, &mut state.interner, pft);
            index.update(&sent.tokens, sent_id);
            Ok(true)
        })?;
        self.index.finish_updating()?;
        Ok(found)
    }

    /// Every place a token run matched `phrase`, per label
    pub fn matched_tokens_by_phrase(&self, phrase: &str) -> Result<BTreeMap<String, Vec<MatchLocation>>, BootstrapError> {
        let width = phrase.split_whitespace().count().max(1);
        let mut out: BTreeMap<String, Vec<MatchLocation>> = BTreeMap::new();
        self.corpus.for_each_batch(|store| {
            for sent in store.iter() {
                for label in &self.state.labels {
                    let mut i = 0;
                    while i < sent.len() {
                        let hit = |j: usize| {
                            sent.tokens[j]
                                .matched
                                .get(label)
                                .is_some_and(|m| m.all.iter().any(|p| p == phrase))
                        };
                        if !hit(i) {
                            i += 1;
                            continue;
                        }
                        let mut end = i + 1;
                        while end < sent.len() && end - i < width && hit(end) {
                            end += 1;
                        }
                        out.entry(label.clone())
                            .or_default()
                            .push((sent.id.clone(), i, end));
                        i = end;
                    }
                }
            }
            Ok::<(), BootstrapError>(())
        })?;
        Ok(out)
    }

    /// Labeled runs of every sentence with at least one
    pub fn all_annotations(&self) -> Result<BTreeMap<String, Vec<Annotation>>, BootstrapError> {
        let mut out = BTreeMap::new();
        self.corpus.for_each_batch(|store| {
            for sent in store.iter() {
                let annotations = sentence_annotations(sent, &self.state.labels);
                if !annotations.is_empty() {
                    out.insert(sent.id.clone(), annotations);
                }
            }
            Ok::<(), BootstrapError>(())
        })?;
        Ok(out)
    }

    /// Labeled runs of one sentence, `None` if it does not exist
    pub fn annotations_by_sentence(&self, sent_id: &str) -> Result<Option<Vec<Annotation>>, BootstrapError> {
        let mut out = None;
        self.corpus.for_each_batch(|store| {
            if let Some(sent) = store.get(sent_id) {
                out = Some(sentence_annotations(sent, &self.state.labels));
            }
            Ok::<(), BootstrapError>(())
        })?;
        Ok(out)
    }

    /// One line per label with seed, word and pattern counts
    pub fn summary(&self) -> String {
        let mut out = format!(
            "iterations: {}, pattern threshold: {}\n",
            self.state.iteration, self.state.threshold_select_pattern
        );
        for label in &self.state.labels {
            out.push_str(&format!(
                "{}: {} seeds, {} learned words, {} learned patterns\n",
                label,
                self.state.seeds.get(label).map_or(0, BTreeSet::len),
                self.state.learned_words.get(label).map_or(0, Counter::len),
                self.state.learned_patterns.get(label).map_or(0, Counter::len),
            ));
        }
        out
    }
}
