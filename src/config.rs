//! Run configuration
//!
//! A run is configured from one TOML file. Every option has a default, and
//! unknown keys are rejected so a misspelled option fails at load time
//! rather than being silently ignored.

use crate::conllu::CorpusFormat;
use crate::factory::SurfaceOptions;
use crate::index::IndexBackend;
use crate::pattern::PatternType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Config error: bad regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Config error: {0}")]
    Invalid(String),
}

/// Pattern scoring formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PatternScoring {
    RlogF,
    RlogFPosNeg,
    RlogFUnlabNeg,
    RlogFNeg,
    YanGarber02,
    LinICML03,
    PosNegOdds,
    #[default]
    PosNegUnlabOdds,
    RatioAll,
    SqrtAllRatio,
    PhEvalInPat,
    PhEvalInPatLogP,
    Logreg,
    LogregLogP,
    F1SeedPattern,
}

/// How learned words are picked from scored candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WordScoring {
    #[default]
    WeightedNorm,
    Bpb,
}

/// Phrase scoring strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhraseScorerKind {
    #[default]
    AverageFeatures,
    LearnFeatWt,
}

/// Normalization of corpus frequency in the pattern-weight feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreqNormalization {
    #[default]
    None,
    Sqrt,
    Log,
}

impl FreqNormalization {
    pub fn apply(self, freq: f64) -> f64 {
        match self {
            FreqNormalization::None => freq,
            FreqNormalization::Sqrt => freq.sqrt(),
            FreqNormalization::Log => 1.0 + freq.max(1.0).ln(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // ----- input -----
    /// Glob patterns of corpus files
    pub corpus_files: Vec<String>,
    pub corpus_format: CorpusFormat,
    /// `label,file[,file];label,file` manifest
    pub seed_words_files: String,
    /// Keep the corpus on disk, one batch per input file
    pub batch_process_sents: bool,
    pub batch_dir: Option<PathBuf>,

    // ----- output -----
    pub out_dir: PathBuf,
    pub identifier: String,
    /// 0 is silent; justification JSON is written from 3 up
    pub debug: u8,
    pub justify: bool,
    pub column_output_file: Option<PathBuf>,
    pub marked_output_text_file: Option<PathBuf>,
    pub write_matched_tokens_files: bool,
    pub save_model_dir: Option<PathBuf>,
    pub load_model_dir: Option<PathBuf>,
    pub num_iterations_of_saved_patterns_to_load: usize,

    // ----- index and pattern cache -----
    pub index_backend: IndexBackend,
    pub index_dir: Option<PathBuf>,
    pub add_processed_text_feature: bool,
    pub save_patterns_for_each_token_file: Option<PathBuf>,
    pub load_patterns_for_each_token_file: Option<PathBuf>,

    // ----- bootstrap loop -----
    pub pattern_type: PatternType,
    pub num_threads: usize,
    pub num_iterations_for_patterns: usize,
    pub num_patterns: usize,
    pub pattern_scoring: PatternScoring,
    pub threshold_select_pattern: f64,
    pub tune_threshold_keep_running: bool,
    pub sqrt_pat_score: bool,
    pub min_pos_phrase_support_for_pat: usize,
    pub min_unlab_phrase_support_for_pat: usize,
    pub sample_sentences_for_sufficient_stats: f64,
    pub num_words_to_add: usize,
    pub threshold_word_extract: f64,
    pub threshold_num_patterns_applied: usize,
    pub max_extract_num_words: usize,
    pub word_scoring: WordScoring,
    pub phrase_scorer: PhraseScorerKind,
    pub use_other_labels_words_as_negative: bool,
    pub use_pattern_result_as_label: bool,
    pub remove_overlapping_labels: bool,
    pub do_not_apply_patterns: bool,
    pub do_not_extract_phrase_any_word_labeled_other_class: bool,
    pub remove_stop_words_from_selected_phrases: bool,
    pub remove_phrases_with_stop_words: bool,
    pub random_seed: u64,

    // ----- seed labeling and matching -----
    pub fuzzy_match: bool,
    pub ignore_case_seed_match: bool,
    pub min_len4_fuzzy_for_pattern: usize,
    pub match_lower_case_context: bool,
    pub use_matching_phrase: bool,
    /// Fully anchored; matching words are never targets
    pub word_ignore_regex: String,

    // ----- surface factory -----
    pub use_pos4_pattern: bool,
    pub use_coarse_pos: bool,
    pub add_pat_without_pos: bool,
    pub min_window4_pattern: usize,
    pub max_window4_pattern: usize,
    pub use_previous_context: bool,
    pub use_next_context: bool,
    pub num_min_stop_words_to_add: usize,
    pub use_filler_words_in_pat: bool,
    pub use_stop_words_before_term: bool,
    pub num_words_compound: usize,
    pub use_target_ner_restriction: bool,
    pub use_context_ner_restriction: bool,
    pub use_target_parser_parent_restriction: bool,
    pub use_lemma_context_tokens: bool,

    // ----- word lists and external statistics -----
    pub stop_words_files: Vec<PathBuf>,
    pub english_words_files: Vec<PathBuf>,
    pub common_words_files: Vec<PathBuf>,
    pub other_semantic_classes_files: Vec<PathBuf>,
    pub function_words: Vec<String>,
    pub filler_words: Vec<String>,
    /// `label,file;...` manifest of words never to learn
    pub ignore_words_files: Option<String>,
    pub ignore_patterns_file: Option<PathBuf>,
    pub word_class_clusters_file: Option<PathBuf>,
    /// `label,file;...` manifest of `Cluster-N:weight` files
    pub dist_sim_weights_files: Option<String>,
    pub domain_ngrams_file: Option<PathBuf>,
    pub google_ngrams_file: Option<PathBuf>,
    /// label -> POS prefixes a target token must start with
    pub allowed_tags_initials: BTreeMap<String, Vec<String>>,
    pub allowed_ners_for_labels: BTreeMap<String, Vec<String>>,
    /// label -> pattern string, required by `F1SeedPattern`
    pub seed_patterns: BTreeMap<String, String>,

    // ----- phrase scoring -----
    pub use_phrase_eval_pat_wt_by_freq: bool,
    pub use_phrase_eval_domain_ngram: bool,
    pub use_phrase_eval_google_ngram: bool,
    pub use_phrase_eval_word_class: bool,
    pub use_phrase_eval_edit_dist_same: bool,
    pub use_phrase_eval_edit_dist_other: bool,
    pub use_phrase_eval_word_shape: bool,
    pub use_phrase_eval_sem_odds: bool,
    pub freq_normalization: FreqNormalization,
    pub lr_sigma: f64,
    pub per_select_rand: f64,
    pub per_select_neg: f64,
    pub subsample_unk_as_neg_using_sim: bool,
    pub positive_similarity_threshold_low_precision: f64,

    // ----- evaluation -----
    pub evaluate: bool,
    /// `label,file;...` manifest of `phrase\t1|0` files
    pub gold_entities_files: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            corpus_files: Vec::new(),
            corpus_format: CorpusFormat::default(),
            seed_words_files: String::new(),
            batch_process_sents: false,
            batch_dir: None,

            out_dir: PathBuf::from("patterns_out"),
            identifier: "seedpat".to_string(),
            debug: 1,
            justify: false,
            column_output_file: None,
            marked_output_text_file: None,
            write_matched_tokens_files: false,
            save_model_dir: None,
            load_model_dir: None,
            num_iterations_of_saved_patterns_to_load: usize::MAX,

            index_backend: IndexBackend::default(),
            index_dir: None,
            add_processed_text_feature: false,
            save_patterns_for_each_token_file: None,
            load_patterns_for_each_token_file: None,

            pattern_type: PatternType::default(),
            num_threads: 1,
            num_iterations_for_patterns: 10,
            num_patterns: 10,
            pattern_scoring: PatternScoring::default(),
            threshold_select_pattern: 1.0,
            tune_threshold_keep_running: false,
            sqrt_pat_score: false,
            min_pos_phrase_support_for_pat: 1,
            min_unlab_phrase_support_for_pat: 0,
            sample_sentences_for_sufficient_stats: 1.0,
            num_words_to_add: 10,
            threshold_word_extract: 0.2,
            threshold_num_patterns_applied: 2,
            max_extract_num_words: usize::MAX,
            word_scoring: WordScoring::default(),
            phrase_scorer: PhraseScorerKind::default(),
            use_other_labels_words_as_negative: true,
            use_pattern_result_as_label: true,
            remove_overlapping_labels: false,
            do_not_apply_patterns: false,
            do_not_extract_phrase_any_word_labeled_other_class: true,
            remove_stop_words_from_selected_phrases: false,
            remove_phrases_with_stop_words: false,
            random_seed: 10,

            fuzzy_match: false,
            ignore_case_seed_match: true,
            min_len4_fuzzy_for_pattern: 6,
            match_lower_case_context: true,
            use_matching_phrase: true,
            word_ignore_regex: "[^a-zA-Z]*".to_string(),

            use_pos4_pattern: true,
            use_coarse_pos: true,
            add_pat_without_pos: true,
            min_window4_pattern: 2,
            max_window4_pattern: 4,
            use_previous_context: true,
            use_next_context: false,
            num_min_stop_words_to_add: 3,
            use_filler_words_in_pat: true,
            use_stop_words_before_term: false,
            num_words_compound: 2,
            use_target_ner_restriction: false,
            use_context_ner_restriction: false,
            use_target_parser_parent_restriction: false,
            use_lemma_context_tokens: true,

            stop_words_files: Vec::new(),
            english_words_files: Vec::new(),
            common_words_files: Vec::new(),
            other_semantic_classes_files: Vec::new(),
            function_words: Vec::new(),
            filler_words: ["a", "an", "the", "`", "``", "'", "''"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_words_files: None,
            ignore_patterns_file: None,
            word_class_clusters_file: None,
            dist_sim_weights_files: None,
            domain_ngrams_file: None,
            google_ngrams_file: None,
            allowed_tags_initials: BTreeMap::new(),
            allowed_ners_for_labels: BTreeMap::new(),
            seed_patterns: BTreeMap::new(),

            use_phrase_eval_pat_wt_by_freq: true,
            use_phrase_eval_domain_ngram: false,
            use_phrase_eval_google_ngram: false,
            use_phrase_eval_word_class: false,
            use_phrase_eval_edit_dist_same: false,
            use_phrase_eval_edit_dist_other: false,
            use_phrase_eval_word_shape: false,
            use_phrase_eval_sem_odds: false,
            freq_normalization: FreqNormalization::default(),
            lr_sigma: 1.0,
            per_select_rand: 0.01,
            per_select_neg: 1.0,
            subsample_unk_as_neg_using_sim: false,
            positive_similarity_threshold_low_precision: 0.7,

            evaluate: false,
            gold_entities_files: None,
        }
    }
}

impl Config {
    /// Parse and validate a TOML configuration
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject option combinations that cannot run together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.num_threads == 0 {
            return invalid("num_threads must be at least 1");
        }
        if self.min_window4_pattern > self.max_window4_pattern {
            return invalid("min_window4_pattern exceeds max_window4_pattern");
        }
        if self.write_matched_tokens_files && self.batch_process_sents {
            return invalid("write_matched_tokens_files cannot be used with batch_process_sents");
        }
        if self.do_not_apply_patterns
            && (self.use_stop_words_before_term || self.num_words_compound > 1)
        {
            return invalid(
                "do_not_apply_patterns needs use_stop_words_before_term = false and num_words_compound = 1",
            );
        }
        if !(0.0..=1.0).contains(&self.sample_sentences_for_sufficient_stats) {
            return invalid("sample_sentences_for_sufficient_stats must be within 0..=1");
        }
        if self.batch_process_sents && self.batch_dir.is_none() {
            return invalid("batch_process_sents needs batch_dir");
        }
        self.word_ignore_regex()?;
        Ok(())
    }

    /// `F1SeedPattern` needs a seed pattern for every label
    pub fn validate_labels<'a>(
        &self,
        labels: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ConfigError> {
        if self.pattern_scoring != PatternScoring::F1SeedPattern {
            return Ok(());
        }
        for label in labels {
            if !self.seed_patterns.contains_key(label) {
                return Err(ConfigError::Invalid(format!(
                    "F1SeedPattern scoring needs a seed pattern for label {}",
                    label
                )));
            }
        }
        Ok(())
    }

    /// Compiled, fully anchored ignore regex
    pub fn word_ignore_regex(&self) -> Result<Regex, ConfigError> {
        Ok(Regex::new(&format!("^(?:{})$", self.word_ignore_regex))?)
    }

    pub fn surface_options(&self) -> SurfaceOptions {
        SurfaceOptions {
            min_window: self.min_window4_pattern,
            max_window: self.max_window4_pattern,
            use_previous_context: self.use_previous_context,
            use_next_context: self.use_next_context,
            num_min_stop_words_to_add: self.num_min_stop_words_to_add,
            use_filler_words: self.use_filler_words_in_pat,
            use_stop_words_before_term: self.use_stop_words_before_term,
            use_pos: self.use_pos4_pattern,
            use_coarse_pos: self.use_coarse_pos,
            add_without_pos: self.add_pat_without_pos,
            use_target_ner_restriction: self.use_target_ner_restriction,
            use_context_ner_restriction: self.use_context_ner_restriction,
            use_target_parent_restriction: self.use_target_parser_parent_restriction,
            use_lemma_context_tokens: self.use_lemma_context_tokens,
            num_words_compound: self.num_words_compound,
        }
    }

    /// Output directory for one label
    pub fn label_dir(&self, label: &str) -> PathBuf {
        self.out_dir.join(&self.identifier).join(label)
    }

    pub fn write_justification(&self) -> bool {
        self.justify || self.debug >= 3
    }
}
