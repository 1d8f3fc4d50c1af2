//! Pattern scoring and selection
//!
//! Every scorer maps the sufficient statistics of one label to a score per
//! pattern, higher is better. Counts are numbers of distinct phrases. The
//! selection loop then walks the ranking and keeps the best patterns that
//! are not redundant with each other or with patterns learned earlier.

use crate::config::{Config, PatternScoring};
use crate::counter::Counter;
use crate::extract::{PatternId, PatternInterner};
use crate::pattern::Pattern;
use crate::phrase::CandidatePhrase;
use crate::stats::{Polarity, SufficientStats};
use std::collections::BTreeSet;
use tracing::debug;

/// Everything a pattern scorer may look at
pub struct ScoreInput<'a> {
    pub label: &'a str,
    pub stats: &'a SufficientStats,
    /// Patterns learned in earlier iterations
    pub already_chosen: &'a Counter<PatternId>,
    /// Scores of unlabeled phrases, for scorers that weigh phrase quality
    pub phrase_scores: Option<&'a Counter<CandidatePhrase>>,
    /// Phrases extracted by the label's seed pattern
    pub seed_pattern_phrases: Option<&'a BTreeSet<CandidatePhrase>>,
}

/// Ranks candidate patterns for one label
pub trait PatternScorer: Send + Sync {
    fn score(&self, input: &ScoreInput) -> Counter<PatternId>;
}

/// Phrase scores a pattern scorer needs before it can run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseScoreSource {
    None,
    /// Averaged phrase features
    Averaged,
    /// Logistic-regression combiner
    Learned,
}

pub fn phrase_score_source(kind: PatternScoring) -> PhraseScoreSource {
    match kind {
        PatternScoring::PhEvalInPat | PatternScoring::PhEvalInPatLogP => PhraseScoreSource::Averaged,
        PatternScoring::Logreg | PatternScoring::LogregLogP => PhraseScoreSource::Learned,
        _ => PhraseScoreSource::None,
    }
}

/// Build the scorer for `kind`
pub fn scorer_for(kind: PatternScoring) -> Box<dyn PatternScorer> {
    match kind {
        PatternScoring::PhEvalInPat | PatternScoring::Logreg => {
            Box::new(PhraseEvalScorer { log_p: false })
        }
        PatternScoring::PhEvalInPatLogP | PatternScoring::LogregLogP => {
            Box::new(PhraseEvalScorer { log_p: true })
        }
        PatternScoring::F1SeedPattern => Box::new(F1SeedScorer { beta: 1.0 }),
        other => Box::new(CountScorer { formula: other }),
    }
}

/// Smoothing constant of the log-odds family
const EPSILON: f64 = 1.0;

/// Score from distinct positive, negative and unlabeled counts
pub fn count_score(formula: PatternScoring, pos: f64, neg: f64, unlab: f64) -> f64 {
    let all = pos + neg + unlab;
    match formula {
        PatternScoring::RlogF => ((pos + EPSILON) / (all + EPSILON)).ln(),
        PatternScoring::RlogFPosNeg => ((pos + EPSILON) / (pos + neg + EPSILON)).ln(),
        PatternScoring::RlogFUnlabNeg => ((pos + EPSILON) / (neg + unlab + EPSILON)).ln(),
        PatternScoring::RlogFNeg => ((pos + EPSILON) / (neg + EPSILON)).ln(),
        PatternScoring::YanGarber02 => {
            if pos <= 0.0 {
                0.0
            } else {
                (pos / all) * pos.ln()
            }
        }
        PatternScoring::LinICML03 => {
            if pos <= 0.0 {
                0.0
            } else {
                ((pos - neg) / all) * pos.ln()
            }
        }
        PatternScoring::PosNegOdds => pos / neg.max(1.0),
        PatternScoring::RatioAll => {
            if all > 0.0 {
                pos / all
            } else {
                0.0
            }
        }
        PatternScoring::SqrtAllRatio => {
            if all > 0.0 {
                pos / all.sqrt()
            } else {
                0.0
            }
        }
        _ => pos / (neg + unlab).max(1.0),
    }
}

/// Formula over the three distinct-phrase counts
#[derive(Debug, Clone, Copy)]
pub struct CountScorer {
    pub formula: PatternScoring,
}

impl PatternScorer for CountScorer {
    fn score(&self, input: &ScoreInput) -> Counter<PatternId> {
        let stats = input.stats;
        stats
            .patterns()
            .into_iter()
            .map(|p| {
                let pos = stats.distinct(p, Polarity::Positive) as f64;
                let neg = stats.distinct(p, Polarity::Negative) as f64;
                let unlab = stats.distinct(p, Polarity::Unlabeled) as f64;
                (p, count_score(self.formula, pos, neg, unlab))
            })
            .collect()
    }
}

/// Sum of phrase scores over the phrases a pattern extracts
///
/// Positive phrases count as 1; unlabeled phrases count with their phrase
/// score, zero when unscored. Each phrase is weighted by its occurrence
/// count under the pattern.
#[derive(Debug, Clone, Copy)]
pub struct PhraseEvalScorer {
    pub log_p: bool,
}

impl PatternScorer for PhraseEvalScorer {
    fn score(&self, input: &ScoreInput) -> Counter<PatternId> {
        let stats = input.stats;
        let mut scores = Counter::new();
        for p in stats.patterns() {
            let mut total = 0.0;
            if let Some(row) = stats.pos.row(&p) {
                total += row.total();
            }
            if let Some(row) = stats.unlab.row(&p) {
                for (phrase, count) in row.iter() {
                    let ph = input.phrase_scores.map_or(0.0, |s| s.get(phrase));
                    total += ph * count;
                }
            }
            let score = if self.log_p { (1.0 + total).ln() } else { total };
            scores.set(p, score);
        }
        scores
    }
}

/// F-measure of a pattern's phrases against the label's seed pattern
#[derive(Debug, Clone, Copy)]
pub struct F1SeedScorer {
    pub beta: f64,
}

impl PatternScorer for F1SeedScorer {
    fn score(&self, input: &ScoreInput) -> Counter<PatternId> {
        let stats = input.stats;
        let empty = BTreeSet::new();
        let reference = input.seed_pattern_phrases.unwrap_or(&empty);
        let b2 = self.beta * self.beta;

        let mut scores = Counter::new();
        for p in stats.patterns() {
            let extracted: BTreeSet<&CandidatePhrase> = [&stats.pos, &stats.neg, &stats.unlab]
                .iter()
                .filter_map(|t| t.row(&p))
                .flat_map(|row| row.keys())
                .collect();
            let common = extracted.iter().filter(|ph| reference.contains(**ph)).count() as f64;
            let score = if common == 0.0 {
                0.0
            } else {
                let precision = common / extracted.len() as f64;
                let recall = common / reference.len() as f64;
                (1.0 + b2) * precision * recall / (b2 * precision + recall)
            };
            scores.set(p, score);
        }
        scores
    }
}

/// Outcome of one label's pattern selection
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub chosen: Counter<PatternId>,
    /// Earlier patterns replaced by a less restrictive equivalent
    pub removed_learned: Vec<PatternId>,
}

/// Parameters of the selection loop
#[derive(Debug, Clone)]
pub struct SelectParams<'a> {
    pub threshold: f64,
    pub num_patterns: usize,
    pub ignore_patterns: &'a [Pattern],
}

/// Walk the ranking and keep the best non-redundant patterns
///
/// A candidate is skipped when a pattern already kept (this iteration or
/// earlier) subsumes it. When the candidate has the same context as an
/// earlier pattern but fewer target restrictions, the earlier one is
/// replaced. A candidate subsuming a pattern kept this iteration replaces it.
pub fn select_patterns(
    scores: &Counter<PatternId>,
    stats: &SufficientStats,
    learned: &Counter<PatternId>,
    interner: &PatternInterner,
    params: &SelectParams,
) -> Selection {
    let mut selection = Selection::default();

    for (c, score) in scores.sorted_desc() {
        if selection.chosen.len() >= params.num_patterns {
            break;
        }
        if score < params.threshold || score.is_nan() {
            break;
        }
        let cand = interner.pattern(c);
        if learned.contains(&c) || params.ignore_patterns.contains(cand) {
            continue;
        }
        if stats.distinct(c, Polarity::Unlabeled) == 0 {
            continue;
        }

        let mut skip = false;
        let mut replaced = Vec::new();
        for p in learned.keys() {
            if selection.removed_learned.contains(p) {
                continue;
            }
            let prior = interner.pattern(*p);
            if !prior.same_genre(cand) {
                continue;
            }
            if prior.subsumes(cand) {
                skip = true;
                break;
            }
            match cand.equal_context(prior) {
                i32::MAX => continue,
                eq if eq < 0 => replaced.push(*p),
                _ => {
                    skip = true;
                    break;
                }
            }
        }
        if skip {
            continue;
        }

        let mut drop_chosen = Vec::new();
        for p in selection.chosen.keys() {
            let kept = interner.pattern(*p);
            if !kept.same_genre(cand) {
                continue;
            }
            if kept.subsumes(cand) {
                skip = true;
                break;
            }
            if cand.subsumes(kept) {
                let eq = cand.equal_context(kept);
                if eq == i32::MAX || eq < 0 {
                    drop_chosen.push(*p);
                } else {
                    skip = true;
                    break;
                }
            }
        }
        if skip {
            continue;
        }

        for p in &drop_chosen {
            selection.chosen.remove(p);
        }
        selection.removed_learned.extend(replaced);
        selection.chosen.set(c, score);
    }

    debug!(
        chosen = selection.chosen.len(),
        replaced = selection.removed_learned.len(),
        "selected patterns"
    );
    selection
}

/// Score and select patterns for one label
///
/// The statistics in `input` are expected to have had the minimum-support
/// prefilter applied already.
pub fn score_and_select(
    input: &ScoreInput,
    config: &Config,
    interner: &PatternInterner,
    params: &SelectParams,
) -> (Counter<PatternId>, Selection) {
    let mut scores = scorer_for(config.pattern_scoring).score(input);
    if config.sqrt_pat_score {
        for p in scores.keys().copied().collect::<Vec<_>>() {
            let s = scores.get(&p);
            if s > 0.0 {
                scores.set(p, s.sqrt());
            }
        }
    }
    let selection = select_patterns(&scores, input.stats, input.already_chosen, interner, params);
    (scores, selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern_parse::parse_pattern;
    use crate::phrase::PhraseRegistry;

    struct Fixture {
        interner: PatternInterner,
        stats: SufficientStats,
        registry: PhraseRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                interner: PatternInterner::new(),
                stats: SufficientStats::default(),
                registry: PhraseRegistry::new(),
            }
        }

        fn pattern(&mut self, text: &str) -> PatternId {
            self.interner.intern(parse_pattern(text).unwrap())
        }

        fn support(&mut self, p: PatternId, phrases: &[&str], pol: Polarity) {
            for ph in phrases {
                let phrase = self.registry.phrase(ph);
                self.stats.add(p, phrase, pol);
            }
        }
    }

    fn input<'a>(stats: &'a SufficientStats, learned: &'a Counter<PatternId>) -> ScoreInput<'a> {
        ScoreInput {
            label: "DISEASE",
            stats,
            already_chosen: learned,
            phrase_scores: None,
            seed_pattern_phrases: None,
        }
    }

    // ===== Formula Tests =====

    #[test]
    fn test_count_scores() {
        use PatternScoring::*;
        assert_eq!(count_score(PosNegUnlabOdds, 2.0, 1.0, 1.0), 1.0);
        assert_eq!(count_score(PosNegUnlabOdds, 2.0, 0.0, 0.0), 2.0);
        assert_eq!(count_score(PosNegOdds, 3.0, 0.0, 5.0), 3.0);
        assert_eq!(count_score(RatioAll, 1.0, 1.0, 2.0), 0.25);
        assert_eq!(count_score(SqrtAllRatio, 2.0, 2.0, 0.0), 1.0);
        assert_eq!(count_score(RlogF, 1.0, 0.0, 0.0), 0.0);
        assert!((count_score(RlogF, 1.0, 1.0, 2.0) - (2.0f64 / 5.0).ln()).abs() < 1e-12);
        assert_eq!(count_score(YanGarber02, 0.0, 3.0, 3.0), 0.0);
    }

    #[test]
    fn test_rlogf_monotone_in_positives() {
        for kind in [
            PatternScoring::RlogF,
            PatternScoring::RlogFPosNeg,
            PatternScoring::RlogFUnlabNeg,
            PatternScoring::RlogFNeg,
        ] {
            let mut last = f64::NEG_INFINITY;
            for pos in 0..20 {
                let s = count_score(kind, pos as f64, 3.0, 4.0);
                assert!(s >= last, "{:?}", kind);
                last = s;
            }
        }
    }

    #[test]
    fn test_phrase_eval_scorer() {
        let mut f = Fixture::new();
        let p = f.pattern(r#"[l:"with"] {TARGET}"#);
        f.support(p, &["flu", "flu"], Polarity::Positive);
        f.support(p, &["pneumonia", "table"], Polarity::Unlabeled);
        let mut phrase_scores = Counter::new();
        phrase_scores.set(f.registry.phrase("pneumonia"), 0.5);

        let learned = Counter::new();
        let mut inp = input(&f.stats, &learned);
        inp.phrase_scores = Some(&phrase_scores);
        let scores = PhraseEvalScorer { log_p: false }.score(&inp);
        assert_eq!(scores.get(&p), 2.5);
        let logp = PhraseEvalScorer { log_p: true }.score(&inp);
        assert!((logp.get(&p) - 3.5f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_f1_seed_scorer() {
        let mut f = Fixture::new();
        let p = f.pattern(r#"[l:"with"] {TARGET}"#);
        f.support(p, &["flu"], Polarity::Positive);
        f.support(p, &["pneumonia"], Polarity::Unlabeled);
        let reference: BTreeSet<_> = ["flu", "cough"].iter().map(|s| f.registry.phrase(s)).collect();

        let learned = Counter::new();
        let mut inp = input(&f.stats, &learned);
        inp.seed_pattern_phrases = Some(&reference);
        let scores = F1SeedScorer { beta: 1.0 }.score(&inp);
        assert!((scores.get(&p) - 0.5).abs() < 1e-12);
    }

    // ===== Selection Tests =====

    fn params(threshold: f64, n: usize) -> SelectParams<'static> {
        SelectParams {
            threshold,
            num_patterns: n,
            ignore_patterns: &[],
        }
    }

    #[test]
    fn test_keeps_less_restrictive_of_overlapping_pair() {
        for order in [[0, 1], [1, 0]] {
            let mut f = Fixture::new();
            let texts = [
                r#"[l:"with"] {TARGET} [l:"and"]"#,
                r#"{TARGET} [l:"and"]"#,
            ];
            let ids: Vec<PatternId> = order.iter().map(|&i| f.pattern(texts[i])).collect();
            for id in &ids {
                f.support(*id, &["flu"], Polarity::Positive);
                f.support(*id, &["pneumonia"], Polarity::Unlabeled);
            }
            let learned = Counter::new();
            let scores = CountScorer {
                formula: PatternScoring::PosNegUnlabOdds,
            }
            .score(&input(&f.stats, &learned));
            let sel = select_patterns(&scores, &f.stats, &learned, &f.interner, &params(1.0, 10));

            let kept: Vec<String> = sel
                .chosen
                .keys()
                .map(|p| f.interner.pattern(*p).to_string())
                .collect();
            assert_eq!(kept, vec![texts[1].to_string()]);
        }
    }

    #[test]
    fn test_threshold_and_limit() {
        let mut f = Fixture::new();
        let a = f.pattern(r#"[l:"with"] {TARGET}"#);
        let b = f.pattern(r#"[l:"of"] {TARGET}"#);
        let c = f.pattern(r#"[l:"from"] {TARGET}"#);
        f.support(a, &["flu", "cold"], Polarity::Positive);
        f.support(b, &["flu"], Polarity::Positive);
        f.support(c, &["flu"], Polarity::Positive);
        f.support(c, &["x", "y", "z"], Polarity::Negative);
        for p in [a, b, c] {
            f.support(p, &["pneumonia"], Polarity::Unlabeled);
        }
        let learned = Counter::new();
        let scores = CountScorer {
            formula: PatternScoring::PosNegUnlabOdds,
        }
        .score(&input(&f.stats, &learned));

        let sel = select_patterns(&scores, &f.stats, &learned, &f.interner, &params(1.0, 10));
        assert_eq!(sel.chosen.keys().copied().collect::<Vec<_>>(), vec![a, b]);
        let one = select_patterns(&scores, &f.stats, &learned, &f.interner, &params(0.0, 1));
        assert_eq!(one.chosen.len(), 1);
    }

    #[test]
    fn test_no_unlabeled_support_skipped() {
        let mut f = Fixture::new();
        let a = f.pattern(r#"[l:"with"] {TARGET}"#);
        f.support(a, &["flu"], Polarity::Positive);
        let learned = Counter::new();
        let scores = CountScorer {
            formula: PatternScoring::PosNegOdds,
        }
        .score(&input(&f.stats, &learned));
        let sel = select_patterns(&scores, &f.stats, &learned, &f.interner, &params(0.0, 10));
        assert!(sel.chosen.is_empty());
    }

    #[test]
    fn test_learned_pattern_replaced_by_less_restrictive() {
        let mut f = Fixture::new();
        let strict = f.pattern(r#"[l:"with"] {TARGET pos:"NN"}"#);
        let loose = f.pattern(r#"[l:"with"] {TARGET}"#);
        f.support(loose, &["flu"], Polarity::Positive);
        f.support(loose, &["pneumonia"], Polarity::Unlabeled);

        let mut learned = Counter::new();
        learned.set(strict, 2.0);
        let scores = CountScorer {
            formula: PatternScoring::PosNegUnlabOdds,
        }
        .score(&input(&f.stats, &learned));
        let sel = select_patterns(&scores, &f.stats, &learned, &f.interner, &params(1.0, 10));
        assert!(sel.chosen.contains(&loose));
        assert_eq!(sel.removed_learned, vec![strict]);
    }

    #[test]
    fn test_subsumed_by_learned_skipped() {
        let mut f = Fixture::new();
        let loose = f.pattern(r#"{TARGET} [l:"and"]"#);
        let strict = f.pattern(r#"[l:"with"] {TARGET} [l:"and"]"#);
        f.support(strict, &["flu"], Polarity::Positive);
        f.support(strict, &["pneumonia"], Polarity::Unlabeled);
        let mut learned = Counter::new();
        learned.set(loose, 1.0);
        let scores = CountScorer {
            formula: PatternScoring::PosNegUnlabOdds,
        }
        .score(&input(&f.stats, &learned));
        let sel = select_patterns(&scores, &f.stats, &learned, &f.interner, &params(1.0, 10));
        assert!(sel.chosen.is_empty());
    }

    #[test]
    fn test_ignore_patterns() {
        let mut f = Fixture::new();
        let a = f.pattern(r#"[l:"with"] {TARGET}"#);
        f.support(a, &["flu"], Polarity::Positive);
        f.support(a, &["pneumonia"], Polarity::Unlabeled);
        let ignore = vec![f.interner.pattern(a).clone()];
        let learned = Counter::new();
        let scores = CountScorer {
            formula: PatternScoring::PosNegUnlabOdds,
        }
        .score(&input(&f.stats, &learned));
        let sel = select_patterns(
            &scores,
            &f.stats,
            &learned,
            &f.interner,
            &SelectParams {
                threshold: 0.0,
                num_patterns: 10,
                ignore_patterns: &ignore,
            },
        );
        assert!(sel.chosen.is_empty());
    }
}
