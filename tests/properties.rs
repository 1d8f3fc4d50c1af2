//! Property tests over generated sentences, words and patterns

use proptest::prelude::*;
use seedpat::config::PatternScoring;
use seedpat::edit_distance;
use seedpat::index::{InMemoryIndex, SentenceIndex};
use seedpat::labeling::{MatchOptions, PhraseMatcher, label_sentence};
use seedpat::matcher::{MatchContext, find_spans};
use seedpat::pattern::{ContextToken, SurfacePattern, TargetSpec};
use seedpat::score_patterns::count_score;
use seedpat::{CandidatePhrase, Pattern, Sentence, SentenceStore};

const VOCAB: &[&str] = &["with", "and", "flu", "cough", "patients", "of", "severe", "cases"];

fn word() -> impl Strategy<Value = &'static str> {
    prop::sample::select(VOCAB)
}

fn sentence_text() -> impl Strategy<Value = String> {
    prop::collection::vec(word(), 1..10).prop_map(|ws| ws.join(" "))
}

fn surface_pattern() -> impl Strategy<Value = SurfacePattern> {
    let side = || prop::collection::vec(word().prop_map(|w| ContextToken::Lemma(w.to_string())), 0..3);
    (side(), side())
        .prop_filter("needs some context", |(p, n)| !p.is_empty() || !n.is_empty())
        .prop_map(|(prev, next)| SurfacePattern {
            prev,
            target: TargetSpec::default(),
            next,
        })
}

proptest! {
    // ===== Edit Distance Properties =====

    #[test]
    fn prop_distance_identity_and_symmetry(a in "[a-z]{0,10}", b in "[a-z]{0,10}") {
        prop_assert_eq!(edit_distance::distance(&a, &a, 3), 0);
        prop_assert_eq!(
            edit_distance::distance(&a, &b, 3),
            edit_distance::distance(&b, &a, 3)
        );
    }

    #[test]
    fn prop_distance_bounded_by_threshold(a in "[a-z]{0,10}", b in "[a-z]{0,10}", t in 0usize..5) {
        let d = edit_distance::distance(&a, &b, t);
        prop_assert!(d == -1 || (0..=t as i32).contains(&d));
        let longer = a.chars().count().max(b.chars().count());
        prop_assert!(d <= longer as i32);
    }

    // ===== Subsumption Properties =====

    #[test]
    fn prop_subsumption_reflexive(p in surface_pattern()) {
        let p = Pattern::Surface(p);
        prop_assert!(p.subsumes(&p));
    }

    #[test]
    fn prop_shrunk_context_subsumes(p in surface_pattern(), drop_prev in 0usize..3, drop_next in 0usize..3) {
        let mut shrunk = p.clone();
        shrunk.prev.drain(..drop_prev.min(shrunk.prev.len()));
        let keep = shrunk.next.len().saturating_sub(drop_next);
        shrunk.next.truncate(keep);
        let (general, specific) = (Pattern::Surface(shrunk), Pattern::Surface(p));
        prop_assert!(general.subsumes(&specific));
    }

    #[test]
    fn prop_subsumption_transitive(p in surface_pattern(), d1 in 0usize..2, d2 in 0usize..2) {
        let mut mid = p.clone();
        mid.prev.drain(..d1.min(mid.prev.len()));
        let mut top = mid.clone();
        let keep = top.next.len().saturating_sub(d2);
        top.next.truncate(keep);
        let (p, mid, top) = (Pattern::Surface(p), Pattern::Surface(mid), Pattern::Surface(top));
        prop_assert!(top.subsumes(&mid) && mid.subsumes(&p));
        prop_assert!(top.subsumes(&p));
    }

    #[test]
    fn prop_general_pattern_matches_superset(p in surface_pattern(), text in sentence_text()) {
        let sent = Sentence::from_tagged("s", &text);
        let ctx = MatchContext::default();
        let mut general = p.clone();
        if general.prev.len() + general.next.len() > 1 {
            if general.prev.is_empty() {
                general.next.pop();
            } else {
                general.prev.remove(0);
            }
        }
        let specific = find_spans(&Pattern::Surface(p), &sent, &ctx);
        let broad = find_spans(&Pattern::Surface(general), &sent, &ctx);
        for span in specific {
            prop_assert!(broad.contains(&span));
        }
    }

    // ===== Index Properties =====

    #[test]
    fn prop_index_never_misses_a_match(
        texts in prop::collection::vec(sentence_text(), 1..8),
        patterns in prop::collection::vec(surface_pattern(), 1..6),
    ) {
        let store = SentenceStore::from_sentences(
            texts.iter().enumerate().map(|(i, t)| Sentence::from_tagged(&format!("s{}", i), t)),
        );
        let mut index = InMemoryIndex::new(Default::default());
        index.add(&store, false);
        index.finish_updating().unwrap();

        let patterns: Vec<Pattern> = patterns.into_iter().map(Pattern::Surface).collect();
        let result = index.query_index(&patterns);
        let ctx = MatchContext::default();
        for pattern in &patterns {
            for sent in store.iter() {
                if !find_spans(pattern, sent, &ctx).is_empty() {
                    prop_assert!(result.get(pattern).is_some_and(|ids| ids.contains(&sent.id)));
                }
            }
        }
    }

    // ===== Scoring Properties =====

    #[test]
    fn prop_rlogf_monotone_in_positives(pos in 0u32..50, neg in 0u32..50, unlab in 0u32..50) {
        let (pos, neg, unlab) = (pos as f64, neg as f64, unlab as f64);
        let here = count_score(PatternScoring::RlogF, pos, neg, unlab);
        let more = count_score(PatternScoring::RlogF, pos + 1.0, neg, unlab);
        prop_assert!(more >= here);
    }

    // ===== Labeling Properties =====

    #[test]
    fn prop_relabeling_is_idempotent(text in sentence_text(), seeds in prop::collection::vec(word(), 1..3)) {
        let mut sent = Sentence::from_tagged("s", &text);
        sent.init_labels(["DISEASE"]);
        let phrases: Vec<CandidatePhrase> = seeds.iter().map(|w| CandidatePhrase::new(*w)).collect();
        let matcher = PhraseMatcher::new(&phrases, MatchOptions::exact());

        label_sentence(&mut sent, "DISEASE", &matcher);
        let once = sent.clone();
        let changed = label_sentence(&mut sent, "DISEASE", &matcher);
        prop_assert!(changed.is_empty());
        prop_assert_eq!(once, sent);
    }
}
