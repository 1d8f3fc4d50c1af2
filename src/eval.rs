//! Evaluation against gold labels
//!
//! Token and entity scores compare the labels on tokens with the gold label
//! read from the corpus (`Token::gold`, comma separated when a token has
//! several). Entities are maximal runs of consecutive tokens with a label and
//! count as correct only on an exact span match. Learned word lists are
//! scored against gold judgement files; learned words missing from the gold
//! file count as incorrect.

use crate::counter::Counter;
use crate::phrase::CandidatePhrase;
use crate::seeds::{self, SeedError};
use crate::store::{Corpus, SentenceStore, StoreError};
use crate::token::{BACKGROUND, Sentence, Token};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// True/false positive and false negative counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub tp: usize,
    pub fp: usize,
    pub fn_: usize,
}

impl Counts {
    pub fn add(&mut self, other: &Counts) {
        self.tp += other.tp;
        self.fp += other.fp;
        self.fn_ += other.fn_;
    }

    pub fn precision(&self) -> f64 {
        let predicted = self.tp + self.fp;
        if predicted == 0 {
            0.0
        } else {
            self.tp as f64 / predicted as f64
        }
    }

    pub fn recall(&self) -> f64 {
        let gold = self.tp + self.fn_;
        if gold == 0 {
            0.0
        } else {
            self.tp as f64 / gold as f64
        }
    }

    pub fn f_beta(&self, beta: f64) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        let b2 = beta * beta;
        if p + r == 0.0 {
            0.0
        } else {
            (1.0 + b2) * p * r / (b2 * p + r)
        }
    }

    pub fn f1(&self) -> f64 {
        self.f_beta(1.0)
    }
}

/// Token and entity counts of one label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LabelScores {
    pub token: Counts,
    pub entity: Counts,
}

pub fn gold_has(token: &Token, label: &str) -> bool {
    token
        .gold
        .as_deref()
        .is_some_and(|g| g != BACKGROUND && g.split(',').any(|l| l.trim() == label))
}

/// Maximal runs of tokens satisfying `on`
fn runs(sent: &Sentence, on: impl Fn(&Token) -> bool) -> BTreeSet<(usize, usize)> {
    let mut out = BTreeSet::new();
    let mut start = None;
    for (i, token) in sent.tokens.iter().enumerate() {
        match (start, on(token)) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                out.insert((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.insert((s, sent.len()));
    }
    out
}

/// Add the counts of one sentence to `scores`
pub fn evaluate_sentence(sent: &Sentence, labels: &[String], scores: &mut BTreeMap<String, LabelScores>) {
    for label in labels {
        let entry = scores.entry(label.clone()).or_default();
        for token in &sent.tokens {
            match (token.is_labeled(label), gold_has(token, label)) {
                (true, true) => entry.token.tp += 1,
                (true, false) => entry.token.fp += 1,
                (false, true) => entry.token.fn_ += 1,
                (false, false) => {}
            }
        }
        let predicted = runs(sent, |t| t.is_labeled(label));
        let gold = runs(sent, |t| gold_has(t, label));
        let hits = predicted.intersection(&gold).count();
        entry.entity.tp += hits;
        entry.entity.fp += predicted.len() - hits;
        entry.entity.fn_ += gold.len() - hits;
    }
}

pub fn evaluate_store(store: &SentenceStore, labels: &[String]) -> BTreeMap<String, LabelScores> {
    let mut scores = BTreeMap::new();
    for sent in store.iter() {
        evaluate_sentence(sent, labels, &mut scores);
    }
    scores
}

/// Scores of every label over every batch
pub fn evaluate_corpus(corpus: &Corpus, labels: &[String]) -> Result<BTreeMap<String, LabelScores>, StoreError> {
    let mut scores = BTreeMap::new();
    corpus.for_each_batch(|store| {
        for sent in store.iter() {
            evaluate_sentence(sent, labels, &mut scores);
        }
        Ok::<(), StoreError>(())
    })?;
    Ok(scores)
}

/// Score learned words against gold judgements, case-insensitively
pub fn evaluate_learned_words(learned: &Counter<CandidatePhrase>, gold: &BTreeMap<String, bool>) -> Counts {
    let gold: BTreeMap<String, bool> = gold.iter().map(|(k, v)| (k.to_lowercase(), *v)).collect();
    let learned: BTreeSet<String> = learned.keys().map(|p| p.text().to_lowercase()).collect();
    let mut counts = Counts::default();
    for word in &learned {
        if gold.get(word).copied().unwrap_or(false) {
            counts.tp += 1;
        } else {
            counts.fp += 1;
        }
    }
    counts.fn_ = gold
        .iter()
        .filter(|(word, correct)| **correct && !learned.contains(*word))
        .count();
    counts
}

/// Gold judgement files from a `label,file` manifest, merged per label
pub fn read_gold_manifest(manifest: &str) -> Result<BTreeMap<String, BTreeMap<String, bool>>, SeedError> {
    let mut gold: BTreeMap<String, BTreeMap<String, bool>> = BTreeMap::new();
    for (label, files) in seeds::parse_manifest(manifest) {
        let entry = gold.entry(label).or_default();
        for file in files {
            entry.extend(seeds::read_gold_entities(&file)?);
        }
    }
    Ok(gold)
}

/// Per-label evaluation report
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub labels: BTreeMap<String, LabelScores>,
    pub learned_words: BTreeMap<String, Counts>,
}

fn write_row(f: &mut fmt::Formatter<'_>, name: &str, c: &Counts) -> fmt::Result {
    writeln!(
        f,
        "  {:<8} P={:.3} R={:.3} F1={:.3} (tp={} fp={} fn={})",
        name,
        c.precision(),
        c.recall(),
        c.f1(),
        c.tp,
        c.fp,
        c.fn_
    )
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: BTreeSet<&String> = self.labels.keys().chain(self.learned_words.keys()).collect();
        for label in labels {
            writeln!(f, "{}", label)?;
            if let Some(s) = self.labels.get(label) {
                write_row(f, "token", &s.token)?;
                write_row(f, "entity", &s.entity)?;
            }
            if let Some(c) = self.learned_words.get(label) {
                write_row(f, "words", c)?;
            }
        }
        Ok(())
    }
}
