//! Token and sentence data structures
//!
//! Tokens carry the annotator's output (word, lemma, POS, NER, parent tag and
//! the dependency arc) plus two side tables keyed by label name: the current
//! answer for each label, and the seed/learned phrases that matched there.
//! Labeling operations are the only code that mutates tokens.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Background answer for a label
pub const BACKGROUND: &str = "O";

/// Unique identifier for a token within its sentence
pub type TokenId = usize;

/// Phrases that matched a token for one label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPhrases {
    /// Longest phrase covering the token
    pub longest: Option<String>,
    /// Every phrase covering the token, in the order they were applied
    pub all: Vec<String>,
}

impl MatchedPhrases {
    /// Record a phrase; the longest one (by words, then characters) wins
    pub fn add(&mut self, phrase: &str) {
        if !self.all.iter().any(|p| p == phrase) {
            self.all.push(phrase.to_string());
        }
        let longer = match &self.longest {
            None => true,
            Some(cur) => phrase_len(phrase) > phrase_len(cur),
        };
        if longer {
            self.longest = Some(phrase.to_string());
        }
    }

    pub fn remove(&mut self, phrase: &str) {
        self.all.retain(|p| p != phrase);
        if self.longest.as_deref() == Some(phrase) {
            self.longest = self
                .all
                .iter()
                .max_by_key(|p| phrase_len(p))
                .cloned();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

fn phrase_len(p: &str) -> (usize, usize) {
    (p.split_whitespace().count(), p.chars().count())
}

/// A token in a sentence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub word: String,
    pub lemma: String,
    pub pos: String,
    pub ner: String,
    pub parent_tag: String,
    /// Head token (None for the root or when no parse is available)
    pub head: Option<TokenId>,
    pub deprel: String,
    /// Gold label from the input, used only for evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gold: Option<String>,
    /// label -> current answer (the label name or `BACKGROUND`)
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// label -> phrases that matched here
    #[serde(default)]
    pub matched: BTreeMap<String, MatchedPhrases>,
    /// Normalized text after stop-word filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<String, String>,
}

impl Token {
    /// Create a token with empty NER, parent tag and parse
    pub fn new(word: &str, lemma: &str, pos: &str) -> Self {
        Self {
            word: word.to_string(),
            lemma: lemma.to_string(),
            pos: pos.to_string(),
            ner: BACKGROUND.to_string(),
            parent_tag: String::new(),
            head: None,
            deprel: String::new(),
            gold: None,
            labels: BTreeMap::new(),
            matched: BTreeMap::new(),
            processed: None,
            features: BTreeMap::new(),
        }
    }

    pub fn with_ner(mut self, ner: &str) -> Self {
        self.ner = ner.to_string();
        self
    }

    pub fn with_head(mut self, head: Option<TokenId>, deprel: &str) -> Self {
        self.head = head;
        self.deprel = deprel.to_string();
        self
    }

    /// Current answer for `label`
    pub fn answer(&self, label: &str) -> &str {
        self.labels.get(label).map_or(BACKGROUND, String::as_str)
    }

    pub fn is_labeled(&self, label: &str) -> bool {
        self.answer(label) == label
    }

    pub fn set_label(&mut self, label: &str, on: bool) {
        let value = if on { label } else { BACKGROUND };
        self.labels.insert(label.to_string(), value.to_string());
        if !on {
            self.matched.remove(label);
        }
    }

    /// Labels whose answer is currently positive, in label order
    pub fn active_labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.labels
            .iter()
            .filter(|(label, answer)| label == answer)
            .map(|(label, _)| label.as_str())
    }

    pub fn has_any_label(&self) -> bool {
        self.active_labels().next().is_some()
    }

    /// True if labeled with any label other than `label`
    pub fn labeled_other_than(&self, label: &str) -> bool {
        self.active_labels().any(|l| l != label)
    }

    pub fn longest_match(&self, label: &str) -> Option<&str> {
        self.matched.get(label).and_then(|m| m.longest.as_deref())
    }
}

/// A tokenized sentence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub id: String,
    pub tokens: Vec<Token>,
}

impl Sentence {
    pub fn new(id: &str, tokens: Vec<Token>) -> Self {
        Self {
            id: id.to_string(),
            tokens,
        }
    }

    /// Build from whitespace-separated `word` or `word/POS` items
    ///
    /// The lemma is the lowercased word and the POS defaults to `NN`.
    pub fn from_tagged(id: &str, text: &str) -> Self {
        let tokens = text
            .split_whitespace()
            .map(|item| {
                let (word, pos) = match item.rsplit_once('/') {
                    Some((w, p)) if !w.is_empty() && !p.is_empty() => (w, p),
                    _ => (item, "NN"),
                };
                Token::new(word, &word.to_lowercase(), pos)
            })
            .collect();
        Self::new(id, tokens)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Words of `start..end` joined by single spaces
    pub fn span_text(&self, start: usize, end: usize) -> String {
        self.tokens[start..end]
            .iter()
            .map(|t| t.word.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn span_lemma(&self, start: usize, end: usize) -> String {
        self.tokens[start..end]
            .iter()
            .map(|t| t.lemma.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Dependents of `id`, in sentence order
    pub fn children(&self, id: TokenId) -> impl Iterator<Item = TokenId> + '_ {
        self.tokens
            .iter()
            .enumerate()
            .filter(move |(_, t)| t.head == Some(id))
            .map(|(i, _)| i)
    }

    /// Ensure every token has an answer for each label
    pub fn init_labels<'a>(&mut self, labels: impl IntoIterator<Item = &'a str> + Clone) {
        for token in &mut self.tokens {
            for label in labels.clone() {
                token
                    .labels
                    .entry(label.to_string())
                    .or_insert_with(|| BACKGROUND.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tagged() {
        let s = Sentence::from_tagged("s1", "Patients/NNS with/IN flu/NN");
        assert_eq!(s.len(), 3);
        assert_eq!(s.tokens[0].lemma, "patients");
        assert_eq!(s.tokens[1].pos, "IN");
        assert_eq!(s.span_text(1, 3), "with flu");

        let plain = Sentence::from_tagged("s2", "a/b/c plain");
        assert_eq!(plain.tokens[0].word, "a/b");
        assert_eq!(plain.tokens[1].pos, "NN");
    }

    #[test]
    fn test_labels() {
        let mut s = Sentence::from_tagged("s1", "flu season");
        s.init_labels(["DISEASE", "SYMPTOM"]);
        assert_eq!(s.tokens[0].answer("DISEASE"), BACKGROUND);

        s.tokens[0].set_label("DISEASE", true);
        assert!(s.tokens[0].is_labeled("DISEASE"));
        assert!(s.tokens[0].labeled_other_than("SYMPTOM"));
        assert!(!s.tokens[0].labeled_other_than("DISEASE"));
        assert_eq!(s.tokens[0].active_labels().collect::<Vec<_>>(), vec!["DISEASE"]);
    }

    #[test]
    fn test_matched_longest() {
        let mut m = MatchedPhrases::default();
        m.add("pain");
        m.add("chronic pain");
        m.add("pain");
        assert_eq!(m.longest.as_deref(), Some("chronic pain"));
        assert_eq!(m.all.len(), 2);
        m.remove("chronic pain");
        assert_eq!(m.longest.as_deref(), Some("pain"));
    }

    #[test]
    fn test_children() {
        let tokens = vec![
            Token::new("suffer", "suffer", "VB"),
            Token::new("patients", "patient", "NNS").with_head(Some(0), "nsubj"),
            Token::new("flu", "flu", "NN").with_head(Some(0), "obl"),
        ];
        let s = Sentence::new("s1", tokens);
        assert_eq!(s.children(0).collect::<Vec<_>>(), vec![1, 2]);
    }
}
