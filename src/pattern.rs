//! Context patterns
//!
//! A pattern describes the context around a target phrase. Surface patterns
//! constrain the tokens immediately before and after the target; dependency
//! patterns constrain one arc between the target and a neighbouring token.
//!
//! Patterns are plain values. The relations used to de-duplicate them
//! (`subsumes`, `same_genre`, `equal_context`) only look at the constraint
//! representation and never touch the corpus.
//!
//! The `Display` form is also the pattern language accepted by
//! [`crate::pattern_parse::parse_pattern`]:
//!
//! ```text
//! [l:"with"] [FILLER]{0,2} {TARGET pos:"NN" n:2} [FILLER]{0,2} [l:"and"]
//! {TARGET pos:"NN"} <nsubj [l:"suffer"]
//! ```

use crate::index::FeatureKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pattern factory produced a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    #[default]
    Surface,
    Dependency,
}

/// One slot of surface context
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContextToken {
    /// Exact word
    Word(String),
    /// Exact lemma
    Lemma(String),
    /// Any token currently labeled with the label
    Label(String),
    /// Any token with this NER tag
    Ner(String),
    /// Zero to two filler words ("a", "the", ...)
    Filler,
    /// Zero to two stop words
    StopWord,
}

impl ContextToken {
    /// Gaps match a variable number of tokens, possibly none
    pub fn is_gap(&self) -> bool {
        matches!(self, ContextToken::Filler | ContextToken::StopWord)
    }

    fn short_text(&self) -> Option<String> {
        match self {
            ContextToken::Word(s) | ContextToken::Lemma(s) => Some(s.clone()),
            ContextToken::Label(s) | ContextToken::Ner(s) => Some(format!("<{}>", s)),
            ContextToken::Filler | ContextToken::StopWord => None,
        }
    }
}

/// Restrictions on the target span
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetSpec {
    /// POS prefix every target token must carry
    pub pos: Option<String>,
    pub ner: Option<String>,
    /// Parent constituent tag of the target
    pub parent: Option<String>,
    /// Longest target span, in tokens
    pub max_words: usize,
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            pos: None,
            ner: None,
            parent: None,
            max_words: 1,
        }
    }
}

impl TargetSpec {
    pub fn num_restrictions(&self) -> usize {
        [&self.pos, &self.ner, &self.parent]
            .iter()
            .filter(|r| r.is_some())
            .count()
    }

    /// True if every restriction here is also imposed by `other`
    pub fn at_most_as_strict(&self, other: &TargetSpec) -> bool {
        fn within(mine: &Option<String>, theirs: &Option<String>) -> bool {
            match (mine, theirs) {
                (None, _) => true,
                (Some(a), Some(b)) => b.starts_with(a.as_str()),
                (Some(_), None) => false,
            }
        }
        within(&self.pos, &other.pos)
            && self.ner.as_ref().is_none_or(|n| other.ner.as_ref() == Some(n))
            && self.parent.as_ref().is_none_or(|p| other.parent.as_ref() == Some(p))
            && self.max_words >= other.max_words
    }
}

/// Where the surface context sits relative to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Position {
    Prev,
    Next,
    PrevNext,
}

/// Token window around the target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfacePattern {
    /// Context before the target, left to right
    pub prev: Vec<ContextToken>,
    pub target: TargetSpec,
    /// Context after the target, left to right
    pub next: Vec<ContextToken>,
}

impl SurfacePattern {
    pub fn position(&self) -> Position {
        match (self.prev.is_empty(), self.next.is_empty()) {
            (false, true) => Position::Prev,
            (true, false) => Position::Next,
            _ => Position::PrevNext,
        }
    }
}

/// Direction of the dependency arc, seen from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DepDirection {
    /// The neighbour is the target's head
    Head,
    /// The neighbour is one of the target's dependents
    Child,
}

/// Single dependency arc between the target and a neighbour lemma
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepPattern {
    pub direction: DepDirection,
    pub relation: String,
    pub neighbour: String,
    pub target: TargetSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pattern {
    Surface(SurfacePattern),
    Dependency(DepPattern),
}

impl Pattern {
    pub fn pattern_type(&self) -> PatternType {
        match self {
            Pattern::Surface(_) => PatternType::Surface,
            Pattern::Dependency(_) => PatternType::Dependency,
        }
    }

    pub fn target(&self) -> &TargetSpec {
        match self {
            Pattern::Surface(p) => &p.target,
            Pattern::Dependency(p) => &p.target,
        }
    }

    /// Patterns are comparable only within a genre
    ///
    /// All surface patterns share one genre, so a window can be compared with
    /// the windows it extends. Dependency patterns are grouped by arc
    /// direction and relation.
    pub fn same_genre(&self, other: &Pattern) -> bool {
        match (self, other) {
            (Pattern::Surface(_), Pattern::Surface(_)) => true,
            (Pattern::Dependency(a), Pattern::Dependency(b)) => {
                a.direction == b.direction && a.relation == b.relation
            }
            _ => false,
        }
    }

    /// `self ⊇ other`: every match of `other` is also a match of `self`
    ///
    /// For surface patterns the previous context of `self` must be a suffix of
    /// `other`'s, its next context a prefix of `other`'s, and its target
    /// restrictions no stricter.
    pub fn subsumes(&self, other: &Pattern) -> bool {
        match (self, other) {
            (Pattern::Surface(a), Pattern::Surface(b)) => {
                b.prev.ends_with(&a.prev)
                    && b.next.starts_with(&a.next)
                    && a.target.at_most_as_strict(&b.target)
            }
            (Pattern::Dependency(a), Pattern::Dependency(b)) => {
                a.direction == b.direction
                    && a.relation == b.relation
                    && a.neighbour == b.neighbour
                    && a.target.at_most_as_strict(&b.target)
            }
            _ => false,
        }
    }

    /// Compare two patterns with the same context
    ///
    /// Returns `i32::MAX` when the contexts differ. Otherwise returns the
    /// difference in the number of target restrictions: negative when `self`
    /// is less restrictive, 0 when neither is.
    pub fn equal_context(&self, other: &Pattern) -> i32 {
        let same = match (self, other) {
            (Pattern::Surface(a), Pattern::Surface(b)) => a.prev == b.prev && a.next == b.next,
            (Pattern::Dependency(a), Pattern::Dependency(b)) => {
                a.direction == b.direction
                    && a.relation == b.relation
                    && a.neighbour == b.neighbour
            }
            _ => false,
        };
        if !same {
            return i32::MAX;
        }
        self.target().num_restrictions() as i32 - other.target().num_restrictions() as i32
    }

    /// Feature values a sentence must contain for this pattern to match
    ///
    /// Gaps and label restrictions are not indexable and contribute nothing.
    pub fn relevant_terms(&self) -> Vec<(FeatureKey, String)> {
        match self {
            Pattern::Surface(p) => p
                .prev
                .iter()
                .chain(p.next.iter())
                .filter_map(|t| match t {
                    ContextToken::Word(w) => Some((FeatureKey::Word, w.clone())),
                    ContextToken::Lemma(l) => Some((FeatureKey::Lemma, l.clone())),
                    ContextToken::Ner(n) => Some((FeatureKey::Ner, n.clone())),
                    _ => None,
                })
                .collect(),
            Pattern::Dependency(p) => vec![(FeatureKey::Lemma, p.neighbour.clone())],
        }
    }

    /// Context with gaps removed and the target as `_`, e.g. `with _ and`
    pub fn context_string(&self) -> String {
        match self {
            Pattern::Surface(p) => {
                let mut parts: Vec<String> = p.prev.iter().filter_map(|t| t.short_text()).collect();
                parts.push("_".to_string());
                parts.extend(p.next.iter().filter_map(|t| t.short_text()));
                parts.join(" ")
            }
            Pattern::Dependency(p) => {
                let arrow = match p.direction {
                    DepDirection::Head => '<',
                    DepDirection::Child => '>',
                };
                format!("_ {}{} {}", arrow, p.relation, p.neighbour)
            }
        }
    }

    /// One pattern's context contains the other's
    pub fn redundant_with(&self, other: &Pattern) -> bool {
        let a = self.context_string();
        let b = other.context_string();
        a.contains(&b) || b.contains(&a)
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextToken::Word(w) => write!(f, "[w:{}]", quote(w)),
            ContextToken::Lemma(l) => write!(f, "[l:{}]", quote(l)),
            ContextToken::Label(l) => write!(f, "[label:{}]", quote(l)),
            ContextToken::Ner(n) => write!(f, "[ner:{}]", quote(n)),
            ContextToken::Filler => write!(f, "[FILLER]{{0,2}}"),
            ContextToken::StopWord => write!(f, "[STOPWORD]{{0,2}}"),
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{TARGET")?;
        if let Some(pos) = &self.pos {
            write!(f, " pos:{}", quote(pos))?;
        }
        if let Some(ner) = &self.ner {
            write!(f, " ner:{}", quote(ner))?;
        }
        if let Some(parent) = &self.parent {
            write!(f, " parent:{}", quote(parent))?;
        }
        if self.max_words != 1 {
            write!(f, " n:{}", self.max_words)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Surface(p) => {
                let mut first = true;
                for t in &p.prev {
                    if !first {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", t)?;
                    first = false;
                }
                if !first {
                    f.write_str(" ")?;
                }
                write!(f, "{}", p.target)?;
                for t in &p.next {
                    write!(f, " {}", t)?;
                }
                Ok(())
            }
            Pattern::Dependency(p) => {
                let arrow = match p.direction {
                    DepDirection::Head => '<',
                    DepDirection::Child => '>',
                };
                write!(
                    f,
                    "{} {}{} [l:{}]",
                    p.target,
                    arrow,
                    p.relation,
                    quote(&p.neighbour)
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lemma(s: &str) -> ContextToken {
        ContextToken::Lemma(s.to_string())
    }

    fn surface(prev: Vec<ContextToken>, next: Vec<ContextToken>, pos: Option<&str>) -> Pattern {
        Pattern::Surface(SurfacePattern {
            prev,
            target: TargetSpec {
                pos: pos.map(str::to_string),
                ..TargetSpec::default()
            },
            next,
        })
    }

    // ===== Relation Tests =====

    #[test]
    fn test_shorter_window_subsumes_longer() {
        let narrow = surface(vec![], vec![lemma("and")], None);
        let wide = surface(vec![lemma("with")], vec![lemma("and")], None);
        assert!(narrow.subsumes(&wide));
        assert!(!wide.subsumes(&narrow));
        assert!(narrow.same_genre(&wide));
        assert_eq!(narrow.equal_context(&wide), i32::MAX);
    }

    #[test]
    fn test_prev_context_must_be_suffix() {
        let a = surface(vec![lemma("with")], vec![], None);
        let b = surface(vec![lemma("patients"), lemma("with")], vec![], None);
        let c = surface(vec![lemma("with"), lemma("patients")], vec![], None);
        assert!(a.subsumes(&b));
        assert!(!a.subsumes(&c));
    }

    #[test]
    fn test_pos_restriction() {
        let bare = surface(vec![lemma("with")], vec![], None);
        let noun = surface(vec![lemma("with")], vec![], Some("NN"));
        assert!(bare.subsumes(&noun));
        assert!(!noun.subsumes(&bare));
        assert_eq!(bare.equal_context(&noun), -1);
        assert_eq!(noun.equal_context(&bare), 1);

        let verb = surface(vec![lemma("with")], vec![], Some("VB"));
        assert_eq!(noun.equal_context(&verb), 0);
        assert!(!noun.subsumes(&verb));
    }

    #[test]
    fn test_reflexive() {
        let p = surface(vec![lemma("with"), ContextToken::Filler], vec![], Some("NN"));
        assert!(p.subsumes(&p));
        assert_eq!(p.equal_context(&p), 0);
    }

    #[test]
    fn test_dependency_relations() {
        let dep = |rel: &str, pos: Option<&str>| {
            Pattern::Dependency(DepPattern {
                direction: DepDirection::Head,
                relation: rel.to_string(),
                neighbour: "suffer".to_string(),
                target: TargetSpec {
                    pos: pos.map(str::to_string),
                    ..TargetSpec::default()
                },
            })
        };
        assert!(dep("nsubj", None).subsumes(&dep("nsubj", Some("NN"))));
        assert!(!dep("nsubj", None).same_genre(&dep("obj", None)));
        assert!(!dep("nsubj", None).same_genre(&surface(vec![], vec![lemma("x")], None)));
    }

    // ===== Display Tests =====

    #[test]
    fn test_display() {
        let p = Pattern::Surface(SurfacePattern {
            prev: vec![lemma("with"), ContextToken::Filler],
            target: TargetSpec {
                pos: Some("NN".into()),
                max_words: 2,
                ..TargetSpec::default()
            },
            next: vec![ContextToken::Filler, ContextToken::Label("DISEASE".into())],
        });
        assert_eq!(
            p.to_string(),
            r#"[l:"with"] [FILLER]{0,2} {TARGET pos:"NN" n:2} [FILLER]{0,2} [label:"DISEASE"]"#
        );
        assert_eq!(p.context_string(), "with _ <DISEASE>");
    }

    #[test]
    fn test_display_quotes() {
        let p = surface(vec![ContextToken::Word("say \"hi\"".into())], vec![], None);
        assert_eq!(p.to_string(), r#"[w:"say \"hi\""] {TARGET}"#);
    }

    #[test]
    fn test_relevant_terms_skip_gaps() {
        let p = surface(
            vec![lemma("with"), ContextToken::Filler],
            vec![ContextToken::Label("X".into())],
            None,
        );
        assert_eq!(p.relevant_terms(), vec![(FeatureKey::Lemma, "with".to_string())]);
    }

    #[test]
    fn test_redundant_with() {
        let a = surface(vec![lemma("with")], vec![lemma("and")], None);
        let b = surface(vec![], vec![lemma("and")], None);
        let c = surface(vec![lemma("of")], vec![], None);
        assert!(a.redundant_with(&b));
        assert!(!a.redundant_with(&c));
    }
}
