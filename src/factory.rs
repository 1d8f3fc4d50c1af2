//! Pattern factories
//!
//! A factory looks at one token of a sentence and proposes every pattern
//! that could describe the token's context. The surface factory grows token
//! windows to the left and right of the target; the dependency factory uses
//! the token's arcs.

use crate::pattern::{
    ContextToken, DepDirection, DepPattern, Pattern, PatternType, SurfacePattern, TargetSpec,
};
use crate::token::{BACKGROUND, Sentence, Token};
use regex::Regex;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;

/// Switches for the surface factory
#[derive(Debug, Clone)]
pub struct SurfaceOptions {
    pub min_window: usize,
    pub max_window: usize,
    pub use_previous_context: bool,
    pub use_next_context: bool,
    /// A side made only of stop words needs more than this many of them
    pub num_min_stop_words_to_add: usize,
    pub use_filler_words: bool,
    pub use_stop_words_before_term: bool,
    pub use_pos: bool,
    pub use_coarse_pos: bool,
    pub add_without_pos: bool,
    pub use_target_ner_restriction: bool,
    pub use_context_ner_restriction: bool,
    pub use_target_parent_restriction: bool,
    pub use_lemma_context_tokens: bool,
    /// Longest target span
    pub num_words_compound: usize,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self {
            min_window: 2,
            max_window: 4,
            use_previous_context: true,
            use_next_context: false,
            num_min_stop_words_to_add: 3,
            use_filler_words: true,
            use_stop_words_before_term: false,
            use_pos: true,
            use_coarse_pos: true,
            add_without_pos: true,
            use_target_ner_restriction: false,
            use_context_ner_restriction: false,
            use_target_parent_restriction: false,
            use_lemma_context_tokens: true,
            num_words_compound: 2,
        }
    }
}

/// Word lists shared by the factories
#[derive(Debug, Clone, Default)]
pub struct FactoryWords {
    pub stop_words: FxHashSet<String>,
    pub fillers: FxHashSet<String>,
    /// Anchored regex; matching tokens never get patterns
    pub word_ignore: Option<Regex>,
}

impl FactoryWords {
    fn is_stop_word(&self, token: &Token) -> bool {
        self.stop_words.contains(&token.word.to_lowercase())
            || self.stop_words.contains(&token.lemma.to_lowercase())
    }

    /// True if `token` may be the target of a pattern
    pub fn is_candidate(&self, token: &Token) -> bool {
        !self.is_stop_word(token)
            && !self
                .word_ignore
                .as_ref()
                .is_some_and(|re| re.is_match(&token.word))
    }
}

/// Proposes the patterns describing a token's context
pub trait PatternFactory: Send + Sync {
    fn pattern_type(&self) -> PatternType;

    /// Every pattern that fires at token `i`
    fn context_for(&self, sent: &Sentence, i: usize) -> BTreeSet<Pattern>;

    fn words(&self) -> &FactoryWords;
}

/// Build the factory for `pattern_type`
pub fn new_factory(
    pattern_type: PatternType,
    options: SurfaceOptions,
    words: FactoryWords,
) -> Box<dyn PatternFactory> {
    match pattern_type {
        PatternType::Surface => Box::new(SurfacePatternFactory::new(options, words)),
        PatternType::Dependency => Box::new(DepPatternFactory::new(options, words)),
    }
}

/// Target restriction variants for the token at `i`
fn target_specs(options: &SurfaceOptions, token: &Token) -> Vec<TargetSpec> {
    let base = TargetSpec {
        pos: None,
        ner: (options.use_target_ner_restriction && token.ner != BACKGROUND)
            .then(|| token.ner.clone()),
        parent: (options.use_target_parent_restriction && !token.parent_tag.is_empty())
            .then(|| token.parent_tag.clone()),
        max_words: options.num_words_compound.max(1),
    };

    let mut specs = Vec::with_capacity(2);
    if options.use_pos && !token.pos.is_empty() {
        let pos = if options.use_coarse_pos {
            token.pos.chars().take(2).collect()
        } else {
            token.pos.clone()
        };
        specs.push(TargetSpec {
            pos: Some(pos),
            ..base.clone()
        });
    }
    if options.add_without_pos || specs.is_empty() {
        specs.push(base);
    }
    specs
}

// ===== Surface patterns =====

/// Context collected on one side of the target
#[derive(Debug, Default)]
struct SideContext {
    /// Context slots, left to right, gaps excluded
    slots: Vec<ContextToken>,
    stop: usize,
    nonstop: usize,
}

impl SideContext {
    fn size(&self) -> usize {
        self.slots.len()
    }

    fn is_usable(&self, min_stop_words: usize) -> bool {
        self.size() > 0
            && (self.nonstop > 0 || self.stop > min_stop_words)
            && self.slots.iter().all(|t| match t {
                ContextToken::Word(s) | ContextToken::Lemma(s) => s.is_ascii(),
                _ => true,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Side {
    Prev,
    Next,
}

/// Token windows around the target
#[derive(Debug)]
pub struct SurfacePatternFactory {
    options: SurfaceOptions,
    words: FactoryWords,
}

impl SurfacePatternFactory {
    pub fn new(options: SurfaceOptions, words: FactoryWords) -> Self {
        Self { options, words }
    }

    /// Walk away from the target collecting up to `max_win` context slots
    fn walk(&self, sent: &Sentence, i: usize, side: Side, max_win: usize) -> SideContext {
        let mut ctx = SideContext::default();
        let positions: Box<dyn Iterator<Item = usize>> = match side {
            Side::Prev => Box::new((0..i).rev()),
            Side::Next => Box::new(i + 1..sent.len()),
        };

        for j in positions {
            if ctx.size() >= max_win {
                break;
            }
            let token = &sent.tokens[j];
            if self.options.use_filler_words
                && self.words.fillers.contains(&token.word.to_lowercase())
            {
                continue;
            }

            let slot = if let Some(label) = token.active_labels().next() {
                ctx.nonstop += 1;
                ContextToken::Label(label.to_string())
            } else if self.options.use_context_ner_restriction && token.ner != BACKGROUND {
                ctx.nonstop += 1;
                ContextToken::Ner(token.ner.clone())
            } else if token.word.starts_with("http") {
                return SideContext::default();
            } else {
                if self.words.is_stop_word(token) {
                    ctx.stop += 1;
                } else {
                    ctx.nonstop += 1;
                }
                if self.options.use_lemma_context_tokens {
                    ContextToken::Lemma(token.lemma.clone())
                } else {
                    ContextToken::Word(token.word.clone())
                }
            };
            ctx.slots.push(slot);
        }

        if side == Side::Prev {
            ctx.slots.reverse();
        }
        ctx
    }

    /// Slots with gap tokens interleaved
    fn layout(&self, ctx: &SideContext, side: Side) -> Vec<ContextToken> {
        let mut out = Vec::with_capacity(ctx.size() * 2 + 1);
        if side == Side::Next && self.options.use_stop_words_before_term {
            out.push(ContextToken::StopWord);
        }
        for slot in &ctx.slots {
            if side == Side::Next && self.options.use_filler_words {
                out.push(ContextToken::Filler);
            }
            out.push(slot.clone());
            if side == Side::Prev && self.options.use_filler_words {
                out.push(ContextToken::Filler);
            }
        }
        if side == Side::Prev && self.options.use_stop_words_before_term {
            out.push(ContextToken::StopWord);
        }
        out
    }
}

impl PatternFactory for SurfacePatternFactory {
    fn pattern_type(&self) -> PatternType {
        PatternType::Surface
    }

    fn words(&self) -> &FactoryWords {
        &self.words
    }

    fn context_for(&self, sent: &Sentence, i: usize) -> BTreeSet<Pattern> {
        let mut patterns = BTreeSet::new();
        let Some(token) = sent.tokens.get(i) else {
            return patterns;
        };
        if !self.words.is_candidate(token) {
            return patterns;
        }

        let opts = &self.options;
        let targets = target_specs(opts, token);
        let min_stop = opts.num_min_stop_words_to_add;

        for max_win in 1..=opts.max_window.max(1) {
            let prev = self.walk(sent, i, Side::Prev, max_win);
            let next = self.walk(sent, i, Side::Next, max_win);
            let prev_ok = opts.use_previous_context && prev.is_usable(min_stop);
            let next_ok = opts.use_next_context && next.is_usable(min_stop);
            let prev_tokens = self.layout(&prev, Side::Prev);
            let next_tokens = self.layout(&next, Side::Next);

            for target in &targets {
                if prev_ok && prev.size() >= opts.min_window {
                    patterns.insert(Pattern::Surface(SurfacePattern {
                        prev: prev_tokens.clone(),
                        target: target.clone(),
                        next: Vec::new(),
                    }));
                }
                if next_ok && next.size() >= opts.min_window {
                    patterns.insert(Pattern::Surface(SurfacePattern {
                        prev: Vec::new(),
                        target: target.clone(),
                        next: next_tokens.clone(),
                    }));
                }
                if prev_ok && next_ok && prev.size() + next.size() >= opts.min_window {
                    patterns.insert(Pattern::Surface(SurfacePattern {
                        prev: prev_tokens.clone(),
                        target: target.clone(),
                        next: next_tokens.clone(),
                    }));
                }
            }
        }
        patterns
    }
}

// ===== Dependency patterns =====

/// One-arc patterns over the dependency parse
#[derive(Debug)]
pub struct DepPatternFactory {
    options: SurfaceOptions,
    words: FactoryWords,
}

impl DepPatternFactory {
    pub fn new(options: SurfaceOptions, words: FactoryWords) -> Self {
        Self { options, words }
    }

    fn neighbour_ok(&self, token: &Token) -> bool {
        self.words.is_candidate(token) && token.lemma.is_ascii()
    }
}

impl PatternFactory for DepPatternFactory {
    fn pattern_type(&self) -> PatternType {
        PatternType::Dependency
    }

    fn words(&self) -> &FactoryWords {
        &self.words
    }

    fn context_for(&self, sent: &Sentence, i: usize) -> BTreeSet<Pattern> {
        let mut patterns = BTreeSet::new();
        let Some(token) = sent.tokens.get(i) else {
            return patterns;
        };
        if !self.words.is_candidate(token) {
            return patterns;
        }

        let mut arcs = Vec::new();
        if let Some(head) = token.head.and_then(|h| sent.tokens.get(h))
            && !token.deprel.is_empty()
            && self.neighbour_ok(head)
        {
            arcs.push((DepDirection::Head, token.deprel.clone(), head.lemma.clone()));
        }
        for c in sent.children(i) {
            let child = &sent.tokens[c];
            if !child.deprel.is_empty() && self.neighbour_ok(child) {
                arcs.push((DepDirection::Child, child.deprel.clone(), child.lemma.clone()));
            }
        }

        let mut targets = target_specs(&self.options, token);
        for t in &mut targets {
            t.max_words = 1;
        }
        for (direction, relation, neighbour) in arcs {
            for target in &targets {
                patterns.insert(Pattern::Dependency(DepPattern {
                    direction,
                    relation: relation.clone(),
                    neighbour: neighbour.clone(),
                    target: target.clone(),
                }));
            }
        }
        patterns
    }
}
