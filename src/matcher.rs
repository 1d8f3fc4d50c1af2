//! Pattern matching against sentences
//!
//! Surface patterns are compiled to a short instruction program and run by a
//! small backtracking machine, one start position at a time. Gaps and the
//! target span are the only choice points: a gap may consume zero to two
//! filler or stop words, and the target may cover one to `max_words` tokens
//! (longest first).
//!
//! Dependency patterns are matched directly against the head/deprel arcs.

use crate::pattern::{ContextToken, DepDirection, DepPattern, Pattern, SurfacePattern, TargetSpec};
use crate::token::{Sentence, Token};
use rustc_hash::FxHashSet;

/// Longest run a gap may consume
const MAX_GAP: usize = 2;

/// Dependents folded into a dependency-pattern target
const COMPOUND_RELATIONS: [&str; 3] = ["compound", "amod", "flat"];

/// Half-open token range `start..end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, i: usize) -> bool {
        self.start <= i && i < self.end
    }
}

/// Word lists and switches a match depends on
#[derive(Debug, Clone, Default)]
pub struct MatchContext<'a> {
    pub fillers: Option<&'a FxHashSet<String>>,
    pub stop_words: Option<&'a FxHashSet<String>>,
    /// Compare context words and lemmas case-insensitively
    pub lowercase: bool,
    /// Longest dependency-pattern target, counting compound dependents
    pub num_words_compound: usize,
}

impl MatchContext<'_> {
    fn is_filler(&self, token: &Token) -> bool {
        self.fillers
            .is_some_and(|f| f.contains(&token.word.to_lowercase()))
    }

    fn is_stop_word(&self, token: &Token) -> bool {
        self.stop_words.is_some_and(|s| {
            s.contains(&token.word.to_lowercase()) || s.contains(&token.lemma.to_lowercase())
        })
    }

    fn same_text(&self, a: &str, b: &str) -> bool {
        if self.lowercase {
            a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
        } else {
            a == b
        }
    }
}

/// Matcher instructions
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    CheckWord(String),
    CheckLemma(String),
    CheckLabel(String),
    CheckNer(String),
    /// Skip up to `MAX_GAP` filler words
    SkipFillers,
    /// Skip up to `MAX_GAP` stop words
    SkipStopWords,
    /// Bind the target span
    Target(TargetSpec),
    Match,
}

/// A backtrack point
#[derive(Debug, Clone)]
struct ChoicePoint {
    ip: usize,
    target: Option<Span>,
    /// Positions to resume at, most preferred last
    alternatives: Vec<usize>,
}

#[derive(Debug)]
struct MachineState {
    pos: usize,
    ip: usize,
    target: Option<Span>,
    backtrack_stack: Vec<ChoicePoint>,
}

/// Compiled form of a pattern
#[derive(Debug, Clone)]
pub enum Program {
    Surface(Vec<Instruction>),
    Dependency(DepPattern),
}

impl Program {
    pub fn compile(pattern: &Pattern) -> Self {
        match pattern {
            Pattern::Surface(p) => Program::Surface(compile_surface(p)),
            Pattern::Dependency(p) => Program::Dependency(p.clone()),
        }
    }

    /// Every distinct target span the pattern matches in `sent`, in order
    pub fn find_spans(&self, sent: &Sentence, ctx: &MatchContext) -> Vec<Span> {
        let spans = match self {
            Program::Surface(opcodes) => run_surface(opcodes, sent, ctx),
            Program::Dependency(p) => match_dependency(p, sent, ctx),
        };
        let mut seen = FxHashSet::default();
        let mut unique: Vec<Span> = spans.into_iter().filter(|s| seen.insert(*s)).collect();
        unique.sort();
        unique
    }
}

/// Match a pattern in one call
pub fn find_spans(pattern: &Pattern, sent: &Sentence, ctx: &MatchContext) -> Vec<Span> {
    Program::compile(pattern).find_spans(sent, ctx)
}

fn compile_context(token: &ContextToken) -> Instruction {
    match token {
        ContextToken::Word(w) => Instruction::CheckWord(w.clone()),
        ContextToken::Lemma(l) => Instruction::CheckLemma(l.clone()),
        ContextToken::Label(l) => Instruction::CheckLabel(l.clone()),
        ContextToken::Ner(n) => Instruction::CheckNer(n.clone()),
        ContextToken::Filler => Instruction::SkipFillers,
        ContextToken::StopWord => Instruction::SkipStopWords,
    }
}

fn compile_surface(p: &SurfacePattern) -> Vec<Instruction> {
    let mut opcodes: Vec<Instruction> = p.prev.iter().map(compile_context).collect();
    opcodes.push(Instruction::Target(p.target.clone()));
    opcodes.extend(p.next.iter().map(compile_context));
    opcodes.push(Instruction::Match);
    opcodes
}

/// Does `token` satisfy the target restrictions
pub fn target_accepts(spec: &TargetSpec, token: &Token) -> bool {
    spec.pos.as_ref().is_none_or(|p| token.pos.starts_with(p.as_str()))
        && spec.ner.as_ref().is_none_or(|n| token.ner == *n)
        && spec.parent.as_ref().is_none_or(|p| token.parent_tag == *p)
}

fn run_surface(opcodes: &[Instruction], sent: &Sentence, ctx: &MatchContext) -> Vec<Span> {
    let mut found = Vec::new();
    for start in 0..sent.len() {
        let mut state = MachineState {
            pos: start,
            ip: 0,
            target: None,
            backtrack_stack: Vec::new(),
        };
        loop {
            let Some(instruction) = opcodes.get(state.ip) else {
                break;
            };
            match execute_instruction(instruction, &mut state, sent, ctx) {
                Ok(true) => {
                    if let Some(span) = state.target {
                        found.push(span);
                    }
                    if !backtrack(&mut state) {
                        break;
                    }
                }
                Ok(false) => state.ip += 1,
                Err(()) => {
                    if !backtrack(&mut state) {
                        break;
                    }
                }
            }
        }
    }
    found
}

fn execute_instruction(
    instruction: &Instruction,
    state: &mut MachineState,
    sent: &Sentence,
    ctx: &MatchContext,
) -> Result<bool, ()> {
    let token = sent.tokens.get(state.pos);
    let check = |ok: bool, state: &mut MachineState| {
        if ok {
            state.pos += 1;
            Ok(false)
        } else {
            Err(())
        }
    };

    match instruction {
        Instruction::Match => Ok(true),

        Instruction::CheckWord(w) => check(token.is_some_and(|t| ctx.same_text(&t.word, w)), state),
        Instruction::CheckLemma(l) => {
            check(token.is_some_and(|t| ctx.same_text(&t.lemma, l)), state)
        }
        Instruction::CheckLabel(l) => check(token.is_some_and(|t| t.is_labeled(l)), state),
        Instruction::CheckNer(n) => check(token.is_some_and(|t| t.ner == *n), state),

        Instruction::SkipFillers | Instruction::SkipStopWords => {
            let skippable = |t: &Token| match instruction {
                Instruction::SkipFillers => ctx.is_filler(t),
                _ => ctx.is_stop_word(t),
            };
            let run = sent.tokens[state.pos.min(sent.len())..]
                .iter()
                .take(MAX_GAP)
                .take_while(|&t| skippable(t))
                .count();
            // Prefer the shortest gap; longer ones are tried on backtrack.
            let alternatives: Vec<usize> = (1..=run).rev().map(|n| state.pos + n).collect();
            create_choice_point(state, alternatives);
            Ok(false)
        }

        Instruction::Target(spec) => {
            let run = sent.tokens[state.pos.min(sent.len())..]
                .iter()
                .take(spec.max_words)
                .take_while(|&t| target_accepts(spec, t))
                .count();
            if run == 0 {
                return Err(());
            }
            let start = state.pos;
            state.target = Some(Span::new(start, start + run));
            // Longest span first; shorter spans stay on the stack.
            let alternatives: Vec<usize> = (start + 1..start + run).collect();
            create_choice_point(state, alternatives);
            state.pos = start + run;
            Ok(false)
        }
    }
}

fn create_choice_point(state: &mut MachineState, alternatives: Vec<usize>) {
    if alternatives.is_empty() {
        return;
    }
    state.backtrack_stack.push(ChoicePoint {
        ip: state.ip,
        target: state.target,
        alternatives,
    });
}

fn backtrack(state: &mut MachineState) -> bool {
    while let Some(mut choice) = state.backtrack_stack.pop() {
        let Some(next) = choice.alternatives.pop() else {
            continue;
        };
        state.ip = choice.ip + 1;
        state.pos = next;
        // A target choice point rebinds the span end.
        state.target = choice.target;
        if let Some(span) = state.target.as_mut().filter(|s| s.end > next) {
            span.end = next;
        }
        if !choice.alternatives.is_empty() {
            state.backtrack_stack.push(choice);
        }
        return true;
    }
    false
}

/// Target spans reached through the pattern's dependency arc
///
/// The span is the target token extended leftwards over contiguous
/// compound, amod and flat dependents, up to `num_words_compound` tokens.
pub fn match_dependency(p: &DepPattern, sent: &Sentence, ctx: &MatchContext) -> Vec<Span> {
    let mut found = Vec::new();
    for (i, token) in sent.tokens.iter().enumerate() {
        if !target_accepts(&p.target, token) {
            continue;
        }
        let arc = match p.direction {
            DepDirection::Head => {
                token.deprel == p.relation
                    && token
                        .head
                        .and_then(|h| sent.tokens.get(h))
                        .is_some_and(|h| ctx.same_text(&h.lemma, &p.neighbour))
            }
            DepDirection::Child => sent.children(i).any(|c| {
                let child = &sent.tokens[c];
                child.deprel == p.relation && ctx.same_text(&child.lemma, &p.neighbour)
            }),
        };
        if arc {
            found.push(compound_span(sent, i, ctx.num_words_compound.max(1)));
        }
    }
    found
}

/// `head` plus the contiguous run of compound dependents to its left
pub fn compound_span(sent: &Sentence, head: usize, max_len: usize) -> Span {
    let mut start = head;
    while start > 0 && head + 1 - start < max_len {
        let prev = &sent.tokens[start - 1];
        if prev.head == Some(head) && COMPOUND_RELATIONS.contains(&prev.deprel.as_str()) {
            start -= 1;
        } else {
            break;
        }
    }
    Span::new(start, head + 1)
}
