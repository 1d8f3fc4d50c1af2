//! Pattern language parser
//!
//! Parses the `Display` form of a [`Pattern`] back into a pattern using a pest
//! grammar. Used for seed patterns in the configuration and for
//! ignore-pattern files.

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;
use thiserror::Error;

use crate::pattern::{ContextToken, DepDirection, DepPattern, Pattern, SurfacePattern, TargetSpec};

#[derive(Parser)]
#[grammar = "pattern_grammar.pest"]
struct PatternParser;

/// Error type for pattern parsing failures
#[derive(Debug, Error)]
pub enum PatternParseError {
    #[error("Pattern error: {0}")]
    Syntax(#[from] Box<pest::error::Error<Rule>>),

    #[error("Pattern error: bad restriction {key}:{value}")]
    BadRestriction { key: String, value: String },

    #[error("Pattern error: unexpected input {0:?}")]
    Unexpected(String),
}

impl From<pest::error::Error<Rule>> for PatternParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        PatternParseError::Syntax(Box::new(err))
    }
}

/// Parse a pattern string
pub fn parse_pattern(input: &str) -> Result<Pattern, PatternParseError> {
    let mut pairs = PatternParser::parse(Rule::pattern, input.trim())?;
    let Some(top) = pairs.next() else {
        return Err(PatternParseError::Unexpected(input.to_string()));
    };

    for pair in top.into_inner() {
        match pair.as_rule() {
            Rule::surface_pattern => return parse_surface(pair),
            Rule::dep_pattern => return parse_dep(pair),
            _ => {}
        }
    }
    Err(PatternParseError::Unexpected(input.to_string()))
}

fn parse_surface(pair: Pair<Rule>) -> Result<Pattern, PatternParseError> {
    let mut prev = Vec::new();
    let mut next = Vec::new();
    let mut target = None;

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::context => {
                let token = parse_context(item)?;
                if target.is_none() {
                    prev.push(token);
                } else {
                    next.push(token);
                }
            }
            Rule::target => target = Some(parse_target(item)?),
            _ => return Err(PatternParseError::Unexpected(item.as_str().to_string())),
        }
    }

    let target = target.ok_or_else(|| PatternParseError::Unexpected("missing TARGET".into()))?;
    Ok(Pattern::Surface(SurfacePattern { prev, target, next }))
}

fn parse_context(pair: Pair<Rule>) -> Result<ContextToken, PatternParseError> {
    let text = pair.as_str().to_string();
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| PatternParseError::Unexpected(text.clone()))?;

    match inner.as_rule() {
        Rule::filler => Ok(ContextToken::Filler),
        Rule::stopword => Ok(ContextToken::StopWord),
        Rule::slot => {
            let mut parts = inner.into_inner();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                return Err(PatternParseError::Unexpected(text));
            };
            let value = unescape(value);
            match key.as_str() {
                "w" => Ok(ContextToken::Word(value)),
                "l" => Ok(ContextToken::Lemma(value)),
                "label" => Ok(ContextToken::Label(value)),
                "ner" => Ok(ContextToken::Ner(value)),
                _ => Err(PatternParseError::Unexpected(text)),
            }
        }
        _ => Err(PatternParseError::Unexpected(text)),
    }
}

fn parse_target(pair: Pair<Rule>) -> Result<TargetSpec, PatternParseError> {
    let mut spec = TargetSpec::default();

    for restriction in pair.into_inner() {
        let mut parts = restriction.into_inner();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let raw = value.as_str().to_string();
        let text = if value.as_rule() == Rule::string {
            unescape(value)
        } else {
            raw.clone()
        };
        match key.as_str() {
            "pos" => spec.pos = Some(text),
            "ner" => spec.ner = Some(text),
            "parent" => spec.parent = Some(text),
            "n" => {
                spec.max_words = raw
                    .parse()
                    .ok()
                    .filter(|&n: &usize| n > 0)
                    .ok_or_else(|| PatternParseError::BadRestriction {
                        key: "n".into(),
                        value: raw.clone(),
                    })?;
            }
            other => {
                return Err(PatternParseError::BadRestriction {
                    key: other.to_string(),
                    value: raw,
                });
            }
        }
    }

    Ok(spec)
}

fn parse_dep(pair: Pair<Rule>) -> Result<Pattern, PatternParseError> {
    let text = pair.as_str().to_string();
    let mut inner = pair.into_inner();
    let (Some(target), Some(arc), Some(neighbour)) = (inner.next(), inner.next(), inner.next())
    else {
        return Err(PatternParseError::Unexpected(text));
    };

    let target = parse_target(target)?;
    let mut arc_parts = arc.into_inner();
    let (Some(direction), Some(relation)) = (arc_parts.next(), arc_parts.next()) else {
        return Err(PatternParseError::Unexpected(text));
    };
    let direction = if direction.as_str() == "<" {
        DepDirection::Head
    } else {
        DepDirection::Child
    };
    let neighbour = neighbour
        .into_inner()
        .next()
        .map(unescape)
        .ok_or_else(|| PatternParseError::Unexpected(text.clone()))?;

    Ok(Pattern::Dependency(DepPattern {
        direction,
        relation: relation.as_str().to_string(),
        neighbour,
        target,
    }))
}

/// Contents of a `string` pair with escapes resolved
fn unescape(pair: Pair<Rule>) -> String {
    let raw = pair
        .into_inner()
        .next()
        .map(|inner| inner.as_str())
        .unwrap_or_default();
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}
