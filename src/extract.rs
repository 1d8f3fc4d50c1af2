//! Per-token pattern extraction
//!
//! The extractor runs a [`PatternFactory`] over every token of the corpus
//! once and records which patterns fire where. Patterns are interned to
//! small integer ids so the per-token sets stay compact. After relabeling,
//! only the tokens near a changed label are recomputed.

use crate::factory::PatternFactory;
use crate::pattern::Pattern;
use crate::store::SentenceStore;
use crate::token::Sentence;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Extract error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Extract error: bad pattern file {path}: {source}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Interned pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId(pub u32);

/// Two-way map between patterns and their ids
#[derive(Debug, Clone, Default)]
pub struct PatternInterner {
    ids: FxHashMap<Pattern, PatternId>,
    patterns: Vec<Pattern>,
}

impl PatternInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, pattern: Pattern) -> PatternId {
        if let Some(id) = self.ids.get(&pattern) {
            return *id;
        }
        let id = PatternId(self.patterns.len() as u32);
        self.patterns.push(pattern.clone());
        self.ids.insert(pattern, id);
        id
    }

    pub fn get(&self, pattern: &Pattern) -> Option<PatternId> {
        self.ids.get(pattern).copied()
    }

    /// Pattern for an id handed out by this interner
    pub fn pattern(&self, id: PatternId) -> &Pattern {
        &self.patterns[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PatternId, &Pattern)> + '_ {
        self.patterns
            .iter()
            .enumerate()
            .map(|(i, p)| (PatternId(i as u32), p))
    }
}

/// Token position -> patterns firing there
pub type TokenPatterns = BTreeMap<usize, BTreeSet<PatternId>>;

/// Patterns firing at every token of every sentence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternsForEachToken {
    sents: BTreeMap<String, TokenPatterns>,
}

#[derive(Serialize, Deserialize)]
struct PatternsFile {
    patterns: Vec<Pattern>,
    sents: BTreeMap<String, BTreeMap<usize, Vec<PatternId>>>,
}

impl PatternsForEachToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sent_id: &str) -> Option<&TokenPatterns> {
        self.sents.get(sent_id)
    }

    pub fn at(&self, sent_id: &str, i: usize) -> Option<&BTreeSet<PatternId>> {
        self.sents.get(sent_id).and_then(|t| t.get(&i))
    }

    pub fn contains(&self, sent_id: &str) -> bool {
        self.sents.contains_key(sent_id)
    }

    pub fn insert(&mut self, sent_id: &str, patterns: TokenPatterns) {
        self.sents.insert(sent_id.to_string(), patterns);
    }

    pub fn len(&self) -> usize {
        self.sents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sents.is_empty()
    }

    /// Write the patterns and per-token sets as gzip JSON
    pub fn save(&self, interner: &PatternInterner, path: &Path) -> Result<(), ExtractError> {
        let file = PatternsFile {
            patterns: interner.patterns.clone(),
            sents: self
                .sents
                .iter()
                .map(|(id, toks)| {
                    let toks = toks
                        .iter()
                        .map(|(i, set)| (*i, set.iter().copied().collect()))
                        .collect();
                    (id.clone(), toks)
                })
                .collect(),
        };
        let mut enc = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
        serde_json::to_writer(&mut enc, &file).map_err(|source| ExtractError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        enc.finish()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<(PatternInterner, Self), ExtractError> {
        let dec = GzDecoder::new(BufReader::new(File::open(path)?));
        let file: PatternsFile = serde_json::from_reader(dec).map_err(|source| {
            ExtractError::Format {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let mut interner = PatternInterner::new();
        for p in file.patterns {
            interner.intern(p);
        }
        let sents = file
            .sents
            .into_iter()
            .map(|(id, toks)| {
                let toks = toks
                    .into_iter()
                    .map(|(i, ids)| (i, ids.into_iter().collect()))
                    .collect();
                (id, toks)
            })
            .collect();
        Ok((interner, Self { sents }))
    }
}

/// Runs a pattern factory over the corpus
pub struct ContextPatternExtractor<'a> {
    factory: &'a dyn PatternFactory,
}

impl<'a> ContextPatternExtractor<'a> {
    pub fn new(factory: &'a dyn PatternFactory) -> Self {
        Self { factory }
    }

    /// Patterns for every token of one sentence
    pub fn sentence_patterns(&self, sent: &Sentence) -> BTreeMap<usize, BTreeSet<Pattern>> {
        (0..sent.len())
            .map(|i| (i, self.factory.context_for(sent, i)))
            .filter(|(_, pats)| !pats.is_empty())
            .collect()
    }

    /// Compute patterns for every sentence in `store`
    ///
    /// Sentences are split into one contiguous batch per pool thread; each
    /// worker returns its patterns and they are interned afterwards.
    pub fn extract(
        &self,
        store: &SentenceStore,
        pool: &rayon::ThreadPool,
        interner: &mut PatternInterner,
        out: &mut PatternsForEachToken,
    ) {
        let batches = store.thread_batches(pool.current_num_threads());
        let results: Vec<Vec<(String, BTreeMap<usize, BTreeSet<Pattern>>)>> = pool.install(|| {
            batches
                .par_iter()
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| store.get(id))
                        .map(|sent| (sent.id.clone(), self.sentence_patterns(sent)))
                        .collect()
                })
                .collect()
        });

        for (sent_id, toks) in results.into_iter().flatten() {
            out.insert(&sent_id, intern_all(interner, toks));
        }
        debug!(
            sentences = out.len(),
            patterns = interner.len(),
            "extracted token patterns"
        );
    }

    /// Recompute patterns within `radius` tokens of each changed position
    pub fn recompute(
        &self,
        sent: &Sentence,
        changed: &BTreeSet<usize>,
        radius: usize,
        interner: &mut PatternInterner,
        out: &mut PatternsForEachToken,
    ) {
        let mut toks = out.sents.remove(&sent.id).unwrap_or_default();
        let affected: BTreeSet<usize> = changed
            .iter()
            .flat_map(|&i| i.saturating_sub(radius)..(i + radius + 1).min(sent.len()))
            .collect();
        for i in affected {
            let pats = self.factory.context_for(sent, i);
            if pats.is_empty() {
                toks.remove(&i);
            } else {
                toks.insert(i, pats.into_iter().map(|p| interner.intern(p)).collect());
            }
        }
        out.insert(&sent.id, toks);
    }
}

fn intern_all(
    interner: &mut PatternInterner,
    toks: BTreeMap<usize, BTreeSet<Pattern>>,
) -> TokenPatterns {
    toks.into_iter()
        .map(|(i, pats)| (i, pats.into_iter().map(|p| interner.intern(p)).collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{FactoryWords, SurfaceOptions, SurfacePatternFactory};

    fn factory() -> SurfacePatternFactory {
        SurfacePatternFactory::new(
            SurfaceOptions {
                min_window: 1,
                max_window: 1,
                use_next_context: true,
                use_pos: false,
                use_filler_words: false,
                ..SurfaceOptions::default()
            },
            FactoryWords::default(),
        )
    }

    fn make_store() -> SentenceStore {
        SentenceStore::from_sentences([
            Sentence::from_tagged("s1", "patients with flu and pneumonia"),
            Sentence::from_tagged("s2", "cases with pneumonia and cough"),
        ])
    }

    fn pool(n: usize) -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(n).build().unwrap()
    }

    #[test]
    fn test_interner() {
        let mut interner = PatternInterner::new();
        let p = crate::pattern_parse::parse_pattern(r#"[l:"with"] {TARGET}"#).unwrap();
        let a = interner.intern(p.clone());
        let b = interner.intern(p.clone());
        assert_eq!(a, b);
        assert_eq!(interner.len(), 1);
        assert_eq!(interner.pattern(a), &p);
    }

    #[test]
    fn test_extract_independent_of_threads() {
        let f = factory();
        let extractor = ContextPatternExtractor::new(&f);
        let store = make_store();

        let mut one = (PatternInterner::new(), PatternsForEachToken::new());
        extractor.extract(&store, &pool(1), &mut one.0, &mut one.1);
        let mut many = (PatternInterner::new(), PatternsForEachToken::new());
        extractor.extract(&store, &pool(3), &mut many.0, &mut many.1);

        let resolve = |(interner, pft): &(PatternInterner, PatternsForEachToken), id: &str, i| {
            pft.at(id, i)
                .map(|set| set.iter().map(|p| interner.pattern(*p).clone()).collect::<BTreeSet<_>>())
        };
        for i in 0..5 {
            assert_eq!(resolve(&one, "s1", i), resolve(&many, "s1", i));
        }
        assert!(one.1.at("s1", 2).is_some_and(|s| s.len() == 3));
    }

    #[test]
    fn test_recompute_after_label() {
        let f = factory();
        let extractor = ContextPatternExtractor::new(&f);
        let mut store = make_store();
        let mut interner = PatternInterner::new();
        let mut pft = PatternsForEachToken::new();
        extractor.extract(&store, &pool(1), &mut interner, &mut pft);
        let before = pft.at("s1", 3).cloned();

        let sent = store.get_mut("s1").unwrap();
        sent.tokens[2].set_label("DISEASE", true);
        let changed: BTreeSet<usize> = [2].into_iter().collect();
        extractor.recompute(sent, &changed, 1, &mut interner, &mut pft);

        let after = pft.at("s1", 3).cloned();
        assert_ne!(before, after);
        let label_slot = after
            .unwrap()
            .iter()
            .any(|id| interner.pattern(*id).to_string().contains("[label:\"DISEASE\"]"));
        assert!(label_slot);
    }

    #[test]
    fn test_save_load() {
        let f = factory();
        let extractor = ContextPatternExtractor::new(&f);
        let mut interner = PatternInterner::new();
        let mut pft = PatternsForEachToken::new();
        extractor.extract(&make_store(), &pool(2), &mut interner, &mut pft);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json.gz");
        pft.save(&interner, &path).unwrap();
        let (loaded_interner, loaded) = PatternsForEachToken::load(&path).unwrap();
        assert_eq!(loaded, pft);
        assert_eq!(loaded_interner.len(), interner.len());
    }
}
