//! Inverted sentence indices
//!
//! An index maps `(feature key, feature value)` to the ids of the sentences
//! containing a token with that value. Pattern application uses it to visit
//! only the sentences that can possibly match a pattern, before running the
//! matcher.
//!
//! Two backends share the [`SentenceIndex`] contract: [`InMemoryIndex`] keeps
//! all postings in hash maps, and [`PersistentIndex`] keeps one segment file
//! per feature key on disk and loads segments lazily on first query.
//!
//! Updates and queries are never interleaved within an iteration. Callers
//! issue every `add`/`update` first, then `finish_updating`, then query.

use crate::pattern::Pattern;
use crate::store::SentenceStore;
use crate::token::Token;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Token attribute an index entry is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKey {
    Word,
    Lemma,
    Pos,
    Ner,
    /// Normalized text after stop-word filtering
    Processed,
}

impl FeatureKey {
    pub const ALL: [FeatureKey; 5] = [
        FeatureKey::Word,
        FeatureKey::Lemma,
        FeatureKey::Pos,
        FeatureKey::Ner,
        FeatureKey::Processed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKey::Word => "word",
            FeatureKey::Lemma => "lemma",
            FeatureKey::Pos => "pos",
            FeatureKey::Ner => "ner",
            FeatureKey::Processed => "processed",
        }
    }
}

/// Which index implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Memory,
    Persistent,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: bad index file {path}: {source}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Index error: persistent index needs a directory")]
    MissingDirectory,
}

/// Sentence ids per pattern
pub type QueryResult = FxHashMap<Pattern, BTreeSet<String>>;

/// Inverted index contract shared by every backend
pub trait SentenceIndex: Send + Sync {
    /// Index every token of every sentence
    fn add(&mut self, sentences: &SentenceStore, add_processed: bool);

    /// Replace the entries of one sentence
    fn update(&mut self, tokens: &[Token], sent_id: &str);

    /// Make all previous `add`/`update` calls visible to queries
    fn finish_updating(&mut self) -> Result<(), IndexError>;

    /// Sentences with a token carrying `value` under `key`, borrowed when
    /// the backend holds them as one set
    fn term_postings(&self, key: FeatureKey, value: &str) -> Cow<'_, BTreeSet<String>>;

    fn lookup(&self, key: FeatureKey, value: &str) -> BTreeSet<String> {
        self.term_postings(key, value).into_owned()
    }

    /// Words never used to narrow a query
    fn stop_words(&self) -> &FxHashSet<String>;

    /// Number of indexed sentences
    fn num_sentences(&self) -> usize;

    fn save(&self, dir: &Path) -> Result<(), IndexError>;

    fn load(dir: &Path) -> Result<Self, IndexError>
    where
        Self: Sized;

    /// Sentences that may match each pattern
    ///
    /// The result for a pattern is the intersection of the postings of its
    /// relevant terms, stop words excluded. A pattern without any relevant
    /// term, or with a term absent from the index, gets an empty set.
    fn query_index(&self, patterns: &[Pattern]) -> QueryResult {
        let mut result = QueryResult::default();
        for pattern in patterns {
            let terms: Vec<(FeatureKey, String)> = pattern
                .relevant_terms()
                .into_iter()
                .map(|(k, v)| (k, v.to_lowercase()))
                .filter(|(_, v)| !self.stop_words().contains(v))
                .collect();

            let mut lists: Vec<Cow<'_, BTreeSet<String>>> = Vec::with_capacity(terms.len());
            for (key, value) in &terms {
                let found = self.term_postings(*key, value);
                if found.is_empty() {
                    lists.clear();
                    break;
                }
                lists.push(found);
            }
            lists.sort_by_key(|ids| ids.len());
            let sents = match lists.split_first() {
                Some((smallest, rest)) => smallest
                    .iter()
                    .filter(|id| rest.iter().all(|ids| ids.contains(*id)))
                    .cloned()
                    .collect(),
                None => BTreeSet::new(),
            };
            result.insert(pattern.clone(), sents);
        }
        result
    }
}

/// Terms a token contributes to the index, values lowercased
fn token_terms(token: &Token, add_processed: bool, stop_words: &FxHashSet<String>) -> Vec<(FeatureKey, String)> {
    let mut terms = vec![
        (FeatureKey::Word, token.word.to_lowercase()),
        (FeatureKey::Lemma, token.lemma.to_lowercase()),
        (FeatureKey::Pos, token.pos.to_lowercase()),
        (FeatureKey::Ner, token.ner.to_lowercase()),
    ];
    if add_processed {
        let processed = token
            .processed
            .as_deref()
            .map_or_else(|| token.word.to_lowercase(), str::to_lowercase);
        if !stop_words.contains(&processed) {
            terms.push((FeatureKey::Processed, processed));
        }
    }
    terms
}

fn sentence_terms(tokens: &[Token], add_processed: bool, stop_words: &FxHashSet<String>) -> BTreeSet<(FeatureKey, String)> {
    tokens
        .iter()
        .flat_map(|t| token_terms(t, add_processed, stop_words))
        .collect()
}

fn write_gz_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IndexError> {
    let file = File::create(path)?;
    let mut enc = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut enc, value).map_err(|source| IndexError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    enc.finish()?;
    Ok(())
}

fn read_gz_json<T: DeserializeOwned>(path: &Path) -> Result<T, IndexError> {
    let file = File::open(path)?;
    serde_json::from_reader(GzDecoder::new(BufReader::new(file))).map_err(|source| {
        IndexError::Format {
            path: path.to_path_buf(),
            source,
        }
    })
}

// ===== In-memory backend =====

#[derive(Serialize, Deserialize)]
struct MemoryIndexFile {
    stop_words: BTreeSet<String>,
    add_processed: bool,
    entries: Vec<(FeatureKey, String, BTreeSet<String>)>,
}

const MEMORY_INDEX_FILE: &str = "index.json.gz";

/// Hash-map inverted index
#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    postings: FxHashMap<(FeatureKey, String), BTreeSet<String>>,
    /// sentence id -> terms it was indexed under
    doc_terms: FxHashMap<String, BTreeSet<(FeatureKey, String)>>,
    stop_words: FxHashSet<String>,
    add_processed: bool,
}

impl InMemoryIndex {
    pub fn new(stop_words: FxHashSet<String>) -> Self {
        Self {
            stop_words,
            ..Self::default()
        }
    }

    fn remove_doc(&mut self, sent_id: &str) {
        if let Some(terms) = self.doc_terms.remove(sent_id) {
            for term in terms {
                if let Some(ids) = self.postings.get_mut(&term) {
                    ids.remove(sent_id);
                    if ids.is_empty() {
                        self.postings.remove(&term);
                    }
                }
            }
        }
    }

    fn insert_doc(&mut self, tokens: &[Token], sent_id: &str) {
        let terms = sentence_terms(tokens, self.add_processed, &self.stop_words);
        for term in &terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(sent_id.to_string());
        }
        self.doc_terms.insert(sent_id.to_string(), terms);
    }
}

impl SentenceIndex for InMemoryIndex {
    fn add(&mut self, sentences: &SentenceStore, add_processed: bool) {
        self.add_processed = add_processed;
        for sent in sentences.iter() {
            self.remove_doc(&sent.id);
            self.insert_doc(&sent.tokens, &sent.id);
        }
        debug!(
            sentences = self.doc_terms.len(),
            terms = self.postings.len(),
            "indexed sentences in memory"
        );
    }

    fn update(&mut self, tokens: &[Token], sent_id: &str) {
        self.remove_doc(sent_id);
        self.insert_doc(tokens, sent_id);
    }

    fn finish_updating(&mut self) -> Result<(), IndexError> {
        Ok(())
    }

    fn term_postings(&self, key: FeatureKey, value: &str) -> Cow<'_, BTreeSet<String>> {
        self.postings
            .get(&(key, value.to_string()))
            .map_or_else(|| Cow::Owned(BTreeSet::new()), Cow::Borrowed)
    }

    fn stop_words(&self) -> &FxHashSet<String> {
        &self.stop_words
    }

    fn num_sentences(&self) -> usize {
        self.doc_terms.len()
    }

    fn save(&self, dir: &Path) -> Result<(), IndexError> {
        std::fs::create_dir_all(dir)?;
        let mut entries: Vec<(FeatureKey, String, BTreeSet<String>)> = self
            .postings
            .iter()
            .map(|((k, v), ids)| (*k, v.clone(), ids.clone()))
            .collect();
        entries.sort();
        let file = MemoryIndexFile {
            stop_words: self.stop_words.iter().cloned().collect(),
            add_processed: self.add_processed,
            entries,
        };
        write_gz_json(&dir.join(MEMORY_INDEX_FILE), &file)
    }

    fn load(dir: &Path) -> Result<Self, IndexError> {
        let file: MemoryIndexFile = read_gz_json(&dir.join(MEMORY_INDEX_FILE))?;
        let mut index = Self::new(file.stop_words.into_iter().collect());
        index.add_processed = file.add_processed;
        for (key, value, ids) in file.entries {
            for id in &ids {
                index
                    .doc_terms
                    .entry(id.clone())
                    .or_default()
                    .insert((key, value.clone()));
            }
            index.postings.insert((key, value), ids);
        }
        Ok(index)
    }
}

// ===== Persistent backend =====

/// value -> sorted sentence ids, one per feature key
type Segment = BTreeMap<String, BTreeSet<String>>;

#[derive(Serialize, Deserialize)]
struct PersistentMeta {
    stop_words: BTreeSet<String>,
    add_processed: bool,
    sentences: BTreeSet<String>,
}

const META_FILE: &str = "meta.json";

fn segment_path(dir: &Path, key: FeatureKey) -> PathBuf {
    dir.join(format!("{}.json.gz", key.as_str()))
}

/// Directory-backed inverted index
///
/// Committed postings live in one gzip JSON segment per feature key. Updates
/// accumulate in a pending delta; ids updated since the last flush are
/// tombstoned so their committed postings are ignored. `finish_updating`
/// merges the delta into the segments.
#[derive(Debug)]
pub struct PersistentIndex {
    dir: PathBuf,
    segments: FxHashMap<FeatureKey, OnceLock<Segment>>,
    pending: FxHashMap<(FeatureKey, String), BTreeSet<String>>,
    /// sentence id -> terms it holds in `pending`
    pending_terms: FxHashMap<String, BTreeSet<(FeatureKey, String)>>,
    tombstones: FxHashSet<String>,
    sentences: BTreeSet<String>,
    stop_words: FxHashSet<String>,
    add_processed: bool,
}

impl PersistentIndex {
    /// Start an empty index in `dir`, removing any segments already there
    pub fn create(dir: &Path, stop_words: FxHashSet<String>) -> Result<Self, IndexError> {
        std::fs::create_dir_all(dir)?;
        for key in FeatureKey::ALL {
            let path = segment_path(dir, key);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        let index = Self {
            dir: dir.to_path_buf(),
            segments: Self::empty_cells(),
            pending: FxHashMap::default(),
            pending_terms: FxHashMap::default(),
            tombstones: FxHashSet::default(),
            sentences: BTreeSet::new(),
            stop_words,
            add_processed: false,
        };
        index.write_meta(dir)?;
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn empty_cells() -> FxHashMap<FeatureKey, OnceLock<Segment>> {
        FeatureKey::ALL.iter().map(|k| (*k, OnceLock::new())).collect()
    }

    /// Committed segment for `key`, read from disk on first use
    fn segment(&self, key: FeatureKey) -> Option<&Segment> {
        let cell = self.segments.get(&key)?;
        Some(cell.get_or_init(|| {
            let path = segment_path(&self.dir, key);
            if !path.exists() {
                return Segment::new();
            }
            match read_gz_json(&path) {
                Ok(segment) => segment,
                Err(e) => {
                    warn!("Unreadable index segment {:?}: {}", path, e);
                    Segment::new()
                }
            }
        }))
    }

    fn write_meta(&self, dir: &Path) -> Result<(), IndexError> {
        let meta = PersistentMeta {
            stop_words: self.stop_words.iter().cloned().collect(),
            add_processed: self.add_processed,
            sentences: self.sentences.clone(),
        };
        let path = dir.join(META_FILE);
        let file = File::create(&path)?;
        serde_json::to_writer(BufWriter::new(file), &meta)
            .map_err(|source| IndexError::Format { path, source })
    }

    /// Committed postings with tombstones removed and pending entries added
    fn merged_segment(&self, key: FeatureKey) -> Segment {
        let mut merged = self.segment(key).cloned().unwrap_or_default();
        if !self.tombstones.is_empty() {
            for ids in merged.values_mut() {
                ids.retain(|id| !self.tombstones.contains(id));
            }
            merged.retain(|_, ids| !ids.is_empty());
        }
        for ((k, value), ids) in &self.pending {
            if *k == key {
                merged.entry(value.clone()).or_default().extend(ids.iter().cloned());
            }
        }
        merged
    }

    fn write_segments(&self, dir: &Path) -> Result<(), IndexError> {
        for key in FeatureKey::ALL {
            write_gz_json(&segment_path(dir, key), &self.merged_segment(key))?;
        }
        self.write_meta(dir)
    }
}

impl SentenceIndex for PersistentIndex {
    fn add(&mut self, sentences: &SentenceStore, add_processed: bool) {
        self.add_processed = add_processed;
        for sent in sentences.iter() {
            self.update(&sent.tokens, &sent.id);
        }
    }

    fn update(&mut self, tokens: &[Token], sent_id: &str) {
        if let Some(terms) = self.pending_terms.remove(sent_id) {
            for term in terms {
                if let Some(ids) = self.pending.get_mut(&term) {
                    ids.remove(sent_id);
                    if ids.is_empty() {
                        self.pending.remove(&term);
                    }
                }
            }
        }
        self.tombstones.insert(sent_id.to_string());
        self.sentences.insert(sent_id.to_string());
        let terms = sentence_terms(tokens, self.add_processed, &self.stop_words);
        for term in &terms {
            self.pending
                .entry(term.clone())
                .or_default()
                .insert(sent_id.to_string());
        }
        self.pending_terms.insert(sent_id.to_string(), terms);
    }

    fn finish_updating(&mut self) -> Result<(), IndexError> {
        if self.pending.is_empty() && self.tombstones.is_empty() {
            return Ok(());
        }
        self.write_segments(&self.dir)?;
        debug!(
            dir = ?self.dir,
            updated = self.tombstones.len(),
            "flushed index segments"
        );
        self.pending.clear();
        self.pending_terms.clear();
        self.tombstones.clear();
        self.segments = Self::empty_cells();
        Ok(())
    }

    fn term_postings(&self, key: FeatureKey, value: &str) -> Cow<'_, BTreeSet<String>> {
        let committed = self.segment(key).and_then(|seg| seg.get(value));
        let pending = self.pending.get(&(key, value.to_string()));
        match (committed, pending) {
            (Some(ids), None) if self.tombstones.is_empty() => Cow::Borrowed(ids),
            (None, Some(ids)) => Cow::Borrowed(ids),
            (None, None) => Cow::Owned(BTreeSet::new()),
            (committed, pending) => {
                let mut ids: BTreeSet<String> = committed
                    .into_iter()
                    .flatten()
                    .filter(|id| !self.tombstones.contains(*id))
                    .cloned()
                    .collect();
                ids.extend(pending.into_iter().flatten().cloned());
                Cow::Owned(ids)
            }
        }
    }

    fn stop_words(&self) -> &FxHashSet<String> {
        &self.stop_words
    }

    fn num_sentences(&self) -> usize {
        self.sentences.len()
    }

    fn save(&self, dir: &Path) -> Result<(), IndexError> {
        std::fs::create_dir_all(dir)?;
        self.write_segments(dir)
    }

    fn load(dir: &Path) -> Result<Self, IndexError> {
        let path = dir.join(META_FILE);
        let file = File::open(&path)?;
        let meta: PersistentMeta = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| IndexError::Format { path, source })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            segments: Self::empty_cells(),
            pending: FxHashMap::default(),
            pending_terms: FxHashMap::default(),
            tombstones: FxHashSet::default(),
            sentences: meta.sentences,
            stop_words: meta.stop_words.into_iter().collect(),
            add_processed: meta.add_processed,
        })
    }
}

/// Build an empty index for `backend`
///
/// The persistent backend stores its segments under `dir`.
pub fn new_index(
    backend: IndexBackend,
    dir: Option<&Path>,
    stop_words: FxHashSet<String>,
) -> Result<Box<dyn SentenceIndex>, IndexError> {
    match backend {
        IndexBackend::Memory => Ok(Box::new(InMemoryIndex::new(stop_words))),
        IndexBackend::Persistent => {
            let dir = dir.ok_or(IndexError::MissingDirectory)?;
            Ok(Box::new(PersistentIndex::create(dir, stop_words)?))
        }
    }
}

/// Load a saved index for `backend` from `dir`
pub fn load_index(backend: IndexBackend, dir: &Path) -> Result<Box<dyn SentenceIndex>, IndexError> {
    match backend {
        IndexBackend::Memory => Ok(Box::new(InMemoryIndex::load(dir)?)),
        IndexBackend::Persistent => Ok(Box::new(PersistentIndex::load(dir)?)),
    }
}
