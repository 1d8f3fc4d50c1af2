//! Sentence storage and corpus iteration
//!
//! `SentenceStore` owns the annotated sentences, keyed by sentence id and kept
//! in id order so every pass over the corpus is deterministic.
//!
//! `Corpus` is the view the bootstrap loop works through. It either holds one
//! in-memory store, or a list of batch files on disk (gzip JSON) that are
//! loaded one at a time. Mutating passes write a batch back before the next
//! one is loaded, so memory is bounded by a single batch.

use crate::conllu::{self, CorpusFormat};
use crate::token::Sentence;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: bad batch file {path}: {source}")]
    Batch {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Store error: {0}")]
    Glob(#[from] glob::PatternError),
}

/// Ordered map from sentence id to sentence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentenceStore {
    sents: BTreeMap<String, Sentence>,
}

impl SentenceStore {
    pub fn new() -> Self {
        Self {
            sents: BTreeMap::new(),
        }
    }

    pub fn from_sentences(sentences: impl IntoIterator<Item = Sentence>) -> Self {
        let mut store = Self::new();
        store.extend(sentences);
        store
    }

    pub fn insert(&mut self, sentence: Sentence) -> Option<Sentence> {
        self.sents.insert(sentence.id.clone(), sentence)
    }

    pub fn extend(&mut self, sentences: impl IntoIterator<Item = Sentence>) {
        for s in sentences {
            self.insert(s);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Sentence> {
        self.sents.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Sentence> {
        self.sents.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sents.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> + '_ {
        self.sents.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sentence> + '_ {
        self.sents.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Sentence> + '_ {
        self.sents.values_mut()
    }

    /// Split sentence ids into `n` contiguous, non-overlapping batches
    ///
    /// Batches differ in size by at most one. Fewer than `n` batches are
    /// returned when there are fewer sentences than workers.
    pub fn thread_batches(&self, n: usize) -> Vec<Vec<String>> {
        let n = n.max(1);
        let ids: Vec<String> = self.sents.keys().cloned().collect();
        if ids.is_empty() {
            return Vec::new();
        }
        let base = ids.len() / n;
        let extra = ids.len() % n;
        let mut batches = Vec::with_capacity(n);
        let mut start = 0;
        for i in 0..n {
            let size = base + usize::from(i < extra);
            if size == 0 {
                break;
            }
            batches.push(ids[start..start + size].to_vec());
            start += size;
        }
        batches
    }

    /// Write the store as gzip-compressed JSON
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let file = File::create(path)?;
        let mut enc = GzEncoder::new(BufWriter::new(file), Compression::default());
        let sents: Vec<&Sentence> = self.sents.values().collect();
        serde_json::to_writer(&mut enc, &sents).map_err(|source| StoreError::Batch {
            path: path.to_path_buf(),
            source,
        })?;
        enc.finish()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        let dec = GzDecoder::new(BufReader::new(file));
        let sents: Vec<Sentence> =
            serde_json::from_reader(dec).map_err(|source| StoreError::Batch {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_sentences(sents))
    }
}

impl IntoIterator for SentenceStore {
    type Item = Sentence;
    type IntoIter = std::collections::btree_map::IntoValues<String, Sentence>;

    fn into_iter(self) -> Self::IntoIter {
        self.sents.into_values()
    }
}

/// Where the corpus lives
#[derive(Debug)]
enum CorpusSource {
    /// Whole corpus in memory
    InMemory(SentenceStore),
    /// One gzip JSON batch per input file
    Batched(Vec<PathBuf>),
}

/// The annotated corpus, in memory or as on-disk batches
#[derive(Debug)]
pub struct Corpus {
    source: CorpusSource,
}

impl Corpus {
    pub fn in_memory(store: SentenceStore) -> Self {
        Self {
            source: CorpusSource::InMemory(store),
        }
    }

    /// Use existing batch files
    pub fn from_batches(paths: Vec<PathBuf>) -> Self {
        Self {
            source: CorpusSource::Batched(paths),
        }
    }

    /// Read corpus files
    ///
    /// With a `batch_dir`, each input file becomes one batch saved under that
    /// directory and only one batch is held in memory at a time. Files that
    /// cannot be read are skipped with a warning.
    pub fn from_files(
        paths: &[PathBuf],
        format: CorpusFormat,
        batch_dir: Option<&Path>,
    ) -> Result<Self, StoreError> {
        match batch_dir {
            None => {
                let mut store = SentenceStore::new();
                for path in paths {
                    match conllu::read_file(path, format) {
                        Ok(sents) => store.extend(sents),
                        Err(e) => warn!("Failed to read {:?}: {}", path, e),
                    }
                }
                Ok(Self::in_memory(store))
            }
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let mut batches = Vec::new();
                for (i, path) in paths.iter().enumerate() {
                    let sents = match conllu::read_file(path, format) {
                        Ok(sents) => sents,
                        Err(e) => {
                            warn!("Failed to read {:?}: {}", path, e);
                            continue;
                        }
                    };
                    let batch_path = dir.join(format!("batch-{:05}.json.gz", i));
                    SentenceStore::from_sentences(sents).save(&batch_path)?;
                    batches.push(batch_path);
                }
                debug!(batches = batches.len(), "wrote corpus batches");
                Ok(Self::from_batches(batches))
            }
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self.source, CorpusSource::Batched(_))
    }

    /// Run `f` over each batch
    pub fn for_each_batch<E, F>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&SentenceStore) -> Result<(), E>,
        E: From<StoreError>,
    {
        match &self.source {
            CorpusSource::InMemory(store) => f(store),
            CorpusSource::Batched(paths) => {
                for path in paths {
                    let store = SentenceStore::load(path)?;
                    f(&store)?;
                }
                Ok(())
            }
        }
    }

    /// Run `f` over each batch, writing back batches for which it returns true
    pub fn for_each_batch_mut<E, F>(&mut self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&mut SentenceStore) -> Result<bool, E>,
        E: From<StoreError>,
    {
        match &mut self.source {
            CorpusSource::InMemory(store) => f(store).map(|_| ()),
            CorpusSource::Batched(paths) => {
                for path in paths.iter() {
                    let mut store = SentenceStore::load(path)?;
                    if f(&mut store)? {
                        store.save(path)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Total number of sentences
    pub fn num_sentences(&self) -> Result<usize, StoreError> {
        let mut n = 0;
        self.for_each_batch(|store| {
            n += store.len();
            Ok::<(), StoreError>(())
        })?;
        Ok(n)
    }

    /// Copy of the whole corpus as one store
    pub fn to_store(&self) -> Result<SentenceStore, StoreError> {
        let mut all = SentenceStore::new();
        self.for_each_batch(|store| {
            all.extend(store.iter().cloned());
            Ok::<(), StoreError>(())
        })?;
        Ok(all)
    }

    /// In-memory store, if the corpus is not batched
    pub fn store(&self) -> Option<&SentenceStore> {
        match &self.source {
            CorpusSource::InMemory(store) => Some(store),
            CorpusSource::Batched(_) => None,
        }
    }

    pub fn store_mut(&mut self) -> Option<&mut SentenceStore> {
        match &mut self.source {
            CorpusSource::InMemory(store) => Some(store),
            CorpusSource::Batched(_) => None,
        }
    }
}
