//! Seed dictionaries, word lists and external statistics files
//!
//! All readers accept plain or gzip files. Malformed lines are skipped with
//! a warning; only I/O failures are errors.

use crate::conllu::open_maybe_gz;
use crate::pattern::Pattern;
use crate::pattern_parse::parse_pattern;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Seed error: {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Seed error: bad JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Non-empty, non-comment lines of a file, trimmed
fn content_lines(path: &Path) -> Result<Vec<String>, SeedError> {
    let io_err = |source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = open_maybe_gz(path).map_err(io_err)?;
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(io_err)?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        lines.push(line.to_string());
    }
    Ok(lines)
}

/// Parse a `label,file[,file];label,file` manifest
pub fn parse_manifest(manifest: &str) -> Vec<(String, Vec<PathBuf>)> {
    let mut entries = Vec::new();
    for item in manifest.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = item.split(',').map(str::trim);
        let label = parts.next().unwrap_or_default();
        let files: Vec<PathBuf> = parts.filter(|f| !f.is_empty()).map(PathBuf::from).collect();
        if label.is_empty() || files.is_empty() {
            warn!("Skipping malformed manifest entry {:?}", item);
            continue;
        }
        entries.push((label.to_string(), files));
    }
    entries
}

/// Phrases of one seed file: text before the first tab of each line
pub fn read_phrase_file(path: &Path) -> Result<Vec<String>, SeedError> {
    Ok(content_lines(path)?
        .into_iter()
        .filter_map(|line| {
            let phrase = line.split('\t').next().unwrap_or_default().trim().to_string();
            (!phrase.is_empty()).then_some(phrase)
        })
        .collect())
}

/// Seed phrases per label from a manifest
pub fn read_seed_manifest(manifest: &str) -> Result<BTreeMap<String, BTreeSet<String>>, SeedError> {
    let mut seeds: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (label, files) in parse_manifest(manifest) {
        let entry = seeds.entry(label.clone()).or_default();
        for file in files {
            entry.extend(read_phrase_file(&file)?);
        }
        debug!(label = %label, seeds = entry.len(), "read seed words");
    }
    Ok(seeds)
}

/// Seeds as a JSON object `{label: [phrase, ...]}`
pub fn read_json_seeds(path: &Path) -> Result<BTreeMap<String, BTreeSet<String>>, SeedError> {
    let reader = open_maybe_gz(path).map_err(|source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(reader).map_err(|source| SeedError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Union of lowercased words from several list files
pub fn read_word_lists(paths: &[PathBuf]) -> Result<FxHashSet<String>, SeedError> {
    let mut words = FxHashSet::default();
    for path in paths {
        for line in read_phrase_file(path)? {
            words.insert(line.to_lowercase());
        }
    }
    Ok(words)
}

/// Split a `key<TAB>value` line
fn key_value(line: &str, sep: char) -> Option<(&str, &str)> {
    let (k, v) = line.rsplit_once(sep)?;
    let (k, v) = (k.trim(), v.trim());
    (!k.is_empty() && !v.is_empty()).then_some((k, v))
}

/// Word class clusters: `word<TAB>cluster-id`
pub fn read_clusters(path: &Path) -> Result<FxHashMap<String, i32>, SeedError> {
    let mut clusters = FxHashMap::default();
    for line in content_lines(path)? {
        match key_value(&line, '\t').and_then(|(w, c)| Some((w, atoi::atoi::<i32>(c.as_bytes())?))) {
            Some((word, id)) => {
                clusters.insert(word.to_string(), id);
            }
            None => warn!("Skipping malformed cluster line {:?} in {:?}", line, path),
        }
    }
    Ok(clusters)
}

/// Phrase frequencies: `phrase<TAB>count`
pub fn read_ngram_counts(path: &Path) -> Result<FxHashMap<String, f64>, SeedError> {
    let mut counts = FxHashMap::default();
    for line in content_lines(path)? {
        match key_value(&line, '\t').and_then(|(p, c)| Some((p, c.parse::<f64>().ok()?))) {
            Some((phrase, count)) => {
                *counts.entry(phrase.to_string()).or_insert(0.0) += count;
            }
            None => warn!("Skipping malformed n-gram line {:?} in {:?}", line, path),
        }
    }
    Ok(counts)
}

/// Per-cluster weights: `Cluster-N:weight`
pub fn read_cluster_weights(path: &Path) -> Result<FxHashMap<i32, f64>, SeedError> {
    let mut weights = FxHashMap::default();
    for line in content_lines(path)? {
        let parsed = key_value(&line, ':').and_then(|(k, w)| {
            let id = atoi::atoi::<i32>(k.strip_prefix("Cluster-")?.as_bytes())?;
            Some((id, w.parse::<f64>().ok()?))
        });
        match parsed {
            Some((id, w)) => {
                weights.insert(id, w);
            }
            None => warn!("Skipping malformed cluster weight {:?} in {:?}", line, path),
        }
    }
    Ok(weights)
}

/// Gold judgements: `phrase<TAB>1|0`
pub fn read_gold_entities(path: &Path) -> Result<BTreeMap<String, bool>, SeedError> {
    let mut gold = BTreeMap::new();
    for line in content_lines(path)? {
        match key_value(&line, '\t') {
            Some((phrase, "1")) => {
                gold.insert(phrase.to_string(), true);
            }
            Some((phrase, "0")) => {
                gold.insert(phrase.to_string(), false);
            }
            _ => warn!("Skipping malformed gold line {:?} in {:?}", line, path),
        }
    }
    Ok(gold)
}

/// Patterns never to select, one per line in the pattern language
pub fn read_patterns(path: &Path) -> Result<Vec<Pattern>, SeedError> {
    let mut patterns = Vec::new();
    for line in content_lines(path)? {
        let text = line.split('\t').next().unwrap_or_default();
        match parse_pattern(text) {
            Ok(p) => patterns.push(p),
            Err(e) => warn!("Skipping unparsable pattern {:?}: {}", text, e),
        }
    }
    Ok(patterns)
}
