//! Run outputs and saved models
//!
//! Per-label text files are `text<TAB>score` lines, best first. The JSON
//! files are meant for programmatic consumption and use plain strings for
//! phrases and patterns.

use crate::counter::Counter;
use crate::pattern_parse::{PatternParseError, parse_pattern};
use crate::phrase::CandidatePhrase;
use crate::score_phrases::MatchLocation;
use crate::store::SentenceStore;
use crate::token::BACKGROUND;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const LEARNED_WORDS_FILE: &str = "learnedwords.txt";
pub const LEARNED_PATTERNS_FILE: &str = "learnedpatterns.txt";
pub const SEED_WORDS_FILE: &str = "seedwords.txt";
pub const PATTERNS_EACH_ITER_FILE: &str = "patterns_each_iter.json";
pub const PHRASES_FILE: &str = "phrases.txt";
const ITERATION_HEADER: &str = "#Iteration ";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Output error: {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Output error: bad JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Output error: {0}")]
    Pattern(#[from] PatternParseError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, OutputError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    Ok(BufWriter::new(File::create(path).map_err(io_err(path))?))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), OutputError> {
    let mut w = create(path)?;
    serde_json::to_writer_pretty(&mut w, value).map_err(|source| OutputError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    w.flush().map_err(io_err(path))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, OutputError> {
    let file = File::open(path).map_err(io_err(path))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| OutputError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `text<TAB>score` lines, best first
pub fn write_scored<'a>(
    path: &Path,
    items: impl IntoIterator<Item = (&'a str, f64)>,
) -> Result<(), OutputError> {
    let mut items: Vec<(&str, f64)> = items.into_iter().collect();
    items.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut w = create(path)?;
    for (text, score) in items {
        writeln!(w, "{}\t{}", text, score).map_err(io_err(path))?;
    }
    w.flush().map_err(io_err(path))
}

/// `learnedwords.txt` and `learnedpatterns.txt` for one label
pub fn write_label_files(
    label_dir: &Path,
    words: &Counter<CandidatePhrase>,
    patterns: &[(String, f64)],
) -> Result<(), OutputError> {
    write_scored(
        &label_dir.join(LEARNED_WORDS_FILE),
        words.iter().map(|(p, s)| (p.text(), s)),
    )?;
    write_scored(
        &label_dir.join(LEARNED_PATTERNS_FILE),
        patterns.iter().map(|(p, s)| (p.as_str(), *s)),
    )
}

/// `{label: [phrase, ...]}`
pub fn write_learned_words_json(
    path: &Path,
    learned: &BTreeMap<String, Counter<CandidatePhrase>>,
) -> Result<(), OutputError> {
    let dump: BTreeMap<&str, Vec<&str>> = learned
        .iter()
        .map(|(label, words)| {
            let mut sorted: Vec<(&CandidatePhrase, f64)> = words.iter().collect();
            sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
            (label.as_str(), sorted.into_iter().map(|(p, _)| p.text()).collect())
        })
        .collect();
    write_json(path, &dump)
}

/// Evidence behind one accepted pattern
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternEvidence {
    #[serde(rename = "Positive")]
    pub positive: BTreeSet<String>,
    #[serde(rename = "Negative")]
    pub negative: BTreeSet<String>,
    #[serde(rename = "Unlabeled")]
    pub unlabeled: BTreeSet<String>,
    #[serde(rename = "Score")]
    pub score: f64,
}

/// Patterns accepted in one iteration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationJustification {
    pub iteration: usize,
    pub patterns: BTreeMap<String, PatternEvidence>,
}

/// Why a word was learned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WordJustification {
    pub entity: String,
    pub score: f64,
    /// Extracting patterns
    pub patterns: Vec<String>,
    /// Known words extracted by the same patterns
    pub reasonwords: BTreeSet<String>,
}

pub fn write_pattern_justification(
    path: &Path,
    iterations: &[IterationJustification],
) -> Result<(), OutputError> {
    write_json(path, &iterations)
}

pub fn write_word_justification(path: &Path, words: &[WordJustification]) -> Result<(), OutputError> {
    write_json(path, &words)
}

/// `word<TAB>labels` per token, labels comma-joined or `O`
pub fn write_columns<W: Write>(w: &mut W, store: &SentenceStore) -> std::io::Result<()> {
    for sent in store.iter() {
        for token in &sent.tokens {
            let labels: Vec<&str> = token.active_labels().collect();
            let labels = if labels.is_empty() {
                BACKGROUND.to_string()
            } else {
                labels.join(",")
            };
            writeln!(w, "{}\t{}", token.word, labels)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// `sentId<TAB>text` with labeled runs wrapped in `<LABEL>` tags
pub fn write_marked_text<W: Write>(w: &mut W, store: &SentenceStore, labels: &[String]) -> std::io::Result<()> {
    for sent in store.iter() {
        let mut parts: Vec<String> = Vec::with_capacity(sent.len());
        for (i, token) in sent.tokens.iter().enumerate() {
            let prev = i.checked_sub(1).map(|j| &sent.tokens[j]);
            let next = sent.tokens.get(i + 1);
            for label in labels {
                if token.is_labeled(label) && !prev.is_some_and(|t| t.is_labeled(label)) {
                    parts.push(format!("<{}>", label));
                }
            }
            parts.push(token.word.clone());
            for label in labels.iter().rev() {
                if token.is_labeled(label) && !next.is_some_and(|t| t.is_labeled(label)) {
                    parts.push(format!("</{}>", label));
                }
            }
        }
        writeln!(w, "{}\t{}", sent.id, parts.join(" "))?;
    }
    Ok(())
}

/// Write through `write` to a fresh file at `path`
pub fn write_file<F>(path: &Path, write: F) -> Result<(), OutputError>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let mut w = create(path)?;
    write(&mut w).map_err(io_err(path))?;
    w.flush().map_err(io_err(path))
}

/// `{label: {phrase: [[sentId, start, end], ...]}}`
pub fn write_matched_tokens(
    path: &Path,
    matched: &BTreeMap<String, BTreeMap<String, Vec<MatchLocation>>>,
) -> Result<(), OutputError> {
    write_json(path, matched)
}

// ===== Saved models =====

/// Everything saved for one label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedLabel {
    pub seeds: Vec<String>,
    /// Iteration -> accepted patterns with scores
    pub patterns_each_iter: BTreeMap<usize, Vec<(String, f64)>>,
    /// Iteration -> learned phrases with scores
    pub phrases_each_iter: BTreeMap<usize, Vec<(String, f64)>>,
}

/// Write one label's model files into `dir/label`
pub fn save_label_model(dir: &Path, label: &str, saved: &SavedLabel) -> Result<(), OutputError> {
    let label_dir = dir.join(label);

    let seeds_path = label_dir.join(SEED_WORDS_FILE);
    write_file(&seeds_path, |w| {
        for s in &saved.seeds {
            writeln!(w, "{}", s)?;
        }
        Ok(())
    })?;

    write_json(&label_dir.join(PATTERNS_EACH_ITER_FILE), &saved.patterns_each_iter)?;

    write_file(&label_dir.join(PHRASES_FILE), |w| {
        for (iteration, phrases) in &saved.phrases_each_iter {
            writeln!(w, "{}{}", ITERATION_HEADER, iteration)?;
            for (p, score) in phrases {
                writeln!(w, "{}\t{}", p, score)?;
            }
        }
        Ok(())
    })?;
    debug!(label, dir = %label_dir.display(), "saved model");
    Ok(())
}

/// Read one label's model files from `dir/label`
///
/// Iterations beyond `max_iterations` are not loaded.
pub fn load_label_model(dir: &Path, label: &str, max_iterations: usize) -> Result<SavedLabel, OutputError> {
    let label_dir = dir.join(label);
    let mut saved = SavedLabel::default();

    let seeds_path = label_dir.join(SEED_WORDS_FILE);
    let file = File::open(&seeds_path).map_err(io_err(&seeds_path))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_err(&seeds_path))?;
        let line = line.trim();
        if !line.is_empty() {
            saved.seeds.push(line.to_string());
        }
    }

    let patterns: BTreeMap<usize, Vec<(String, f64)>> = read_json(&label_dir.join(PATTERNS_EACH_ITER_FILE))?;
    for (iteration, pats) in patterns.into_iter().filter(|(i, _)| *i < max_iterations) {
        for (text, _) in &pats {
            parse_pattern(text)?;
        }
        saved.patterns_each_iter.insert(iteration, pats);
    }

    let phrases_path = label_dir.join(PHRASES_FILE);
    let file = File::open(&phrases_path).map_err(io_err(&phrases_path))?;
    let mut current: Option<usize> = None;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(io_err(&phrases_path))?;
        if let Some(n) = line.strip_prefix(ITERATION_HEADER) {
            current = n.trim().parse().ok();
            continue;
        }
        let Some(iteration) = current.filter(|i| *i < max_iterations) else {
            continue;
        };
        match line.rsplit_once('\t') {
            Some((phrase, score)) => {
                let score = score.trim().parse().unwrap_or(0.0);
                saved
                    .phrases_each_iter
                    .entry(iteration)
                    .or_default()
                    .push((phrase.to_string(), score));
            }
            None if line.trim().is_empty() => {}
            None => warn!("Skipping malformed phrase line {:?} in {:?}", line, phrases_path),
        }
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Sentence;

    fn labeled_store() -> SentenceStore {
        let mut store = SentenceStore::from_sentences([Sentence::from_tagged(
            "s1",
            "patients with chronic pain and flu",
        )]);
        let s1 = store.get_mut("s1").unwrap();
        s1.init_labels(["DISEASE", "SYMPTOM"]);
        s1.tokens[2].set_label("SYMPTOM", true);
        s1.tokens[3].set_label("SYMPTOM", true);
        s1.tokens[5].set_label("DISEASE", true);
        s1.tokens[5].set_label("SYMPTOM", true);
        store
    }

    // ===== Corpus Output Tests =====

    #[test]
    fn test_columns() {
        let mut out = Vec::new();
        write_columns(&mut out, &labeled_store()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "patients\tO");
        assert_eq!(lines[2], "chronic\tSYMPTOM");
        assert_eq!(lines[5], "flu\tDISEASE,SYMPTOM");
        assert_eq!(lines[6], "");
    }

    #[test]
    fn test_marked_text() {
        let mut out = Vec::new();
        let labels = vec!["DISEASE".to_string(), "SYMPTOM".to_string()];
        write_marked_text(&mut out, &labeled_store(), &labels).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "s1\tpatients with <SYMPTOM> chronic pain </SYMPTOM> and <DISEASE> <SYMPTOM> flu </SYMPTOM> </DISEASE>\n"
        );
    }

    // ===== File Output Tests =====

    #[test]
    fn test_label_files() {
        let dir = tempfile::tempdir().unwrap();
        let words: Counter<CandidatePhrase> = [
            (CandidatePhrase::new("measles"), 0.4),
            (CandidatePhrase::new("pneumonia"), 0.9),
        ]
        .into_iter()
        .collect();
        let patterns = vec![(r#"[l:"with"] {TARGET}"#.to_string(), 2.0)];
        write_label_files(&dir.path().join("DISEASE"), &words, &patterns).unwrap();

        let text = fs::read_to_string(dir.path().join("DISEASE").join(LEARNED_WORDS_FILE)).unwrap();
        assert_eq!(text, "pneumonia\t0.9\nmeasles\t0.4\n");
        let text = fs::read_to_string(dir.path().join("DISEASE").join(LEARNED_PATTERNS_FILE)).unwrap();
        assert!(text.starts_with("[l:\"with\"] {TARGET}\t2"));
    }

    #[test]
    fn test_justification_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut evidence = PatternEvidence {
            score: 1.0,
            ..PatternEvidence::default()
        };
        evidence.positive.insert("flu".into());
        let it = IterationJustification {
            iteration: 0,
            patterns: BTreeMap::from([("with _".to_string(), evidence)]),
        };
        let path = dir.path().join("just.json");
        write_pattern_justification(&path, &[it.clone()]).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json[0]["iteration"], 0);
        assert_eq!(json[0]["patterns"]["with _"]["Positive"][0], "flu");
        assert_eq!(json[0]["patterns"]["with _"]["Score"], 1.0);
    }

    // ===== Model Tests =====

    #[test]
    fn test_model_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let saved = SavedLabel {
            seeds: vec!["flu".into()],
            patterns_each_iter: BTreeMap::from([
                (0, vec![(r#"[l:"with"] {TARGET}"#.to_string(), 2.0)]),
                (1, vec![(r#"{TARGET} [l:"and"]"#.to_string(), 1.5)]),
            ]),
            phrases_each_iter: BTreeMap::from([
                (0, vec![("pneumonia".to_string(), 0.9)]),
                (1, vec![("measles".to_string(), 0.5)]),
            ]),
        };
        save_label_model(dir.path(), "DISEASE", &saved).unwrap();
        assert_eq!(load_label_model(dir.path(), "DISEASE", usize::MAX).unwrap(), saved);

        let first = load_label_model(dir.path(), "DISEASE", 1).unwrap();
        assert_eq!(first.patterns_each_iter.len(), 1);
        assert_eq!(first.phrases_each_iter.len(), 1);
        assert_eq!(first.phrases_each_iter[&0][0].0, "pneumonia");
    }

    #[test]
    fn test_bad_saved_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let saved = SavedLabel {
            seeds: vec!["flu".into()],
            patterns_each_iter: BTreeMap::from([(0, vec![("not a pattern".to_string(), 1.0)])]),
            phrases_each_iter: BTreeMap::new(),
        };
        save_label_model(dir.path(), "DISEASE", &saved).unwrap();
        assert!(matches!(
            load_label_model(dir.path(), "DISEASE", usize::MAX),
            Err(OutputError::Pattern(_))
        ));
    }
}
