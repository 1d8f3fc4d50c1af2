//! Corpus readers
//!
//! Parses annotated sentences from CoNLL-U or from a simple tab-separated
//! column format. Either may be gzip-compressed (`.gz`).
//!
//! CoNLL-U format: https://universaldependencies.org/format.html
//!
//! In CoNLL-U input the POS tag is XPOS when present and UPOS otherwise. The
//! NER tag, parent constituent tag and an optional gold label are read from
//! MISC as `NER=`, `ParentTag=` and `Gold=`.
//!
//! Column format is `word[\tlemma[\tpos[\tner[\tgold]]]]`, one token per line,
//! with a blank line between sentences and `#` lines treated as comments.

use crate::token::{BACKGROUND, Sentence, Token, TokenId};
use bstr::ByteSlice;
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// Error during corpus parsing
#[derive(Debug)]
pub struct ParseError {
    pub line_num: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error at line {}: {}", self.line_num, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<std::io::Error> for ParseError {
    fn from(e: std::io::Error) -> Self {
        ParseError {
            line_num: 0,
            message: format!("IO error: {}", e),
        }
    }
}

/// Supported corpus layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusFormat {
    #[default]
    Conllu,
    Column,
}

/// Open a file for buffered reading, decompressing `.gz` files
pub fn open_maybe_gz(path: &Path) -> io::Result<Box<dyn io::BufRead>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read and parse one corpus file
///
/// Sentences without a `# sent_id` comment are named `{file_stem}-{n}`.
pub fn read_file(path: &Path, format: CorpusFormat) -> Result<Vec<Sentence>, ParseError> {
    let mut bytes = Vec::new();
    open_maybe_gz(path)?.read_to_end(&mut bytes)?;
    let doc_id = doc_id_for(path);
    match format {
        CorpusFormat::Conllu => parse_conllu(&bytes, &doc_id),
        CorpusFormat::Column => parse_column(&bytes, &doc_id),
    }
}

/// Expand a glob pattern into sorted file paths
///
/// Files are returned in sorted order for deterministic results.
pub fn glob_files(pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)?.filter_map(Result::ok).collect();
    paths.sort();
    Ok(paths)
}

fn doc_id_for(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.split('.').next().unwrap_or("doc").to_string()
}

/// Split a byte buffer into sentence blocks of (line number, line)
fn blocks(text: &[u8]) -> Vec<Vec<(usize, &[u8])>> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push((i + 1, line));
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn field(s: &[u8]) -> String {
    s.to_str_lossy().into_owned()
}

/// Parse CoNLL-U text into sentences
pub fn parse_conllu(text: &[u8], doc_id: &str) -> Result<Vec<Sentence>, ParseError> {
    let mut sentences = Vec::new();

    for block in blocks(text) {
        let mut sent_id = None;
        let mut tokens = Vec::new();

        for (line_num, line) in block {
            if let Some(comment) = line.strip_prefix(b"#") {
                if let Some((key, value)) = comment.split_once_str("=") {
                    if key.trim() == b"sent_id" {
                        sent_id = Some(field(value.trim()));
                    }
                }
                continue;
            }
            if let Some(token) = parse_conllu_line(line, line_num)? {
                tokens.push(token);
            }
        }

        if tokens.is_empty() {
            continue;
        }
        let id = sent_id.unwrap_or_else(|| format!("{}-{}", doc_id, sentences.len()));
        sentences.push(Sentence::new(&id, tokens));
    }

    Ok(sentences)
}

/// Parse one CoNLL-U token line
///
/// Multiword tokens and empty nodes return `None`.
fn parse_conllu_line(line: &[u8], line_num: usize) -> Result<Option<Token>, ParseError> {
    let fields: Vec<&[u8]> = line.split_str("\t").collect();
    if fields.len() != 10 {
        return Err(ParseError {
            line_num,
            message: format!("Expected 10 fields, found {}", fields.len()),
        });
    }

    // Skip multiword tokens (1-2) and empty nodes (2.1)
    if memchr::memchr2(b'-', b'.', fields[0]).is_some() {
        return Ok(None);
    }
    if atoi::atoi::<usize>(fields[0]).is_none() {
        return Err(ParseError {
            line_num,
            message: format!("Invalid ID: {}", field(fields[0])),
        });
    }

    let word = field(fields[1]);
    let lemma = if fields[2] == b"_" {
        word.clone()
    } else {
        field(fields[2])
    };
    let pos = if fields[4] != b"_" {
        field(fields[4])
    } else {
        field(fields[3])
    };

    let mut token = Token::new(&word, &lemma, &pos);
    token.head = parse_head(fields[6], line_num)?;
    token.deprel = if fields[7] == b"_" {
        String::new()
    } else {
        field(fields[7])
    };

    if fields[9] != b"_" {
        for pair in fields[9].split_str("|") {
            let Some((key, value)) = pair.split_once_str("=") else {
                continue;
            };
            match key {
                b"NER" => token.ner = field(value),
                b"ParentTag" => token.parent_tag = field(value),
                b"Gold" => token.gold = Some(field(value)),
                _ => {
                    token.features.insert(field(key), field(value));
                }
            }
        }
    }

    Ok(Some(token))
}

/// HEAD is 1-indexed in CoNLL-U; 0 is the root
fn parse_head(s: &[u8], line_num: usize) -> Result<Option<TokenId>, ParseError> {
    if s == b"_" || s == b"0" {
        return Ok(None);
    }
    match atoi::atoi::<usize>(s) {
        Some(0) => Ok(None),
        Some(h) => Ok(Some(h - 1)),
        None => Err(ParseError {
            line_num,
            message: format!("Invalid HEAD: {}", field(s)),
        }),
    }
}

/// Parse tab-separated column text into sentences
pub fn parse_column(text: &[u8], doc_id: &str) -> Result<Vec<Sentence>, ParseError> {
    let mut sentences = Vec::new();

    for block in blocks(text) {
        let mut tokens = Vec::new();
        for (line_num, line) in block {
            if line.starts_with(b"#") {
                continue;
            }
            let fields: Vec<&[u8]> = line.split_str("\t").collect();
            let word = field(fields[0]);
            if word.is_empty() {
                return Err(ParseError {
                    line_num,
                    message: "Empty word".to_string(),
                });
            }
            let lemma = fields.get(1).map_or_else(|| word.to_lowercase(), |f| field(f));
            let pos = fields.get(2).map_or_else(String::new, |f| field(f));
            let mut token = Token::new(&word, &lemma, &pos);
            if let Some(ner) = fields.get(3) {
                token.ner = field(ner);
            }
            if let Some(gold) = fields.get(4) {
                let gold = field(gold);
                if gold != BACKGROUND {
                    token.gold = Some(gold);
                }
            }
            tokens.push(token);
        }
        if tokens.is_empty() {
            continue;
        }
        let id = format!("{}-{}", doc_id, sentences.len());
        sentences.push(Sentence::new(&id, tokens));
    }

    Ok(sentences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const CONLLU: &str = "# sent_id = s1
# text = Patients with flu suffer.
1\tPatients\tpatient\tNOUN\tNNS\t_\t4\tnsubj\t_\t_
2\twith\twith\tADP\tIN\t_\t3\tcase\t_\t_
3\tflu\tflu\tNOUN\tNN\t_\t1\tnmod\t_\tNER=O|Gold=DISEASE
4\tsuffer\tsuffer\tVERB\tVBP\t_\t0\troot\t_\tParentTag=VP
5\t.\t.\tPUNCT\t.\t_\t4\tpunct\t_\t_

1\tCoughs\tcough\tNOUN\t_\t_\t0\troot\t_\t_
";

    #[test]
    fn test_parse_conllu() {
        let sents = parse_conllu(CONLLU.as_bytes(), "doc").unwrap();
        assert_eq!(sents.len(), 2);

        let s = &sents[0];
        assert_eq!(s.id, "s1");
        assert_eq!(s.len(), 5);
        assert_eq!(s.tokens[0].pos, "NNS");
        assert_eq!(s.tokens[0].head, Some(3));
        assert_eq!(s.tokens[2].gold.as_deref(), Some("DISEASE"));
        assert_eq!(s.tokens[3].head, None);
        assert_eq!(s.tokens[3].parent_tag, "VP");

        // falls back to UPOS and a generated id
        assert_eq!(sents[1].id, "doc-1");
        assert_eq!(sents[1].tokens[0].pos, "NOUN");
    }

    #[test]
    fn test_skips_multiword_tokens() {
        let text = "1-2\tdon't\t_\t_\t_\t_\t_\t_\t_\t_\n1\tdo\tdo\tAUX\tVBP\t_\t0\troot\t_\t_\n2\tn't\tnot\tPART\tRB\t_\t1\tadvmod\t_\t_\n";
        let sents = parse_conllu(text.as_bytes(), "d").unwrap();
        assert_eq!(sents[0].len(), 2);
    }

    #[test]
    fn test_bad_field_count() {
        let err = parse_conllu(b"1\tflu\tflu\n", "d").unwrap_err();
        assert_eq!(err.line_num, 1);
        assert!(err.message.contains("10 fields"));
    }

    #[test]
    fn test_parse_column() {
        let text = "# comment\nflu\tflu\tNN\tO\tDISEASE\nseason\n\ncough\tcough\tNN\n";
        let sents = parse_column(text.as_bytes(), "col").unwrap();
        assert_eq!(sents.len(), 2);
        assert_eq!(sents[0].tokens[0].gold.as_deref(), Some("DISEASE"));
        assert_eq!(sents[0].tokens[1].lemma, "season");
        assert_eq!(sents[1].id, "col-1");
    }

    #[test]
    fn test_read_gz_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.conllu.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(CONLLU.as_bytes()).unwrap();
        enc.finish().unwrap();

        let sents = read_file(&path, CorpusFormat::Conllu).unwrap();
        assert_eq!(sents.len(), 2);
        assert_eq!(sents[1].id, "corpus-1");
    }

    #[test]
    fn test_glob_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.conllu", "a.conllu", "c.txt"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let pattern = format!("{}/*.conllu", dir.path().display());
        let files = glob_files(&pattern).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.conllu", "b.conllu"]);
    }
}
