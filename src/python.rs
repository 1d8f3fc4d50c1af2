//! Python bindings for seedpat
//!
//! This module provides PyO3-based Python bindings for the Rust core.

use pyo3::exceptions::{PyIOError, PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::Config;
use crate::controller::{BootstrapController, BootstrapError};
use crate::edit_distance;
use crate::pattern::Pattern as RustPattern;
use crate::pattern_parse::parse_pattern;

/// Convert BootstrapError to Python exception
impl From<BootstrapError> for PyErr {
    fn from(err: BootstrapError) -> PyErr {
        match err {
            BootstrapError::Io(e) => PyIOError::new_err(e.to_string()),
            BootstrapError::UnknownLabel(label) => PyKeyError::new_err(format!("unknown label {}", label)),
            e @ (BootstrapError::Config(_) | BootstrapError::Pattern(_) | BootstrapError::Glob(_)) => {
                PyValueError::new_err(e.to_string())
            }
            e => PyRuntimeError::new_err(e.to_string()),
        }
    }
}

#[pyclass(name = "Pattern")]
#[derive(Clone)]
pub struct PyPattern {
    pub(crate) inner: RustPattern,
}

#[pymethods]
impl PyPattern {
    /// True if every match of `other` is also a match of this pattern.
    fn subsumes(&self, other: &PyPattern) -> bool {
        self.inner.same_genre(&other.inner) && self.inner.subsumes(&other.inner)
    }

    fn __str__(&self) -> String {
        self.inner.to_string()
    }

    fn __repr__(&self) -> String {
        format!("Pattern({})", self.inner)
    }
}

/// Parse a pattern from its display form.
#[pyfunction(name = "parse_pattern")]
fn py_parse_pattern(text: &str) -> PyResult<PyPattern> {
    parse_pattern(text)
        .map(|inner| PyPattern { inner })
        .map_err(|e| PyValueError::new_err(format!("Pattern parse error: {}", e)))
}

/// Edit distance between two words, -1 once it exceeds `threshold`.
#[pyfunction(name = "edit_distance")]
#[pyo3(signature = (a, b, threshold=2))]
fn py_edit_distance(a: &str, b: &str, threshold: usize) -> i32 {
    edit_distance::distance(a, b, threshold)
}

/// A bootstrapping run over one corpus.
///
/// Built from a TOML configuration. The corpus is read and seeds are labeled
/// on first use.
#[pyclass(name = "Bootstrapper", unsendable)]
pub struct PyBootstrapper {
    inner: BootstrapController,
}

#[pymethods]
impl PyBootstrapper {
    /// Create a Bootstrapper from a TOML configuration file.
    #[classmethod]
    fn from_config_file(_cls: &Bound<'_, pyo3::types::PyType>, file_path: &str) -> PyResult<Self> {
        let config = Config::from_toml_file(&PathBuf::from(file_path)).map_err(BootstrapError::from)?;
        Ok(PyBootstrapper {
            inner: BootstrapController::from_config(config)?,
        })
    }

    /// Create a Bootstrapper from TOML text.
    #[classmethod]
    fn from_toml(_cls: &Bound<'_, pyo3::types::PyType>, text: &str) -> PyResult<Self> {
        let config = Config::from_toml_str(text).map_err(BootstrapError::from)?;
        Ok(PyBootstrapper {
            inner: BootstrapController::from_config(config)?,
        })
    }

    /// Run every iteration, optionally writing outputs after each one.
    #[pyo3(signature = (write_outputs=false))]
    fn run(&mut self, write_outputs: bool) -> PyResult<()> {
        if write_outputs {
            self.inner.run_with(|c, _| c.write_iteration_outputs())?;
            self.inner.write_outputs()?;
        } else {
            self.inner.run()?;
        }
        Ok(())
    }

    #[getter]
    fn labels(&self) -> Vec<String> {
        self.inner.state().labels.clone()
    }

    /// Learned words of a label as (phrase, score) pairs, best first.
    fn learned_words(&self, label: &str) -> PyResult<Vec<(String, f64)>> {
        let words = self
            .inner
            .learned_words(label)
            .ok_or_else(|| PyKeyError::new_err(format!("unknown label {}", label)))?;
        Ok(words
            .sorted_desc()
            .into_iter()
            .map(|(p, s)| (p.text().to_string(), s))
            .collect())
    }

    /// Learned patterns of a label as (pattern, score) pairs, best first.
    fn learned_patterns(&self, label: &str) -> Vec<(PyPattern, f64)> {
        self.inner
            .learned_patterns(label)
            .into_iter()
            .map(|(inner, s)| (PyPattern { inner }, s))
            .collect()
    }

    fn add_seed_words(&mut self, label: &str, phrases: Vec<String>) -> PyResult<usize> {
        let phrases: Vec<&str> = phrases.iter().map(String::as_str).collect();
        Ok(self.inner.add_seed_words(label, &phrases)?)
    }

    fn remove_phrases(&mut self, label: &str, phrases: Vec<String>) -> PyResult<usize> {
        let phrases: Vec<&str> = phrases.iter().map(String::as_str).collect();
        Ok(self.inner.remove_phrases(label, &phrases)?)
    }

    #[pyo3(signature = (sent_id, token_ids, label, remove=false))]
    fn annotate_tokens(&mut self, sent_id: &str, token_ids: Vec<usize>, label: &str, remove: bool) -> PyResult<bool> {
        Ok(self.inner.annotate_tokens(sent_id, &token_ids, label, remove)?)
    }

    /// Matches of a phrase as {label: [(sent_id, start, end), ...]}.
    fn matched_tokens_by_phrase(&self, phrase: &str) -> PyResult<BTreeMap<String, Vec<(String, usize, usize)>>> {
        Ok(self.inner.matched_tokens_by_phrase(phrase)?)
    }

    /// Labeled spans of one sentence as (label, start, end, text) tuples.
    fn annotations_by_sentence(&self, sent_id: &str) -> PyResult<Option<Vec<(String, usize, usize, String)>>> {
        Ok(self.inner.annotations_by_sentence(sent_id)?.map(|anns| {
            anns.into_iter()
                .map(|a| (a.label, a.start, a.end, a.text))
                .collect()
        }))
    }

    fn save_model(&self, dir: &str) -> PyResult<()> {
        Ok(self.inner.save_model(&PathBuf::from(dir))?)
    }

    fn load_model(&mut self, dir: &str) -> PyResult<()> {
        Ok(self.inner.load_model(&PathBuf::from(dir))?)
    }

    fn summary(&self) -> String {
        self.inner.summary()
    }

    fn __repr__(&self) -> String {
        format!(
            "<Bootstrapper labels={:?} iteration={}>",
            self.inner.state().labels,
            self.inner.state().iteration
        )
    }
}

#[pyfunction]
fn __version__() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[pymodule]
fn seedpat(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyPattern>()?;
    m.add_class::<PyBootstrapper>()?;

    m.add_function(wrap_pyfunction!(py_parse_pattern, m)?)?;
    m.add_function(wrap_pyfunction!(py_edit_distance, m)?)?;
    m.add_function(wrap_pyfunction!(__version__, m)?)?;

    Ok(())
}
