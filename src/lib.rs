//! Seedpat: pattern-based bootstrapped entity extraction
//!
//! Starting from a few seed phrases per label, learns surface or dependency
//! patterns around labeled tokens, applies them to propose new phrases,
//! scores and accepts the best, relabels the corpus and repeats.
//! Core implementation in Rust with Python bindings.

// Data
pub mod conllu; // CoNLL-U and column corpus readers
pub mod counter; // Insertion-ordered counters
pub mod phrase; // Candidate phrases and the phrase registry
pub mod store; // Sentence store and batched corpus
pub mod token; // Tokens, sentences and label side tables

// Patterns
pub mod extract; // Per-token pattern extraction and interning
pub mod factory; // Pattern factories (surface, dependency)
pub mod index; // Inverted sentence index
pub mod matcher; // Pattern matching VM
pub mod pattern; // Pattern types and subsumption
pub mod pattern_parse; // Pattern language parser

// Bootstrapping
pub mod config; // Run configuration
pub mod controller; // Iteration driver and runtime annotation
pub mod edit_distance; // Fuzzy matching
pub mod eval; // Precision / recall against gold labels
pub mod features; // Phrase features
pub mod labeling; // Seed and learned-word labeling
pub mod logistic; // Logistic regression
pub mod output; // Output files and saved models
pub mod score_patterns; // Pattern scorers and selection
pub mod score_phrases; // Pattern application and phrase scorers
pub mod seeds; // Seed, word list and statistics files
pub mod state; // Bootstrap state
pub mod stats; // Sufficient statistics

// Python bindings
#[cfg(feature = "pyo3")]
pub mod python;

// Re-exports for convenience
pub use config::Config;
pub use controller::{Annotation, BootstrapController, BootstrapError, Phase};
pub use counter::{Counter, TwoDimCounter};
pub use index::{IndexBackend, SentenceIndex};
pub use pattern::Pattern;
pub use pattern_parse::parse_pattern;
pub use phrase::CandidatePhrase;
pub use state::BootstrapState;
pub use store::{Corpus, SentenceStore};
pub use token::{Sentence, Token};
