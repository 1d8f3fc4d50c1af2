//! Candidate phrases and the phrase registry
//!
//! A `CandidatePhrase` is a cheap-to-clone handle on an immutable phrase
//! record. Equality, hashing and ordering only look at the surface text, so
//! two handles for "flu" are interchangeable wherever they are used as keys.
//!
//! The `PhraseRegistry` hands out one shared record per distinct text. It is
//! safe to use from worker threads: the text is interned with a
//! `lasso::ThreadedRodeo` and the records live in a slab indexed by the
//! interner key.

use lasso::{Key, Spur, ThreadedRodeo};
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

pub const STRING_POOL_CAPACITY: usize = 5000;

#[derive(Debug)]
struct PhraseRecord {
    text: String,
    lemma: Option<String>,
    features: BTreeMap<String, f64>,
}

/// Immutable phrase value, identified by its text
#[derive(Clone)]
pub struct CandidatePhrase(Arc<PhraseRecord>);

impl CandidatePhrase {
    /// Create an unregistered phrase with no lemma and no features
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_details(text, None, BTreeMap::new())
    }

    pub fn with_details(
        text: impl Into<String>,
        lemma: Option<String>,
        features: BTreeMap<String, f64>,
    ) -> Self {
        Self(Arc::new(PhraseRecord {
            text: text.into(),
            lemma,
            features,
        }))
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.0.text
    }

    #[inline]
    pub fn lemma(&self) -> Option<&str> {
        self.0.lemma.as_deref()
    }

    /// Lemma when known, text otherwise
    pub fn lemma_or_text(&self) -> &str {
        self.lemma().unwrap_or(self.text())
    }

    pub fn features(&self) -> &BTreeMap<String, f64> {
        &self.0.features
    }

    pub fn num_words(&self) -> usize {
        self.0.text.split_whitespace().count()
    }

    /// True if both handles point at the same record
    pub fn same_instance(&self, other: &CandidatePhrase) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for CandidatePhrase {
    fn eq(&self, other: &Self) -> bool {
        self.0.text == other.0.text
    }
}

impl Eq for CandidatePhrase {}

impl Hash for CandidatePhrase {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.text.hash(state);
    }
}

impl PartialOrd for CandidatePhrase {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CandidatePhrase {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.text.cmp(&other.0.text)
    }
}

impl fmt::Debug for CandidatePhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.text)
    }
}

impl fmt::Display for CandidatePhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.text)
    }
}

impl Serialize for CandidatePhrase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.text())
    }
}

impl<'de> Deserialize<'de> for CandidatePhrase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(CandidatePhrase::new(text))
    }
}

/// Process-wide de-duplicating phrase registry ("same text, same instance")
pub struct PhraseRegistry {
    rodeo: ThreadedRodeo<Spur, FxBuildHasher>,
    slab: RwLock<Vec<Option<CandidatePhrase>>>, // index = key
}

impl fmt::Debug for PhraseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhraseRegistry")
            .field("len", &self.rodeo.len())
            .finish()
    }
}

impl Default for PhraseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PhraseRegistry {
    pub fn new() -> Self {
        Self {
            rodeo: ThreadedRodeo::with_capacity_and_hasher(
                lasso::Capacity::for_strings(STRING_POOL_CAPACITY),
                FxBuildHasher,
            ),
            slab: RwLock::new(Vec::with_capacity(STRING_POOL_CAPACITY)),
        }
    }

    /// Look up or create the phrase for `text`
    ///
    /// A freshly created phrase carries a `LENGTH-n` feature with its word count.
    /// The lemma is only recorded the first time a text is seen.
    pub fn get_or_create(&self, text: &str, lemma: Option<&str>) -> CandidatePhrase {
        let idx = self.rodeo.get_or_intern(text).into_usize();

        if let Ok(slab) = self.slab.read() {
            if let Some(Some(phrase)) = slab.get(idx) {
                return phrase.clone();
            }
        }

        let mut slab = match self.slab.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slab.len() <= idx {
            slab.resize(idx + 1, None);
        }
        if let Some(phrase) = &slab[idx] {
            return phrase.clone();
        }

        let mut features = BTreeMap::new();
        let num_words = text.split_whitespace().count();
        features.insert(format!("LENGTH-{}", num_words), 1.0);
        let phrase = CandidatePhrase::with_details(text, lemma.map(str::to_string), features);
        slab[idx] = Some(phrase.clone());
        phrase
    }

    /// Shorthand for `get_or_create(text, None)`
    pub fn phrase(&self, text: &str) -> CandidatePhrase {
        self.get_or_create(text, None)
    }

    /// Registered phrase for `text`, if any
    pub fn get(&self, text: &str) -> Option<CandidatePhrase> {
        let idx = self.rodeo.get(text)?.into_usize();
        let slab = self.slab.read().ok()?;
        slab.get(idx).cloned().flatten()
    }

    pub fn len(&self) -> usize {
        self.rodeo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rodeo.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_equality_by_text_only() {
        let a = CandidatePhrase::with_details("flu", Some("flu".into()), BTreeMap::new());
        let b = CandidatePhrase::new("flu");
        assert_eq!(a, b);

        let mut set = FxHashSet::default();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_registry_same_instance() {
        let registry = PhraseRegistry::new();
        let a = registry.get_or_create("chronic pain", Some("chronic pain"));
        let b = registry.phrase("chronic pain");
        assert!(a.same_instance(&b));
        assert_eq!(registry.len(), 1);
        assert_eq!(b.lemma(), Some("chronic pain"));
    }

    #[test]
    fn test_registry_length_feature() {
        let registry = PhraseRegistry::new();
        let p = registry.phrase("chronic back pain");
        assert_eq!(p.features().get("LENGTH-3"), Some(&1.0));
        assert_eq!(p.num_words(), 3);
    }

    #[test]
    fn test_registry_get_unknown() {
        let registry = PhraseRegistry::new();
        assert!(registry.get("nothing").is_none());
        registry.phrase("something");
        assert!(registry.get("something").is_some());
    }

    #[test]
    fn test_registry_threads() {
        let registry = Arc::new(PhraseRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.phrase("shared"))
            })
            .collect();
        let phrases: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(phrases.windows(2).all(|w| w[0].same_instance(&w[1])));
    }
}
