use divan::{Bencher, black_box};
use seedpat::extract::{ContextPatternExtractor, PatternInterner, PatternsForEachToken};
use seedpat::factory::{FactoryWords, SurfaceOptions, SurfacePatternFactory};
use seedpat::index::{InMemoryIndex, PersistentIndex, SentenceIndex};
use seedpat::{Sentence, SentenceStore};

fn main() {
    divan::main();
}

const SUBJECTS: &[&str] = &["patients", "children", "adults", "cases", "residents"];
const DISEASES: &[&str] = &["flu", "pneumonia", "measles", "asthma", "bronchitis", "malaria"];

/// Sentences like "patients/NNS with/IN flu/NN and/CC asthma/NN"
fn synthetic_store(n: usize) -> SentenceStore {
    SentenceStore::from_sentences((0..n).map(|i| {
        let text = format!(
            "{}/NNS with/IN {}/NN and/CC {}/NN in/IN ward/NN {}/CD",
            SUBJECTS[i % SUBJECTS.len()],
            DISEASES[i % DISEASES.len()],
            DISEASES[(i * 7 + 3) % DISEASES.len()],
            i
        );
        Sentence::from_tagged(&format!("s{}", i), &text)
    }))
}

fn factory() -> SurfacePatternFactory {
    SurfacePatternFactory::new(SurfaceOptions::default(), FactoryWords::default())
}

#[divan::bench(args = [100, 1000], sample_count = 10)]
fn extract_patterns(bencher: Bencher, n: usize) {
    let store = synthetic_store(n);
    let factory = factory();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
    bencher.bench_local(|| {
        let mut interner = PatternInterner::new();
        let mut out = PatternsForEachToken::new();
        ContextPatternExtractor::new(&factory).extract(black_box(&store), &pool, &mut interner, &mut out);
        black_box(interner.len())
    });
}

#[divan::bench(sample_count = 10)]
fn query_index(bencher: Bencher) {
    let store = synthetic_store(1000);
    let mut index = InMemoryIndex::new(Default::default());
    index.add(&store, false);
    index.finish_updating().unwrap();

    let extractor_factory = factory();
    let extractor = ContextPatternExtractor::new(&extractor_factory);
    let patterns: Vec<_> = store
        .iter()
        .take(20)
        .flat_map(|sent| extractor.sentence_patterns(sent).into_values().flatten())
        .collect();

    bencher.bench_local(|| black_box(index.query_index(black_box(&patterns))).len());
}

#[divan::bench(args = [1000, 4000], sample_count = 10)]
fn persistent_add(bencher: Bencher, n: usize) {
    let store = synthetic_store(n);
    let dir = tempfile::tempdir().unwrap();
    bencher.bench_local(|| {
        let mut index = PersistentIndex::create(dir.path(), Default::default()).unwrap();
        index.add(black_box(&store), false);
        black_box(index.num_sentences())
    });
}
