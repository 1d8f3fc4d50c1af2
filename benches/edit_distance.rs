use divan::{Bencher, black_box};
use seedpat::edit_distance;

fn main() {
    divan::main();
}

const WORDS: &[&str] = &[
    "pneumonia", "pneumonias", "bronchitis", "tuberculosis", "influenza", "measles",
    "headache", "headaches", "meningitis", "hepatitis", "gastroenteritis", "asthma",
];

#[divan::bench(args = [1, 2, 4])]
fn bounded_distance(threshold: usize) {
    for a in WORDS {
        for b in WORDS {
            black_box(edit_distance::distance(black_box(a), black_box(b), threshold));
        }
    }
}

/// Fuzzy membership against a dictionary of the size a seed list reaches
#[divan::bench]
fn contains_fuzzy(bencher: Bencher) {
    let dict: Vec<String> = (0..2000).map(|i| format!("{}{}", WORDS[i % WORDS.len()], i)).collect();
    bencher.bench_local(|| {
        edit_distance::contains_fuzzy(
            black_box(dict.iter().map(String::as_str)),
            black_box("pneumonia7"),
            edit_distance::DEFAULT_MIN_LEN,
        )
    });
}
