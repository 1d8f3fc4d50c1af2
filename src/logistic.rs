//! Binary logistic regression
//!
//! Trained by full-batch gradient descent on the L2-regularised negative log
//! likelihood, with a Gaussian prior of width `sigma` on every weight. The
//! bias is not regularised. The step is capped at the inverse of a bound on
//! the objective's curvature, so strong priors on small datasets still
//! converge. Feature names are mapped to dense indices at
//! training time and datums are stored sparsely.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Train error: empty dataset")]
    Empty,

    #[error("Train error: dataset has no {0} examples")]
    SingleClass(&'static str),

    #[error("Train error: weights diverged after {0} iterations")]
    Diverged(usize),
}

/// One labelled example
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    pub features: BTreeMap<String, f64>,
    pub positive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    data: Vec<Datum>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, features: BTreeMap<String, f64>, positive: bool) {
        self.data.push(Datum { features, positive });
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn num_positive(&self) -> usize {
        self.data.iter().filter(|d| d.positive).count()
    }

    pub fn num_negative(&self) -> usize {
        self.len() - self.num_positive()
    }

    pub fn data(&self) -> &[Datum] {
        &self.data
    }

    /// Drop features present in fewer than `min_count` datums
    pub fn apply_feature_count_threshold(&mut self, min_count: usize) {
        let mut counts: FxHashMap<&str, usize> = FxHashMap::default();
        for d in &self.data {
            for name in d.features.keys() {
                *counts.entry(name.as_str()).or_insert(0) += 1;
            }
        }
        let rare: Vec<String> = counts
            .into_iter()
            .filter(|(_, c)| *c < min_count)
            .map(|(name, _)| name.to_string())
            .collect();
        for d in &mut self.data {
            for name in &rare {
                d.features.remove(name);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// Prior standard deviation; smaller means stronger regularisation
    pub sigma: f64,
    /// Upper bound on the step; lowered when the curvature bound requires it
    pub learning_rate: f64,
    pub max_iterations: usize,
    /// Stop once every gradient component is below this
    pub tolerance: f64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            learning_rate: 0.5,
            max_iterations: 500,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogisticClassifier {
    weights: BTreeMap<String, f64>,
    bias: f64,
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

impl LogisticClassifier {
    pub fn train(dataset: &Dataset, options: &TrainOptions) -> Result<Self, TrainError> {
        if dataset.is_empty() {
            return Err(TrainError::Empty);
        }
        if dataset.num_positive() == 0 {
            return Err(TrainError::SingleClass("positive"));
        }
        if dataset.num_negative() == 0 {
            return Err(TrainError::SingleClass("negative"));
        }

        let mut index: BTreeMap<&str, usize> = BTreeMap::new();
        for d in dataset.data() {
            for name in d.features.keys() {
                let next = index.len();
                index.entry(name.as_str()).or_insert(next);
            }
        }
        let rows: Vec<(Vec<(usize, f64)>, f64)> = dataset
            .data()
            .iter()
            .map(|d| {
                let x = d
                    .features
                    .iter()
                    .filter_map(|(name, v)| index.get(name.as_str()).map(|i| (*i, *v)))
                    .collect();
                (x, if d.positive { 1.0 } else { 0.0 })
            })
            .collect();

        let n = rows.len() as f64;
        let prior = 1.0 / (options.sigma * options.sigma).max(f64::MIN_POSITIVE);
        // the mean loss has curvature at most max|x|^2 / 4, bias included
        let max_norm = rows
            .iter()
            .map(|(x, _)| 1.0 + x.iter().map(|(_, v)| v * v).sum::<f64>())
            .fold(0.0, f64::max);
        let step = options.learning_rate.min(1.0 / (max_norm / 4.0 + prior / n));
        let mut w = vec![0.0; index.len()];
        let mut b = 0.0;
        let mut grad = vec![0.0; index.len()];

        let mut iterations = 0;
        for _ in 0..options.max_iterations {
            iterations += 1;
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_b = 0.0;
            for (x, y) in &rows {
                let z = b + x.iter().map(|(i, v)| w[*i] * v).sum::<f64>();
                let err = sigmoid(z) - y;
                for (i, v) in x {
                    grad[*i] += err * v;
                }
                grad_b += err;
            }
            let mut largest = (grad_b / n).abs();
            for (g, wi) in grad.iter_mut().zip(&w) {
                *g = (*g + prior * wi) / n;
                largest = largest.max(g.abs());
            }
            for (wi, g) in w.iter_mut().zip(&grad) {
                *wi -= step * g;
            }
            b -= step * grad_b / n;
            if !largest.is_finite() {
                return Err(TrainError::Diverged(iterations));
            }
            if largest < options.tolerance {
                break;
            }
        }
        debug!(
            datums = rows.len(),
            features = index.len(),
            iterations,
            step,
            "trained logistic classifier"
        );

        if !b.is_finite() || w.iter().any(|wi| !wi.is_finite()) {
            return Err(TrainError::Diverged(iterations));
        }
        let weights = index
            .into_iter()
            .map(|(name, i)| (name.to_string(), w[i]))
            .collect();
        Ok(Self { weights, bias: b })
    }

    /// Probability of the positive class
    pub fn prob(&self, features: &BTreeMap<String, f64>) -> f64 {
        let z = self.bias
            + features
                .iter()
                .filter_map(|(name, v)| self.weights.get(name).map(|w| w * v))
                .sum::<f64>();
        sigmoid(z)
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn separable() -> Dataset {
        let mut d = Dataset::new();
        for _ in 0..5 {
            d.add(features(&[("good", 1.0), ("len", 1.0)]), true);
            d.add(features(&[("bad", 1.0), ("len", 1.0)]), false);
        }
        d
    }

    #[test]
    fn test_learns_separable_data() {
        let model = LogisticClassifier::train(&separable(), &TrainOptions::default()).unwrap();
        assert!(model.weights()["good"] > 0.0);
        assert!(model.weights()["bad"] < 0.0);
        assert!(model.prob(&features(&[("good", 1.0)])) > 0.5);
        assert!(model.prob(&features(&[("bad", 1.0)])) < 0.5);
        // unseen features are ignored
        let p = model.prob(&features(&[("unseen", 5.0)]));
        assert!((p - sigmoid(model.bias())).abs() < 1e-12);
    }

    #[test]
    fn test_regularisation_shrinks_weights() {
        let loose = LogisticClassifier::train(
            &separable(),
            &TrainOptions {
                sigma: 10.0,
                ..TrainOptions::default()
            },
        )
        .unwrap();
        let tight = LogisticClassifier::train(
            &separable(),
            &TrainOptions {
                sigma: 0.1,
                ..TrainOptions::default()
            },
        )
        .unwrap();
        assert!(tight.weights()["good"].abs() < loose.weights()["good"].abs());
    }

    #[test]
    fn test_strong_prior_on_tiny_dataset_stays_finite() {
        let mut d = Dataset::new();
        for _ in 0..2 {
            d.add(features(&[("good", 1.0)]), true);
            d.add(features(&[("bad", 1.0)]), false);
        }
        let mut previous = f64::INFINITY;
        for sigma in [10.0, 1.0, 0.3, 0.1, 0.01] {
            let model = LogisticClassifier::train(
                &d,
                &TrainOptions {
                    sigma,
                    ..TrainOptions::default()
                },
            )
            .unwrap();
            let good = model.weights()["good"];
            assert!(good.is_finite() && good > 0.0, "sigma {}: {}", sigma, good);
            assert!(good < previous);
            previous = good;
            let p = model.prob(&features(&[("good", 1.0)]));
            assert!(p.is_finite() && p > 0.5);
        }
    }

    #[test]
    fn test_degenerate_datasets() {
        assert!(matches!(
            LogisticClassifier::train(&Dataset::new(), &TrainOptions::default()),
            Err(TrainError::Empty)
        ));
        let mut only_pos = Dataset::new();
        only_pos.add(features(&[("good", 1.0)]), true);
        assert!(matches!(
            LogisticClassifier::train(&only_pos, &TrainOptions::default()),
            Err(TrainError::SingleClass("negative"))
        ));
    }

    #[test]
    fn test_feature_count_threshold() {
        let mut d = separable();
        d.add(features(&[("rare", 1.0)]), false);
        d.apply_feature_count_threshold(2);
        assert!(d.data().iter().all(|x| !x.features.contains_key("rare")));
        assert!(d.data().iter().any(|x| x.features.contains_key("good")));
        assert_eq!(d.len(), 11);
    }
}
