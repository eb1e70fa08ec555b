//! Offline training of the tree ensemble.
//!
//! Rows go through the same schema projection used at inference so the
//! artifact's column list always matches. Randomness is seeded, so a given
//! dataset and config always produce the same artifact.

use crate::shared::classifier::{
    DecisionTree, ModelArtifact, ModelMetrics, RandomForest, StandardScaler, TreeNode,
};
use crate::shared::error::{Error, Result};
use crate::shared::models::Ecosystem;
use crate::shared::schema::{RawFeatures, schema};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// One labeled example: raw feature mapping plus ground truth.
#[derive(Debug, Clone, Deserialize)]
pub struct LabeledRow {
    pub features: BTreeMap<String, f64>,
    /// 1 = malicious, 0 = benign.
    pub label: u8,
    #[serde(default)]
    pub ecosystem: Ecosystem,
}

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub test_fraction: f64,
    pub cv_folds: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            test_fraction: 0.2,
            cv_folds: 5,
            seed: 42,
        }
    }
}

/// Read a dataset as a JSON array or as JSON lines.
pub fn load_dataset(path: &Path) -> Result<Vec<LabeledRow>> {
    let text = std::fs::read_to_string(path)?;
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}

/// Fit scaler and forest, evaluate on a stratified hold-out split and k-fold CV.
pub fn train(rows: &[LabeledRow], config: &TrainingConfig) -> Result<ModelArtifact> {
    let (x, y) = project_rows(rows)?;
    let positives = y.iter().filter(|&&l| l == 1).count();
    if positives == 0 || positives == y.len() {
        return Err(Error::Dataset(
            "dataset needs both malicious and benign rows".into(),
        ));
    }
    if !(0.0..1.0).contains(&config.test_fraction) {
        return Err(Error::Dataset(format!(
            "test fraction {} outside [0, 1)",
            config.test_fraction
        )));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let (train_idx, test_idx) = stratified_split(&y, config.test_fraction, &mut rng);

    let width = schema().len();
    let train_raw: Vec<Vec<f64>> = train_idx.iter().map(|&i| x[i].clone()).collect();
    let scaler = StandardScaler::fit(&train_raw, width);
    let x_train: Vec<Vec<f64>> = train_raw.iter().map(|r| scaler.transform(r)).collect();
    let y_train: Vec<u8> = train_idx.iter().map(|&i| y[i]).collect();
    let x_test: Vec<Vec<f64>> = test_idx.iter().map(|&i| scaler.transform(&x[i])).collect();
    let y_test: Vec<u8> = test_idx.iter().map(|&i| y[i]).collect();

    info!(
        train = x_train.len(),
        test = x_test.len(),
        trees = config.n_estimators,
        "training forest"
    );
    let forest = fit_forest(&x_train, &y_train, config, config.seed);

    let scores: Vec<f64> = x_test.iter().map(|r| forest.predict_proba(r)).collect();
    let (cv_mean, cv_std) = cross_validate(&x_train, &y_train, config, &mut rng);
    let metrics = evaluate(&scores, &y_test, cv_mean, cv_std, x_train.len());

    info!(
        accuracy = metrics.accuracy,
        f1 = metrics.f1_score,
        roc_auc = metrics.roc_auc,
        cv_mean,
        "training finished"
    );

    let mut artifact = ModelArtifact::new(scaler, forest);
    artifact.metrics = Some(metrics);
    Ok(artifact)
}

fn project_rows(rows: &[LabeledRow]) -> Result<(Vec<Vec<f64>>, Vec<u8>)> {
    let mut x = Vec::with_capacity(rows.len());
    let mut y = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if row.label > 1 {
            return Err(Error::Dataset(format!("row {i} has label {}", row.label)));
        }
        let raw: RawFeatures = row.features.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let vector = schema().project(&raw, row.ecosystem);
        if let Some(feature) = vector.first_non_finite() {
            return Err(Error::Dataset(format!("row {i} has non-finite '{feature}'")));
        }
        x.push(vector.values().to_vec());
        y.push(row.label);
    }
    Ok((x, y))
}

/// Per-class shuffled split; each class keeps at least one training row.
fn stratified_split(y: &[u8], test_fraction: f64, rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in [0u8, 1] {
        let mut idx: Vec<usize> = (0..y.len()).filter(|&i| y[i] == class).collect();
        idx.shuffle(rng);
        let mut n_test = (idx.len() as f64 * test_fraction).round() as usize;
        if idx.len() > 1 {
            n_test = n_test.clamp(usize::from(test_fraction > 0.0), idx.len() - 1);
        } else {
            n_test = 0;
        }
        test.extend_from_slice(&idx[..n_test]);
        train.extend_from_slice(&idx[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Bootstrap-aggregated CART trees. Tree `i` draws from its own seeded RNG.
fn fit_forest(x: &[Vec<f64>], y: &[u8], config: &TrainingConfig, seed: u64) -> RandomForest {
    let width = x.first().map(Vec::len).unwrap_or(0);
    let fitted: Vec<(DecisionTree, Vec<f64>)> = (0..config.n_estimators.max(1))
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64 + 1));
            let sample: Vec<usize> = (0..x.len()).map(|_| rng.random_range(0..x.len())).collect();
            let mut builder = TreeBuilder::new(x, y, config, width);
            builder.build(sample, 0, &mut rng);
            builder.finish()
        })
        .collect();

    let mut importances = vec![0.0; width];
    let n_trees = fitted.len() as f64;
    let mut trees = Vec::with_capacity(fitted.len());
    for (tree, tree_importances) in fitted {
        for (total, v) in importances.iter_mut().zip(tree_importances) {
            *total += v / n_trees;
        }
        trees.push(tree);
    }
    normalize(&mut importances);

    RandomForest {
        trees,
        feature_importances: importances,
    }
}

struct TreeBuilder<'a> {
    x: &'a [Vec<f64>],
    y: &'a [u8],
    config: &'a TrainingConfig,
    width: usize,
    max_features: usize,
    nodes: Vec<TreeNode>,
    importances: Vec<f64>,
}

struct Split {
    feature: usize,
    threshold: f64,
    decrease: f64,
}

impl<'a> TreeBuilder<'a> {
    fn new(x: &'a [Vec<f64>], y: &'a [u8], config: &'a TrainingConfig, width: usize) -> Self {
        Self {
            x,
            y,
            config,
            width,
            max_features: ((width as f64).sqrt().round() as usize).clamp(1, width.max(1)),
            nodes: Vec::new(),
            importances: vec![0.0; width],
        }
    }

    /// Append the subtree for `samples` in pre-order and return its root index.
    fn build(&mut self, samples: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let idx = self.nodes.len();
        let positives = samples.iter().filter(|&&i| self.y[i] == 1).count();
        let fraction = if samples.is_empty() {
            0.0
        } else {
            positives as f64 / samples.len() as f64
        };
        self.nodes.push(TreeNode::Leaf { malicious: fraction });

        let pure = positives == 0 || positives == samples.len();
        if pure
            || depth >= self.config.max_depth
            || samples.len() < self.config.min_samples_split
        {
            return idx;
        }

        let Some(split) = self.best_split(&samples, rng) else {
            return idx;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&i| self.x[i][split.feature] <= split.threshold);
        self.importances[split.feature] += split.decrease;

        let left_idx = self.build(left, depth + 1, rng);
        let right_idx = self.build(right, depth + 1, rng);
        self.nodes[idx] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: left_idx,
            right: right_idx,
        };
        idx
    }

    fn best_split(&self, samples: &[usize], rng: &mut StdRng) -> Option<Split> {
        let n = samples.len();
        let total_pos = samples.iter().filter(|&&i| self.y[i] == 1).count();
        let parent = n as f64 * gini(total_pos, n);
        let min_leaf = self.config.min_samples_leaf.max(1);

        // Visit features in random order; constant ones do not count toward
        // max_features, so a node only gives up after every feature is constant.
        let mut order: Vec<usize> = (0..self.width).collect();
        order.shuffle(rng);
        let mut visited = 0;
        let mut best: Option<Split> = None;

        for feature in order {
            if visited >= self.max_features && best.is_some() {
                break;
            }
            let mut sorted: Vec<(f64, u8)> = samples
                .iter()
                .map(|&i| (self.x[i][feature], self.y[i]))
                .collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
            if sorted[0].0 == sorted[n - 1].0 {
                continue;
            }
            visited += 1;

            let mut left_pos = 0;
            for k in 0..n - 1 {
                left_pos += usize::from(sorted[k].1 == 1);
                let left_n = k + 1;
                let right_n = n - left_n;
                if left_n < min_leaf || right_n < min_leaf || sorted[k].0 == sorted[k + 1].0 {
                    continue;
                }
                let children = left_n as f64 * gini(left_pos, left_n)
                    + right_n as f64 * gini(total_pos - left_pos, right_n);
                let decrease = parent - children;
                if decrease > 1e-12 && best.as_ref().is_none_or(|b| decrease > b.decrease) {
                    best = Some(Split {
                        feature,
                        threshold: (sorted[k].0 + sorted[k + 1].0) / 2.0,
                        decrease,
                    });
                }
            }
        }
        best
    }

    fn finish(mut self) -> (DecisionTree, Vec<f64>) {
        normalize(&mut self.importances);
        (DecisionTree { nodes: self.nodes }, self.importances)
    }
}

fn gini(positives: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = positives as f64 / n as f64;
    1.0 - p * p - (1.0 - p) * (1.0 - p)
}

fn normalize(values: &mut [f64]) {
    let sum: f64 = values.iter().sum();
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

/// Stratified k-fold accuracy over the training split: (mean, population std).
fn cross_validate(
    x: &[Vec<f64>],
    y: &[u8],
    config: &TrainingConfig,
    rng: &mut StdRng,
) -> (f64, f64) {
    let k = config.cv_folds;
    if k < 2 || x.len() < k {
        return (0.0, 0.0);
    }

    let mut fold_of = vec![0usize; y.len()];
    for class in [0u8, 1] {
        let mut idx: Vec<usize> = (0..y.len()).filter(|&i| y[i] == class).collect();
        idx.shuffle(rng);
        for (n, i) in idx.into_iter().enumerate() {
            fold_of[i] = n % k;
        }
    }

    let accuracies: Vec<f64> = (0..k)
        .map(|fold| {
            let (train, held): (Vec<usize>, Vec<usize>) =
                (0..y.len()).partition(|&i| fold_of[i] != fold);
            let fx: Vec<Vec<f64>> = train.iter().map(|&i| x[i].clone()).collect();
            let fy: Vec<u8> = train.iter().map(|&i| y[i]).collect();
            let forest = fit_forest(&fx, &fy, config, config.seed.wrapping_add(1_000 * (fold as u64 + 1)));
            let correct = held
                .iter()
                .filter(|&&i| u8::from(forest.predict_proba(&x[i]) >= 0.5) == y[i])
                .count();
            correct as f64 / held.len().max(1) as f64
        })
        .collect();

    let mean = accuracies.iter().sum::<f64>() / k as f64;
    let var = accuracies.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / k as f64;
    (mean, var.sqrt())
}

fn evaluate(scores: &[f64], y: &[u8], cv_mean: f64, cv_std: f64, train_rows: usize) -> ModelMetrics {
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut tn = 0usize;
    let mut fn_ = 0usize;
    for (&s, &label) in scores.iter().zip(y) {
        match (s >= 0.5, label == 1) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fn_ += 1,
        }
    }
    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1_score = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ModelMetrics {
        accuracy: ratio(tp + tn, scores.len()),
        precision,
        recall,
        f1_score,
        roc_auc: roc_auc(scores, y),
        cv_mean,
        cv_std,
        train_rows,
        test_rows: scores.len(),
    }
}

/// Rank-based AUC (Mann-Whitney U) with averaged ranks for ties.
fn roc_auc(scores: &[f64], y: &[u8]) -> f64 {
    let positives = y.iter().filter(|&&l| l == 1).count();
    let negatives = y.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &o in &order[i..=j] {
            ranks[o] = avg;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = (0..y.len()).filter(|&i| y[i] == 1).map(|i| ranks[i]).sum();
    let p = positives as f64;
    (pos_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}
