//! Random-forest surrogate that approximates the promoted clustering's
//! boundaries from the scaled (pre-projection) feature table. It exists to
//! make tree attributions possible and is not required to match the
//! clustering exactly.

use ndarray::{Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SurrogateConfig;
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// `None` marks a leaf.
    pub feature: Option<usize>,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
    /// Training rows (bootstrap duplicates included) that reached this node.
    pub cover: f64,
    /// Class distribution of those rows.
    pub value: Vec<f64>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.feature.is_none()
    }
}

/// CART classification tree, nodes in preorder with the root at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    pub fn leaf_for(&self, row: ArrayView1<f64>) -> &TreeNode {
        let mut idx = 0;
        loop {
            let node = &self.nodes[idx];
            match node.feature {
                None => return node,
                Some(f) => idx = if row[f] <= node.threshold { node.left } else { node.right },
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(tree: &DecisionTree, idx: usize) -> usize {
            let node = &tree.nodes[idx];
            if node.is_leaf() {
                0
            } else {
                1 + walk(tree, node.left).max(walk(tree, node.right))
            }
        }
        walk(self, 0)
    }
}

struct TreeBuilder<'a> {
    x: &'a Array2<f64>,
    y: &'a [usize],
    n_classes: usize,
    max_depth: usize,
    min_leaf: usize,
    max_features: usize,
    rng: StdRng,
    nodes: Vec<TreeNode>,
}

fn gini(counts: &[f64], total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - counts.iter().map(|c| (c / total).powi(2)).sum::<f64>()
}

impl TreeBuilder<'_> {
    fn grow(&mut self, samples: Vec<usize>, depth: usize) -> usize {
        let mut counts = vec![0.0; self.n_classes];
        for &s in &samples {
            counts[self.y[s]] += 1.0;
        }
        let total = samples.len() as f64;
        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            feature: None,
            threshold: 0.0,
            left: 0,
            right: 0,
            cover: total,
            value: counts.iter().map(|c| c / total.max(1.0)).collect(),
        });

        let impurity = gini(&counts, total);
        if depth >= self.max_depth || samples.len() < 2 * self.min_leaf || impurity <= 0.0 {
            return idx;
        }
        let Some((feature, threshold)) = self.best_split(&samples, impurity) else {
            return idx;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&s| self.x[(s, feature)] <= threshold);
        let l = self.grow(left, depth + 1);
        let r = self.grow(right, depth + 1);
        let node = &mut self.nodes[idx];
        node.feature = Some(feature);
        node.threshold = threshold;
        node.left = l;
        node.right = r;
        idx
    }

    fn best_split(&mut self, samples: &[usize], parent_impurity: f64) -> Option<(usize, f64)> {
        let p = self.x.ncols();
        let mut features: Vec<usize> = (0..p).collect();
        let (chosen, _) = features.partial_shuffle(&mut self.rng, self.max_features.min(p));
        let mut chosen = chosen.to_vec();
        chosen.sort_unstable();

        let n = samples.len() as f64;
        let mut best: Option<(usize, f64, f64)> = None;
        for f in chosen {
            let mut sorted: Vec<(f64, usize)> =
                samples.iter().map(|&s| (self.x[(s, f)], self.y[s])).collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            let mut left = vec![0.0; self.n_classes];
            let mut right = vec![0.0; self.n_classes];
            for (_, c) in &sorted {
                right[*c] += 1.0;
            }
            for i in 0..sorted.len() - 1 {
                let c = sorted[i].1;
                left[c] += 1.0;
                right[c] -= 1.0;
                let nl = (i + 1) as f64;
                let nr = n - nl;
                if sorted[i].0 >= sorted[i + 1].0
                    || (i + 1) < self.min_leaf
                    || sorted.len() - (i + 1) < self.min_leaf
                {
                    continue;
                }
                let weighted = (nl * gini(&left, nl) + nr * gini(&right, nr)) / n;
                if weighted < parent_impurity - 1e-12
                    && best.is_none_or(|(_, _, b)| weighted < b - 1e-12)
                {
                    best = Some((f, 0.5 * (sorted[i].0 + sorted[i + 1].0), weighted));
                }
            }
        }
        best.map(|(f, t, _)| (f, t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateModel {
    pub feature_names: Vec<String>,
    pub n_classes: usize,
    pub trees: Vec<DecisionTree>,
    /// Stratified held-out accuracy of a forest trained without the holdout.
    /// Recorded, never gated.
    pub holdout_accuracy: Option<f64>,
    pub train_accuracy: f64,
    pub seed: u64,
}

impl SurrogateModel {
    /// Fits a holdout forest for the accuracy check, then the persisted forest
    /// on every row.
    pub fn fit(
        x: &Array2<f64>,
        y: &[usize],
        feature_names: &[String],
        cfg: &SurrogateConfig,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        if x.nrows() != y.len() || x.nrows() < 2 {
            return Err(PipelineError::insufficient_data(2.max(y.len()), x.nrows()));
        }
        let n_classes = y.iter().copied().max().map_or(0, |m| m + 1);

        let (train, holdout) = stratified_split(y, cfg.holdout_fraction, seed);
        let holdout_accuracy = if holdout.is_empty() || train.is_empty() {
            None
        } else {
            let xt = x.select(Axis(0), &train);
            let yt: Vec<usize> = train.iter().map(|&i| y[i]).collect();
            let trees = fit_forest(&xt, &yt, n_classes, cfg, seed);
            let probe = Self {
                feature_names: feature_names.to_vec(),
                n_classes,
                trees,
                holdout_accuracy: None,
                train_accuracy: 0.0,
                seed,
            };
            let xh = x.select(Axis(0), &holdout);
            let yh: Vec<usize> = holdout.iter().map(|&i| y[i]).collect();
            Some(probe.accuracy(&xh, &yh))
        };

        let mut model = Self {
            feature_names: feature_names.to_vec(),
            n_classes,
            trees: fit_forest(x, y, n_classes, cfg, seed),
            holdout_accuracy,
            train_accuracy: 0.0,
            seed,
        };
        model.train_accuracy = model.accuracy(x, y);
        info!(
            trees = model.trees.len(),
            classes = n_classes,
            train_accuracy = model.train_accuracy,
            holdout_accuracy = model.holdout_accuracy.unwrap_or(f64::NAN),
            "surrogate fit"
        );
        Ok(model)
    }

    /// Mean leaf class distribution across trees.
    pub fn predict_proba(&self, row: ArrayView1<f64>) -> Vec<f64> {
        let mut out = vec![0.0; self.n_classes];
        for tree in &self.trees {
            for (o, v) in out.iter_mut().zip(&tree.leaf_for(row).value) {
                *o += v;
            }
        }
        let t = self.trees.len().max(1) as f64;
        out.iter_mut().for_each(|o| *o /= t);
        out
    }

    pub fn predict(&self, row: ArrayView1<f64>) -> usize {
        argmax(&self.predict_proba(row))
    }

    pub fn accuracy(&self, x: &Array2<f64>, y: &[usize]) -> f64 {
        if y.is_empty() {
            return 0.0;
        }
        let hits = x
            .rows()
            .into_iter()
            .zip(y)
            .filter(|(row, label)| self.predict(*row) == **label)
            .count();
        hits as f64 / y.len() as f64
    }
}

pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

fn fit_forest(
    x: &Array2<f64>,
    y: &[usize],
    n_classes: usize,
    cfg: &SurrogateConfig,
    seed: u64,
) -> Vec<DecisionTree> {
    let n = x.nrows();
    let max_features = ((x.ncols() as f64).sqrt().floor() as usize).max(1);
    (0..cfg.n_trees)
        .into_par_iter()
        .map(|t| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
            let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let mut builder = TreeBuilder {
                x,
                y,
                n_classes,
                max_depth: cfg.max_depth,
                min_leaf: cfg.min_samples_leaf.max(1),
                max_features,
                rng,
                nodes: Vec::new(),
            };
            builder.grow(rows, 0);
            DecisionTree {
                nodes: builder.nodes,
            }
        })
        .collect()
}

/// Per-class holdout of `round(fraction * class_size)` rows, shuffled with
/// `seed`. Classes with a single member stay in training.
fn stratified_split(y: &[usize], fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_classes = y.iter().copied().max().map_or(0, |m| m + 1);
    let mut train = Vec::new();
    let mut holdout = Vec::new();
    for class in 0..n_classes {
        let mut members: Vec<usize> = (0..y.len()).filter(|&i| y[i] == class).collect();
        members.shuffle(&mut rng);
        let take = if members.len() < 2 {
            0
        } else {
            ((members.len() as f64 * fraction).round() as usize).min(members.len() - 1)
        };
        holdout.extend_from_slice(&members[..take]);
        train.extend_from_slice(&members[take..]);
    }
    train.sort_unstable();
    holdout.sort_unstable();
    (train, holdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable() -> (Array2<f64>, Vec<usize>) {
        let x = Array2::from_shape_fn((60, 4), |(i, j)| {
            let class = i / 20;
            let noise = ((i * 13 + j * 7) % 9) as f64 / 30.0;
            match j {
                0 => class as f64 * 2.0 + noise,
                1 => if class == 2 { 3.0 + noise } else { noise },
                _ => noise,
            }
        });
        let y = (0..60).map(|i| i / 20).collect();
        (x, y)
    }

    fn names() -> Vec<String> {
        (0..4).map(|i| format!("f{i}")).collect()
    }

    #[test]
    fn forest_learns_separable_classes() {
        let (x, y) = separable();
        let cfg = SurrogateConfig {
            n_trees: 25,
            ..SurrogateConfig::default()
        };
        let model = SurrogateModel::fit(&x, &y, &names(), &cfg, 5).unwrap();
        assert_eq!(model.n_classes, 3);
        assert!(model.train_accuracy > 0.95);
        assert!(model.holdout_accuracy.unwrap() > 0.8);
        for tree in &model.trees {
            assert!(tree.depth() <= cfg.max_depth);
        }
    }

    #[test]
    fn probabilities_sum_to_one() {
        let (x, y) = separable();
        let model = SurrogateModel::fit(&x, &y, &names(), &SurrogateConfig::default(), 1).unwrap();
        for row in x.rows() {
            let p = model.predict_proba(row);
            assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn covers_are_consistent() {
        let (x, y) = separable();
        let model = SurrogateModel::fit(&x, &y, &names(), &SurrogateConfig::default(), 2).unwrap();
        for tree in &model.trees {
            assert_eq!(tree.nodes[0].cover, 60.0);
            for node in tree.nodes.iter().filter(|n| !n.is_leaf()) {
                let sum = tree.nodes[node.left].cover + tree.nodes[node.right].cover;
                assert_eq!(node.cover, sum);
            }
        }
    }

    #[test]
    fn split_is_stratified_and_seeded() {
        let y: Vec<usize> = (0..50).map(|i| if i < 40 { 0 } else { 1 }).collect();
        let (train, holdout) = stratified_split(&y, 0.2, 9);
        assert_eq!(holdout.len(), 10);
        assert_eq!(holdout.iter().filter(|&&i| y[i] == 1).count(), 2);
        assert_eq!(train.len() + holdout.len(), 50);
        assert_eq!(stratified_split(&y, 0.2, 9), (train, holdout));
    }

    #[test]
    fn same_seed_same_forest() {
        let (x, y) = separable();
        let cfg = SurrogateConfig {
            n_trees: 10,
            ..SurrogateConfig::default()
        };
        let a = SurrogateModel::fit(&x, &y, &names(), &cfg, 3).unwrap();
        let b = SurrogateModel::fit(&x, &y, &names(), &cfg, 3).unwrap();
        assert_eq!(a, b);
    }
}
