//! Shapley attributions for the surrogate forest and the permutation
//! importance cross-check.
//!
//! Tree attributions use the exact path-dependent TreeSHAP recursion, so for
//! every player `baseline + sum(contributions) == score` for the class being
//! explained.

use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::surrogate::{DecisionTree, SurrogateModel};

#[derive(Debug, Clone, Copy, Default)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    pweight: f64,
}

fn extend_path(path: &mut Vec<PathElement>, zero: f64, one: f64, feature: Option<usize>) {
    let d = path.len();
    path.push(PathElement {
        feature,
        zero_fraction: zero,
        one_fraction: one,
        pweight: if d == 0 { 1.0 } else { 0.0 },
    });
    for i in (0..d).rev() {
        path[i + 1].pweight += one * path[i].pweight * (i + 1) as f64 / (d + 1) as f64;
        path[i].pweight = zero * path[i].pweight * (d - i) as f64 / (d + 1) as f64;
    }
}

fn unwind_path(path: &mut Vec<PathElement>, index: usize) {
    let d = path.len() - 1;
    let one = path[index].one_fraction;
    let zero = path[index].zero_fraction;
    let mut next = path[d].pweight;
    for i in (0..d).rev() {
        if one != 0.0 {
            let tmp = path[i].pweight;
            path[i].pweight = next * (d + 1) as f64 / ((i + 1) as f64 * one);
            next = tmp - path[i].pweight * zero * (d - i) as f64 / (d + 1) as f64;
        } else {
            path[i].pweight = path[i].pweight * (d + 1) as f64 / (zero * (d - i) as f64);
        }
    }
    for i in index..d {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

fn unwound_path_sum(path: &[PathElement], index: usize) -> f64 {
    let d = path.len() - 1;
    let one = path[index].one_fraction;
    let zero = path[index].zero_fraction;
    let mut next = path[d].pweight;
    let mut total = 0.0;
    for i in (0..d).rev() {
        if one != 0.0 {
            let tmp = next * (d + 1) as f64 / ((i + 1) as f64 * one);
            total += tmp;
            next = path[i].pweight - tmp * zero * (d - i) as f64 / (d + 1) as f64;
        } else {
            total += path[i].pweight / zero * (d + 1) as f64 / (d - i) as f64;
        }
    }
    total
}

struct TreeShap<'a> {
    tree: &'a DecisionTree,
    row: &'a [f64],
    class: usize,
}

impl TreeShap<'_> {
    fn recurse(
        &self,
        node: usize,
        phi: &mut [f64],
        parent: &[PathElement],
        zero: f64,
        one: f64,
        feature: Option<usize>,
    ) {
        let mut path = parent.to_vec();
        extend_path(&mut path, zero, one, feature);
        let n = &self.tree.nodes[node];

        let Some(split) = n.feature else {
            let leaf = n.value[self.class];
            for i in 1..path.len() {
                let w = unwound_path_sum(&path, i);
                let el = path[i];
                if let Some(f) = el.feature {
                    phi[f] += w * (el.one_fraction - el.zero_fraction) * leaf;
                }
            }
            return;
        };

        let (hot, cold) = if self.row[split] <= n.threshold {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };
        let mut incoming_zero = 1.0;
        let mut incoming_one = 1.0;
        if let Some(k) = (1..path.len()).find(|&k| path[k].feature == Some(split)) {
            incoming_zero = path[k].zero_fraction;
            incoming_one = path[k].one_fraction;
            unwind_path(&mut path, k);
        }
        let hot_zero = self.tree.nodes[hot].cover / n.cover;
        let cold_zero = self.tree.nodes[cold].cover / n.cover;
        self.recurse(hot, phi, &path, hot_zero * incoming_zero, incoming_one, Some(split));
        self.recurse(cold, phi, &path, cold_zero * incoming_zero, 0.0, Some(split));
    }
}

/// Cover-weighted mean leaf value for `class`: the tree's output with no
/// feature known.
pub fn expected_value(tree: &DecisionTree, class: usize) -> f64 {
    let root = tree.nodes[0].cover;
    tree.nodes
        .iter()
        .filter(|n| n.is_leaf())
        .map(|n| n.cover / root * n.value[class])
        .sum()
}

/// Per-feature Shapley values of one tree's `class` output at `row`.
pub fn tree_shap(tree: &DecisionTree, row: &[f64], class: usize) -> Vec<f64> {
    let mut phi = vec![0.0; row.len()];
    TreeShap { tree, row, class }.recurse(0, &mut phi, &[], 1.0, 1.0, None);
    phi
}

/// Forest-averaged `(baseline, contributions)` for `class` at `row`.
pub fn forest_shap(model: &SurrogateModel, row: &[f64], class: usize) -> (f64, Vec<f64>) {
    let mut phi = vec![0.0; row.len()];
    let mut baseline = 0.0;
    for tree in &model.trees {
        baseline += expected_value(tree, class);
        for (acc, v) in phi.iter_mut().zip(tree_shap(tree, row, class)) {
            *acc += v;
        }
    }
    let t = model.trees.len().max(1) as f64;
    phi.iter_mut().for_each(|v| *v /= t);
    (baseline / t, phi)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub feature: String,
    pub value: f64,
}

/// Either one player's explanation (`player_id` set) or the population-wide
/// ranking (`player_id` empty, contributions are mean magnitudes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub player_id: Option<String>,
    pub class: Option<usize>,
    pub baseline: f64,
    pub score: f64,
    pub contributions: Vec<Contribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationImportance {
    pub feature: String,
    /// Accuracy drop averaged over repeats.
    pub mean_drop: f64,
    pub drops: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub global: AttributionRecord,
    /// Top-k signed contributions per player, in player order.
    pub local: Vec<AttributionRecord>,
    pub permutation: Vec<PermutationImportance>,
    pub baseline_accuracy: f64,
    /// Non-fatal disagreement flags.
    pub warnings: Vec<PipelineError>,
}

pub struct Explainer {
    top_k: usize,
    repeats: usize,
    threshold: f64,
    seed: u64,
}

impl Explainer {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            top_k: cfg.top_k_attribution,
            repeats: cfg.permutation_repeats.max(1),
            threshold: cfg.disagreement_threshold,
            seed: cfg.seed,
        }
    }

    /// Explains every player's assigned class. `x` is the scaled feature table
    /// the surrogate was fit on.
    pub fn explain(
        &self,
        model: &SurrogateModel,
        x: &Array2<f64>,
        player_ids: &[String],
        classes: &[usize],
    ) -> AttributionReport {
        let names = &model.feature_names;
        let full: Vec<(f64, Vec<f64>)> = x
            .rows()
            .into_iter()
            .zip(classes)
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(row, class)| forest_shap(model, &row.to_vec(), **class))
            .collect();

        let n = full.len().max(1) as f64;
        let mut magnitude = vec![0.0; names.len()];
        for (_, phi) in &full {
            for (m, v) in magnitude.iter_mut().zip(phi) {
                *m += v.abs() / n;
            }
        }
        let mut global_contribs: Vec<Contribution> = names
            .iter()
            .zip(&magnitude)
            .map(|(f, v)| Contribution {
                feature: f.clone(),
                value: *v,
            })
            .collect();
        global_contribs.sort_by(|a, b| b.value.total_cmp(&a.value).then(a.feature.cmp(&b.feature)));

        let local: Vec<AttributionRecord> = full
            .iter()
            .zip(player_ids.iter().zip(classes))
            .map(|((baseline, phi), (id, class))| {
                let score = baseline + phi.iter().sum::<f64>();
                let mut contribs: Vec<Contribution> = names
                    .iter()
                    .zip(phi)
                    .map(|(f, v)| Contribution {
                        feature: f.clone(),
                        value: *v,
                    })
                    .collect();
                contribs.sort_by(|a, b| {
                    b.value.total_cmp(&a.value).then(a.feature.cmp(&b.feature))
                });
                contribs.truncate(self.top_k);
                AttributionRecord {
                    player_id: Some(id.clone()),
                    class: Some(*class),
                    baseline: *baseline,
                    score,
                    contributions: contribs,
                }
            })
            .collect();

        let baseline_accuracy = model.accuracy(x, classes);
        let permutation = self.permutation_importance(model, x, classes, baseline_accuracy);
        let warnings = self.disagreements(&magnitude, &permutation);

        let global = AttributionRecord {
            player_id: None,
            class: None,
            baseline: full.iter().map(|(b, _)| b).sum::<f64>() / n,
            score: local.iter().map(|r| r.score).sum::<f64>() / n,
            contributions: global_contribs,
        };
        info!(
            players = local.len(),
            top_feature = %global.contributions.first().map(|c| c.feature.as_str()).unwrap_or("-"),
            warnings = warnings.len(),
            "attributions computed"
        );
        AttributionReport {
            global,
            local,
            permutation,
            baseline_accuracy,
            warnings,
        }
    }

    pub fn permutation_importance(
        &self,
        model: &SurrogateModel,
        x: &Array2<f64>,
        y: &[usize],
        baseline_accuracy: f64,
    ) -> Vec<PermutationImportance> {
        (0..x.ncols())
            .into_par_iter()
            .map(|j| {
                let drops: Vec<f64> = (0..self.repeats)
                    .map(|r| {
                        let mut rng = StdRng::seed_from_u64(
                            self.seed.wrapping_add((j * self.repeats + r) as u64),
                        );
                        let mut column: Vec<f64> = x.column(j).to_vec();
                        column.shuffle(&mut rng);
                        let mut shuffled = x.clone();
                        for (dst, v) in shuffled.column_mut(j).iter_mut().zip(column) {
                            *dst = v;
                        }
                        baseline_accuracy - model.accuracy(&shuffled, y)
                    })
                    .collect();
                PermutationImportance {
                    feature: model.feature_names[j].clone(),
                    mean_drop: drops.iter().sum::<f64>() / drops.len() as f64,
                    drops,
                }
            })
            .collect()
    }

    fn disagreements(
        &self,
        shapley: &[f64],
        permutation: &[PermutationImportance],
    ) -> Vec<PipelineError> {
        let shap_shares = shares(shapley);
        let perm: Vec<f64> = permutation.iter().map(|p| p.mean_drop.max(0.0)).collect();
        let perm_shares = shares(&perm);
        let mut out = Vec::new();
        for ((p, s), q) in permutation.iter().zip(shap_shares).zip(perm_shares) {
            if (s - q).abs() > self.threshold {
                warn!(
                    feature = %p.feature,
                    shapley_share = s,
                    permutation_share = q,
                    "attribution methods disagree"
                );
                out.push(PipelineError::AttributionDisagreement {
                    feature: p.feature.clone(),
                    shapley_share: s,
                    permutation_share: q,
                });
            }
        }
        out
    }
}

fn shares(values: &[f64]) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    if total <= 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| v / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SurrogateConfig;
    use crate::surrogate::TreeNode;

    fn leaf(cover: f64, p1: f64) -> TreeNode {
        TreeNode {
            feature: None,
            threshold: 0.0,
            left: 0,
            right: 0,
            cover,
            value: vec![1.0 - p1, p1],
        }
    }

    fn split(feature: usize, threshold: f64, left: usize, right: usize, cover: f64) -> TreeNode {
        TreeNode {
            feature: Some(feature),
            threshold,
            left,
            right,
            cover,
            value: vec![0.5, 0.5],
        }
    }

    /// x0 <= 0 -> (x1 <= 0 -> 0.0 | 1.0), else 0.5; covers 4 / 2 / 1 / 1 / 2.
    fn small_tree() -> DecisionTree {
        DecisionTree {
            nodes: vec![
                split(0, 0.0, 1, 4, 4.0),
                split(1, 0.0, 2, 3, 2.0),
                leaf(1.0, 0.0),
                leaf(1.0, 1.0),
                leaf(2.0, 0.5),
            ],
        }
    }

    #[test]
    fn single_split_matches_closed_form() {
        let tree = DecisionTree {
            nodes: vec![split(0, 0.0, 1, 2, 4.0), leaf(3.0, 0.0), leaf(1.0, 1.0)],
        };
        // E[f] = 0.25; at x0 > 0 the output is 1, so phi0 = 0.75.
        let phi = tree_shap(&tree, &[1.0, 7.0], 1);
        assert!((expected_value(&tree, 1) - 0.25).abs() < 1e-12);
        assert!((phi[0] - 0.75).abs() < 1e-12);
        assert_eq!(phi[1], 0.0);
    }

    #[test]
    fn contributions_sum_to_output_minus_baseline() {
        let tree = small_tree();
        for row in [[-1.0, -1.0], [-1.0, 1.0], [1.0, -1.0], [1.0, 1.0]] {
            let phi = tree_shap(&tree, &row, 1);
            let out = tree.leaf_for(ndarray::ArrayView1::from(&row[..])).value[1];
            let total = expected_value(&tree, 1) + phi.iter().sum::<f64>();
            assert!((total - out).abs() < 1e-12, "row {row:?}");
        }
    }

    #[test]
    fn exact_values_for_interaction_tree() {
        // Brute-force Shapley with path-dependent conditioning for x = (-1, 1):
        // v({}) = 0.5, v({0}) = 0.5, v({1}) = 0.5*1.0 + 0.5*0.5 = 0.75, v({0,1}) = 1.0.
        // phi0 = 0.5*(0.5-0.5) + 0.5*(1.0-0.75) = 0.125, phi1 = 0.5*0.25 + 0.5*0.5 = 0.375.
        let phi = tree_shap(&small_tree(), &[-1.0, 1.0], 1);
        assert!((phi[0] - 0.125).abs() < 1e-12);
        assert!((phi[1] - 0.375).abs() < 1e-12);
    }

    fn importance(feature: &str, mean_drop: f64) -> PermutationImportance {
        PermutationImportance {
            feature: feature.to_string(),
            mean_drop,
            drops: vec![mean_drop],
        }
    }

    #[test]
    fn diverging_importances_are_flagged_per_feature() {
        let explainer = Explainer::new(&PipelineConfig {
            disagreement_threshold: 0.25,
            ..PipelineConfig::default()
        });
        // Shares: shapley 0.6 / 0.3 / 0.1, permutation 0.2 / 0.4 / 0.4.
        let shapley = [0.6, 0.3, 0.1];
        let permutation = [
            importance("tackles_p90", 0.02),
            importance("goals_p90", 0.04),
            importance("aerials_won_p90", 0.04),
        ];
        let warnings = explainer.disagreements(&shapley, &permutation);
        assert_eq!(warnings.len(), 2);
        match &warnings[0] {
            PipelineError::AttributionDisagreement {
                feature,
                shapley_share,
                permutation_share,
            } => {
                assert_eq!(feature, "tackles_p90");
                assert!((shapley_share - 0.6).abs() < 1e-12);
                assert!((permutation_share - 0.2).abs() < 1e-12);
            }
            other => panic!("unexpected warning {other:?}"),
        }
        assert!(matches!(
            &warnings[1],
            PipelineError::AttributionDisagreement { feature, .. } if feature == "aerials_won_p90"
        ));
        assert!(warnings.iter().all(|w| !w.is_fatal()));
    }

    #[test]
    fn agreeing_importances_raise_no_warning() {
        let explainer = Explainer::new(&PipelineConfig::default());
        let permutation = [importance("a", 0.05), importance("b", -0.01)];
        // Negative drops count as zero: shares are 1.0 / 0.0 on both sides.
        assert!(explainer.disagreements(&[2.0, 0.0], &permutation).is_empty());
    }

    #[test]
    fn forest_attributions_are_additive_and_ranked() {
        let x = Array2::from_shape_fn((40, 3), |(i, j)| {
            let class = i / 20;
            let noise = ((i * 11 + j * 5) % 7) as f64 / 20.0;
            if j == 0 { class as f64 * 3.0 + noise } else { noise }
        });
        let y: Vec<usize> = (0..40).map(|i| i / 20).collect();
        let names: Vec<String> = ["signal", "noise_a", "noise_b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cfg = SurrogateConfig {
            n_trees: 15,
            ..SurrogateConfig::default()
        };
        let model = SurrogateModel::fit(&x, &y, &names, &cfg, 4).unwrap();
        let ids: Vec<String> = (0..40).map(|i| format!("p{i}")).collect();
        let explainer = Explainer::new(&PipelineConfig {
            top_k_attribution: 2,
            ..PipelineConfig::default()
        });
        let report = explainer.explain(&model, &x, &ids, &y);

        for (i, rec) in report.local.iter().enumerate() {
            let proba = model.predict_proba(x.row(i))[y[i]];
            assert!((rec.score - proba).abs() < 1e-9);
            assert_eq!(rec.contributions.len(), 2);
            assert!(rec.contributions[0].value >= rec.contributions[1].value);
        }
        assert_eq!(report.global.player_id, None);
        assert_eq!(report.permutation.len(), 3);
        assert!(report.warnings.iter().all(|w| !w.is_fatal()));
    }

    #[test]
    fn shares_of_zero_vector_are_zero() {
        assert_eq!(shares(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert_eq!(shares(&[1.0, 3.0]), vec![0.25, 0.75]);
    }
}
