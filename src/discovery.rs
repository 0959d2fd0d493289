//! Role discovery: the model-selection grid, the shortlist handed to an
//! interpretability reviewer, and the promoted role assignments.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster_metrics::{QualityScores, euclidean, quality_scores};
use crate::clustering::{ClusterModel, FitOptions};
use crate::config::{ClusterFamily, PipelineConfig};
use crate::dataset::PlayerRecord;
use crate::error::PipelineError;
use crate::features::FeatureSet;
use crate::projector::ProjectorModel;

const SIGNATURE_LEN: usize = 3;
const TIE_TOL: f64 = 1e-9;

/// Fixed legend palette, indexed by cluster id.
pub const PALETTE: [&str; 12] = [
    "#1f77b4", "#d62728", "#2ca02c", "#ff7f0e", "#9467bd", "#8c564b", "#e377c2", "#17becf",
    "#bcbd22", "#7f7f7f", "#393b79", "#637939",
];

/// Per-evaluation seed, stable across runs and platforms.
pub fn evaluation_seed(seed: u64, k: usize, family: ClusterFamily) -> u64 {
    let family_code: u64 = match family {
        ClusterFamily::KMeans => 1,
        ClusterFamily::GaussianMixture => 2,
    };
    let mixed = ((k as u64) << 8 | family_code).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    seed ^ (mixed ^ (mixed >> 29))
}

/// One cell of the model-selection grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationScore {
    pub k: usize,
    pub family: ClusterFamily,
    pub seed: u64,
    pub scores: QualityScores,
    pub silhouette_rank: f64,
    pub davies_bouldin_rank: f64,
    pub calinski_harabasz_rank: f64,
    /// Mean of the three metric ranks, 1 is best.
    pub combined_rank: f64,
    /// Metrics on which this cell is best among cells sharing its combined rank.
    pub pareto_wins: usize,
    /// Distinct cluster ids actually used; below `k` means a collapsed fit.
    pub populated_clusters: usize,
}

impl ConfigurationScore {
    pub fn is_degenerate(&self) -> bool {
        self.populated_clusters < self.k
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDeviation {
    pub feature: String,
    /// Cluster mean minus population mean, in population standard deviations.
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub cluster: usize,
    pub size: usize,
    /// Model center mapped back to scaled feature units.
    pub center_scaled: Vec<f64>,
    /// Model center mapped back to winsorized per-90 units.
    pub center_original: Vec<f64>,
    /// Every retained feature, most positive deviation first.
    pub deviations: Vec<FeatureDeviation>,
    /// Features with the largest positive deviations.
    pub signature: Vec<String>,
    /// Players nearest the center, closest first.
    pub representatives: Vec<String>,
}

/// A configuration handed to the interpretability reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortlistedConfiguration {
    pub k: usize,
    pub family: ClusterFamily,
    pub scores: QualityScores,
    pub combined_rank: f64,
    pub feature_names: Vec<String>,
    pub clusters: Vec<ClusterProfile>,
    /// Quality thresholds this configuration misses. Informational only.
    pub advisories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve { index: usize, rationale: String },
    Reject { rationale: String },
}

impl ReviewDecision {
    pub fn rationale(&self) -> &str {
        match self {
            ReviewDecision::Approve { rationale, .. } | ReviewDecision::Reject { rationale } => {
                rationale
            }
        }
    }
}

/// Decision point between the numeric shortlist and promotion. Nothing is
/// promoted without an explicit approval from an implementation of this trait.
pub trait InterpretabilityReview {
    fn review(&self, shortlist: &[ShortlistedConfiguration]) -> ReviewDecision;
}

impl<F> InterpretabilityReview for F
where
    F: Fn(&[ShortlistedConfiguration]) -> ReviewDecision,
{
    fn review(&self, shortlist: &[ShortlistedConfiguration]) -> ReviewDecision {
        self(shortlist)
    }
}

/// Policy reviewer: approves the first shortlisted configuration in which
/// every cluster has a clear positive signature, no two clusters share the
/// same leading signature pair, and no cluster is smaller than
/// `min_cluster_size`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistinctPrototypeReview {
    pub min_cluster_size: usize,
    pub min_signature_z: f64,
}

impl Default for DistinctPrototypeReview {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            min_signature_z: 0.5,
        }
    }
}

impl DistinctPrototypeReview {
    fn check(&self, cfg: &ShortlistedConfiguration) -> Result<(), String> {
        let mut seen: BTreeMap<(String, String), usize> = BTreeMap::new();
        for c in &cfg.clusters {
            if c.size < self.min_cluster_size {
                return Err(format!(
                    "cluster {} has {} players (< {})",
                    c.cluster, c.size, self.min_cluster_size
                ));
            }
            let Some(top) = c.deviations.first() else {
                return Err(format!("cluster {} has no features", c.cluster));
            };
            if top.z < self.min_signature_z {
                return Err(format!(
                    "cluster {} has no distinctive feature (best {} at z={:.2})",
                    c.cluster, top.feature, top.z
                ));
            }
            let key = (
                c.signature.first().cloned().unwrap_or_default(),
                c.signature.get(1).cloned().unwrap_or_default(),
            );
            if let Some(other) = seen.insert(key.clone(), c.cluster) {
                return Err(format!(
                    "clusters {other} and {} share the prototype {}+{}",
                    c.cluster, key.0, key.1
                ));
            }
        }
        Ok(())
    }
}

impl InterpretabilityReview for DistinctPrototypeReview {
    fn review(&self, shortlist: &[ShortlistedConfiguration]) -> ReviewDecision {
        let mut reasons = Vec::new();
        for (index, cfg) in shortlist.iter().enumerate() {
            match self.check(cfg) {
                Ok(()) => {
                    return ReviewDecision::Approve {
                        index,
                        rationale: format!(
                            "policy review: K={} {} has {} distinct prototypes",
                            cfg.k,
                            cfg.family.label(),
                            cfg.k
                        ),
                    };
                }
                Err(reason) => {
                    reasons.push(format!("K={} {}: {reason}", cfg.k, cfg.family.label()))
                }
            }
        }
        ReviewDecision::Reject {
            rationale: format!("policy review rejected all: {}", reasons.join("; ")),
        }
    }
}

/// A human decision recorded ahead of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedReview {
    pub k: usize,
    pub family: ClusterFamily,
    pub rationale: String,
}

impl RecordedReview {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse review {}", path.display()))
    }
}

impl InterpretabilityReview for RecordedReview {
    fn review(&self, shortlist: &[ShortlistedConfiguration]) -> ReviewDecision {
        match shortlist
            .iter()
            .position(|c| c.k == self.k && c.family == self.family)
        {
            Some(index) => ReviewDecision::Approve {
                index,
                rationale: self.rationale.clone(),
            },
            None => ReviewDecision::Reject {
                rationale: format!(
                    "recorded approval for K={} {} is not on the shortlist ({})",
                    self.k,
                    self.family.label(),
                    self.rationale
                ),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleLegendEntry {
    pub name: String,
    pub color: String,
    pub signature: Vec<String>,
}

/// Cluster id to display name and color. Built once per bundle.
pub type RoleLegend = BTreeMap<usize, RoleLegendEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub player_id: String,
    pub player: String,
    pub team: String,
    pub cluster: usize,
    pub role_name: String,
    pub confidence: f64,
}

/// The promoted clustering together with its legend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleModel {
    pub k: usize,
    pub family: ClusterFamily,
    pub clustering: ClusterModel,
    pub legend: RoleLegend,
}

impl RoleModel {
    /// Cluster id, role name and confidence for one projected vector.
    pub fn assign(&self, projected: &[f64]) -> (usize, String, f64) {
        let row = Array1::from(projected.to_vec());
        let (cluster, confidence) = self.clustering.assign(row.view());
        let name = self
            .legend
            .get(&cluster)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| format!("Role {cluster}"));
        (cluster, name, confidence)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelectionReport {
    /// Every evaluated configuration, in grid order (K ascending, then family).
    pub grid: Vec<ConfigurationScore>,
    /// Indices into `grid`, best first.
    pub ranking: Vec<usize>,
    pub shortlist: Vec<ShortlistedConfiguration>,
    pub decision: ReviewDecision,
    pub promoted_k: usize,
    pub promoted_family: ClusterFamily,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub report: ModelSelectionReport,
    pub role_model: RoleModel,
    pub assignments: Vec<RoleAssignment>,
}

impl Discovery {
    pub fn labels(&self) -> Vec<usize> {
        self.assignments.iter().map(|a| a.cluster).collect()
    }
}

/// Everything the discoverer reads. All borrowed, nothing mutated.
#[derive(Clone, Copy)]
pub struct DiscoveryInput<'a> {
    pub records: &'a [PlayerRecord],
    pub features: &'a FeatureSet,
    pub projector: &'a ProjectorModel,
    pub projected: &'a Array2<f64>,
}

struct Evaluated {
    score: ConfigurationScore,
    model: ClusterModel,
    labels: Vec<usize>,
}

pub struct RoleDiscoverer {
    k_values: Vec<usize>,
    families: Vec<ClusterFamily>,
    seed: u64,
    opts: FitOptions,
    shortlist_size: usize,
    representatives: usize,
    min_silhouette: f64,
    max_davies_bouldin: f64,
}

impl RoleDiscoverer {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            k_values: cfg.k_values(),
            families: cfg.families.clone(),
            seed: cfg.seed,
            opts: FitOptions {
                restarts: cfg.kmeans_restarts,
                max_iterations: cfg.max_iterations,
            },
            shortlist_size: cfg.shortlist_size,
            representatives: cfg.representatives_per_cluster,
            min_silhouette: cfg.advisory_min_silhouette,
            max_davies_bouldin: cfg.advisory_max_davies_bouldin,
        }
    }

    fn evaluate_grid(&self, x: &Array2<f64>) -> Result<Vec<Evaluated>, PipelineError> {
        let cells: Vec<(usize, ClusterFamily)> = self
            .k_values
            .iter()
            .flat_map(|&k| self.families.iter().map(move |&f| (k, f)))
            .collect();
        let max_k = cells.iter().map(|c| c.0).max().unwrap_or(0);
        if x.nrows() <= max_k {
            return Err(PipelineError::insufficient_data(max_k + 1, x.nrows()));
        }

        let evaluated: Vec<Result<Evaluated, PipelineError>> = cells
            .par_iter()
            .map(|&(k, family)| {
                let seed = evaluation_seed(self.seed, k, family);
                let model = ClusterModel::fit(family, x, k, self.opts, seed)?;
                let labels = model.predict(x);
                let scores = quality_scores(x, &labels);
                let mut used = labels.clone();
                used.sort_unstable();
                used.dedup();
                Ok(Evaluated {
                    score: ConfigurationScore {
                        k,
                        family,
                        seed,
                        scores,
                        silhouette_rank: 0.0,
                        davies_bouldin_rank: 0.0,
                        calinski_harabasz_rank: 0.0,
                        combined_rank: 0.0,
                        pareto_wins: 0,
                        populated_clusters: used.len(),
                    },
                    model,
                    labels,
                })
            })
            .collect();
        let mut evaluated = evaluated.into_iter().collect::<Result<Vec<_>, _>>()?;
        rank_grid(&mut evaluated);

        for e in &evaluated {
            info!(
                k = e.score.k,
                family = e.score.family.label(),
                silhouette = e.score.scores.silhouette,
                davies_bouldin = e.score.scores.davies_bouldin,
                calinski_harabasz = e.score.scores.calinski_harabasz,
                combined_rank = e.score.combined_rank,
                "grid cell evaluated"
            );
        }
        Ok(evaluated)
    }

    pub fn discover(
        &self,
        input: DiscoveryInput<'_>,
        reviewer: &dyn InterpretabilityReview,
    ) -> Result<Discovery, PipelineError> {
        let evaluated = self.evaluate_grid(input.projected)?;
        let ranking = ranking_order(&evaluated);

        let shortlisted = self.pick_shortlist(&evaluated, &ranking);
        if shortlisted.is_empty() {
            return Err(PipelineError::NoInterpretableConfiguration {
                reason: "every grid configuration collapsed to fewer clusters than K".into(),
            });
        }
        let shortlist: Vec<ShortlistedConfiguration> = shortlisted
            .iter()
            .map(|&idx| self.describe(&evaluated[idx], input))
            .collect();
        for s in &shortlist {
            info!(
                k = s.k,
                family = s.family.label(),
                advisories = s.advisories.len(),
                "shortlisted"
            );
        }

        let decision = reviewer.review(&shortlist);
        let index = match &decision {
            ReviewDecision::Approve { index, .. } if *index < shortlist.len() => *index,
            ReviewDecision::Approve { index, rationale } => {
                return Err(PipelineError::NoInterpretableConfiguration {
                    reason: format!(
                        "approval points at shortlist entry {index} of {}: {rationale}",
                        shortlist.len()
                    ),
                });
            }
            ReviewDecision::Reject { rationale } => {
                warn!(rationale = %rationale, "shortlist rejected");
                return Err(PipelineError::NoInterpretableConfiguration {
                    reason: rationale.clone(),
                });
            }
        };

        let chosen = &evaluated[shortlisted[index]];
        let profile = &shortlist[index];
        for advisory in &profile.advisories {
            warn!(advisory = %advisory, "promoted configuration misses an advisory threshold");
        }
        let legend = build_legend(&profile.clusters);
        let role_model = RoleModel {
            k: chosen.score.k,
            family: chosen.score.family,
            clustering: chosen.model.clone(),
            legend,
        };

        let assignments: Vec<RoleAssignment> = input
            .records
            .iter()
            .zip(chosen.model.predict_with_confidence(input.projected))
            .map(|(rec, (cluster, confidence))| RoleAssignment {
                player_id: rec.player_id.clone(),
                player: rec.player.clone(),
                team: rec.team.clone(),
                cluster,
                role_name: role_model.legend[&cluster].name.clone(),
                confidence,
            })
            .collect();

        info!(
            k = role_model.k,
            family = role_model.family.label(),
            rationale = %decision.rationale(),
            "configuration promoted"
        );
        Ok(Discovery {
            report: ModelSelectionReport {
                grid: evaluated.iter().map(|e| e.score.clone()).collect(),
                ranking,
                shortlist,
                decision,
                promoted_k: role_model.k,
                promoted_family: role_model.family,
            },
            role_model,
            assignments,
        })
    }

    /// Best non-degenerate configuration per distinct K, in ranking order.
    fn pick_shortlist(&self, evaluated: &[Evaluated], ranking: &[usize]) -> Vec<usize> {
        let size = self.shortlist_size.clamp(2, 3);
        let mut taken_k: Vec<usize> = Vec::new();
        let mut out = Vec::new();
        for &idx in ranking {
            let score = &evaluated[idx].score;
            if score.is_degenerate() || taken_k.contains(&score.k) {
                continue;
            }
            taken_k.push(score.k);
            out.push(idx);
            if out.len() == size {
                break;
            }
        }
        out
    }

    fn describe(&self, e: &Evaluated, input: DiscoveryInput<'_>) -> ShortlistedConfiguration {
        let scaled = &input.features.scaled.values;
        let names = &input.features.scaling.feature_names;
        let centers_scaled = input.projector.inverse_transform(e.model.centers());
        let centers_original = input
            .features
            .scaling
            .inverse_transform_matrix(&centers_scaled);

        let clusters = (0..e.score.k)
            .map(|c| {
                let members: Vec<usize> =
                    (0..e.labels.len()).filter(|&i| e.labels[i] == c).collect();
                let member_mean = if members.is_empty() {
                    Array1::zeros(scaled.ncols())
                } else {
                    scaled
                        .select(Axis(0), &members)
                        .mean_axis(Axis(0))
                        .unwrap_or_else(|| Array1::zeros(scaled.ncols()))
                };
                let mut deviations: Vec<FeatureDeviation> = names
                    .iter()
                    .zip(member_mean.iter())
                    .map(|(f, z)| FeatureDeviation {
                        feature: f.clone(),
                        z: *z,
                    })
                    .collect();
                deviations.sort_by(|a, b| b.z.total_cmp(&a.z));
                let signature = deviations
                    .iter()
                    .filter(|d| d.z > 0.0)
                    .take(SIGNATURE_LEN)
                    .map(|d| d.feature.clone())
                    .collect();

                let center = e.model.centers().row(c);
                let mut nearest: Vec<(usize, f64)> = members
                    .iter()
                    .map(|&i| (i, euclidean(input.projected.row(i), center)))
                    .collect();
                nearest.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

                ClusterProfile {
                    cluster: c,
                    size: members.len(),
                    center_scaled: centers_scaled.row(c).to_vec(),
                    center_original: centers_original.row(c).to_vec(),
                    deviations,
                    signature,
                    representatives: nearest
                        .iter()
                        .take(self.representatives)
                        .map(|(i, _)| input.records[*i].player_id.clone())
                        .collect(),
                }
            })
            .collect();

        let mut advisories = Vec::new();
        if e.score.scores.silhouette < self.min_silhouette {
            advisories.push(format!(
                "silhouette {:.4} below advisory floor {:.2}",
                e.score.scores.silhouette, self.min_silhouette
            ));
        }
        if e.score.scores.davies_bouldin > self.max_davies_bouldin {
            advisories.push(format!(
                "davies_bouldin {:.4} above advisory ceiling {:.2}",
                e.score.scores.davies_bouldin, self.max_davies_bouldin
            ));
        }

        ShortlistedConfiguration {
            k: e.score.k,
            family: e.score.family,
            scores: e.score.scores,
            combined_rank: e.score.combined_rank,
            feature_names: names.clone(),
            clusters,
            advisories,
        }
    }
}

/// 1-based ranks, ties share the mean of their positions.
fn average_ranks(values: &[f64], higher_better: bool) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        let c = values[a].total_cmp(&values[b]);
        if higher_better { c.reverse() } else { c }
    });
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && (values[order[j + 1]] - values[order[i]]).abs() <= TIE_TOL {
            j += 1;
        }
        let r = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = r;
        }
        i = j + 1;
    }
    ranks
}

fn rank_grid(evaluated: &mut [Evaluated]) {
    let sil: Vec<f64> = evaluated.iter().map(|e| e.score.scores.silhouette).collect();
    let db: Vec<f64> = evaluated.iter().map(|e| e.score.scores.davies_bouldin).collect();
    let ch: Vec<f64> = evaluated.iter().map(|e| e.score.scores.calinski_harabasz).collect();
    let (r_sil, r_db, r_ch) = (
        average_ranks(&sil, true),
        average_ranks(&db, false),
        average_ranks(&ch, true),
    );
    for (i, e) in evaluated.iter_mut().enumerate() {
        e.score.silhouette_rank = r_sil[i];
        e.score.davies_bouldin_rank = r_db[i];
        e.score.calinski_harabasz_rank = r_ch[i];
        e.score.combined_rank = (r_sil[i] + r_db[i] + r_ch[i]) / 3.0;
    }

    // Pareto wins only matter among cells sharing a combined rank.
    let combined: Vec<f64> = evaluated.iter().map(|e| e.score.combined_rank).collect();
    for i in 0..evaluated.len() {
        let peers: Vec<usize> = (0..evaluated.len())
            .filter(|&j| (combined[j] - combined[i]).abs() <= TIE_TOL)
            .collect();
        let best = |v: &[f64], higher: bool| {
            peers.iter().all(|&j| {
                if higher {
                    v[i] >= v[j] - TIE_TOL
                } else {
                    v[i] <= v[j] + TIE_TOL
                }
            })
        };
        evaluated[i].score.pareto_wins =
            [best(&sil, true), best(&db, false), best(&ch, true)].iter().filter(|b| **b).count();
    }
}

fn ranking_order(evaluated: &[Evaluated]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..evaluated.len()).collect();
    order.sort_by(|&a, &b| {
        let (sa, sb) = (&evaluated[a].score, &evaluated[b].score);
        sa.combined_rank
            .total_cmp(&sb.combined_rank)
            .then(sb.pareto_wins.cmp(&sa.pareto_wins))
            .then(sa.k.cmp(&sb.k))
            .then(sa.family.cmp(&sb.family))
    });
    order
}

/// Football role implied by a feature leading a cluster's signature.
pub fn role_for_feature(feature: &str) -> &'static str {
    let base = feature.trim_end_matches("_p90");
    match base {
        "tackles" | "interceptions" | "blocks" | "defensive_activity_index" => "Defensive Anchor",
        "clearances" | "aerials_won" => "Aerial Stopper",
        "key_passes" | "shot_creating_actions" | "assists" | "chance_creation_index" => {
            "Creative Playmaker"
        }
        "goals" | "shots_total" | "finishing_efficiency" => "Goal Scorer",
        "progressive_passes" | "progressive_carries" | "passes_into_final_third"
        | "progression_index" => "Ball Progressor",
        "successful_take_ons" => "Dribbler",
        "passes_completed" => "Deep Distributor",
        _ => "Squad Generalist",
    }
}

/// `"aerials_won_p90"` -> `"Aerials Won"`.
pub fn display_feature(feature: &str) -> String {
    feature
        .trim_end_matches("_p90")
        .trim_end_matches("_index")
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn build_legend(clusters: &[ClusterProfile]) -> RoleLegend {
    let base: Vec<String> = clusters
        .iter()
        .map(|c| match c.signature.first() {
            Some(f) => role_for_feature(f).to_string(),
            None => "Squad Generalist".to_string(),
        })
        .collect();

    let mut names: Vec<String> = Vec::with_capacity(clusters.len());
    for (i, c) in clusters.iter().enumerate() {
        let clashes = base.iter().filter(|b| **b == base[i]).count() > 1;
        let mut name = if clashes {
            match c.signature.get(1) {
                Some(second) => format!("{} ({})", base[i], display_feature(second)),
                None => base[i].clone(),
            }
        } else {
            base[i].clone()
        };
        if names.contains(&name) {
            name = format!("{name} {}", c.cluster + 1);
        }
        names.push(name);
    }

    clusters
        .iter()
        .zip(names)
        .map(|(c, name)| {
            (
                c.cluster,
                RoleLegendEntry {
                    name,
                    color: PALETTE[c.cluster % PALETTE.len()].to_string(),
                    signature: c.signature.clone(),
                },
            )
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPlayer {
    pub player_id: String,
    pub player: String,
    pub distance: f64,
}

/// Same-role players closest to `player_id` in the projected space.
pub fn similar_players(
    assignments: &[RoleAssignment],
    projected: &Array2<f64>,
    player_id: &str,
    n: usize,
) -> Option<Vec<SimilarPlayer>> {
    let me = assignments.iter().position(|a| a.player_id == player_id)?;
    let cluster = assignments[me].cluster;
    let mut out: Vec<SimilarPlayer> = assignments
        .iter()
        .enumerate()
        .filter(|(i, a)| *i != me && a.cluster == cluster)
        .map(|(i, a)| SimilarPlayer {
            player_id: a.player_id.clone(),
            player: a.player.clone(),
            distance: euclidean(projected.row(me), projected.row(i)),
        })
        .collect();
    out.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.player_id.cmp(&b.player_id)));
    out.truncate(n);
    Some(out)
}
