//! Feature Builder: per-90 rates, composite indices, variance/collinearity
//! pruning, winsorization and standard scaling.
//!
//! Every step except the per-90 transform is population-relative, so the
//! builder runs in two phases: [`PopulationStats::accumulate`] gathers the
//! population table and its statistics, then [`FeatureBuilder::build`] fits a
//! [`ScalingModel`] and transforms the whole table with it. The same model
//! transforms any later single player via [`ScalingModel::transform_record`].

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::dataset::{PlayerRecord, RAW_STAT_COUNT, RawStat};
use crate::error::PipelineError;

/// Guard for zero-shot players in the finishing ratio.
pub const EPSILON: f64 = 1e-6;
const STD_FLOOR: f64 = 1e-12;

pub const PROGRESSION: &str = "progression_index";
pub const CHANCE_CREATION: &str = "chance_creation_index";
pub const DEFENSIVE_ACTIVITY: &str = "defensive_activity_index";
pub const FINISHING_EFFICIENCY: &str = "finishing_efficiency";

const COMPOSITE_COUNT: usize = 4;
pub const CANDIDATE_COUNT: usize = RAW_STAT_COUNT + COMPOSITE_COUNT;
const FINISHING_IDX: usize = RAW_STAT_COUNT + 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Per90,
    Composite,
}

impl FeatureKind {
    /// Higher is kept first when a correlated pair must lose one member.
    fn interpretability(self) -> u8 {
        match self {
            FeatureKind::Per90 => 2,
            FeatureKind::Composite => 1,
        }
    }
}

pub fn per90_name(stat: RawStat) -> String {
    format!("{}_p90", stat.column())
}

/// All candidate features in declaration order: per-90 rates then composites.
pub fn candidate_features() -> Vec<(String, FeatureKind)> {
    let mut out: Vec<(String, FeatureKind)> = RawStat::ALL
        .iter()
        .map(|s| (per90_name(*s), FeatureKind::Per90))
        .collect();
    for name in [
        PROGRESSION,
        CHANCE_CREATION,
        DEFENSIVE_ACTIVITY,
        FINISHING_EFFICIENCY,
    ] {
        out.push((name.to_string(), FeatureKind::Composite));
    }
    out
}

/// `raw * 90 / minutes` for every raw counting statistic.
pub fn per90(record: &PlayerRecord) -> Result<[f64; RAW_STAT_COUNT], PipelineError> {
    if !(record.minutes > 0.0) {
        warn!(player = %record.player, minutes = record.minutes, "per-90 on zero-minute record");
        return Err(PipelineError::DivideByZero {
            player: record.player.clone(),
            field: "minutes".to_string(),
        });
    }
    let mut out = [0.0; RAW_STAT_COUNT];
    for (dst, raw) in out.iter_mut().zip(record.stats.iter()) {
        *dst = raw / record.minutes * 90.0;
    }
    Ok(out)
}

/// Goals per shot before population clipping.
pub fn raw_finishing_efficiency(goals: f64, shots: f64) -> f64 {
    goals / shots.max(EPSILON)
}

/// Composite indices from per-90 components; finishing is left unclipped.
pub fn composites(p90: &[f64; RAW_STAT_COUNT]) -> [f64; COMPOSITE_COUNT] {
    let v = |s: RawStat| p90[s.index()];
    [
        v(RawStat::ProgressivePasses) + v(RawStat::ProgressiveCarries),
        v(RawStat::KeyPasses) + v(RawStat::ShotCreatingActions) + v(RawStat::Assists),
        v(RawStat::Tackles)
            + v(RawStat::Interceptions)
            + v(RawStat::Blocks)
            + v(RawStat::Clearances),
        raw_finishing_efficiency(v(RawStat::Goals), v(RawStat::ShotsTotal)),
    ]
}

fn candidate_row(record: &PlayerRecord) -> Result<[f64; CANDIDATE_COUNT], PipelineError> {
    let p90 = per90(record)?;
    let comp = composites(&p90);
    let mut row = [0.0; CANDIDATE_COUNT];
    row[..RAW_STAT_COUNT].copy_from_slice(&p90);
    row[RAW_STAT_COUNT..].copy_from_slice(&comp);
    Ok(row)
}

/// Linear-interpolated percentile (`p` in 0..=100) of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn column_bounds(values: impl Iterator<Item = f64>, lower: f64, upper: f64) -> (f64, f64) {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    (percentile(&sorted, lower), percentile(&sorted, upper))
}

/// A player-by-feature matrix with its labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub feature_names: Vec<String>,
    pub player_ids: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureTable {
    pub fn n_players(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.feature_names.iter().position(|f| f == name)?;
        Some(self.values.column(idx).to_vec())
    }
}

/// Phase one: the whole population's candidate table.
#[derive(Debug, Clone)]
pub struct PopulationStats {
    pub candidates: Vec<(String, FeatureKind)>,
    pub table: FeatureTable,
    pub finishing_bounds: (f64, f64),
}

impl PopulationStats {
    pub fn accumulate(
        records: &[PlayerRecord],
        lower_pct: f64,
        upper_pct: f64,
    ) -> Result<Self, PipelineError> {
        if records.len() < 2 {
            return Err(PipelineError::insufficient_data(2, records.len()));
        }
        let candidates = candidate_features();
        let mut values = Array2::<f64>::zeros((records.len(), CANDIDATE_COUNT));
        for (i, rec) in records.iter().enumerate() {
            let row = candidate_row(rec)?;
            for (j, v) in row.iter().enumerate() {
                values[(i, j)] = *v;
            }
        }

        // Finishing efficiency is clipped against this population only.
        let finishing_bounds = column_bounds(
            values.column(FINISHING_IDX).iter().copied(),
            lower_pct,
            upper_pct,
        );
        values
            .column_mut(FINISHING_IDX)
            .mapv_inplace(|v| v.clamp(finishing_bounds.0, finishing_bounds.1));

        Ok(Self {
            table: FeatureTable {
                feature_names: candidates.iter().map(|(n, _)| n.clone()).collect(),
                player_ids: records.iter().map(|r| r.player_id.clone()).collect(),
                values,
            },
            candidates,
            finishing_bounds,
        })
    }

    pub fn variances(&self) -> Vec<f64> {
        self.table.values.var_axis(Axis(0), 0.0).to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NearZeroVariance { variance: f64 },
    Collinear { kept: String, correlation: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedFeature {
    pub feature: String,
    pub reason: DropReason,
}

/// Population-fitted transform from a [`PlayerRecord`] to a scaled feature
/// vector. Persisted and reused for single-player inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingModel {
    pub feature_names: Vec<String>,
    pub feature_kinds: Vec<FeatureKind>,
    /// Position of each retained feature in [`candidate_features`].
    pub source_index: Vec<usize>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    pub winsor_bounds: Vec<Option<(f64, f64)>>,
    pub finishing_bounds: (f64, f64),
    pub epsilon: f64,
    pub dropped: Vec<DroppedFeature>,
}

impl ScalingModel {
    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    /// Retained, winsorized (unscaled) values from a candidate row.
    fn select_winsorized(&self, candidate: &[f64]) -> Vec<f64> {
        self.source_index
            .iter()
            .zip(&self.winsor_bounds)
            .map(|(&src, bounds)| match bounds {
                Some((lo, hi)) => candidate[src].clamp(*lo, *hi),
                None => candidate[src],
            })
            .collect()
    }

    pub fn scale(&self, winsorized: &[f64]) -> Vec<f64> {
        winsorized
            .iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(x, (mu, sd))| (x - mu) / sd.max(STD_FLOOR))
            .collect()
    }

    pub fn inverse_transform(&self, scaled: &[f64]) -> Vec<f64> {
        scaled
            .iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(z, (mu, sd))| z * sd.max(STD_FLOOR) + mu)
            .collect()
    }

    /// Full chain for one record, using the stored population statistics.
    pub fn transform_record(&self, record: &PlayerRecord) -> Result<Vec<f64>, PipelineError> {
        let mut candidate = candidate_row(record)?;
        candidate[FINISHING_IDX] =
            candidate[FINISHING_IDX].clamp(self.finishing_bounds.0, self.finishing_bounds.1);
        Ok(self.scale(&self.select_winsorized(&candidate)))
    }

    pub fn inverse_transform_matrix(&self, scaled: &Array2<f64>) -> Array2<f64> {
        let mut out = scaled.clone();
        for mut row in out.rows_mut() {
            let back = self.inverse_transform(&row.to_vec());
            for (dst, v) in row.iter_mut().zip(back) {
                *dst = v;
            }
        }
        out
    }
}

/// Output of a feature build over one population.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub scaling: ScalingModel,
    /// Retained features after winsorization, before scaling.
    pub winsorized: FeatureTable,
    pub scaled: FeatureTable,
}

pub struct FeatureBuilder {
    lower_pct: f64,
    upper_pct: f64,
    winsorize: Vec<String>,
    nzv_eps: f64,
    collinearity: Option<f64>,
}

impl FeatureBuilder {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            lower_pct: cfg.winsor_lower_pct,
            upper_pct: cfg.winsor_upper_pct,
            winsorize: cfg.winsorize_features.clone(),
            nzv_eps: cfg.near_zero_variance_eps,
            collinearity: cfg.collinearity_threshold,
        }
    }

    pub fn build(&self, records: &[PlayerRecord]) -> Result<FeatureSet, PipelineError> {
        let stats = PopulationStats::accumulate(records, self.lower_pct, self.upper_pct)?;
        let scaling = self.fit(&stats)?;

        let n = stats.table.n_players();
        let p = scaling.n_features();
        let mut winsorized = Array2::<f64>::zeros((n, p));
        let mut scaled = Array2::<f64>::zeros((n, p));
        for (i, row) in stats.table.values.rows().into_iter().enumerate() {
            let w = scaling.select_winsorized(&row.to_vec());
            let z = scaling.scale(&w);
            for j in 0..p {
                winsorized[(i, j)] = w[j];
                scaled[(i, j)] = z[j];
            }
        }

        info!(
            players = n,
            retained = p,
            dropped = scaling.dropped.len(),
            "feature table built"
        );
        Ok(FeatureSet {
            winsorized: FeatureTable {
                feature_names: scaling.feature_names.clone(),
                player_ids: stats.table.player_ids.clone(),
                values: winsorized,
            },
            scaled: FeatureTable {
                feature_names: scaling.feature_names.clone(),
                player_ids: stats.table.player_ids.clone(),
                values: scaled,
            },
            scaling,
        })
    }

    /// Phase two: prune, winsorize and fit scaling parameters.
    pub fn fit(&self, stats: &PopulationStats) -> Result<ScalingModel, PipelineError> {
        let values = &stats.table.values;
        let variances = stats.variances();
        let mut keep = vec![true; stats.candidates.len()];
        let mut dropped = Vec::new();

        for (j, var) in variances.iter().enumerate() {
            if *var < self.nzv_eps {
                keep[j] = false;
                dropped.push(DroppedFeature {
                    feature: stats.candidates[j].0.clone(),
                    reason: DropReason::NearZeroVariance { variance: *var },
                });
            }
        }

        if let Some(threshold) = self.collinearity {
            let m = stats.candidates.len();
            for a in 0..m {
                for b in (a + 1)..m {
                    if !keep[a] || !keep[b] {
                        continue;
                    }
                    let r = pearson(values.column(a).iter(), values.column(b).iter());
                    if r.abs() <= threshold {
                        continue;
                    }
                    let (ka, kb) = (stats.candidates[a].1, stats.candidates[b].1);
                    let (drop, kept) = if kb.interpretability() > ka.interpretability() {
                        (a, b)
                    } else {
                        (b, a)
                    };
                    keep[drop] = false;
                    dropped.push(DroppedFeature {
                        feature: stats.candidates[drop].0.clone(),
                        reason: DropReason::Collinear {
                            kept: stats.candidates[kept].0.clone(),
                            correlation: r,
                        },
                    });
                }
            }
        }

        let source_index: Vec<usize> = (0..stats.candidates.len()).filter(|j| keep[*j]).collect();
        if source_index.is_empty() {
            return Err(PipelineError::insufficient_data(1, 0));
        }

        let mut winsor_bounds = Vec::with_capacity(source_index.len());
        let mut means = Vec::with_capacity(source_index.len());
        let mut stds = Vec::with_capacity(source_index.len());
        for &src in &source_index {
            let name = &stats.candidates[src].0;
            let bounds = if self.winsorize.iter().any(|w| w == name) {
                Some(column_bounds(
                    values.column(src).iter().copied(),
                    self.lower_pct,
                    self.upper_pct,
                ))
            } else {
                None
            };
            let col: Vec<f64> = values
                .column(src)
                .iter()
                .map(|v| match bounds {
                    Some((lo, hi)) => v.clamp(lo, hi),
                    None => *v,
                })
                .collect();
            let n = col.len() as f64;
            let mean = col.iter().sum::<f64>() / n;
            let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            winsor_bounds.push(bounds);
            means.push(mean);
            stds.push(var.sqrt().max(STD_FLOOR));
        }

        for d in &dropped {
            info!(feature = %d.feature, reason = ?d.reason, "feature dropped");
        }

        Ok(ScalingModel {
            feature_names: source_index
                .iter()
                .map(|&j| stats.candidates[j].0.clone())
                .collect(),
            feature_kinds: source_index.iter().map(|&j| stats.candidates[j].1).collect(),
            source_index,
            means,
            stds,
            winsor_bounds,
            finishing_bounds: stats.finishing_bounds,
            epsilon: EPSILON,
            dropped,
        })
    }
}

pub fn pearson<'a>(a: impl Iterator<Item = &'a f64>, b: impl Iterator<Item = &'a f64>) -> f64 {
    let pairs: Vec<(f64, f64)> = a.copied().zip(b.copied()).collect();
    if pairs.len() < 2 {
        return 0.0;
    }
    let n = pairs.len() as f64;
    let ma = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mb = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in &pairs {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    if va <= 0.0 || vb <= 0.0 {
        return 0.0;
    }
    cov / (va.sqrt() * vb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: usize, minutes: f64, stats: [f64; RAW_STAT_COUNT]) -> PlayerRecord {
        PlayerRecord {
            player_id: format!("p{id}"),
            player: format!("P {id}"),
            team: "Test FC".to_string(),
            position: "MF".to_string(),
            minutes,
            stats,
        }
    }

    fn population() -> Vec<PlayerRecord> {
        (0..40)
            .map(|i| {
                let mut stats = [0.0; RAW_STAT_COUNT];
                for (j, s) in stats.iter_mut().enumerate() {
                    *s = ((i * 7 + j * 13) % 23) as f64 + (i % 5) as f64 * (j as f64 + 1.0);
                }
                record(i, 900.0 + (i * 37 % 1800) as f64, stats)
            })
            .collect()
    }

    #[test]
    fn per90_is_rate_times_ninety() {
        let rec = record(1, 1800.0, [20.0; RAW_STAT_COUNT]);
        let p = per90(&rec).unwrap();
        assert!(p.iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn per90_guards_zero_minutes() {
        let rec = record(1, 0.0, [1.0; RAW_STAT_COUNT]);
        assert!(matches!(
            per90(&rec),
            Err(PipelineError::DivideByZero { .. })
        ));
    }

    #[test]
    fn finishing_uses_epsilon_for_zero_shots() {
        assert_eq!(raw_finishing_efficiency(0.0, 0.0), 0.0);
        assert!((raw_finishing_efficiency(1.0, 0.0) - 1.0 / EPSILON).abs() < 1e-3);
        assert!((raw_finishing_efficiency(3.0, 12.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn percentile_interpolates() {
        let s = [0.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&s, 50.0), 20.0);
        assert!((percentile(&s, 5.0) - 2.0).abs() < 1e-12);
        assert_eq!(percentile(&s, 100.0), 40.0);
    }

    #[test]
    fn finishing_is_clipped_to_population_bounds() {
        let recs = population();
        let stats = PopulationStats::accumulate(&recs, 5.0, 95.0).unwrap();
        let (lo, hi) = stats.finishing_bounds;
        for v in stats.table.values.column(FINISHING_IDX) {
            assert!(*v >= lo - 1e-12 && *v <= hi + 1e-12);
        }
    }

    fn with_scoring_outlier() -> Vec<PlayerRecord> {
        let mut recs = population();
        let mut stats = recs[0].stats;
        stats[RawStat::Goals.index()] = 400.0;
        recs.push(record(99, 2700.0, stats));
        recs
    }

    #[test]
    fn heavy_tailed_features_are_clamped_to_population_percentiles() {
        let cfg = PipelineConfig {
            collinearity_threshold: None,
            ..PipelineConfig::default()
        };
        let recs = with_scoring_outlier();
        let set = FeatureBuilder::new(&cfg).build(&recs).unwrap();

        let mut raw: Vec<f64> = recs
            .iter()
            .map(|r| per90(r).unwrap()[RawStat::Goals.index()])
            .collect();
        raw.sort_by(|a, b| a.total_cmp(b));
        let (lo, hi) = (percentile(&raw, 5.0), percentile(&raw, 95.0));
        assert!(hi < raw[raw.len() - 1], "outlier sits above p95");

        let goals = set.winsorized.column("goals_p90").expect("goals_p90 retained");
        assert!(goals.iter().all(|v| *v >= lo - 1e-12 && *v <= hi + 1e-12));
        let outlier = goals[recs.len() - 1];
        assert!((outlier - hi).abs() < 1e-12);

        let j = set.scaling.feature_names.iter().position(|f| f == "goals_p90").unwrap();
        let (blo, bhi) = set.scaling.winsor_bounds[j].expect("goals_p90 is winsorized");
        assert!((blo - lo).abs() < 1e-12 && (bhi - hi).abs() < 1e-12);
    }

    #[test]
    fn only_configured_features_carry_winsor_bounds() {
        let cfg = PipelineConfig {
            collinearity_threshold: None,
            ..PipelineConfig::default()
        };
        let set = FeatureBuilder::new(&cfg).build(&with_scoring_outlier()).unwrap();
        for (name, bounds) in set.scaling.feature_names.iter().zip(&set.scaling.winsor_bounds) {
            let configured = cfg.winsorize_features.iter().any(|w| w == name);
            assert_eq!(bounds.is_some(), configured, "{name}");
        }
        assert!(set.scaling.winsor_bounds.iter().any(Option::is_some));
        assert!(set.scaling.winsor_bounds.iter().any(Option::is_none));

        // Passing players are untouched even when far from the mean.
        let passes = set.winsorized.column("passes_completed_p90").unwrap();
        let raw: Vec<f64> = with_scoring_outlier()
            .iter()
            .map(|r| per90(r).unwrap()[RawStat::PassesCompleted.index()])
            .collect();
        assert_eq!(passes, raw);
    }

    #[test]
    fn scaled_columns_have_zero_mean_unit_variance() {
        let cfg = PipelineConfig::default();
        let set = FeatureBuilder::new(&cfg).build(&population()).unwrap();
        for col in set.scaled.values.columns() {
            let n = col.len() as f64;
            let mean = col.sum() / n;
            let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            assert!(mean.abs() < 1e-9);
            assert!((var - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn inverse_transform_recovers_winsorized_values() {
        let cfg = PipelineConfig::default();
        let set = FeatureBuilder::new(&cfg).build(&population()).unwrap();
        let back = set.scaling.inverse_transform_matrix(&set.scaled.values);
        for (a, b) in back.iter().zip(set.winsorized.values.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn transform_record_matches_batch_row() {
        let cfg = PipelineConfig::default();
        let recs = population();
        let set = FeatureBuilder::new(&cfg).build(&recs).unwrap();
        let single = set.scaling.transform_record(&recs[7]).unwrap();
        for (a, b) in single.iter().zip(set.scaled.values.row(7).iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn collinear_composite_loses_to_raw_member() {
        // Only tackles vary, so the defensive composite is a shifted copy of it.
        let recs: Vec<PlayerRecord> = (0..20)
            .map(|i| {
                let mut stats = [10.0; RAW_STAT_COUNT];
                stats[RawStat::Tackles.index()] = i as f64;
                stats[RawStat::Goals.index()] = (i % 3) as f64;
                stats[RawStat::ShotsTotal.index()] = 10.0 + (i % 4) as f64;
                record(i, 900.0, stats)
            })
            .collect();
        let cfg = PipelineConfig {
            winsorize_features: Vec::new(),
            ..PipelineConfig::default()
        };
        let set = FeatureBuilder::new(&cfg).build(&recs).unwrap();
        let names = &set.scaling.feature_names;
        assert!(names.contains(&"tackles_p90".to_string()));
        assert!(!names.contains(&DEFENSIVE_ACTIVITY.to_string()));
        assert!(!names.contains(&"blocks_p90".to_string()));
    }
}
