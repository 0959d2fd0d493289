use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Clustering families evaluated by the model-selection grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterFamily {
    /// Centroid-based hard partition.
    #[serde(rename = "kmeans", alias = "k_means")]
    KMeans,
    /// Diagonal-covariance Gaussian mixture (soft assignment).
    #[serde(rename = "gmm", alias = "gaussian_mixture")]
    GaussianMixture,
}

impl ClusterFamily {
    pub fn label(self) -> &'static str {
        match self {
            ClusterFamily::KMeans => "kmeans",
            ClusterFamily::GaussianMixture => "gmm",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "kmeans" | "k-means" | "k_means" => Some(ClusterFamily::KMeans),
            "gmm" | "gaussian_mixture" | "mixture" => Some(ClusterFamily::GaussianMixture),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SurrogateConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub holdout_fraction: f64,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 8,
            min_samples_leaf: 2,
            holdout_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub perplexity: f64,
    pub iterations: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            perplexity: 30.0,
            iterations: 500,
        }
    }
}

/// Every tunable of a pipeline run. Serialized into the bundle version key,
/// so two runs with equal configs and equal inputs share a version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub min_minutes: f64,
    pub variance_target: f64,
    pub k_min: usize,
    pub k_max: usize,
    pub families: Vec<ClusterFamily>,
    pub seed: u64,
    pub kmeans_restarts: usize,
    pub max_iterations: usize,
    pub shortlist_size: usize,
    pub representatives_per_cluster: usize,
    /// Same-role neighbours stored per player in the bundle.
    pub similar_players: usize,
    pub bootstrap_samples: usize,
    pub stability_threshold: f64,
    pub winsor_lower_pct: f64,
    pub winsor_upper_pct: f64,
    /// Heavy-tailed features clamped to the winsorization percentiles.
    pub winsorize_features: Vec<String>,
    pub near_zero_variance_eps: f64,
    /// `None` disables the collinearity drop.
    pub collinearity_threshold: Option<f64>,
    pub top_k_attribution: usize,
    pub permutation_repeats: usize,
    pub disagreement_threshold: f64,
    /// Advisory only; feeds the review, never gates promotion.
    pub advisory_min_silhouette: f64,
    /// Advisory only; feeds the review, never gates promotion.
    pub advisory_max_davies_bouldin: f64,
    pub surrogate: SurrogateConfig,
    pub embedding: EmbeddingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_minutes: 600.0,
            variance_target: 0.90,
            k_min: 6,
            k_max: 12,
            families: vec![ClusterFamily::KMeans, ClusterFamily::GaussianMixture],
            seed: 42,
            kmeans_restarts: 10,
            max_iterations: 300,
            shortlist_size: 3,
            representatives_per_cluster: 3,
            similar_players: 5,
            bootstrap_samples: 100,
            stability_threshold: 0.70,
            winsor_lower_pct: 5.0,
            winsor_upper_pct: 95.0,
            winsorize_features: [
                "goals_p90",
                "assists_p90",
                "shots_total_p90",
                "key_passes_p90",
                "shot_creating_actions_p90",
                "successful_take_ons_p90",
                "progressive_carries_p90",
                "aerials_won_p90",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            near_zero_variance_eps: 1e-8,
            collinearity_threshold: Some(0.95),
            top_k_attribution: 5,
            permutation_repeats: 5,
            disagreement_threshold: 0.25,
            advisory_min_silhouette: 0.25,
            advisory_max_davies_bouldin: 1.40,
            surrogate: SurrogateConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: PipelineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Applies `ROLE_*` environment overrides on top of file/default values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<f64>("ROLE_MIN_MINUTES") {
            self.min_minutes = v;
        }
        if let Some(v) = env_parse::<f64>("ROLE_VARIANCE_TARGET") {
            self.variance_target = v;
        }
        if let Some(v) = env_parse::<usize>("ROLE_K_MIN") {
            self.k_min = v;
        }
        if let Some(v) = env_parse::<usize>("ROLE_K_MAX") {
            self.k_max = v;
        }
        if let Some(v) = env_parse::<u64>("ROLE_SEED") {
            self.seed = v;
        }
        if let Some(v) = env_parse::<usize>("ROLE_BOOTSTRAP_SAMPLES") {
            self.bootstrap_samples = v;
        }
        if let Some(v) = env_parse::<usize>("ROLE_TOP_K") {
            self.top_k_attribution = v;
        }
        if let Ok(raw) = std::env::var("ROLE_FAMILIES") {
            let families: Vec<ClusterFamily> =
                raw.split(',').filter_map(ClusterFamily::parse).collect();
            if !families.is_empty() {
                self.families = families;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.variance_target > 0.0 && self.variance_target <= 1.0) {
            return Err(PipelineError::invalid_config(format!(
                "variance_target must be in (0, 1], got {}",
                self.variance_target
            )));
        }
        if self.k_min < 2 || self.k_min > self.k_max {
            return Err(PipelineError::invalid_config(format!(
                "k range {}..={} must satisfy 2 <= k_min <= k_max",
                self.k_min, self.k_max
            )));
        }
        if self.families.is_empty() {
            return Err(PipelineError::invalid_config("no clustering families"));
        }
        if !(0.0..self.winsor_upper_pct).contains(&self.winsor_lower_pct)
            || self.winsor_upper_pct > 100.0
        {
            return Err(PipelineError::invalid_config(format!(
                "winsorization percentiles {}/{} out of order",
                self.winsor_lower_pct, self.winsor_upper_pct
            )));
        }
        if let Some(t) = self.collinearity_threshold
            && !(t > 0.0 && t <= 1.0)
        {
            return Err(PipelineError::invalid_config(format!(
                "collinearity_threshold must be in (0, 1], got {t}"
            )));
        }
        if self.min_minutes <= 0.0 {
            return Err(PipelineError::invalid_config("min_minutes must be positive"));
        }
        if self.surrogate.n_trees == 0 || self.surrogate.max_depth == 0 {
            return Err(PipelineError::invalid_config(
                "surrogate needs at least one tree of depth >= 1",
            ));
        }
        if !(0.0..0.9).contains(&self.surrogate.holdout_fraction) {
            return Err(PipelineError::invalid_config(
                "surrogate.holdout_fraction must be in [0, 0.9)",
            ));
        }
        Ok(())
    }

    pub fn k_values(&self) -> Vec<usize> {
        (self.k_min..=self.k_max).collect()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.min_minutes, 600.0);
        assert_eq!(cfg.variance_target, 0.90);
        assert_eq!(cfg.k_values(), vec![6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(cfg.collinearity_threshold, Some(0.95));
        assert_eq!(cfg.top_k_attribution, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"k_min": 3, "k_max": 4, "families": ["kmeans"]}"#).unwrap();
        assert_eq!(cfg.k_values(), vec![3, 4]);
        assert_eq!(cfg.families, vec![ClusterFamily::KMeans]);
        assert_eq!(cfg.bootstrap_samples, 100);
    }

    #[test]
    fn rejects_inverted_k_range() {
        let cfg = PipelineConfig {
            k_min: 9,
            k_max: 4,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(PipelineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn family_parse_accepts_aliases() {
        assert_eq!(ClusterFamily::parse(" K-Means "), Some(ClusterFamily::KMeans));
        assert_eq!(
            ClusterFamily::parse("gaussian_mixture"),
            Some(ClusterFamily::GaussianMixture)
        );
        assert_eq!(ClusterFamily::parse("dbscan"), None);
    }
}
