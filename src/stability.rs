use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster_metrics::adjusted_rand_index;
use crate::clustering::{ClusterModel, FitOptions};
use crate::config::{ClusterFamily, PipelineConfig};
use crate::error::PipelineError;

/// Bootstrap agreement between refits and the production labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub family: ClusterFamily,
    pub k: usize,
    pub seed: u64,
    /// Adjusted Rand index per resample, in sample order.
    pub scores: Vec<f64>,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub threshold: f64,
    /// Surfaced for review; the pipeline never blocks on it.
    pub passed: bool,
}

pub struct StabilityAuditor {
    samples: usize,
    seed: u64,
    threshold: f64,
    opts: FitOptions,
}

impl StabilityAuditor {
    pub fn new(cfg: &PipelineConfig) -> Self {
        Self {
            samples: cfg.bootstrap_samples,
            seed: cfg.seed,
            threshold: cfg.stability_threshold,
            opts: FitOptions {
                restarts: cfg.kmeans_restarts,
                max_iterations: cfg.max_iterations,
            },
        }
    }

    /// Refits `(family, k)` on `samples` resamples of `projected` drawn with
    /// replacement; resample `i` is seeded with `seed + i`.
    pub fn audit(
        &self,
        family: ClusterFamily,
        k: usize,
        projected: &Array2<f64>,
        production: &[usize],
    ) -> Result<StabilityReport, PipelineError> {
        let n = projected.nrows();
        if self.samples == 0 {
            return Err(PipelineError::invalid_config("bootstrap_samples must be positive"));
        }
        if n != production.len() {
            return Err(PipelineError::insufficient_data(n, production.len()));
        }
        if n <= k {
            return Err(PipelineError::insufficient_data(k + 1, n));
        }

        let scores: Vec<Result<f64, PipelineError>> = (0..self.samples)
            .into_par_iter()
            .map(|i| {
                let sample_seed = self.seed.wrapping_add(i as u64);
                let mut rng = StdRng::seed_from_u64(sample_seed);
                let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                let resample = projected.select(Axis(0), &rows);
                let model = ClusterModel::fit(family, &resample, k, self.opts, sample_seed)?;
                let refit = model.predict(&resample);
                let reference: Vec<usize> = rows.iter().map(|&r| production[r]).collect();
                Ok(adjusted_rand_index(&refit, &reference))
            })
            .collect();
        let scores = scores.into_iter().collect::<Result<Vec<_>, _>>()?;

        let b = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / b;
        let std = (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / b).sqrt();
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let passed = mean >= self.threshold;

        if passed {
            info!(mean, std, samples = scores.len(), "stability audit passed");
        } else {
            warn!(
                mean,
                std,
                threshold = self.threshold,
                "stability below review threshold"
            );
        }
        Ok(StabilityReport {
            family,
            k,
            seed: self.seed,
            scores,
            mean,
            std,
            min,
            max,
            threshold: self.threshold,
            passed,
        })
    }
}
