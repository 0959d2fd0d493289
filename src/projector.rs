use ndarray::{Array1, Array2, Axis, s};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PipelineError;

const JACOBI_MAX_SWEEPS: usize = 100;
const JACOBI_TOL: f64 = 1e-22;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarianceRow {
    pub component: usize,
    pub explained_variance: f64,
    pub ratio: f64,
    pub cumulative_ratio: f64,
}

/// Fitted orthogonal basis. Only meaningful together with the scaling model
/// it was fit after. Component signs are solver-dependent and carry no meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectorModel {
    pub mean: Array1<f64>,
    /// One component per row, descending explained variance.
    pub components: Array2<f64>,
    pub explained_variance: Vec<f64>,
    pub explained_variance_ratio: Vec<f64>,
    pub retained: usize,
    pub variance_target: f64,
}

impl ProjectorModel {
    pub fn fit(x: &Array2<f64>, variance_target: f64) -> Result<Self, PipelineError> {
        let (n, p) = x.dim();
        if n < 2 || p == 0 {
            return Err(PipelineError::insufficient_data(2, n));
        }
        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
        let centered = x - &mean;
        let cov = centered.t().dot(&centered) / (n as f64 - 1.0);

        let (values, vectors) = symmetric_eigen(cov);
        let mut order: Vec<usize> = (0..p).collect();
        order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));

        let mut components = Array2::<f64>::zeros((p, p));
        let mut explained_variance = Vec::with_capacity(p);
        for (row, &idx) in order.iter().enumerate() {
            let mut v = vectors.column(idx).to_owned();
            let pivot = v
                .iter()
                .copied()
                .fold(0.0_f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
            if pivot < 0.0 {
                v.mapv_inplace(|x| -x);
            }
            components.row_mut(row).assign(&v);
            explained_variance.push(values[idx].max(0.0));
        }

        let total: f64 = explained_variance.iter().sum();
        let explained_variance_ratio: Vec<f64> = explained_variance
            .iter()
            .map(|v| if total > 0.0 { v / total } else { 0.0 })
            .collect();

        let mut retained = p;
        let mut cumulative = 0.0;
        for (idx, r) in explained_variance_ratio.iter().enumerate() {
            cumulative += r;
            if cumulative + 1e-12 >= variance_target {
                retained = idx + 1;
                break;
            }
        }

        info!(
            features = p,
            retained,
            cumulative_ratio = cumulative,
            "projector fit"
        );
        Ok(Self {
            mean,
            components,
            explained_variance,
            explained_variance_ratio,
            retained,
            variance_target,
        })
    }

    fn basis(&self) -> ndarray::ArrayView2<'_, f64> {
        self.components.slice(s![..self.retained, ..])
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.mean).dot(&self.basis().t())
    }

    pub fn transform_row(&self, x: &[f64]) -> Vec<f64> {
        let row = Array1::from(x.to_vec()) - &self.mean;
        self.basis().dot(&row).to_vec()
    }

    pub fn inverse_transform(&self, projected: &Array2<f64>) -> Array2<f64> {
        projected.dot(&self.basis()) + &self.mean
    }

    pub fn variance_table(&self) -> Vec<VarianceRow> {
        let mut cumulative = 0.0;
        self.explained_variance
            .iter()
            .zip(&self.explained_variance_ratio)
            .enumerate()
            .map(|(component, (v, r))| {
                cumulative += r;
                VarianceRow {
                    component,
                    explained_variance: *v,
                    ratio: *r,
                    cumulative_ratio: cumulative,
                }
            })
            .collect()
    }

    pub fn retained_ratio(&self) -> f64 {
        self.explained_variance_ratio[..self.retained].iter().sum()
    }
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix.
/// Returns eigenvalues and eigenvectors (one per column), unsorted.
pub fn symmetric_eigen(mut a: Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[(p, q)] * a[(p, q)];
            }
        }
        if off < JACOBI_TOL {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[(p, q)];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * apq);
                let t = if theta == 0.0 {
                    1.0
                } else {
                    theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt())
                };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[(k, p)];
                    let akq = a[(k, q)];
                    a[(k, p)] = c * akp - s * akq;
                    a[(k, q)] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[(p, k)];
                    let aqk = a[(q, k)];
                    a[(p, k)] = c * apk - s * aqk;
                    a[(q, k)] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[(k, p)];
                    let vkq = v[(k, q)];
                    v[(k, p)] = c * vkp - s * vkq;
                    v[(k, q)] = s * vkp + c * vkq;
                }
            }
        }
    }

    ((0..n).map(|i| a[(i, i)]).collect(), v)
}
