//! The two clustering families of the model-selection grid.
//!
//! Both are seeded through [`StdRng`], so a (family, K, seed) triple always
//! yields the same model. After fitting, cluster ids are canonicalized to the
//! order in which clusters first appear in the input rows.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::ClusterFamily;
use crate::error::PipelineError;

const REG_COVAR: f64 = 1e-6;
const GMM_TOL: f64 = 1e-6;
const KMEANS_TOL: f64 = 1e-10;

#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub restarts: usize,
    pub max_iterations: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            restarts: 10,
            max_iterations: 300,
        }
    }
}

fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansModel {
    pub centroids: Array2<f64>,
    pub inertia: f64,
}

impl KMeansModel {
    pub fn fit(
        x: &Array2<f64>,
        k: usize,
        opts: FitOptions,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        let n = x.nrows();
        if k == 0 || n < k {
            return Err(PipelineError::insufficient_data(k.max(1), n));
        }
        let mut best: Option<KMeansModel> = None;
        for restart in 0..opts.restarts.max(1) {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(restart as u64));
            let model = lloyd(x, plus_plus_init(x, k, &mut rng), opts.max_iterations);
            let better = match &best {
                Some(b) => model.inertia < b.inertia - 1e-12,
                None => true,
            };
            if better {
                best = Some(model);
            }
        }
        best.ok_or_else(|| PipelineError::insufficient_data(k, n))
    }

    pub fn k(&self) -> usize {
        self.centroids.nrows()
    }

    /// Nearest centroid and `clamp(1 - d_own / d_next, 0, 1)`.
    pub fn assign(&self, row: ArrayView1<f64>) -> (usize, f64) {
        let mut best = (0usize, f64::INFINITY);
        let mut second = f64::INFINITY;
        for (c, centroid) in self.centroids.rows().into_iter().enumerate() {
            let d = sq_dist(row, centroid).sqrt();
            if d < best.1 {
                second = best.1;
                best = (c, d);
            } else if d < second {
                second = d;
            }
        }
        let confidence = if second.is_finite() && second > 0.0 {
            (1.0 - best.1 / second).clamp(0.0, 1.0)
        } else {
            1.0
        };
        (best.0, confidence)
    }
}

fn plus_plus_init(x: &Array2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = x.nrows();
    let mut centroids = Array2::<f64>::zeros((k, x.ncols()));
    centroids.row_mut(0).assign(&x.row(rng.gen_range(0..n)));
    let mut d2: Vec<f64> = (0..n).map(|i| sq_dist(x.row(i), centroids.row(0))).collect();

    for c in 1..k {
        let total: f64 = d2.iter().sum();
        let pick = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let target = rng.gen_range(0.0..total);
            let mut acc = 0.0;
            let mut chosen = n - 1;
            for (i, d) in d2.iter().enumerate() {
                acc += d;
                if acc > target {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids.row_mut(c).assign(&x.row(pick));
        for (i, d) in d2.iter_mut().enumerate() {
            *d = d.min(sq_dist(x.row(i), centroids.row(c)));
        }
    }
    centroids
}

fn lloyd(x: &Array2<f64>, mut centroids: Array2<f64>, max_iterations: usize) -> KMeansModel {
    let (n, p) = x.dim();
    let k = centroids.nrows();
    let mut labels = vec![usize::MAX; n];

    for _ in 0..max_iterations.max(1) {
        let mut changed = false;
        for i in 0..n {
            let mut best = (0usize, f64::INFINITY);
            for c in 0..k {
                let d = sq_dist(x.row(i), centroids.row(c));
                if d < best.1 {
                    best = (c, d);
                }
            }
            if labels[i] != best.0 {
                labels[i] = best.0;
                changed = true;
            }
        }

        let mut sums = Array2::<f64>::zeros((k, p));
        let mut counts = vec![0usize; k];
        for i in 0..n {
            let mut row = sums.row_mut(labels[i]);
            row += &x.row(i);
            counts[labels[i]] += 1;
        }

        let mut shift = 0.0;
        for c in 0..k {
            let next = if counts[c] == 0 {
                // Empty cluster: reseed on the point farthest from its centroid.
                let far = (0..n)
                    .max_by(|&a, &b| {
                        sq_dist(x.row(a), centroids.row(labels[a]))
                            .total_cmp(&sq_dist(x.row(b), centroids.row(labels[b])))
                            .then(b.cmp(&a))
                    })
                    .unwrap_or(0);
                changed = true;
                x.row(far).to_owned()
            } else {
                sums.row(c).to_owned() / counts[c] as f64
            };
            shift += sq_dist(next.view(), centroids.row(c));
            centroids.row_mut(c).assign(&next);
        }

        if !changed || shift < KMEANS_TOL {
            break;
        }
    }

    let inertia = (0..n)
        .map(|i| {
            (0..k)
                .map(|c| sq_dist(x.row(i), centroids.row(c)))
                .fold(f64::INFINITY, f64::min)
        })
        .sum();
    KMeansModel { centroids, inertia }
}

/// Diagonal-covariance Gaussian mixture fit by EM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianMixtureModel {
    pub weights: Vec<f64>,
    pub means: Array2<f64>,
    pub variances: Array2<f64>,
    pub log_likelihood: f64,
    pub converged: bool,
}

impl GaussianMixtureModel {
    pub fn fit(
        x: &Array2<f64>,
        k: usize,
        opts: FitOptions,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        let (n, p) = x.dim();
        let init = KMeansModel::fit(
            x,
            k,
            FitOptions {
                restarts: opts.restarts.clamp(1, 3),
                max_iterations: opts.max_iterations,
            },
            seed,
        )?;

        // Hard responsibilities from the k-means partition seed the first M-step.
        let mut resp = Array2::<f64>::zeros((n, k));
        for i in 0..n {
            let (c, _) = init.assign(x.row(i));
            resp[(i, c)] = 1.0;
        }
        let mut model = GaussianMixtureModel {
            weights: vec![1.0 / k as f64; k],
            means: init.centroids.clone(),
            variances: Array2::from_elem((k, p), 1.0),
            log_likelihood: f64::NEG_INFINITY,
            converged: false,
        };
        model.m_step(x, &resp);

        let mut prev = f64::NEG_INFINITY;
        for _ in 0..opts.max_iterations.max(1) {
            let (next_resp, ll) = model.e_step(x);
            model.log_likelihood = ll;
            if (ll - prev).abs() < GMM_TOL {
                model.converged = true;
                break;
            }
            prev = ll;
            resp = next_resp;
            model.m_step(x, &resp);
        }
        Ok(model)
    }

    pub fn k(&self) -> usize {
        self.means.nrows()
    }

    fn log_component(&self, row: ArrayView1<f64>, c: usize) -> f64 {
        let mut acc = self.weights[c].max(1e-300).ln();
        for ((x, mu), var) in row
            .iter()
            .zip(self.means.row(c).iter())
            .zip(self.variances.row(c).iter())
        {
            acc -= 0.5 * ((2.0 * std::f64::consts::PI * var).ln() + (x - mu).powi(2) / var);
        }
        acc
    }

    /// Posterior responsibilities for one row.
    pub fn posterior(&self, row: ArrayView1<f64>) -> (Vec<f64>, f64) {
        let logs: Vec<f64> = (0..self.k()).map(|c| self.log_component(row, c)).collect();
        let mx = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = logs.iter().map(|l| (l - mx).exp()).sum();
        let log_norm = mx + sum.ln();
        (logs.iter().map(|l| (l - log_norm).exp()).collect(), log_norm)
    }

    pub fn assign(&self, row: ArrayView1<f64>) -> (usize, f64) {
        let (post, _) = self.posterior(row);
        post.iter()
            .enumerate()
            .fold((0usize, f64::NEG_INFINITY), |best, (c, p)| {
                if *p > best.1 { (c, *p) } else { best }
            })
    }

    fn e_step(&self, x: &Array2<f64>) -> (Array2<f64>, f64) {
        let n = x.nrows();
        let mut resp = Array2::<f64>::zeros((n, self.k()));
        let mut ll = 0.0;
        for i in 0..n {
            let (post, log_norm) = self.posterior(x.row(i));
            for (c, p) in post.into_iter().enumerate() {
                resp[(i, c)] = p;
            }
            ll += log_norm;
        }
        (resp, ll / n as f64)
    }

    fn m_step(&mut self, x: &Array2<f64>, resp: &Array2<f64>) {
        let n = x.nrows();
        let nk = resp.sum_axis(Axis(0));
        for c in 0..self.k() {
            let mass = nk[c].max(1e-12);
            self.weights[c] = mass / n as f64;
            let col = resp.column(c);
            let mean: Array1<f64> = x
                .rows()
                .into_iter()
                .zip(col.iter())
                .fold(Array1::zeros(x.ncols()), |acc, (row, r)| acc + &row * *r)
                / mass;
            let var: Array1<f64> = x
                .rows()
                .into_iter()
                .zip(col.iter())
                .fold(Array1::zeros(x.ncols()), |acc, (row, r)| {
                    let d = &row - &mean;
                    acc + &(&d * &d) * *r
                })
                / mass
                + REG_COVAR;
            self.means.row_mut(c).assign(&mean);
            self.variances.row_mut(c).assign(&var);
        }
    }
}

/// A fitted configuration of either family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family")]
pub enum ClusterModel {
    #[serde(rename = "kmeans")]
    KMeans(KMeansModel),
    #[serde(rename = "gmm")]
    GaussianMixture(GaussianMixtureModel),
}

impl ClusterModel {
    /// Fits and canonicalizes cluster ids against `x`.
    pub fn fit(
        family: ClusterFamily,
        x: &Array2<f64>,
        k: usize,
        opts: FitOptions,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        let mut model = match family {
            ClusterFamily::KMeans => ClusterModel::KMeans(KMeansModel::fit(x, k, opts, seed)?),
            ClusterFamily::GaussianMixture => {
                ClusterModel::GaussianMixture(GaussianMixtureModel::fit(x, k, opts, seed)?)
            }
        };
        model.canonicalize(x);
        Ok(model)
    }

    pub fn k(&self) -> usize {
        match self {
            ClusterModel::KMeans(m) => m.k(),
            ClusterModel::GaussianMixture(m) => m.k(),
        }
    }

    /// Cluster centers in the space the model was fit in.
    pub fn centers(&self) -> &Array2<f64> {
        match self {
            ClusterModel::KMeans(m) => &m.centroids,
            ClusterModel::GaussianMixture(m) => &m.means,
        }
    }

    /// Cluster id and confidence for one row.
    pub fn assign(&self, row: ArrayView1<f64>) -> (usize, f64) {
        match self {
            ClusterModel::KMeans(m) => m.assign(row),
            ClusterModel::GaussianMixture(m) => m.assign(row),
        }
    }

    pub fn predict(&self, x: &Array2<f64>) -> Vec<usize> {
        x.rows().into_iter().map(|r| self.assign(r).0).collect()
    }

    pub fn predict_with_confidence(&self, x: &Array2<f64>) -> Vec<(usize, f64)> {
        x.rows().into_iter().map(|r| self.assign(r)).collect()
    }

    /// Renumbers clusters by first appearance in `x`; clusters that own no row
    /// keep their relative order after the populated ones.
    fn canonicalize(&mut self, x: &Array2<f64>) {
        let k = self.k();
        let labels = self.predict(x);
        let mut order: Vec<usize> = Vec::with_capacity(k);
        for l in labels {
            if !order.contains(&l) {
                order.push(l);
            }
        }
        for c in 0..k {
            if !order.contains(&c) {
                order.push(c);
            }
        }
        let permute = |m: &Array2<f64>| m.select(Axis(0), &order);
        match self {
            ClusterModel::KMeans(m) => m.centroids = permute(&m.centroids),
            ClusterModel::GaussianMixture(m) => {
                m.means = permute(&m.means);
                m.variances = permute(&m.variances);
                m.weights = order.iter().map(|&c| m.weights[c]).collect();
            }
        }
    }
}
