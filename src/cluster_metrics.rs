use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// The three internal quality scores computed for every grid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    /// Cohesion/separation, higher is better, in [-1, 1].
    pub silhouette: f64,
    /// Compactness/dispersion, lower is better, non-negative.
    pub davies_bouldin: f64,
    /// Between/within dispersion, higher is better.
    pub calinski_harabasz: f64,
}

pub fn quality_scores(x: &Array2<f64>, labels: &[usize]) -> QualityScores {
    QualityScores {
        silhouette: silhouette_score(x, labels),
        davies_bouldin: davies_bouldin_score(x, labels),
        calinski_harabasz: calinski_harabasz_score(x, labels),
    }
}

pub fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn groups(labels: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let mut out: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, l) in labels.iter().enumerate() {
        out.entry(*l).or_default().push(i);
    }
    out
}

fn centroid(x: &Array2<f64>, members: &[usize]) -> Array1<f64> {
    let mut c = Array1::<f64>::zeros(x.ncols());
    for &i in members {
        c += &x.row(i);
    }
    c / members.len().max(1) as f64
}

/// Mean silhouette coefficient. Singleton clusters contribute 0.
pub fn silhouette_score(x: &Array2<f64>, labels: &[usize]) -> f64 {
    let groups = groups(labels);
    if groups.len() < 2 || x.nrows() != labels.len() {
        return 0.0;
    }
    let n = x.nrows();
    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        let own_members = &groups[&own];
        if own_members.len() <= 1 {
            continue;
        }
        let a = own_members
            .iter()
            .filter(|&&j| j != i)
            .map(|&j| euclidean(x.row(i), x.row(j)))
            .sum::<f64>()
            / (own_members.len() - 1) as f64;
        let b = groups
            .iter()
            .filter(|(l, _)| **l != own)
            .map(|(_, members)| {
                members
                    .iter()
                    .map(|&j| euclidean(x.row(i), x.row(j)))
                    .sum::<f64>()
                    / members.len() as f64
            })
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    total / n as f64
}

pub fn davies_bouldin_score(x: &Array2<f64>, labels: &[usize]) -> f64 {
    let groups = groups(labels);
    if groups.len() < 2 {
        return 0.0;
    }
    let centroids: Vec<Array1<f64>> = groups.values().map(|m| centroid(x, m)).collect();
    let scatter: Vec<f64> = groups
        .values()
        .zip(&centroids)
        .map(|(members, c)| {
            members
                .iter()
                .map(|&i| euclidean(x.row(i), c.view()))
                .sum::<f64>()
                / members.len() as f64
        })
        .collect();

    let k = centroids.len();
    let mut total = 0.0;
    for i in 0..k {
        let mut worst = 0.0_f64;
        for j in 0..k {
            if i == j {
                continue;
            }
            let d = euclidean(centroids[i].view(), centroids[j].view()).max(1e-12);
            worst = worst.max((scatter[i] + scatter[j]) / d);
        }
        total += worst;
    }
    total / k as f64
}

pub fn calinski_harabasz_score(x: &Array2<f64>, labels: &[usize]) -> f64 {
    let groups = groups(labels);
    let n = x.nrows();
    let k = groups.len();
    if k < 2 || n <= k {
        return 0.0;
    }
    let overall = centroid(x, &(0..n).collect::<Vec<_>>());
    let mut between = 0.0;
    let mut within = 0.0;
    for members in groups.values() {
        let c = centroid(x, members);
        let d = euclidean(c.view(), overall.view());
        between += members.len() as f64 * d * d;
        for &i in members {
            let e = euclidean(x.row(i), c.view());
            within += e * e;
        }
    }
    (between / (k - 1) as f64) / (within.max(1e-12) / (n - k) as f64)
}

fn comb2(n: usize) -> f64 {
    let n = n as f64;
    n * (n - 1.0) / 2.0
}

/// Chance-corrected agreement between two labelings of the same items.
/// Symmetric, 1 for identical partitions up to relabeling, ~0 for chance.
pub fn adjusted_rand_index(a: &[usize], b: &[usize]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 1.0;
    }
    let mut table: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut rows: BTreeMap<usize, usize> = BTreeMap::new();
    let mut cols: BTreeMap<usize, usize> = BTreeMap::new();
    for (x, y) in a.iter().zip(b.iter()).take(n) {
        *table.entry((*x, *y)).or_default() += 1;
        *rows.entry(*x).or_default() += 1;
        *cols.entry(*y).or_default() += 1;
    }
    let index: f64 = table.values().map(|&c| comb2(c)).sum();
    let sum_rows: f64 = rows.values().map(|&c| comb2(c)).sum();
    let sum_cols: f64 = cols.values().map(|&c| comb2(c)).sum();
    let expected = sum_rows * sum_cols / comb2(n);
    let max_index = 0.5 * (sum_rows + sum_cols);
    let denom = max_index - expected;
    if denom.abs() < 1e-12 {
        return 1.0;
    }
    ((index - expected) / denom).clamp(-1.0, 1.0)
}
