//! 2-D t-SNE layout of the projected population. Visualization only: nothing
//! downstream reads these coordinates for modeling.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EmbeddingConfig;

const EARLY_EXAGGERATION: f64 = 12.0;
const MIN_GAIN: f64 = 0.01;
const PERPLEXITY_TOL: f64 = 1e-5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingPoint {
    pub player_id: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding2d {
    pub perplexity: f64,
    pub iterations: usize,
    pub kl_divergence: f64,
    pub points: Vec<EmbeddingPoint>,
}

fn sq_distances(x: &Array2<f64>) -> Array2<f64> {
    let n = x.nrows();
    let mut d = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let v: f64 = x
                .row(i)
                .iter()
                .zip(x.row(j).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            d[(i, j)] = v;
            d[(j, i)] = v;
        }
    }
    d
}

/// Symmetric joint probabilities with each row's bandwidth tuned to the
/// target perplexity by bisection.
fn joint_probabilities(d: &Array2<f64>, perplexity: f64) -> Array2<f64> {
    let n = d.nrows();
    let target = perplexity.ln();
    let mut p = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        let (mut lo, mut hi) = (f64::NEG_INFINITY, f64::INFINITY);
        let mut beta = 1.0;
        let mut row = vec![0.0; n];
        for _ in 0..100 {
            let mut sum = 0.0;
            for j in 0..n {
                row[j] = if i == j { 0.0 } else { (-d[(i, j)] * beta).exp() };
                sum += row[j];
            }
            let sum = sum.max(1e-300);
            let mut entropy = 0.0;
            for j in 0..n {
                row[j] /= sum;
                if row[j] > 1e-300 {
                    entropy -= row[j] * row[j].ln();
                }
            }
            let diff = entropy - target;
            if diff.abs() < PERPLEXITY_TOL {
                break;
            }
            if diff > 0.0 {
                lo = beta;
                beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
            } else {
                hi = beta;
                beta = if lo.is_finite() { (beta + lo) / 2.0 } else { beta / 2.0 };
            }
        }
        for j in 0..n {
            p[(i, j)] = row[j];
        }
    }
    let sym = (&p + &p.t()) / (2.0 * n as f64);
    sym.mapv(|v| v.max(1e-12))
}

/// Exact t-SNE initialised from the first two principal axes, so the layout
/// is fully determined by its input.
pub fn embed(projected: &Array2<f64>, player_ids: &[String], cfg: &EmbeddingConfig) -> Embedding2d {
    let n = projected.nrows();
    let mut y = Array2::<f64>::zeros((n, 2));
    for c in 0..projected.ncols().min(2) {
        y.column_mut(c).assign(&projected.column(c));
    }
    let std0 = {
        let col = y.column(0);
        let mean = col.sum() / n.max(1) as f64;
        (col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n.max(1) as f64).sqrt()
    };
    if std0 > 0.0 {
        y.mapv_inplace(|v| v / std0 * 1e-4);
    }

    let perplexity = cfg.perplexity.min((n.saturating_sub(1)) as f64 / 3.0).max(1.0);
    let mut kl = 0.0;
    if n >= 4 {
        let p = joint_probabilities(&sq_distances(projected), perplexity);
        let learning_rate = (n as f64 / EARLY_EXAGGERATION / 4.0).max(50.0);
        let exaggerated = cfg.iterations.min(250) / 2;
        let mut update = Array2::<f64>::zeros((n, 2));
        let mut gains = Array2::<f64>::ones((n, 2));

        for it in 0..cfg.iterations {
            let exaggeration = if it < exaggerated { EARLY_EXAGGERATION } else { 1.0 };
            let momentum = if it < exaggerated { 0.5 } else { 0.8 };

            let mut num = Array2::<f64>::zeros((n, n));
            let mut total = 0.0;
            for i in 0..n {
                for j in (i + 1)..n {
                    let dx = y[(i, 0)] - y[(j, 0)];
                    let dy = y[(i, 1)] - y[(j, 1)];
                    let v = 1.0 / (1.0 + dx * dx + dy * dy);
                    num[(i, j)] = v;
                    num[(j, i)] = v;
                    total += 2.0 * v;
                }
            }
            let total = total.max(1e-300);

            let mut grad = Array2::<f64>::zeros((n, 2));
            for i in 0..n {
                for j in 0..n {
                    if i == j {
                        continue;
                    }
                    let q = (num[(i, j)] / total).max(1e-12);
                    let mult = 4.0 * (exaggeration * p[(i, j)] - q) * num[(i, j)];
                    grad[(i, 0)] += mult * (y[(i, 0)] - y[(j, 0)]);
                    grad[(i, 1)] += mult * (y[(i, 1)] - y[(j, 1)]);
                }
            }

            for ((g, u), gain) in grad.iter().zip(update.iter_mut()).zip(gains.iter_mut()) {
                *gain = if (*g > 0.0) != (*u > 0.0) {
                    *gain + 0.2
                } else {
                    (*gain * 0.8).max(MIN_GAIN)
                };
                *u = momentum * *u - learning_rate * *gain * *g;
            }
            y += &update;

            if it + 1 == cfg.iterations || (it + 1) % 100 == 0 {
                kl = 0.0;
                for i in 0..n {
                    for j in 0..n {
                        if i != j {
                            let q = (num[(i, j)] / total).max(1e-12);
                            kl += p[(i, j)] * (p[(i, j)] / q).ln();
                        }
                    }
                }
                debug!(iteration = it + 1, kl, "t-sne progress");
            }
        }
    }

    info!(players = n, perplexity, kl_divergence = kl, "2-d embedding computed");
    Embedding2d {
        perplexity,
        iterations: cfg.iterations,
        kl_divergence: kl,
        points: player_ids
            .iter()
            .zip(y.rows())
            .map(|(id, r)| EmbeddingPoint {
                player_id: id.clone(),
                x: r[0],
                y: r[1],
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_groups() -> (Array2<f64>, Vec<String>) {
        let x = Array2::from_shape_fn((24, 3), |(i, j)| {
            let offset = if i < 12 { 0.0 } else { 10.0 };
            offset + ((i * 5 + j * 3) % 7) as f64 * 0.1
        });
        let ids = (0..24).map(|i| format!("p{i}")).collect();
        (x, ids)
    }

    #[test]
    fn joint_probabilities_are_symmetric_and_normalized() {
        let (x, _) = two_groups();
        let p = joint_probabilities(&sq_distances(&x), 5.0);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        for i in 0..p.nrows() {
            for j in 0..p.ncols() {
                assert!((p[(i, j)] - p[(j, i)]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn groups_stay_apart_and_output_is_deterministic() {
        let (x, ids) = two_groups();
        let cfg = EmbeddingConfig {
            enabled: true,
            perplexity: 5.0,
            iterations: 300,
        };
        let a = embed(&x, &ids, &cfg);
        let b = embed(&x, &ids, &cfg);
        assert_eq!(a, b);
        assert_eq!(a.points.len(), 24);
        assert!(a.points.iter().all(|p| p.x.is_finite() && p.y.is_finite()));

        let centroid = |range: std::ops::Range<usize>| {
            let len = range.len() as f64;
            let (sx, sy) = range.fold((0.0, 0.0), |acc, i| {
                (acc.0 + a.points[i].x, acc.1 + a.points[i].y)
            });
            (sx / len, sy / len)
        };
        let (c0, c1) = (centroid(0..12), centroid(12..24));
        let between = ((c0.0 - c1.0).powi(2) + (c0.1 - c1.1).powi(2)).sqrt();
        let spread = (0..12)
            .map(|i| ((a.points[i].x - c0.0).powi(2) + (a.points[i].y - c0.1).powi(2)).sqrt())
            .fold(0.0, f64::max);
        assert!(between > spread);
    }
}
