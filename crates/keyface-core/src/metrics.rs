//! Offline performance evaluation over labeled similarity scores.
//!
//! Labels are `1` for genuine attempts and `0` for impostor attempts. A
//! score is accepted at threshold `t` when `score >= t`.
//!
//! The equal error rate is located in two steps: the grid point minimizing
//! `|FAR − FRR|`, then bisection on the piecewise-linear interpolation of
//! `FAR − FRR` across the grid. The refinement is a fixed bisection and
//! involves no randomness.

use ndarray::Array1;
use serde::Serialize;

use crate::error::BiometricError;

/// Number of points in the default threshold grid.
pub const DEFAULT_GRID_POINTS: usize = 1000;

const BISECTION_MAX_ITER: usize = 200;
const BISECTION_TOLERANCE: f64 = 1e-12;

/// Evenly spaced thresholds over `[0, 1]`, both ends included.
pub fn default_thresholds() -> Vec<f64> {
    Array1::linspace(0.0, 1.0, DEFAULT_GRID_POINTS).to_vec()
}

/// FAR and FRR evaluated over an ascending threshold grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceCurve {
    pub thresholds: Vec<f64>,
    pub far: Vec<f64>,
    pub frr: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EqualErrorRate {
    pub eer: f64,
    pub threshold: f64,
    /// `false` when the grid estimate was kept because no sign change
    /// of `FAR − FRR` could be bracketed.
    pub refined: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemEvaluation {
    pub eer: f64,
    pub eer_threshold: f64,
    pub far: f64,
    pub frr: f64,
    pub gar: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub threshold: f64,
}

/// Compute FAR/FRR for every threshold in `thresholds` (default grid when `None`).
///
/// A custom grid is sorted ascending. A class with no samples yields a rate
/// of 0 at every threshold.
pub fn far_frr(
    labels: &[u8],
    scores: &[f64],
    thresholds: Option<&[f64]>,
) -> Result<PerformanceCurve, BiometricError> {
    let (genuine, impostor) = split_scores(labels, scores)?;

    let mut grid = match thresholds {
        Some(t) => t.to_vec(),
        None => default_thresholds(),
    };
    if grid.is_empty() {
        return Err(BiometricError::EmptyInput);
    }
    grid.sort_by(f64::total_cmp);

    let rate = |count: usize, total: usize| {
        if total == 0 {
            0.0
        } else {
            count as f64 / total as f64
        }
    };

    let far = grid
        .iter()
        .map(|&t| rate(impostor.iter().filter(|&&s| s >= t).count(), impostor.len()))
        .collect();
    let frr = grid
        .iter()
        .map(|&t| rate(genuine.iter().filter(|&&s| s < t).count(), genuine.len()))
        .collect();

    Ok(PerformanceCurve {
        thresholds: grid,
        far,
        frr,
    })
}

impl PerformanceCurve {
    /// Genuine acceptance rate, `1 − FRR`, per threshold.
    pub fn gar(&self) -> Vec<f64> {
        self.frr.iter().map(|r| 1.0 - r).collect()
    }

    /// Equal error rate: the grid point where FAR and FRR are closest,
    /// refined by bisection when FAR − FRR changes sign on the grid.
    ///
    /// A curve with no points, or with FAR/FRR lengths that disagree with
    /// the grid, is rejected.
    pub fn eer(&self) -> Result<EqualErrorRate, BiometricError> {
        if self.thresholds.is_empty() {
            return Err(BiometricError::EmptyInput);
        }
        for rates in [&self.far, &self.frr] {
            if rates.len() != self.thresholds.len() {
                return Err(BiometricError::LengthMismatch {
                    left: self.thresholds.len(),
                    right: rates.len(),
                });
            }
        }

        let idx = self.nearest_equal_index();
        let grid_estimate = EqualErrorRate {
            eer: (self.far[idx] + self.frr[idx]) / 2.0,
            threshold: self.thresholds[idx],
            refined: false,
        };

        Ok(match self.bisect_crossing() {
            Some(t) => EqualErrorRate {
                eer: (interpolate(&self.thresholds, &self.far, t)
                    + interpolate(&self.thresholds, &self.frr, t))
                    / 2.0,
                threshold: t,
                refined: true,
            },
            None => grid_estimate,
        })
    }

    /// Index of the grid point nearest `threshold`; first one on ties.
    pub fn nearest_index(&self, threshold: f64) -> usize {
        argmin(self.thresholds.iter().map(|t| (t - threshold).abs()))
    }

    fn nearest_equal_index(&self) -> usize {
        argmin(self.far.iter().zip(&self.frr).map(|(a, r)| (a - r).abs()))
    }

    fn difference(&self) -> Vec<f64> {
        self.far.iter().zip(&self.frr).map(|(a, r)| a - r).collect()
    }

    fn bisect_crossing(&self) -> Option<f64> {
        let diff = self.difference();
        let f = |t: f64| interpolate(&self.thresholds, &diff, t);

        let (mut lo, mut hi) = (*self.thresholds.first()?, *self.thresholds.last()?);
        let (mut f_lo, f_hi) = (f(lo), f(hi));
        if f_lo == 0.0 {
            return Some(lo);
        }
        if f_hi == 0.0 {
            return Some(hi);
        }
        if f_lo.signum() == f_hi.signum() {
            return None;
        }

        for _ in 0..BISECTION_MAX_ITER {
            let mid = lo + (hi - lo) / 2.0;
            let f_mid = f(mid);
            if f_mid == 0.0 || hi - lo <= BISECTION_TOLERANCE {
                return Some(mid);
            }
            if f_mid.signum() == f_lo.signum() {
                lo = mid;
                f_lo = f_mid;
            } else {
                hi = mid;
            }
        }
        Some(lo + (hi - lo) / 2.0)
    }
}

/// Full evaluation at an operating threshold (the EER threshold when `None`).
///
/// FAR/FRR/GAR are read at the grid point nearest the operating threshold;
/// accuracy, precision, recall and F1 come from thresholding the raw scores
/// at the operating threshold itself. Zero denominators give 0.
pub fn evaluate_system(
    labels: &[u8],
    scores: &[f64],
    threshold: Option<f64>,
) -> Result<SystemEvaluation, BiometricError> {
    let curve = far_frr(labels, scores, None)?;
    let eer = curve.eer()?;
    let threshold = threshold.unwrap_or(eer.threshold);

    let idx = curve.nearest_index(threshold);
    let (far, frr) = (curve.far[idx], curve.frr[idx]);

    let (mut tp, mut tn, mut fp, mut fn_) = (0usize, 0usize, 0usize, 0usize);
    for (&label, &score) in labels.iter().zip(scores) {
        match (label == 1, score >= threshold) {
            (true, true) => tp += 1,
            (false, false) => tn += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
        }
    }

    let ratio = |num: usize, den: usize| {
        if den == 0 {
            0.0
        } else {
            num as f64 / den as f64
        }
    };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    Ok(SystemEvaluation {
        eer: eer.eer,
        eer_threshold: eer.threshold,
        far,
        frr,
        gar: 1.0 - frr,
        accuracy: ratio(tp + tn, labels.len()),
        precision,
        recall,
        f1,
        threshold,
    })
}

fn split_scores(labels: &[u8], scores: &[f64]) -> Result<(Vec<f64>, Vec<f64>), BiometricError> {
    if labels.len() != scores.len() {
        return Err(BiometricError::LengthMismatch {
            left: labels.len(),
            right: scores.len(),
        });
    }
    if labels.is_empty() {
        return Err(BiometricError::EmptyInput);
    }

    let mut genuine = Vec::new();
    let mut impostor = Vec::new();
    for (&label, &score) in labels.iter().zip(scores) {
        match label {
            1 => genuine.push(score),
            0 => impostor.push(score),
            other => return Err(BiometricError::InvalidLabel(other)),
        }
    }
    Ok((genuine, impostor))
}

/// Piecewise-linear interpolation through `(xs[i], ys[i])`; `xs` ascending.
/// Outside the grid the nearest endpoint value is returned.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let upper = xs.partition_point(|&v| v < x);
    if upper == 0 {
        return ys[0];
    }
    if upper >= xs.len() {
        return ys[ys.len() - 1];
    }
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    if x1 == x0 {
        return y1;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

fn argmin(values: impl Iterator<Item = f64>) -> usize {
    let mut best = (0, f64::INFINITY);
    for (i, v) in values.enumerate() {
        if v < best.1 {
            best = (i, v);
        }
    }
    best.0
}
