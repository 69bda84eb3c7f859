//! Descriptive statistics shared by the extractors and templates.
//!
//! All spreads are population statistics (ddof = 0).

use ndarray::{Array1, Array2, Axis};

use crate::error::BiometricError;

/// `{mean, std, variance, median, min, max}` of a non-empty slice.
pub(crate) fn describe(values: &[f64]) -> [f64; 6] {
    if values.is_empty() {
        return [0.0; 6];
    }
    let arr = Array1::from(values.to_vec());
    let mean = arr.mean().unwrap_or(0.0);
    let var = arr.var(0.0);
    [
        mean,
        var.sqrt(),
        var,
        median(values),
        arr.fold(f64::INFINITY, |acc, &x| acc.min(x)),
        arr.fold(f64::NEG_INFINITY, |acc, &x| acc.max(x)),
    ]
}

/// `{mean, std, variance}` of a slice; zeros when empty.
pub(crate) fn mean_std_var(values: &[f64]) -> [f64; 3] {
    if values.is_empty() {
        return [0.0; 3];
    }
    let arr = Array1::from(values.to_vec());
    let var = arr.var(0.0);
    [arr.mean().unwrap_or(0.0), var.sqrt(), var]
}

/// `{mean, std}` of consecutive first differences; zeros for fewer than two values.
pub(crate) fn diff_mean_std(values: &[f64]) -> [f64; 2] {
    if values.len() < 2 {
        return [0.0; 2];
    }
    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let [mean, std, _] = mean_std_var(&diffs);
    [mean, std]
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Per-dimension statistics over a set of equal-length sample vectors.
pub(crate) struct ColumnStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

pub(crate) fn column_stats(rows: &[&[f64]]) -> Result<ColumnStats, BiometricError> {
    let first = rows.first().ok_or(BiometricError::EmptyInput)?;
    let dim = first.len();

    let mut flat = Vec::with_capacity(rows.len() * dim);
    for row in rows {
        if row.len() != dim {
            return Err(BiometricError::DimensionMismatch {
                expected: dim,
                got: row.len(),
            });
        }
        flat.extend_from_slice(row);
    }

    let matrix = Array2::from_shape_vec((rows.len(), dim), flat).map_err(|_| {
        BiometricError::DimensionMismatch {
            expected: dim,
            got: 0,
        }
    })?;

    let mean = matrix
        .mean_axis(Axis(0))
        .ok_or(BiometricError::EmptyInput)?;
    let std = matrix.std_axis(Axis(0), 0.0);
    let min = matrix.fold_axis(Axis(0), f64::INFINITY, |&acc, &x| acc.min(x));
    let max = matrix.fold_axis(Axis(0), f64::NEG_INFINITY, |&acc, &x| acc.max(x));

    Ok(ColumnStats {
        mean: mean.to_vec(),
        std: std.to_vec(),
        min: min.to_vec(),
        max: max.to_vec(),
    })
}

/// Euclidean norm.
pub(crate) fn l2_norm(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().map(|v| v * v).sum::<f64>().sqrt()
}
