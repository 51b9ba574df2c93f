//! # Per-Voxel Scoring
//!
//! R2 (coefficient of determination) and Pearson correlation, computed
//! independently for every voxel over the held-out rows. Scores are never
//! averaged across voxels here; aggregation across folds belongs to the
//! analysis drivers.
//!
//! The clamp policy guards two failure modes at once: models worse than the
//! mean predictor (raw R2 below `r2_min`) and degenerate zero-variance
//! voxels whose fits look spuriously perfect (raw R2 at or above `r2_max`).
//! Both are scored as exactly 0.0 and processing continues.

use crate::config::AnalysisParams;
use ndarray::{Array1, ArrayView2, Axis};

/// Raw per-voxel R2: `1 - RSS/TSS` over the held-out rows, one score per
/// target column. A voxel with zero variance in the held-out signal scores
/// 1.0 raw, which the clamp policy then maps to 0.0.
pub fn r2_raw(y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>) -> Array1<f64> {
    assert_eq!(y_true.shape(), y_pred.shape(), "scoring shape mismatch");
    let n = y_true.nrows() as f64;
    let means = y_true.sum_axis(Axis(0)) / n;
    let nb_voxels = y_true.ncols();
    let mut scores = Array1::zeros(nb_voxels);
    for voxel in 0..nb_voxels {
        let truth = y_true.column(voxel);
        let pred = y_pred.column(voxel);
        let rss: f64 = truth
            .iter()
            .zip(pred.iter())
            .map(|(t, p)| (t - p) * (t - p))
            .sum();
        let tss: f64 = truth.iter().map(|t| (t - means[voxel]) * (t - means[voxel])).sum();
        scores[voxel] = if tss == 0.0 { 1.0 } else { 1.0 - rss / tss };
    }
    scores
}

/// Applies the clamp policy: anything below `r2_min` or at/above `r2_max`
/// becomes exactly 0.0; scores in `[r2_min, r2_max)` pass through unchanged.
pub fn clamp_r2(scores: &Array1<f64>, r2_min: f64, r2_max: f64) -> Array1<f64> {
    scores.mapv(|s| if s < r2_min || s >= r2_max { 0.0 } else { s })
}

/// Clamped per-voxel R2, the score every fold reports.
pub fn r2_clamped(
    y_true: ArrayView2<f64>,
    y_pred: ArrayView2<f64>,
    params: &AnalysisParams,
) -> Array1<f64> {
    clamp_r2(&r2_raw(y_true, y_pred), params.r2_min, params.r2_max)
}

/// Per-voxel Pearson correlation between held-out signal and predictions.
/// Voxels with zero variance on either side score 0.0.
pub fn pearson_per_voxel(y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>) -> Array1<f64> {
    assert_eq!(y_true.shape(), y_pred.shape(), "scoring shape mismatch");
    let n = y_true.nrows() as f64;
    let nb_voxels = y_true.ncols();
    let mut corr = Array1::zeros(nb_voxels);
    for voxel in 0..nb_voxels {
        let t = y_true.column(voxel);
        let p = y_pred.column(voxel);
        let t_mean = t.sum() / n;
        let p_mean = p.sum() / n;
        let mut cov = 0.0;
        let mut t_var = 0.0;
        let mut p_var = 0.0;
        for (&ti, &pi) in t.iter().zip(p.iter()) {
            let dt = ti - t_mean;
            let dp = pi - p_mean;
            cov += dt * dp;
            t_var += dt * dt;
            p_var += dp * dp;
        }
        corr[voxel] = if t_var == 0.0 || p_var == 0.0 {
            0.0
        } else {
            cov / (t_var.sqrt() * p_var.sqrt())
        };
    }
    corr
}

/// The whole-brain summary logged once per fold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl ScoreSummary {
    pub fn from_scores(scores: &Array1<f64>) -> Self {
        let n = scores.len() as f64;
        let mean = scores.sum() / n;
        let var = scores.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;
        Self {
            mean,
            std: var.sqrt(),
            min: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn r2_is_one_for_perfect_predictions() {
        let y = array![[1.0, 5.0], [2.0, 4.0], [3.0, 3.0]];
        let scores = r2_raw(y.view(), y.view());
        assert_abs_diff_eq!(scores[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(scores[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn r2_is_zero_for_mean_predictions() {
        let y_true = array![[1.0], [2.0], [3.0]];
        let y_pred = array![[2.0], [2.0], [2.0]];
        let scores = r2_raw(y_true.view(), y_pred.view());
        assert_abs_diff_eq!(scores[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn clamp_boundaries_are_exact() {
        let raw = array![-0.5, -1e-12, 0.0, 0.5, 0.98999, 0.99, 1.0];
        let clamped = clamp_r2(&raw, 0.0, 0.99);
        assert_eq!(
            clamped,
            array![0.0, 0.0, 0.0, 0.5, 0.98999, 0.0, 0.0]
        );
    }

    #[test]
    fn zero_variance_voxel_is_clamped_to_zero() {
        let y_true = array![[2.0], [2.0], [2.0]];
        let y_pred = array![[2.0], [2.0], [2.0]];
        let raw = r2_raw(y_true.view(), y_pred.view());
        assert_abs_diff_eq!(raw[0], 1.0, epsilon = 1e-12);
        let clamped = clamp_r2(&raw, 0.0, 0.99);
        assert_abs_diff_eq!(clamped[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn pearson_detects_sign_of_association() {
        let y_true = array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        let y_pred = array![[1.1, 3.0], [2.2, 2.0], [2.9, 1.0]];
        let corr = pearson_per_voxel(y_true.view(), y_pred.view());
        assert!(corr[0] > 0.99);
        assert_abs_diff_eq!(corr[1], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn summary_reports_the_four_statistics() {
        let scores = array![0.0, 0.1, 0.2, 0.3];
        let summary = ScoreSummary::from_scores(&scores);
        assert_abs_diff_eq!(summary.mean, 0.15, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.min, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.max, 0.3, epsilon = 1e-12);
        assert!(summary.std > 0.0);
    }
}
