//! # Permutation Null Distributions
//!
//! Significance assessment for the encoding scores: the held-out signal is
//! row-shuffled (whole timepoints permuted, preserving the cross-voxel
//! structure of each timepoint) and rescored against the model predictions.
//! Pooling those scores gives a per-voxel null distribution of clamped R2,
//! from which a percentile threshold is read. Shuffles come from a seeded
//! generator, so thresholds are reproducible.

use crate::config::AnalysisParams;
use crate::score::r2_clamped;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

/// `nb_permutations` independent row orderings of `nb_rows` rows, drawn
/// from a generator seeded with `seed`.
pub fn generate_shufflings(
    nb_rows: usize,
    nb_permutations: usize,
    seed: u64,
) -> Vec<Vec<usize>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..nb_permutations)
        .map(|_| {
            let mut indices: Vec<usize> = (0..nb_rows).collect();
            indices.shuffle(&mut rng);
            indices
        })
        .collect()
}

/// Clamped R2 of the predictions against each row-shuffled copy of the
/// held-out signal. Shape: `[permutations, voxels]`.
pub fn null_scores(
    y_true: ArrayView2<f64>,
    predictions: ArrayView2<f64>,
    shufflings: &[Vec<usize>],
    params: &AnalysisParams,
) -> Array2<f64> {
    let rows: Vec<Array1<f64>> = shufflings
        .par_iter()
        .map(|permutation| {
            let permuted = y_true.select(Axis(0), permutation);
            r2_clamped(permuted.view(), predictions, params)
        })
        .collect();
    let mut scores = Array2::zeros((rows.len(), y_true.ncols()));
    for (i, row) in rows.iter().enumerate() {
        scores.row_mut(i).assign(row);
    }
    scores
}

/// Per-voxel percentile of a null distribution (rows = samples, columns =
/// voxels), with linear interpolation between order statistics.
pub fn percentile_threshold(distribution: ArrayView2<f64>, percentile: f64) -> Array1<f64> {
    let nb_samples = distribution.nrows();
    assert!(nb_samples > 0, "empty null distribution");
    let rank = percentile / 100.0 * (nb_samples - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(nb_samples - 1);
    let fraction = rank - lower as f64;

    let nb_voxels = distribution.ncols();
    let mut thresholds = Array1::zeros(nb_voxels);
    for voxel in 0..nb_voxels {
        let mut column: Vec<f64> = distribution.column(voxel).to_vec();
        column.sort_by(|a, b| a.partial_cmp(b).expect("null scores are finite"));
        thresholds[voxel] = column[lower] * (1.0 - fraction) + column[upper] * fraction;
    }
    thresholds
}
