//! # Whole-Brain and Per-Voxel Analysis Drivers
//!
//! The orchestration of the nested cross-validation, in two modes sharing
//! one linear pipeline per call: `Split -> {Fit per fold} -> Aggregate`.
//!
//! - Whole-brain mode fits one global model per outer leave-one-run-out
//!   fold, on all voxels jointly. With the cross-validated ridge strategy,
//!   the global alpha is chosen per fold by leave-one-run-out over the
//!   training runs, using the fold index map to address the stacked rows.
//! - Per-voxel mode runs three nested loops: outer (leave-one-run-out
//!   test), middle (leave-one-out validation among the remaining runs),
//!   inner (the regularization path). Each voxel gets the alpha maximizing
//!   its mean validation score across the nested folds (stable argmax), is
//!   refit on the full outer-training stack at that strength, and is scored
//!   on the held-out run. Voxels sharing a selected alpha are refit jointly.
//!
//! Final per-voxel statistics are arithmetic means across the outer folds.
//! A fit failure (singular system) aborts the subject; degenerate voxels
//! are handled by the R2 clamp, not treated as errors.

use crate::config::AnalysisParams;
use crate::data::{stack_runs, DataError, SubjectData};
use crate::folds::{build_fold_index_map, leave_one_out, SplitError};
use crate::logbook::{FoldLogger, LogError};
use crate::permutation::{generate_shufflings, null_scores, percentile_threshold};
use crate::ridge::{Estimator, FitError, FittedLinearModel, Glm, Ridge};
use crate::score::{pearson_per_voxel, r2_clamped, ScoreSummary};
use itertools::Itertools;
use ndarray::{concatenate, s, Array1, Array2, Array3, Axis};
use rayon::prelude::*;
use thiserror::Error;

/// A comprehensive error type for the analysis drivers. Every variant
/// carries enough context (subject, fold) to feed the append-only log.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("subject {subject}, outer fold {fold}: {source}")]
    FoldFit {
        subject: String,
        fold: usize,
        source: FitError,
    },
    #[error("the regularization path is empty; nothing to search")]
    EmptyRegularizationPath,
    #[error("permutation testing requested with nb_permutations = 0")]
    NoPermutationsConfigured,
}

/// Model strategy for whole-brain mode. Whether run-level fold grouping is
/// required is an explicit property of the strategy, not a runtime type
/// check on the estimator.
#[derive(Debug, Clone)]
pub enum WholeBrainModel {
    /// Ordinary least squares, no hyperparameter search.
    Glm,
    /// Ridge with a global alpha cross-validated over the training runs.
    RidgeCv { alphas: Vec<f64> },
}

impl WholeBrainModel {
    /// True when the strategy consumes a run-grouping fold index map.
    pub fn needs_fold_map(&self) -> bool {
        matches!(self, WholeBrainModel::RidgeCv { .. })
    }
}

/// The model fitted on one outer-training partition, kept so the
/// permutation stage can rescore the held-out run without refitting.
#[derive(Debug)]
pub struct FoldModel {
    pub fitted: FittedLinearModel,
    pub held_out: usize,
    /// Global alpha, when the strategy selected one.
    pub alpha: Option<f64>,
}

/// Whole-brain results: per-fold score rows plus their per-voxel mean.
#[derive(Debug)]
pub struct WholeBrainOutcome {
    /// Clamped test R2, one row per outer fold. Shape `[folds, voxels]`.
    pub fold_scores: Array2<f64>,
    /// Mean test R2 across outer folds, per voxel.
    pub r2_test: Array1<f64>,
    /// Mean test Pearson correlation across outer folds, per voxel.
    pub pearson_test: Array1<f64>,
    pub fold_models: Vec<FoldModel>,
}

/// Per-voxel results: selected strengths and test scores per fold, plus
/// their per-voxel means.
#[derive(Debug)]
pub struct PerVoxelOutcome {
    /// Selected alpha per outer fold and voxel. Shape `[folds, voxels]`.
    pub fold_alphas: Array2<f64>,
    /// Clamped test R2 per outer fold and voxel. Shape `[folds, voxels]`.
    pub fold_scores: Array2<f64>,
    /// Mean selected alpha across outer folds, per voxel.
    pub alphas: Array1<f64>,
    /// Mean test R2 across outer folds, per voxel.
    pub r2_test: Array1<f64>,
    /// Mean test Pearson correlation across outer folds, per voxel.
    pub pearson_test: Array1<f64>,
    pub fold_models: Vec<FoldModel>,
}

/// For each voxel, the index into `path` of the strength maximizing the
/// mean validation score across nested folds, first occurrence winning
/// ties. `validation_scores` has shape `[voxels, nested_folds, alphas]`.
pub fn select_best_alphas(
    validation_scores: &Array3<f64>,
    path: &[f64],
) -> (Vec<usize>, Array1<f64>) {
    let mean_over_folds = validation_scores
        .mean_axis(Axis(1))
        .expect("at least one nested fold");
    let nb_voxels = mean_over_folds.nrows();
    let mut best_indices = Vec::with_capacity(nb_voxels);
    let mut best_alphas = Array1::zeros(nb_voxels);
    for voxel in 0..nb_voxels {
        let row = mean_over_folds.row(voxel);
        let mut best = 0usize;
        for (k, &score) in row.iter().enumerate() {
            if score > row[best] {
                best = k;
            }
        }
        best_indices.push(best);
        best_alphas[voxel] = path[best];
    }
    (best_indices, best_alphas)
}

/// Whole-brain mode: one global fit per outer fold, mean test R2 per voxel.
pub fn whole_brain_analysis(
    model: &WholeBrainModel,
    subject: &SubjectData,
    params: &AnalysisParams,
    mut logger: Option<&mut FoldLogger>,
) -> Result<WholeBrainOutcome, AnalysisError> {
    let folds = leave_one_out(subject.nb_runs())?;
    let nb_voxels = subject.nb_voxels();
    let mut fold_scores = Array2::zeros((folds.len(), nb_voxels));
    let mut fold_pearson = Array2::zeros((folds.len(), nb_voxels));
    let mut fold_models = Vec::with_capacity(folds.len());

    for (fold_idx, fold) in folds.iter().enumerate() {
        let fit_err = |source: FitError| AnalysisError::FoldFit {
            subject: subject.subject.to_string(),
            fold: fold_idx,
            source,
        };
        let x_train = stack_runs(subject.design_runs, &fold.train);
        let y_train = stack_runs(&subject.fmri_runs, &fold.train);

        let (fitted, alpha) = match model {
            WholeBrainModel::Glm => {
                let fitted = Glm.fit(x_train.view(), y_train.view()).map_err(&fit_err)?;
                (fitted, None)
            }
            WholeBrainModel::RidgeCv { alphas } => {
                let alpha = select_global_alpha(subject, &fold.train, alphas, params)
                    .map_err(|e| match e {
                        GlobalAlphaError::Fit(source) => fit_err(source),
                        GlobalAlphaError::Split(e) => AnalysisError::Split(e),
                        GlobalAlphaError::EmptyPath => AnalysisError::EmptyRegularizationPath,
                    })?;
                log::info!(
                    "subject {}: outer fold {} selected global alpha {:.6e}",
                    subject.subject,
                    fold_idx,
                    alpha
                );
                let fitted = Ridge { alpha }
                    .fit(x_train.view(), y_train.view())
                    .map_err(&fit_err)?;
                (fitted, Some(alpha))
            }
        };

        let x_test = &subject.design_runs[fold.held_out];
        let y_test = &subject.fmri_runs[fold.held_out];
        let predictions = fitted.predict(x_test.view());
        let r2 = r2_clamped(y_test.view(), predictions.view(), params);
        let pearson = pearson_per_voxel(y_test.view(), predictions.view());

        if let Some(logger) = logger.as_deref_mut() {
            logger.whole_brain(subject.subject, &ScoreSummary::from_scores(&r2))?;
        }
        fold_scores.row_mut(fold_idx).assign(&r2);
        fold_pearson.row_mut(fold_idx).assign(&pearson);
        fold_models.push(FoldModel {
            fitted,
            held_out: fold.held_out,
            alpha,
        });
    }

    let r2_test = fold_scores.mean_axis(Axis(0)).expect("at least two folds");
    let pearson_test = fold_pearson.mean_axis(Axis(0)).expect("at least two folds");
    Ok(WholeBrainOutcome {
        fold_scores,
        r2_test,
        pearson_test,
        fold_models,
    })
}

enum GlobalAlphaError {
    Fit(FitError),
    Split(SplitError),
    EmptyPath,
}

/// Leave-one-run-out search for the single alpha maximizing the mean
/// clamped validation R2 across voxels and inner folds. The stacked
/// training matrix is addressed through the fold index map, recomputed for
/// this concatenation.
fn select_global_alpha(
    subject: &SubjectData,
    train_runs: &[usize],
    path: &[f64],
    params: &AnalysisParams,
) -> Result<f64, GlobalAlphaError> {
    if path.is_empty() {
        return Err(GlobalAlphaError::EmptyPath);
    }
    let x_all = stack_runs(subject.design_runs, train_runs);
    let y_all = stack_runs(&subject.fmri_runs, train_runs);
    let index_map = build_fold_index_map(&subject.run_lengths(), train_runs)
        .map_err(GlobalAlphaError::Split)?;
    let inner_folds = leave_one_out(train_runs.len()).map_err(GlobalAlphaError::Split)?;

    let mut mean_scores = vec![0.0f64; path.len()];
    for fold in &inner_folds {
        let valid_range = index_map
            .range_of(train_runs[fold.held_out])
            .expect("held-out run is part of the concatenation");
        let train_rows: Vec<usize> = fold
            .train
            .iter()
            .flat_map(|&i| {
                index_map
                    .range_of(train_runs[i])
                    .expect("train run is part of the concatenation")
            })
            .collect();
        let x_tr = x_all.select(Axis(0), &train_rows);
        let y_tr = y_all.select(Axis(0), &train_rows);
        let x_va = x_all.slice(s![valid_range.clone(), ..]);
        let y_va = y_all.slice(s![valid_range, ..]);

        let per_alpha: Vec<f64> = path
            .par_iter()
            .map(|&alpha| -> Result<f64, FitError> {
                let fitted = Ridge { alpha }.fit(x_tr.view(), y_tr.view())?;
                let r2 = r2_clamped(y_va, fitted.predict(x_va).view(), params);
                Ok(r2.mean().unwrap_or(0.0))
            })
            .collect::<Result<_, _>>()
            .map_err(GlobalAlphaError::Fit)?;
        for (total, score) in mean_scores.iter_mut().zip(per_alpha) {
            *total += score;
        }
    }

    let mut best = 0usize;
    for (k, &score) in mean_scores.iter().enumerate() {
        if score > mean_scores[best] {
            best = k;
        }
    }
    Ok(path[best])
}

/// Per-voxel mode: nested alpha search, per-voxel refit, mean across folds.
pub fn per_voxel_analysis(
    subject: &SubjectData,
    params: &AnalysisParams,
    mut logger: Option<&mut FoldLogger>,
) -> Result<PerVoxelOutcome, AnalysisError> {
    let path = params.regularization_path();
    if path.is_empty() {
        return Err(AnalysisError::EmptyRegularizationPath);
    }
    let nb_voxels = subject.nb_voxels();
    let nb_features = subject.design_runs[0].ncols();
    let outer_folds = leave_one_out(subject.nb_runs())?;

    let mut fold_alphas = Array2::zeros((outer_folds.len(), nb_voxels));
    let mut fold_scores = Array2::zeros((outer_folds.len(), nb_voxels));
    let mut fold_pearson = Array2::zeros((outer_folds.len(), nb_voxels));
    let mut fold_models = Vec::with_capacity(outer_folds.len());

    for (outer_idx, fold) in outer_folds.iter().enumerate() {
        let fit_err = |source: FitError| AnalysisError::FoldFit {
            subject: subject.subject.to_string(),
            fold: outer_idx,
            source,
        };

        // Middle loop: leave-one-out validation among the training runs.
        let nested_folds = leave_one_out(fold.train.len())?;
        let mut validation_scores =
            Array3::zeros((nb_voxels, nested_folds.len(), path.len()));
        for (nested_idx, nested) in nested_folds.iter().enumerate() {
            let train_runs: Vec<usize> =
                nested.train.iter().map(|&i| fold.train[i]).collect();
            let valid_run = fold.train[nested.held_out];
            let x_tr = stack_runs(subject.design_runs, &train_runs);
            let y_tr = stack_runs(&subject.fmri_runs, &train_runs);
            let x_va = &subject.design_runs[valid_run];
            let y_va = &subject.fmri_runs[valid_run];

            // Inner loop: one fit per candidate alpha, all voxels at once.
            let per_alpha: Vec<Array1<f64>> = path
                .par_iter()
                .map(|&alpha| -> Result<Array1<f64>, FitError> {
                    let fitted = Ridge { alpha }.fit(x_tr.view(), y_tr.view())?;
                    Ok(r2_clamped(
                        y_va.view(),
                        fitted.predict(x_va.view()).view(),
                        params,
                    ))
                })
                .collect::<Result<_, _>>()
                .map_err(&fit_err)?;
            for (alpha_idx, r2) in per_alpha.iter().enumerate() {
                validation_scores
                    .slice_mut(s![.., nested_idx, alpha_idx])
                    .assign(r2);
            }
        }

        let (best_indices, best_alphas) = select_best_alphas(&validation_scores, &path);
        fold_alphas.row_mut(outer_idx).assign(&best_alphas);

        // Refit on the full outer-training stack at the selected strengths,
        // voxels sharing an alpha batched into a single call.
        let x_full = stack_runs(subject.design_runs, &fold.train);
        let y_full = stack_runs(&subject.fmri_runs, &fold.train);
        let mut groups: Vec<(usize, Vec<usize>)> = best_indices
            .iter()
            .enumerate()
            .map(|(voxel, &alpha_idx)| (alpha_idx, voxel))
            .into_group_map()
            .into_iter()
            .collect();
        groups.sort_by_key(|(alpha_idx, _)| *alpha_idx);
        let group_coefs: Vec<(Vec<usize>, Array2<f64>)> = groups
            .par_iter()
            .map(|(alpha_idx, voxels)| -> Result<_, FitError> {
                let y_sel = y_full.select(Axis(1), voxels);
                let fitted = Ridge {
                    alpha: path[*alpha_idx],
                }
                .fit(x_full.view(), y_sel.view())?;
                Ok((voxels.clone(), fitted.coef))
            })
            .collect::<Result<_, _>>()
            .map_err(&fit_err)?;

        let mut coef = Array2::zeros((nb_features, nb_voxels));
        for (voxels, group_coef) in &group_coefs {
            for (j, &voxel) in voxels.iter().enumerate() {
                coef.column_mut(voxel).assign(&group_coef.column(j));
            }
        }
        let fitted = FittedLinearModel { coef };

        let x_test = &subject.design_runs[fold.held_out];
        let y_test = &subject.fmri_runs[fold.held_out];
        let predictions = fitted.predict(x_test.view());
        let r2 = r2_clamped(y_test.view(), predictions.view(), params);
        let pearson = pearson_per_voxel(y_test.view(), predictions.view());

        if let Some(logger) = logger.as_deref_mut() {
            for voxel in 0..nb_voxels {
                logger.voxel(
                    subject.subject,
                    voxel,
                    fold_alphas[[outer_idx, voxel]],
                    r2[voxel],
                )?;
            }
        }
        fold_scores.row_mut(outer_idx).assign(&r2);
        fold_pearson.row_mut(outer_idx).assign(&pearson);
        fold_models.push(FoldModel {
            fitted,
            held_out: fold.held_out,
            alpha: None,
        });
    }

    let alphas = fold_alphas.mean_axis(Axis(0)).expect("at least two folds");
    let r2_test = fold_scores.mean_axis(Axis(0)).expect("at least two folds");
    let pearson_test = fold_pearson.mean_axis(Axis(0)).expect("at least two folds");
    Ok(PerVoxelOutcome {
        fold_alphas,
        fold_scores,
        alphas,
        r2_test,
        pearson_test,
        fold_models,
    })
}

/// Per-voxel significance thresholds from row-shuffle null distributions,
/// pooled across the outer folds' held-out runs. Reuses the fold models; no
/// refitting. Thresholds are reproducible for a fixed permutation seed.
pub fn significance_thresholds(
    fold_models: &[FoldModel],
    subject: &SubjectData,
    params: &AnalysisParams,
) -> Result<Array1<f64>, AnalysisError> {
    if params.nb_permutations == 0 {
        return Err(AnalysisError::NoPermutationsConfigured);
    }
    let mut pooled = Vec::with_capacity(fold_models.len());
    for (fold_idx, fold_model) in fold_models.iter().enumerate() {
        let x_test = &subject.design_runs[fold_model.held_out];
        let y_test = &subject.fmri_runs[fold_model.held_out];
        let predictions = fold_model.fitted.predict(x_test.view());
        let shufflings = generate_shufflings(
            y_test.nrows(),
            params.nb_permutations,
            params.permutation_seed.wrapping_add(fold_idx as u64),
        );
        pooled.push(null_scores(
            y_test.view(),
            predictions.view(),
            &shufflings,
            params,
        ));
    }
    let views: Vec<_> = pooled.iter().map(|a| a.view()).collect();
    let pooled = concatenate(Axis(0), &views).expect("per-fold null scores share a voxel count");
    Ok(percentile_threshold(pooled.view(), params.alpha_percentile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    #[test]
    fn selection_uses_the_mean_across_nested_folds_not_the_per_fold_max() {
        // Voxel 0: alpha 1 wins on average even though alpha 0 peaks in one
        // fold. Shape [voxels=1, nested_folds=2, alphas=2].
        let mut scores = Array3::zeros((1, 2, 2));
        scores[[0, 0, 0]] = 0.9; // alpha 0: 0.9 then 0.0 -> mean 0.45
        scores[[0, 1, 0]] = 0.0;
        scores[[0, 0, 1]] = 0.5; // alpha 1: 0.5 then 0.5 -> mean 0.50
        scores[[0, 1, 1]] = 0.5;
        let (indices, alphas) = select_best_alphas(&scores, &[0.01, 0.1]);
        assert_eq!(indices, vec![1]);
        assert_abs_diff_eq!(alphas[0], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn selection_tie_breaks_to_the_first_path_entry() {
        let scores = Array3::from_elem((3, 2, 4), 0.25);
        let (indices, alphas) = select_best_alphas(&scores, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(indices, vec![0, 0, 0]);
        assert!(alphas.iter().all(|&a| a == 1.0));
    }

    #[test]
    fn selection_is_deterministic() {
        let mut scores = Array3::zeros((2, 3, 3));
        scores[[0, 0, 2]] = 0.4;
        scores[[1, 1, 0]] = 0.2;
        let first = select_best_alphas(&scores, &[0.1, 0.2, 0.3]);
        let second = select_best_alphas(&scores, &[0.1, 0.2, 0.3]);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn ridge_cv_strategy_declares_its_fold_map_requirement() {
        assert!(!WholeBrainModel::Glm.needs_fold_map());
        assert!(
            WholeBrainModel::RidgeCv {
                alphas: vec![0.1]
            }
            .needs_fold_map()
        );
    }
}
