//! # Linear Estimators
//!
//! The two estimators behind every analysis: ordinary least squares (the GLM
//! mode) and closed-form ridge regression for a single regularization
//! strength. Both fit one independent linear model per voxel, all voxels in
//! a single call: the targets are the columns of `Y`, and the solve is
//! shared across them.
//!
//! Ridge solves the normal equations `(XᵀX + αI) B = XᵀY` through a Cholesky
//! factorization of the penalized Gram matrix. A Gram matrix that is not
//! positive definite is a fatal [`FitError`] for the fold; the drivers never
//! paper over a singular system with a degenerate score.

use ndarray::{Array2, ArrayView2};
use ndarray_linalg::{InverseC, LeastSquaresSvd};
use thiserror::Error;

/// Errors raised by the linear solvers.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("design matrix has {x_rows} rows but the signal has {y_rows}")]
    RowMismatch { x_rows: usize, y_rows: usize },
    #[error(
        "the penalized Gram matrix is singular at alpha={alpha}; the fold cannot be fit: {source}"
    )]
    SingularSystem {
        alpha: f64,
        source: ndarray_linalg::error::LinalgError,
    },
    #[error("least-squares solve failed: {0}")]
    LeastSquares(ndarray_linalg::error::LinalgError),
}

/// Coefficients of a fitted multi-target linear model.
/// Shape: `[nb_features, nb_voxels]`.
#[derive(Debug, Clone)]
pub struct FittedLinearModel {
    pub coef: Array2<f64>,
}

impl FittedLinearModel {
    /// Predicted signal for a held-out partition: `X · B`.
    /// Shape: `[nb_timepoints, nb_voxels]`.
    pub fn predict(&self, x: ArrayView2<f64>) -> Array2<f64> {
        x.dot(&self.coef)
    }
}

/// The uniform fitting contract shared by all estimators. Whether an
/// estimator additionally needs run-level fold grouping is a property of the
/// model *strategy* (see [`crate::analysis::WholeBrainModel`]), not of the
/// concrete type.
pub trait Estimator {
    fn fit(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<FittedLinearModel, FitError>;
}

/// Ordinary least squares via SVD, tolerant of rank deficiency.
#[derive(Debug, Clone, Copy)]
pub struct Glm;

impl Estimator for Glm {
    fn fit(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<FittedLinearModel, FitError> {
        check_rows(x, y)?;
        let result = x.least_squares(&y).map_err(FitError::LeastSquares)?;
        Ok(FittedLinearModel {
            coef: result.solution,
        })
    }
}

/// Closed-form ridge regression at a fixed strength. `alpha == 0` degrades
/// to the SVD least-squares path rather than a possibly singular Gram solve.
#[derive(Debug, Clone, Copy)]
pub struct Ridge {
    pub alpha: f64,
}

impl Estimator for Ridge {
    fn fit(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<FittedLinearModel, FitError> {
        check_rows(x, y)?;
        if self.alpha == 0.0 {
            return Glm.fit(x, y);
        }
        let mut gram = x.t().dot(&x);
        for i in 0..gram.nrows() {
            gram[[i, i]] += self.alpha;
        }
        let inv = gram.invc().map_err(|source| FitError::SingularSystem {
            alpha: self.alpha,
            source,
        })?;
        let xty = x.t().dot(&y);
        Ok(FittedLinearModel {
            coef: inv.dot(&xty),
        })
    }
}

fn check_rows(x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<(), FitError> {
    if x.nrows() != y.nrows() {
        return Err(FitError::RowMismatch {
            x_rows: x.nrows(),
            y_rows: y.nrows(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn glm_recovers_exact_linear_coefficients() {
        // y = 2*x0 - x1 + 3 (bias column appended).
        let x = array![
            [1.0, 0.0, 1.0],
            [0.0, 1.0, 1.0],
            [2.0, 1.0, 1.0],
            [1.0, 3.0, 1.0],
            [4.0, 2.0, 1.0],
        ];
        let coef_true = array![[2.0], [-1.0], [3.0]];
        let y = x.dot(&coef_true);

        let fitted = Glm.fit(x.view(), y.view()).unwrap();
        for (a, b) in fitted.coef.iter().zip(coef_true.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
        let pred = fitted.predict(x.view());
        for (a, b) in pred.iter().zip(y.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn ridge_fits_all_voxels_in_one_call() {
        let x = array![
            [1.0, 1.0],
            [2.0, 1.0],
            [3.0, 1.0],
            [4.0, 1.0],
            [5.0, 1.0],
        ];
        // Two voxels with different slopes.
        let y = array![
            [1.0, -2.0],
            [2.0, -4.0],
            [3.0, -6.0],
            [4.0, -8.0],
            [5.0, -10.0],
        ];
        let fitted = Ridge { alpha: 1e-6 }.fit(x.view(), y.view()).unwrap();
        assert_eq!(fitted.coef.shape(), &[2, 2]);
        assert_abs_diff_eq!(fitted.coef[[0, 0]], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(fitted.coef[[0, 1]], -2.0, epsilon = 1e-4);
    }

    #[test]
    fn larger_alpha_shrinks_coefficients() {
        let x = array![[1.0], [2.0], [3.0], [4.0]];
        let y = array![[2.0], [4.0], [6.0], [8.0]];
        let small = Ridge { alpha: 1e-3 }.fit(x.view(), y.view()).unwrap();
        let large = Ridge { alpha: 1e3 }.fit(x.view(), y.view()).unwrap();
        assert!(large.coef[[0, 0]].abs() < small.coef[[0, 0]].abs());
    }

    #[test]
    fn zero_alpha_falls_back_to_least_squares() {
        let x = array![[1.0, 1.0], [2.0, 1.0], [3.0, 1.0]];
        let y = array![[3.0], [5.0], [7.0]];
        let fitted = Ridge { alpha: 0.0 }.fit(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(fitted.coef[[0, 0]], 2.0, epsilon = 1e-8);
        assert_abs_diff_eq!(fitted.coef[[1, 0]], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn row_mismatch_is_rejected() {
        let x = Array2::<f64>::zeros((4, 2));
        let y = Array2::<f64>::zeros((5, 1));
        assert!(matches!(
            Ridge { alpha: 0.1 }.fit(x.view(), y.view()),
            Err(FitError::RowMismatch {
                x_rows: 4,
                y_rows: 5
            })
        ));
    }

    #[test]
    fn penalized_gram_of_zero_design_is_still_positive_definite() {
        // XtX is all zeros, but the alpha ridge keeps the system solvable
        // and the coefficients collapse to zero.
        let x = Array2::<f64>::zeros((4, 2));
        let y = Array2::<f64>::zeros((4, 1));
        let fitted = Ridge { alpha: 1e-6 }.fit(x.view(), y.view()).unwrap();
        assert!(fitted.coef.iter().all(|&c| c == 0.0));
    }
}
