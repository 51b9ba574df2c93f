//! # Data Loading and Validation
//!
//! Entry point for user-provided data. Two tabular formats are read:
//!
//! - Design matrices: comma-separated, first row header, one row per
//!   timepoint, one column per feature. Columns are optionally standardized
//!   and a constant bias column of 1.0 is appended, matching the convention
//!   of the upstream feature-extraction stage.
//! - fMRI voxel matrices: tab-separated, no header, one row per timepoint,
//!   one column per voxel. These are the output of the external masker
//!   (3-D/4-D imaging I/O is not this crate's concern).
//!
//! Failures are assumed to be user-input errors; [`DataError`] is written to
//! give actionable feedback with file and row context. Shape invariants
//! (run rows match design rows, voxel count identical across runs) are
//! checked before any fitting starts.

use crate::config::AnalysisParams;
use ndarray::{concatenate, Array2, Axis};
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for loading and cross-run validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("could not open '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse '{path}': {source}")]
    Csv { path: String, source: csv::Error },
    #[error("'{path}' row {row}: cell '{cell}' is not numeric")]
    NonNumericCell {
        path: String,
        row: usize,
        cell: String,
    },
    #[error("'{path}' row {row}: non-finite value (NaN or infinity)")]
    NonFiniteValue { path: String, row: usize },
    #[error("'{path}' row {row}: expected {expected} columns, found {found}")]
    RaggedRow {
        path: String,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("'{path}' contains no data rows")]
    EmptyFile { path: String },
    #[error("subject {subject}: {fmri_runs} fMRI runs but {design_runs} design matrices")]
    RunCountMismatch {
        subject: String,
        fmri_runs: usize,
        design_runs: usize,
    },
    #[error(
        "subject {subject}, run {run}: {fmri_rows} fMRI timepoints but {design_rows} design rows"
    )]
    RowCountMismatch {
        subject: String,
        run: usize,
        fmri_rows: usize,
        design_rows: usize,
    },
    #[error(
        "subject {subject}, run {run}: {found} voxels but run 0 has {expected}; the voxel count must be identical across all runs of a subject"
    )]
    VoxelCountMismatch {
        subject: String,
        run: usize,
        expected: usize,
        found: usize,
    },
    #[error("subject {subject}: needs at least 2 runs, found {found}")]
    NotEnoughRuns { subject: String, found: usize },
}

/// Reads a delimited all-numeric file into a row-major matrix.
fn read_numeric_matrix(
    path: &Path,
    delimiter: u8,
    has_headers: bool,
) -> Result<Array2<f64>, DataError> {
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| {
            if source.is_io_error() {
                DataError::Io {
                    path: display.clone(),
                    source: std::io::Error::other(source),
                }
            } else {
                DataError::Csv {
                    path: display.clone(),
                    source,
                }
            }
        })?;

    let mut values: Vec<f64> = Vec::new();
    let mut nb_cols = 0usize;
    let mut nb_rows = 0usize;
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|source| DataError::Csv {
            path: display.clone(),
            source,
        })?;
        if nb_rows == 0 {
            nb_cols = record.len();
        } else if record.len() != nb_cols {
            return Err(DataError::RaggedRow {
                path: display,
                row: i + 1,
                expected: nb_cols,
                found: record.len(),
            });
        }
        for cell in record.iter() {
            let value: f64 = cell.parse().map_err(|_| DataError::NonNumericCell {
                path: display.clone(),
                row: i + 1,
                cell: cell.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValue {
                    path: display.clone(),
                    row: i + 1,
                });
            }
            values.push(value);
        }
        nb_rows += 1;
    }
    if nb_rows == 0 {
        return Err(DataError::EmptyFile { path: display });
    }
    Ok(Array2::from_shape_vec((nb_rows, nb_cols), values)
        .expect("row/column bookkeeping matches the collected values"))
}

/// Standardizes each column in place: mean removal and/or scaling to unit
/// variance, per the configuration flags. Constant columns are left centered
/// but unscaled (their variance is zero).
pub fn standardize_columns(matrix: &mut Array2<f64>, with_mean: bool, with_std: bool) {
    let n = matrix.nrows() as f64;
    if n == 0.0 {
        return;
    }
    for mut column in matrix.axis_iter_mut(Axis(1)) {
        let mean = column.sum() / n;
        if with_mean {
            column.mapv_inplace(|v| v - mean);
        }
        if with_std {
            let centered_sq: f64 = column.iter().map(|&v| {
                let c = if with_mean { v } else { v - mean };
                c * c
            }).sum();
            let std = (centered_sq / n).sqrt();
            if std > 0.0 {
                column.mapv_inplace(|v| v / std);
            }
        }
    }
}

/// Appends a constant column of 1.0, the bias term of the encoding model.
pub fn append_bias_column(matrix: &Array2<f64>) -> Array2<f64> {
    let bias = Array2::ones((matrix.nrows(), 1));
    concatenate(Axis(1), &[matrix.view(), bias.view()])
        .expect("bias column has the same row count by construction")
}

/// Loads one design-matrix CSV: header row, numeric features, then
/// standardization and the appended bias column.
pub fn load_design_matrix(path: &Path, params: &AnalysisParams) -> Result<Array2<f64>, DataError> {
    let mut matrix = read_numeric_matrix(path, b',', true)?;
    standardize_columns(&mut matrix, params.scaling_mean, params.scaling_var);
    Ok(append_bias_column(&matrix))
}

/// Loads one masked fMRI run: tab-separated voxel matrix, no header.
pub fn load_voxel_matrix(path: &Path) -> Result<Array2<f64>, DataError> {
    read_numeric_matrix(path, b'\t', false)
}

/// One subject's validated inputs: the per-run voxel matrices plus the
/// shared per-run design matrices. Both are immutable for the whole
/// analysis; derived result arrays are owned by the drivers.
#[derive(Debug)]
pub struct SubjectData<'a> {
    pub subject: &'a str,
    pub fmri_runs: Vec<Array2<f64>>,
    pub design_runs: &'a [Array2<f64>],
}

impl<'a> SubjectData<'a> {
    /// Builds the container and checks every shape invariant up front, so
    /// the cross-validation loops never see mismatched arrays.
    pub fn new(
        subject: &'a str,
        fmri_runs: Vec<Array2<f64>>,
        design_runs: &'a [Array2<f64>],
    ) -> Result<Self, DataError> {
        if fmri_runs.len() != design_runs.len() {
            return Err(DataError::RunCountMismatch {
                subject: subject.to_string(),
                fmri_runs: fmri_runs.len(),
                design_runs: design_runs.len(),
            });
        }
        if fmri_runs.len() < 2 {
            return Err(DataError::NotEnoughRuns {
                subject: subject.to_string(),
                found: fmri_runs.len(),
            });
        }
        let nb_voxels = fmri_runs[0].ncols();
        for (run, (fmri, design)) in fmri_runs.iter().zip(design_runs.iter()).enumerate() {
            if fmri.nrows() != design.nrows() {
                return Err(DataError::RowCountMismatch {
                    subject: subject.to_string(),
                    run,
                    fmri_rows: fmri.nrows(),
                    design_rows: design.nrows(),
                });
            }
            if fmri.ncols() != nb_voxels {
                return Err(DataError::VoxelCountMismatch {
                    subject: subject.to_string(),
                    run,
                    expected: nb_voxels,
                    found: fmri.ncols(),
                });
            }
        }
        Ok(Self {
            subject,
            fmri_runs,
            design_runs,
        })
    }

    pub fn nb_runs(&self) -> usize {
        self.fmri_runs.len()
    }

    pub fn nb_voxels(&self) -> usize {
        self.fmri_runs[0].ncols()
    }

    /// Timepoint counts per run, the input of the fold index map.
    pub fn run_lengths(&self) -> Vec<usize> {
        self.fmri_runs.iter().map(|run| run.nrows()).collect()
    }
}

/// Vertically stacks the selected runs, in the given order.
pub fn stack_runs(runs: &[Array2<f64>], included: &[usize]) -> Array2<f64> {
    let views: Vec<_> = included.iter().map(|&i| runs[i].view()).collect();
    concatenate(Axis(0), &views).expect("runs of one subject share a column count")
}
