//! # Run-Aware Cross-Validation Splitting
//!
//! fMRI acquisitions arrive as a handful of contiguous runs, and every
//! resampling scheme in this crate must respect run boundaries: a timepoint
//! never ends up in both a training and a held-out partition of the same
//! fold. Two pieces live here:
//!
//! - [`leave_one_out`], enumerating the leave-one-run-out partitions used by
//!   both the outer test loop and the nested validation loop;
//! - [`build_fold_index_map`], the pure function that records which
//!   contiguous row range of a vertically stacked multi-run matrix belongs
//!   to which run. Row ranges shift depending on which runs are included, so
//!   the map is recomputed after every concatenation.

use std::ops::Range;
use thiserror::Error;

/// Index of a run within a subject's ordered run list.
pub type RunId = usize;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SplitError {
    #[error("leave-one-out needs at least 2 runs, got {found}")]
    NotEnoughRuns { found: usize },
    #[error("run {run} is out of bounds for a subject with {nb_runs} runs")]
    RunOutOfBounds { run: RunId, nb_runs: usize },
    #[error("run {run} has no timepoints")]
    EmptyRun { run: RunId },
}

/// One train/held-out partition over a set of runs. Indices refer to
/// positions in the run list the split was generated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<RunId>,
    pub held_out: RunId,
}

/// Enumerates the `nb_runs` leave-one-run-out partitions, in held-out-run
/// order. Every run is held out exactly once; the train set is the remaining
/// runs in their original order.
pub fn leave_one_out(nb_runs: usize) -> Result<Vec<Fold>, SplitError> {
    if nb_runs < 2 {
        return Err(SplitError::NotEnoughRuns { found: nb_runs });
    }
    Ok((0..nb_runs)
        .map(|held_out| Fold {
            train: (0..nb_runs).filter(|&r| r != held_out).collect(),
            held_out,
        })
        .collect())
}

/// Maps each included run to its contiguous row range `[start, end)` within
/// the matrix formed by stacking the included runs vertically, in inclusion
/// order. The ranges partition `[0, total_rows)` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldIndexMap {
    ranges: Vec<(RunId, Range<usize>)>,
}

impl FoldIndexMap {
    /// Row range of one run in the stacked matrix, if the run was included.
    pub fn range_of(&self, run: RunId) -> Option<Range<usize>> {
        self.ranges
            .iter()
            .find(|(r, _)| *r == run)
            .map(|(_, range)| range.clone())
    }

    /// `(run, row_range)` pairs in stacking order.
    pub fn iter(&self) -> impl Iterator<Item = (RunId, Range<usize>)> + '_ {
        self.ranges.iter().map(|(r, range)| (*r, range.clone()))
    }

    /// Number of included runs.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of rows covered by the map.
    pub fn total_rows(&self) -> usize {
        self.ranges.last().map_or(0, |(_, range)| range.end)
    }
}

/// Builds the [`FoldIndexMap`] for stacking `included_runs` (in the given
/// order) out of runs with the given lengths.
pub fn build_fold_index_map(
    run_lengths: &[usize],
    included_runs: &[RunId],
) -> Result<FoldIndexMap, SplitError> {
    let mut ranges = Vec::with_capacity(included_runs.len());
    let mut offset = 0;
    for &run in included_runs {
        let length = *run_lengths
            .get(run)
            .ok_or(SplitError::RunOutOfBounds {
                run,
                nb_runs: run_lengths.len(),
            })?;
        if length == 0 {
            return Err(SplitError::EmptyRun { run });
        }
        ranges.push((run, offset..offset + length));
        offset += length;
    }
    Ok(FoldIndexMap { ranges })
}
