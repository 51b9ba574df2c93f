//! # Append-Only Fold Log
//!
//! One CSV record per fold event, mirroring the study's shared log format:
//! whole-brain folds record the R2 summary statistics across voxels, and
//! per-voxel folds record `(subject, voxel, alpha, r2)`. Each subject gets
//! its own log file, so parallel subjects never contend for a writer.

use crate::score::ScoreSummary;
use std::fs::OpenOptions;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("could not open fold log '{path}': {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("could not append to fold log: {0}")]
    Write(#[from] csv::Error),
}

/// Appending CSV writer for fold records.
pub struct FoldLogger {
    writer: csv::Writer<std::fs::File>,
}

impl FoldLogger {
    /// Opens (or creates) the log in append mode.
    pub fn append_to(path: &Path) -> Result<Self, LogError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LogError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file),
        })
    }

    /// Records one whole-brain fold: summary statistics across all voxels.
    pub fn whole_brain(&mut self, subject: &str, summary: &ScoreSummary) -> Result<(), LogError> {
        self.writer.write_record([
            subject,
            "whole brain",
            &summary.mean.to_string(),
            &summary.std.to_string(),
            &summary.min.to_string(),
            &summary.max.to_string(),
        ])?;
        self.writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    /// Records one per-voxel fold result.
    pub fn voxel(&mut self, subject: &str, voxel: usize, alpha: f64, r2: f64) -> Result<(), LogError> {
        self.writer.write_record([
            subject,
            &voxel.to_string(),
            &alpha.to_string(),
            &r2.to_string(),
        ])?;
        self.writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn log_accumulates_records_across_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("folds.log");

        {
            let mut logger = FoldLogger::append_to(&path).unwrap();
            let summary = ScoreSummary::from_scores(&array![0.1, 0.1]);
            logger.whole_brain("sub-001", &summary).unwrap();
        }
        {
            let mut logger = FoldLogger::append_to(&path).unwrap();
            logger.voxel("sub-001", 42, 0.01, 0.17).unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "sub-001,whole brain,0.1,0,0.1,0.1");
        assert_eq!(lines[1], "sub-001,42,0.01,0.17");
    }
}
