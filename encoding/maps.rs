//! # Statistic Map Writer
//!
//! Persists per-subject, per-voxel statistic vectors (aggregated R2,
//! selected alphas, significance thresholds) as tab-separated files. The 3-D
//! spatial reconstruction and rendering of these vectors belong to the
//! external masker/plotting collaborators; this crate only guarantees that
//! a map file is either complete or absent. Values are fully formatted in
//! memory, written to a temporary file in the destination directory, then
//! renamed into place.

use ndarray::ArrayView1;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes one statistic map as `<stem>.tsv` under `dir`, atomically.
/// Returns the final path.
pub fn write_statistic_map(
    dir: &Path,
    stem: &str,
    values: ArrayView1<f64>,
) -> io::Result<PathBuf> {
    let final_path = dir.join(format!("{stem}.tsv"));
    let tmp_path = dir.join(format!("{stem}.tsv.tmp"));

    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for value in values.iter() {
            writeln!(writer, "{value}")?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    log::info!(
        "wrote {} values to {}",
        values.len(),
        final_path.display()
    );
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn map_is_written_one_value_per_line() {
        let dir = TempDir::new().unwrap();
        let values = array![0.1, 0.0, 0.25];
        let path =
            write_statistic_map(dir.path(), "ridge-indiv_en_lstm_r2_test_sub-057", values.view())
                .unwrap();
        assert_eq!(
            path.file_name().unwrap(),
            "ridge-indiv_en_lstm_r2_test_sub-057.tsv"
        );
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "0.1\n0\n0.25\n");
    }

    #[test]
    fn no_temporary_file_survives_a_successful_write() {
        let dir = TempDir::new().unwrap();
        let values = array![1.0];
        write_statistic_map(dir.path(), "stat", values.view()).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let values = array![1.0];
        assert!(write_statistic_map(&missing, "stat", values.view()).is_err());
    }
}
