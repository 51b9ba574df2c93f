//! # Analysis Configuration
//!
//! All tunable parameters of an encoding analysis live in explicit structs
//! that are passed by value into the core functions. There is no module-level
//! settings singleton: the caller constructs (or deserializes) an
//! [`AnalysisParams`] once and threads it through the pipeline.
//!
//! Parameters can be read from a TOML file; every field has a default so a
//! partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors produced while loading or validating a parameters file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read parameters file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse parameters file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("the regularization path is empty; at least one alpha is required")]
    EmptyAlphaPath,
    #[error("regularization strengths must be finite and non-negative, got {0}")]
    InvalidAlpha(f64),
    #[error("r2 clamp bounds must satisfy min < max, got min={min}, max={max}")]
    InvalidClampBounds { min: f64, max: f64 },
    #[error("alpha_percentile must lie in (0, 100), got {0}")]
    InvalidPercentile(f64),
}

/// Tunable parameters for one encoding analysis.
///
/// The regularization path defaults to the 30 log-spaced candidates in
/// `[1e-3, 1e-1]` used throughout the study; an explicit `alphas` list in the
/// parameters file overrides the log-spaced generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    /// Explicit regularization path. When empty, a log-spaced path is
    /// generated from the three fields below.
    pub alphas: Vec<f64>,
    /// Exponent of the smallest log-spaced candidate (base 10).
    pub alpha_log_start: f64,
    /// Exponent of the largest log-spaced candidate (base 10).
    pub alpha_log_stop: f64,
    /// Number of log-spaced candidates.
    pub alpha_count: usize,

    /// Raw R2 scores below this bound are clamped to 0.0.
    pub r2_min: f64,
    /// Raw R2 scores at or above this bound are clamped to 0.0 (zero-variance
    /// voxels produce spuriously perfect fits).
    pub r2_max: f64,

    /// Remove the per-column mean of each design matrix before fitting.
    pub scaling_mean: bool,
    /// Scale each design-matrix column to unit variance before fitting.
    pub scaling_var: bool,

    /// Number of row-shuffle permutations for the null distribution.
    /// Zero disables the permutation stage.
    pub nb_permutations: usize,
    /// Percentile of the null distribution used as significance threshold.
    pub alpha_percentile: f64,
    /// Seed for the permutation shuffles, so thresholds are reproducible.
    pub permutation_seed: u64,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            alphas: Vec::new(),
            alpha_log_start: -3.0,
            alpha_log_stop: -1.0,
            alpha_count: 30,
            r2_min: 0.0,
            r2_max: 0.99,
            scaling_mean: true,
            scaling_var: true,
            nb_permutations: 0,
            alpha_percentile: 95.0,
            permutation_seed: 1234,
        }
    }
}

impl AnalysisParams {
    /// Loads parameters from a TOML file and validates them.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let params: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        params.validate()?;
        Ok(params)
    }

    /// Checks the invariants the analysis drivers rely on. Called once at
    /// load time so the nested-fold loops never see an invalid path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let path = self.regularization_path();
        if path.is_empty() {
            return Err(ConfigError::EmptyAlphaPath);
        }
        for &alpha in &path {
            if !alpha.is_finite() || alpha < 0.0 {
                return Err(ConfigError::InvalidAlpha(alpha));
            }
        }
        if self.r2_min >= self.r2_max {
            return Err(ConfigError::InvalidClampBounds {
                min: self.r2_min,
                max: self.r2_max,
            });
        }
        if self.alpha_percentile <= 0.0 || self.alpha_percentile >= 100.0 {
            return Err(ConfigError::InvalidPercentile(self.alpha_percentile));
        }
        Ok(())
    }

    /// The ordered candidate regularization strengths: the explicit list if
    /// one was given, otherwise log-spaced between `10^alpha_log_start` and
    /// `10^alpha_log_stop`.
    pub fn regularization_path(&self) -> Vec<f64> {
        if !self.alphas.is_empty() {
            return self.alphas.clone();
        }
        log_space(self.alpha_log_start, self.alpha_log_stop, self.alpha_count)
    }
}

/// `count` points spaced evenly on a log10 scale between `10^start` and
/// `10^stop`, endpoints included.
pub fn log_space(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![10f64.powf(start)],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count)
                .map(|i| 10f64.powf(start + step * i as f64))
                .collect()
        }
    }
}

/// The `(data_type, language, model)` triple that drives the output naming
/// convention shared with the upstream feature-extraction stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputNaming {
    /// Analysis family, e.g. `ridge-indiv` or `glm-indiv`.
    pub data_type: String,
    /// Stimulus language, e.g. `en`.
    pub language: String,
    /// Name of the model that produced the design-matrix features.
    pub model_name: String,
}

impl OutputNaming {
    /// File stem for one per-subject statistic map, e.g.
    /// `ridge-indiv_en_lstm_r2_test_sub-057`.
    pub fn map_stem(&self, statistic: &str, subject: &str) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.data_type, self.language, self.model_name, statistic, subject
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn default_path_is_logspace_em3_em1() {
        let params = AnalysisParams::default();
        let path = params.regularization_path();
        assert_eq!(path.len(), 30);
        assert_abs_diff_eq!(path[0], 1e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(path[29], 1e-1, epsilon = 1e-12);
        assert!(path.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn explicit_alphas_override_logspace() {
        let params = AnalysisParams {
            alphas: vec![0.5, 1.0],
            ..Default::default()
        };
        assert_eq!(params.regularization_path(), vec![0.5, 1.0]);
    }

    #[test]
    fn empty_path_is_rejected() {
        let params = AnalysisParams {
            alpha_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::EmptyAlphaPath)
        ));
    }

    #[test]
    fn bad_percentile_is_rejected() {
        let params = AnalysisParams {
            alpha_percentile: 100.0,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::InvalidPercentile(_))
        ));
    }

    #[test]
    fn map_stem_follows_naming_convention() {
        let naming = OutputNaming {
            data_type: "ridge-indiv".into(),
            language: "en".into(),
            model_name: "lstm".into(),
        };
        assert_eq!(
            naming.map_stem("r2_test", "sub-057"),
            "ridge-indiv_en_lstm_r2_test_sub-057"
        );
    }

    #[test]
    fn toml_round_trip_with_partial_file() {
        let text = "nb_permutations = 200\nalphas = [0.1, 0.2]\n";
        let params: AnalysisParams = toml::from_str(text).unwrap();
        assert_eq!(params.nb_permutations, 200);
        assert_eq!(params.regularization_path(), vec![0.1, 0.2]);
        assert_abs_diff_eq!(params.r2_max, 0.99);
    }
}
