//! Command-line orchestrator: resolves input files by the shared naming
//! convention, loads the design matrices once, then maps the analysis over
//! subjects in parallel. Subjects are fully independent; a failed subject is
//! reported and the others complete, with the exit status recording whether
//! any subject failed.

use clap::Parser;
use ndarray::Array2;
use rayon::prelude::*;
use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use voxelfit::analysis::{
    per_voxel_analysis, significance_thresholds, whole_brain_analysis, WholeBrainModel,
};
use voxelfit::config::{AnalysisParams, OutputNaming};
use voxelfit::data::{load_design_matrix, load_voxel_matrix, SubjectData};
use voxelfit::logbook::FoldLogger;
use voxelfit::maps::write_statistic_map;

type SubjectError = Box<dyn Error + Send + Sync>;

#[derive(Parser, Debug)]
#[clap(
    name = "voxelfit",
    version,
    about = "Generate voxel-wise cross-validated R2 maps from design matrices and fMRI data."
)]
struct Args {
    /// Language of the stimulus / model features.
    #[clap(long, default_value = "en")]
    language: String,

    /// Name of the model that produced the design-matrix features.
    #[clap(long)]
    model_name: String,

    /// Subjects to analyze, e.g. sub-057 sub-058.
    #[clap(long, num_args = 1.., required = true)]
    subjects: Vec<String>,

    /// Directory holding the design-matrix CSV files.
    #[clap(long)]
    design_dir: PathBuf,

    /// Directory holding the masked fMRI voxel matrices.
    #[clap(long)]
    fmri_dir: PathBuf,

    /// Directory for the output maps and fold logs.
    #[clap(long)]
    output_dir: PathBuf,

    /// Optional TOML parameters file; defaults apply when omitted.
    #[clap(long)]
    parameters: Option<PathBuf>,

    /// Select a regularization strength per voxel (nested cross-validation)
    /// instead of one global model per fold.
    #[clap(long)]
    voxel_wise: bool,

    /// Whole-brain mode only: plain least squares instead of the
    /// cross-validated ridge.
    #[clap(long)]
    glm: bool,

    /// Process subjects one at a time instead of in parallel.
    #[clap(long)]
    sequential: bool,
}

fn main() {
    env_logger::init();
    let start_time = Instant::now();
    let args = Args::parse();

    let params = match &args.parameters {
        Some(path) => match AnalysisParams::from_toml_file(path) {
            Ok(params) => params,
            Err(e) => {
                eprintln!("Error loading parameters: {e}");
                process::exit(1);
            }
        },
        None => AnalysisParams::default(),
    };

    if let Err(e) = fs::create_dir_all(&args.output_dir) {
        eprintln!(
            "Error creating output directory '{}': {e}",
            args.output_dir.display()
        );
        process::exit(1);
    }

    let naming = OutputNaming {
        data_type: if args.glm && !args.voxel_wise {
            "glm-indiv".to_string()
        } else {
            "ridge-indiv".to_string()
        },
        language: args.language.clone(),
        model_name: args.model_name.clone(),
    };

    // Design matrices are shared across subjects; load them once.
    let design_prefix = format!(
        "design-matrices_{}_{}_run",
        args.language, args.model_name
    );
    let design_runs = match load_all_design_matrices(&args.design_dir, &design_prefix, &params) {
        Ok(runs) => runs,
        Err(e) => {
            eprintln!("Error loading design matrices: {e}");
            process::exit(1);
        }
    };
    eprintln!(
        "> Loaded {} design matrices ({} features incl. bias).",
        design_runs.len(),
        design_runs.first().map_or(0, |m| m.ncols())
    );

    let run_one = |subject: &String| {
        let result = process_subject(subject, &args, &params, &naming, &design_runs);
        if let Err(e) = &result {
            log::error!("subject {subject} failed: {e}");
            eprintln!("Error processing subject {subject}: {e}");
        }
        (subject.clone(), result.is_ok())
    };

    let results: Vec<(String, bool)> = if args.sequential {
        args.subjects.iter().map(run_one).collect()
    } else {
        args.subjects.par_iter().map(run_one).collect()
    };

    let failed: Vec<&str> = results
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(subject, _)| subject.as_str())
        .collect();
    eprintln!(
        "\nProcessed {}/{} subjects in {:.2?}.",
        results.len() - failed.len(),
        results.len(),
        start_time.elapsed()
    );
    if !failed.is_empty() {
        eprintln!("Failed subjects: {}", failed.join(", "));
        process::exit(1);
    }
}

/// Lists the run files under `dir` whose names start with `prefix`, in
/// lexicographic run order (run numbers in these datasets are zero-padded).
fn discover_runs(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix))
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no files matching '{prefix}*' in '{}'", dir.display()),
        ));
    }
    Ok(files)
}

fn load_all_design_matrices(
    dir: &Path,
    prefix: &str,
    params: &AnalysisParams,
) -> Result<Vec<Array2<f64>>, SubjectError> {
    let mut runs = Vec::new();
    for path in discover_runs(dir, prefix)? {
        runs.push(load_design_matrix(&path, params)?);
    }
    Ok(runs)
}

fn process_subject(
    subject: &str,
    args: &Args,
    params: &AnalysisParams,
    naming: &OutputNaming,
    design_runs: &[Array2<f64>],
) -> Result<(), SubjectError> {
    let fmri_prefix = format!("fMRI_{}_{}_run", args.language, subject);
    let mut fmri_runs = Vec::new();
    for path in discover_runs(&args.fmri_dir, &fmri_prefix)? {
        fmri_runs.push(load_voxel_matrix(&path)?);
    }
    let data = SubjectData::new(subject, fmri_runs, design_runs)?;
    log::info!(
        "subject {subject}: {} runs, {} voxels",
        data.nb_runs(),
        data.nb_voxels()
    );

    let log_path = args.output_dir.join(format!("{subject}_folds.log"));
    let mut logger = FoldLogger::append_to(&log_path)?;

    let (r2_test, pearson_test, alphas, fold_models) = if args.voxel_wise {
        let outcome = per_voxel_analysis(&data, params, Some(&mut logger))?;
        (
            outcome.r2_test,
            outcome.pearson_test,
            Some(outcome.alphas),
            outcome.fold_models,
        )
    } else {
        let model = if args.glm {
            WholeBrainModel::Glm
        } else {
            WholeBrainModel::RidgeCv {
                alphas: params.regularization_path(),
            }
        };
        let outcome = whole_brain_analysis(&model, &data, params, Some(&mut logger))?;
        (
            outcome.r2_test,
            outcome.pearson_test,
            None,
            outcome.fold_models,
        )
    };

    write_statistic_map(
        &args.output_dir,
        &naming.map_stem("r2_test", subject),
        r2_test.view(),
    )?;
    write_statistic_map(
        &args.output_dir,
        &naming.map_stem("pearson_corr", subject),
        pearson_test.view(),
    )?;
    if let Some(alphas) = alphas {
        write_statistic_map(
            &args.output_dir,
            &naming.map_stem("alphas", subject),
            alphas.view(),
        )?;
    }
    if params.nb_permutations > 0 {
        let thresholds = significance_thresholds(&fold_models, &data, params)?;
        write_statistic_map(
            &args.output_dir,
            &naming.map_stem("significant_r2", subject),
            thresholds.view(),
        )?;
    }
    Ok(())
}
