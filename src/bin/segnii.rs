//! Commandline utility to segment deep brain structures from a T1/T2 pair.
//!
//! Runs either pipeline end to end and copies the label volumes to
//! `<results>/<subject>/`. External tools are looked up on `PATH` unless the
//! configuration file names them explicitly.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use segnii::preprocess::LandmarkNormalizer;
use segnii::tools::SystemRunner;
use segnii::{Method, Pipeline, PipelineConfig, Subject};

// use clap to create commandline interface
#[derive(Parser, Debug)]
#[command(author, about, version, long_about)]
struct Args {
    /// the T1-weighted input nifti file (.nii.gz)
    #[arg(long)]
    t1: PathBuf,

    /// the T2-weighted input nifti file (.nii.gz)
    #[arg(long)]
    t2: PathBuf,

    /// Which pipeline to run:
    ///     I  -> segment in MNI space and map the labels back,
    ///     II -> segment in native space.
    #[arg(short, long, value_parser = parse_method, default_value = "II")]
    method: Method,

    /// Subject name used for the scratch and results folders
    /// (defaults to the T1 file name).
    #[arg(short, long)]
    subject: Option<String>,

    /// TOML configuration file; anything it leaves out keeps its default.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Folder holding templates/ and normalization_landmarks/.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Folder holding the predictor's raw/, preprocessed/ and models/.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Where intermediate files are written.
    #[arg(long)]
    scratch: Option<PathBuf>,

    /// Where the final label volumes are copied.
    #[arg(short, long)]
    results: Option<PathBuf>,

    /// Remove the subject's scratch folder after a successful run.
    #[arg(long)]
    clean_scratch: bool,

    /// Log every tool invocation.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_method(val: &str) -> std::result::Result<Method, String> {
    Method::from_tag(val).ok_or_else(|| format!("unknown method '{}', expected I or II", val))
}

/// `RUST_LOG` directives (default `info`); `--verbose` raises them to debug.
fn log_filter(env: Option<&str>, verbose: bool) -> EnvFilter {
    let filter = env
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    if verbose {
        filter.add_directive(LevelFilter::DEBUG.into())
    } else {
        filter
    }
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => {
            let data_dir = args.data_dir.clone().unwrap_or_else(|| PathBuf::from("data"));
            let model_dir = args.model_dir.clone().unwrap_or_else(|| PathBuf::from("nnunet"));
            PipelineConfig::with_roots(&data_dir, &model_dir)
        }
    };
    if let Some(scratch) = &args.scratch {
        config.scratch_dir = scratch.clone();
    }
    if let Some(results) = &args.results {
        config.results_dir = results.clone();
    }
    if args.clean_scratch {
        config.keep_scratch = false;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(env.as_deref(), args.verbose))
        .init();

    let config = load_config(&args)?;
    let mut subject = Subject::new(&args.t1, &args.t2);
    if let Some(id) = &args.subject {
        subject = subject.with_id(id);
    }

    let runner = SystemRunner;
    let normalizer = LandmarkNormalizer;
    let pipeline = Pipeline::new(&config, &runner, &normalizer);
    let outputs = pipeline
        .run(&subject, args.method)
        .with_context(|| format!("segmenting {} with {}", subject.id, args.method))?;

    if let Some(atlas) = &outputs.atlas {
        info!("Atlas-space labels: {}", atlas.display());
    }
    info!("Native-space labels: {}", outputs.native.display());
    Ok(())
}
