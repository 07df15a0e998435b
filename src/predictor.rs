//! Hand-off to the segmentation predictor.
//!
//! The predictor reads `<case_id>_0000`/`<case_id>_0001` channel files from
//! an input directory and writes `<case_id><file_ending>` to an output
//! directory. Its model directories come from [`PredictorConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::common::Modality;
use crate::config::{ModelSelection, PredictorConfig};
use crate::error::{require_exists, Result};
use crate::tools::{clear_output, expect_output, run_checked, Invocation, ToolRunner};

/// Name of the input file holding `modality` for `case_id`.
pub fn channel_file(case_id: &str, modality: Modality, file_ending: &str) -> String {
    format!("{}_{:04}{}", case_id, modality.channel(), file_ending)
}

/// Run the predictor on `input_dir`; returns the predicted label volume.
pub fn predict(
    runner: &dyn ToolRunner,
    program: &str,
    config: &PredictorConfig,
    model: &ModelSelection,
    input_dir: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    for modality in [Modality::T1, Modality::T2] {
        let channel = input_dir.join(channel_file(&model.case_id, modality, &config.file_ending));
        require_exists("Predictor input", &channel)?;
    }
    fs::create_dir_all(output_dir)?;
    let prediction = output_dir.join(format!("{}{}", model.case_id, config.file_ending));
    clear_output(&prediction)?;

    info!(
        "Predicting {} with dataset {} ({}, fold {})",
        model.case_id, model.dataset, model.configuration, model.fold
    );
    let mut inv = Invocation::new(program)
        .path_arg("-i", input_dir)
        .path_arg("-o", output_dir)
        .arg("-d")
        .arg(&model.dataset)
        .arg("-c")
        .arg(&model.configuration)
        .arg("-f")
        .arg(&model.fold);
    if config.save_probabilities {
        inv = inv.arg("--save_probabilities");
    }
    inv = inv.arg("-tr").arg(&model.trainer).arg("-p").arg(&model.plans);
    for (key, dir) in config.env() {
        inv = inv.env(key, dir.as_os_str());
    }

    run_checked(runner, &inv)?;
    expect_output(program, &prediction)?;
    Ok(prediction)
}
