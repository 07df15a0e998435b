//! Applying a computed transform to another volume.
//!
//! The resampling tool names its own output (`result.<ResultImageFormat>`),
//! so the written volume is discovered afterwards with a glob.

use glob::{glob, Pattern};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{require_exists, Result, SegError};
use crate::tools::{run_checked, Invocation, ToolRunner};

/// Resample `input` through `parameters` into `output_dir`.
///
/// Scalar images and label maps go through the same call; a label-safe
/// parameter file keeps label values intact.
pub fn apply_transform(
    runner: &dyn ToolRunner,
    program: &str,
    input: &Path,
    parameters: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    require_exists("Input image", input)?;
    require_exists("Transform file", parameters)?;
    fs::create_dir_all(output_dir)?;
    // a result left from an earlier run must not pass for this one
    for stale in find_results(output_dir)? {
        fs::remove_file(stale)?;
    }

    info!(
        "Applying {} to {}",
        parameters.display(),
        input.display()
    );
    let inv = Invocation::new(program)
        .path_arg("-in", input)
        .path_arg("-out", output_dir)
        .path_arg("-tp", parameters);
    run_checked(runner, &inv)?;
    result_volume(program, output_dir)?;
    Ok(output_dir.to_path_buf())
}

/// The volume the resampling tool wrote into `output_dir`.
pub fn result_volume(program: &str, output_dir: &Path) -> Result<PathBuf> {
    let results = find_results(output_dir)?;
    match results.as_slice() {
        [single] => {
            debug!("Resampled volume: {}", single.display());
            Ok(single.clone())
        }
        [] => Err(SegError::missing_output(program, output_dir.join("result.*"))),
        many => Err(SegError::format(format!(
            "expected one result volume in {}, found {}",
            output_dir.display(),
            many.len()
        ))),
    }
}

fn find_results(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/result.*",
        Pattern::escape(&dir.to_string_lossy())
    );
    let mut paths: Vec<PathBuf> = glob(&pattern)
        .map_err(|e| SegError::format(e.to_string()))?
        .filter_map(std::result::Result::ok)
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}
