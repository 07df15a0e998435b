use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{require_exists, Result};
use crate::tools::{clear_output, expect_output, run_checked, Invocation, ToolRunner};

/// Remove non-brain tissue from `input`, writing the result to `output`.
pub fn skull_strip(
    runner: &dyn ToolRunner,
    program: &str,
    input: &Path,
    output: &Path,
) -> Result<PathBuf> {
    require_exists("Input image", input)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    clear_output(output)?;
    info!("Skull-stripping {}", input.display());
    let inv = Invocation::new(program)
        .path_arg("-i", input)
        .path_arg("-o", output);
    run_checked(runner, &inv)?;
    expect_output(program, output)?;
    Ok(output.to_path_buf())
}
