//! Driver for the external registration tool.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{require_exists, Result};
use crate::tools::{clear_output, expect_output, run_checked, Invocation, ToolRunner};

/// File the registration tool writes its computed transform to.
pub const TRANSFORM_PARAMETERS: &str = "TransformParameters.0.txt";

/// Path of the transform computed by a registration into `output_dir`.
pub fn transform_parameters(output_dir: &Path) -> PathBuf {
    output_dir.join(TRANSFORM_PARAMETERS)
}

/// Register `moving` onto `fixed` with the given parameter file.
///
/// With `initial_transform`, the computed transform is a correction applied
/// on top of that transform. Registering a volume to itself this way yields
/// the inverse of `initial_transform`. Returns `output_dir`, which holds
/// [`TRANSFORM_PARAMETERS`] and the resampled moving image afterwards.
pub fn register(
    runner: &dyn ToolRunner,
    program: &str,
    fixed: &Path,
    moving: &Path,
    output_dir: &Path,
    parameters: &Path,
    initial_transform: Option<&Path>,
) -> Result<PathBuf> {
    require_exists("Fixed image", fixed)?;
    require_exists("Moving image", moving)?;
    require_exists("Parameter file", parameters)?;
    if let Some(t0) = initial_transform {
        require_exists("Initial transform", t0)?;
    }
    fs::create_dir_all(output_dir)?;
    clear_output(&transform_parameters(output_dir))?;

    info!(
        "Registering {} onto {}",
        moving.display(),
        fixed.display()
    );
    let mut inv = Invocation::new(program)
        .path_arg("-f", fixed)
        .path_arg("-m", moving)
        .path_arg("-out", output_dir)
        .path_arg("-p", parameters);
    if let Some(t0) = initial_transform {
        inv = inv.path_arg("-t0", t0);
    }
    run_checked(runner, &inv)?;
    expect_output(program, &transform_parameters(output_dir))?;
    Ok(output_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SegError;
    use crate::tools::ToolOutput;
    use std::cell::RefCell;
    use tempfile::tempdir;

    /// Records invocations and writes the transform file like the real tool.
    #[derive(Default)]
    struct RecordingRunner {
        calls: RefCell<Vec<Invocation>>,
        exit_code: i32,
        /// Exit cleanly without writing anything.
        silent: bool,
    }

    impl ToolRunner for RecordingRunner {
        fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
            self.calls.borrow_mut().push(invocation.clone());
            if self.exit_code != 0 {
                return Ok(ToolOutput {
                    code: Some(self.exit_code),
                    success: false,
                    stderr: "itk::ExceptionObject thrown\n".to_string(),
                    ..ToolOutput::default()
                });
            }
            if self.silent {
                return Ok(ToolOutput {
                    code: Some(0),
                    success: true,
                    ..ToolOutput::default()
                });
            }
            let out = PathBuf::from(invocation.flag_value("-out").unwrap());
            fs::write(out.join(TRANSFORM_PARAMETERS), "(Transform \"AffineTransform\")\n")?;
            Ok(ToolOutput {
                code: Some(0),
                success: true,
                ..ToolOutput::default()
            })
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_missing_fixed_spawns_nothing() {
        let dir = tempdir().unwrap();
        let moving = touch(dir.path(), "moving.nii.gz");
        let params = touch(dir.path(), "params.txt");
        let runner = RecordingRunner::default();

        let err = register(
            &runner,
            "elastix",
            &dir.path().join("fixed.nii.gz"),
            &moving,
            &dir.path().join("out"),
            &params,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SegError::NotFound { .. }));
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn test_missing_moving_spawns_nothing() {
        let dir = tempdir().unwrap();
        let fixed = touch(dir.path(), "fixed.nii.gz");
        let params = touch(dir.path(), "params.txt");
        let runner = RecordingRunner::default();

        let err = register(
            &runner,
            "elastix",
            &fixed,
            &dir.path().join("moving.nii.gz"),
            &dir.path().join("out"),
            &params,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SegError::NotFound { .. }));
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn test_register_twice_into_same_dir() {
        let dir = tempdir().unwrap();
        let fixed = touch(dir.path(), "fixed.nii.gz");
        let moving = touch(dir.path(), "moving.nii.gz");
        let params = touch(dir.path(), "params.txt");
        let out = dir.path().join("t1_to_MNI_transform");
        let runner = RecordingRunner::default();

        for _ in 0..2 {
            let result = register(&runner, "elastix", &fixed, &moving, &out, &params, None).unwrap();
            assert_eq!(result, out);
        }
        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, calls[1].args);
        assert!(!calls[0].has_flag("-t0"));
        assert!(transform_parameters(&out).exists());
    }

    #[test]
    fn test_rerun_without_output_is_tool_error() {
        let dir = tempdir().unwrap();
        let fixed = touch(dir.path(), "fixed.nii.gz");
        let moving = touch(dir.path(), "moving.nii.gz");
        let params = touch(dir.path(), "params.txt");
        let out = dir.path().join("MNI_to_t1_transform");
        register(&RecordingRunner::default(), "elastix", &fixed, &moving, &out, &params, None).unwrap();

        let silent = RecordingRunner {
            silent: true,
            ..RecordingRunner::default()
        };
        let err = register(&silent, "elastix", &fixed, &moving, &out, &params, None).unwrap_err();
        assert!(matches!(err, SegError::ExternalTool { code: Some(0), .. }));
        assert!(!transform_parameters(&out).exists());
    }

    #[test]
    fn test_initial_transform_is_chained() {
        let dir = tempdir().unwrap();
        let fixed = touch(dir.path(), "atlas.nii.gz");
        let params = touch(dir.path(), "inverse.txt");
        let t0 = touch(dir.path(), TRANSFORM_PARAMETERS);
        let runner = RecordingRunner::default();

        register(
            &runner,
            "elastix",
            &fixed,
            &fixed,
            &dir.path().join("invert"),
            &params,
            Some(&t0),
        )
        .unwrap();
        let calls = runner.calls.borrow();
        assert_eq!(calls[0].flag_value("-t0"), Some(&t0.clone().into_os_string()));
        assert_eq!(calls[0].flag_value("-f"), calls[0].flag_value("-m"));
    }

    #[test]
    fn test_nonzero_exit_surfaces_stderr() {
        let dir = tempdir().unwrap();
        let fixed = touch(dir.path(), "fixed.nii.gz");
        let moving = touch(dir.path(), "moving.nii.gz");
        let params = touch(dir.path(), "params.txt");
        let runner = RecordingRunner {
            exit_code: 1,
            ..RecordingRunner::default()
        };

        let err = register(
            &runner,
            "elastix",
            &fixed,
            &moving,
            &dir.path().join("out"),
            &params,
            None,
        )
        .unwrap_err();
        match err {
            SegError::ExternalTool { tool, code, stderr } => {
                assert_eq!(tool, "elastix");
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "itk::ExceptionObject thrown");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
