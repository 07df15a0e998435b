//! Structured invocation of the external tools.
//!
//! Every tool is started from an explicit argument vector (never through a
//! shell) and its exit status is checked before the caller looks for the
//! files it was supposed to write.

use std::ffi::OsString;
use std::path::Path;
use std::process::Command;
use tracing::debug;

use crate::error::{Result, SegError};

/// One external process call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, OsString)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Flag followed by a path, e.g. `-f fixed.nii.gz`.
    pub fn path_arg(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&OsString> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

/// What a finished process left behind.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external processes. Tests substitute fakes that record calls.
pub trait ToolRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;
}

/// Runs tools as child processes, blocking until they exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.envs {
            cmd.env(key, value);
        }
        debug!("Running {:?}", cmd);

        let output = cmd.output().map_err(|e| SegError::ExternalTool {
            tool: invocation.program.clone(),
            code: None,
            stderr: format!("failed to start: {}", e),
        })?;

        Ok(ToolOutput {
            code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run `invocation` and fail with [`SegError::ExternalTool`] on a non-zero exit.
pub fn run_checked(runner: &dyn ToolRunner, invocation: &Invocation) -> Result<ToolOutput> {
    let output = runner.run(invocation)?;
    if !output.success {
        return Err(SegError::ExternalTool {
            tool: invocation.program.clone(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    debug!("{} finished", invocation.program);
    Ok(output)
}

/// Remove `path` left over from an earlier run, so a tool that exits cleanly
/// without writing it cannot pass [`expect_output`].
pub fn clear_output(path: &Path) -> Result<()> {
    if path.is_file() {
        debug!("Removing stale {}", path.display());
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Fail unless `path` was produced by `tool`.
pub fn expect_output(tool: &str, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(SegError::missing_output(tool, path))
    }
}
