//! Error types for the segmentation pipeline.
//!
//! Every stage fails fast with one of these before (or instead of) handing a
//! stale or missing artifact to the next stage.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum SegError {
    /// A required input volume, parameter file or landmark file is missing.
    #[error("{what} not found: {}", path.display())]
    NotFound { what: String, path: PathBuf },

    /// A volume could not be decoded, or its geometry is unusable.
    #[error("Format error: {0}")]
    Format(String),

    /// An external tool exited unsuccessfully or did not produce its output.
    #[error("{tool} failed (exit code {}): {stderr}", code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// A parameter file lacks a field that has to be rewritten.
    #[error("Field ({field} ...) missing from parameter file {}", path.display())]
    MissingField { field: String, path: PathBuf },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, SegError>;

impl SegError {
    /// Create a not-found error for `path`.
    pub fn not_found(what: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::NotFound {
            what: what.into(),
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create a format error.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create an external tool error for a tool that exited cleanly but did
    /// not write its expected output.
    pub fn missing_output(tool: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            code: Some(0),
            stderr: format!("expected output {} was not produced", path.as_ref().display()),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<nifti::NiftiError> for SegError {
    fn from(err: nifti::NiftiError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Fail with [`SegError::NotFound`] unless `path` exists.
pub fn require_exists(what: &str, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(SegError::not_found(what, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = SegError::not_found("Fixed image", "/data/t1.nii.gz");
        assert_eq!(err.to_string(), "Fixed image not found: /data/t1.nii.gz");
    }

    #[test]
    fn test_external_tool_display() {
        let err = SegError::ExternalTool {
            tool: "elastix".to_string(),
            code: Some(1),
            stderr: "bad parameter file".to_string(),
        };
        assert_eq!(err.to_string(), "elastix failed (exit code 1): bad parameter file");

        let err = SegError::ExternalTool {
            tool: "transformix".to_string(),
            code: None,
            stderr: "killed".to_string(),
        };
        assert!(err.to_string().contains("exit code none"));
    }

    #[test]
    fn test_require_exists() {
        let err = require_exists("Input image", Path::new("/definitely/not/here.nii.gz"))
            .unwrap_err();
        assert!(matches!(err, SegError::NotFound { .. }));
    }
}
