//! Rewriting of registration transform-parameter files.
//!
//! A parameter file is a list of `(Key value value ...)` entries. Fields are
//! rewritten textually so everything the editor does not touch stays
//! byte-for-byte as the registration tool wrote it.

use regex::{NoExpand, Regex};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::common::Geometry;
use crate::error::{require_exists, Result, SegError};

pub const INTERPOLATION_ORDER: &str = "FinalBSplineInterpolationOrder";
pub const INITIAL_TRANSFORM: &str = "InitialTransformParametersFileName";
pub const NO_INITIAL_TRANSFORM: &str = "\"NoInitialTransform\"";

/// Tag of the nearest-neighbour copy of a parameter file.
pub const LABELS_TAG: &str = "for_labels";
/// Tag of the inverted, native-space copy of a parameter file.
pub const INVERSE_TAG: &str = "labels_MNI_to_T1";

#[derive(Debug, Clone)]
pub struct ParameterFile {
    path: PathBuf,
    text: String,
}

impl ParameterFile {
    pub fn read(path: &Path) -> Result<Self> {
        require_exists("Parameter file", path)?;
        let text = fs::read_to_string(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            text,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Values of the first `(key ...)` entry, with string quotes removed.
    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        let re = field_regex(key).ok()?;
        let entry = re.find(&self.text)?.as_str();
        let inner = &entry[key.len() + 1..entry.len() - 1];
        Some(
            inner
                .split_whitespace()
                .map(|v| v.trim_matches('"').to_string())
                .collect(),
        )
    }

    /// Replace every `(key ...)` entry with `(key values)`.
    ///
    /// Fails with [`SegError::MissingField`] when the file has no such entry.
    pub fn set(&mut self, key: &str, values: &str) -> Result<()> {
        let re = field_regex(key)?;
        if !re.is_match(&self.text) {
            return Err(SegError::MissingField {
                field: key.to_string(),
                path: self.path.clone(),
            });
        }
        let entry = format!("({} {})", key, values);
        self.text = re.replace_all(&self.text, NoExpand(&entry)).into_owned();
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.text)?;
        debug!("Wrote parameter file {}", path.display());
        Ok(())
    }
}

fn field_regex(key: &str) -> Result<Regex> {
    Regex::new(&format!(r"\({}\s[^\n]*\)", regex::escape(key)))
        .map_err(|e| SegError::format(e.to_string()))
}

/// `dir/TransformParameters.0.txt` -> `dir/TransformParameters.0.<tag>.txt`
pub fn tagged_sibling(path: &Path, tag: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, tag, ext.to_string_lossy()),
        None => format!("{}.{}", stem, tag),
    };
    path.with_file_name(name)
}

/// Write a copy of `parameter_file` that resamples with nearest-neighbour
/// interpolation, so label values survive the transform.
pub fn derive_label_safe(parameter_file: &Path) -> Result<PathBuf> {
    let mut params = ParameterFile::read(parameter_file)?;
    params.set(INTERPOLATION_ORDER, "0")?;
    let output = tagged_sibling(parameter_file, LABELS_TAG);
    params.write(&output)?;
    Ok(output)
}

/// Write a copy of `parameter_file` retargeted onto `target`'s grid.
///
/// Size, spacing, origin and direction are replaced by `target`'s, the
/// interpolation order drops to nearest-neighbour and the initial transform
/// chain is cut, leaving a standalone transform that resamples labels into
/// `target`'s space.
pub fn derive_inverse(parameter_file: &Path, target: &Geometry) -> Result<PathBuf> {
    let mut params = ParameterFile::read(parameter_file)?;
    params.set(INTERPOLATION_ORDER, "0")?;
    params.set(INITIAL_TRANSFORM, NO_INITIAL_TRANSFORM)?;
    params.set("Size", &target.size_values())?;
    params.set("Spacing", &target.spacing_values())?;
    params.set("Origin", &target.origin_values())?;
    params.set("Direction", &target.direction_values())?;
    let output = tagged_sibling(parameter_file, INVERSE_TAG);
    params.write(&output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const AFFINE_PARAMS: &str = r#"(Transform "AffineTransform")
(NumberOfParameters 12)
(TransformParameters 1.01 0.02 -0.01 0.00 0.98 0.03 0.01 -0.02 1.03 -1.5 2.25 -0.75)
(InitialTransformParametersFileName "/scratch/t1_to_MNI_transform/TransformParameters.0.txt")
(UseBinaryFormatForTransformationParameters "false")
(HowToCombineTransforms "Compose")

// Image specific
(FixedImageDimension 3)
(MovingImageDimension 3)
(Size 193 229 193)
(Index 0 0 0)
(Spacing 1.0000000000 1.0000000000 1.0000000000)
(Origin -96.0000000000 -132.0000000000 -78.0000000000)
(Direction 1.0000000000 0.0000000000 0.0000000000 0.0000000000 1.0000000000 0.0000000000 0.0000000000 0.0000000000 1.0000000000)
(UseDirectionCosines "true")

// ResampleInterpolator specific
(ResampleInterpolator "FinalBSplineInterpolator")
(FinalBSplineInterpolationOrder 3)

// Resampler specific
(Resampler "DefaultResampler")
(DefaultPixelValue 0.000000)
(ResultImageFormat "nii.gz")
(ResultImagePixelType "float")
"#;

    fn write_params(dir: &Path) -> PathBuf {
        let path = dir.join("TransformParameters.0.txt");
        fs::write(&path, AFFINE_PARAMS).unwrap();
        path
    }

    #[test]
    fn test_label_safe_only_changes_interpolation_order() {
        let dir = tempdir().unwrap();
        let source = write_params(dir.path());

        let output = derive_label_safe(&source).unwrap();
        assert_eq!(output, dir.path().join("TransformParameters.0.for_labels.txt"));

        let written = fs::read_to_string(&output).unwrap();
        let expected = AFFINE_PARAMS.replace(
            "(FinalBSplineInterpolationOrder 3)",
            "(FinalBSplineInterpolationOrder 0)",
        );
        assert_eq!(written, expected);
        // the source is untouched
        assert_eq!(fs::read_to_string(&source).unwrap(), AFFINE_PARAMS);
    }

    #[test]
    fn test_label_safe_is_idempotent() {
        let dir = tempdir().unwrap();
        let source = write_params(dir.path());

        let first = fs::read_to_string(derive_label_safe(&source).unwrap()).unwrap();
        let second = fs::read_to_string(derive_label_safe(&source).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_label_safe_missing_source() {
        let dir = tempdir().unwrap();
        let err = derive_label_safe(&dir.path().join("TransformParameters.0.txt")).unwrap_err();
        assert!(matches!(err, SegError::NotFound { .. }));
    }

    #[test]
    fn test_label_safe_missing_field_fails_loudly() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("TransformParameters.0.txt");
        fs::write(&source, "(Transform \"AffineTransform\")\n").unwrap();
        let err = derive_label_safe(&source).unwrap_err();
        assert!(
            matches!(err, SegError::MissingField { ref field, .. } if field == INTERPOLATION_ORDER)
        );
        assert!(!dir.path().join("TransformParameters.0.for_labels.txt").exists());
    }

    #[test]
    fn test_inverse_rewrites_geometry() {
        let dir = tempdir().unwrap();
        let source = write_params(dir.path());
        let target = Geometry {
            size: [176, 256, 240],
            spacing: [1.2, 0.9375, 0.9375],
            origin: [84.5, -110.25, 131.0],
            direction: [[0.0, 0.0, -1.0], [1.0, 0.0, 0.0], [0.0, -1.0, 0.0]],
        };

        let output = derive_inverse(&source, &target).unwrap();
        assert_eq!(
            output,
            dir.path().join("TransformParameters.0.labels_MNI_to_T1.txt")
        );

        let params = ParameterFile::read(&output).unwrap();
        let text = params.text();
        assert!(text.contains("(Size 176 256 240)\n"));
        assert!(text.contains("(Spacing 1.2 0.9375 0.9375)\n"));
        assert!(text.contains("(Origin 84.5 -110.25 131)\n"));
        assert!(text.contains("(Direction 0 1 0 0 0 -1 -1 0 0)\n"));
        assert!(text.contains("(FinalBSplineInterpolationOrder 0)"));
        assert!(text.contains("(InitialTransformParametersFileName \"NoInitialTransform\")"));
        // untouched fields survive, including look-alike keys
        assert!(text.contains("(TransformParameters 1.01 0.02"));
        assert!(text.contains("(ResultImageFormat \"nii.gz\")"));

        assert_eq!(
            params.get("Spacing"),
            Some(vec!["1.2".to_string(), "0.9375".to_string(), "0.9375".to_string()])
        );
        assert_eq!(
            params.get(INITIAL_TRANSFORM),
            Some(vec!["NoInitialTransform".to_string()])
        );
    }

    #[test]
    fn test_inverse_missing_geometry_field() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("TransformParameters.0.txt");
        fs::write(&source, AFFINE_PARAMS.replace("(Origin", "(GridOrigin")).unwrap();
        let target = Geometry {
            size: [1, 1, 1],
            spacing: [1.0; 3],
            origin: [0.0; 3],
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        };
        let err = derive_inverse(&source, &target).unwrap_err();
        assert!(matches!(err, SegError::MissingField { ref field, .. } if field == "Origin"));
    }

    #[test]
    fn test_tagged_sibling() {
        assert_eq!(
            tagged_sibling(Path::new("/tmp/x/Par0064_affine.txt"), "for_labels"),
            PathBuf::from("/tmp/x/Par0064_affine.for_labels.txt")
        );
        assert_eq!(
            tagged_sibling(Path::new("params"), "for_labels"),
            PathBuf::from("params.for_labels")
        );
    }
}
