//! Pipeline configuration.
//!
//! All locations the pipeline needs (atlas files, landmark vectors, model
//! directories, tool executables) live here and are passed down explicitly.
//! The predictor's model directories reach the predictor process through
//! its own environment only.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{Method, Modality};
use crate::error::{require_exists, Result, SegError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub scratch_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Leave the subject's scratch tree in place after a successful run.
    pub keep_scratch: bool,
    pub tools: ToolsConfig,
    pub atlas: AtlasConfig,
    pub landmarks: LandmarksConfig,
    pub predictor: PredictorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub skull_strip: String,
    pub registration: String,
    pub transform: String,
    pub predictor: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Skull-stripped MNI template.
    pub template: PathBuf,
    /// Atlas ROI carried into native space (method II).
    pub roi_atlas: PathBuf,
    /// ROI used to crop in MNI space (method I).
    pub roi_mni: PathBuf,
    /// Registration parameters between subject and template.
    pub forward_parameters: PathBuf,
    /// Registration parameters for inverting the forward transform.
    pub inverse_parameters: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ModalityLandmarks {
    pub t1: PathBuf,
    pub t2: PathBuf,
}

impl ModalityLandmarks {
    pub fn get(&self, modality: Modality) -> &Path {
        match modality {
            Modality::T1 => &self.t1,
            Modality::T2 => &self.t2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LandmarksConfig {
    pub method_i: ModalityLandmarks,
    pub method_ii: ModalityLandmarks,
}

impl LandmarksConfig {
    pub fn for_method(&self, method: Method) -> &ModalityLandmarks {
        match method {
            Method::MethodI => &self.method_i,
            Method::MethodII => &self.method_ii,
        }
    }
}

/// Which trained model the predictor runs, and how its case files are named.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSelection {
    pub dataset: String,
    pub configuration: String,
    pub fold: String,
    pub trainer: String,
    pub plans: String,
    pub case_id: String,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            configuration: "3d_fullres".to_string(),
            fold: "5".to_string(),
            trainer: "nnUNetTrainer_100epochs_NoMirroring".to_string(),
            plans: "nnUNetResEncUNetLPlans".to_string(),
            case_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Exported as `nnUNet_raw`.
    pub raw_dir: PathBuf,
    /// Exported as `nnUNet_preprocessed`.
    pub preprocessed_dir: PathBuf,
    /// Exported as `nnUNet_results`.
    pub results_dir: PathBuf,
    pub save_probabilities: bool,
    pub file_ending: String,
    pub method_i: ModelSelection,
    pub method_ii: ModelSelection,
}

impl PredictorConfig {
    pub fn model(&self, method: Method) -> &ModelSelection {
        match method {
            Method::MethodI => &self.method_i,
            Method::MethodII => &self.method_ii,
        }
    }

    /// Environment the predictor process is started with.
    pub fn env(&self) -> Vec<(&'static str, &Path)> {
        vec![
            ("nnUNet_raw", self.raw_dir.as_path()),
            ("nnUNet_preprocessed", self.preprocessed_dir.as_path()),
            ("nnUNet_results", self.results_dir.as_path()),
        ]
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            skull_strip: "mri_synthstrip".to_string(),
            registration: "elastix".to_string(),
            transform: "transformix".to_string(),
            predictor: "nnUNetv2_predict".to_string(),
        }
    }
}

impl AtlasConfig {
    fn rooted(data_dir: &Path) -> Self {
        let templates = data_dir.join("templates");
        Self {
            template: templates.join("mni_icbm152_t1_tal_nlin_asym_09c_masked.nii.gz"),
            roi_atlas: templates.join("ROI_CIT168_atlas.nii.gz"),
            roi_mni: templates.join("combined_ROI_MNI.nii.gz"),
            forward_parameters: templates.join("Par0064_affine.txt"),
            inverse_parameters: templates.join("Par0064_inverse.txt"),
        }
    }
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self::rooted(Path::new("data"))
    }
}

impl LandmarksConfig {
    fn rooted(data_dir: &Path) -> Self {
        let root = data_dir.join("normalization_landmarks");
        let for_method = |name: &str| ModalityLandmarks {
            t1: root.join(name).join("t1_histogram.npy"),
            t2: root.join(name).join("t2_histogram.npy"),
        };
        Self {
            method_i: for_method("method_I"),
            method_ii: for_method("method_II"),
        }
    }
}

impl PredictorConfig {
    fn rooted(model_dir: &Path) -> Self {
        Self {
            raw_dir: model_dir.join("raw"),
            preprocessed_dir: model_dir.join("preprocessed"),
            results_dir: model_dir.join("models"),
            save_probabilities: true,
            file_ending: ".nii.gz".to_string(),
            method_i: ModelSelection {
                dataset: "003".to_string(),
                case_id: "0.5_MNI_001".to_string(),
                ..ModelSelection::default()
            },
            method_ii: ModelSelection {
                dataset: "002".to_string(),
                case_id: "LOCALIZER_001".to_string(),
                ..ModelSelection::default()
            },
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self::rooted(Path::new("nnunet"))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::with_roots(Path::new("data"), Path::new("nnunet"))
    }
}

impl PipelineConfig {
    /// Defaults with atlas/landmark files under `data_dir` and the predictor's
    /// model tree under `model_dir`.
    pub fn with_roots(data_dir: &Path, model_dir: &Path) -> Self {
        Self {
            scratch_dir: PathBuf::from("tmp"),
            results_dir: PathBuf::from("results"),
            keep_scratch: true,
            tools: ToolsConfig::default(),
            atlas: AtlasConfig::rooted(data_dir),
            landmarks: LandmarksConfig::rooted(data_dir),
            predictor: PredictorConfig::rooted(model_dir),
        }
    }

    /// Load a TOML file; anything it leaves out keeps its default.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        require_exists("Configuration file", path)?;
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SegError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let tools = [
            ("skull_strip", &self.tools.skull_strip),
            ("registration", &self.tools.registration),
            ("transform", &self.tools.transform),
            ("predictor", &self.tools.predictor),
        ];
        for (name, program) in tools {
            if program.trim().is_empty() {
                return Err(SegError::invalid_config(format!(
                    "tools.{} must name an executable",
                    name
                )));
            }
        }
        for method in [Method::MethodI, Method::MethodII] {
            let model = self.predictor.model(method);
            if model.dataset.is_empty() || model.case_id.is_empty() {
                return Err(SegError::invalid_config(format!(
                    "predictor model for {} needs a dataset and a case_id",
                    method
                )));
            }
        }
        Ok(())
    }

    /// Files a run of `method` reads besides the subject's own volumes.
    pub fn required_files(&self, method: Method) -> Vec<(&'static str, &Path)> {
        let landmarks = self.landmarks.for_method(method);
        let mut files = vec![
            ("Atlas template", self.atlas.template.as_path()),
            ("Registration parameters", self.atlas.forward_parameters.as_path()),
            ("T1 landmarks", landmarks.t1.as_path()),
            ("T2 landmarks", landmarks.t2.as_path()),
        ];
        match method {
            Method::MethodI => {
                files.push(("MNI ROI mask", self.atlas.roi_mni.as_path()));
                files.push((
                    "Inversion parameters",
                    self.atlas.inverse_parameters.as_path(),
                ));
            }
            Method::MethodII => files.push(("Atlas ROI", self.atlas.roi_atlas.as_path())),
        }
        files
    }
}
