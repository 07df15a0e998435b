//! End-to-end segmentation of one subject.
//!
//! Stages talk to each other through files under
//! `<scratch>/<subject>/method_<I|II>/<stage>/`; each stage checks its
//! inputs exist before anything is spawned and checks its outputs exist
//! before the next stage starts. Final label volumes are copied to
//! `<results>/<subject>/`.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::common::{Method, Modality};
use crate::config::PipelineConfig;
use crate::error::{require_exists, Result, SegError};
use crate::geometry::read_geometry;
use crate::params::{derive_inverse, derive_label_safe};
use crate::predictor::{channel_file, predict};
use crate::preprocess::{NormalizeJob, Normalization, Preprocess};
use crate::registration::{register, transform_parameters};
use crate::skullstrip::skull_strip;
use crate::tools::ToolRunner;
use crate::transform::{apply_transform, result_volume};

pub const SKULL_STRIP_DIR: &str = "skull_strip";
pub const MNI_TO_T1_DIR: &str = "MNI_to_t1_transform";
pub const ROI_IN_NATIVE_DIR: &str = "roi_in_native";
pub const T1_TO_MNI_DIR: &str = "t1_to_MNI_transform";
pub const T1_IN_MNI_DIR: &str = "t1_ss_MNI";
pub const T2_IN_MNI_DIR: &str = "t2_ss_MNI";
pub const INVERT_DIR: &str = "invert_t1_to_MNI_transform";
pub const LABEL_IN_NATIVE_DIR: &str = "label_in_native";

const NIFTI_GZ: &str = ".nii.gz";

/// One subject's input pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub t1: PathBuf,
    pub t2: PathBuf,
}

impl Subject {
    /// Subject named after the T1 file, e.g. `sub-01_T1w.nii.gz` -> `sub-01_T1w`.
    pub fn new(t1: impl Into<PathBuf>, t2: impl Into<PathBuf>) -> Self {
        let t1 = t1.into();
        let name = t1
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = name.strip_suffix(NIFTI_GZ).unwrap_or(&name).to_string();
        Self {
            id,
            t1,
            t2: t2.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Where a finished run left its label volumes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutputs {
    pub method: Method,
    /// Segmentation in the subject's native space.
    pub native: PathBuf,
    /// Segmentation in atlas space (method I only).
    pub atlas: Option<PathBuf>,
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn ToolRunner,
    preprocessor: &'a dyn Preprocess,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        runner: &'a dyn ToolRunner,
        preprocessor: &'a dyn Preprocess,
    ) -> Self {
        Self {
            config,
            runner,
            preprocessor,
        }
    }

    /// Scratch tree of one run; not shared between subjects or methods.
    pub fn scratch_dir(&self, subject: &Subject, method: Method) -> PathBuf {
        self.config
            .scratch_dir
            .join(&subject.id)
            .join(method.to_string())
    }

    pub fn run(&self, subject: &Subject, method: Method) -> Result<RunOutputs> {
        self.check_inputs(subject, method)?;
        let scratch = self.scratch_dir(subject, method);
        fs::create_dir_all(&scratch)?;
        info!(
            "Segmenting {} with {} (scratch {})",
            subject.id,
            method,
            scratch.display()
        );

        let outputs = match method {
            Method::MethodI => self.method_i(subject, &scratch)?,
            Method::MethodII => self.method_ii(subject, &scratch)?,
        };

        if self.config.keep_scratch {
            debug!("Keeping scratch directory {}", scratch.display());
        } else {
            fs::remove_dir_all(&scratch)?;
        }
        info!("Segmentation stored at {}", outputs.native.display());
        Ok(outputs)
    }

    fn check_inputs(&self, subject: &Subject, method: Method) -> Result<()> {
        for (what, path) in [("T1 image", &subject.t1), ("T2 image", &subject.t2)] {
            require_exists(what, path)?;
            if !path.to_string_lossy().ends_with(NIFTI_GZ) {
                return Err(SegError::format(format!(
                    "{} must be a {} file: {}",
                    what,
                    NIFTI_GZ,
                    path.display()
                )));
            }
        }
        for (what, path) in self.config.required_files(method) {
            require_exists(what, path)?;
        }
        Ok(())
    }

    fn skull_strip_pair(&self, subject: &Subject, scratch: &Path) -> Result<(PathBuf, PathBuf)> {
        let dir = scratch.join(SKULL_STRIP_DIR);
        let program = &self.config.tools.skull_strip;
        let t1 = skull_strip(self.runner, program, &subject.t1, &dir.join("t1_ss.nii.gz"))?;
        let t2 = skull_strip(self.runner, program, &subject.t2, &dir.join("t2_ss.nii.gz"))?;
        Ok((t1, t2))
    }

    /// Segment in MNI space, then carry the labels back to native space.
    fn method_i(&self, subject: &Subject, scratch: &Path) -> Result<RunOutputs> {
        let method = Method::MethodI;
        let tools = &self.config.tools;
        let atlas = &self.config.atlas;

        let (t1_ss, t2_ss) = self.skull_strip_pair(subject, scratch)?;

        // subject (moving) into the template (fixed)
        let forward_dir = register(
            self.runner,
            &tools.registration,
            &atlas.template,
            &t1_ss,
            &scratch.join(T1_TO_MNI_DIR),
            &atlas.forward_parameters,
            None,
        )?;
        let forward = transform_parameters(&forward_dir);
        info!("Transformation of T1 to MNI space computed");

        let t1_mni = self.resample(&t1_ss, &forward, &scratch.join(T1_IN_MNI_DIR))?;
        let t2_mni = self.resample(&t2_ss, &forward, &scratch.join(T2_IN_MNI_DIR))?;

        let input_dir = self.normalize(method, &t1_mni, &t2_mni, &atlas.roi_mni, scratch)?;
        let prediction = self.predict(method, &input_dir, scratch)?;

        // registering the template to itself on top of the forward transform
        // yields its inverse
        let invert_dir = register(
            self.runner,
            &tools.registration,
            &atlas.template,
            &atlas.template,
            &scratch.join(INVERT_DIR),
            &atlas.inverse_parameters,
            Some(&forward),
        )?;
        let native_geometry = read_geometry(&subject.t1)?;
        let inverse = derive_inverse(&transform_parameters(&invert_dir), &native_geometry)?;
        info!("Inverse transformation to native space computed");

        let native_label = self.resample(&prediction, &inverse, &scratch.join(LABEL_IN_NATIVE_DIR))?;

        let atlas_out = self.persist(subject, &prediction, "method_I_output_in_MNI")?;
        let native_out = self.persist(subject, &native_label, "method_I_output_in_native")?;
        Ok(RunOutputs {
            method,
            native: native_out,
            atlas: Some(atlas_out),
        })
    }

    /// Bring the atlas ROI into native space and segment there.
    fn method_ii(&self, subject: &Subject, scratch: &Path) -> Result<RunOutputs> {
        let method = Method::MethodII;
        let tools = &self.config.tools;
        let atlas = &self.config.atlas;

        let (t1_ss, t2_ss) = self.skull_strip_pair(subject, scratch)?;

        // template (moving) into the subject (fixed)
        let reg_dir = register(
            self.runner,
            &tools.registration,
            &t1_ss,
            &atlas.template,
            &scratch.join(MNI_TO_T1_DIR),
            &atlas.forward_parameters,
            None,
        )?;
        info!("Transformation of MNI to native space computed");

        let label_params = derive_label_safe(&transform_parameters(&reg_dir))?;
        let roi_mask = self.resample(&atlas.roi_atlas, &label_params, &scratch.join(ROI_IN_NATIVE_DIR))?;
        info!("ROI mask transformed to native space");

        let input_dir = self.normalize(method, &t1_ss, &t2_ss, &roi_mask, scratch)?;
        let prediction = self.predict(method, &input_dir, scratch)?;

        let native_out = self.persist(subject, &prediction, "method_II_output_in_native")?;
        Ok(RunOutputs {
            method,
            native: native_out,
            atlas: None,
        })
    }

    fn resample(&self, input: &Path, parameters: &Path, output_dir: &Path) -> Result<PathBuf> {
        let program = &self.config.tools.transform;
        let dir = apply_transform(self.runner, program, input, parameters, output_dir)?;
        result_volume(program, &dir)
    }

    /// Write the predictor's channel files; returns their directory.
    fn normalize(
        &self,
        method: Method,
        t1: &Path,
        t2: &Path,
        roi_mask: &Path,
        scratch: &Path,
    ) -> Result<PathBuf> {
        let input_dir = scratch.join(format!("preprocessed_{}", method));
        // the predictor consumes every file in here
        if input_dir.exists() {
            fs::remove_dir_all(&input_dir)?;
        }
        fs::create_dir_all(&input_dir)?;

        let case_id = &self.config.predictor.model(method).case_id;
        let ending = &self.config.predictor.file_ending;
        let job = NormalizeJob {
            t1,
            t2,
            roi_mask,
            landmarks: self.config.landmarks.for_method(method),
            steps: Normalization::for_method(method),
            t1_out: input_dir.join(channel_file(case_id, Modality::T1, ending)),
            t2_out: input_dir.join(channel_file(case_id, Modality::T2, ending)),
        };
        self.preprocessor.normalize(&job)?;
        info!("Images preprocessed into {}", input_dir.display());
        Ok(input_dir)
    }

    fn predict(&self, method: Method, input_dir: &Path, scratch: &Path) -> Result<PathBuf> {
        let predictor = &self.config.predictor;
        predict(
            self.runner,
            &self.config.tools.predictor,
            predictor,
            predictor.model(method),
            input_dir,
            &scratch.join(format!("prediction_{}", method)),
        )
    }

    /// Copy `produced` to `<results>/<subject>/<name><ext>`.
    fn persist(&self, subject: &Subject, produced: &Path, name: &str) -> Result<PathBuf> {
        let dir = self.config.results_dir.join(&subject.id);
        fs::create_dir_all(&dir)?;
        let target = dir.join(format!("{}{}", name, volume_extension(produced)));
        fs::copy(produced, &target)?;
        debug!("Copied {} to {}", produced.display(), target.display());
        Ok(target)
    }
}

/// `.nii.gz` for gzipped NIfTI, otherwise the plain extension with its dot.
fn volume_extension(path: &Path) -> String {
    let name = path.to_string_lossy();
    if name.ends_with(NIFTI_GZ) {
        NIFTI_GZ.to_string()
    } else {
        path.extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }
}
