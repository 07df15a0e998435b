//! Atlas-guided segmentation of deep brain structures from T1/T2 NIfTI pairs.
//!
//! Two pipelines are offered. Method I registers the subject to the MNI
//! template, segments there, and carries the labels back. Method II carries
//! the atlas ROI into the subject's native space and segments there.
//! Skull stripping, registration, resampling and inference are delegated to
//! external tools driven through [`tools::ToolRunner`]; intensity
//! normalization runs in-process.

pub mod common;
pub mod config;
pub mod error;
pub mod geometry;
pub mod params;
pub mod pipeline;
pub mod predictor;
pub mod preprocess;
pub mod registration;
pub mod skullstrip;
pub mod tools;
pub mod transform;

pub use common::{Geometry, Method, Modality};
pub use config::PipelineConfig;
pub use error::{Result, SegError};
pub use pipeline::{Pipeline, RunOutputs, Subject};
