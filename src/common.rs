use nalgebra::Matrix4;
use ndarray::{Array3, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::fmt;
use std::path::Path;

use crate::error::{require_exists, Result, SegError};
use crate::geometry::affine_from_header;

// set up enums and structs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Segment in atlas space, then map the labels back to native space.
    MethodI,
    /// Bring the atlas into native space and segment there directly.
    MethodII,
}

impl Method {
    pub fn tag(&self) -> &'static str {
        match self {
            Method::MethodI => "I",
            Method::MethodII => "II",
        }
    }
    pub fn from_tag(val: &str) -> Option<Self> {
        match val {
            "I" | "i" | "1" => Some(Method::MethodI),
            "II" | "ii" | "2" => Some(Method::MethodII),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method_{}", self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    T1,
    T2,
}

impl Modality {
    /// Channel index expected by the predictor (`<case_id>_000N`).
    pub fn channel(&self) -> usize {
        match self {
            Modality::T1 => 0,
            Modality::T2 => 1,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::T1 => write!(f, "t1"),
            Modality::T2 => write!(f, "t2"),
        }
    }
}

/// Header geometry of a volume in the registration tool's (LPS) convention.
///
/// `direction[row][col]`; column `c` is the physical direction of voxel axis `c`.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub size: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub direction: [[f64; 3]; 3],
}

impl Geometry {
    pub fn size_values(&self) -> String {
        join(self.size.iter())
    }

    pub fn spacing_values(&self) -> String {
        join(self.spacing.iter())
    }

    pub fn origin_values(&self) -> String {
        join(self.origin.iter())
    }

    /// Direction cosines flattened column by column.
    pub fn direction_values(&self) -> String {
        let flat = (0..3).flat_map(|col| (0..3).map(move |row| (row, col)));
        join(flat.map(|(row, col)| self.direction[row][col]))
    }
}

fn join<T: fmt::Display>(values: impl Iterator<Item = T>) -> String {
    values
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A 3D volume held in memory together with the header it was read with.
#[derive(Debug, Clone)]
pub struct Vol3D {
    pub vol: Array3<f32>,
    pub affine: Matrix4<f64>,
    pub header: NiftiHeader,
}

impl Vol3D {
    pub fn new(vol: Array3<f32>, affine: Matrix4<f64>, header: NiftiHeader) -> Self {
        Self {
            vol,
            affine,
            header,
        }
    }

    /// Read a 3D volume (a 4D volume with a single frame is accepted too).
    pub fn load(path: &Path) -> Result<Self> {
        require_exists("Volume", path)?;
        let obj = ReaderOptions::new().read_file(path)?;
        let header = obj.header().clone();
        let affine = affine_from_header(&header);
        let img = obj.into_volume().into_ndarray::<f32>()?;
        let shape = img.shape().to_vec();
        let img = match shape.as_slice() {
            [_, _, _] => img,
            [_, _, _, 1] => img.index_axis_move(Axis(3), 0),
            shape => {
                return Err(SegError::format(format!(
                    "{} must be 3D, found shape {:?}",
                    path.display(),
                    shape
                )))
            }
        };
        let vol = img
            .into_dimensionality::<Ix3>()
            .map_err(|e| SegError::format(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(vol, affine, header))
    }

    /// Write the volume with its current affine.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut header = self.header.clone();
        for axis in 0..3 {
            let norm = (0..3)
                .map(|row| self.affine[(row, axis)].powi(2))
                .sum::<f64>()
                .sqrt();
            header.pixdim[axis + 1] = norm as f32;
        }
        header.set_affine(&self.affine);
        header.sform_code = 2;
        // voxel values are already scaled
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&self.vol)?;
        Ok(())
    }

    pub fn shape(&self) -> [usize; 3] {
        let s = self.vol.shape();
        [s[0], s[1], s[2]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_tags() {
        assert_eq!(Method::from_tag("I"), Some(Method::MethodI));
        assert_eq!(Method::from_tag("II"), Some(Method::MethodII));
        assert_eq!(Method::from_tag("III"), None);
        assert_eq!(Method::MethodII.to_string(), "method_II");
    }

    #[test]
    fn test_geometry_values() {
        let geometry = Geometry {
            size: [64, 64, 32],
            spacing: [1.0, 1.0, 2.5],
            origin: [-90.0, 126.0, -72.0],
            direction: [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, -1.0, 0.0]],
        };
        assert_eq!(geometry.size_values(), "64 64 32");
        assert_eq!(geometry.spacing_values(), "1 1 2.5");
        assert_eq!(geometry.origin_values(), "-90 126 -72");
        assert_eq!(geometry.direction_values(), "1 0 0 0 0 -1 0 1 0");
    }
}
