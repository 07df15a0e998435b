//! Header-only geometry of NIfTI volumes.
//!
//! The registration tool works in ITK's LPS world convention while NIfTI
//! stores a RAS affine, so the first two world rows are negated on the way
//! out. Voxel data is never read.

use nalgebra::{Matrix4, Vector3};
use nifti::NiftiHeader;
use std::path::Path;

use crate::common::Geometry;
use crate::error::{require_exists, Result, SegError};

/// Read the size, spacing, origin and direction of a volume from its header.
pub fn read_geometry(path: &Path) -> Result<Geometry> {
    require_exists("Volume", path)?;
    let header = NiftiHeader::from_file(path)
        .map_err(|e| SegError::format(format!("{}: {}", path.display(), e)))?;
    geometry_from_header(&header)
}

pub fn geometry_from_header(header: &NiftiHeader) -> Result<Geometry> {
    let dim = header.dim;
    if dim[0] < 3 {
        return Err(SegError::format(format!(
            "expected at least 3 dimensions, header declares {}",
            dim[0]
        )));
    }
    let size = [dim[1] as usize, dim[2] as usize, dim[3] as usize];

    // ITK falls back to unit spacing for a zero pixdim
    let mut spacing = [1.0; 3];
    for (axis, s) in spacing.iter_mut().enumerate() {
        let p = header.pixdim[axis + 1].abs() as f64;
        if p > 0.0 {
            *s = p;
        }
    }

    let affine = affine_from_header(header);
    let mut direction = [[0.0; 3]; 3];
    for col in 0..3 {
        let column = Vector3::new(affine[(0, col)], affine[(1, col)], affine[(2, col)]);
        let norm = column.norm();
        let unit = if norm > 1e-9 {
            column / norm
        } else {
            let mut axis = Vector3::zeros();
            axis[col] = 1.0;
            axis
        };
        for row in 0..3 {
            direction[row][col] = unit[row] + 0.0;
        }
    }
    let mut origin = [affine[(0, 3)], affine[(1, 3)], affine[(2, 3)] + 0.0];

    // RAS -> LPS; adding 0.0 turns -0.0 into 0.0
    for row in 0..2 {
        origin[row] = -origin[row] + 0.0;
        for col in 0..3 {
            direction[row][col] = -direction[row][col] + 0.0;
        }
    }

    Ok(Geometry {
        size,
        spacing,
        origin,
        direction,
    })
}

/// Voxel-to-world (RAS) affine: sform if set, else qform, else pixdim scaling.
pub fn affine_from_header(header: &NiftiHeader) -> Matrix4<f64> {
    if header.sform_code > 0 {
        return header.sform_affine::<f64>();
    }
    if header.qform_code > 0 {
        return header.qform_affine::<f64>();
    }
    // ITK keeps voxel (0, 0, 0) at the world origin when no transform is set
    Matrix4::new_nonuniform_scaling(&Vector3::new(
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use nifti::writer::WriterOptions;
    use tempfile::tempdir;

    fn header_with_sform(pixdim: [f32; 3], rows: [[f32; 4]; 3]) -> NiftiHeader {
        let mut header = NiftiHeader::default();
        header.pixdim = [1.0, pixdim[0], pixdim[1], pixdim[2], 1.0, 1.0, 1.0, 1.0];
        header.sform_code = 2;
        header.srow_x = rows[0];
        header.srow_y = rows[1];
        header.srow_z = rows[2];
        header
    }

    #[test]
    fn test_read_geometry_known_volume() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("synthetic.nii.gz");
        // LPS identity is diag(-1, -1, 1) in RAS
        let header = header_with_sform(
            [1.0, 1.0, 2.0],
            [
                [-1.0, 0.0, 0.0, 0.0],
                [0.0, -1.0, 0.0, 0.0],
                [0.0, 0.0, 2.0, 0.0],
            ],
        );
        let data = Array3::<f32>::zeros((64, 64, 32));
        WriterOptions::new(&path)
            .reference_header(&header)
            .write_nifti(&data)?;

        let geometry = read_geometry(&path)?;
        assert_eq!(geometry.size, [64, 64, 32]);
        assert_eq!(geometry.spacing, [1.0, 1.0, 2.0]);
        assert_eq!(geometry.origin, [0.0, 0.0, 0.0]);
        assert_eq!(
            geometry.direction,
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
        );
        assert_eq!(geometry.origin_values(), "0 0 0");
        Ok(())
    }

    #[test]
    fn test_ras_identity_flips_to_lps() -> Result<()> {
        let header = header_with_sform(
            [2.0, 2.0, 2.0],
            [
                [2.0, 0.0, 0.0, -90.0],
                [0.0, 2.0, 0.0, -126.0],
                [0.0, 0.0, 2.0, -72.0],
            ],
        );
        let geometry = geometry_from_header(&header)?;
        assert_eq!(geometry.origin, [90.0, 126.0, -72.0]);
        assert_eq!(geometry.direction_values(), "-1 0 0 0 -1 0 0 0 1");
        Ok(())
    }

    #[test]
    fn test_qform_used_without_sform() -> Result<()> {
        let mut header = NiftiHeader::default();
        header.dim = [3, 10, 10, 10, 1, 1, 1, 1];
        header.pixdim = [1.0, 2.0, 2.0, 3.0, 1.0, 1.0, 1.0, 1.0];
        header.sform_code = 0;
        header.qform_code = 1;
        // 180 degrees about z, i.e. LPS axes
        header.quatern_b = 0.0;
        header.quatern_c = 0.0;
        header.quatern_d = 1.0;
        header.quatern_x = 10.0;
        header.quatern_y = -20.0;
        header.quatern_z = 5.0;

        let geometry = geometry_from_header(&header)?;
        assert_eq!(geometry.spacing, [2.0, 2.0, 3.0]);
        assert_eq!(geometry.origin, [-10.0, 20.0, 5.0]);
        assert_eq!(geometry.direction_values(), "1 0 0 0 1 0 0 0 1");
        Ok(())
    }

    #[test]
    fn test_pixdim_only_header() -> Result<()> {
        let mut header = NiftiHeader::default();
        header.dim = [3, 10, 12, 14, 1, 1, 1, 1];
        header.pixdim = [1.0, 1.5, 1.5, 1.5, 1.0, 1.0, 1.0, 1.0];
        header.sform_code = 0;
        header.qform_code = 0;

        let geometry = geometry_from_header(&header)?;
        assert_eq!(geometry.size_values(), "10 12 14");
        assert_eq!(geometry.spacing_values(), "1.5 1.5 1.5");
        assert_eq!(geometry.origin_values(), "0 0 0");
        Ok(())
    }

    #[test]
    fn test_missing_volume() {
        let err = read_geometry(Path::new("/no/such/volume.nii.gz")).unwrap_err();
        assert!(matches!(err, SegError::NotFound { .. }));
    }

    #[test]
    fn test_not_a_volume() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.nii");
        std::fs::write(&path, "definitely not a nifti header")?;
        let err = read_geometry(&path).unwrap_err();
        assert!(matches!(err, SegError::Format(_)));
        Ok(())
    }
}
