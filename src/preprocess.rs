//! Intensity and shape normalization ahead of the predictor.
//!
//! Every spatial step updates the volume's affine along with its voxels, so
//! the written volumes stay in the physical space they were read from.

use nalgebra::{Matrix4, Vector3, Vector4};
use ndarray::{s, Array1, Array3, Axis};
use ndarray_npy::read_npy;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::common::{Method, Modality, Vol3D};
use crate::config::ModalityLandmarks;
use crate::error::{require_exists, Result, SegError};

/// Input shape of the native-space (method II) model.
pub const METHOD_II_SHAPE: [usize; 3] = [90, 80, 60];

/// Percentiles a landmark vector holds values for.
pub const PERCENTILES: [f64; 13] = [
    1.0, 10.0, 20.0, 25.0, 30.0, 40.0, 50.0, 60.0, 70.0, 75.0, 80.0, 90.0, 99.0,
];
// quartiles are stored but not used for the mapping
const RANGE_TO_USE: [usize; 11] = [0, 1, 2, 4, 5, 6, 7, 8, 10, 11, 12];
const EPSILON: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    BSpline,
}

/// Which steps run, in this order: reorient, resample onto T2, crop to the
/// ROI, z-score, histogram standardization, fixed-shape crop/pad.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub reorient: bool,
    pub resample_to_t2: bool,
    pub z_score: bool,
    pub target_shape: Option<[usize; 3]>,
}

impl Normalization {
    pub fn for_method(method: Method) -> Self {
        match method {
            Method::MethodI => Self {
                reorient: false,
                resample_to_t2: false,
                z_score: true,
                target_shape: None,
            },
            Method::MethodII => Self {
                reorient: true,
                resample_to_t2: true,
                z_score: false,
                target_shape: Some(METHOD_II_SHAPE),
            },
        }
    }
}

/// Inputs and outputs of one normalization.
#[derive(Debug, Clone)]
pub struct NormalizeJob<'a> {
    pub t1: &'a Path,
    pub t2: &'a Path,
    pub roi_mask: &'a Path,
    pub landmarks: &'a ModalityLandmarks,
    pub steps: Normalization,
    pub t1_out: PathBuf,
    pub t2_out: PathBuf,
}

pub trait Preprocess {
    /// Normalize the job's T1/T2 pair; returns the written (T1, T2) paths.
    fn normalize(&self, job: &NormalizeJob<'_>) -> Result<(PathBuf, PathBuf)>;
}

/// Crop to the ROI and standardize histograms against trained landmarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct LandmarkNormalizer;

impl Preprocess for LandmarkNormalizer {
    fn normalize(&self, job: &NormalizeJob<'_>) -> Result<(PathBuf, PathBuf)> {
        let t1_landmarks = read_landmarks(job.landmarks.get(Modality::T1))?;
        let t2_landmarks = read_landmarks(job.landmarks.get(Modality::T2))?;

        let mut t1 = Vol3D::load(job.t1)?;
        let mut t2 = Vol3D::load(job.t2)?;
        let mut roi = Vol3D::load(job.roi_mask)?;
        let steps = &job.steps;

        if steps.reorient {
            t1 = to_canonical(&t1);
            t2 = to_canonical(&t2);
            roi = to_canonical(&roi);
        }
        if steps.resample_to_t2 {
            debug!("Resampling T1 and ROI onto the T2 grid {:?}", t2.shape());
            t1 = resample_onto(&t1, &t2, Interpolation::BSpline)?;
            roi = resample_onto(&roi, &t2, Interpolation::Nearest)?;
        }
        if t1.shape() != t2.shape() || t1.shape() != roi.shape() {
            return Err(SegError::format(format!(
                "incompatible grids: T1 {:?}, T2 {:?}, ROI {:?}",
                t1.shape(),
                t2.shape(),
                roi.shape()
            )));
        }

        match mask_bounds(&roi.vol) {
            Some((start, end)) => {
                let extent = [end[0] - start[0], end[1] - start[1], end[2] - start[2]];
                debug!("Cropping to ROI at {:?} with extent {:?}", start, extent);
                t1 = crop(&t1, start, extent);
                t2 = crop(&t2, start, extent);
            }
            None => warn!(
                "ROI mask {} is empty, images are not cropped",
                job.roi_mask.display()
            ),
        }

        if steps.z_score {
            t1.vol = z_score(&t1.vol)?;
            t2.vol = z_score(&t2.vol)?;
        }
        t1.vol = histogram_standardize(&t1.vol, &t1_landmarks)?;
        t2.vol = histogram_standardize(&t2.vol, &t2_landmarks)?;

        if let Some(target) = steps.target_shape {
            t1 = crop_or_pad(&t1, target);
            t2 = crop_or_pad(&t2, target);
        }

        for (vol, out) in [(&t1, &job.t1_out), (&t2, &job.t2_out)] {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            vol.save(out)?;
        }
        info!("Normalized volumes of shape {:?}", t1.shape());
        Ok((job.t1_out.clone(), job.t2_out.clone()))
    }
}

/// Read a landmark vector (one value per entry of [`PERCENTILES`]).
pub fn read_landmarks(path: &Path) -> Result<Vec<f64>> {
    require_exists("Landmarks file", path)?;
    let landmarks: Array1<f64> = match read_npy::<_, Array1<f64>>(path) {
        Ok(landmarks) => landmarks,
        Err(_) => read_npy::<_, Array1<f32>>(path)
            .map_err(|e| SegError::format(format!("{}: {}", path.display(), e)))?
            .mapv(f64::from),
    };
    if landmarks.len() != PERCENTILES.len() {
        return Err(SegError::format(format!(
            "{} holds {} landmarks, expected {}",
            path.display(),
            landmarks.len(),
            PERCENTILES.len()
        )));
    }
    Ok(landmarks.to_vec())
}

/// For each voxel axis, the world axis it is closest to and whether it runs
/// against that axis.
fn axis_orientation(affine: &Matrix4<f64>) -> [(usize, bool); 3] {
    let mut cosines = [[0.0; 3]; 3];
    for v in 0..3 {
        let column = Vector3::new(affine[(0, v)], affine[(1, v)], affine[(2, v)]);
        let norm = column.norm().max(f64::MIN_POSITIVE);
        for w in 0..3 {
            cosines[w][v] = column[w] / norm;
        }
    }

    let mut result = [(0, false); 3];
    let mut voxel_used = [false; 3];
    let mut world_used = [false; 3];
    for _ in 0..3 {
        let mut best = (0, 0, -1.0);
        for v in (0..3).filter(|&v| !voxel_used[v]) {
            for w in (0..3).filter(|&w| !world_used[w]) {
                let m = cosines[w][v].abs();
                if m > best.2 {
                    best = (v, w, m);
                }
            }
        }
        let (v, w, _) = best;
        voxel_used[v] = true;
        world_used[w] = true;
        result[v] = (w, cosines[w][v] < 0.0);
    }
    result
}

/// Permute and flip voxel axes so they run along +R, +A, +S.
pub fn to_canonical(vol: &Vol3D) -> Vol3D {
    let orientation = axis_orientation(&vol.affine);
    let mut perm = [0usize; 3];
    for (voxel_axis, &(world_axis, _)) in orientation.iter().enumerate() {
        perm[world_axis] = voxel_axis;
    }
    let shape = vol.shape();

    let mut data = vol.vol.clone().permuted_axes(perm);
    // maps new voxel indices to old ones
    let mut index_map = Matrix4::<f64>::zeros();
    index_map[(3, 3)] = 1.0;
    for (w, &v) in perm.iter().enumerate() {
        if orientation[v].1 {
            data.invert_axis(Axis(w));
            index_map[(v, w)] = -1.0;
            index_map[(v, 3)] = (shape[v] - 1) as f64;
        } else {
            index_map[(v, w)] = 1.0;
        }
    }
    Vol3D::new(
        data.as_standard_layout().into_owned(),
        vol.affine * index_map,
        vol.header.clone(),
    )
}

/// Resample `vol` onto `reference`'s voxel grid.
pub fn resample_onto(vol: &Vol3D, reference: &Vol3D, interpolation: Interpolation) -> Result<Vol3D> {
    let to_world_inv = vol
        .affine
        .try_inverse()
        .ok_or_else(|| SegError::format("volume affine is singular"))?;
    let to_source = to_world_inv * reference.affine;
    let shape = vol.shape();
    let coefficients = match interpolation {
        Interpolation::BSpline => Some(bspline_coefficients(&vol.vol)),
        Interpolation::Nearest => None,
    };

    let [nx, ny, nz] = reference.shape();
    let mut out = Array3::<f32>::zeros((nx, ny, nz));
    for ((i, j, k), value) in out.indexed_iter_mut() {
        let p = to_source * Vector4::new(i as f64, j as f64, k as f64, 1.0);
        let point = [p.x, p.y, p.z];
        let inside = (0..3).all(|d| point[d] >= -0.5 && point[d] <= shape[d] as f64 - 0.5);
        if !inside {
            continue;
        }
        *value = match &coefficients {
            Some(c) => bspline_sample(c, &point) as f32,
            None => nearest_sample(&vol.vol, &point),
        };
    }
    Ok(Vol3D::new(out, reference.affine, vol.header.clone()))
}

const POLE: f64 = -0.267_949_192_431_122_7; // sqrt(3) - 2
const PREFILTER_TOLERANCE: f64 = 1e-10;

/// Cubic B-spline coefficients whose interpolant passes through the samples.
fn bspline_coefficients(data: &Array3<f32>) -> Array3<f64> {
    let mut coefficients = data.mapv(f64::from);
    for axis in 0..3 {
        for mut lane in coefficients.lanes_mut(Axis(axis)) {
            let mut line = lane.to_vec();
            prefilter_line(&mut line);
            for (dst, src) in lane.iter_mut().zip(line) {
                *dst = src;
            }
        }
    }
    coefficients
}

fn prefilter_line(c: &mut [f64]) {
    let n = c.len();
    if n < 2 {
        return;
    }
    let z = POLE;
    for v in c.iter_mut() {
        *v *= 6.0;
    }
    c[0] = causal_init(c, z);
    for k in 1..n {
        c[k] += z * c[k - 1];
    }
    c[n - 1] = (z / (z * z - 1.0)) * (z * c[n - 2] + c[n - 1]);
    for k in (0..n - 1).rev() {
        c[k] = z * (c[k + 1] - c[k]);
    }
}

// mirror-symmetric boundary
fn causal_init(c: &[f64], z: f64) -> f64 {
    let n = c.len();
    let horizon = (PREFILTER_TOLERANCE.ln() / z.abs().ln()).ceil() as usize;
    if horizon < n {
        let mut zn = z;
        let mut sum = c[0];
        for &v in &c[1..horizon] {
            sum += zn * v;
            zn *= z;
        }
        sum
    } else {
        let iz = 1.0 / z;
        let mut zn = z;
        let mut z2n = z.powi(n as i32 - 1);
        let mut sum = c[0] + z2n * c[n - 1];
        z2n = z2n * z2n * iz;
        for &v in &c[1..n - 1] {
            sum += (zn + z2n) * v;
            zn *= z;
            z2n *= iz;
        }
        sum / (1.0 - zn * zn)
    }
}

fn cubic_bspline(x: f64) -> f64 {
    let abs_x = x.abs();
    if abs_x < 1.0 {
        (2.0 / 3.0) - abs_x.powi(2) + 0.5 * abs_x.powi(3)
    } else if abs_x < 2.0 {
        (2.0 - abs_x).powi(3) / 6.0
    } else {
        0.0
    }
}

fn mirror(k: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let k = k.rem_euclid(period);
    if k >= n as isize {
        (period - k) as usize
    } else {
        k as usize
    }
}

fn bspline_sample(c: &Array3<f64>, point: &[f64; 3]) -> f64 {
    let shape = c.shape();
    let mut index = [[0usize; 4]; 3];
    let mut weight = [[0.0; 4]; 3];
    for d in 0..3 {
        let base = point[d].floor() as isize - 1;
        for t in 0..4 {
            let k = base + t as isize;
            weight[d][t] = cubic_bspline(point[d] - k as f64);
            index[d][t] = mirror(k, shape[d]);
        }
    }
    let mut sum = 0.0;
    for a in 0..4 {
        for b in 0..4 {
            let wab = weight[0][a] * weight[1][b];
            for e in 0..4 {
                sum += wab * weight[2][e] * c[[index[0][a], index[1][b], index[2][e]]];
            }
        }
    }
    sum
}

fn nearest_sample(data: &Array3<f32>, point: &[f64; 3]) -> f32 {
    let shape = data.shape();
    let mut index = [0usize; 3];
    for d in 0..3 {
        index[d] = (point[d].round().max(0.0) as usize).min(shape[d] - 1);
    }
    data[index]
}

/// Bounding box `[start, end)` of the non-zero voxels of `mask`.
pub fn mask_bounds(mask: &Array3<f32>) -> Option<([usize; 3], [usize; 3])> {
    let mut start = [usize::MAX; 3];
    let mut end = [0usize; 3];
    let mut any = false;
    for ((i, j, k), &v) in mask.indexed_iter() {
        if v != 0.0 {
            any = true;
            for (d, x) in [i, j, k].into_iter().enumerate() {
                start[d] = start[d].min(x);
                end[d] = end[d].max(x + 1);
            }
        }
    }
    any.then_some((start, end))
}

fn shift_affine(affine: &Matrix4<f64>, offset: [f64; 3]) -> Matrix4<f64> {
    affine * Matrix4::new_translation(&Vector3::new(offset[0], offset[1], offset[2]))
}

/// Extract `extent` voxels starting at `start`.
pub fn crop(vol: &Vol3D, start: [usize; 3], extent: [usize; 3]) -> Vol3D {
    let data = vol
        .vol
        .slice(s![
            start[0]..start[0] + extent[0],
            start[1]..start[1] + extent[1],
            start[2]..start[2] + extent[2]
        ])
        .to_owned();
    let offset = [start[0] as f64, start[1] as f64, start[2] as f64];
    Vol3D::new(data, shift_affine(&vol.affine, offset), vol.header.clone())
}

/// Centre-crop or zero-pad to `target`; odd remainders go to the leading side.
pub fn crop_or_pad(vol: &Vol3D, target: [usize; 3]) -> Vol3D {
    let shape = vol.shape();
    // new index + offset = old index
    let mut offset = [0isize; 3];
    for d in 0..3 {
        let diff = target[d] as isize - shape[d] as isize;
        let leading = (diff.abs() + 1) / 2;
        offset[d] = if diff < 0 { leading } else { -leading };
    }

    let mut out = Array3::<f32>::zeros((target[0], target[1], target[2]));
    for ((i, j, k), value) in out.indexed_iter_mut() {
        let src = [
            i as isize + offset[0],
            j as isize + offset[1],
            k as isize + offset[2],
        ];
        if (0..3).all(|d| src[d] >= 0 && (src[d] as usize) < shape[d]) {
            *value = vol.vol[[src[0] as usize, src[1] as usize, src[2] as usize]];
        }
    }
    let shift = [offset[0] as f64, offset[1] as f64, offset[2] as f64];
    Vol3D::new(out, shift_affine(&vol.affine, shift), vol.header.clone())
}

/// Zero mean, unit (sample) standard deviation over all voxels.
pub fn z_score(data: &Array3<f32>) -> Result<Array3<f32>> {
    let n = data.len();
    if n < 2 {
        return Err(SegError::format("cannot z-score fewer than two voxels"));
    }
    let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = data
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / (n - 1) as f64;
    let std = var.sqrt();
    if std == 0.0 {
        return Err(SegError::format("cannot z-score a constant volume"));
    }
    Ok(data.mapv(|v| ((v as f64 - mean) / std) as f32))
}

/// Linearly interpolated percentile of sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Piecewise-linear mapping of the volume's percentiles onto `landmarks`.
pub fn histogram_standardize(data: &Array3<f32>, landmarks: &[f64]) -> Result<Array3<f32>> {
    if landmarks.len() != PERCENTILES.len() {
        return Err(SegError::format(format!(
            "expected {} landmarks, got {}",
            PERCENTILES.len(),
            landmarks.len()
        )));
    }
    if data.is_empty() {
        return Err(SegError::format("cannot standardize an empty volume"));
    }
    let mut sorted: Vec<f64> = data.iter().map(|&v| v as f64).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let values: Vec<f64> = PERCENTILES.iter().map(|&p| percentile(&sorted, p)).collect();

    let mapping: Vec<f64> = RANGE_TO_USE.iter().map(|&i| landmarks[i]).collect();
    let perc: Vec<f64> = RANGE_TO_USE.iter().map(|&i| values[i]).collect();
    let segments = RANGE_TO_USE.len() - 1;
    let mut slope = vec![0.0; segments];
    let mut intercept = vec![0.0; segments];
    for s in 0..segments {
        let mut run = perc[s + 1] - perc[s];
        if run < EPSILON {
            run = EPSILON;
        }
        slope[s] = (mapping[s + 1] - mapping[s]) / run;
        intercept[s] = mapping[s] - slope[s] * perc[s];
    }

    let inner = &perc[1..perc.len() - 1];
    Ok(data.mapv(|v| {
        let x = v as f64;
        let bin = inner.partition_point(|&edge| edge <= x);
        (slope[bin] * x + intercept[bin]) as f32
    }))
}
