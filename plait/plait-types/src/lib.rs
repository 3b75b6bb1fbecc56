//! Shared leaf types for the plait monocular SLAM core.
//!
//! Everything here is plain data: image features, camera models, scale
//! pyramids, descriptors, and the parameter blocks consumed by the
//! initializer and the local mapper. No locking, no I/O.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// An undistorted point feature detected in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointFeature {
    /// Undistorted pixel coordinates.
    pub pt: Point2<f64>,
    /// Pyramid level the feature was extracted at.
    pub octave: usize,
}

impl PointFeature {
    pub fn new(x: f64, y: f64, octave: usize) -> Self {
        PointFeature {
            pt: Point2::new(x, y),
            octave,
        }
    }
}

/// A line segment feature detected in one frame.
///
/// The implicit coefficients `(a, b, c)` satisfy `a*x + b*y + c = 0` for
/// points on the infinite line through the segment and are normalized so
/// that `a² + b² = 1`, which makes `a*x + b*y + c` a signed pixel distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFeature {
    pub start: Point2<f64>,
    pub end: Point2<f64>,
    /// Normalized implicit line coefficients.
    pub coeffs: Vector3<f64>,
    /// Pyramid level the segment was extracted at.
    pub octave: usize,
    /// Segment orientation in radians, in `(-π, π]`.
    pub angle: f64,
}

impl LineFeature {
    pub fn new(start: Point2<f64>, end: Point2<f64>, octave: usize) -> Self {
        let sh = Vector3::new(start.x, start.y, 1.0);
        let eh = Vector3::new(end.x, end.y, 1.0);
        let l = sh.cross(&eh);
        let norm = (l.x * l.x + l.y * l.y).sqrt();
        let coeffs = if norm > 0.0 { l / norm } else { l };
        let angle = (end.y - start.y).atan2(end.x - start.x);
        LineFeature {
            start,
            end,
            coeffs,
            octave,
            angle,
        }
    }

    /// Segment length in pixels.
    pub fn length(&self) -> f64 {
        (self.end - self.start).norm()
    }
}

/// Positional match vector: entry `i` holds the index in the other frame
/// matched to feature `i` of this frame, or `None` for no match.
pub type MatchIndices = Vec<Option<usize>>;

/// Pinhole camera intrinsics for undistorted pixel coordinates.
///
/// Immutable per camera; the inverse focal lengths are cached because the
/// back-projection path runs once per feature per candidate model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub inv_fx: f64,
    pub inv_fy: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        CameraIntrinsics {
            fx,
            fy,
            cx,
            cy,
            inv_fx: 1.0 / fx,
            inv_fy: 1.0 / fy,
        }
    }

    /// The 3×3 calibration matrix K.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Project a point in the camera frame to undistorted pixels.
    pub fn project(&self, p: &Point3<f64>) -> Point2<f64> {
        let inv_z = 1.0 / p.z;
        Point2::new(
            self.fx * p.x * inv_z + self.cx,
            self.fy * p.y * inv_z + self.cy,
        )
    }

    /// Back-project a pixel to a unit-depth ray in the camera frame.
    pub fn backproject(&self, p: &Point2<f64>) -> Vector3<f64> {
        Vector3::new((p.x - self.cx) * self.inv_fx, (p.y - self.cy) * self.inv_fy, 1.0)
    }
}

/// A rigid world→camera transform: `x_cam = R * x_world + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Pose {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Camera center in world coordinates, `-Rᵀt`.
    pub fn camera_center(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.transpose() * self.translation))
    }

    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * p.coords + self.translation)
    }

    pub fn inverse(&self) -> Pose {
        let rt = self.rotation.transpose();
        Pose {
            rotation: rt,
            translation: -(rt * self.translation),
        }
    }
}

/// Per-level scale factors and measurement variances of a feature pyramid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalePyramid {
    pub scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(n_levels: usize, scale_factor: f64) -> Self {
        let mut scale_factors = Vec::with_capacity(n_levels);
        let mut level_sigma2 = Vec::with_capacity(n_levels);
        let mut s = 1.0;
        for _ in 0..n_levels {
            scale_factors.push(s);
            level_sigma2.push(s * s);
            s *= scale_factor;
        }
        let inv_level_sigma2 = level_sigma2.iter().map(|v| 1.0 / v).collect();
        ScalePyramid {
            scale_factor,
            scale_factors,
            level_sigma2,
            inv_level_sigma2,
        }
    }

    pub fn n_levels(&self) -> usize {
        self.scale_factors.len()
    }

    /// Measurement variance at a pyramid level, clamped to the top level.
    pub fn sigma2(&self, octave: usize) -> f64 {
        let i = octave.min(self.level_sigma2.len() - 1);
        self.level_sigma2[i]
    }

    pub fn scale(&self, octave: usize) -> f64 {
        let i = octave.min(self.scale_factors.len() - 1);
        self.scale_factors[i]
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        ScalePyramid::new(8, 1.2)
    }
}

/// A 256-bit binary feature descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    /// Hamming distance to another descriptor.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor([0u8; 32])
    }
}

/// Sparse bag-of-words vector: visual word id → weight.
pub type BowVector = BTreeMap<u32, f32>;

/// The feature content of one frame as seen by the core: undistorted
/// keypoints, line segments with their implicit equations, and the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFeatures {
    pub keypoints: Vec<PointFeature>,
    pub keylines: Vec<LineFeature>,
    pub camera: CameraIntrinsics,
}

/// Tuning constants of the two-view initializer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializerParams {
    /// Measurement standard deviation in pixels.
    pub sigma: f64,
    /// Number of RANSAC iterations (and precomputed sample sets).
    pub max_iterations: usize,
    /// Minimum parallax of the winning hypothesis, degrees (inclusive).
    pub min_parallax_deg: f64,
    /// Minimum number of cheirality-valid triangulations.
    pub min_triangulated: usize,
}

impl Default for InitializerParams {
    fn default() -> Self {
        InitializerParams {
            sigma: 1.0,
            max_iterations: 200,
            min_parallax_deg: 1.0,
            min_triangulated: 50,
        }
    }
}

/// Tuning constants of the local mapping loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingParams {
    /// Covisible neighbors consulted when triangulating new points.
    pub point_creation_neighbors: usize,
    /// Covisible neighbors consulted when triangulating new lines.
    pub line_creation_neighbors: usize,
    /// One-hop neighbors used as fusion targets.
    pub fuse_neighbors: usize,
    /// Two-hop neighbors per one-hop neighbor used as fusion targets.
    pub fuse_second_neighbors: usize,
    /// Minimum found/visible ratio before a probationary element is culled.
    pub min_found_ratio: f64,
    /// Observation count at or below which an aged probationary element is
    /// culled (2 for monocular input).
    pub cull_obs_threshold: usize,
    /// Minimum shared observations for a covisibility edge.
    pub covisibility_weight_threshold: usize,
    /// Fraction of redundant points at which a keyframe is culled.
    pub redundant_fraction: f64,
    /// Other observers (at equal-or-finer scale) that make a point redundant.
    pub redundant_observers: usize,
    /// Minimum baseline / median scene depth for triangulation.
    pub min_baseline_depth_ratio: f64,
}

impl Default for MappingParams {
    fn default() -> Self {
        MappingParams {
            point_creation_neighbors: 20,
            line_creation_neighbors: 10,
            fuse_neighbors: 20,
            fuse_second_neighbors: 5,
            min_found_ratio: 0.25,
            cull_obs_threshold: 2,
            covisibility_weight_threshold: 15,
            redundant_fraction: 0.9,
            redundant_observers: 3,
            min_baseline_depth_ratio: 0.01,
        }
    }
}
