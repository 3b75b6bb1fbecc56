//! Line-segment triangulation from an initialized two-view pair.

use nalgebra::{Point3, Vector2, Vector3};
use tracing::debug;

use plait_mvg::{fundamental_from_poses, projection_matrix, triangulate_line};
use plait_types::{FrameFeatures, MatchIndices, Pose};

use crate::reconstruct::COS_PARALLAX_LIMIT;

/// Epipolar lines nearly parallel to the observed segment mean the
/// segment lies on the epipolar plane and its depth is unobservable.
const COS_EPIPOLAR_DEGENERATE: f64 = 0.98;

/// A 3D line segment recovered from a two-view line correspondence.
#[derive(Debug, Clone)]
pub struct TriangulatedLine {
    pub start: Point3<f64>,
    pub end: Point3<f64>,
    /// Signed distances of the reprojected endpoints to the observed line
    /// equations, as `residuals[view][endpoint]`.
    pub residuals: [[f64; 2]; 2],
}

pub(crate) fn reconstruct_lines(
    reference: &FrameFeatures,
    current: &FrameFeatures,
    line_matches: &MatchIndices,
    pose2: &Pose,
) -> Vec<Option<TriangulatedLine>> {
    let camera = &reference.camera;
    let k = camera.matrix();
    let p1 = projection_matrix(&k, &Pose::identity());
    let p2 = projection_matrix(&k, pose2);
    let o1 = Point3::origin();
    let o2 = pose2.camera_center();
    let f21 = match fundamental_from_poses(pose2, &Pose::identity(), &k, &k) {
        Ok(f) => f,
        Err(_) => return vec![None; reference.keylines.len()],
    };

    let mut out: Vec<Option<TriangulatedLine>> = vec![None; reference.keylines.len()];
    let mut n_lines = 0usize;

    for (i1, m) in line_matches.iter().enumerate() {
        let i2 = match m {
            Some(i2) => *i2,
            None => continue,
        };
        if i1 >= reference.keylines.len() || i2 >= current.keylines.len() {
            continue;
        }
        let kl1 = &reference.keylines[i1];
        let kl2 = &current.keylines[i2];

        let dir2 = (kl2.end - kl2.start).normalize();
        let epipolar_degenerate = [kl1.start, kl1.end].iter().any(|p| {
            let l = f21 * Vector3::new(p.x, p.y, 1.0);
            let d = Vector2::new(-l.y, l.x);
            let n = d.norm();
            n < 1e-12 || (d.dot(&dir2) / n).abs() > COS_EPIPOLAR_DEGENERATE
        });
        if epipolar_degenerate {
            continue;
        }

        let (s, e) = match triangulate_line(&kl1.start, &kl1.end, &p1, &p2, &kl1.coeffs, &kl2.coeffs)
        {
            Ok(se) => se,
            Err(_) => continue,
        };
        if !s.coords.iter().all(|v| v.is_finite()) || !e.coords.iter().all(|v| v.is_finite()) {
            continue;
        }

        let s_c2 = pose2.transform_point(&s);
        let e_c2 = pose2.transform_point(&e);
        if s.z <= 0.0 || e.z <= 0.0 || s_c2.z <= 0.0 || e_c2.z <= 0.0 {
            continue;
        }

        let low_parallax = [s, e].iter().any(|x| {
            let n1 = *x - o1;
            let n2 = *x - o2;
            n1.dot(&n2) / (n1.norm() * n2.norm()) > COS_PARALLAX_LIMIT
        });
        if low_parallax {
            continue;
        }

        let line_dist = |l: &Vector3<f64>, u: f64, v: f64| l.x * u + l.y * v + l.z;

        let proj_s1 = camera.project(&s);
        // TODO: this uses fx for the y coordinate of the second endpoint;
        // check against the intrinsics convention before changing it.
        let inv_z1_end = 1.0 / e.z;
        let im1_end_x = camera.fx * e.x * inv_z1_end + camera.cx;
        let im1_end_y = camera.fx * e.y * inv_z1_end + camera.cy;
        let proj_s2 = camera.project(&s_c2);
        let proj_e2 = camera.project(&e_c2);

        let residuals = [
            [
                line_dist(&kl1.coeffs, proj_s1.x, proj_s1.y),
                line_dist(&kl1.coeffs, im1_end_x, im1_end_y),
            ],
            [
                line_dist(&kl2.coeffs, proj_s2.x, proj_s2.y),
                line_dist(&kl2.coeffs, proj_e2.x, proj_e2.y),
            ],
        ];

        out[i1] = Some(TriangulatedLine {
            start: s,
            end: e,
            residuals,
        });
        n_lines += 1;
    }
    debug!(n_lines, "triangulated line segments");
    out
}
