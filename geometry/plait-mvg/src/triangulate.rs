#![allow(non_snake_case)]

use nalgebra::{Matrix3x4, Matrix4, Point2, Point3, RowVector4, Vector3, Vector4};

use crate::{MvgError, Result};

fn solve_homogeneous_4x4(a: Matrix4<f64>) -> Result<Point3<f64>> {
    let svd = a.svd(false, true);
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let x = vt.row(3);
    // Homogeneous normalization. A vanishing w yields non-finite
    // coordinates, which callers treat as a rejected triangulation.
    let w = x[3];
    Ok(Point3::new(x[0] / w, x[1] / w, x[2] / w))
}

/// DLT triangulation of a point seen in two views.
///
/// `x1`/`x2` are pixel (or normalized-plane) observations consistent with
/// the projection matrices `P1`/`P2`.
pub fn triangulate_point(
    x1: &Point2<f64>,
    x2: &Point2<f64>,
    P1: &Matrix3x4<f64>,
    P2: &Matrix3x4<f64>,
) -> Result<Point3<f64>> {
    let a = Matrix4::from_rows(&[
        x1.x * P1.row(2) - P1.row(0),
        x1.y * P1.row(2) - P1.row(1),
        x2.x * P2.row(2) - P2.row(0),
        x2.y * P2.row(2) - P2.row(1),
    ]);
    solve_homogeneous_4x4(a)
}

/// The back-projection plane of an image line: the plane through the
/// camera center containing all 3D points that project onto the line
/// `ℓ` under `P`, as the 4-vector `Pᵀ ℓ`.
pub fn backprojection_plane(l: &Vector3<f64>, P: &Matrix3x4<f64>) -> Vector4<f64> {
    P.transpose() * l
}

/// Triangulate one endpoint of a line segment.
///
/// The endpoint `x` (observed under `P_pt`) contributes its two DLT rows;
/// `plane_a` and `plane_b` are back-projection planes of the line in two
/// views. The solution is the 3D point on both planes that projects onto
/// the observed endpoint.
pub fn triangulate_line_endpoint(
    x: &Point2<f64>,
    P_pt: &Matrix3x4<f64>,
    plane_a: &Vector4<f64>,
    plane_b: &Vector4<f64>,
) -> Result<Point3<f64>> {
    let a = Matrix4::from_rows(&[
        RowVector4::new(plane_a.x, plane_a.y, plane_a.z, plane_a.w),
        RowVector4::new(plane_b.x, plane_b.y, plane_b.z, plane_b.w),
        x.x * P_pt.row(2) - P_pt.row(0),
        x.y * P_pt.row(2) - P_pt.row(1),
    ]);
    solve_homogeneous_4x4(a)
}

/// Triangulate a 3D line segment from a two-view line correspondence.
///
/// Both endpoints of the segment observed in view 1 are lifted to 3D using
/// the back-projection planes of the line equations `l1` and `l2`.
pub fn triangulate_line(
    start1: &Point2<f64>,
    end1: &Point2<f64>,
    P1: &Matrix3x4<f64>,
    P2: &Matrix3x4<f64>,
    l1: &Vector3<f64>,
    l2: &Vector3<f64>,
) -> Result<(Point3<f64>, Point3<f64>)> {
    let plane1 = backprojection_plane(l1, P1);
    let plane2 = backprojection_plane(l2, P2);
    let s = triangulate_line_endpoint(start1, P1, &plane1, &plane2)?;
    let e = triangulate_line_endpoint(end1, P1, &plane1, &plane2)?;
    Ok((s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection_matrix;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Rotation3};
    use plait_types::Pose;

    fn test_k() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn project(P: &Matrix3x4<f64>, p: &Point3<f64>) -> Point2<f64> {
        let uv = P * Vector4::new(p.x, p.y, p.z, 1.0);
        Point2::new(uv.x / uv.z, uv.y / uv.z)
    }

    #[test]
    fn point_triangulation_is_exact_without_noise() {
        let k = test_k();
        let P1 = projection_matrix(&k, &Pose::identity());
        let pose2 = Pose::new(
            *Rotation3::from_euler_angles(0.0, -0.04, 0.01).matrix(),
            Vector3::new(0.6, -0.02, 0.1),
        );
        let P2 = projection_matrix(&k, &pose2);

        for i in 0..15 {
            let p = Point3::new(
                -1.0 + 0.14 * i as f64,
                0.8 - 0.1 * ((i * 3) % 7) as f64,
                5.0 + 0.25 * ((i * 5) % 4) as f64,
            );
            let x1 = project(&P1, &p);
            let x2 = project(&P2, &p);
            let xr = triangulate_point(&x1, &x2, &P1, &P2).unwrap();
            assert_relative_eq!((xr - p).norm(), 0.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn line_triangulation_recovers_segment_endpoints() {
        let k = test_k();
        let P1 = projection_matrix(&k, &Pose::identity());
        let pose2 = Pose::new(
            *Rotation3::from_euler_angles(0.02, 0.06, 0.0).matrix(),
            Vector3::new(-0.5, 0.05, 0.0),
        );
        let P2 = projection_matrix(&k, &pose2);

        let s3 = Point3::new(-0.4, 0.3, 4.0);
        let e3 = Point3::new(0.7, -0.2, 5.5);

        let s1 = project(&P1, &s3);
        let e1 = project(&P1, &e3);
        let s2 = project(&P2, &s3);
        let e2 = project(&P2, &e3);

        let line_eq = |a: &Point2<f64>, b: &Point2<f64>| -> Vector3<f64> {
            let l = Vector3::new(a.x, a.y, 1.0).cross(&Vector3::new(b.x, b.y, 1.0));
            l / (l.x * l.x + l.y * l.y).sqrt()
        };
        let l1 = line_eq(&s1, &e1);
        let l2 = line_eq(&s2, &e2);

        let (sr, er) = triangulate_line(&s1, &e1, &P1, &P2, &l1, &l2).unwrap();
        assert_relative_eq!((sr - s3).norm(), 0.0, epsilon = 1e-7);
        assert_relative_eq!((er - e3).norm(), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn parallel_view_line_triangulation_is_nonfinite_not_panic() {
        // both cameras on the line's own back-projection plane: the two
        // planes coincide and the system loses rank
        let k = test_k();
        let P1 = projection_matrix(&k, &Pose::identity());
        let pose2 = Pose::new(Matrix3::identity(), Vector3::new(1.0, 0.0, 0.0));
        let P2 = projection_matrix(&k, &pose2);

        // a horizontal 3D line along the baseline direction, through the optical axis
        let s3 = Point3::new(-1.0, 0.0, 5.0);
        let e3 = Point3::new(1.0, 0.0, 5.0);
        let s1 = project(&P1, &s3);
        let e1 = project(&P1, &e3);
        let s2 = project(&P2, &s3);
        let e2 = project(&P2, &e3);
        let line_eq = |a: &Point2<f64>, b: &Point2<f64>| -> Vector3<f64> {
            let l = Vector3::new(a.x, a.y, 1.0).cross(&Vector3::new(b.x, b.y, 1.0));
            l / (l.x * l.x + l.y * l.y).sqrt()
        };
        // the rank-deficient system must fail soft: an Err or a sentinel
        // value, never a panic
        let _ = triangulate_line(
            &s1,
            &e1,
            &P1,
            &P2,
            &line_eq(&s1, &e1),
            &line_eq(&s2, &e2),
        );
    }
}
