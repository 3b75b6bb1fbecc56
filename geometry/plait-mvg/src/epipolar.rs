#![allow(non_snake_case)]

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Point2, Vector3};

use plait_types::Pose;

use crate::{MvgError, Result};

/// Points translated to zero centroid and scaled to unit mean absolute
/// deviation per axis, together with the similarity `T` that produced them
/// (`p_norm = T · p_homog`).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPoints {
    pub points: Vec<Point2<f64>>,
    pub transform: Matrix3<f64>,
}

/// Hartley normalization of a pixel point set.
///
/// Fails when the set is empty or collapses onto an axis-parallel line
/// (zero deviation along one axis), which would make the scale infinite.
pub fn normalize_points(points: &[Point2<f64>]) -> Result<NormalizedPoints> {
    if points.is_empty() {
        return Err(MvgError::NotEnoughPoints);
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dev_x = points.iter().map(|p| (p.x - mean_x).abs()).sum::<f64>() / n;
    let mean_dev_y = points.iter().map(|p| (p.y - mean_y).abs()).sum::<f64>() / n;
    if mean_dev_x < 1e-12 || mean_dev_y < 1e-12 {
        return Err(MvgError::DegenerateGeometry);
    }
    let sx = 1.0 / mean_dev_x;
    let sy = 1.0 / mean_dev_y;

    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * sx, (p.y - mean_y) * sy))
        .collect();
    let transform = Matrix3::new(
        sx, 0.0, -mean_x * sx, //
        0.0, sy, -mean_y * sy, //
        0.0, 0.0, 1.0,
    );
    Ok(NormalizedPoints {
        points: normalized,
        transform,
    })
}

/// Smallest right singular vector of the DLT design matrix, via the
/// 9×9 normal matrix so the null vector is available even for minimal
/// sample sizes.
fn smallest_right_singular_vector(a: &DMatrix<f64>) -> Result<[f64; 9]> {
    let ata = a.transpose() * a;
    let svd = ata.svd(false, true);
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let row = vt.row(8);
    let mut out = [0.0; 9];
    for (o, v) in out.iter_mut().zip(row.iter()) {
        *o = *v;
    }
    Ok(out)
}

/// DLT homography `H21` such that `p2 ~ H21 · p1`, from at least four
/// correspondences (two rows each).
pub fn compute_h21(p1: &[Point2<f64>], p2: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    let n = p1.len();
    if n < 4 || p2.len() != n {
        return Err(MvgError::NotEnoughPoints);
    }
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (u1, v1) = (p1[i].x, p1[i].y);
        let (u2, v2) = (p2[i].x, p2[i].y);
        let r = 2 * i;
        a[(r, 3)] = -u1;
        a[(r, 4)] = -v1;
        a[(r, 5)] = -1.0;
        a[(r, 6)] = v2 * u1;
        a[(r, 7)] = v2 * v1;
        a[(r, 8)] = v2;

        a[(r + 1, 0)] = u1;
        a[(r + 1, 1)] = v1;
        a[(r + 1, 2)] = 1.0;
        a[(r + 1, 6)] = -u2 * u1;
        a[(r + 1, 7)] = -u2 * v1;
        a[(r + 1, 8)] = -u2;
    }
    let h = smallest_right_singular_vector(&a)?;
    Ok(Matrix3::from_row_slice(&h))
}

/// Eight-point fundamental matrix `F21` such that `p2ᵀ · F21 · p1 = 0`,
/// with the rank-2 constraint enforced by zeroing the smallest singular
/// value.
pub fn compute_f21(p1: &[Point2<f64>], p2: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    let n = p1.len();
    if n < 8 || p2.len() != n {
        return Err(MvgError::NotEnoughPoints);
    }
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for i in 0..n {
        let (u1, v1) = (p1[i].x, p1[i].y);
        let (u2, v2) = (p2[i].x, p2[i].y);
        a[(i, 0)] = u2 * u1;
        a[(i, 1)] = u2 * v1;
        a[(i, 2)] = u2;
        a[(i, 3)] = v2 * u1;
        a[(i, 4)] = v2 * v1;
        a[(i, 5)] = v2;
        a[(i, 6)] = u1;
        a[(i, 7)] = v1;
        a[(i, 8)] = 1.0;
    }
    let f = smallest_right_singular_vector(&a)?;
    let f_pre = Matrix3::from_row_slice(&f);

    let svd = f_pre.svd(true, true);
    let u = svd.u.ok_or(MvgError::SvdFailed)?;
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let s = svd.singular_values;
    let d = Matrix3::from_diagonal(&Vector3::new(s[0], s[1], 0.0));
    Ok(u * d * vt)
}

/// Decompose an essential matrix into the two rotation candidates and the
/// unit translation direction. `det(R) = +1` is enforced by sign flip.
pub fn decompose_essential(e: &Matrix3<f64>) -> Result<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let u = svd.u.ok_or(MvgError::SvdFailed)?;
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;

    let mut t: Vector3<f64> = u.column(2).into_owned();
    let norm = t.norm();
    if norm < 1e-12 {
        return Err(MvgError::DegenerateGeometry);
    }
    t /= norm;

    let w = Matrix3::new(
        0.0, -1.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0,
    );

    let mut r1 = u * w * vt;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * vt;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }
    Ok((r1, r2, t))
}

/// One of the eight `(R, t, n)` solutions of a homography decomposition.
#[derive(Debug, Clone)]
pub struct HomographyHypothesis {
    pub rotation: Matrix3<f64>,
    /// Unit translation direction.
    pub translation: Vector3<f64>,
    /// Plane normal, flipped so `n_z >= 0`.
    pub normal: Vector3<f64>,
}

/// Faugeras decomposition of a homography into eight motion hypotheses.
///
/// The homography is preconditioned to `A = K⁻¹ H K`; near-equal singular
/// values of `A` mean the motion is pure rotation or the estimate is
/// degenerate, and the decomposition fails.
pub fn decompose_homography(
    h21: &Matrix3<f64>,
    k: &Matrix3<f64>,
) -> Result<Vec<HomographyHypothesis>> {
    let inv_k = k.try_inverse().ok_or(MvgError::DegenerateGeometry)?;
    let a = inv_k * h21 * k;

    let svd = a.svd(true, true);
    let u = svd.u.ok_or(MvgError::SvdFailed)?;
    let vt = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let v = vt.transpose();
    let s = u.determinant() * vt.determinant();

    let d1 = svd.singular_values[0];
    let d2 = svd.singular_values[1];
    let d3 = svd.singular_values[2];
    if d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
        return Err(MvgError::DegenerateGeometry);
    }

    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1 = [aux1, aux1, -aux1, -aux1];
    let x3 = [aux3, -aux3, aux3, -aux3];

    let mut hypotheses = Vec::with_capacity(8);

    // case d' = d2
    let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    let stheta = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];

    for i in 0..4 {
        let rp = Matrix3::new(
            ctheta, 0.0, -stheta[i], //
            0.0, 1.0, 0.0, //
            stheta[i], 0.0, ctheta,
        );
        let rotation = s * u * rp * vt;

        let tp = Vector3::new(x1[i], 0.0, -x3[i]) * (d1 - d3);
        let t = u * tp;
        let translation = t / t.norm();

        let mut normal = v * Vector3::new(x1[i], 0.0, x3[i]);
        if normal.z < 0.0 {
            normal = -normal;
        }
        hypotheses.push(HomographyHypothesis {
            rotation,
            translation,
            normal,
        });
    }

    // case d' = -d2
    let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    let sphi = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];

    for i in 0..4 {
        let rp = Matrix3::new(
            cphi, 0.0, sphi[i], //
            0.0, -1.0, 0.0, //
            sphi[i], 0.0, -cphi,
        );
        let rotation = s * u * rp * vt;

        let tp = Vector3::new(x1[i], 0.0, x3[i]) * (d1 + d3);
        let t = u * tp;
        let translation = t / t.norm();

        let mut normal = v * Vector3::new(x1[i], 0.0, x3[i]);
        if normal.z < 0.0 {
            normal = -normal;
        }
        hypotheses.push(HomographyHypothesis {
            rotation,
            translation,
            normal,
        });
    }

    Ok(hypotheses)
}

/// The skew-symmetric matrix `[v]×` with `[v]× w = v × w`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Compose the 3×4 projection matrix `K [R | t]`.
pub fn projection_matrix(k: &Matrix3<f64>, pose: &Pose) -> Matrix3x4<f64> {
    let mut rt = Matrix3x4::<f64>::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(&pose.rotation);
    rt.column_mut(3).copy_from(&pose.translation);
    k * rt
}

/// Fundamental matrix `F12` between two posed cameras such that
/// `x1ᵀ · F12 · x2 = 0` for corresponding pixels.
pub fn fundamental_from_poses(
    pose1: &Pose,
    pose2: &Pose,
    k1: &Matrix3<f64>,
    k2: &Matrix3<f64>,
) -> Result<Matrix3<f64>> {
    let r12 = pose1.rotation * pose2.rotation.transpose();
    let t12 = -r12 * pose2.translation + pose1.translation;

    let k1_inv_t = k1
        .try_inverse()
        .ok_or(MvgError::DegenerateGeometry)?
        .transpose();
    let k2_inv = k2.try_inverse().ok_or(MvgError::DegenerateGeometry)?;
    Ok(k1_inv_t * skew_symmetric(&t12) * r12 * k2_inv)
}
