#![allow(non_snake_case)]

use nalgebra::{Matrix3, Point2};

/// Result of scoring one candidate model over a match set: per-match
/// inlier flags and the accumulated robust score.
#[derive(Debug, Clone)]
pub struct ModelScore {
    pub score: f64,
    pub inliers: Vec<bool>,
}

// chi-square 95% thresholds at 2 and 1 degrees of freedom
const CHI2_2DOF: f64 = 5.991;
const CHI2_1DOF: f64 = 3.841;

/// Symmetric-transfer scoring of a homography.
///
/// Each match is reprojected in both directions; a direction passing the
/// two-DoF chi-square gate adds `5.991 − χ²` to the score. A match is an
/// inlier only when both directions pass, but a passing direction still
/// contributes score when the other fails.
pub fn check_homography(
    H21: &Matrix3<f64>,
    H12: &Matrix3<f64>,
    pairs: &[(Point2<f64>, Point2<f64>)],
    sigma: f64,
) -> ModelScore {
    let th = CHI2_2DOF;
    let inv_sigma2 = 1.0 / (sigma * sigma);

    let mut score = 0.0;
    let mut inliers = vec![false; pairs.len()];

    for (i, (p1, p2)) in pairs.iter().enumerate() {
        let mut ok = true;

        // reproject image-2 point into image 1
        let w = H12[(2, 0)] * p2.x + H12[(2, 1)] * p2.y + H12[(2, 2)];
        let u = (H12[(0, 0)] * p2.x + H12[(0, 1)] * p2.y + H12[(0, 2)]) / w;
        let v = (H12[(1, 0)] * p2.x + H12[(1, 1)] * p2.y + H12[(1, 2)]) / w;
        let chi1 = ((p1.x - u).powi(2) + (p1.y - v).powi(2)) * inv_sigma2;
        if !chi1.is_finite() || chi1 > th {
            ok = false;
        } else {
            score += th - chi1;
        }

        // reproject image-1 point into image 2
        let w = H21[(2, 0)] * p1.x + H21[(2, 1)] * p1.y + H21[(2, 2)];
        let u = (H21[(0, 0)] * p1.x + H21[(0, 1)] * p1.y + H21[(0, 2)]) / w;
        let v = (H21[(1, 0)] * p1.x + H21[(1, 1)] * p1.y + H21[(1, 2)]) / w;
        let chi2 = ((p2.x - u).powi(2) + (p2.y - v).powi(2)) * inv_sigma2;
        if !chi2.is_finite() || chi2 > th {
            ok = false;
        } else {
            score += th - chi2;
        }

        inliers[i] = ok;
    }

    ModelScore { score, inliers }
}

/// Epipolar-distance scoring of a fundamental matrix.
///
/// The inlier gate is the one-DoF chi-square threshold 3.841; the score
/// constant stays 5.991 so fundamental and homography scores are
/// comparable in the model-selection ratio.
pub fn check_fundamental(
    F21: &Matrix3<f64>,
    pairs: &[(Point2<f64>, Point2<f64>)],
    sigma: f64,
) -> ModelScore {
    let th = CHI2_1DOF;
    let th_score = CHI2_2DOF;
    let inv_sigma2 = 1.0 / (sigma * sigma);

    let mut score = 0.0;
    let mut inliers = vec![false; pairs.len()];

    for (i, (p1, p2)) in pairs.iter().enumerate() {
        let mut ok = true;

        // epipolar line of p1 in image 2
        let a2 = F21[(0, 0)] * p1.x + F21[(0, 1)] * p1.y + F21[(0, 2)];
        let b2 = F21[(1, 0)] * p1.x + F21[(1, 1)] * p1.y + F21[(1, 2)];
        let c2 = F21[(2, 0)] * p1.x + F21[(2, 1)] * p1.y + F21[(2, 2)];
        let num2 = a2 * p2.x + b2 * p2.y + c2;
        let chi1 = num2 * num2 / (a2 * a2 + b2 * b2) * inv_sigma2;
        if !chi1.is_finite() || chi1 > th {
            ok = false;
        } else {
            score += th_score - chi1;
        }

        // epipolar line of p2 in image 1
        let a1 = F21[(0, 0)] * p2.x + F21[(1, 0)] * p2.y + F21[(2, 0)];
        let b1 = F21[(0, 1)] * p2.x + F21[(1, 1)] * p2.y + F21[(2, 1)];
        let c1 = F21[(0, 2)] * p2.x + F21[(1, 2)] * p2.y + F21[(2, 2)];
        let num1 = a1 * p1.x + b1 * p1.y + c1;
        let chi2 = num1 * num1 / (a1 * a1 + b1 * b1) * inv_sigma2;
        if !chi2.is_finite() || chi2 > th {
            ok = false;
        } else {
            score += th_score - chi2;
        }

        inliers[i] = ok;
    }

    ModelScore { score, inliers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn exact_h() -> Matrix3<f64> {
        Matrix3::new(1.05, 0.01, 2.0, -0.02, 0.98, -1.0, 1e-5, 2e-5, 1.0)
    }

    fn pairs_under_h(h: &Matrix3<f64>, n: usize) -> Vec<(Point2<f64>, Point2<f64>)> {
        (0..n)
            .map(|i| {
                let p1 = Point2::new(30.0 + 17.0 * (i % 8) as f64, 25.0 + 23.0 * (i / 8) as f64);
                let q = h * Vector3::new(p1.x, p1.y, 1.0);
                (p1, Point2::new(q.x / q.z, q.y / q.z))
            })
            .collect()
    }

    #[test]
    fn exact_homography_scores_maximal() {
        let h21 = exact_h();
        let h12 = h21.try_inverse().unwrap();
        let pairs = pairs_under_h(&h21, 32);
        let ms = check_homography(&h21, &h12, &pairs, 1.0);
        assert!(ms.inliers.iter().all(|&b| b));
        assert_relative_eq!(ms.score, 2.0 * CHI2_2DOF * 32.0, epsilon = 1e-6);
    }

    #[test]
    fn homography_scoring_symmetric_under_frame_swap() {
        let h21 = exact_h();
        let h12 = h21.try_inverse().unwrap();
        let mut pairs = pairs_under_h(&h21, 24);
        // perturb a few matches into outliers
        pairs[3].1.x += 40.0;
        pairs[11].0.y -= 25.0;
        let fwd = check_homography(&h21, &h12, &pairs, 1.0);
        let swapped: Vec<_> = pairs.iter().map(|&(a, b)| (b, a)).collect();
        let rev = check_homography(&h12, &h21, &swapped, 1.0);
        assert_eq!(fwd.inliers, rev.inliers);
        assert_relative_eq!(fwd.score, rev.score, epsilon = 1e-9);
    }

    #[test]
    fn outlier_direction_contributes_zero_but_other_direction_scores() {
        let h21 = Matrix3::identity();
        let h12 = Matrix3::identity();
        // p2 displaced: both directions fail the gate equally under
        // identity, so this match is an outlier with zero contribution
        let far = vec![(Point2::new(10.0, 10.0), Point2::new(100.0, 10.0))];
        let ms = check_homography(&h21, &h12, &far, 1.0);
        assert!(!ms.inliers[0]);
        assert_relative_eq!(ms.score, 0.0);

        // displaced by just over the 1-DoF gate but under the 2-DoF gate:
        // an F-scored match keeps score from the passing direction rules
        let h21 = Matrix3::identity();
        let near = vec![(Point2::new(10.0, 10.0), Point2::new(10.0, 12.1))];
        let ms = check_homography(&h21, &h21, &near, 1.0);
        // χ² = 2.1² = 4.41 < 5.991 in both directions: inlier
        assert!(ms.inliers[0]);
        assert_relative_eq!(ms.score, 2.0 * (CHI2_2DOF - 4.41), epsilon = 1e-9);
    }

    #[test]
    fn fundamental_inlier_gate_is_one_dof_but_score_is_two_dof_scale() {
        // F for a pure horizontal-baseline stereo pair: y2 == y1 on inliers
        let f = Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0);
        let on = vec![(Point2::new(50.0, 60.0), Point2::new(90.0, 60.0))];
        let ms = check_fundamental(&f, &on, 1.0);
        assert!(ms.inliers[0]);
        assert_relative_eq!(ms.score, 2.0 * CHI2_2DOF, epsilon = 1e-9);

        // 1.5 px off the epipolar line: χ² = 2.25, inside 3.841
        let near = vec![(Point2::new(50.0, 60.0), Point2::new(90.0, 61.5))];
        let ms = check_fundamental(&f, &near, 1.0);
        assert!(ms.inliers[0]);
        // direction 1 fails nothing; both directions see the same 1.5 px residual
        assert_relative_eq!(ms.score, 2.0 * (CHI2_2DOF - 2.25), epsilon = 1e-9);

        // 2.5 px off: χ² = 6.25 > 3.841, both directions fail
        let off = vec![(Point2::new(50.0, 60.0), Point2::new(90.0, 62.5))];
        let ms = check_fundamental(&f, &off, 1.0);
        assert!(!ms.inliers[0]);
        assert_relative_eq!(ms.score, 0.0);
    }
}
