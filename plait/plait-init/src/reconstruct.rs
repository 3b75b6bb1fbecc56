//! Motion-hypothesis disambiguation for the two-view initializer.

use nalgebra::{Matrix3, Point3, Vector3};
use tracing::debug;

use plait_mvg::{decompose_essential, decompose_homography, triangulate_point, projection_matrix};
use plait_types::{FrameFeatures, InitializerParams, Pose};

/// Near-infinite points keep triangulating behind a camera; this cosine
/// bound marks parallax too small to trust cheirality.
pub(crate) const COS_PARALLAX_LIMIT: f64 = 0.99998;

pub(crate) struct CheckRtOutcome {
    pub n_good: usize,
    /// Triangulated points by reference keypoint index; `Some` also for
    /// low-parallax survivors, which `good` excludes.
    pub points: Vec<Option<Point3<f64>>>,
    pub good: Vec<bool>,
    pub parallax_deg: f64,
}

/// Count cheirality-valid triangulations under one `(R, t)` hypothesis.
pub(crate) fn check_rt(
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    reference: &FrameFeatures,
    current: &FrameFeatures,
    matches: &[(usize, usize)],
    inliers: &[bool],
    sigma2: f64,
) -> CheckRtOutcome {
    let camera = &reference.camera;
    let k = camera.matrix();
    let pose2 = Pose::new(*rotation, *translation);
    let p1 = projection_matrix(&k, &Pose::identity());
    let p2 = projection_matrix(&k, &pose2);
    let o1 = Point3::origin();
    let o2 = pose2.camera_center();

    let th2 = 4.0 * sigma2;

    let mut points = vec![None; reference.keypoints.len()];
    let mut good = vec![false; reference.keypoints.len()];
    let mut cos_parallaxes = Vec::with_capacity(matches.len());
    let mut n_good = 0usize;

    for (mi, &(i1, i2)) in matches.iter().enumerate() {
        if !inliers[mi] {
            continue;
        }
        let kp1 = reference.keypoints[i1].pt;
        let kp2 = current.keypoints[i2].pt;

        let x = match triangulate_point(&kp1, &kp2, &p1, &p2) {
            Ok(x) => x,
            Err(_) => continue,
        };
        if !x.coords.iter().all(|v| v.is_finite()) {
            continue;
        }

        let normal1 = x - o1;
        let normal2 = x - o2;
        let dist1 = normal1.norm();
        let dist2 = normal2.norm();
        let cos_parallax = normal1.dot(&normal2) / (dist1 * dist2);

        // z <= 0 is tolerated only for near-infinite points
        if x.z <= 0.0 && cos_parallax < COS_PARALLAX_LIMIT {
            continue;
        }
        let x_c2 = pose2.transform_point(&x);
        if x_c2.z <= 0.0 && cos_parallax < COS_PARALLAX_LIMIT {
            continue;
        }

        let proj1 = camera.project(&x);
        let err1 = (proj1 - kp1).norm_squared();
        if err1 > th2 {
            continue;
        }
        let proj2 = camera.project(&x_c2);
        let err2 = (proj2 - kp2).norm_squared();
        if err2 > th2 {
            continue;
        }

        points[i1] = Some(x);
        cos_parallaxes.push(cos_parallax);
        n_good += 1;
        if cos_parallax < COS_PARALLAX_LIMIT {
            good[i1] = true;
        }
    }

    let parallax_deg = if !cos_parallaxes.is_empty() {
        cos_parallaxes.sort_by(|a, b| a.total_cmp(b));
        let idx = 50.min(cos_parallaxes.len() - 1);
        cos_parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees()
    } else {
        0.0
    };

    CheckRtOutcome {
        n_good,
        points,
        good,
        parallax_deg,
    }
}

fn keep_good_points(outcome: CheckRtOutcome) -> Vec<Option<Point3<f64>>> {
    outcome
        .points
        .into_iter()
        .zip(outcome.good.iter())
        .map(|(p, &g)| if g { p } else { None })
        .collect()
}

/// Recover `(R, t)` and structure from a fundamental matrix.
pub(crate) fn reconstruct_f(
    reference: &FrameFeatures,
    current: &FrameFeatures,
    matches: &[(usize, usize)],
    inliers: &[bool],
    f21: &Matrix3<f64>,
    params: &InitializerParams,
) -> Option<(Pose, Vec<Option<Point3<f64>>>, usize)> {
    let n_inliers = inliers.iter().filter(|&&b| b).count();
    let k = reference.camera.matrix();
    let e21 = k.transpose() * f21 * k;
    let (r1, r2, t) = decompose_essential(&e21).ok()?;
    let sigma2 = params.sigma * params.sigma;

    let hypotheses = [
        (r1, t),
        (r2, t),
        (r1, -t),
        (r2, -t),
    ];
    let outcomes: Vec<CheckRtOutcome> = hypotheses
        .iter()
        .map(|(r, t)| check_rt(r, t, reference, current, matches, inliers, sigma2))
        .collect();

    let max_good = outcomes.iter().map(|o| o.n_good).max().unwrap_or(0);
    let n_min_good = ((0.9 * n_inliers as f64) as usize).max(params.min_triangulated);
    let n_similar = outcomes
        .iter()
        .filter(|o| o.n_good as f64 > 0.7 * max_good as f64)
        .count();

    if max_good < n_min_good || n_similar > 1 {
        debug!(max_good, n_min_good, n_similar, "fundamental reconstruction rejected");
        return None;
    }

    let (hi, winner) = outcomes
        .into_iter()
        .enumerate()
        .max_by_key(|(_, o)| o.n_good)?;
    if winner.parallax_deg < params.min_parallax_deg {
        debug!(parallax = winner.parallax_deg, "parallax below minimum");
        return None;
    }
    let (r, t) = hypotheses[hi];
    let n_good = winner.n_good;
    Some((Pose::new(r, t), keep_good_points(winner), n_good))
}

/// Recover `(R, t)` and structure from a homography via the eight
/// Faugeras hypotheses.
pub(crate) fn reconstruct_h(
    reference: &FrameFeatures,
    current: &FrameFeatures,
    matches: &[(usize, usize)],
    inliers: &[bool],
    h21: &Matrix3<f64>,
    params: &InitializerParams,
) -> Option<(Pose, Vec<Option<Point3<f64>>>, usize)> {
    let n_inliers = inliers.iter().filter(|&&b| b).count();
    let k = reference.camera.matrix();
    let hypotheses = decompose_homography(h21, &k).ok()?;
    let sigma2 = params.sigma * params.sigma;

    let mut best: Option<(usize, CheckRtOutcome)> = None;
    let mut second_best_good = 0usize;
    for (hi, hyp) in hypotheses.iter().enumerate() {
        let outcome = check_rt(
            &hyp.rotation,
            &hyp.translation,
            reference,
            current,
            matches,
            inliers,
            sigma2,
        );
        match &best {
            Some((_, b)) if outcome.n_good <= b.n_good => {
                second_best_good = second_best_good.max(outcome.n_good);
            }
            Some((_, b)) => {
                second_best_good = second_best_good.max(b.n_good);
                best = Some((hi, outcome));
            }
            None => {
                best = Some((hi, outcome));
            }
        }
    }

    let (hi, winner) = best?;
    let accept = (second_best_good as f64) < 0.75 * winner.n_good as f64
        && winner.parallax_deg >= params.min_parallax_deg
        && winner.n_good >= params.min_triangulated
        && winner.n_good as f64 > 0.9 * n_inliers as f64;
    if !accept {
        debug!(
            best = winner.n_good,
            second_best = second_best_good,
            parallax = winner.parallax_deg,
            "homography reconstruction rejected"
        );
        return None;
    }
    let hyp = &hypotheses[hi];
    let n_good = winner.n_good;
    Some((
        Pose::new(hyp.rotation, hyp.translation),
        keep_good_points(winner),
        n_good,
    ))
}
