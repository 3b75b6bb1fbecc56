//! Two-view bootstrap for the plait monocular SLAM core.
//!
//! Given a reference frame, a current frame, and putative point matches,
//! [`Initializer::initialize`] hypothesizes the relative camera motion by
//! running RANSAC over a planar (homography) and a non-planar (fundamental
//! matrix) model in parallel, selects one by score ratio, decomposes it
//! into motion hypotheses, and disambiguates them by counting
//! cheirality-valid triangulations. When line matches are supplied the
//! recovered pose is also used to triangulate 3D line segments.

use std::thread;

use nalgebra::{Matrix3, Point2, Point3};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::debug;

use plait_mvg::{
    check_fundamental, check_homography, compute_f21, compute_h21, normalize_points, ModelScore,
};
use plait_types::{FrameFeatures, InitializerParams, MatchIndices, Pose};

mod reconstruct;
use reconstruct::{reconstruct_f, reconstruct_h};

mod lines;
pub use lines::TriangulatedLine;

/// Which two-view model won the score-ratio selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedModel {
    Homography,
    Fundamental,
}

/// A successful two-view reconstruction.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    /// Pose of the current frame relative to the reference frame.
    pub pose: Pose,
    /// Triangulated points, indexed by reference keypoint. `Some` only for
    /// matches that passed cheirality, reprojection and parallax gates.
    pub points: Vec<Option<Point3<f64>>>,
    /// Triangulated line segments, indexed by reference keyline. Empty
    /// when no line matches were supplied.
    pub lines: Vec<Option<TriangulatedLine>>,
    pub model: SelectedModel,
    /// `S_H / (S_H + S_F)` of the final RANSAC scores.
    pub score_ratio: f64,
    /// Cheirality-consistent triangulations of the winning hypothesis.
    pub n_triangulated: usize,
}

/// Two-view initializer owning the reference frame.
pub struct Initializer {
    reference: FrameFeatures,
    params: InitializerParams,
}

impl Initializer {
    pub fn new(reference: FrameFeatures, params: InitializerParams) -> Self {
        Initializer { reference, params }
    }

    pub fn reference(&self) -> &FrameFeatures {
        &self.reference
    }

    /// Attempt to bootstrap structure and motion from the reference frame
    /// and `current`.
    ///
    /// `point_matches[i]` is the current-frame keypoint matched to
    /// reference keypoint `i`. Returns `None` on degenerate geometry,
    /// insufficient inliers, or ambiguous motion hypotheses, with no
    /// partial output.
    pub fn initialize(
        &self,
        current: &FrameFeatures,
        point_matches: &MatchIndices,
        line_matches: Option<&MatchIndices>,
    ) -> Option<TwoViewReconstruction> {
        let matches: Vec<(usize, usize)> = point_matches
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        if matches.len() < 8 {
            return None;
        }

        let pairs: Vec<(Point2<f64>, Point2<f64>)> = matches
            .iter()
            .map(|&(i1, i2)| {
                (
                    self.reference.keypoints[i1].pt,
                    current.keypoints[i2].pt,
                )
            })
            .collect();

        let sets = ransac_sample_sets(matches.len(), self.params.max_iterations);
        let sigma = self.params.sigma;

        let ((s_h, h21, h_score), (s_f, f21, f_score)) = thread::scope(|s| {
            let hh = s.spawn(|| find_homography(&pairs, &sets, sigma));
            let fh = s.spawn(|| find_fundamental(&pairs, &sets, sigma));
            (
                hh.join().expect("homography estimation thread panicked"),
                fh.join().expect("fundamental estimation thread panicked"),
            )
        });

        if s_h + s_f <= 0.0 {
            debug!("both model scores are zero, rejecting frame pair");
            return None;
        }
        let score_ratio = s_h / (s_h + s_f);
        debug!(s_h, s_f, score_ratio, "two-view model selection");

        let mut recon = if score_ratio > 0.40 {
            let (pose, points, n_triangulated) = reconstruct_h(
                &self.reference,
                current,
                &matches,
                &h_score.inliers,
                &h21,
                &self.params,
            )?;
            TwoViewReconstruction {
                pose,
                points,
                lines: Vec::new(),
                model: SelectedModel::Homography,
                score_ratio,
                n_triangulated,
            }
        } else {
            let (pose, points, n_triangulated) = reconstruct_f(
                &self.reference,
                current,
                &matches,
                &f_score.inliers,
                &f21,
                &self.params,
            )?;
            TwoViewReconstruction {
                pose,
                points,
                lines: Vec::new(),
                model: SelectedModel::Fundamental,
                score_ratio,
                n_triangulated,
            }
        };

        if let Some(lm) = line_matches {
            recon.lines = lines::reconstruct_lines(&self.reference, current, lm, &recon.pose);
        }
        Some(recon)
    }
}

/// Precompute disjoint-per-iteration 8-sample index sets with a
/// deterministic generator, so runs are reproducible.
fn ransac_sample_sets(n_matches: usize, iterations: usize) -> Vec<[usize; 8]> {
    let mut rng = SmallRng::seed_from_u64(0);
    let all: Vec<usize> = (0..n_matches).collect();
    let mut sets = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let mut available = all.clone();
        let mut set = [0usize; 8];
        for slot in set.iter_mut() {
            let r = rng.random_range(0..available.len());
            *slot = available.swap_remove(r);
        }
        sets.push(set);
    }
    sets
}

fn find_homography(
    pairs: &[(Point2<f64>, Point2<f64>)],
    sets: &[[usize; 8]],
    sigma: f64,
) -> (f64, Matrix3<f64>, ModelScore) {
    let no_model = || {
        (
            0.0,
            Matrix3::identity(),
            ModelScore {
                score: 0.0,
                inliers: vec![false; pairs.len()],
            },
        )
    };

    let p1: Vec<Point2<f64>> = pairs.iter().map(|p| p.0).collect();
    let p2: Vec<Point2<f64>> = pairs.iter().map(|p| p.1).collect();
    let (n1, n2) = match (normalize_points(&p1), normalize_points(&p2)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => return no_model(),
    };
    let t2_inv = match n2.transform.try_inverse() {
        Some(t) => t,
        None => return no_model(),
    };

    let mut best = no_model();
    for set in sets {
        let s1: Vec<Point2<f64>> = set.iter().map(|&i| n1.points[i]).collect();
        let s2: Vec<Point2<f64>> = set.iter().map(|&i| n2.points[i]).collect();
        let hn = match compute_h21(&s1, &s2) {
            Ok(h) => h,
            Err(_) => continue,
        };
        let h21 = t2_inv * hn * n1.transform;
        let h12 = match h21.try_inverse() {
            Some(h) => h,
            None => continue,
        };
        let score = check_homography(&h21, &h12, pairs, sigma);
        if score.score > best.0 {
            best = (score.score, h21, score);
        }
    }
    best
}

fn find_fundamental(
    pairs: &[(Point2<f64>, Point2<f64>)],
    sets: &[[usize; 8]],
    sigma: f64,
) -> (f64, Matrix3<f64>, ModelScore) {
    let no_model = || {
        (
            0.0,
            Matrix3::identity(),
            ModelScore {
                score: 0.0,
                inliers: vec![false; pairs.len()],
            },
        )
    };

    let p1: Vec<Point2<f64>> = pairs.iter().map(|p| p.0).collect();
    let p2: Vec<Point2<f64>> = pairs.iter().map(|p| p.1).collect();
    let (n1, n2) = match (normalize_points(&p1), normalize_points(&p2)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => return no_model(),
    };

    let mut best = no_model();
    for set in sets {
        let s1: Vec<Point2<f64>> = set.iter().map(|&i| n1.points[i]).collect();
        let s2: Vec<Point2<f64>> = set.iter().map(|&i| n2.points[i]).collect();
        let fn_ = match compute_f21(&s1, &s2) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let f21 = n2.transform.transpose() * fn_ * n1.transform;
        let score = check_fundamental(&f21, pairs, sigma);
        if score.score > best.0 {
            best = (score.score, f21, score);
        }
    }
    best
}
