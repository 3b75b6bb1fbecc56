//! Two-view geometry kernel for the plait monocular SLAM core.
//!
//! Pure functions over [`nalgebra`] matrices: Hartley-normalized model
//! estimation (fundamental matrix, homography), decomposition of the
//! essential matrix and of a homography into relative-pose hypotheses, and
//! SVD-based triangulation of points and of line-segment endpoints.
//!
//! Nothing in this crate locks, logs, or panics on bad input. Degenerate
//! configurations surface as [`MvgError`]; per-point failures surface as
//! non-finite coordinates which callers filter.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MvgError {
    #[error("not enough points")]
    NotEnoughPoints,
    #[error("SVD failed")]
    SvdFailed,
    #[error("degenerate geometry")]
    DegenerateGeometry,
}

pub type Result<M> = std::result::Result<M, MvgError>;

mod epipolar;
pub use crate::epipolar::{
    compute_f21, compute_h21, decompose_essential, decompose_homography, fundamental_from_poses,
    normalize_points, projection_matrix, skew_symmetric, HomographyHypothesis, NormalizedPoints,
};

mod triangulate;
pub use crate::triangulate::{
    backprojection_plane, triangulate_line, triangulate_line_endpoint, triangulate_point,
};

mod scoring;
pub use crate::scoring::{check_fundamental, check_homography, ModelScore};
