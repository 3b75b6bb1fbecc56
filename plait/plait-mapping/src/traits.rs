//! Seams to the collaborators the mapper does not own.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nalgebra::Matrix3;

use plait_map::{KeyFrame, Map, MapLine, MapPoint};
use plait_types::{BowVector, Descriptor};

/// Descriptor matching between keyframes, and projection-based fusion of
/// map elements into a keyframe.
pub trait FeatureMatcher: Send + Sync {
    /// Match untracked features between two keyframes, constrained by the
    /// fundamental matrix `f12` (`x1ᵀ · F12 · x2 = 0`). Returns pairs of
    /// feature indices `(idx_in_kf1, idx_in_kf2)`.
    fn search_for_triangulation(
        &self,
        kf1: &Arc<KeyFrame>,
        kf2: &Arc<KeyFrame>,
        f12: &Matrix3<f64>,
    ) -> Vec<(usize, usize)>;

    /// Line matches from `kf1` to `kf2`, positional by `kf1` keyline index.
    fn search_line_matches(&self, kf1: &Arc<KeyFrame>, kf2: &Arc<KeyFrame>) -> Vec<Option<usize>>;

    /// Project `candidates` into `kf` and reconcile: add the missing
    /// observation, or merge duplicated map points. Returns how many
    /// candidates were fused.
    fn fuse_points(&self, kf: &Arc<KeyFrame>, candidates: &[Arc<MapPoint>], map: &Map) -> usize;

    /// Line counterpart of [`FeatureMatcher::fuse_points`].
    fn fuse_lines(&self, kf: &Arc<KeyFrame>, candidates: &[Arc<MapLine>], map: &Map) -> usize;
}

/// Nonlinear refinement of the keyframes covisible with `kf` and the map
/// elements they observe.
pub trait BundleAdjuster: Send + Sync {
    /// Must poll `abort` at iteration boundaries and return early when it
    /// is set.
    fn local_bundle_adjustment(&self, kf: &Arc<KeyFrame>, abort: &AtomicBool, map: &Map);
}

/// Downstream consumer of fully integrated keyframes.
pub trait LoopCloser: Send + Sync {
    fn insert_keyframe(&self, kf: Arc<KeyFrame>);
}

/// Bag-of-visual-words encoding used by the matching collaborators.
pub trait BowEncoder: Send + Sync {
    fn encode(&self, descriptors: &[Descriptor]) -> BowVector;
}
