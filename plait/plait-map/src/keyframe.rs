use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::Point3;
use parking_lot::Mutex;
use tracing::debug;

use plait_types::{
    BowVector, CameraIntrinsics, Descriptor, FrameFeatures, LineFeature, PointFeature, Pose,
    ScalePyramid,
};

use crate::{KeyFrameId, Map, MapLineId, MapPointId};

struct Observations {
    map_points: Vec<Option<MapPointId>>,
    map_lines: Vec<Option<MapLineId>>,
    /// Shared-observation count per covisible keyframe (all weights).
    connections: BTreeMap<KeyFrameId, usize>,
    /// Covisible keyframes sorted by descending weight.
    ordered_neighbors: Vec<(usize, KeyFrameId)>,
    bow: Option<BowVector>,
    bad: bool,
}

/// A keyframe: immutable feature data plus a mutable pose and mutable
/// observation/covisibility state.
///
/// The pose and the observation state are guarded by separate mutexes so
/// reprojection-heavy readers do not contend with covisibility updates.
pub struct KeyFrame {
    id: KeyFrameId,
    features: FrameFeatures,
    descriptors: Vec<Descriptor>,
    line_descriptors: Vec<Descriptor>,
    pyramid: ScalePyramid,
    pose: Mutex<Pose>,
    obs: Mutex<Observations>,
}

impl KeyFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: KeyFrameId,
        features: FrameFeatures,
        descriptors: Vec<Descriptor>,
        line_descriptors: Vec<Descriptor>,
        pyramid: ScalePyramid,
        pose: Pose,
        tracked_points: Vec<Option<MapPointId>>,
        tracked_lines: Vec<Option<MapLineId>>,
    ) -> Arc<Self> {
        let mut map_points = tracked_points;
        map_points.resize(features.keypoints.len(), None);
        let mut map_lines = tracked_lines;
        map_lines.resize(features.keylines.len(), None);
        Arc::new(KeyFrame {
            id,
            features,
            descriptors,
            line_descriptors,
            pyramid,
            pose: Mutex::new(pose),
            obs: Mutex::new(Observations {
                map_points,
                map_lines,
                connections: BTreeMap::new(),
                ordered_neighbors: Vec::new(),
                bow: None,
                bad: false,
            }),
        })
    }

    pub fn id(&self) -> KeyFrameId {
        self.id
    }

    pub fn camera(&self) -> &CameraIntrinsics {
        &self.features.camera
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    pub fn n_keypoints(&self) -> usize {
        self.features.keypoints.len()
    }

    pub fn n_keylines(&self) -> usize {
        self.features.keylines.len()
    }

    pub fn keypoint(&self, idx: usize) -> &PointFeature {
        &self.features.keypoints[idx]
    }

    pub fn keyline(&self, idx: usize) -> &LineFeature {
        &self.features.keylines[idx]
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn line_descriptors(&self) -> &[Descriptor] {
        &self.line_descriptors
    }

    pub fn descriptor(&self, idx: usize) -> &Descriptor {
        &self.descriptors[idx]
    }

    pub fn line_descriptor(&self, idx: usize) -> &Descriptor {
        &self.line_descriptors[idx]
    }

    pub fn pose(&self) -> Pose {
        *self.pose.lock()
    }

    pub fn set_pose(&self, pose: Pose) {
        *self.pose.lock() = pose;
    }

    pub fn camera_center(&self) -> Point3<f64> {
        self.pose.lock().camera_center()
    }

    pub fn bow(&self) -> Option<BowVector> {
        self.obs.lock().bow.clone()
    }

    pub fn set_bow(&self, bow: BowVector) {
        self.obs.lock().bow = Some(bow);
    }

    pub fn is_bad(&self) -> bool {
        self.obs.lock().bad
    }

    // ---- map point / map line slots -------------------------------------

    pub fn map_point_ids(&self) -> Vec<Option<MapPointId>> {
        self.obs.lock().map_points.clone()
    }

    pub fn map_line_ids(&self) -> Vec<Option<MapLineId>> {
        self.obs.lock().map_lines.clone()
    }

    pub fn map_point_id_at(&self, idx: usize) -> Option<MapPointId> {
        self.obs.lock().map_points.get(idx).copied().flatten()
    }

    pub fn map_line_id_at(&self, idx: usize) -> Option<MapLineId> {
        self.obs.lock().map_lines.get(idx).copied().flatten()
    }

    pub fn add_map_point(&self, idx: usize, id: MapPointId) {
        self.obs.lock().map_points[idx] = Some(id);
    }

    pub fn add_map_line(&self, idx: usize, id: MapLineId) {
        self.obs.lock().map_lines[idx] = Some(id);
    }

    pub fn erase_map_point_at(&self, idx: usize) {
        if let Some(slot) = self.obs.lock().map_points.get_mut(idx) {
            *slot = None;
        }
    }

    pub fn erase_map_line_at(&self, idx: usize) {
        if let Some(slot) = self.obs.lock().map_lines.get_mut(idx) {
            *slot = None;
        }
    }

    pub fn replace_map_point_at(&self, idx: usize, id: MapPointId) {
        self.obs.lock().map_points[idx] = Some(id);
    }

    pub fn replace_map_line_at(&self, idx: usize, id: MapLineId) {
        self.obs.lock().map_lines[idx] = Some(id);
    }

    // ---- covisibility ----------------------------------------------------

    pub fn connection_weight(&self, other: KeyFrameId) -> usize {
        self.obs.lock().connections.get(&other).copied().unwrap_or(0)
    }

    /// All covisible keyframes, best first.
    pub fn covisible_keyframes(&self) -> Vec<KeyFrameId> {
        self.obs
            .lock()
            .ordered_neighbors
            .iter()
            .map(|&(_, id)| id)
            .collect()
    }

    /// The `n` best covisible keyframes.
    pub fn best_covisible(&self, n: usize) -> Vec<KeyFrameId> {
        let obs = self.obs.lock();
        obs.ordered_neighbors
            .iter()
            .take(n)
            .map(|&(_, id)| id)
            .collect()
    }

    /// Record (or refresh) the symmetric half of a covisibility edge.
    pub fn add_connection(&self, other: KeyFrameId, weight: usize) {
        let mut obs = self.obs.lock();
        if obs.connections.get(&other) == Some(&weight) {
            return;
        }
        obs.connections.insert(other, weight);
        rebuild_ordered(&mut obs);
    }

    pub fn erase_connection(&self, other: KeyFrameId) {
        let mut obs = self.obs.lock();
        if obs.connections.remove(&other).is_some() {
            rebuild_ordered(&mut obs);
        }
    }

    /// Recount shared observations with every other keyframe and refresh
    /// both directions of the affected covisibility edges.
    ///
    /// Edges are materialized for weights reaching `weight_threshold`; if
    /// none does, the single best neighbor is kept so the graph stays
    /// connected.
    pub fn update_connections(&self, map: &Map, weight_threshold: usize) {
        let point_ids = self.map_point_ids();
        let line_ids = self.map_line_ids();

        let mut counter: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        for id in point_ids.into_iter().flatten() {
            if let Some(point) = map.map_point(id) {
                if point.is_bad() {
                    continue;
                }
                for (kf_id, _) in point.observations() {
                    if kf_id != self.id {
                        *counter.entry(kf_id).or_insert(0) += 1;
                    }
                }
            }
        }
        for id in line_ids.into_iter().flatten() {
            if let Some(line) = map.map_line(id) {
                if line.is_bad() {
                    continue;
                }
                for (kf_id, _) in line.observations() {
                    if kf_id != self.id {
                        *counter.entry(kf_id).or_insert(0) += 1;
                    }
                }
            }
        }

        if counter.is_empty() {
            return;
        }

        let (&best_id, &best_weight) = counter
            .iter()
            .max_by_key(|&(_, w)| *w)
            .expect("counter checked non-empty");

        let mut linked: Vec<(usize, KeyFrameId)> = counter
            .iter()
            .filter(|&(_, w)| *w >= weight_threshold)
            .map(|(&id, &w)| (w, id))
            .collect();
        if linked.is_empty() {
            linked.push((best_weight, best_id));
        }

        for &(w, id) in &linked {
            if let Some(other) = map.keyframe(id) {
                other.add_connection(self.id, w);
            }
        }
        linked.sort_by(|a, b| b.cmp(a));

        let mut obs = self.obs.lock();
        obs.connections = counter;
        obs.ordered_neighbors = linked;
    }

    // ---- geometry helpers ------------------------------------------------

    /// Median depth of the observed map points in this keyframe's camera
    /// frame (`q = 2` gives the median). Returns 0.0 with no points.
    pub fn scene_median_depth(&self, map: &Map, q: usize) -> f64 {
        let point_ids = self.map_point_ids();
        let pose = self.pose();
        let rz = pose.rotation.row(2);
        let tz = pose.translation.z;

        let mut depths: Vec<f64> = point_ids
            .into_iter()
            .flatten()
            .filter_map(|id| map.map_point(id))
            .map(|p| {
                let pos = p.position();
                (rz * pos.coords)[(0, 0)] + tz
            })
            .collect();
        if depths.is_empty() {
            return 0.0;
        }
        depths.sort_by(|a, b| a.total_cmp(b));
        depths[(depths.len() - 1) / q.max(1)]
    }

    /// Flag this keyframe bad and unhook it from the map: detach every
    /// observation, drop covisibility edges both ways, and remove it from
    /// the arena.
    pub fn set_bad(&self, map: &Map) {
        let (point_ids, line_ids, connected) = {
            let mut obs = self.obs.lock();
            if obs.bad {
                return;
            }
            obs.bad = true;
            let points = std::mem::take(&mut obs.map_points);
            let lines = std::mem::take(&mut obs.map_lines);
            let connected: Vec<KeyFrameId> = obs.connections.keys().copied().collect();
            obs.connections.clear();
            obs.ordered_neighbors.clear();
            (points, lines, connected)
        };

        for id in point_ids.into_iter().flatten() {
            if let Some(point) = map.map_point(id) {
                point.erase_observation(self.id, map);
            }
        }
        for id in line_ids.into_iter().flatten() {
            if let Some(line) = map.map_line(id) {
                line.erase_observation(self.id, map);
            }
        }
        for other in connected {
            if let Some(kf) = map.keyframe(other) {
                kf.erase_connection(self.id);
            }
        }
        debug!(kf = self.id.0, "keyframe flagged bad and removed");
        map.erase_keyframe(self.id);
    }
}

fn rebuild_ordered(obs: &mut Observations) {
    let mut pairs: Vec<(usize, KeyFrameId)> =
        obs.connections.iter().map(|(&id, &w)| (w, id)).collect();
    pairs.sort_by(|a, b| b.cmp(a));
    obs.ordered_neighbors = pairs;
}
