use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{Point3, Vector3};
use parking_lot::Mutex;

use plait_types::Descriptor;

use crate::{KeyFrameId, Map, MapPointId};

struct PointState {
    position: Point3<f64>,
    /// Mean viewing direction over all observations.
    normal: Vector3<f64>,
    descriptor: Descriptor,
    /// keyframe id → feature index; bijective per keyframe.
    observations: BTreeMap<KeyFrameId, usize>,
    min_distance: f64,
    max_distance: f64,
    visible: u32,
    found: u32,
    bad: bool,
    replaced_by: Option<MapPointId>,
}

/// A 3D landmark. All mutable state sits behind one feature mutex.
pub struct MapPoint {
    id: MapPointId,
    first_keyframe: KeyFrameId,
    state: Mutex<PointState>,
}

impl MapPoint {
    pub(crate) fn new(
        id: MapPointId,
        position: Point3<f64>,
        first_keyframe: KeyFrameId,
        descriptor: Descriptor,
    ) -> Self {
        MapPoint {
            id,
            first_keyframe,
            state: Mutex::new(PointState {
                position,
                normal: Vector3::zeros(),
                descriptor,
                observations: BTreeMap::new(),
                min_distance: 0.0,
                max_distance: 0.0,
                visible: 1,
                found: 1,
                bad: false,
                replaced_by: None,
            }),
        }
    }

    pub fn id(&self) -> MapPointId {
        self.id
    }

    pub fn first_keyframe(&self) -> KeyFrameId {
        self.first_keyframe
    }

    pub fn position(&self) -> Point3<f64> {
        self.state.lock().position
    }

    pub fn set_position(&self, position: Point3<f64>) {
        self.state.lock().position = position;
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.state.lock().normal
    }

    pub fn descriptor(&self) -> Descriptor {
        self.state.lock().descriptor
    }

    pub fn min_distance(&self) -> f64 {
        self.state.lock().min_distance
    }

    pub fn max_distance(&self) -> f64 {
        self.state.lock().max_distance
    }

    pub fn is_bad(&self) -> bool {
        self.state.lock().bad
    }

    pub fn replaced_by(&self) -> Option<MapPointId> {
        self.state.lock().replaced_by
    }

    pub fn observations(&self) -> BTreeMap<KeyFrameId, usize> {
        self.state.lock().observations.clone()
    }

    pub fn n_observations(&self) -> usize {
        self.state.lock().observations.len()
    }

    pub fn is_observed_by(&self, kf: KeyFrameId) -> bool {
        self.state.lock().observations.contains_key(&kf)
    }

    pub fn observation_index(&self, kf: KeyFrameId) -> Option<usize> {
        self.state.lock().observations.get(&kf).copied()
    }

    /// Record that `kf` observes this point at feature `idx`. Bad points
    /// accept no new observations.
    pub fn add_observation(&self, kf: KeyFrameId, idx: usize) {
        let mut state = self.state.lock();
        if state.bad {
            return;
        }
        state.observations.entry(kf).or_insert(idx);
    }

    /// Remove the observation from `kf`, unhooking the keyframe-side slot
    /// as well. A point left with two or fewer observations is culled.
    pub fn erase_observation(&self, kf: KeyFrameId, map: &Map) {
        let (removed, starved) = {
            let mut state = self.state.lock();
            match state.observations.remove(&kf) {
                Some(idx) => (Some(idx), state.observations.len() <= 2),
                None => (None, false),
            }
        };
        let idx = match removed {
            Some(idx) => idx,
            None => return,
        };
        if let Some(kf_arc) = map.keyframe(kf) {
            kf_arc.erase_map_point_at(idx);
        }
        if starved {
            self.set_bad(map);
        }
    }

    /// Flag bad, detach every observation, and drop from the arena.
    pub fn set_bad(&self, map: &Map) {
        let observations = {
            let mut state = self.state.lock();
            if state.bad {
                return;
            }
            state.bad = true;
            std::mem::take(&mut state.observations)
        };
        for (kf_id, idx) in observations {
            if let Some(kf) = map.keyframe(kf_id) {
                kf.erase_map_point_at(idx);
            }
        }
        map.erase_map_point(self.id);
    }

    pub fn increase_visible(&self, n: u32) {
        self.state.lock().visible += n;
    }

    pub fn increase_found(&self, n: u32) {
        self.state.lock().found += n;
    }

    pub fn found_ratio(&self) -> f64 {
        let state = self.state.lock();
        state.found as f64 / state.visible as f64
    }

    /// Adopt the descriptor with the least median Hamming distance to all
    /// other observations.
    pub fn compute_distinctive_descriptor(&self, map: &Map) {
        let observations = {
            let state = self.state.lock();
            if state.bad {
                return;
            }
            state.observations.clone()
        };
        let mut descriptors: Vec<Descriptor> = Vec::with_capacity(observations.len());
        for (kf_id, idx) in observations {
            if let Some(kf) = map.keyframe(kf_id) {
                if !kf.is_bad() {
                    descriptors.push(*kf.descriptor(idx));
                }
            }
        }
        if let Some(best) = distinctive_descriptor(&descriptors) {
            self.state.lock().descriptor = best;
        }
    }

    /// Refresh the mean viewing direction and the scale-derived valid
    /// depth range from the current observations.
    pub fn update_normal_and_depth(&self, map: &Map) {
        let (observations, position) = {
            let state = self.state.lock();
            if state.bad {
                return;
            }
            (state.observations.clone(), state.position)
        };
        if observations.is_empty() {
            return;
        }

        let mut normal = Vector3::zeros();
        let mut n = 0usize;
        for &kf_id in observations.keys() {
            if let Some(kf) = map.keyframe(kf_id) {
                let dir = position - kf.camera_center();
                let len = dir.norm();
                if len > 0.0 {
                    normal += dir / len;
                    n += 1;
                }
            }
        }
        if n == 0 {
            return;
        }
        normal /= n as f64;

        // scale range is anchored at the creating keyframe when it still
        // observes the point, otherwise at the oldest remaining observer
        let (ref_kf_id, ref_idx) = match observations.get(&self.first_keyframe) {
            Some(&idx) => (self.first_keyframe, idx),
            None => {
                let (&kf, &idx) = observations.iter().next().expect("observations non-empty");
                (kf, idx)
            }
        };
        let Some(ref_kf) = map.keyframe(ref_kf_id) else {
            return;
        };
        let dist = (position - ref_kf.camera_center()).norm();
        let pyramid = ref_kf.pyramid();
        let level = ref_kf.keypoint(ref_idx).octave;
        let level_scale = pyramid.scale(level);
        let max_distance = dist * level_scale;
        let min_distance = max_distance / pyramid.scale(pyramid.n_levels() - 1);

        let mut state = self.state.lock();
        state.normal = normal;
        state.max_distance = max_distance;
        state.min_distance = min_distance;
    }

    /// Merge this point into `other`: move observations over, forward the
    /// tracking counters, and retire this point.
    pub fn replace(&self, other: &Arc<MapPoint>, map: &Map) {
        if other.id == self.id {
            return;
        }
        let (observations, visible, found) = {
            let mut state = self.state.lock();
            if state.bad {
                return;
            }
            state.bad = true;
            state.replaced_by = Some(other.id);
            (
                std::mem::take(&mut state.observations),
                state.visible,
                state.found,
            )
        };

        for (kf_id, idx) in observations {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if other.is_observed_by(kf_id) {
                kf.erase_map_point_at(idx);
            } else {
                kf.replace_map_point_at(idx, other.id);
                other.add_observation(kf_id, idx);
            }
        }
        other.increase_visible(visible);
        other.increase_found(found);
        other.compute_distinctive_descriptor(map);
        map.erase_map_point(self.id);
    }
}

/// The descriptor minimizing the median distance to the rest of the set.
pub(crate) fn distinctive_descriptor(descriptors: &[Descriptor]) -> Option<Descriptor> {
    if descriptors.is_empty() {
        return None;
    }
    let n = descriptors.len();
    let mut best = (u32::MAX, 0usize);
    for i in 0..n {
        let mut dists: Vec<u32> = (0..n)
            .map(|j| descriptors[i].distance(&descriptors[j]))
            .collect();
        dists.sort_unstable();
        let median = dists[(n - 1) / 2];
        if median < best.0 {
            best = (median, i);
        }
    }
    Some(descriptors[best.1])
}
