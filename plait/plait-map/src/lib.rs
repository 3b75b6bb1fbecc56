//! The shared sparse map of the plait SLAM core.
//!
//! Keyframes, map points and map lines live in id-addressed arenas owned
//! by [`Map`]. Cross-references between keyframes and map elements are
//! ids, not pointers, so the mutual KF ↔ element observation structure
//! stays cycle-free while both directions remain O(log n) lookups.
//!
//! Locking follows a strict order when more than one lock is held:
//! the map-wide structural mutex first, then a keyframe's mutexes, then a
//! map element's feature mutex. All methods here take locks briefly and
//! snapshot, so callers never observe a method holding two levels at once.
//!
//! Removal is two-phase: elements and keyframes are flagged bad and
//! unhooked from all observation arrays immediately, then dropped from
//! the arena. Holders of stale `Arc`s see the bad flag.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nalgebra::Point3;
use parking_lot::Mutex;
use plait_types::Descriptor;

mod keyframe;
pub use keyframe::KeyFrame;

mod map_point;
pub use map_point::MapPoint;

mod map_line;
pub use map_line::MapLine;

/// Identifier of a keyframe, assigned by the tracker in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

/// Identifier of a map point, assigned by the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

/// Identifier of a map line, assigned by the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapLineId(pub u64);

#[derive(Default)]
struct MapInner {
    keyframes: BTreeMap<KeyFrameId, Arc<KeyFrame>>,
    points: BTreeMap<MapPointId, Arc<MapPoint>>,
    lines: BTreeMap<MapLineId, Arc<MapLine>>,
}

/// The shared map. Cheap to share as `Arc<Map>`.
#[derive(Default)]
pub struct Map {
    inner: Mutex<MapInner>,
    next_point_id: AtomicU64,
    next_line_id: AtomicU64,
}

impl Map {
    pub fn new() -> Self {
        Map::default()
    }

    pub fn insert_keyframe(&self, kf: Arc<KeyFrame>) {
        self.inner.lock().keyframes.insert(kf.id(), kf);
    }

    pub fn erase_keyframe(&self, id: KeyFrameId) {
        self.inner.lock().keyframes.remove(&id);
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<Arc<KeyFrame>> {
        self.inner.lock().keyframes.get(&id).cloned()
    }

    pub fn map_point(&self, id: MapPointId) -> Option<Arc<MapPoint>> {
        self.inner.lock().points.get(&id).cloned()
    }

    pub fn map_line(&self, id: MapLineId) -> Option<Arc<MapLine>> {
        self.inner.lock().lines.get(&id).cloned()
    }

    /// Allocate an id, create the point, and register it in the arena.
    pub fn create_map_point(
        &self,
        position: Point3<f64>,
        first_keyframe: KeyFrameId,
        descriptor: Descriptor,
    ) -> Arc<MapPoint> {
        let id = MapPointId(self.next_point_id.fetch_add(1, Ordering::Relaxed));
        let point = Arc::new(MapPoint::new(id, position, first_keyframe, descriptor));
        self.inner.lock().points.insert(id, point.clone());
        point
    }

    /// Allocate an id, create the line, and register it in the arena.
    pub fn create_map_line(
        &self,
        start: Point3<f64>,
        end: Point3<f64>,
        first_keyframe: KeyFrameId,
        descriptor: Descriptor,
    ) -> Arc<MapLine> {
        let id = MapLineId(self.next_line_id.fetch_add(1, Ordering::Relaxed));
        let line = Arc::new(MapLine::new(id, start, end, first_keyframe, descriptor));
        self.inner.lock().lines.insert(id, line.clone());
        line
    }

    pub fn erase_map_point(&self, id: MapPointId) {
        self.inner.lock().points.remove(&id);
    }

    pub fn erase_map_line(&self, id: MapLineId) {
        self.inner.lock().lines.remove(&id);
    }

    /// Snapshot of all keyframes, in id order.
    pub fn keyframes(&self) -> Vec<Arc<KeyFrame>> {
        self.inner.lock().keyframes.values().cloned().collect()
    }

    pub fn map_points(&self) -> Vec<Arc<MapPoint>> {
        self.inner.lock().points.values().cloned().collect()
    }

    pub fn map_lines(&self) -> Vec<Arc<MapLine>> {
        self.inner.lock().lines.values().cloned().collect()
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.inner.lock().keyframes.len()
    }

    pub fn points_in_map(&self) -> usize {
        self.inner.lock().points.len()
    }

    pub fn lines_in_map(&self) -> usize {
        self.inner.lock().lines.len()
    }

    /// Drop all content. Id counters keep advancing so stale ids from
    /// before the reset can never alias new elements.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.keyframes.clear();
        inner.points.clear();
        inner.lines.clear();
    }
}

#[cfg(test)]
mod tests;
