//! Local-mapping scenarios driven through the public control surface,
//! with stub collaborators standing in for the matcher, bundle adjuster,
//! bag-of-words encoder, and loop closer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nalgebra::{Matrix3, Point3, Vector3};
use parking_lot::Mutex;

use plait_map::{KeyFrame, KeyFrameId, Map, MapLine, MapPoint, MapPointId};
use plait_mapping::{
    BowEncoder, BundleAdjuster, FeatureMatcher, LocalMapping, LoopCloser, MappingParams,
};
use plait_types::{
    BowVector, CameraIntrinsics, Descriptor, FrameFeatures, LineFeature, PointFeature, Pose,
    ScalePyramid,
};

// ---- stub collaborators --------------------------------------------------

/// Projects fuse candidates into the keyframe and reconciles against the
/// nearest keypoint. Triangulation searches return nothing.
struct StubMatcher {
    fuse_radius: f64,
}

impl FeatureMatcher for StubMatcher {
    fn search_for_triangulation(
        &self,
        _kf1: &Arc<KeyFrame>,
        _kf2: &Arc<KeyFrame>,
        _f12: &Matrix3<f64>,
    ) -> Vec<(usize, usize)> {
        Vec::new()
    }

    fn search_line_matches(
        &self,
        kf1: &Arc<KeyFrame>,
        kf2: &Arc<KeyFrame>,
    ) -> Vec<Option<usize>> {
        // synthetic scenes keep keyline indices aligned across keyframes
        (0..kf1.n_keylines())
            .map(|i| (i < kf2.n_keylines()).then_some(i))
            .collect()
    }

    fn fuse_points(&self, kf: &Arc<KeyFrame>, candidates: &[Arc<MapPoint>], map: &Map) -> usize {
        let pose = kf.pose();
        let cam = *kf.camera();
        let mut fused = 0;
        for cand in candidates {
            if cand.is_bad() || cand.is_observed_by(kf.id()) {
                continue;
            }
            let pc = pose.transform_point(&cand.position());
            if pc.z <= 0.0 {
                continue;
            }
            let proj = cam.project(&pc);
            let mut best: Option<(usize, f64)> = None;
            for idx in 0..kf.n_keypoints() {
                let d = (kf.keypoint(idx).pt - proj).norm();
                if d < self.fuse_radius && best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((idx, d));
                }
            }
            let Some((idx, _)) = best else { continue };
            match kf.map_point_id_at(idx) {
                Some(existing_id) if existing_id != cand.id() => {
                    if let Some(existing) = map.map_point(existing_id) {
                        if existing.n_observations() >= cand.n_observations() {
                            cand.replace(&existing, map);
                        } else {
                            existing.replace(cand, map);
                        }
                        fused += 1;
                    }
                }
                Some(_) => {}
                None => {
                    cand.add_observation(kf.id(), idx);
                    kf.add_map_point(idx, cand.id());
                    fused += 1;
                }
            }
        }
        fused
    }

    fn fuse_lines(&self, _kf: &Arc<KeyFrame>, _candidates: &[Arc<MapLine>], _map: &Map) -> usize {
        0
    }
}

#[derive(Default)]
struct RecordingBundleAdjuster {
    calls: AtomicUsize,
}

impl BundleAdjuster for RecordingBundleAdjuster {
    fn local_bundle_adjustment(&self, _kf: &Arc<KeyFrame>, _abort: &AtomicBool, _map: &Map) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingLoopCloser {
    ids: Mutex<Vec<u64>>,
}

impl LoopCloser for RecordingLoopCloser {
    fn insert_keyframe(&self, kf: Arc<KeyFrame>) {
        self.ids.lock().push(kf.id().0);
    }
}

struct NullBow;

impl BowEncoder for NullBow {
    fn encode(&self, _descriptors: &[Descriptor]) -> BowVector {
        BowVector::new()
    }
}

// ---- scene helpers -------------------------------------------------------

fn camera() -> CameraIntrinsics {
    CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0)
}

fn descriptor(seed: u8) -> Descriptor {
    let mut raw = [0u8; 32];
    for (i, b) in raw.iter_mut().enumerate() {
        *b = seed.wrapping_mul(37).wrapping_add(i as u8);
    }
    Descriptor(raw)
}

fn track_positions(n: usize) -> Vec<Point3<f64>> {
    (0..n)
        .map(|i| {
            Point3::new(
                -2.0 + 4.0 * (i % 10) as f64 / 9.0,
                -1.0 + 2.0 * (i / 10) as f64 / 3.0,
                5.0 + 0.2 * (i % 7) as f64,
            )
        })
        .collect()
}

/// A keyframe at camera center `(cam_x, 0, 0)` observing `tracked`.
fn build_keyframe(
    id: u64,
    cam_x: f64,
    octave: usize,
    tracked: &[(Point3<f64>, Option<MapPointId>)],
) -> Arc<KeyFrame> {
    let cam = camera();
    let pose = Pose::new(Matrix3::identity(), Vector3::new(-cam_x, 0.0, 0.0));
    let mut keypoints = Vec::with_capacity(tracked.len());
    let mut ids = Vec::with_capacity(tracked.len());
    let mut descriptors = Vec::with_capacity(tracked.len());
    for (i, (pos, pid)) in tracked.iter().enumerate() {
        let uv = cam.project(&pose.transform_point(pos));
        keypoints.push(PointFeature::new(uv.x, uv.y, octave));
        ids.push(*pid);
        descriptors.push(descriptor(i as u8));
    }
    KeyFrame::new(
        KeyFrameId(id),
        FrameFeatures {
            keypoints,
            keylines: Vec::new(),
            camera: cam,
        },
        descriptors,
        Vec::new(),
        ScalePyramid::default(),
        pose,
        ids,
        Vec::new(),
    )
}

/// Like [`build_keyframe`], with line segments observed alongside the
/// tracked points.
fn build_keyframe_with_lines(
    id: u64,
    cam_x: f64,
    tracked: &[(Point3<f64>, Option<MapPointId>)],
    segments: &[(Point3<f64>, Point3<f64>)],
) -> Arc<KeyFrame> {
    let cam = camera();
    let pose = Pose::new(Matrix3::identity(), Vector3::new(-cam_x, 0.0, 0.0));
    let mut keypoints = Vec::with_capacity(tracked.len());
    let mut ids = Vec::with_capacity(tracked.len());
    let mut descriptors = Vec::with_capacity(tracked.len());
    for (i, (pos, pid)) in tracked.iter().enumerate() {
        let uv = cam.project(&pose.transform_point(pos));
        keypoints.push(PointFeature::new(uv.x, uv.y, 0));
        ids.push(*pid);
        descriptors.push(descriptor(i as u8));
    }
    let mut keylines = Vec::with_capacity(segments.len());
    let mut line_descriptors = Vec::with_capacity(segments.len());
    for (i, (s, e)) in segments.iter().enumerate() {
        let ps = cam.project(&pose.transform_point(s));
        let pe = cam.project(&pose.transform_point(e));
        keylines.push(LineFeature::new(ps, pe, 0));
        line_descriptors.push(descriptor(150 + i as u8));
    }
    KeyFrame::new(
        KeyFrameId(id),
        FrameFeatures {
            keypoints,
            keylines,
            camera: cam,
        },
        descriptors,
        line_descriptors,
        ScalePyramid::default(),
        pose,
        ids,
        Vec::new(),
    )
}

struct Harness {
    map: Arc<Map>,
    mapper: Arc<LocalMapping>,
    matcher: Arc<StubMatcher>,
    bundle_adjuster: Arc<RecordingBundleAdjuster>,
    loop_closer: Arc<RecordingLoopCloser>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Harness {
    fn start() -> Harness {
        let map = Arc::new(Map::new());
        let matcher = Arc::new(StubMatcher { fuse_radius: 1.0 });
        let bundle_adjuster = Arc::new(RecordingBundleAdjuster::default());
        let loop_closer = Arc::new(RecordingLoopCloser::default());
        let mapper = Arc::new(LocalMapping::new(
            map.clone(),
            MappingParams::default(),
            matcher.clone(),
            bundle_adjuster.clone(),
            loop_closer.clone(),
            Arc::new(NullBow),
        ));
        let thread = {
            let mapper = mapper.clone();
            Some(thread::spawn(move || mapper.run()))
        };
        Harness {
            map,
            mapper,
            matcher,
            bundle_adjuster,
            loop_closer,
            thread,
        }
    }

    /// Insert and wait until the keyframe has been integrated.
    fn insert_and_wait(&self, kf: Arc<KeyFrame>) {
        let id = kf.id();
        self.mapper.insert_keyframe(kf);
        wait_until(|| self.map.keyframe(id).is_some());
    }

    fn finish(mut self) {
        self.mapper.request_finish();
        if let Some(handle) = self.thread.take() {
            handle.join().expect("mapper thread panicked");
        }
        assert!(self.mapper.is_finished());
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within timeout");
}

// ---- scenarios -----------------------------------------------------------

#[test]
fn three_covisible_keyframes_share_tracks() {
    let h = Harness::start();
    let positions = track_positions(20);
    let points: Vec<Arc<MapPoint>> = positions
        .iter()
        .enumerate()
        .map(|(i, p)| h.map.create_map_point(*p, KeyFrameId(0), descriptor(i as u8)))
        .collect();

    for i in 0..3u64 {
        let tracked: Vec<_> = positions
            .iter()
            .zip(points.iter())
            .map(|(p, mp)| (*p, Some(mp.id())))
            .collect();
        let kf = build_keyframe(i, 0.3 * i as f64, 0, &tracked);
        h.insert_and_wait(kf);
    }
    wait_until(|| points.iter().all(|p| p.n_observations() == 3));

    // covisibility edges carry the shared-track count, symmetrically
    let kf0 = h.map.keyframe(KeyFrameId(0)).unwrap();
    let kf1 = h.map.keyframe(KeyFrameId(1)).unwrap();
    let kf2 = h.map.keyframe(KeyFrameId(2)).unwrap();
    assert!(kf0.connection_weight(kf1.id()) >= 20);
    assert!(kf1.connection_weight(kf0.id()) >= 20);
    assert!(kf2.connection_weight(kf0.id()) >= 20);

    // local BA ran once three keyframes were in the map
    wait_until(|| h.bundle_adjuster.calls.load(Ordering::SeqCst) >= 1);

    // keyframes reached the loop closer in FIFO order
    wait_until(|| h.loop_closer.ids.lock().len() == 3);
    assert_eq!(*h.loop_closer.ids.lock(), vec![0, 1, 2]);

    h.finish();
}

#[test]
fn redundant_keyframe_is_culled() {
    let h = Harness::start();
    let shared = track_positions(20);
    let shared_points: Vec<Arc<MapPoint>> = shared
        .iter()
        .enumerate()
        .map(|(i, p)| h.map.create_map_point(*p, KeyFrameId(0), descriptor(i as u8)))
        .collect();
    let shared_tracked: Vec<_> = shared
        .iter()
        .zip(shared_points.iter())
        .map(|(p, mp)| (*p, Some(mp.id())))
        .collect();

    // kf0..kf3 all observe the shared tracks; kf1 observes them at a
    // coarser pyramid level, so everything it sees is covered at equal or
    // finer scale by at least three other keyframes
    h.insert_and_wait(build_keyframe(0, 0.0, 0, &shared_tracked));
    h.insert_and_wait(build_keyframe(1, 0.3, 1, &shared_tracked));

    // kf2 additionally holds exclusive points so it stays below the
    // redundancy fraction
    let exclusive = vec![
        Point3::new(-2.4, 0.0, 6.0),
        Point3::new(2.4, 0.2, 6.2),
        Point3::new(-2.2, -0.9, 6.4),
        Point3::new(2.2, 0.9, 6.6),
        Point3::new(-2.6, 0.5, 6.8),
    ];
    let exclusive_points: Vec<Arc<MapPoint>> = exclusive
        .iter()
        .enumerate()
        .map(|(i, p)| h.map.create_map_point(*p, KeyFrameId(2), descriptor(100 + i as u8)))
        .collect();
    let mut kf2_tracked = shared_tracked.clone();
    kf2_tracked.extend(
        exclusive
            .iter()
            .zip(exclusive_points.iter())
            .map(|(p, mp)| (*p, Some(mp.id()))),
    );
    h.insert_and_wait(build_keyframe(2, 0.6, 0, &kf2_tracked));
    h.insert_and_wait(build_keyframe(3, 0.9, 0, &shared_tracked));

    wait_until(|| h.map.keyframe(KeyFrameId(1)).is_none());
    assert_eq!(h.map.keyframes_in_map(), 3);
    // the shared tracks lost exactly the culled observation
    for p in &shared_points {
        assert_eq!(p.n_observations(), 3);
        assert!(!p.is_observed_by(KeyFrameId(1)));
    }
    h.finish();
}

#[test]
fn stop_release_roundtrip_discards_queued_keyframes() {
    let h = Harness::start();
    wait_until(|| h.mapper.accept_keyframes());

    h.mapper.request_stop();
    wait_until(|| h.mapper.is_stopped());
    assert!(h.mapper.stop_requested());

    // a keyframe inserted while stopped is dropped by release
    let positions = track_positions(4);
    let tracked: Vec<_> = positions.iter().map(|p| (*p, None)).collect();
    h.mapper.insert_keyframe(build_keyframe(0, 0.0, 0, &tracked));
    h.mapper.release();
    wait_until(|| h.mapper.accept_keyframes());
    assert!(!h.mapper.is_stopped());
    assert!(!h.mapper.stop_requested());
    thread::sleep(Duration::from_millis(30));
    assert_eq!(h.map.keyframes_in_map(), 0);

    // the released mapper behaves like a fresh one
    h.insert_and_wait(build_keyframe(1, 0.0, 0, &tracked));
    assert_eq!(h.map.keyframes_in_map(), 1);
    h.finish();
}

#[test]
fn set_not_stop_blocks_stopping() {
    let h = Harness::start();
    assert!(h.mapper.set_not_stop(true));
    h.mapper.request_stop();
    thread::sleep(Duration::from_millis(30));
    assert!(!h.mapper.is_stopped());

    assert!(h.mapper.set_not_stop(false));
    wait_until(|| h.mapper.is_stopped());
    // cannot forbid stopping once stopped
    assert!(!h.mapper.set_not_stop(true));
    h.mapper.release();
    h.finish();
}

#[test]
fn reset_returns_and_mapper_keeps_working() {
    let h = Harness::start();
    h.mapper.request_reset();

    let positions = track_positions(4);
    let tracked: Vec<_> = positions.iter().map(|p| (*p, None)).collect();
    h.insert_and_wait(build_keyframe(0, 0.0, 0, &tracked));
    assert_eq!(h.map.keyframes_in_map(), 1);
    h.finish();
}

#[test]
fn map_lines_triangulate_from_three_views() {
    let h = Harness::start();
    let positions = track_positions(20);
    let points: Vec<Arc<MapPoint>> = positions
        .iter()
        .enumerate()
        .map(|(i, p)| h.map.create_map_point(*p, KeyFrameId(0), descriptor(i as u8)))
        .collect();
    let tracked: Vec<_> = positions
        .iter()
        .zip(points.iter())
        .map(|(p, mp)| (*p, Some(mp.id())))
        .collect();

    // steep segments so nothing runs along the x-axis baseline
    let segments = [
        (Point3::new(0.5, -0.8, 5.5), Point3::new(0.8, 0.7, 6.0)),
        (Point3::new(-0.9, -0.6, 5.2), Point3::new(-0.7, 0.9, 5.8)),
    ];

    for i in 0..3u64 {
        let kf = build_keyframe_with_lines(i, 0.3 * i as f64, &tracked, &segments);
        h.insert_and_wait(kf);
    }
    wait_until(|| h.map.lines_in_map() == segments.len());

    let lines = h.map.map_lines();
    for line in &lines {
        assert_eq!(line.n_observations(), 3);
        let (s, e) = line.endpoints();
        let hit = segments.iter().any(|(ts, te)| {
            (s - *ts).norm() < 1e-6 && (e - *te).norm() < 1e-6
        });
        assert!(hit, "unexpected endpoints {s:?} {e:?}");
    }
    // the observing keyframes point back at the lines
    let kf2 = h.map.keyframe(KeyFrameId(2)).unwrap();
    let slots = kf2.map_line_ids();
    assert!(slots.iter().all(|s| s.is_some()));
    h.finish();
}

#[test]
fn fusion_attaches_neighbor_points_and_is_idempotent() {
    let h = Harness::start();
    let shared = track_positions(20);
    let shared_points: Vec<Arc<MapPoint>> = shared
        .iter()
        .enumerate()
        .map(|(i, p)| h.map.create_map_point(*p, KeyFrameId(0), descriptor(i as u8)))
        .collect();
    let shared_tracked: Vec<_> = shared
        .iter()
        .zip(shared_points.iter())
        .map(|(p, mp)| (*p, Some(mp.id())))
        .collect();

    // extra structure seen by kf0 and kf1 but initially unknown to kf2
    let extra = vec![
        Point3::new(-1.8, 0.9, 6.1),
        Point3::new(1.8, -0.9, 6.3),
        Point3::new(0.0, 1.1, 6.5),
    ];
    let extra_points: Vec<Arc<MapPoint>> = extra
        .iter()
        .enumerate()
        .map(|(i, p)| h.map.create_map_point(*p, KeyFrameId(0), descriptor(200 + i as u8)))
        .collect();

    let mut kf01_tracked = shared_tracked.clone();
    kf01_tracked.extend(
        extra
            .iter()
            .zip(extra_points.iter())
            .map(|(p, mp)| (*p, Some(mp.id()))),
    );
    h.insert_and_wait(build_keyframe(0, 0.0, 0, &kf01_tracked));
    h.insert_and_wait(build_keyframe(1, 0.3, 0, &kf01_tracked));

    // kf2 has keypoints where the extra points project, but no
    // associations for them; neighborhood fusion must attach them
    let mut kf2_tracked = shared_tracked.clone();
    kf2_tracked.extend(extra.iter().map(|p| (*p, None)));
    let kf2 = build_keyframe(2, 0.6, 0, &kf2_tracked);
    h.insert_and_wait(kf2.clone());

    wait_until(|| extra_points.iter().all(|p| p.is_observed_by(KeyFrameId(2))));
    for (i, p) in extra_points.iter().enumerate() {
        assert_eq!(p.n_observations(), 3, "extra point {i}");
        assert_eq!(kf2.map_point_id_at(20 + i), Some(p.id()));
    }

    // running the same fusion again changes nothing
    let before: Vec<_> = extra_points.iter().map(|p| p.observations()).collect();
    let fused = h.matcher.fuse_points(&kf2, &extra_points, &h.map);
    assert_eq!(fused, 0);
    let after: Vec<_> = extra_points.iter().map(|p| p.observations()).collect();
    assert_eq!(before, after);

    h.finish();
}
