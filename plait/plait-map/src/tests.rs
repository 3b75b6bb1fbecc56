use std::sync::Arc;

use nalgebra::Point3;

use plait_types::{CameraIntrinsics, Descriptor, FrameFeatures, PointFeature, Pose, ScalePyramid};

use crate::{KeyFrame, KeyFrameId, Map};

fn descriptor(seed: u8) -> Descriptor {
    let mut raw = [0u8; 32];
    for (i, b) in raw.iter_mut().enumerate() {
        *b = seed.wrapping_mul(31).wrapping_add(i as u8);
    }
    Descriptor(raw)
}

fn make_keyframe(map: &Map, id: u64, n_points: usize) -> Arc<KeyFrame> {
    let camera = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
    let keypoints = (0..n_points)
        .map(|i| PointFeature::new(10.0 + i as f64, 20.0 + i as f64, 0))
        .collect();
    let kf = KeyFrame::new(
        KeyFrameId(id),
        FrameFeatures {
            keypoints,
            keylines: Vec::new(),
            camera,
        },
        (0..n_points).map(|i| descriptor(i as u8)).collect(),
        Vec::new(),
        ScalePyramid::default(),
        Pose::identity(),
        Vec::new(),
        Vec::new(),
    );
    map.insert_keyframe(kf.clone());
    kf
}

fn observe(point: &Arc<crate::MapPoint>, kf: &Arc<KeyFrame>, idx: usize) {
    point.add_observation(kf.id(), idx);
    kf.add_map_point(idx, point.id());
}

#[test]
fn observation_bookkeeping_is_bijective() {
    let map = Map::new();
    let kf1 = make_keyframe(&map, 0, 8);
    let kf2 = make_keyframe(&map, 1, 8);
    let p = map.create_map_point(Point3::new(0.0, 0.0, 5.0), kf1.id(), descriptor(1));

    observe(&p, &kf1, 3);
    observe(&p, &kf2, 5);

    assert_eq!(p.n_observations(), 2);
    assert_eq!(p.observation_index(kf1.id()), Some(3));
    assert_eq!(p.observation_index(kf2.id()), Some(5));
    assert_eq!(kf1.map_point_id_at(3), Some(p.id()));
    assert_eq!(kf2.map_point_id_at(5), Some(p.id()));
}

#[test]
fn erasing_an_observation_starves_the_point() {
    let map = Map::new();
    let kfs: Vec<_> = (0..3).map(|i| make_keyframe(&map, i, 4)).collect();
    let p = map.create_map_point(Point3::new(0.0, 0.0, 5.0), kfs[0].id(), descriptor(1));
    for (i, kf) in kfs.iter().enumerate() {
        observe(&p, kf, i);
    }
    assert_eq!(map.points_in_map(), 1);

    // dropping to two observations triggers the bad flag and a full purge
    p.erase_observation(kfs[0].id(), &map);
    assert!(p.is_bad());
    assert_eq!(map.points_in_map(), 0);
    for (i, kf) in kfs.iter().enumerate() {
        assert_eq!(kf.map_point_id_at(i), None);
    }
}

#[test]
fn bad_points_accept_no_new_observations() {
    let map = Map::new();
    let kf = make_keyframe(&map, 0, 4);
    let p = map.create_map_point(Point3::new(0.0, 0.0, 5.0), kf.id(), descriptor(1));
    p.set_bad(&map);
    p.add_observation(kf.id(), 0);
    assert_eq!(p.n_observations(), 0);
}

#[test]
fn replace_merges_observations_and_counters() {
    let map = Map::new();
    let kf1 = make_keyframe(&map, 0, 8);
    let kf2 = make_keyframe(&map, 1, 8);
    let kf3 = make_keyframe(&map, 2, 8);

    let old = map.create_map_point(Point3::new(0.0, 0.0, 5.0), kf1.id(), descriptor(1));
    let new = map.create_map_point(Point3::new(0.0, 0.0, 5.01), kf2.id(), descriptor(2));

    observe(&old, &kf1, 0);
    observe(&old, &kf2, 1);
    observe(&new, &kf2, 2);
    observe(&new, &kf3, 3);
    old.increase_found(4);
    old.increase_visible(6);

    old.replace(&new, &map);

    assert!(old.is_bad());
    assert_eq!(old.replaced_by(), Some(new.id()));
    assert_eq!(map.points_in_map(), 1);
    // kf1 observation moved over, kf2 kept the existing slot of `new`
    assert_eq!(new.observation_index(kf1.id()), Some(0));
    assert_eq!(new.observation_index(kf2.id()), Some(2));
    assert_eq!(kf1.map_point_id_at(0), Some(new.id()));
    assert_eq!(kf2.map_point_id_at(1), None);
    // counters forwarded (initial 1/1 plus old's 5 found / 7 visible)
    assert!((new.found_ratio() - 6.0 / 8.0).abs() < 1e-12);
}

#[test]
fn replace_twice_is_a_no_op() {
    let map = Map::new();
    let kf1 = make_keyframe(&map, 0, 8);
    let kf2 = make_keyframe(&map, 1, 8);
    let old = map.create_map_point(Point3::new(0.0, 0.0, 5.0), kf1.id(), descriptor(1));
    let new = map.create_map_point(Point3::new(0.0, 0.0, 5.01), kf2.id(), descriptor(2));
    observe(&old, &kf1, 0);
    observe(&new, &kf2, 1);

    old.replace(&new, &map);
    let obs_after = new.observations();
    let ratio_after = new.found_ratio();
    old.replace(&new, &map);
    assert_eq!(new.observations(), obs_after);
    assert!((new.found_ratio() - ratio_after).abs() < 1e-12);
}

#[test]
fn covisibility_edges_are_symmetric_with_shared_counts() {
    let map = Map::new();
    let kf1 = make_keyframe(&map, 0, 20);
    let kf2 = make_keyframe(&map, 1, 20);

    for i in 0..16 {
        let p = map.create_map_point(Point3::new(i as f64, 0.0, 5.0), kf1.id(), descriptor(i));
        observe(&p, &kf1, i as usize);
        observe(&p, &kf2, i as usize);
    }

    kf1.update_connections(&map, 15);
    assert_eq!(kf1.covisible_keyframes(), vec![kf2.id()]);
    assert_eq!(kf1.connection_weight(kf2.id()), 16);
    // the symmetric half was installed on kf2
    assert_eq!(kf2.connection_weight(kf1.id()), 16);
}

#[test]
fn weak_covisibility_keeps_only_the_best_neighbor() {
    let map = Map::new();
    let kf1 = make_keyframe(&map, 0, 20);
    let kf2 = make_keyframe(&map, 1, 20);
    let kf3 = make_keyframe(&map, 2, 20);

    for i in 0..5 {
        let p = map.create_map_point(Point3::new(i as f64, 0.0, 5.0), kf1.id(), descriptor(i));
        observe(&p, &kf1, i as usize);
        observe(&p, &kf2, i as usize);
    }
    for i in 5..8 {
        let p = map.create_map_point(Point3::new(i as f64, 0.0, 5.0), kf1.id(), descriptor(i));
        observe(&p, &kf1, i as usize);
        observe(&p, &kf3, i as usize);
    }

    kf1.update_connections(&map, 15);
    // below threshold everywhere: only the strongest edge materializes
    assert_eq!(kf1.connection_weight(kf2.id()), 5);
    assert_eq!(kf2.connection_weight(kf1.id()), 5);
    assert_eq!(kf3.connection_weight(kf1.id()), 0);
}

#[test]
fn keyframe_set_bad_detaches_everything() {
    let map = Map::new();
    let kf1 = make_keyframe(&map, 0, 8);
    let kf2 = make_keyframe(&map, 1, 8);
    let kf3 = make_keyframe(&map, 2, 8);

    let mut points = Vec::new();
    for i in 0..4 {
        let p = map.create_map_point(Point3::new(i as f64, 0.0, 5.0), kf1.id(), descriptor(i));
        observe(&p, &kf1, i as usize);
        observe(&p, &kf2, i as usize);
        observe(&p, &kf3, i as usize);
        points.push(p);
    }
    kf2.update_connections(&map, 1);

    kf2.set_bad(&map);
    assert!(kf2.is_bad());
    assert_eq!(map.keyframes_in_map(), 2);
    assert_eq!(kf1.connection_weight(kf2.id()), 0);
    for p in &points {
        // two observations remain, which starves and purges the points
        assert!(p.is_bad());
    }
}

#[test]
fn scene_median_depth_is_the_sorted_middle() {
    let map = Map::new();
    let kf = make_keyframe(&map, 0, 4);
    for (i, z) in [6.0, 2.0, 8.0, 4.0].iter().enumerate() {
        let p = map.create_map_point(Point3::new(0.0, 0.0, *z), kf.id(), descriptor(i as u8));
        observe(&p, &kf, i);
    }
    let depth = kf.scene_median_depth(&map, 2);
    assert!((depth - 4.0).abs() < 1e-12, "median depth {depth}");
}

#[test]
fn distinctive_descriptor_minimizes_median_distance() {
    use crate::map_point::distinctive_descriptor;
    let mut a = [0u8; 32];
    a[0] = 0b1111_1111;
    let mut b = [0u8; 32];
    b[0] = 0b0000_0111;
    let mut c = [0u8; 32];
    c[0] = 0b0000_0000;
    // medians: a → 5, b → 3, c → 3; ties keep the earliest, so b wins
    let best = distinctive_descriptor(&[Descriptor(a), Descriptor(b), Descriptor(c)]).unwrap();
    assert_eq!(best, Descriptor(b));
}

#[test]
fn clear_empties_every_arena() {
    let map = Map::new();
    let kf = make_keyframe(&map, 0, 4);
    let p = map.create_map_point(Point3::new(0.0, 0.0, 5.0), kf.id(), descriptor(0));
    observe(&p, &kf, 0);
    map.create_map_line(
        Point3::new(0.0, 0.0, 4.0),
        Point3::new(1.0, 0.0, 4.0),
        kf.id(),
        descriptor(1),
    );
    map.clear();
    assert_eq!(map.keyframes_in_map(), 0);
    assert_eq!(map.points_in_map(), 0);
    assert_eq!(map.lines_in_map(), 0);
}
