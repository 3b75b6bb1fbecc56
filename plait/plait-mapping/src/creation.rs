//! Creation of new map points and map lines from covisible keyframes.

use std::sync::Arc;

use itertools::Itertools;
use nalgebra::{Point2, Vector2, Vector3, Vector4};
use tracing::debug;

use plait_map::KeyFrame;
use plait_mvg::{
    backprojection_plane, fundamental_from_poses, projection_matrix, triangulate_line_endpoint,
    triangulate_point,
};
use plait_types::LineFeature;

use crate::local_mapping::LocalMapping;

/// Rays this close to parallel triangulate unreliably at any depth.
const COS_PARALLAX_LIMIT: f64 = 0.99998;
/// Point-creation ray gate, slightly tighter than the hard limit.
const COS_RAY_GATE: f64 = 0.9998;
/// Epipolar line nearly parallel to the observed segment.
const COS_EPIPOLAR_PARALLEL: f64 = 0.996;
/// Plane-intersection direction must lie in the first view's
/// back-projection plane (sine of half a degree).
const COS_DIRECTION_GATE: f64 = 0.0087;
/// Chi-square gates for point and line reprojection residuals.
const CHI2_POINT: f64 = 5.991;
const CHI2_LINE: f64 = 3.84;
/// Required mutual overlap of reprojected and observed segments.
const MIN_SEGMENT_OVERLAP: f64 = 0.85;

impl LocalMapping {
    /// Triangulate new map points against the best covisible neighbors.
    pub(crate) fn create_new_map_points(&self, current: &Arc<KeyFrame>) {
        let neighbors = current.best_covisible(self.params.point_creation_neighbors);

        let pose1 = current.pose();
        let o1 = pose1.camera_center();
        let cam1 = *current.camera();
        let k1 = cam1.matrix();
        let p_mat1 = projection_matrix(&k1, &pose1);
        let pyramid1 = current.pyramid().clone();
        let ratio_factor = 1.5 * pyramid1.scale_factor;

        let mut n_new = 0usize;
        for (i, neighbor_id) in neighbors.iter().enumerate() {
            // catch up instead when the tracker is producing keyframes
            if i > 0 && self.has_new_keyframes() {
                return;
            }
            let Some(kf2) = self.map.keyframe(*neighbor_id) else {
                continue;
            };
            if kf2.is_bad() {
                continue;
            }

            let o2 = kf2.camera_center();
            let baseline = (o2 - o1).norm();
            let median_depth = kf2.scene_median_depth(&self.map, 2);
            if median_depth <= 0.0
                || baseline / median_depth < self.params.min_baseline_depth_ratio
            {
                continue;
            }

            let pose2 = kf2.pose();
            let cam2 = *kf2.camera();
            let k2 = cam2.matrix();
            let Ok(f12) = fundamental_from_poses(&pose1, &pose2, &k1, &k2) else {
                continue;
            };
            let matches = self.matcher.search_for_triangulation(current, &kf2, &f12);
            let p_mat2 = projection_matrix(&k2, &pose2);
            let pyramid2 = kf2.pyramid();

            for (idx1, idx2) in matches {
                if current.map_point_id_at(idx1).is_some() || kf2.map_point_id_at(idx2).is_some()
                {
                    continue;
                }
                let kp1 = current.keypoint(idx1);
                let kp2 = kf2.keypoint(idx2);

                let ray1 = pose1.rotation.transpose() * cam1.backproject(&kp1.pt);
                let ray2 = pose2.rotation.transpose() * cam2.backproject(&kp2.pt);
                let cos_rays = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());
                if !(cos_rays > 0.0 && cos_rays < COS_RAY_GATE) {
                    continue;
                }

                let Ok(x) = triangulate_point(&kp1.pt, &kp2.pt, &p_mat1, &p_mat2) else {
                    continue;
                };
                if !x.coords.iter().all(|v| v.is_finite()) {
                    continue;
                }

                let x_c1 = pose1.transform_point(&x);
                if x_c1.z <= 0.0 {
                    continue;
                }
                let x_c2 = pose2.transform_point(&x);
                if x_c2.z <= 0.0 {
                    continue;
                }

                let sigma2_1 = pyramid1.sigma2(kp1.octave);
                let err1 = (cam1.project(&x_c1) - kp1.pt).norm_squared();
                if err1 > CHI2_POINT * sigma2_1 {
                    continue;
                }
                let sigma2_2 = pyramid2.sigma2(kp2.octave);
                let err2 = (cam2.project(&x_c2) - kp2.pt).norm_squared();
                if err2 > CHI2_POINT * sigma2_2 {
                    continue;
                }

                let dist1 = (x - o1).norm();
                let dist2 = (x - o2).norm();
                if dist1 == 0.0 || dist2 == 0.0 {
                    continue;
                }
                let ratio_dist = dist2 / dist1;
                let ratio_octave = pyramid1.scale(kp1.octave) / pyramid2.scale(kp2.octave);
                if ratio_dist * ratio_factor < ratio_octave
                    || ratio_dist > ratio_octave * ratio_factor
                {
                    continue;
                }

                let point =
                    self.map
                        .create_map_point(x, current.id(), *current.descriptor(idx1));
                point.add_observation(current.id(), idx1);
                point.add_observation(kf2.id(), idx2);
                current.add_map_point(idx1, point.id());
                kf2.add_map_point(idx2, point.id());
                point.compute_distinctive_descriptor(&self.map);
                point.update_normal_and_depth(&self.map);
                self.recent_points.lock().push(point);
                n_new += 1;
            }
        }
        debug!(n_new, "created map points");
    }

    /// Triangulate new map lines from triples of views: the current
    /// keyframe contributes the endpoint rays, two neighbors contribute
    /// back-projection planes.
    pub(crate) fn create_new_map_lines(&self, current: &Arc<KeyFrame>) {
        if current.n_keylines() == 0 {
            return;
        }
        let neighbor_ids = current.best_covisible(self.params.line_creation_neighbors);
        let neighbors: Vec<Arc<KeyFrame>> = neighbor_ids
            .iter()
            .filter_map(|id| self.map.keyframe(*id))
            .filter(|kf| !kf.is_bad())
            .collect();
        if neighbors.len() < 2 {
            return;
        }

        let line_matches: Vec<Vec<Option<usize>>> = neighbors
            .iter()
            .map(|kf2| self.matcher.search_line_matches(current, kf2))
            .collect();

        let pose1 = current.pose();
        let cam1 = *current.camera();
        let k1 = cam1.matrix();
        let m1 = projection_matrix(&k1, &pose1);
        let o1 = pose1.camera_center();
        let median_depth = current.scene_median_depth(&self.map, 2);
        if median_depth <= 0.0 {
            return;
        }

        let mut n_new = 0usize;
        for (j, k) in (0..neighbors.len()).tuple_combinations() {
            let kf2 = &neighbors[j];
            let kf3 = &neighbors[k];
            let pose2 = kf2.pose();
            let pose3 = kf3.pose();
            let cam2 = *kf2.camera();
            let cam3 = *kf3.camera();
            let m2 = projection_matrix(&cam2.matrix(), &pose2);
            let m3 = projection_matrix(&cam3.matrix(), &pose3);
            let o2 = pose2.camera_center();
            let o3 = pose3.camera_center();
            let Ok(f21) = fundamental_from_poses(&pose2, &pose1, &cam2.matrix(), &k1) else {
                continue;
            };

            for idx1 in 0..current.n_keylines() {
                if current.map_line_id_at(idx1).is_some() {
                    continue;
                }
                let Some(idx2) = line_matches[j].get(idx1).copied().flatten() else {
                    continue;
                };
                let Some(idx3) = line_matches[k].get(idx1).copied().flatten() else {
                    continue;
                };
                if idx2 >= kf2.n_keylines() || idx3 >= kf3.n_keylines() {
                    continue;
                }
                if kf2.map_line_id_at(idx2).is_some() || kf3.map_line_id_at(idx3).is_some() {
                    continue;
                }
                let kl1 = current.keyline(idx1);
                let kl2 = kf2.keyline(idx2);
                let kl3 = kf3.keyline(idx3);

                let plane2 = backprojection_plane(&kl2.coeffs, &m2);
                let plane3 = backprojection_plane(&kl3.coeffs, &m3);
                let Some(direction) = plane_intersection_direction(&plane2, &plane3) else {
                    continue;
                };
                let plane1 = backprojection_plane(&kl1.coeffs, &m1);
                let n1 = plane1.xyz();
                let n1_norm = n1.norm();
                if n1_norm < 1e-12 {
                    continue;
                }
                // the recovered direction has to lie in the first view's
                // back-projection plane, otherwise the triple is
                // inconsistent or the line sits on the epipolar plane
                if (n1.dot(&direction) / n1_norm).abs() >= COS_DIRECTION_GATE {
                    continue;
                }

                if epipolar_parallel(&f21, kl1, kl2) {
                    continue;
                }

                let Ok(s) = triangulate_line_endpoint(&kl1.start, &m1, &plane2, &plane3) else {
                    continue;
                };
                let Ok(e) = triangulate_line_endpoint(&kl1.end, &m1, &plane2, &plane3) else {
                    continue;
                };
                if !s.coords.iter().all(|v| v.is_finite())
                    || !e.coords.iter().all(|v| v.is_finite())
                {
                    continue;
                }

                // cheirality in all three views
                let endpoints_c = [
                    (pose1.transform_point(&s), pose1.transform_point(&e)),
                    (pose2.transform_point(&s), pose2.transform_point(&e)),
                    (pose3.transform_point(&s), pose3.transform_point(&e)),
                ];
                if endpoints_c
                    .iter()
                    .any(|(sc, ec)| sc.z <= 0.0 || ec.z <= 0.0)
                {
                    continue;
                }

                // each endpoint needs real parallax from at least two of
                // the three camera pairs
                let centers = [o1, o2, o3];
                let enough_parallax = [s, e].iter().all(|x| {
                    let mut pairs = 0;
                    for (a, b) in (0..3).tuple_combinations() {
                        let ra = *x - centers[a];
                        let rb = *x - centers[b];
                        if ra.dot(&rb) / (ra.norm() * rb.norm()) < COS_PARALLAX_LIMIT {
                            pairs += 1;
                        }
                    }
                    pairs >= 2
                });
                if !enough_parallax {
                    continue;
                }

                // scale gates against the current scene
                if (s - o1).norm() < 0.3 * median_depth || (e - o1).norm() < 0.3 * median_depth
                {
                    continue;
                }
                if (e - s).norm() > median_depth {
                    continue;
                }

                let views = [
                    (&cam1, &endpoints_c[0], kl1, current.pyramid()),
                    (&cam2, &endpoints_c[1], kl2, kf2.pyramid()),
                    (&cam3, &endpoints_c[2], kl3, kf3.pyramid()),
                ];
                let residuals_ok = views.iter().all(|(cam, (sc, ec), kl, pyramid)| {
                    let sigma2 = pyramid.sigma2(kl.octave);
                    let ps = cam.project(sc);
                    let pe = cam.project(ec);
                    let rs = kl.coeffs.x * ps.x + kl.coeffs.y * ps.y + kl.coeffs.z;
                    let re = kl.coeffs.x * pe.x + kl.coeffs.y * pe.y + kl.coeffs.z;
                    rs * rs <= CHI2_LINE * sigma2 && re * re <= CHI2_LINE * sigma2
                });
                if !residuals_ok {
                    continue;
                }

                let overlap_ok = views.iter().all(|(cam, (sc, ec), kl, _)| {
                    segments_overlap(&cam.project(sc), &cam.project(ec), kl)
                });
                if !overlap_ok {
                    continue;
                }

                let line = self.map.create_map_line(
                    s,
                    e,
                    current.id(),
                    *current.line_descriptor(idx1),
                );
                line.add_observation(current.id(), idx1);
                line.add_observation(kf2.id(), idx2);
                line.add_observation(kf3.id(), idx3);
                current.add_map_line(idx1, line.id());
                kf2.add_map_line(idx2, line.id());
                kf3.add_map_line(idx3, line.id());
                line.compute_distinctive_descriptor(&self.map);
                line.update_normal_and_depth(&self.map);
                self.recent_lines.lock().push(line);
                n_new += 1;
            }
        }
        debug!(n_new, "created map lines");
    }
}

/// Unit direction of the intersection of two back-projection planes, or
/// `None` when the planes are close to parallel.
fn plane_intersection_direction(
    plane_a: &Vector4<f64>,
    plane_b: &Vector4<f64>,
) -> Option<Vector3<f64>> {
    let na = plane_a.xyz();
    let nb = plane_b.xyz();
    let d = na.cross(&nb);
    let norm = d.norm();
    if norm < 1e-10 {
        return None;
    }
    Some(d / norm)
}

/// Whether the epipolar lines of the segment endpoints run nearly
/// parallel to the observed segment in the second view.
fn epipolar_parallel(
    f21: &nalgebra::Matrix3<f64>,
    kl1: &LineFeature,
    kl2: &LineFeature,
) -> bool {
    let dir2 = (kl2.end - kl2.start).normalize();
    [kl1.start, kl1.end].iter().any(|p: &Point2<f64>| {
        let l = f21 * Vector3::new(p.x, p.y, 1.0);
        let d = Vector2::new(-l.y, l.x);
        let n = d.norm();
        n < 1e-12 || (d.dot(&dir2) / n).abs() > COS_EPIPOLAR_PARALLEL
    })
}

/// Mutual-overlap test of the reprojected segment and the observed one
/// along the observed segment's dominant axis.
fn segments_overlap(proj_s: &Point2<f64>, proj_e: &Point2<f64>, observed: &LineFeature) -> bool {
    let quarter = std::f64::consts::FRAC_PI_4;
    let y_dominant = {
        let a = observed.angle.abs();
        a > quarter && a < 3.0 * quarter
    };
    let (ps, pe, os, oe) = if y_dominant {
        (proj_s.y, proj_e.y, observed.start.y, observed.end.y)
    } else {
        (proj_s.x, proj_e.x, observed.start.x, observed.end.x)
    };
    let (p_lo, p_hi) = (ps.min(pe), ps.max(pe));
    let (o_lo, o_hi) = (os.min(oe), os.max(oe));
    let inter = (p_hi.min(o_hi) - p_lo.max(o_lo)).max(0.0);
    let p_extent = p_hi - p_lo;
    let o_extent = o_hi - o_lo;
    if p_extent <= 0.0 || o_extent <= 0.0 {
        return false;
    }
    inter >= MIN_SEGMENT_OVERLAP * p_extent && inter >= MIN_SEGMENT_OVERLAP * o_extent
}
