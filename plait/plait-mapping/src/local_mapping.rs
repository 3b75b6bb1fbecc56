use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use plait_map::{KeyFrame, KeyFrameId, Map, MapLine, MapPoint};
use plait_types::MappingParams;

use crate::traits::{BowEncoder, BundleAdjuster, FeatureMatcher, LoopCloser};

const IDLE_SLEEP: Duration = Duration::from_millis(3);

#[derive(Default)]
struct StopFlags {
    stop_requested: bool,
    stopped: bool,
    not_stop: bool,
}

#[derive(Default)]
struct FinishFlags {
    requested: bool,
    finished: bool,
}

/// The local mapping loop and its control surface.
///
/// Construct once, wrap in an `Arc`, and hand a clone to a dedicated
/// thread running [`LocalMapping::run`]. Every other method is safe to
/// call from the tracker or loop-closer threads.
pub struct LocalMapping {
    pub(crate) map: Arc<Map>,
    pub(crate) params: MappingParams,
    pub(crate) matcher: Arc<dyn FeatureMatcher>,
    bundle_adjuster: Arc<dyn BundleAdjuster>,
    loop_closer: Arc<dyn LoopCloser>,
    bow_encoder: Arc<dyn BowEncoder>,

    queue: Mutex<VecDeque<Arc<KeyFrame>>>,
    /// Set whenever a newer keyframe arrives or a stop is requested; the
    /// bundle adjuster polls it between iterations.
    abort_ba: AtomicBool,
    accepting: AtomicBool,

    stop: Mutex<StopFlags>,
    finish: Mutex<FinishFlags>,
    reset_requested: Mutex<bool>,

    /// Probation lists of recently created elements, drained by culling.
    pub(crate) recent_points: Mutex<Vec<Arc<MapPoint>>>,
    pub(crate) recent_lines: Mutex<Vec<Arc<MapLine>>>,
}

impl LocalMapping {
    pub fn new(
        map: Arc<Map>,
        params: MappingParams,
        matcher: Arc<dyn FeatureMatcher>,
        bundle_adjuster: Arc<dyn BundleAdjuster>,
        loop_closer: Arc<dyn LoopCloser>,
        bow_encoder: Arc<dyn BowEncoder>,
    ) -> Self {
        LocalMapping {
            map,
            params,
            matcher,
            bundle_adjuster,
            loop_closer,
            bow_encoder,
            queue: Mutex::new(VecDeque::new()),
            abort_ba: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            stop: Mutex::new(StopFlags::default()),
            finish: Mutex::new(FinishFlags::default()),
            reset_requested: Mutex::new(false),
            recent_points: Mutex::new(Vec::new()),
            recent_lines: Mutex::new(Vec::new()),
        }
    }

    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    // ---- tracker-facing control -----------------------------------------

    pub fn insert_keyframe(&self, kf: Arc<KeyFrame>) {
        self.queue.lock().push_back(kf);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn accept_keyframes(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn set_accept_keyframes(&self, accept: bool) {
        self.accepting.store(accept, Ordering::SeqCst);
    }

    pub fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop.lock().stop_requested = true;
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.lock().stop_requested
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.lock().stopped
    }

    /// Honor a pending stop request at a safe point. Returns whether the
    /// mapper is now stopped.
    pub fn stop(&self) -> bool {
        let mut stop = self.stop.lock();
        if stop.stop_requested && !stop.not_stop {
            stop.stopped = true;
            info!("local mapping stopped");
            return true;
        }
        false
    }

    /// Resume after a stop. Queued keyframes from before the stop are
    /// discarded.
    pub fn release(&self) {
        if self.is_finished() {
            return;
        }
        {
            let mut stop = self.stop.lock();
            stop.stopped = false;
            stop.stop_requested = false;
        }
        let dropped = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        info!(dropped, "local mapping released");
    }

    /// Forbid (or re-allow) stopping; used by the tracker around keyframe
    /// insertion. Fails when already stopped.
    pub fn set_not_stop(&self, flag: bool) -> bool {
        let mut stop = self.stop.lock();
        if flag && stop.stopped {
            return false;
        }
        stop.not_stop = flag;
        true
    }

    /// Ask the loop to drop its queue and probation lists. Blocks until
    /// the loop observes the flag.
    pub fn request_reset(&self) {
        *self.reset_requested.lock() = true;
        loop {
            if !*self.reset_requested.lock() {
                break;
            }
            thread::sleep(IDLE_SLEEP);
        }
    }

    pub fn request_finish(&self) {
        self.finish.lock().requested = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finish.lock().finished
    }

    // ---- the main loop ---------------------------------------------------

    pub fn run(&self) {
        info!("local mapping started");
        loop {
            // while a keyframe is being integrated the tracker should not
            // hand over more
            self.set_accept_keyframes(false);

            if self.has_new_keyframes() {
                if let Some(kf) = self.process_new_keyframe() {
                    thread::scope(|s| {
                        s.spawn(|| self.cull_map_points(kf.id()));
                        s.spawn(|| self.cull_map_lines(kf.id()));
                    });
                    thread::scope(|s| {
                        s.spawn(|| self.create_new_map_points(&kf));
                        s.spawn(|| self.create_new_map_lines(&kf));
                    });

                    if !self.has_new_keyframes() {
                        self.search_in_neighbors(&kf);
                    }

                    self.abort_ba.store(false, Ordering::SeqCst);
                    if !self.has_new_keyframes() && !self.stop_requested() {
                        if self.map.keyframes_in_map() > 2 {
                            self.bundle_adjuster
                                .local_bundle_adjustment(&kf, &self.abort_ba, &self.map);
                        }
                        self.keyframe_culling(&kf);
                    }
                    self.loop_closer.insert_keyframe(kf);
                }
            } else if self.stop() {
                while self.is_stopped() && !self.check_finish() {
                    thread::sleep(IDLE_SLEEP);
                }
                if self.check_finish() {
                    break;
                }
            }

            self.reset_if_requested();
            self.set_accept_keyframes(true);
            if self.check_finish() {
                break;
            }
            thread::sleep(IDLE_SLEEP);
        }
        self.set_finish();
        info!("local mapping finished");
    }

    pub(crate) fn has_new_keyframes(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    fn check_finish(&self) -> bool {
        self.finish.lock().requested
    }

    fn set_finish(&self) {
        let mut finish = self.finish.lock();
        finish.finished = true;
        let mut stop = self.stop.lock();
        stop.stopped = true;
    }

    fn reset_if_requested(&self) {
        let mut requested = self.reset_requested.lock();
        if *requested {
            self.queue.lock().clear();
            self.recent_points.lock().clear();
            self.recent_lines.lock().clear();
            *requested = false;
            info!("local mapping reset");
        }
    }

    // ---- keyframe ingestion ----------------------------------------------

    /// Pop the next keyframe, attach it to the map elements the tracker
    /// matched, refresh covisibility, and insert it into the map.
    fn process_new_keyframe(&self) -> Option<Arc<KeyFrame>> {
        let kf = self.queue.lock().pop_front()?;

        kf.set_bow(self.bow_encoder.encode(kf.descriptors()));

        for (idx, pid) in kf.map_point_ids().into_iter().enumerate() {
            let Some(pid) = pid else { continue };
            let Some(point) = self.map.map_point(pid) else {
                kf.erase_map_point_at(idx);
                continue;
            };
            if point.is_bad() {
                kf.erase_map_point_at(idx);
                continue;
            }
            if !point.is_observed_by(kf.id()) {
                point.add_observation(kf.id(), idx);
                point.update_normal_and_depth(&self.map);
                point.compute_distinctive_descriptor(&self.map);
            } else {
                // inserted at creation time (map bootstrap): keep it on
                // probation
                self.recent_points.lock().push(point);
            }
        }
        for (idx, lid) in kf.map_line_ids().into_iter().enumerate() {
            let Some(lid) = lid else { continue };
            let Some(line) = self.map.map_line(lid) else {
                kf.erase_map_line_at(idx);
                continue;
            };
            if line.is_bad() {
                kf.erase_map_line_at(idx);
                continue;
            }
            if !line.is_observed_by(kf.id()) {
                line.add_observation(kf.id(), idx);
                line.update_normal_and_depth(&self.map);
                line.compute_distinctive_descriptor(&self.map);
            } else {
                self.recent_lines.lock().push(line);
            }
        }

        kf.update_connections(&self.map, self.params.covisibility_weight_threshold);
        self.map.insert_keyframe(kf.clone());
        debug!(kf = kf.id().0, "keyframe integrated");
        Some(kf)
    }

    // ---- probation culling -----------------------------------------------

    fn cull_map_points(&self, current: KeyFrameId) {
        let threshold = self.params.cull_obs_threshold;
        let min_found = self.params.min_found_ratio;
        let mut recent = self.recent_points.lock();
        let before = recent.len();
        recent.retain(|point| {
            if point.is_bad() {
                return false;
            }
            if point.found_ratio() < min_found {
                point.set_bad(&self.map);
                return false;
            }
            let age = current.0.saturating_sub(point.first_keyframe().0);
            if age >= 2 && point.n_observations() <= threshold {
                point.set_bad(&self.map);
                return false;
            }
            // survived probation
            if age >= 3 {
                return false;
            }
            true
        });
        debug!(culled = before - recent.len(), "map point culling");
    }

    fn cull_map_lines(&self, current: KeyFrameId) {
        let threshold = self.params.cull_obs_threshold;
        let min_found = self.params.min_found_ratio;
        let mut recent = self.recent_lines.lock();
        let before = recent.len();
        recent.retain(|line| {
            if line.is_bad() {
                return false;
            }
            if line.found_ratio() < min_found {
                line.set_bad(&self.map);
                return false;
            }
            let age = current.0.saturating_sub(line.first_keyframe().0);
            if age >= 2 && line.n_observations() <= threshold {
                line.set_bad(&self.map);
                return false;
            }
            if age >= 3 {
                return false;
            }
            true
        });
        debug!(culled = before - recent.len(), "map line culling");
    }

    // ---- duplicate fusion ------------------------------------------------

    /// Fuse the current keyframe's map elements with its one- and two-hop
    /// covisible neighbors, in both directions.
    fn search_in_neighbors(&self, current: &Arc<KeyFrame>) {
        let mut seen: BTreeSet<KeyFrameId> = BTreeSet::new();
        seen.insert(current.id());

        let mut one_hop: Vec<Arc<KeyFrame>> = Vec::new();
        for id in current.best_covisible(self.params.fuse_neighbors) {
            if !seen.insert(id) {
                continue;
            }
            let Some(kf) = self.map.keyframe(id) else { continue };
            if !kf.is_bad() {
                one_hop.push(kf);
            }
        }
        let mut targets: Vec<Arc<KeyFrame>> = one_hop.clone();
        for kf in &one_hop {
            for id2 in kf.best_covisible(self.params.fuse_second_neighbors) {
                if !seen.insert(id2) {
                    continue;
                }
                if let Some(kf2) = self.map.keyframe(id2) {
                    if !kf2.is_bad() {
                        targets.push(kf2);
                    }
                }
            }
        }

        // points: both directions over one- and two-hop targets
        let current_points: Vec<Arc<MapPoint>> = current
            .map_point_ids()
            .into_iter()
            .flatten()
            .filter_map(|id| self.map.map_point(id))
            .filter(|p| !p.is_bad())
            .collect();
        for target in &targets {
            self.matcher.fuse_points(target, &current_points, &self.map);
        }

        let mut candidate_ids = BTreeSet::new();
        let mut candidates: Vec<Arc<MapPoint>> = Vec::new();
        for target in &targets {
            for id in target.map_point_ids().into_iter().flatten() {
                if !candidate_ids.insert(id) {
                    continue;
                }
                let Some(point) = self.map.map_point(id) else { continue };
                if !point.is_bad() && !point.is_observed_by(current.id()) {
                    candidates.push(point);
                }
            }
        }
        let fused = self.matcher.fuse_points(current, &candidates, &self.map);
        debug!(fused, targets = targets.len(), "point fusion with neighbors");

        for id in current.map_point_ids().into_iter().flatten() {
            if let Some(point) = self.map.map_point(id) {
                if !point.is_bad() {
                    point.compute_distinctive_descriptor(&self.map);
                    point.update_normal_and_depth(&self.map);
                }
            }
        }

        // lines: the neighborhood never grows past one hop here
        let current_lines: Vec<Arc<MapLine>> = current
            .map_line_ids()
            .into_iter()
            .flatten()
            .filter_map(|id| self.map.map_line(id))
            .filter(|l| !l.is_bad())
            .collect();
        for target in &one_hop {
            self.matcher.fuse_lines(target, &current_lines, &self.map);
        }
        let mut line_candidate_ids = BTreeSet::new();
        let mut line_candidates: Vec<Arc<MapLine>> = Vec::new();
        for target in &one_hop {
            for id in target.map_line_ids().into_iter().flatten() {
                if !line_candidate_ids.insert(id) {
                    continue;
                }
                let Some(line) = self.map.map_line(id) else { continue };
                if !line.is_bad() && !line.is_observed_by(current.id()) {
                    line_candidates.push(line);
                }
            }
        }
        self.matcher.fuse_lines(current, &line_candidates, &self.map);
        for id in current.map_line_ids().into_iter().flatten() {
            if let Some(line) = self.map.map_line(id) {
                if !line.is_bad() {
                    line.compute_distinctive_descriptor(&self.map);
                    line.update_normal_and_depth(&self.map);
                }
            }
        }

        current.update_connections(&self.map, self.params.covisibility_weight_threshold);
    }

    // ---- keyframe retirement ---------------------------------------------

    /// Flag covisible keyframes whose map points are overwhelmingly seen
    /// by at least three other keyframes at equal or finer scale.
    fn keyframe_culling(&self, current: &Arc<KeyFrame>) {
        let required = self.params.redundant_observers;
        for kf_id in current.covisible_keyframes() {
            // the initial keyframe anchors the map
            if kf_id.0 == 0 {
                continue;
            }
            let Some(kf) = self.map.keyframe(kf_id) else { continue };
            if kf.is_bad() {
                continue;
            }

            let mut n_points = 0usize;
            let mut n_redundant = 0usize;
            for (idx, pid) in kf.map_point_ids().into_iter().enumerate() {
                let Some(pid) = pid else { continue };
                let Some(point) = self.map.map_point(pid) else {
                    continue;
                };
                if point.is_bad() {
                    continue;
                }
                n_points += 1;
                let level = kf.keypoint(idx).octave;
                let mut observers = 0usize;
                for (other_id, other_idx) in point.observations() {
                    if other_id == kf_id {
                        continue;
                    }
                    let Some(other) = self.map.keyframe(other_id) else {
                        continue;
                    };
                    if other.keypoint(other_idx).octave <= level + 1 {
                        observers += 1;
                        if observers >= required {
                            break;
                        }
                    }
                }
                if observers >= required {
                    n_redundant += 1;
                }
            }

            if n_points > 0
                && n_redundant as f64 > self.params.redundant_fraction * n_points as f64
            {
                debug!(kf = kf_id.0, n_redundant, n_points, "culling redundant keyframe");
                kf.set_bad(&self.map);
            }
        }
    }
}
