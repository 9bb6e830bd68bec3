//! Local Mapper - the mapping worker.
//!
//! Processes keyframes received from tracking, one commit per keyframe:
//! 1. Inserts the keyframe into the map
//! 2. Folds in tracking statistics and associates matched landmarks
//! 3. Culls landmarks with poor tracking ratio, high error or one observer
//! 4. Triangulates new landmarks against covisible keyframes
//! 5. Fuses duplicates with the neighbors (SearchInNeighbors)
//! 6. Local BA over the most covisible window
//! 7. Culls redundant keyframes
//! 8. Hands the keyframe to loop closing
//!
//! Every pass runs on a private copy of the map and is published with a
//! single pointer swap, so tracking never sees a half-applied pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::error::ResultCode;
use crate::loop_closing::LoopCloser;
use crate::map::{KeyFrameId, LandmarkId, Map, MapError};
use crate::optimizer::{local_bundle_adjustment, LocalBAConfig};
use crate::system::config::SlamConfig;
use crate::system::messages::NewKeyFrameMsg;
use crate::system::shared_state::SharedState;
use crate::tracking::frame::CameraModel;

use super::search_in_neighbors::{search_in_neighbors, SearchInNeighborsConfig};
use super::triangulation::{triangulate_from_neighbors, TriangulationConfig};

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Tunables of a mapping pass.
#[derive(Debug, Clone)]
pub struct LocalMappingConfig {
    pub triangulation: TriangulationConfig,
    pub fusion: SearchInNeighborsConfig,
    pub local_ba: LocalBAConfig,
    /// Landmarks matched in fewer than this fraction of the frames that
    /// should have seen them are culled.
    pub min_found_ratio: f64,
    /// Keyframes a new landmark gets before the found-ratio and observer
    /// checks apply.
    pub grace_keyframes: u64,
    /// A keyframe is redundant when this fraction of its landmarks is seen
    /// by at least `redundant_observers` other keyframes.
    pub redundancy_ratio: f64,
    pub redundant_observers: usize,
}

impl Default for LocalMappingConfig {
    fn default() -> Self {
        Self {
            triangulation: TriangulationConfig::default(),
            fusion: SearchInNeighborsConfig::default(),
            local_ba: LocalBAConfig::default(),
            min_found_ratio: 0.25,
            grace_keyframes: 3,
            redundancy_ratio: 0.9,
            redundant_observers: 3,
        }
    }
}

/// What one mapping pass did.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingReport {
    pub keyframe: KeyFrameId,
    pub num_matched: usize,
    pub num_new_landmarks: usize,
    pub num_fused: usize,
    pub num_culled_landmarks: usize,
    pub num_ba_outliers: usize,
    pub num_culled_keyframes: usize,
}

/// Mapping worker state.
pub struct LocalMapper {
    camera: CameraModel,
    shared: Arc<SharedState>,
    config: LocalMappingConfig,
    loop_closer: LoopCloser,
}

impl LocalMapper {
    pub fn new(camera: CameraModel, shared: Arc<SharedState>) -> Self {
        let loop_closer = LoopCloser::new(camera.clone());
        Self {
            camera,
            shared,
            config: LocalMappingConfig::default(),
            loop_closer,
        }
    }

    pub fn with_config(mut self, config: LocalMappingConfig) -> Self {
        self.config = config;
        self
    }

    /// Worker loop: receive keyframes and process them.
    ///
    /// Runs until shutdown is requested or the channel is closed.
    pub fn run(&mut self, kf_receiver: Receiver<NewKeyFrameMsg>) {
        info!("[LocalMapping] Worker started");
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            match kf_receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    self.process_keyframe(msg);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("[LocalMapping] Worker stopped");
    }

    /// Run one mapping pass (and loop closing) for a keyframe.
    ///
    /// Returns the id of the committed keyframe, or `None` when the message
    /// was stale or the pass failed.
    pub fn process_keyframe(&mut self, msg: NewKeyFrameMsg) -> Option<KeyFrameId> {
        if self.shared.is_failed() {
            return None;
        }
        let config = self.shared.config();
        let epoch = msg.epoch;

        let outcome = {
            let this = &*self;
            this.shared
                .try_commit(epoch, |map| this.mapping_pass(map, &msg, &config))
        };

        let report = match outcome {
            None => {
                debug!("[LocalMapping] Dropping keyframe from stale map epoch {}", epoch);
                return None;
            }
            Some(Ok(report)) => report,
            Some(Err(MapError::CapacityExceeded { resource, limit })) => {
                let message = format!("keyframe rejected: {resource} ceiling of {limit} reached");
                warn!("[LocalMapping] {}", message);
                self.shared.report_error(ResultCode::OutOfMemory, &message);
                return None;
            }
            Some(Err(e)) => {
                self.shared.fail(format!("mapping pass failed: {e}"));
                return None;
            }
        };

        debug!(
            "[LocalMapping] {}: matched={} new={} fused={} culled_lm={} ba_outliers={} culled_kf={}",
            report.keyframe,
            report.num_matched,
            report.num_new_landmarks,
            report.num_fused,
            report.num_culled_landmarks,
            report.num_ba_outliers,
            report.num_culled_keyframes
        );

        if config.enable_loop_closure {
            self.loop_closer.process(&self.shared, report.keyframe, epoch, &config);
        }
        Some(report.keyframe)
    }

    /// The whole pass on a working copy of the map.
    fn mapping_pass(
        &self,
        map: &mut Map,
        msg: &NewKeyFrameMsg,
        config: &SlamConfig,
    ) -> Result<MappingReport, MapError> {
        // Step 1: Insert keyframe
        let kf_id = map.insert_keyframe(
            msg.timestamp,
            msg.pose,
            Arc::clone(&msg.features),
            msg.bow_vector.clone(),
        )?;
        let mut report = MappingReport {
            keyframe: kf_id,
            num_matched: 0,
            num_new_landmarks: 0,
            num_fused: 0,
            num_culled_landmarks: 0,
            num_ba_outliers: 0,
            num_culled_keyframes: 0,
        };

        // Step 2: Tracking statistics gathered since the last keyframe
        for (id, stats) in &msg.landmark_stats {
            if let Some(lm) = map.landmark_mut(*id) {
                lm.increase_visible(stats.visible);
                lm.increase_found(stats.found);
                if let Some(err) = stats.mean_error() {
                    lm.record_reprojection_error(err);
                }
            }
        }

        // Step 3: Associate landmarks matched by tracking
        let mut touched = Vec::new();
        for (idx, matched) in msg.matches.iter().enumerate() {
            let Some(lm_id) = *matched else { continue };
            // Culled or merged since the frame was tracked.
            if map.landmark(lm_id).is_none() {
                continue;
            }
            if map.associate(kf_id, idx, lm_id)? {
                touched.push(lm_id);
            }
        }
        report.num_matched = touched.len();
        for lm_id in touched {
            map.update_landmark_descriptor(lm_id);
        }

        // Step 4: Cull weak landmarks around the new keyframe
        report.num_culled_landmarks = self.cull_landmarks(map, kf_id, config);

        // Step 5: Triangulate new landmarks
        let tri = triangulate_from_neighbors(map, kf_id, &self.camera, &self.config.triangulation)?;
        report.num_new_landmarks = tri.num_new_points;

        // Step 6: Fuse duplicates with neighbors
        let fused = search_in_neighbors(map, kf_id, &self.camera, &self.config.fusion)?;
        report.num_fused = fused.num_fused;

        // Step 7: Local BA
        let should_stop = || self.shared.should_abort_ba();
        if let Some(ba) =
            local_bundle_adjustment(map, kf_id, &self.camera, &self.config.local_ba, &should_stop)?
        {
            for &(kf, idx) in &ba.outliers {
                map.disassociate(kf, idx);
            }
            report.num_ba_outliers = ba.outliers.len();
            debug!(
                "[LocalBA] {} iters={} error: {:.3} -> {:.3} px",
                kf_id, ba.iterations, ba.initial_error, ba.final_error
            );
        }

        // Step 8: Cull redundant keyframes
        report.num_culled_keyframes = self.cull_keyframes(map, kf_id)?;

        map.check_invariants()?;
        Ok(report)
    }

    /// Cull landmarks in the covisibility neighborhood of `current_kf_id`.
    ///
    /// Removes landmarks that:
    /// - Have a running reprojection error above the tracking threshold
    /// - Past the grace period, have found/visible below `min_found_ratio`
    /// - Past the grace period, are observed by a single keyframe
    fn cull_landmarks(&self, map: &mut Map, current_kf_id: KeyFrameId, config: &SlamConfig) -> usize {
        let to_cull: Vec<LandmarkId> = map
            .landmarks_in_neighborhood(current_kf_id, 1)
            .into_iter()
            .filter(|&id| {
                let Some(lm) = map.landmark(id) else {
                    return false;
                };
                if lm.reprojection_error > config.max_reprojection_error {
                    return true;
                }
                let age = current_kf_id.0.saturating_sub(lm.first_kf.0);
                if age < self.config.grace_keyframes {
                    return false;
                }
                lm.found_ratio() < self.config.min_found_ratio || lm.num_observations() < 2
            })
            .collect();

        let mut culled = 0;
        for id in to_cull {
            if map.remove_landmark(id).is_ok() {
                culled += 1;
            }
        }
        if culled > 0 {
            debug!(
                "[MapCulling] Removed {} landmarks (remaining: {})",
                culled,
                map.num_landmarks()
            );
        }
        culled
    }

    /// Cull keyframes whose landmarks are almost all seen by enough other
    /// keyframes. The origin and the current keyframe are never culled.
    fn cull_keyframes(&self, map: &mut Map, current_kf_id: KeyFrameId) -> Result<usize, MapError> {
        let candidates: BTreeSet<KeyFrameId> = match map.keyframe(current_kf_id) {
            Some(kf) => kf.covisibility().keys().copied().collect(),
            None => return Ok(0),
        };

        let mut culled = 0;
        for kf_id in candidates {
            if Some(kf_id) == map.origin() || kf_id == current_kf_id {
                continue;
            }
            // Re-evaluated against the map as it is after earlier removals.
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            let mut total = 0usize;
            let mut redundant = 0usize;
            for (_, lm_id) in kf.landmark_indices() {
                let Some(lm) = map.landmark(lm_id) else {
                    continue;
                };
                total += 1;
                if lm.num_observations() - 1 >= self.config.redundant_observers {
                    redundant += 1;
                }
            }
            if total > 0 && redundant as f64 >= self.config.redundancy_ratio * total as f64 {
                map.remove_keyframe(kf_id)?;
                culled += 1;
            }
        }

        if culled > 0 {
            info!(
                "[KFCulling] Removed {} redundant keyframes (remaining: {})",
                culled,
                map.num_keyframes()
            );
        }
        Ok(culled)
    }
}

impl std::fmt::Debug for LocalMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMapper")
            .field("config", &self.config)
            .field("loop_closer", &self.loop_closer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::MapLimits;
    use crate::system::messages::LandmarkStats;
    use crate::tracking::frame::{Descriptor, FeatureSet, KeyPoint};
    use crate::tracking::SystemState;
    use crate::vocabulary::BowVector;
    use nalgebra::Vector3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }

    fn scene(n: usize) -> (Vec<Vector3<f64>>, Vec<Descriptor>) {
        let mut rng = StdRng::seed_from_u64(5);
        let points = (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(4.0..6.0),
                )
            })
            .collect();
        let descs = (0..n)
            .map(|_| {
                let mut d = [0u8; 32];
                rng.fill(&mut d[..]);
                d
            })
            .collect();
        (points, descs)
    }

    fn features(points: &[Vector3<f64>], pose: &SE3, descs: &[Descriptor]) -> Arc<FeatureSet> {
        let cam = camera();
        Arc::new(FeatureSet {
            keypoints: points
                .iter()
                .map(|p| KeyPoint {
                    pt: cam.project(&pose.inverse().transform_point(p)).unwrap(),
                    angle: 0.0,
                    response: 1.0,
                })
                .collect(),
            descriptors: descs.to_vec(),
        })
    }

    fn translation(x: f64) -> SE3 {
        SE3::from_params(&Vector3::zeros(), &Vector3::new(x, 0.0, 0.0))
    }

    /// Two keyframes sharing the first 50 landmarks of the scene.
    fn setup() -> (Arc<SharedState>, Vec<Vector3<f64>>, Vec<Descriptor>, Vec<LandmarkId>) {
        let (points, descs) = scene(80);
        let mut map = Map::new("mapper", 0.0, MapLimits::default());
        let kf0 = map
            .insert_keyframe(0.0, SE3::identity(), features(&points, &SE3::identity(), &descs), BowVector::new())
            .unwrap();
        let kf1 = map
            .insert_keyframe(1.0, translation(0.3), features(&points, &translation(0.3), &descs), BowVector::new())
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..50 {
            let lm = map.insert_landmark(points[i], descs[i], kf0).unwrap();
            map.associate(kf0, i, lm).unwrap();
            map.associate(kf1, i, lm).unwrap();
            map.update_landmark_descriptor(lm);
            ids.push(lm);
        }
        let config = SlamConfig {
            enable_loop_closure: false,
            ..SlamConfig::default()
        };
        let shared = SharedState::new(map, config);
        shared.set_state(SystemState::Initializing);
        shared.set_state(SystemState::Ready);
        (shared, points, descs, ids)
    }

    fn message(
        shared: &SharedState,
        points: &[Vector3<f64>],
        descs: &[Descriptor],
        ids: &[LandmarkId],
        x: f64,
    ) -> NewKeyFrameMsg {
        let mut matches = vec![None; points.len()];
        for (i, id) in ids.iter().enumerate() {
            matches[i] = Some(*id);
        }
        NewKeyFrameMsg {
            epoch: shared.epoch(),
            timestamp: 2.0,
            pose: translation(x),
            features: features(points, &translation(x), descs),
            bow_vector: BowVector::new(),
            matches,
            landmark_stats: BTreeMap::new(),
        }
    }

    #[test]
    fn test_mapping_pass_extends_map() {
        let (shared, points, descs, ids) = setup();
        let mut mapper = LocalMapper::new(camera(), Arc::clone(&shared));

        let msg = message(&shared, &points, &descs, &ids, 0.6);
        let kf = mapper.process_keyframe(msg).unwrap();

        let map = shared.snapshot();
        assert_eq!(map.num_keyframes(), 3);
        // The 30 unmapped points were triangulated and fused into kf0.
        assert_eq!(map.num_landmarks(), 80);
        assert_eq!(map.keyframe(kf).unwrap().num_landmarks(), 80);
        for (idx, id) in map.keyframe(kf).unwrap().landmark_indices() {
            let lm = map.landmark(id).unwrap();
            assert!((lm.position() - points[idx]).norm() < 1e-3);
            assert_eq!(lm.num_observations(), 3);
        }
        map.check_invariants().unwrap();
        assert_eq!(shared.state(), SystemState::Ready);
    }

    #[test]
    fn test_tracking_statistics_are_folded_in() {
        let (shared, points, descs, ids) = setup();
        let mut mapper = LocalMapper::new(camera(), Arc::clone(&shared));

        let mut msg = message(&shared, &points, &descs, &ids, 0.6);
        msg.landmark_stats.insert(
            ids[0],
            LandmarkStats {
                visible: 4,
                found: 3,
                error_sum: 1.5,
            },
        );
        mapper.process_keyframe(msg).unwrap();

        let map = shared.snapshot();
        let lm = map.landmark(ids[0]).unwrap();
        assert_eq!(lm.visible_count, 5);
        assert_eq!(lm.found_count, 4);
        assert!((lm.reprojection_error - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_high_error_landmarks_are_culled() {
        let (shared, points, descs, ids) = setup();
        let mut mapper = LocalMapper::new(camera(), Arc::clone(&shared));

        let mut msg = message(&shared, &points, &descs, &ids, 0.6);
        msg.landmark_stats.insert(
            ids[3],
            LandmarkStats {
                visible: 2,
                found: 2,
                error_sum: 20.0,
            },
        );
        mapper.process_keyframe(msg).unwrap();
        assert!(shared.snapshot().landmark(ids[3]).is_none());
        shared.snapshot().check_invariants().unwrap();
    }

    #[test]
    fn test_stale_keyframe_is_dropped() {
        let (shared, points, descs, ids) = setup();
        let mut mapper = LocalMapper::new(camera(), Arc::clone(&shared));
        let msg = message(&shared, &points, &descs, &ids, 0.6);

        shared.replace_map(Map::new("fresh", 0.0, MapLimits::default()));
        assert!(mapper.process_keyframe(msg).is_none());
        assert!(shared.snapshot().is_empty());
        assert_eq!(shared.state(), SystemState::Ready);
    }

    #[test]
    fn test_capacity_rejection_reports_out_of_memory() {
        let (shared, points, descs, ids) = setup();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        shared.with_callbacks(|cb| {
            cb.on_error = Some(Arc::new(move |code, _| {
                assert_eq!(code, ResultCode::OutOfMemory);
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        });
        // Both keyframes are protected from headroom culling.
        let limited = shared.try_commit(shared.epoch(), |map| {
            map.set_limits(MapLimits {
                max_keyframes: 2,
                ..MapLimits::default()
            });
            Ok::<_, MapError>(())
        });
        assert!(matches!(limited, Some(Ok(()))));
        let before = shared.snapshot();

        let mut mapper = LocalMapper::new(camera(), Arc::clone(&shared));
        let msg = message(&shared, &points, &descs, &ids, 0.6);
        assert!(mapper.process_keyframe(msg).is_none());

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&before, &shared.snapshot()));
        assert_eq!(shared.state(), SystemState::Ready);
    }

    #[test]
    fn test_worker_exits_on_disconnect() {
        let (shared, points, descs, ids) = setup();
        let (tx, rx) = crossbeam_channel::bounded(4);
        tx.send(message(&shared, &points, &descs, &ids, 0.6)).unwrap();
        drop(tx);

        let mut mapper = LocalMapper::new(camera(), Arc::clone(&shared));
        mapper.run(rx);
        assert_eq!(shared.snapshot().num_keyframes(), 3);
    }
}
