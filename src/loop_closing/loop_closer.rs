//! LoopCloser - loop detection, verification and correction.
//!
//! Runs after each committed mapping pass:
//! 1. Detects loop candidates using BoW and temporal consistency
//! 2. Verifies the candidate geometrically (descriptor matches + pose
//!    estimation against the candidate's neighborhood)
//! 3. Corrects the current keyframe's region onto the loop region
//! 4. Merges duplicate landmarks and runs global BA
//!
//! Detection and verification read a snapshot; the correction is a
//! separate commit.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::error::ResultCode;
use crate::geometry::{PoseEstimatorConfig, SE3};
use crate::map::{KeyFrameId, LandmarkId, Map, MapError};
use crate::optimizer::{global_bundle_adjustment, GlobalBAConfig};
use crate::system::config::SlamConfig;
use crate::system::shared_state::SharedState;
use crate::tracking::frame::CameraModel;
use crate::tracking::tracking_frame::Frame;

use super::detector::{detect_loop_candidates, ConsistencyChecker, LoopCandidate, LoopDetectorConfig};
use super::relocalizer::{verify_candidate, RelocalizerConfig};

/// Configuration for the LoopCloser.
#[derive(Debug, Clone)]
pub struct LoopCloserConfig {
    pub detector: LoopDetectorConfig,

    /// Inliers required for a verified loop.
    pub min_inliers: usize,
    pub min_confidence: f64,

    /// Keyframes to wait after a closure before detecting again.
    pub cooldown_keyframes: u64,

    pub global_ba: GlobalBAConfig,
}

impl Default for LoopCloserConfig {
    fn default() -> Self {
        Self {
            detector: LoopDetectorConfig::default(),
            min_inliers: 30,
            min_confidence: 0.6,
            cooldown_keyframes: 5,
            global_ba: GlobalBAConfig::default(),
        }
    }
}

/// A geometrically verified loop, not yet applied.
#[derive(Debug, Clone)]
pub struct VerifiedLoop {
    pub current_kf_id: KeyFrameId,
    pub loop_kf_id: KeyFrameId,
    /// Pose of the current keyframe in the loop region's frame (T_wc).
    pub corrected_pose: SE3,
    /// Loop landmark per current keyframe feature.
    pub matches: Vec<Option<LandmarkId>>,
    pub num_inliers: usize,
}

/// An applied loop closure.
#[derive(Debug, Clone)]
pub struct LoopClosure {
    pub current_kf_id: KeyFrameId,
    pub loop_kf_id: KeyFrameId,
    pub num_inliers: usize,
    /// Duplicate landmarks merged.
    pub num_fused: usize,
    /// Observations added for features that had no landmark.
    pub num_linked: usize,
    pub num_corrected_keyframes: usize,
    /// Applied world correction (corrected ∘ old⁻¹).
    pub correction: SE3,
}

/// Verify a loop candidate against the current keyframe.
pub fn verify_loop(
    map: &Map,
    current_kf_id: KeyFrameId,
    candidate: &LoopCandidate,
    camera: &CameraModel,
    config: &LoopCloserConfig,
    pose: &PoseEstimatorConfig,
) -> Option<VerifiedLoop> {
    let kf = map.keyframe(current_kf_id)?;
    let frame = Frame::new(
        kf.timestamp,
        (*kf.features).clone(),
        camera.width as f64,
        camera.height as f64,
    );
    let verification = RelocalizerConfig {
        max_candidates: 1,
        neighborhood_hops: 1,
        min_inliers: config.min_inliers,
        min_confidence: config.min_confidence,
        pose: pose.clone(),
    };
    let found = verify_candidate(map, &frame, candidate.loop_kf_id, camera, &verification)?;
    Some(VerifiedLoop {
        current_kf_id,
        loop_kf_id: candidate.loop_kf_id,
        corrected_pose: found.pose,
        matches: found.matches,
        num_inliers: found.num_inliers,
    })
}

/// Apply a verified loop to the map.
///
/// 1. Move the current keyframe's covisible region (outside the loop
///    region) and its landmarks by the correction
/// 2. Merge matched landmarks, keeping the one with more observers
/// 3. Global BA, dropping the outlier observations it reports
pub fn apply_loop(
    map: &mut Map,
    verified: &VerifiedLoop,
    camera: &CameraModel,
    global_ba: &GlobalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Result<LoopClosure, MapError> {
    let current_pose = *map
        .keyframe(verified.current_kf_id)
        .ok_or(MapError::KeyFrameNotFound(verified.current_kf_id))?
        .pose();
    let correction = verified.corrected_pose.compose(&current_pose.inverse());

    // Step 1: Correct poses and points of the current region
    let loop_region = map.covisible_within_hops(verified.loop_kf_id, 1);
    let corrected: BTreeSet<KeyFrameId> = map
        .covisible_within_hops(verified.current_kf_id, 1)
        .difference(&loop_region)
        .copied()
        .collect();

    let moved: Vec<(LandmarkId, nalgebra::Vector3<f64>)> = map
        .landmarks_of(&corrected)
        .into_iter()
        .filter_map(|id| {
            let lm = map.landmark(id)?;
            let anchored = lm.observations().keys().any(|kf| loop_region.contains(kf));
            (!anchored).then(|| (id, correction.transform_point(lm.position())))
        })
        .collect();
    for (id, position) in moved {
        map.set_landmark_position(id, position)?;
    }
    for &kf_id in &corrected {
        if let Some(kf) = map.keyframe(kf_id) {
            let pose = correction.compose(kf.pose());
            map.set_keyframe_pose(kf_id, pose)?;
        }
    }

    // Step 2: Merge duplicates and link unmatched features
    let mut num_fused = 0;
    let mut num_linked = 0;
    for (idx, matched) in verified.matches.iter().enumerate() {
        let Some(loop_lm) = *matched else { continue };
        if map.landmark(loop_lm).is_none() {
            continue;
        }
        let existing = map
            .keyframe(verified.current_kf_id)
            .and_then(|kf| kf.landmark(idx));
        match existing {
            None => {
                if map.associate(verified.current_kf_id, idx, loop_lm)? {
                    num_linked += 1;
                }
            }
            Some(existing) if existing != loop_lm => {
                let loop_obs = map.landmark(loop_lm).map_or(0, |l| l.num_observations());
                let existing_obs = map.landmark(existing).map_or(0, |l| l.num_observations());
                if existing_obs > loop_obs {
                    map.replace_landmark(loop_lm, existing)?;
                    map.update_landmark_descriptor(existing);
                } else {
                    map.replace_landmark(existing, loop_lm)?;
                    map.update_landmark_descriptor(loop_lm);
                }
                num_fused += 1;
            }
            Some(_) => {}
        }
    }

    // Step 3: Global BA
    if let Some(ba) = global_bundle_adjustment(map, camera, global_ba, should_stop)? {
        for &(kf, idx) in &ba.outliers {
            map.disassociate(kf, idx);
        }
        debug!(
            "[GlobalBA] iters={} error: {:.3} -> {:.3} px, outliers={}",
            ba.iterations,
            ba.initial_error,
            ba.final_error,
            ba.outliers.len()
        );
    }

    map.check_invariants()?;
    Ok(LoopClosure {
        current_kf_id: verified.current_kf_id,
        loop_kf_id: verified.loop_kf_id,
        num_inliers: verified.num_inliers,
        num_fused,
        num_linked,
        num_corrected_keyframes: corrected.len(),
        correction,
    })
}

/// Loop closing state carried between keyframes.
pub struct LoopCloser {
    camera: CameraModel,
    config: LoopCloserConfig,
    consistency_checker: ConsistencyChecker,
    /// Map epoch the history belongs to.
    epoch: Option<u64>,
    last_loop_kf: Option<KeyFrameId>,
}

impl LoopCloser {
    pub fn new(camera: CameraModel) -> Self {
        Self::with_config(camera, LoopCloserConfig::default())
    }

    pub fn with_config(camera: CameraModel, config: LoopCloserConfig) -> Self {
        Self {
            camera,
            config,
            consistency_checker: ConsistencyChecker::new(),
            epoch: None,
            last_loop_kf: None,
        }
    }

    /// Forget detection history (the map was replaced).
    pub fn reset(&mut self) {
        self.consistency_checker.clear();
        self.last_loop_kf = None;
    }

    /// Look for a loop at a freshly committed keyframe and close it.
    pub fn process(
        &mut self,
        shared: &SharedState,
        kf_id: KeyFrameId,
        epoch: u64,
        config: &SlamConfig,
    ) -> Option<LoopClosure> {
        if self.epoch != Some(epoch) {
            self.reset();
            self.epoch = Some(epoch);
        }
        if let Some(last) = self.last_loop_kf {
            if kf_id.0 < last.0 + self.config.cooldown_keyframes {
                return None;
            }
        }

        // Step 1: Detection on the committed map
        let snapshot = shared.snapshot();
        let candidates = detect_loop_candidates(&snapshot, kf_id, &self.config.detector);
        let candidate = self
            .consistency_checker
            .add_and_check(&candidates, config.loop_min_consistency)?;

        // Step 2: Geometric verification
        let Some(verified) = verify_loop(
            &snapshot,
            kf_id,
            &candidate,
            &self.camera,
            &self.config,
            &config.pose_estimator(),
        ) else {
            debug!(
                "[LoopClosing] Candidate {} for {} failed verification",
                candidate.loop_kf_id, kf_id
            );
            return None;
        };
        drop(snapshot);

        // Step 3: Correction as its own commit
        let camera = &self.camera;
        let global_ba = &self.config.global_ba;
        let should_stop = || shared.should_abort_ba();
        let outcome = shared.try_commit(epoch, |map| {
            apply_loop(map, &verified, camera, global_ba, &should_stop)
        })?;

        match outcome {
            Ok(closure) => {
                shared.record_loop_closure();
                self.last_loop_kf = Some(kf_id);
                info!(
                    "[LoopClosing] Closed loop {} -> {}: inliers={} fused={} linked={} corrected_kfs={} shift={:.3}",
                    closure.current_kf_id,
                    closure.loop_kf_id,
                    closure.num_inliers,
                    closure.num_fused,
                    closure.num_linked,
                    closure.num_corrected_keyframes,
                    closure.correction.translation.norm()
                );
                Some(closure)
            }
            Err(MapError::CapacityExceeded { resource, limit }) => {
                let message = format!("loop closure skipped: {resource} ceiling of {limit} reached");
                warn!("[LoopClosing] {}", message);
                shared.report_error(ResultCode::OutOfMemory, &message);
                None
            }
            Err(e) => {
                shared.fail(format!("loop correction failed: {e}"));
                None
            }
        }
    }
}

impl std::fmt::Debug for LoopCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopCloser")
            .field("epoch", &self.epoch)
            .field("history", &self.consistency_checker.len())
            .field("last_loop_kf", &self.last_loop_kf)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MapLimits;
    use crate::tracking::frame::{Descriptor, FeatureSet, KeyPoint};
    use crate::vocabulary::BowVector;
    use nalgebra::Vector3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }

    fn scene(n: usize) -> (Vec<Vector3<f64>>, Vec<Descriptor>) {
        let mut rng = StdRng::seed_from_u64(17);
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

    fn translation(x: f64, y: f64) -> SE3 {
        SE3::from_params(&Vector3::zeros(), &Vector3::new(x, y, 0.0))
    }

    /// Two disconnected regions observing the same scene: the second one
    /// with a drifted world frame and its own duplicate landmarks.
    fn drifted_map() -> (Map, [KeyFrameId; 4], Vec<Vector3<f64>>) {
        let (points, descs) = scene(60);
        let drift = translation(0.0, 0.3);
        let mut map = Map::new("loop", 0.0, MapLimits::default());

        let true_poses = [translation(0.0, 0.0), translation(0.3, 0.0), translation(0.2, 0.0), translation(0.1, 0.0)];
        let mut ids = [KeyFrameId(0); 4];
        for (i, pose) in true_poses.iter().enumerate() {
            let stored = if i < 2 { *pose } else { drift.compose(pose) };
            ids[i] = map
                .insert_keyframe(i as f64, stored, features(&points, pose, &descs), BowVector::new())
                .unwrap();
        }
        for (i, p) in points.iter().enumerate() {
            let original = map.insert_landmark(*p, descs[i], ids[0]).unwrap();
            map.associate(ids[0], i, original).unwrap();
            map.associate(ids[1], i, original).unwrap();
            let duplicate = map.insert_landmark(drift.transform_point(p), descs[i], ids[2]).unwrap();
            map.associate(ids[2], i, duplicate).unwrap();
            map.associate(ids[3], i, duplicate).unwrap();
        }
        for id in map.landmark_ids().collect::<Vec<_>>() {
            map.update_landmark_descriptor(id);
        }
        (map, ids, points)
    }

    fn candidate(current: KeyFrameId, loop_kf: KeyFrameId) -> LoopCandidate {
        LoopCandidate {
            current_kf_id: current,
            loop_kf_id: loop_kf,
            bow_score: 1.0,
            region: [loop_kf].into_iter().collect(),
        }
    }

    #[test]
    fn test_verified_loop_merges_regions() {
        let (mut map, ids, points) = drifted_map();
        assert_eq!(map.num_landmarks(), 120);
        let config = LoopCloserConfig::default();

        let verified = verify_loop(
            &map,
            ids[3],
            &candidate(ids[3], ids[0]),
            &camera(),
            &config,
            &PoseEstimatorConfig::default(),
        )
        .unwrap();
        assert!(verified.corrected_pose.distance_to(&translation(0.1, 0.0)) < 1e-3);
        assert!(verified.num_inliers >= 55);

        let closure = apply_loop(&mut map, &verified, &camera(), &config.global_ba, &|| false).unwrap();
        assert!(closure.num_fused >= 55);
        assert_eq!(closure.num_corrected_keyframes, 2);
        assert!(closure.correction.translation.y < -0.29);

        // Landmark count stops growing: the duplicates are gone.
        assert!(map.num_landmarks() <= 65);
        assert!(map.keyframe(ids[3]).unwrap().covisibility_weight(ids[0]) >= 55);
        assert!(map.keyframe(ids[2]).unwrap().pose().distance_to(&translation(0.2, 0.0)) < 1e-2);
        for (idx, id) in map.keyframe(ids[0]).unwrap().landmark_indices() {
            assert!((map.landmark(id).unwrap().position() - points[idx]).norm() < 1e-2);
        }
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_unrelated_candidate_fails_verification() {
        let (points, descs) = scene(60);
        let mut rng = StdRng::seed_from_u64(99);
        let other_descs: Vec<Descriptor> = (0..points.len())
            .map(|_| {
                let mut d = [0u8; 32];
                rng.fill(&mut d[..]);
                d
            })
            .collect();
        let mut map = Map::new("noloop", 0.0, MapLimits::default());
        let a = map
            .insert_keyframe(0.0, SE3::identity(), features(&points, &SE3::identity(), &descs), BowVector::new())
            .unwrap();
        let b = map
            .insert_keyframe(1.0, SE3::identity(), features(&points, &SE3::identity(), &other_descs), BowVector::new())
            .unwrap();
        for (i, p) in points.iter().enumerate() {
            let lm = map.insert_landmark(*p, descs[i], a).unwrap();
            map.associate(a, i, lm).unwrap();
        }
        let verified = verify_loop(
            &map,
            b,
            &candidate(b, a),
            &camera(),
            &LoopCloserConfig::default(),
            &PoseEstimatorConfig::default(),
        );
        assert!(verified.is_none());
    }
}
