//! Main tracker: orchestrates per-frame pose estimation and the state machine.
//!
//! This implementation follows a keyframe-based design:
//! - Reads the shared map through immutable snapshots
//! - Bootstraps the map from two views while READY with an empty map
//! - Tracks the landmarks of the last keyframe's covisibility neighborhood
//!   by projection, then estimates the pose with PnP
//! - Decides keyframes and hands them to the mapping worker as messages
//! - Falls back to relocalization when LOST
//!
//! The tracker never mutates a published map. The bootstrap goes through
//! `SharedState::try_commit`; everything else is done by the mapping worker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nalgebra::Vector2;
use tracing::{debug, info, warn};

use crate::error::SlamError;
use crate::geometry::pnp::reprojection_error;
use crate::geometry::{estimate_pose, reconstruct_two_view, PoseEstimate, SE3};
use crate::loop_closing::relocalizer::{relocalize, RelocalizationOutcome, RelocalizerConfig};
use crate::map::{KeyFrameId, LandmarkId, Map, MapError};
use crate::optimizer::{global_bundle_adjustment, GlobalBAConfig};
use crate::system::config::SlamConfig;
use crate::system::messages::{LandmarkStats, NewKeyFrameMsg};
use crate::system::shared_state::SharedState;
use crate::tracking::frame::CameraModel;
use crate::tracking::keyframe_decision::KeyFrameDecision;
use crate::tracking::local_map::LocalMap;
use crate::tracking::matching::{
    search_by_descriptor, search_by_projection, search_for_initialization, PROJECTION_RADIUS,
};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::result::{FrameStats, Pose};
use crate::tracking::tracking_frame::Frame;
use crate::tracking::SystemState;
use crate::vocabulary::Vocabulary;

/// Features required for a frame to serve as bootstrap reference.
pub const INIT_MIN_FEATURES: usize = 100;

/// Matches against the bootstrap reference required to attempt a
/// reconstruction; fewer replaces the reference.
const INIT_MIN_MATCHES: usize = 100;

/// Pixel window searched around the last matched position of each
/// reference keypoint during bootstrap.
const INIT_SEARCH_WINDOW: f64 = 100.0;

/// Covisible neighbors of the reference keyframe in the local map.
const LOCAL_MAP_NEIGHBORS: usize = 10;

/// Frames to wait for a sent keyframe to appear in the map before the
/// keyframe decision runs again.
const MAX_KEYFRAME_WAIT: usize = 30;

/// Result of processing one frame.
#[derive(Debug, Default)]
pub struct TrackOutcome {
    /// Accepted pose, `None` while bootstrapping.
    pub pose: Option<Pose>,
    /// Keyframe to hand to the mapping worker.
    pub keyframe: Option<NewKeyFrameMsg>,
}

/// A pose accepted against the local map.
struct TrackedPose {
    estimate: PoseEstimate,
    epoch: u64,
    reference: KeyFrameId,
    local: LocalMap,
}

/// First frame of a pending two-view bootstrap.
struct InitReference {
    frame: Frame,
    /// Where each reference keypoint was last matched; the search window
    /// follows the features as the camera moves.
    last_seen: Vec<Vector2<f64>>,
    /// Frames processed since the reference was taken.
    frames: usize,
}

impl InitReference {
    fn new(frame: Frame) -> Self {
        let last_seen = frame.keypoints().iter().map(|kp| kp.pt).collect();
        Self {
            frame,
            last_seen,
            frames: 0,
        }
    }
}

/// Keyframe sent to the worker but not yet visible in the map.
#[derive(Debug, Clone, Copy)]
struct AwaitingKeyFrame {
    last_before: Option<KeyFrameId>,
    frames: usize,
}

/// Main tracking structure.
pub struct Tracker {
    camera: CameraModel,
    vocabulary: Arc<Vocabulary>,

    /// Shared state (map snapshot, state machine) - thread-safe access.
    shared: Arc<SharedState>,

    motion: MotionModel,
    kf_decision: KeyFrameDecision,

    init_reference: Option<InitReference>,

    /// Reference keyframe used for tracking.
    reference_kf: Option<KeyFrameId>,
    /// Pose of `reference_kf` when the last pose was accepted.
    reference_pose: Option<SE3>,

    /// Number of consecutive frames that failed to track.
    lost_frames: usize,

    /// Failed verifications in the current RELOCALIZATION episode.
    reloc_attempts: usize,
    reloc_requested: bool,

    awaiting_keyframe: Option<AwaitingKeyFrame>,

    /// Landmark statistics gathered since the last keyframe was sent.
    pending_stats: BTreeMap<LandmarkId, LandmarkStats>,

    last_stats: FrameStats,
    last_relocalization: Option<Pose>,
    relocalization_count: u64,
    tracking_loss_count: u64,
}

impl Tracker {
    pub fn new(camera: CameraModel, vocabulary: Arc<Vocabulary>, shared: Arc<SharedState>) -> Self {
        Self {
            camera,
            vocabulary,
            shared,
            motion: MotionModel::new(),
            kf_decision: KeyFrameDecision::new(),
            init_reference: None,
            reference_kf: None,
            reference_pose: None,
            lost_frames: 0,
            reloc_attempts: 0,
            reloc_requested: false,
            awaiting_keyframe: None,
            pending_stats: BTreeMap::new(),
            last_stats: FrameStats::default(),
            last_relocalization: None,
            relocalization_count: 0,
            tracking_loss_count: 0,
        }
    }

    /// Process one frame according to the current system state.
    pub fn process(&mut self, mut frame: Frame, config: &SlamConfig) -> Result<TrackOutcome, SlamError> {
        self.last_stats = FrameStats {
            feature_count: frame.num_features(),
            ..FrameStats::default()
        };

        let mut state = self.shared.state();
        let required = config.min_tracking_features;
        if frame.num_features() < required {
            if state == SystemState::Tracking {
                self.enter_lost("insufficient features");
            }
            return Err(SlamError::InsufficientFeatures {
                found: frame.num_features(),
                required,
            });
        }

        if self.reloc_requested && state == SystemState::Tracking {
            info!("[Tracking] Relocalization requested while tracking");
            self.shared.set_state(SystemState::Lost);
            state = SystemState::Lost;
        }

        match state {
            SystemState::Ready if self.shared.snapshot().is_empty() => self.bootstrap(frame, config),
            SystemState::Ready => {
                // A map without a pose: localize before tracking.
                self.shared.set_state(SystemState::Lost);
                self.relocalize_frame(&mut frame, config)
            }
            SystemState::Tracking => self.track_frame(&mut frame, config),
            SystemState::Lost | SystemState::Relocalization => self.relocalize_frame(&mut frame, config),
            other => Err(SlamError::SystemNotReady(format!(
                "cannot process frames in state {other}"
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bootstrap
    // ─────────────────────────────────────────────────────────────────────────

    /// Two-view initialization against a stored reference frame.
    fn bootstrap(&mut self, frame: Frame, config: &SlamConfig) -> Result<TrackOutcome, SlamError> {
        if frame.num_features() < config.min_tracking_features.max(INIT_MIN_FEATURES) {
            return Ok(TrackOutcome::default());
        }
        let Some(mut init) = self.init_reference.take() else {
            debug!("[Tracking] Bootstrap reference at t={:.3}", frame.timestamp);
            self.init_reference = Some(InitReference::new(frame));
            return Ok(TrackOutcome::default());
        };
        init.frames += 1;

        // Step 1: Match features inside a window around their last position
        let pairs = search_for_initialization(
            &init.frame.features,
            &init.last_seen,
            &frame.features,
            &frame.grid,
            INIT_SEARCH_WINDOW,
        );
        if pairs.len() < INIT_MIN_MATCHES {
            debug!(
                "[Tracking] Bootstrap: {} matches, replacing reference",
                pairs.len()
            );
            self.init_reference = Some(InitReference::new(frame));
            return Ok(TrackOutcome::default());
        }
        for &(i, j) in &pairs {
            init.last_seen[i] = frame.keypoints()[j].pt;
        }

        // Step 2: Relative motion and structure
        let reference = &init.frame;
        let uv1: Vec<_> = pairs.iter().map(|&(i, _)| reference.keypoints()[i].pt).collect();
        let uv2: Vec<_> = pairs.iter().map(|&(_, j)| frame.keypoints()[j].pt).collect();
        let Some(recon) = reconstruct_two_view(&uv1, &uv2, &self.camera, &config.two_view()) else {
            // Not enough parallax yet: keep the reference and wait.
            self.init_reference = Some(init);
            return Ok(TrackOutcome::default());
        };

        // Step 3: Normalize scale so the median depth is 1
        let mut depths: Vec<f64> = recon.points.iter().flatten().map(|p| p.z).collect();
        depths.sort_by(f64::total_cmp);
        let median = depths.get(depths.len() / 2).copied().unwrap_or(0.0);
        if median <= 0.0 {
            self.init_reference = Some(init);
            return Ok(TrackOutcome::default());
        }
        let scale = 1.0 / median;
        let pose1 = SE3 {
            rotation: recon.pose2.rotation,
            translation: recon.pose2.translation * scale,
        };

        // Step 4: Commit the initial map
        let camera = self.camera.clone();
        let bow0 = self.vocabulary.transform(&reference.features.descriptors);
        let bow1 = self.vocabulary.transform(&frame.features.descriptors);
        let epoch = self.shared.epoch();
        let committed = self.shared.try_commit(epoch, |map| {
            let kf0 = map.insert_keyframe(
                reference.timestamp,
                SE3::identity(),
                Arc::clone(&reference.features),
                bow0,
            )?;
            let kf1 = map.insert_keyframe(frame.timestamp, pose1, Arc::clone(&frame.features), bow1)?;
            let mut created = Vec::new();
            for (&(i, j), point) in pairs.iter().zip(&recon.points) {
                let Some(p) = point else { continue };
                let lm = map.insert_landmark(p * scale, reference.features.descriptors[i], kf0)?;
                map.associate(kf0, i, lm)?;
                map.associate(kf1, j, lm)?;
                created.push(lm);
            }
            for &lm in &created {
                map.update_landmark_descriptor(lm);
            }

            if let Some(ba) = global_bundle_adjustment(map, &camera, &GlobalBAConfig::default(), &|| false)? {
                for &(kf, idx) in &ba.outliers {
                    map.disassociate(kf, idx);
                }
            }
            map.check_invariants()?;
            let pose = map
                .keyframe(kf1)
                .map(|kf| *kf.pose())
                .ok_or(MapError::KeyFrameNotFound(kf1))?;
            Ok::<_, MapError>((kf1, pose, map.num_landmarks()))
        });

        let (kf1, pose, num_landmarks) = match committed {
            Some(result) => result?,
            None => {
                self.init_reference = Some(init);
                return Ok(TrackOutcome::default());
            }
        };

        info!(
            "[Tracking] Map initialized: 2 keyframes, {} landmarks, parallax {:.2} deg",
            num_landmarks, recon.median_parallax_deg
        );

        // The reference may lie several frames back; seed the motion model
        // with the mean motion per frame.
        let (omega, translation) = pose.to_params();
        let steps = init.frames.max(1) as f64;
        let step = SE3::from_params(&(omega / steps), &(translation / steps));
        self.motion.reset();
        self.motion.update(&pose.compose(&step.inverse()));
        self.motion.update(&pose);
        self.reference_kf = Some(kf1);
        self.reference_pose = Some(pose);
        self.kf_decision.reset();
        self.lost_frames = 0;
        self.shared.set_state(SystemState::Tracking);

        let confidence = recon.num_triangulated as f64 / pairs.len() as f64;
        self.last_stats = FrameStats {
            feature_count: frame.num_features(),
            matched_count: recon.num_triangulated,
            inlier_count: num_landmarks,
            mean_error: 0.0,
            confidence,
            local_keyframes: 2,
        };
        Ok(TrackOutcome {
            pose: Some(Pose::from_se3(&pose, frame.timestamp, confidence)),
            keyframe: None,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────────

    fn track_frame(&mut self, frame: &mut Frame, config: &SlamConfig) -> Result<TrackOutcome, SlamError> {
        let epoch = self.shared.epoch();
        let map = self.shared.snapshot();

        match self.track_local_map(&map, epoch, frame, config) {
            Ok(tracked) => Ok(self.accept(&map, frame, tracked, config)),
            Err(e) => {
                self.lost_frames += 1;
                debug!(
                    "[Tracking] Frame t={:.3} failed ({}/{}): {}",
                    frame.timestamp, self.lost_frames, config.max_lost_frames, e
                );
                if self.lost_frames >= config.max_lost_frames {
                    self.enter_lost("consecutive tracking failures");
                }
                Err(SlamError::TrackingLost(e.to_string()))
            }
        }
    }

    /// Match the local map into the frame and estimate the pose.
    fn track_local_map(
        &self,
        map: &Map,
        epoch: u64,
        frame: &mut Frame,
        config: &SlamConfig,
    ) -> Result<TrackedPose, SlamError> {
        // The newest keyframe only stands in when the reference was culled.
        let reference = self
            .reference_kf
            .filter(|id| map.contains_keyframe(*id))
            .or_else(|| map.last_keyframe_id())
            .ok_or_else(|| SlamError::TrackingLost("map has no keyframes".into()))?;
        let reference_pose = *map
            .keyframe(reference)
            .ok_or_else(|| SlamError::TrackingLost(format!("{reference} missing")))?
            .pose();
        let prior = self.motion.predict().unwrap_or(reference_pose);
        let local = LocalMap::build(map, reference, LOCAL_MAP_NEIGHBORS);
        let required = config.min_tracking_features;

        // Step 1: Projection search from the predicted pose, widening once
        frame.clear_matches();
        let mut matched =
            search_by_projection(frame, &local.candidates, &prior, &self.camera, PROJECTION_RADIUS);
        if matched < required {
            matched += search_by_projection(
                frame,
                &local.candidates,
                &prior,
                &self.camera,
                2.0 * PROJECTION_RADIUS,
            );
        }
        // Step 2: Descriptor-only fallback when the prediction is off
        if matched < required {
            matched += self.match_by_descriptor(frame, &local);
        }
        debug!(
            "[Tracking] {} matches against {} local landmarks",
            matched,
            local.len()
        );

        // Step 3: Pose, then a second projection search from the estimate
        let pose_config = config.pose_estimator();
        let corr = frame.correspondences(map);
        let first = estimate_pose(&corr.points, &corr.pixels, &self.camera, Some(&prior), &pose_config)?;
        frame.retain_inliers(&corr, &first.inliers);

        search_by_projection(frame, &local.candidates, &first.pose, &self.camera, PROJECTION_RADIUS);
        let corr = frame.correspondences(map);
        let estimate =
            estimate_pose(&corr.points, &corr.pixels, &self.camera, Some(&first.pose), &pose_config)?;
        frame.retain_inliers(&corr, &estimate.inliers);

        if estimate.num_inliers < required || estimate.confidence < config.tracking_min_confidence {
            return Err(SlamError::TrackingLost(format!(
                "{} inliers, confidence {:.2}",
                estimate.num_inliers, estimate.confidence
            )));
        }

        Ok(TrackedPose {
            estimate,
            epoch,
            reference: best_reference(map, frame).unwrap_or(reference),
            local,
        })
    }

    /// Assign unmatched features by descriptor alone.
    fn match_by_descriptor(&self, frame: &mut Frame, local: &LocalMap) -> usize {
        let taken: BTreeSet<LandmarkId> = frame.landmark_matches.iter().flatten().copied().collect();
        let mut added = 0;
        for (feature, cand) in search_by_descriptor(&frame.features, &local.candidates) {
            let id = local.candidates[cand].id;
            if frame.landmark_matches[feature].is_none() && !taken.contains(&id) {
                frame.landmark_matches[feature] = Some(id);
                added += 1;
            }
        }
        added
    }

    fn accept(
        &mut self,
        map: &Map,
        frame: &Frame,
        tracked: TrackedPose,
        config: &SlamConfig,
    ) -> TrackOutcome {
        let pose = tracked.estimate.pose;
        self.lost_frames = 0;
        self.motion.update(&pose);
        self.reference_kf = Some(tracked.reference);
        self.reference_pose = map.keyframe(tracked.reference).map(|kf| *kf.pose());
        self.accumulate_stats(map, frame, &tracked);

        let estimate = &tracked.estimate;
        self.last_stats = FrameStats {
            feature_count: frame.num_features(),
            matched_count: frame.num_matched(),
            inlier_count: estimate.num_inliers,
            mean_error: estimate.mean_error,
            confidence: estimate.confidence,
            local_keyframes: tracked.local.keyframes.len(),
        };

        let keyframe = self.decide_keyframe(map, frame, &tracked, config);
        TrackOutcome {
            pose: Some(Pose::from_se3(&pose, frame.timestamp, estimate.confidence)),
            keyframe,
        }
    }

    /// Count visibility and inlier observations for the worker's culling.
    fn accumulate_stats(&mut self, map: &Map, frame: &Frame, tracked: &TrackedPose) {
        let pose = &tracked.estimate.pose;
        let visible: BTreeSet<LandmarkId> = tracked
            .local
            .visible_from(map, pose, &self.camera)
            .into_iter()
            .collect();
        for &id in &visible {
            self.pending_stats.entry(id).or_default().visible += 1;
        }

        let pose_cw = pose.inverse();
        for (idx, m) in frame.landmark_matches.iter().enumerate() {
            let Some(id) = *m else { continue };
            let Some(lm) = map.landmark(id) else { continue };
            let entry = self.pending_stats.entry(id).or_default();
            if !visible.contains(&id) {
                entry.visible += 1;
            }
            entry.found += 1;
            if let Some(err) = reprojection_error(&self.camera, &pose_cw, lm.position(), &frame.keypoints()[idx].pt) {
                entry.error_sum += err;
            }
        }
    }

    fn decide_keyframe(
        &mut self,
        map: &Map,
        frame: &Frame,
        tracked: &TrackedPose,
        config: &SlamConfig,
    ) -> Option<NewKeyFrameMsg> {
        if let Some(waiting) = self.awaiting_keyframe.as_mut() {
            if map.last_keyframe_id() != waiting.last_before {
                self.awaiting_keyframe = None;
            } else {
                waiting.frames += 1;
                if waiting.frames < MAX_KEYFRAME_WAIT {
                    return None;
                }
                warn!(
                    "[Tracking] Keyframe not in the map after {} frames, deciding again",
                    waiting.frames
                );
                self.awaiting_keyframe = None;
            }
        }

        let reference = map.keyframe(tracked.reference)?;
        let pose = &tracked.estimate.pose;
        let reason = self.kf_decision.evaluate(
            &config.keyframe_criteria(),
            pose,
            reference.pose(),
            tracked.estimate.num_inliers,
            reference.num_landmarks(),
        )?;
        debug!(
            "[Tracking] New keyframe at t={:.3} ({:?}, {} tracked)",
            frame.timestamp, reason, tracked.estimate.num_inliers
        );

        self.awaiting_keyframe = Some(AwaitingKeyFrame {
            last_before: map.last_keyframe_id(),
            frames: 0,
        });
        Some(NewKeyFrameMsg {
            epoch: tracked.epoch,
            timestamp: frame.timestamp,
            pose: *pose,
            features: Arc::clone(&frame.features),
            bow_vector: self.vocabulary.transform(&frame.features.descriptors),
            matches: frame.landmark_matches.clone(),
            landmark_stats: std::mem::take(&mut self.pending_stats),
        })
    }

    /// Take back a keyframe the worker could not accept, so its statistics
    /// ride along with the next one.
    pub fn keyframe_rejected(&mut self, msg: NewKeyFrameMsg) {
        for (id, stats) in msg.landmark_stats {
            self.pending_stats.entry(id).or_default().merge(&stats);
        }
        self.awaiting_keyframe = None;
    }

    fn enter_lost(&mut self, reason: &str) {
        if self.shared.set_state(SystemState::Lost) {
            self.tracking_loss_count += 1;
            warn!("[Tracking] Lost: {}", reason);
        }
        self.lost_frames = 0;
        self.reloc_attempts = 0;
        self.motion.reset();
        self.awaiting_keyframe = None;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Relocalization
    // ─────────────────────────────────────────────────────────────────────────

    fn relocalize_frame(&mut self, frame: &mut Frame, config: &SlamConfig) -> Result<TrackOutcome, SlamError> {
        if !(config.enable_relocalization || self.reloc_requested) {
            return Err(SlamError::TrackingLost("relocalization disabled".into()));
        }

        let map = self.shared.snapshot();
        let bow = self.vocabulary.transform(&frame.features.descriptors);
        let reloc_config = RelocalizerConfig {
            min_inliers: config.min_tracking_features,
            min_confidence: config.relocalization_min_confidence,
            pose: config.pose_estimator(),
            ..RelocalizerConfig::default()
        };
        let outcome = relocalize(&map, frame, &bow, &self.camera, &reloc_config);
        frame.bow_vector = Some(bow);

        match outcome {
            RelocalizationOutcome::NoCandidates => {
                if self.shared.state() == SystemState::Relocalization {
                    self.failed_attempt(config);
                }
                Err(SlamError::TrackingLost("no relocalization candidates".into()))
            }
            RelocalizationOutcome::Rejected { candidates } => {
                self.shared.set_state(SystemState::Relocalization);
                self.failed_attempt(config);
                Err(SlamError::TrackingLost(format!(
                    "{candidates} relocalization candidates rejected"
                )))
            }
            RelocalizationOutcome::Accepted(reloc) => {
                self.shared.set_state(SystemState::Relocalization);
                self.shared.set_state(SystemState::Tracking);
                info!(
                    "[Reloc] Relocalized against {} ({} inliers, confidence {:.2})",
                    reloc.keyframe, reloc.num_inliers, reloc.confidence
                );

                self.reloc_attempts = 0;
                self.reloc_requested = false;
                self.lost_frames = 0;
                self.relocalization_count += 1;
                self.motion.restart_from(&reloc.pose);
                self.reference_kf = Some(reloc.keyframe);
                self.reference_pose = map.keyframe(reloc.keyframe).map(|kf| *kf.pose());
                self.awaiting_keyframe = None;
                self.kf_decision.reset();
                frame.landmark_matches = reloc.matches;

                self.last_stats = FrameStats {
                    feature_count: frame.num_features(),
                    matched_count: frame.num_matched(),
                    inlier_count: reloc.num_inliers,
                    mean_error: reloc.mean_error,
                    confidence: reloc.confidence,
                    local_keyframes: 0,
                };
                let pose = Pose::from_se3(&reloc.pose, frame.timestamp, reloc.confidence);
                self.last_relocalization = Some(pose);
                Ok(TrackOutcome {
                    pose: Some(pose),
                    keyframe: None,
                })
            }
        }
    }

    fn failed_attempt(&mut self, config: &SlamConfig) {
        self.reloc_attempts += 1;
        if self.reloc_attempts >= config.relocalization_max_attempts {
            info!(
                "[Reloc] Giving up after {} attempts",
                self.reloc_attempts
            );
            self.reloc_attempts = 0;
            self.reloc_requested = false;
            self.shared.set_state(SystemState::Lost);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control and queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_relocalization(&mut self) {
        self.reloc_requested = true;
    }

    pub fn relocalization_requested(&self) -> bool {
        self.reloc_requested
    }

    /// Forget everything tied to the current map (clear / load).
    pub fn forget_map(&mut self) {
        self.motion.reset();
        self.kf_decision.reset();
        self.init_reference = None;
        self.reference_kf = None;
        self.reference_pose = None;
        self.lost_frames = 0;
        self.reloc_attempts = 0;
        self.awaiting_keyframe = None;
        self.pending_stats.clear();
    }

    /// Forget the map and every counter.
    pub fn reset(&mut self) {
        self.forget_map();
        self.reloc_requested = false;
        self.last_stats = FrameStats::default();
        self.last_relocalization = None;
        self.relocalization_count = 0;
        self.tracking_loss_count = 0;
    }

    /// Carry the last pose along when a loop correction moved the
    /// reference keyframe.
    pub fn follow_map_correction(&mut self) {
        let (Some(id), Some(before)) = (self.reference_kf, self.reference_pose) else {
            return;
        };
        let map = self.shared.snapshot();
        let Some(after) = map.keyframe(id).map(|kf| *kf.pose()) else {
            // Reference culled: the next frame falls back to the newest
            // keyframe without a prediction.
            self.motion.reset();
            return;
        };
        self.motion.correct(&after.compose(&before.inverse()));
        self.reference_pose = Some(after);
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn last_stats(&self) -> &FrameStats {
        &self.last_stats
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    pub fn last_relocalization(&self) -> Option<Pose> {
        self.last_relocalization
    }

    pub fn relocalization_count(&self) -> u64 {
        self.relocalization_count
    }

    pub fn tracking_loss_count(&self) -> u64 {
        self.tracking_loss_count
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.init_reference.is_some()
    }
}

/// Keyframe observing the most landmarks matched in `frame`; the newer one
/// wins ties.
fn best_reference(map: &Map, frame: &Frame) -> Option<KeyFrameId> {
    let mut counts: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
    for id in frame.landmark_matches.iter().flatten() {
        if let Some(lm) = map.landmark(*id) {
            for kf in lm.observations().keys() {
                *counts.entry(*kf).or_insert(0) += 1;
            }
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
        .map(|(kf, _)| kf)
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("reference_kf", &self.reference_kf)
            .field("lost_frames", &self.lost_frames)
            .field("reloc_attempts", &self.reloc_attempts)
            .field("pending_stats", &self.pending_stats.len())
            .finish()
    }
}
