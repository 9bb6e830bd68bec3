//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the single value a host interacts with. It owns the
//! shared state, runs tracking on the caller thread and hands keyframes to
//! the mapping worker:
//! - multithreaded: a worker thread fed through a bounded channel
//! - single-threaded: the mapping pass runs inline at the end of
//!   `process_frame`, which makes the whole pipeline deterministic

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Sender, TrySendError};
use nalgebra::Vector3;
use serde::Serialize;
use tracing::{info, warn};

use crate::codec;
use crate::error::{ResultCode, SlamError};
use crate::local_mapping::LocalMapper;
use crate::map::{Map, MapError};
use crate::tracking::frame::{CameraModel, FeatureExtractor, ImageView};
use crate::tracking::result::{Pose, TrackingQuality, TrackingStats};
use crate::tracking::tracking_frame::Frame;
use crate::tracking::{SystemState, Tracker};
use crate::vocabulary::Vocabulary;

use super::config::SlamConfig;
use super::events::{ErrorFn, PoseUpdateFn, StateChangeFn};
use super::messages::NewKeyFrameMsg;
use super::shared_state::SharedState;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 0;
pub const VERSION_PATCH: u32 = 0;

/// Capacity of the keyframe channel between tracking and the mapping worker.
/// A full channel makes tracking skip the keyframe rather than block.
const KEYFRAME_CHANNEL_CAPACITY: usize = 4;

const DEFAULT_MAP_ID: &str = "map";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Summary of the active map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapInfo {
    pub map_id: String,
    pub center: Vector3<f64>,
    pub bounding_box_min: Vector3<f64>,
    pub bounding_box_max: Vector3<f64>,
    pub num_keyframes: usize,
    pub num_landmarks: usize,
    pub creation_timestamp: f64,
    pub version: u64,
}

impl MapInfo {
    fn of(map: &Map) -> Self {
        let (bounding_box_min, bounding_box_max) = map
            .bounding_box()
            .unwrap_or_else(|| (Vector3::zeros(), Vector3::zeros()));
        Self {
            map_id: map.id().to_string(),
            center: map.center(),
            bounding_box_min,
            bounding_box_max,
            num_keyframes: map.num_keyframes(),
            num_landmarks: map.num_landmarks(),
            creation_timestamp: map.creation_timestamp(),
            version: map.version(),
        }
    }
}

/// Where keyframes go once tracking decides to create one.
enum Mapping {
    Inline(Box<LocalMapper>),
    Worker {
        sender: Option<Sender<NewKeyFrameMsg>>,
        handle: Option<JoinHandle<()>>,
    },
}

/// Main SLAM system orchestrating tracking, mapping and persistence.
pub struct SlamSystem {
    /// Shared state (map, state machine, config, callbacks).
    shared: Arc<SharedState>,

    /// The tracker runs in the caller thread.
    tracker: Tracker,

    extractor: FeatureExtractor,
    mapping: Mapping,

    tracking_enabled: bool,
    current_pose: Option<Pose>,
    stats: TrackingStats,

    /// Loop closures already accounted for by the tracker.
    seen_loop_closures: u64,
}

impl SlamSystem {
    /// Create a system from a configuration, a calibration and a loaded
    /// vocabulary. On success the system is READY with an empty map.
    pub fn create(
        config: SlamConfig,
        camera: CameraModel,
        vocabulary: Arc<Vocabulary>,
    ) -> Result<Self, SlamError> {
        config.validate()?;
        camera.validate()?;

        let shared = SharedState::new(new_map(&config), config.clone());
        shared.set_state(SystemState::Initializing);

        if vocabulary.num_words() == 0 {
            return Err(SlamError::InitializationFailed("vocabulary has no words".into()));
        }

        let mapping = if config.enable_multithreading {
            let (sender, receiver) = bounded::<NewKeyFrameMsg>(KEYFRAME_CHANNEL_CAPACITY);
            let mut mapper = LocalMapper::new(camera.clone(), Arc::clone(&shared));
            let handle = thread::Builder::new()
                .name("local-mapping".into())
                .spawn(move || mapper.run(receiver))
                .map_err(|e| {
                    SlamError::InitializationFailed(format!("cannot spawn mapping worker: {e}"))
                })?;
            Mapping::Worker {
                sender: Some(sender),
                handle: Some(handle),
            }
        } else {
            Mapping::Inline(Box::new(LocalMapper::new(camera.clone(), Arc::clone(&shared))))
        };

        let tracker = Tracker::new(camera, vocabulary, Arc::clone(&shared));
        let extractor = FeatureExtractor::new(config.extractor());
        shared.set_state(SystemState::Ready);

        info!(
            "[System] Created (multithreading={}, loop closure={}, relocalization={})",
            config.enable_multithreading, config.enable_loop_closure, config.enable_relocalization
        );
        Ok(Self {
            shared,
            tracker,
            extractor,
            mapping,
            tracking_enabled: true,
            current_pose: None,
            stats: TrackingStats::default(),
            seen_loop_closures: 0,
        })
    }

    /// Like [`SlamSystem::create`], loading the vocabulary from a text file.
    pub fn create_with_vocabulary_file<P: AsRef<Path>>(
        config: SlamConfig,
        camera: CameraModel,
        vocabulary_path: P,
    ) -> Result<Self, SlamError> {
        config.validate()?;
        let vocabulary = Vocabulary::load_from_text(vocabulary_path)?;
        Self::create(config, camera, Arc::new(vocabulary))
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame processing
    // ─────────────────────────────────────────────────────────────────────────

    /// Track one frame. Returns the camera pose once the system is tracking,
    /// `None` while the map is being bootstrapped.
    pub fn process_frame(&mut self, image: &ImageView<'_>, timestamp: f64) -> Result<Option<Pose>, SlamError> {
        self.ensure_operational()?;
        if !self.tracking_enabled {
            return Err(SlamError::SystemNotReady("tracking is disabled".into()));
        }
        if !timestamp.is_finite() {
            return Err(SlamError::InvalidParameter(format!("timestamp {timestamp} is not finite")));
        }
        let camera = self.tracker.camera();
        if image.width != camera.width || image.height != camera.height {
            return Err(SlamError::InvalidParameter(format!(
                "image is {}x{}, calibration expects {}x{}",
                image.width, image.height, camera.width, camera.height
            )));
        }
        let start = Instant::now();

        // Step 1: Features
        let gray = image.to_gray()?;
        let features = self.extractor.extract(&gray, camera);
        let frame = Frame::new(timestamp, features, camera.width as f64, camera.height as f64);

        // Step 2: Track
        let config = self.shared.config();
        self.sync_loop_closures();
        let outcome = self.tracker.process(frame, &config);

        // Step 3: Hand over a new keyframe
        let result = match outcome {
            Ok(outcome) => {
                if let Some(msg) = outcome.keyframe {
                    self.dispatch_keyframe(msg);
                }
                Ok(outcome.pose)
            }
            Err(e) => Err(e),
        };

        // Step 4: Statistics and notifications
        self.update_stats(&config, start);
        if let Ok(Some(pose)) = &result {
            self.current_pose = Some(*pose);
            self.shared.report_pose(pose);
        }
        result
    }

    fn dispatch_keyframe(&mut self, msg: NewKeyFrameMsg) {
        match &mut self.mapping {
            Mapping::Inline(mapper) => {
                mapper.process_keyframe(msg);
                self.sync_loop_closures();
            }
            Mapping::Worker { sender, .. } => {
                let Some(sender) = sender.as_ref() else {
                    return;
                };
                match sender.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(msg)) => {
                        warn!("[System] Mapping worker busy, keyframe skipped");
                        self.tracker.keyframe_rejected(msg);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        self.shared.fail("mapping worker terminated");
                    }
                }
            }
        }
    }

    /// Re-anchor the motion model after the mapper moved keyframes.
    fn sync_loop_closures(&mut self) {
        let closures = self.shared.loop_closure_count();
        if closures != self.seen_loop_closures {
            self.seen_loop_closures = closures;
            self.tracker.follow_map_correction();
        }
    }

    fn update_stats(&mut self, config: &SlamConfig, start: Instant) {
        let map = self.shared.snapshot();
        let last = self.tracker.last_stats();
        let mut stats = TrackingStats {
            tracking_keyframes: last.local_keyframes,
            total_keyframes: map.num_keyframes(),
            total_landmarks: map.num_landmarks(),
            mean_reprojection_error: last.mean_error,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            quality: TrackingQuality::grade(last.confidence, last.inlier_count, config.min_tracking_features),
            feature_count: last.feature_count,
            matched_count: last.matched_count,
            loop_closure_count: self.shared.loop_closure_count(),
            relocalization_count: self.tracker.relocalization_count(),
            tracking_loss_count: self.tracker.tracking_loss_count(),
            avg_tracking_confidence: self.stats.avg_tracking_confidence,
        };
        stats.update_confidence(last.confidence);
        self.stats = stats;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop the map and every counter and go back to READY.
    pub fn reset(&mut self) -> Result<(), SlamError> {
        self.ensure_operational()?;
        let config = self.shared.config();
        self.shared.replace_map(new_map(&config));
        self.tracker.reset();
        self.shared.reset_counters();
        self.seen_loop_closures = 0;
        self.current_pose = None;
        self.stats = TrackingStats::default();
        self.shared.set_state(SystemState::Ready);
        info!("[System] Reset");
        Ok(())
    }

    /// Drop the map but keep counters and configuration.
    pub fn clear_map(&mut self) -> Result<(), SlamError> {
        self.ensure_operational()?;
        let config = self.shared.config();
        self.shared.replace_map(new_map(&config));
        self.tracker.forget_map();
        self.current_pose = None;
        self.shared.set_state(SystemState::Ready);
        info!("[System] Map cleared");
        Ok(())
    }

    /// Write the active map to a file, returning the bytes written.
    pub fn save_map<P: AsRef<Path>>(&self, path: P) -> Result<usize, SlamError> {
        self.ensure_operational()?;
        let map = self.shared.snapshot();
        Ok(codec::save_to_file(&map, path.as_ref())?)
    }

    /// Replace the active map with one read from a file. On any error the
    /// active map is left untouched.
    pub fn load_map<P: AsRef<Path>>(&mut self, path: P) -> Result<(), SlamError> {
        self.ensure_operational()?;
        let limits = self.shared.config().map_limits();
        let map = codec::load_from_file(path.as_ref(), limits)?;
        self.install_map(map);
        Ok(())
    }

    /// Bytes [`SlamSystem::save_map_to_buffer`] needs for the active map.
    pub fn serialized_map_size(&self) -> usize {
        codec::encoded_size(&self.shared.snapshot())
    }

    /// Serialize the active map into `buffer`, returning the bytes written.
    pub fn save_map_to_buffer(&self, buffer: &mut [u8]) -> Result<usize, SlamError> {
        self.ensure_operational()?;
        let map = self.shared.snapshot();
        Ok(codec::encode_into(&map, buffer)?)
    }

    pub fn load_map_from_buffer(&mut self, data: &[u8]) -> Result<(), SlamError> {
        self.ensure_operational()?;
        if data.is_empty() {
            return Err(SlamError::InvalidParameter("empty map buffer".into()));
        }
        let limits = self.shared.config().map_limits();
        let map = codec::decode(data, limits)?;
        self.install_map(map);
        Ok(())
    }

    /// Swap in a decoded map; the camera has to relocalize against it.
    fn install_map(&mut self, map: Map) {
        info!(
            "[System] Loaded map '{}' ({} KFs, {} landmarks)",
            map.id(),
            map.num_keyframes(),
            map.num_landmarks()
        );
        self.shared.replace_map(map);
        self.tracker.forget_map();
        self.current_pose = None;
        self.shared.set_state(SystemState::Lost);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> SystemState {
        self.shared.state()
    }

    /// Last accepted camera pose.
    pub fn pose(&self) -> Option<Pose> {
        self.current_pose
    }

    pub fn stats(&self) -> TrackingStats {
        self.stats.clone()
    }

    pub fn map_info(&self) -> MapInfo {
        MapInfo::of(&self.shared.snapshot())
    }

    pub fn config(&self) -> SlamConfig {
        self.shared.config()
    }

    /// Pose of the last successful relocalization.
    pub fn relocalization_result(&self) -> Option<Pose> {
        self.tracker.last_relocalization()
    }

    /// (current, peak) estimated map memory in MB.
    pub fn memory_usage(&self) -> (f64, f64) {
        let current = self.shared.snapshot().memory_usage_bytes();
        let peak = self.shared.peak_memory_bytes().max(current);
        (current as f64 / BYTES_PER_MB, peak as f64 / BYTES_PER_MB)
    }

    /// Whether `required_mb` more fits under the configured memory limit.
    pub fn check_memory_available(&self, required_mb: f64) -> bool {
        let (current, _) = self.memory_usage();
        current + required_mb.max(0.0) <= self.shared.config().memory_limit_mb as f64
    }

    /// Reason for entering FAILED, if it happened.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure()
    }

    pub fn is_tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply a new configuration to subsequent frames. Ceilings only bound
    /// future insertions; the threading mode is fixed at creation.
    pub fn update_config(&mut self, config: SlamConfig) -> Result<(), SlamError> {
        self.ensure_operational()?;
        config.validate()?;

        let previous = self.shared.config();
        if config.enable_multithreading != previous.enable_multithreading {
            warn!("[System] Threading mode is fixed at creation, keeping the current one");
        }

        let limits = config.map_limits();
        loop {
            let epoch = self.shared.epoch();
            let applied = self.shared.try_commit(epoch, |map| {
                map.set_limits(limits);
                Ok::<_, MapError>(())
            });
            match applied {
                Some(result) => {
                    result?;
                    break;
                }
                None => continue,
            }
        }

        self.extractor = FeatureExtractor::new(config.extractor());
        self.shared.set_config(config);
        info!("[System] Configuration updated");
        Ok(())
    }

    /// Disabled tracking makes `process_frame` refuse frames; state and map
    /// stay as they are.
    pub fn set_tracking_enabled(&mut self, enabled: bool) -> Result<(), SlamError> {
        self.ensure_operational()?;
        self.tracking_enabled = enabled;
        Ok(())
    }

    pub fn set_relocalization_enabled(&mut self, enabled: bool) -> Result<(), SlamError> {
        self.ensure_operational()?;
        let mut config = self.shared.config();
        config.enable_relocalization = enabled;
        self.shared.set_config(config);
        Ok(())
    }

    /// Ask the tracker to relocalize on the next frames, even while tracking.
    pub fn request_relocalization(&mut self) -> Result<(), SlamError> {
        self.ensure_operational()?;
        if !self.shared.config().enable_relocalization {
            return Err(SlamError::SystemNotReady("relocalization is disabled".into()));
        }
        self.tracker.request_relocalization();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Callbacks
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_state_callback<F>(&self, callback: Option<F>)
    where
        F: Fn(SystemState, SystemState) + Send + Sync + 'static,
    {
        let callback = callback.map(|f| Arc::new(f) as StateChangeFn);
        self.shared.with_callbacks(|cbs| cbs.on_state_change = callback);
    }

    pub fn set_pose_callback<F>(&self, callback: Option<F>)
    where
        F: Fn(&Pose) + Send + Sync + 'static,
    {
        let callback = callback.map(|f| Arc::new(f) as PoseUpdateFn);
        self.shared.with_callbacks(|cbs| cbs.on_pose_update = callback);
    }

    pub fn set_error_callback<F>(&self, callback: Option<F>)
    where
        F: Fn(ResultCode, &str) + Send + Sync + 'static,
    {
        let callback = callback.map(|f| Arc::new(f) as ErrorFn);
        self.shared.with_callbacks(|cbs| cbs.on_error = callback);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop the mapping worker and wait for it.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Mapping::Worker { sender, handle } = &mut self.mapping {
            // Closing the channel wakes the worker immediately.
            sender.take();
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    warn!("[System] Mapping worker panicked");
                }
            }
        }
    }

    fn ensure_operational(&self) -> Result<(), SlamError> {
        if self.shared.is_failed() {
            let reason = self.shared.failure().unwrap_or_default();
            return Err(SlamError::SystemNotReady(format!("system failed: {reason}")));
        }
        Ok(())
    }
}

fn new_map(config: &SlamConfig) -> Map {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Map::new(DEFAULT_MAP_ID, created, config.map_limits())
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SlamSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlamSystem")
            .field("state", &self.state())
            .field("tracking_enabled", &self.tracking_enabled)
            .field("inline_mapping", &matches!(self.mapping, Mapping::Inline(_)))
            .field("shared", &self.shared)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::io::{CircularTrajectory, SyntheticScene};
    use crate::map::{KeyFrameId, MapLimits};
    use crate::tracking::frame::{FeatureSet, KeyPoint};
    use nalgebra::Vector2;
    use parking_lot::Mutex;

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }

    fn vocabulary() -> Arc<Vocabulary> {
        Arc::new(Vocabulary::synthetic(4, 3, 7))
    }

    fn sync_config() -> SlamConfig {
        SlamConfig {
            enable_multithreading: false,
            ..SlamConfig::default()
        }
    }

    fn system(config: SlamConfig) -> SlamSystem {
        SlamSystem::create(config, camera(), vocabulary()).unwrap()
    }

    fn features(n: usize, seed: u8) -> Arc<FeatureSet> {
        Arc::new(FeatureSet {
            keypoints: (0..n)
                .map(|i| KeyPoint {
                    pt: Vector2::new(30.0 + 20.0 * i as f64, 40.0 + 3.0 * i as f64),
                    angle: 0.0,
                    response: 1.0,
                })
                .collect(),
            descriptors: (0..n).map(|i| [seed.wrapping_add(i as u8); 32]).collect(),
        })
    }

    /// Encoded two-keyframe map with a handful of landmarks.
    fn saved_map() -> Vec<u8> {
        let mut map = Map::new("office", 12.5, MapLimits::default());
        let kf0 = map
            .insert_keyframe(0.0, SE3::identity(), features(8, 0), [(1, 0.5), (3, 0.5)].into())
            .unwrap();
        let pose1 = SE3::from_params(&Vector3::new(0.0, 0.05, 0.0), &Vector3::new(0.2, 0.0, 0.0));
        let kf1 = map
            .insert_keyframe(0.5, pose1, features(8, 90), [(1, 1.0)].into())
            .unwrap();
        for i in 0..6 {
            let lm = map
                .insert_landmark(Vector3::new(i as f64 - 2.0, 0.5, 4.0 + i as f64), [i as u8; 32], kf0)
                .unwrap();
            map.associate(kf0, i, lm).unwrap();
            map.associate(kf1, i, lm).unwrap();
        }
        codec::encode(&map)
    }

    #[test]
    fn test_create_reports_ready() {
        let slam = system(SlamConfig::default());
        assert_eq!(slam.state(), SystemState::Ready);
        assert!(slam.pose().is_none());
        let info = slam.map_info();
        assert_eq!(info.num_keyframes, 0);
        assert_eq!(info.num_landmarks, 0);
        assert_eq!(info.map_id, DEFAULT_MAP_ID);
        assert_eq!(
            SlamSystem::version(),
            format!("{VERSION_MAJOR}.{VERSION_MINOR}.{VERSION_PATCH}")
        );
    }

    #[test]
    fn test_create_rejects_invalid_input() {
        let bad_config = SlamConfig {
            max_features: 0,
            ..SlamConfig::default()
        };
        let err = SlamSystem::create(bad_config, camera(), vocabulary()).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParameter);

        let bad_camera = CameraModel::pinhole(0.0, 400.0, 320.0, 240.0, 640, 480);
        let err = SlamSystem::create(SlamConfig::default(), bad_camera, vocabulary()).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParameter);

        let err = SlamSystem::create_with_vocabulary_file(
            SlamConfig::default(),
            camera(),
            "/nonexistent/vocabulary.txt",
        )
        .unwrap_err();
        assert_eq!(err.code(), ResultCode::FileNotFound);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut slam = system(sync_config());
        slam.load_map_from_buffer(&saved_map()).unwrap();
        assert_eq!(slam.state(), SystemState::Lost);

        slam.reset().unwrap();
        let once = (slam.state(), slam.map_info().num_keyframes, slam.stats());
        slam.reset().unwrap();
        let twice = (slam.state(), slam.map_info().num_keyframes, slam.stats());
        assert_eq!(once, twice);
        assert_eq!(twice.0, SystemState::Ready);
        assert_eq!(twice.1, 0);
    }

    #[test]
    fn test_blank_frame_has_insufficient_features() {
        let mut slam = system(sync_config());
        let pixels = vec![128u8; 640 * 480];
        let image = ImageView::new(&pixels, 640, 480, 1);
        let err = slam.process_frame(&image, 0.0).unwrap_err();
        assert_eq!(err.code(), ResultCode::InsufficientFeatures);
        assert_eq!(slam.state(), SystemState::Ready);
        assert_eq!(slam.stats().feature_count, 0);
        assert_eq!(slam.stats().quality, TrackingQuality::Poor);
    }

    #[test]
    fn test_frame_validation() {
        let mut slam = system(sync_config());
        let pixels = vec![0u8; 320 * 240];
        let err = slam
            .process_frame(&ImageView::new(&pixels, 320, 240, 1), 0.0)
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParameter);

        let pixels = vec![0u8; 640 * 480];
        let err = slam
            .process_frame(&ImageView::new(&pixels, 640, 480, 1), f64::NAN)
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParameter);

        let err = slam
            .process_frame(&ImageView::new(&pixels, 640, 480, 2), 0.0)
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::UnsupportedFormat);
    }

    #[test]
    fn test_disabled_tracking_refuses_frames() {
        let mut slam = system(sync_config());
        slam.set_tracking_enabled(false).unwrap();
        let pixels = vec![128u8; 640 * 480];
        let err = slam
            .process_frame(&ImageView::new(&pixels, 640, 480, 1), 0.0)
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::SystemNotReady);
        assert_eq!(slam.state(), SystemState::Ready);
        assert!(!slam.is_tracking_enabled());
    }

    #[test]
    fn test_relocalization_request_while_disabled() {
        let mut slam = system(sync_config());
        slam.load_map_from_buffer(&saved_map()).unwrap();
        slam.set_relocalization_enabled(false).unwrap();
        let err = slam.request_relocalization().unwrap_err();
        assert_eq!(err.code(), ResultCode::SystemNotReady);
        assert_eq!(slam.state(), SystemState::Lost);

        slam.set_relocalization_enabled(true).unwrap();
        slam.request_relocalization().unwrap();
        assert_eq!(slam.state(), SystemState::Lost);
    }

    #[test]
    fn test_buffer_roundtrip_restores_map_info() {
        let mut slam = system(sync_config());
        slam.load_map_from_buffer(&saved_map()).unwrap();
        let before = slam.map_info();
        assert_eq!(before.map_id, "office");
        assert_eq!(before.num_keyframes, 2);
        assert_eq!(before.num_landmarks, 6);
        assert_eq!(slam.pose(), None);

        let size = slam.serialized_map_size();
        let mut small = vec![0u8; size - 1];
        let err = slam.save_map_to_buffer(&mut small).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParameter);

        let mut buffer = vec![0u8; size + 16];
        let written = slam.save_map_to_buffer(&mut buffer).unwrap();
        assert_eq!(written, size);

        slam.clear_map().unwrap();
        assert_eq!(slam.state(), SystemState::Ready);
        assert_eq!(slam.map_info().num_landmarks, 0);

        slam.load_map_from_buffer(&buffer[..written]).unwrap();
        assert_eq!(slam.map_info(), before);
        assert_eq!(slam.state(), SystemState::Lost);
    }

    #[test]
    fn test_file_roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("office.map");

        let mut slam = system(sync_config());
        slam.load_map_from_buffer(&saved_map()).unwrap();
        let before = slam.map_info();
        let written = slam.save_map(&path).unwrap();
        assert_eq!(written, std::fs::metadata(&path).unwrap().len() as usize);

        slam.reset().unwrap();
        slam.load_map(&path).unwrap();
        assert_eq!(slam.map_info(), before);

        let err = slam.load_map(dir.path().join("missing.map")).unwrap_err();
        assert_eq!(err.code(), ResultCode::FileNotFound);
        assert_eq!(slam.map_info(), before);
    }

    #[test]
    fn test_corrupted_map_leaves_active_map() {
        let mut slam = system(sync_config());
        slam.load_map_from_buffer(&saved_map()).unwrap();
        let before = slam.map_info();

        let mut bad_magic = saved_map();
        bad_magic[0] ^= 0xFF;
        let err = slam.load_map_from_buffer(&bad_magic).unwrap_err();
        assert_eq!(err.code(), ResultCode::MapLoadFailed);

        let mut bad_version = saved_map();
        bad_version[8..12].copy_from_slice(&99u32.to_le_bytes());
        let err = slam.load_map_from_buffer(&bad_version).unwrap_err();
        assert_eq!(err.code(), ResultCode::MapLoadFailed);

        let truncated = saved_map();
        let err = slam
            .load_map_from_buffer(&truncated[..truncated.len() / 2])
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::MapLoadFailed);

        assert_eq!(slam.map_info(), before);
        assert_eq!(slam.state(), SystemState::Lost);
    }

    #[test]
    fn test_state_callback_sees_transitions() {
        let mut slam = system(sync_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        slam.set_state_callback(Some(move |prev: SystemState, next: SystemState| {
            sink.lock().push((prev, next));
        }));

        slam.load_map_from_buffer(&saved_map()).unwrap();
        slam.clear_map().unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (SystemState::Ready, SystemState::Lost),
                (SystemState::Lost, SystemState::Ready),
            ]
        );

        slam.set_state_callback(None::<fn(SystemState, SystemState)>);
        slam.load_map_from_buffer(&saved_map()).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_update_config_validates_and_applies() {
        let mut slam = system(sync_config());
        let bad = SlamConfig {
            keyframe_angle: 0.0,
            ..sync_config()
        };
        assert_eq!(
            slam.update_config(bad).unwrap_err().code(),
            ResultCode::InvalidParameter
        );

        let config = SlamConfig {
            max_keyframes: 42,
            max_features: 600,
            ..sync_config()
        };
        slam.update_config(config).unwrap();
        assert_eq!(slam.config().max_keyframes, 42);
        assert_eq!(slam.config().max_features, 600);
        assert_eq!(slam.shared.snapshot().limits().max_keyframes, 42);
        assert_eq!(slam.state(), SystemState::Ready);
    }

    #[test]
    fn test_memory_queries() {
        let mut slam = system(sync_config());
        slam.load_map_from_buffer(&saved_map()).unwrap();
        let (current, peak) = slam.memory_usage();
        assert!(current > 0.0);
        assert!(peak >= current);
        assert!(slam.check_memory_available(1.0));
        assert!(!slam.check_memory_available(1.0e6));

        slam.clear_map().unwrap();
        let (after, peak_after) = slam.memory_usage();
        assert!(after < current);
        assert!(peak_after >= peak);
    }

    fn scene() -> SyntheticScene {
        SyntheticScene::cylinder(camera(), 4.0, 3.0, 0.2, 5)
    }

    fn feed(
        slam: &mut SlamSystem,
        scene: &SyntheticScene,
        trajectory: &CircularTrajectory,
        i: usize,
    ) -> Result<Option<Pose>, SlamError> {
        let pixels = scene.render(&trajectory.pose(i));
        let image = ImageView::new(&pixels, 640, 480, 1);
        slam.process_frame(&image, trajectory.timestamp(i))
    }

    fn run_sequence(frames: usize) -> (Vec<Result<Option<Pose>, ResultCode>>, TrackingStats, usize, usize) {
        let scene = scene();
        let trajectory = CircularTrajectory::default();
        let mut slam = system(sync_config());
        let results = (0..frames)
            .map(|i| feed(&mut slam, &scene, &trajectory, i).map_err(|e| e.code()))
            .collect();
        let mut stats = slam.stats();
        stats.processing_time_ms = 0.0;
        let info = slam.map_info();
        (results, stats, info.num_keyframes, info.num_landmarks)
    }

    #[test]
    fn test_single_threaded_runs_are_identical() {
        let first = run_sequence(30);
        let second = run_sequence(30);
        assert_eq!(first, second);
        assert!(first.1.feature_count > 0);
        // The comparison covers tracked frames, not only bootstrap attempts.
        let tracked = first.0[10..].iter().filter(|r| matches!(r, Ok(Some(_)))).count();
        assert!(tracked >= 15);
        assert!(first.2 >= 3);
    }

    #[test]
    fn test_rendered_frames_reach_tracking() {
        let scene = scene();
        let trajectory = CircularTrajectory::default();
        let mut slam = system(sync_config());
        let mut tracked: Vec<(usize, Pose)> = Vec::new();
        for i in 0..20 {
            if let Ok(Some(pose)) = feed(&mut slam, &scene, &trajectory, i) {
                tracked.push((i, pose));
            }
        }
        assert_eq!(slam.state(), SystemState::Tracking);
        assert!(tracked.len() >= 15, "only {} frames tracked", tracked.len());
        assert!(slam.map_info().num_keyframes >= 3);

        // Rotation is free of the monocular scale ambiguity.
        let (first, first_pose) = tracked[0];
        let first_pose = first_pose.to_se3();
        for &(i, pose) in &tracked[1..] {
            let estimated = first_pose.angle_to(&pose.to_se3());
            let truth = trajectory.pose(first).angle_to(&trajectory.pose(i));
            assert!(
                (estimated - truth).abs() < 0.5_f64.to_radians(),
                "frame {i}: rotated {estimated:.4} rad, truth {truth:.4} rad"
            );
        }
    }

    #[test]
    fn test_second_lap_closes_the_loop_and_reuses_landmarks() {
        let scene = scene();
        let trajectory = CircularTrajectory::default();
        let vocabulary = Arc::new(Vocabulary::synthetic(10, 3, 7));
        let mut slam = SlamSystem::create(sync_config(), camera(), vocabulary).unwrap();

        let frames = 280;
        let mut landmarks = Vec::with_capacity(frames);
        let mut first_closure = None;
        for i in 0..frames {
            let _ = feed(&mut slam, &scene, &trajectory, i);
            landmarks.push(slam.map_info().num_landmarks as i64);
            if first_closure.is_none() && slam.stats().loop_closure_count >= 1 {
                first_closure = Some(i);
            }
        }

        // One lap is 180 frames (6 s); the first view comes back into
        // sight about 30 frames before the lap ends.
        let closure = first_closure.expect("no loop closed");
        assert!(closure > 140 && closure <= 230, "loop closed at frame {closure}");
        assert!(slam.stats().loop_closure_count >= 1);

        // Once merged, revisited structure is matched instead of rebuilt.
        let exploring = landmarks[105] - landmarks[60];
        let revisiting = landmarks[closure + 45] - landmarks[closure];
        assert!(exploring > 0);
        assert!(
            revisiting * 3 < exploring,
            "{revisiting} new landmarks after the loop, {exploring} while exploring"
        );

        let map = slam.shared.snapshot();
        let timestamp = |id: KeyFrameId| map.keyframe(id).map_or(f64::NAN, |kf| kf.timestamp);
        let linked = map.covisibility_edges().into_iter().any(|(a, b, _)| {
            let (ta, tb) = (timestamp(a), timestamp(b));
            (ta < 2.0 && tb > 5.0) || (tb < 2.0 && ta > 5.0)
        });
        assert!(linked, "no covisibility between the start and the end of the lap");
    }

    #[test]
    fn test_worker_shuts_down_on_drop() {
        let mut slam = system(SlamConfig::default());
        slam.shutdown();
        slam.shutdown();
        drop(slam);

        let slam = system(SlamConfig::default());
        drop(slam);
    }
}
