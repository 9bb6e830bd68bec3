//! Runtime configuration.
//!
//! Every field has a default, so partial YAML files are accepted:
//!
//! ```yaml
//! max_features: 1500
//! enable_loop_closure: false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::geometry::{PoseEstimatorConfig, TwoViewConfig};
use crate::map::MapLimits;
use crate::tracking::frame::ExtractorConfig;
use crate::tracking::keyframe_decision::KeyFrameCriteria;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    // ── Features ────────────────────────────────────────────────────────────
    pub max_features: usize,
    /// Minimum corner score as a fraction of the strongest corner.
    pub feature_quality: f64,
    /// Minimum pixel distance between kept features.
    pub min_feature_distance: f64,

    // ── Tracking ────────────────────────────────────────────────────────────
    /// Correspondences above this error (px) are outliers.
    pub max_reprojection_error: f64,
    pub min_tracking_features: usize,
    pub max_tracking_iterations: usize,
    pub tracking_min_confidence: f64,
    /// Consecutive failed frames before TRACKING → LOST.
    pub max_lost_frames: usize,

    // ── Keyframes ───────────────────────────────────────────────────────────
    /// Fraction of the reference keyframe's landmarks below which a
    /// keyframe is inserted.
    pub keyframe_threshold: f64,
    pub keyframe_distance: f64,
    /// Degrees.
    pub keyframe_angle: f64,

    // ── Threading ───────────────────────────────────────────────────────────
    pub enable_multithreading: bool,
    pub max_threads: usize,

    // ── Loop closure / relocalization ───────────────────────────────────────
    pub enable_loop_closure: bool,
    pub enable_relocalization: bool,
    pub relocalization_min_confidence: f64,
    pub relocalization_max_attempts: usize,
    /// Consecutive keyframes that must agree on a loop candidate.
    pub loop_min_consistency: usize,

    // ── Memory ──────────────────────────────────────────────────────────────
    pub max_keyframes: usize,
    pub max_landmarks: usize,
    pub memory_limit_mb: usize,

    /// Seed for every randomized estimator.
    pub random_seed: u64,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            max_features: 1000,
            feature_quality: 0.01,
            min_feature_distance: 8.0,
            max_reprojection_error: 4.0,
            min_tracking_features: 30,
            max_tracking_iterations: 20,
            tracking_min_confidence: 0.5,
            max_lost_frames: 3,
            keyframe_threshold: 0.9,
            keyframe_distance: 0.1,
            keyframe_angle: 10.0,
            enable_multithreading: true,
            max_threads: 4,
            enable_loop_closure: true,
            enable_relocalization: true,
            relocalization_min_confidence: 0.7,
            relocalization_max_attempts: 5,
            loop_min_consistency: 3,
            max_keyframes: 500,
            max_landmarks: 50_000,
            memory_limit_mb: 512,
            random_seed: 0x5EED,
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

impl SlamConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: SlamConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values outside their meaningful range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_features == 0 {
            return Err(invalid("max_features must be positive"));
        }
        if !(self.feature_quality > 0.0 && self.feature_quality <= 1.0) {
            return Err(invalid("feature_quality must be in (0, 1]"));
        }
        if !(self.min_feature_distance >= 0.0 && self.min_feature_distance.is_finite()) {
            return Err(invalid("min_feature_distance must be non-negative"));
        }
        if !(self.max_reprojection_error > 0.0 && self.max_reprojection_error.is_finite()) {
            return Err(invalid("max_reprojection_error must be positive"));
        }
        if self.min_tracking_features < crate::geometry::pnp::MIN_CORRESPONDENCES {
            return Err(invalid(format!(
                "min_tracking_features must be at least {}",
                crate::geometry::pnp::MIN_CORRESPONDENCES
            )));
        }
        if self.min_tracking_features > self.max_features {
            return Err(invalid("min_tracking_features exceeds max_features"));
        }
        if self.max_tracking_iterations == 0 {
            return Err(invalid("max_tracking_iterations must be positive"));
        }
        if !(self.keyframe_threshold > 0.0 && self.keyframe_threshold <= 1.0) {
            return Err(invalid("keyframe_threshold must be in (0, 1]"));
        }
        if !(self.keyframe_distance > 0.0 && self.keyframe_distance.is_finite()) {
            return Err(invalid("keyframe_distance must be positive"));
        }
        if !(self.keyframe_angle > 0.0 && self.keyframe_angle < 180.0) {
            return Err(invalid("keyframe_angle must be in (0, 180) degrees"));
        }
        if self.max_threads == 0 {
            return Err(invalid("max_threads must be positive"));
        }
        for (name, value) in [
            ("tracking_min_confidence", self.tracking_min_confidence),
            ("relocalization_min_confidence", self.relocalization_min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{name} must be in [0, 1]")));
            }
        }
        if self.relocalization_max_attempts == 0 {
            return Err(invalid("relocalization_max_attempts must be positive"));
        }
        if self.max_lost_frames == 0 {
            return Err(invalid("max_lost_frames must be positive"));
        }
        if self.loop_min_consistency == 0 {
            return Err(invalid("loop_min_consistency must be positive"));
        }
        if self.max_keyframes < 2 {
            return Err(invalid("max_keyframes must be at least 2"));
        }
        if self.max_landmarks < self.min_tracking_features {
            return Err(invalid("max_landmarks is below min_tracking_features"));
        }
        if self.memory_limit_mb == 0 {
            return Err(invalid("memory_limit_mb must be positive"));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Component views
    // ─────────────────────────────────────────────────────────────────────────

    pub fn extractor(&self) -> ExtractorConfig {
        ExtractorConfig {
            max_features: self.max_features,
            quality: self.feature_quality as f32,
            min_distance: self.min_feature_distance as f32,
            num_threads: if self.enable_multithreading {
                self.max_threads
            } else {
                1
            },
            ..ExtractorConfig::default()
        }
    }

    pub fn pose_estimator(&self) -> PoseEstimatorConfig {
        PoseEstimatorConfig {
            max_reprojection_error: self.max_reprojection_error,
            max_iterations: self.max_tracking_iterations,
            min_inliers: self.min_tracking_features,
            seed: self.random_seed,
        }
    }

    pub fn two_view(&self) -> TwoViewConfig {
        TwoViewConfig {
            min_triangulated: self.min_tracking_features.max(50),
            seed: self.random_seed,
            ..TwoViewConfig::default()
        }
    }

    pub fn keyframe_criteria(&self) -> KeyFrameCriteria {
        KeyFrameCriteria {
            min_distance: self.keyframe_distance,
            min_angle_deg: self.keyframe_angle,
            tracked_ratio: self.keyframe_threshold,
        }
    }

    pub fn map_limits(&self) -> MapLimits {
        MapLimits {
            max_keyframes: self.max_keyframes,
            max_landmarks: self.max_landmarks,
            memory_limit_bytes: self.memory_limit_mb * 1024 * 1024,
        }
    }
}
