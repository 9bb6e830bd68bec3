//! Pose and tracking statistics reported to the host.

use nalgebra::{UnitQuaternion, Vector3};
use serde::Serialize;

use crate::geometry::SE3;

/// Smoothing factor of [`TrackingStats::avg_tracking_confidence`].
pub const CONFIDENCE_EMA_ALPHA: f64 = 0.1;

/// Camera pose in the world frame as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Pose {
    pub position: Vector3<f64>,
    /// Normalized orientation (camera to world).
    pub orientation: UnitQuaternion<f64>,
    /// Seconds, as supplied with the frame.
    pub timestamp: f64,
    /// In [0, 1].
    pub confidence: f64,
}

impl Pose {
    pub fn from_se3(pose: &SE3, timestamp: f64, confidence: f64) -> Self {
        Self {
            position: pose.translation,
            orientation: pose.rotation,
            timestamp,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn to_se3(&self) -> SE3 {
        SE3::from_quaternion(self.orientation, self.position)
    }
}

/// Discretized tracking quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub enum TrackingQuality {
    #[default]
    Poor,
    Fair,
    Good,
    Excellent,
}

impl TrackingQuality {
    /// Grade from tracking confidence and the inlier count relative to the
    /// minimum required.
    pub fn grade(confidence: f64, inliers: usize, min_inliers: usize) -> Self {
        let min = min_inliers.max(1) as f64;
        let ratio = inliers as f64 / min;
        if confidence >= 0.85 && ratio >= 3.0 {
            TrackingQuality::Excellent
        } else if confidence >= 0.7 && ratio >= 2.0 {
            TrackingQuality::Good
        } else if confidence >= 0.5 && ratio >= 1.0 {
            TrackingQuality::Fair
        } else {
            TrackingQuality::Poor
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackingQuality::Poor => "Poor",
            TrackingQuality::Fair => "Fair",
            TrackingQuality::Good => "Good",
            TrackingQuality::Excellent => "Excellent",
        }
    }
}

/// Per-frame statistics, recomputed after every processed frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackingStats {
    /// Keyframes in the local window used for the last frame.
    pub tracking_keyframes: usize,
    pub total_keyframes: usize,
    pub total_landmarks: usize,
    /// Mean inlier reprojection error of the last tracked frame (px).
    pub mean_reprojection_error: f64,
    pub processing_time_ms: f64,
    pub quality: TrackingQuality,
    pub feature_count: usize,
    pub matched_count: usize,
    pub loop_closure_count: u64,
    pub relocalization_count: u64,
    pub tracking_loss_count: u64,
    pub avg_tracking_confidence: f64,
}

impl TrackingStats {
    /// Fold a new confidence sample into the running average.
    pub fn update_confidence(&mut self, confidence: f64) {
        self.avg_tracking_confidence += CONFIDENCE_EMA_ALPHA * (confidence - self.avg_tracking_confidence);
    }
}

/// Measurements of the last processed frame, filled by the tracker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    pub feature_count: usize,
    pub matched_count: usize,
    pub inlier_count: usize,
    pub mean_error: f64,
    pub confidence: f64,
    pub local_keyframes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quality_grades() {
        assert_eq!(TrackingQuality::grade(0.95, 120, 30), TrackingQuality::Excellent);
        assert_eq!(TrackingQuality::grade(0.75, 70, 30), TrackingQuality::Good);
        assert_eq!(TrackingQuality::grade(0.55, 30, 30), TrackingQuality::Fair);
        assert_eq!(TrackingQuality::grade(0.4, 200, 30), TrackingQuality::Poor);
        assert!(TrackingQuality::Excellent > TrackingQuality::Poor);
    }

    #[test]
    fn test_confidence_ema() {
        let mut stats = TrackingStats::default();
        stats.update_confidence(1.0);
        assert_relative_eq!(stats.avg_tracking_confidence, 0.1);
        stats.update_confidence(1.0);
        assert_relative_eq!(stats.avg_tracking_confidence, 0.19);
    }

    #[test]
    fn test_pose_roundtrip_clamps_confidence() {
        let se3 = SE3::from_params(&Vector3::new(0.1, 0.2, 0.3), &Vector3::new(1.0, 2.0, 3.0));
        let pose = Pose::from_se3(&se3, 4.5, 1.7);
        assert_eq!(pose.confidence, 1.0);
        assert_relative_eq!(pose.to_se3().translation, se3.translation);
        assert_relative_eq!(pose.orientation.norm(), 1.0, epsilon = 1e-12);
    }
}
