//! KeyFrame decision criteria.

use crate::geometry::SE3;

/// Thresholds for inserting a new keyframe.
#[derive(Debug, Clone)]
pub struct KeyFrameCriteria {
    /// Translation from the reference keyframe (map units).
    pub min_distance: f64,
    /// Rotation from the reference keyframe (degrees).
    pub min_angle_deg: f64,
    /// Insert when tracked landmarks fall below this fraction of the
    /// reference keyframe's landmarks.
    pub tracked_ratio: f64,
}

impl Default for KeyFrameCriteria {
    fn default() -> Self {
        Self {
            min_distance: 0.1,
            min_angle_deg: 10.0,
            tracked_ratio: 0.9,
        }
    }
}

/// Why a keyframe was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameReason {
    Distance,
    Rotation,
    TrackedRatio,
}

/// Evaluates the criteria once per accepted frame.
#[derive(Debug, Default)]
pub struct KeyFrameDecision {
    frames_since_kf: usize,
}

impl KeyFrameDecision {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether the frame at `pose` should become a keyframe.
    ///
    /// # Arguments
    /// * `pose` - Pose of the current frame (T_wc)
    /// * `reference_pose` - Pose of the reference keyframe
    /// * `tracked` - Landmarks tracked as inliers in the current frame
    /// * `reference_landmarks` - Landmarks observed by the reference keyframe
    pub fn evaluate(
        &mut self,
        criteria: &KeyFrameCriteria,
        pose: &SE3,
        reference_pose: &SE3,
        tracked: usize,
        reference_landmarks: usize,
    ) -> Option<KeyFrameReason> {
        self.frames_since_kf += 1;

        let reason = if pose.distance_to(reference_pose) >= criteria.min_distance {
            Some(KeyFrameReason::Distance)
        } else if pose.angle_to(reference_pose).to_degrees() >= criteria.min_angle_deg {
            Some(KeyFrameReason::Rotation)
        } else if reference_landmarks > 0
            && (tracked as f64) < criteria.tracked_ratio * reference_landmarks as f64
        {
            Some(KeyFrameReason::TrackedRatio)
        } else {
            None
        };

        if reason.is_some() {
            self.frames_since_kf = 0;
        }
        reason
    }

    pub fn frames_since_keyframe(&self) -> usize {
        self.frames_since_kf
    }

    /// Reset after a keyframe was created outside [`Self::evaluate`].
    pub fn reset(&mut self) {
        self.frames_since_kf = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_criteria() {
        let criteria = KeyFrameCriteria::default();
        let mut decision = KeyFrameDecision::new();
        let reference = SE3::identity();

        let near = SE3::from_params(&Vector3::zeros(), &Vector3::new(0.02, 0.0, 0.0));
        assert_eq!(decision.evaluate(&criteria, &near, &reference, 95, 100), None);
        assert_eq!(decision.frames_since_keyframe(), 1);

        let far = SE3::from_params(&Vector3::zeros(), &Vector3::new(0.15, 0.0, 0.0));
        assert_eq!(
            decision.evaluate(&criteria, &far, &reference, 95, 100),
            Some(KeyFrameReason::Distance)
        );
        assert_eq!(decision.frames_since_keyframe(), 0);

        let turned = SE3::from_params(&Vector3::new(0.0, 12f64.to_radians(), 0.0), &Vector3::zeros());
        assert_eq!(
            decision.evaluate(&criteria, &turned, &reference, 95, 100),
            Some(KeyFrameReason::Rotation)
        );

        assert_eq!(
            decision.evaluate(&criteria, &near, &reference, 80, 100),
            Some(KeyFrameReason::TrackedRatio)
        );
    }
}
