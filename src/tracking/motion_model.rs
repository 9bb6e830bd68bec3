//! Constant-velocity motion model for pose prediction.

use crate::geometry::SE3;

/// Predicts the next camera pose from the relative motion between the last
/// two accepted poses.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    last_pose: Option<SE3>,
    /// Relative motion T_prev⁻¹ ∘ T_last, in the camera frame.
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly accepted pose (T_wc).
    pub fn update(&mut self, pose: &SE3) {
        if let Some(prev) = self.last_pose {
            self.velocity = Some(prev.inverse().compose(pose));
        }
        self.last_pose = Some(*pose);
    }

    /// Last pose advanced by the last relative motion; the last pose itself
    /// when only one pose is known.
    pub fn predict(&self) -> Option<SE3> {
        let last = self.last_pose?;
        Some(match self.velocity {
            Some(v) => last.compose(&v),
            None => last,
        })
    }

    pub fn last_pose(&self) -> Option<&SE3> {
        self.last_pose.as_ref()
    }

    /// Forget the velocity but keep the last pose (after a jump such as a
    /// relocalization or loop correction).
    pub fn restart_from(&mut self, pose: &SE3) {
        self.last_pose = Some(*pose);
        self.velocity = None;
    }

    /// Move the last pose by a world-frame `correction`. The velocity is
    /// relative to the camera and survives rigid corrections.
    pub fn correct(&mut self, correction: &SE3) {
        if let Some(last) = self.last_pose {
            self.last_pose = Some(correction.compose(&last));
        }
    }

    pub fn reset(&mut self) {
        self.last_pose = None;
        self.velocity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_constant_velocity_prediction() {
        let mut model = MotionModel::new();
        assert!(model.predict().is_none());

        let p0 = SE3::from_params(&Vector3::new(0.0, 0.1, 0.0), &Vector3::new(0.0, 0.0, 0.0));
        let step = SE3::from_params(&Vector3::new(0.0, 0.05, 0.0), &Vector3::new(0.1, 0.0, 0.02));
        let p1 = p0.compose(&step);
        let p2 = p1.compose(&step);

        model.update(&p0);
        assert_eq!(model.predict(), Some(p0));
        model.update(&p1);
        let predicted = model.predict().unwrap();
        assert_relative_eq!(predicted.translation, p2.translation, epsilon = 1e-12);
        assert!(predicted.angle_to(&p2) < 1e-9);

        // A rigid correction moves the prediction by the same amount.
        let correction = SE3::from_params(&Vector3::new(0.0, 0.0, 0.3), &Vector3::new(1.0, -2.0, 0.5));
        let mut corrected = model.clone();
        corrected.correct(&correction);
        let expected = correction.compose(&p2);
        let predicted = corrected.predict().unwrap();
        assert_relative_eq!(predicted.translation, expected.translation, epsilon = 1e-9);
        assert!(predicted.angle_to(&expected) < 1e-9);

        model.restart_from(&p2);
        assert_eq!(model.predict(), Some(p2));
        model.reset();
        assert!(model.last_pose().is_none());
    }
}
