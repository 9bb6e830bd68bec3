//! SE3 rigid-body transforms.
//!
//! Poses in this crate are stored as camera-to-world transforms (T_wc):
//! `p_world = pose.transform_point(&p_cam)`. Use [`SE3::inverse`] to obtain
//! the world-to-camera transform needed for projection.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Rotation3, UnitQuaternion, Vector3};

use super::so3;

/// Rigid transform: rotation followed by translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and translation.
    ///
    /// The matrix is re-orthonormalized, so slightly noisy estimates
    /// (e.g. from a linear solver) still produce a valid rotation.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation: *translation,
        }
    }

    pub fn from_quaternion(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a tangent-space vector `[ω, t]` (rotation as axis-angle,
    /// translation taken directly).
    pub fn from_params(omega: &Vector3<f64>, translation: &Vector3<f64>) -> Self {
        Self {
            rotation: so3::exp(omega),
            translation: *translation,
        }
    }

    /// Inverse of [`SE3::from_params`].
    pub fn to_params(&self) -> (Vector3<f64>, Vector3<f64>) {
        (so3::log(&self.rotation), self.translation)
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// 3x4 `[R | t]` matrix.
    pub fn to_matrix3x4(&self) -> Matrix3x4<f64> {
        let r = self.rotation_matrix();
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 4>(0, 0).copy_from(&self.to_matrix3x4());
        m
    }

    /// Rotation angle of `self⁻¹ ∘ other` in radians.
    pub fn angle_to(&self, other: &SE3) -> f64 {
        (self.rotation.inverse() * other.rotation).angle()
    }

    /// Distance between the two translations.
    pub fn distance_to(&self, other: &SE3) -> f64 {
        (self.translation - other.translation).norm()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            translation: Vector3::new(1.0, -2.0, 0.5),
        }
    }

    #[test]
    fn test_inverse_roundtrip() {
        let pose = sample_pose();
        let p = Vector3::new(0.3, 0.4, 2.0);
        let back = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_order() {
        let a = sample_pose();
        let b = SE3::from_params(&Vector3::new(0.0, 0.5, 0.0), &Vector3::new(0.0, 0.0, 1.0));
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(
            a.compose(&b).transform_point(&p),
            a.transform_point(&b.transform_point(&p)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_params_roundtrip() {
        let pose = sample_pose();
        let (omega, t) = pose.to_params();
        let back = SE3::from_params(&omega, &t);
        assert_relative_eq!(back.rotation_matrix(), pose.rotation_matrix(), epsilon = 1e-12);
        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_angle_and_distance() {
        let a = SE3::identity();
        let b = SE3::from_params(&Vector3::new(0.0, 0.0, 0.25), &Vector3::new(3.0, 4.0, 0.0));
        assert_relative_eq!(a.angle_to(&b), 0.25, epsilon = 1e-12);
        assert_relative_eq!(a.distance_to(&b), 5.0, epsilon = 1e-12);
    }
}
