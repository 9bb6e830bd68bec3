//! SO(3) Lie group utilities.
//!
//! Exponential/logarithm maps between axis-angle vectors and unit
//! quaternions, the skew operator, and the right Jacobian Jr(φ) used by the
//! pose refinement to linearize an axis-angle rotation.

use nalgebra::{Matrix3, Unit, UnitQuaternion, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map: axis-angle vector → rotation.
pub fn exp(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    let theta = phi.norm();
    if theta < SMALL_ANGLE_THRESHOLD {
        // q ≈ [1, φ/2]
        return UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            1.0,
            0.5 * phi.x,
            0.5 * phi.y,
            0.5 * phi.z,
        ));
    }
    UnitQuaternion::from_axis_angle(&Unit::new_normalize(*phi), theta)
}

/// Logarithm map: rotation → axis-angle vector with angle in [0, π].
pub fn log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Computes the right Jacobian Jr(φ) of SO(3).
///
/// The right Jacobian relates the derivative of the exponential map to the
/// Lie algebra element:
///
/// ```text
/// Jr(φ) = I - (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// For small angles (|φ| < ε):
/// ```text
/// Jr(φ) ≈ I - 0.5 [φ]×
/// ```
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        // First-order approximation for small angles
        return Matrix3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;
    let sin_theta = theta.sin();
    let cos_theta = theta.cos();

    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    // Jr(φ) = I - (1 - cos θ)/θ² [φ]× + (θ - sin θ)/θ³ [φ]×²
    Matrix3::identity()
        - ((1.0 - cos_theta) / theta_sq) * skew_phi
        + ((theta - sin_theta) / theta_cu) * skew_phi_sq
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        let cross_direct = v.cross(&u);
        let cross_skew = skew(&v) * u;

        assert_relative_eq!(cross_direct, cross_skew, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let phi = Vector3::new(0.3, -0.1, 0.7);
        assert_relative_eq!(log(&exp(&phi)), phi, epsilon = 1e-12);

        let tiny = Vector3::new(1e-9, 0.0, -2e-9);
        assert_relative_eq!(log(&exp(&tiny)), tiny, epsilon = 1e-15);
    }

    #[test]
    fn test_right_jacobian_first_order() {
        // exp(φ + δ) ≈ exp(φ) · exp(Jr(φ) δ)
        let phi = Vector3::new(0.4, 0.2, -0.3);
        let delta = Vector3::new(1e-6, -2e-6, 1.5e-6);
        let lhs = exp(&(phi + delta));
        let rhs = exp(&phi) * exp(&(right_jacobian_so3(&phi) * delta));
        assert!(lhs.angle_to(&rhs) < 1e-10);
    }

    #[test]
    fn test_right_jacobian_identity_at_zero() {
        let phi = Vector3::zeros();
        let jr = right_jacobian_so3(&phi);

        assert_relative_eq!(jr, Matrix3::identity(), epsilon = 1e-10);
    }
}
