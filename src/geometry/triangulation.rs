//! Two-view point triangulation and its geometric checks.

use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};

use crate::geometry::so3::skew;
use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

/// Triangulate a point from two normalized observations using the linear
/// (DLT) method.
///
/// # Arguments
/// * `xn1`, `xn2` - Normalized camera coordinates (z = 1)
/// * `pose1`, `pose2` - Camera poses (T_wc)
pub fn triangulate_dlt(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    pose1: &SE3,
    pose2: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(&pose1.inverse());
    let p2 = projection_matrix(&pose2.inverse());

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    // Null vector of A: eigenvector of AᵀA with the smallest eigenvalue
    let eig = (a.transpose() * a).symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.total_cmp(y.1))?;
    let h = eig.eigenvectors.column(min_idx);

    if h[3].abs() < 1e-12 {
        return None;
    }
    let p = Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);
    p.iter().all(|v| v.is_finite()).then_some(p)
}

/// 3x4 projection matrix `[R | t]` of a world-to-camera transform.
pub fn projection_matrix(pose_cw: &SE3) -> Matrix3x4<f64> {
    pose_cw.to_matrix3x4()
}

/// Cosine of the angle between the two viewing rays of a world point.
pub fn parallax_cos(point: &Vector3<f64>, center1: &Vector3<f64>, center2: &Vector3<f64>) -> f64 {
    let r1 = point - center1;
    let r2 = point - center2;
    let denom = r1.norm() * r2.norm();
    if denom < 1e-12 {
        return 1.0;
    }
    r1.dot(&r2) / denom
}

/// Fundamental matrix mapping pixels of camera 1 to epipolar lines in
/// camera 2 (same intrinsics for both).
pub fn fundamental_matrix(pose1: &SE3, pose2: &SE3, camera: &CameraModel) -> Matrix3<f64> {
    // T_21 = T_2w ∘ T_w1
    let t21 = pose2.inverse().compose(pose1);
    let e = skew(&t21.translation) * t21.rotation_matrix();
    let k_inv = Matrix3::new(
        1.0 / camera.fx,
        0.0,
        -camera.cx / camera.fx,
        0.0,
        1.0 / camera.fy,
        -camera.cy / camera.fy,
        0.0,
        0.0,
        1.0,
    );
    k_inv.transpose() * e * k_inv
}

/// Squared pixel distance from `uv2` to the epipolar line of `uv1`.
pub fn epipolar_distance_sq(f: &Matrix3<f64>, uv1: &Vector2<f64>, uv2: &Vector2<f64>) -> f64 {
    let l2 = f * Vector3::new(uv1.x, uv1.y, 1.0);
    let num = l2.dot(&Vector3::new(uv2.x, uv2.y, 1.0));
    let den = l2.x * l2.x + l2.y * l2.y;
    if den < 1e-12 {
        return f64::INFINITY;
    }
    num * num / den
}

/// Check a triangulated point: positive depth in both views and a squared
/// reprojection error below `max_error_sq` in each.
pub fn validate_triangulation(
    point: &Vector3<f64>,
    pose1: &SE3,
    pose2: &SE3,
    uv1: &Vector2<f64>,
    uv2: &Vector2<f64>,
    camera: &CameraModel,
    max_error_sq: f64,
) -> bool {
    for (pose, uv) in [(pose1, uv1), (pose2, uv2)] {
        let p_cam = pose.inverse().transform_point(point);
        match camera.project(&p_cam) {
            Some(proj) if (proj - uv).norm_squared() <= max_error_sq => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }

    #[test]
    fn test_triangulate_dlt() {
        let pose1 = SE3::identity();
        let pose2 = SE3::from_params(&Vector3::new(0.0, -0.1, 0.0), &Vector3::new(1.0, 0.0, 0.0));
        let p_world = Vector3::new(0.3, -0.2, 5.0);

        let c1 = pose1.inverse().transform_point(&p_world);
        let c2 = pose2.inverse().transform_point(&p_world);
        let xn1 = c1 / c1.z;
        let xn2 = c2 / c2.z;

        let p = triangulate_dlt(&xn1, &xn2, &pose1, &pose2).unwrap();
        assert_relative_eq!(p, p_world, epsilon = 1e-8);
    }

    #[test]
    fn test_epipolar_distance_zero_for_true_match() {
        let cam = camera();
        let pose1 = SE3::identity();
        let pose2 = SE3::from_params(&Vector3::new(0.02, 0.05, 0.0), &Vector3::new(0.5, 0.1, 0.0));
        let f = fundamental_matrix(&pose1, &pose2, &cam);
        let p = Vector3::new(-0.4, 0.2, 4.0);
        let uv1 = cam.project(&pose1.inverse().transform_point(&p)).unwrap();
        let uv2 = cam.project(&pose2.inverse().transform_point(&p)).unwrap();
        assert!(epipolar_distance_sq(&f, &uv1, &uv2) < 1e-12);
        assert!(epipolar_distance_sq(&f, &uv1, &(uv2 + Vector2::new(0.0, 25.0))) > 1.0);
    }

    #[test]
    fn test_validate_rejects_behind_camera() {
        let cam = camera();
        let pose1 = SE3::identity();
        let pose2 = SE3::from_params(&Vector3::zeros(), &Vector3::new(1.0, 0.0, 0.0));
        let behind = Vector3::new(0.0, 0.0, -3.0);
        let uv = Vector2::new(320.0, 240.0);
        assert!(!validate_triangulation(&behind, &pose1, &pose2, &uv, &uv, &cam, 5.991));
    }

    #[test]
    fn test_parallax_cos() {
        let p = Vector3::new(0.0, 0.0, 1.0);
        let c = parallax_cos(&p, &Vector3::new(-1.0, 0.0, 0.0), &Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(c, 0.0, epsilon = 1e-12);
    }
}
