//! Pinhole camera with Brown-Conrady distortion.
//!
//! Keypoints are undistorted once at extraction time, after which the rest
//! of the pipeline works with the ideal pinhole projection
//! ([`CameraModel::project`]). The distorting projection
//! ([`CameraModel::project_distorted`]) is only needed to produce raw pixel
//! coordinates, e.g. when rendering synthetic frames.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fixed-point iterations used to invert the distortion model.
const UNDISTORT_ITERATIONS: usize = 20;

/// Minimum depth for a point to be considered in front of the camera.
pub const MIN_DEPTH: f64 = 1e-3;

/// Intrinsic and distortion parameters of a single camera.
///
/// Distortion follows the OpenCV ordering: radial `k1, k2, k3`,
/// tangential `p1, p2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub k3: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    /// Distortion-free pinhole camera.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
            width,
            height,
        }
    }

    /// Set distortion coefficients (builder style).
    pub fn with_distortion(mut self, k1: f64, k2: f64, k3: f64, p1: f64, p2: f64) -> Self {
        self.k1 = k1;
        self.k2 = k2;
        self.k3 = k3;
        self.p1 = p1;
        self.p2 = p2;
        self
    }

    /// Check that the calibration describes a usable camera.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let params = [
            self.fx, self.fy, self.cx, self.cy, self.k1, self.k2, self.k3, self.p1, self.p2,
        ];
        if params.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::Invalid("calibration contains non-finite values".into()));
        }
        if self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "focal lengths must be positive (fx={}, fy={})",
                self.fx, self.fy
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "image size must be non-zero ({}x{})",
                self.width, self.height
            )));
        }
        if self.cx < 0.0
            || self.cx > self.width as f64
            || self.cy < 0.0
            || self.cy > self.height as f64
        {
            return Err(ConfigError::Invalid(format!(
                "principal point ({}, {}) outside image",
                self.cx, self.cy
            )));
        }
        Ok(())
    }

    pub fn has_distortion(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.k3 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0
    }

    /// Intrinsic matrix K.
    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project a camera-frame point with the ideal pinhole model.
    ///
    /// Returns `None` for points behind (or too close to) the camera.
    #[inline]
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        Some(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Project a camera-frame point to raw (distorted) pixel coordinates.
    pub fn project_distorted(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let n = self.distort_normalized(&Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z));
        Some(Vector2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy))
    }

    /// Back-project an undistorted pixel to a ray with z = 1.
    #[inline]
    pub fn unproject(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
    }

    /// Apply the distortion model to normalized image coordinates.
    pub fn distort_normalized(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        Vector2::new(x * radial + dx, y * radial + dy)
    }

    /// Map a raw pixel to its undistorted pixel location.
    ///
    /// Inverts the distortion by fixed-point iteration on normalized
    /// coordinates.
    pub fn undistort_point(&self, raw: &Vector2<f64>) -> Vector2<f64> {
        if !self.has_distortion() {
            return *raw;
        }
        let xd = (raw.x - self.cx) / self.fx;
        let yd = (raw.y - self.cy) / self.fy;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            if radial.abs() < 1e-12 {
                break;
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Vector2::new(self.fx * x + self.cx, self.fy * y + self.cy)
    }

    /// Whether a pixel lies inside the image, shrunk by `margin` on each side.
    #[inline]
    pub fn is_in_image(&self, uv: &Vector2<f64>, margin: f64) -> bool {
        uv.x >= margin
            && uv.y >= margin
            && uv.x < self.width as f64 - margin
            && uv.y < self.height as f64 - margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn distorted_camera() -> CameraModel {
        CameraModel::pinhole(458.0, 457.0, 367.0, 248.0, 752, 480)
            .with_distortion(-0.28, 0.07, 0.0, 0.0002, 0.00002)
    }

    #[test]
    fn test_project_unproject() {
        let cam = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        let p = Vector3::new(0.2, -0.1, 2.0);
        let uv = cam.project(&p).unwrap();
        assert_relative_eq!(uv, Vector2::new(370.0, 215.0), epsilon = 1e-12);
        let ray = cam.unproject(&uv);
        assert_relative_eq!(ray * 2.0, p, epsilon = 1e-12);
    }

    #[test]
    fn test_behind_camera_not_projected() {
        let cam = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(cam.project_distorted(&Vector3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_undistort_inverts_distortion() {
        let cam = distorted_camera();
        for &(x, y, z) in &[(0.3, 0.2, 1.5), (-0.4, 0.1, 2.0), (0.05, -0.3, 1.0)] {
            let p = Vector3::new(x, y, z);
            let raw = cam.project_distorted(&p).unwrap();
            let ideal = cam.project(&p).unwrap();
            let undistorted = cam.undistort_point(&raw);
            assert_relative_eq!(undistorted, ideal, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cam = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480);
        assert!(cam.validate().is_ok());
        cam.fx = 0.0;
        assert!(cam.validate().is_err());
        let mut cam = CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 0, 480);
        assert!(cam.validate().is_err());
        cam.width = 640;
        cam.k1 = f64::NAN;
        assert!(cam.validate().is_err());
    }
}
