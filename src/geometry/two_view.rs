//! Two-view reconstruction for monocular map initialization.
//!
//! Estimates the essential matrix between two frames with the eight-point
//! algorithm inside a seeded RANSAC loop, decomposes it into the four
//! candidate motions, and keeps the one that places the most points in front
//! of both cameras with sufficient parallax. The reconstruction is scaled so
//! the median scene depth in the first camera is 1.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use tracing::debug;

use crate::geometry::triangulation::{parallax_cos, triangulate_dlt, validate_triangulation};
use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

const MIN_MATCHES: usize = 8;

/// RANSAC stops once an all-inlier sample has been drawn with this
/// probability, after at least `MIN_RANSAC_ITERATIONS` rounds.
const RANSAC_CONFIDENCE: f64 = 0.99;
const MIN_RANSAC_ITERATIONS: usize = 50;

/// Points seen with less parallax than this (~0.36°) are not triangulated.
const MAX_POINT_PARALLAX_COS: f64 = 0.99998;

/// Tunables for [`reconstruct_two_view`].
#[derive(Debug, Clone)]
pub struct TwoViewConfig {
    /// Upper bound on RANSAC rounds; fewer are run when the inlier ratio
    /// is high.
    pub ransac_iterations: usize,
    /// Inlier threshold on the Sampson error (px).
    pub inlier_threshold: f64,
    /// Median parallax required over triangulated points (degrees).
    pub min_parallax_deg: f64,
    /// Minimum number of triangulated points for a valid reconstruction.
    pub min_triangulated: usize,
    pub seed: u64,
}

impl Default for TwoViewConfig {
    fn default() -> Self {
        Self {
            ransac_iterations: 500,
            inlier_threshold: 2.0,
            min_parallax_deg: 1.0,
            min_triangulated: 50,
            seed: 0x5EED,
        }
    }
}

/// Result of a successful two-view reconstruction.
///
/// The first camera defines the world frame (identity pose).
#[derive(Debug, Clone)]
pub struct TwoViewResult {
    /// Pose of the second camera (T_wc).
    pub pose2: SE3,
    /// Triangulated world point per input match (`None` if rejected).
    pub points: Vec<Option<Vector3<f64>>>,
    pub num_triangulated: usize,
    pub median_parallax_deg: f64,
}

/// Reconstruct relative motion and structure from pixel matches.
///
/// `uv1[i]` and `uv2[i]` are undistorted pixel observations of the same
/// point in frame 1 and frame 2. Returns `None` when the motion is
/// ambiguous or the parallax is too small.
pub fn reconstruct_two_view(
    uv1: &[Vector2<f64>],
    uv2: &[Vector2<f64>],
    camera: &CameraModel,
    config: &TwoViewConfig,
) -> Option<TwoViewResult> {
    let n = uv1.len().min(uv2.len());
    if n < MIN_MATCHES.max(config.min_triangulated) {
        return None;
    }

    let x1: Vec<Vector3<f64>> = uv1.iter().map(|p| camera.unproject(p)).collect();
    let x2: Vec<Vector3<f64>> = uv2.iter().map(|p| camera.unproject(p)).collect();
    let pixel_scale = camera.fx * camera.fy;
    let th_sq = config.inlier_threshold * config.inlier_threshold;

    let inlier_mask = |e: &Matrix3<f64>| -> Vec<bool> {
        (0..n)
            .map(|i| sampson_sq(e, &x1[i], &x2[i]) * pixel_scale < th_sq)
            .collect()
    };

    // Step 1: RANSAC on the essential matrix
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Matrix3<f64>, usize)> = None;
    let mut budget = config.ransac_iterations;
    let mut round = 0;
    while round < budget {
        round += 1;
        let subset = sample(&mut rng, n, MIN_MATCHES).into_vec();
        let Some(e) = eight_point(&x1, &x2, &subset) else {
            continue;
        };
        let score = inlier_mask(&e).iter().filter(|&&f| f).count();
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((e, score));
            budget = ransac_rounds(score as f64 / n as f64, config.ransac_iterations);
        }
    }
    let (e, _) = best?;
    let mut inliers = inlier_mask(&e);
    let consensus: Vec<usize> = (0..n).filter(|&i| inliers[i]).collect();
    let e = match eight_point(&x1, &x2, &consensus) {
        Some(refit) => {
            inliers = inlier_mask(&refit);
            refit
        }
        None => e,
    };

    // Step 2: pick the motion hypothesis with the most valid points
    let pose1 = SE3::identity();
    let mut hypotheses: Vec<(SE3, Vec<Option<Vector3<f64>>>, usize, f64)> = Vec::new();
    for (rotation, translation) in decompose_essential(&e) {
        let pose2 = SE3::from_rt(&rotation, &translation).inverse();
        let c2 = pose2.translation;
        let mut points = vec![None; n];
        let mut parallaxes = Vec::new();
        for i in (0..n).filter(|&i| inliers[i]) {
            let Some(p) = triangulate_dlt(&x1[i], &x2[i], &pose1, &pose2) else {
                continue;
            };
            if !validate_triangulation(&p, &pose1, &pose2, &uv1[i], &uv2[i], camera, 4.0 * th_sq)
            {
                continue;
            }
            // Points with near-zero parallax fit every hypothesis equally
            // and would hide an ambiguous motion.
            let cos = parallax_cos(&p, &Vector3::zeros(), &c2);
            if cos < MAX_POINT_PARALLAX_COS {
                parallaxes.push(cos.clamp(-1.0, 1.0).acos().to_degrees());
                points[i] = Some(p);
            }
        }
        let good = parallaxes.len();
        parallaxes.sort_by(|a, b| a.total_cmp(b));
        let median = parallaxes.get(good / 2).copied().unwrap_or(0.0);
        hypotheses.push((pose2, points, good, median));
    }
    hypotheses.sort_by(|a, b| b.2.cmp(&a.2));

    let second_good = hypotheses.get(1).map_or(0, |h| h.2);
    let (pose2, mut points, good, median_parallax_deg) = hypotheses.into_iter().next()?;
    if good * 7 < second_good * 10 {
        debug!("[TwoView] Ambiguous motion ({} vs {} valid points)", good, second_good);
        return None;
    }
    if good < config.min_triangulated || median_parallax_deg < config.min_parallax_deg {
        debug!(
            "[TwoView] Rejected: {} valid points, median parallax {:.2}°",
            good, median_parallax_deg
        );
        return None;
    }

    // Step 3: fix the scale so the median depth is 1
    let mut depths: Vec<f64> = points.iter().flatten().map(|p| p.z).collect();
    if depths.is_empty() {
        return None;
    }
    depths.sort_by(|a, b| a.total_cmp(b));
    let median_depth = depths[depths.len() / 2];
    if median_depth <= 0.0 {
        return None;
    }
    let scale = 1.0 / median_depth;
    for p in points.iter_mut().flatten() {
        *p *= scale;
    }
    let pose2 = SE3::from_quaternion(pose2.rotation, pose2.translation * scale);
    let num_triangulated = points.iter().flatten().count();

    debug!(
        "[TwoView] Reconstructed {} points, median parallax {:.2}°",
        num_triangulated, median_parallax_deg
    );

    Some(TwoViewResult {
        pose2,
        points,
        num_triangulated,
        median_parallax_deg,
    })
}

/// Rounds needed to draw one all-inlier sample at `inlier_ratio`, within
/// `[MIN_RANSAC_ITERATIONS, cap]`.
fn ransac_rounds(inlier_ratio: f64, cap: usize) -> usize {
    let all_inliers = inlier_ratio.clamp(0.0, 1.0).powi(MIN_MATCHES as i32);
    let needed = if all_inliers >= 1.0 {
        0.0
    } else if all_inliers <= f64::EPSILON {
        cap as f64
    } else {
        (1.0 - RANSAC_CONFIDENCE).ln() / (1.0 - all_inliers).ln()
    };
    (needed.ceil() as usize).clamp(MIN_RANSAC_ITERATIONS.min(cap), cap)
}

/// Squared Sampson distance of a normalized correspondence (normalized
/// image units).
fn sampson_sq(e: &Matrix3<f64>, x1: &Vector3<f64>, x2: &Vector3<f64>) -> f64 {
    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let num = x2.dot(&ex1);
    let den = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if den < 1e-18 {
        return f64::INFINITY;
    }
    num * num / den
}

/// Linear eight-point estimate projected onto the essential manifold.
fn eight_point(x1: &[Vector3<f64>], x2: &[Vector3<f64>], indices: &[usize]) -> Option<Matrix3<f64>> {
    if indices.len() < MIN_MATCHES {
        return None;
    }
    let mut ata = DMatrix::<f64>::zeros(9, 9);
    for &k in indices {
        let (a, b) = (&x1[k], &x2[k]);
        let row = nalgebra::DVector::from_vec(vec![
            b.x * a.x,
            b.x * a.y,
            b.x * a.z,
            b.y * a.x,
            b.y * a.y,
            b.y * a.z,
            b.z * a.x,
            b.z * a.y,
            b.z * a.z,
        ]);
        ata += &row * row.transpose();
    }
    let eig = ata.symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h: Vec<f64> = eig.eigenvectors.column(min_idx).iter().copied().collect();
    let e = Matrix3::from_row_slice(&h);

    let svd = e.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut order: Vec<usize> = (0..3).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    let mut sigma = Matrix3::zeros();
    sigma[(order[0], order[0])] = 1.0;
    sigma[(order[1], order[1])] = 1.0;
    Some(u * sigma * v_t)
}

/// The four (R, t) factorizations of an essential matrix, with
/// `X2 = R X1 + t` and unit-norm `t`.
fn decompose_essential(e: &Matrix3<f64>) -> Vec<(Matrix3<f64>, Vector3<f64>)> {
    let svd = e.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Vec::new();
    };
    let mut v = v_t.transpose();

    // Null direction of Eᵀ is the translation
    let min_idx = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(2);
    if min_idx != 2 {
        u.swap_columns(min_idx, 2);
        v.swap_columns(min_idx, 2);
    }
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v.determinant() < 0.0 {
        v = -v;
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v.transpose();
    let r2 = u * w.transpose() * v.transpose();
    let t: Vector3<f64> = u.column(2).into_owned().normalize();

    vec![(r1, t), (r1, -t), (r2, t), (r2, -t)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn camera() -> CameraModel {
        CameraModel::pinhole(450.0, 450.0, 320.0, 240.0, 640, 480)
    }

    fn synthetic_pair(pose2: &SE3, count: usize) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>, Vec<Vector3<f64>>) {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(11);
        let (mut a, mut b, mut pts) = (Vec::new(), Vec::new(), Vec::new());
        while a.len() < count {
            let p = Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(3.0..7.0),
            );
            let (Some(u1), Some(u2)) = (
                cam.project(&p),
                cam.project(&pose2.inverse().transform_point(&p)),
            ) else {
                continue;
            };
            if cam.is_in_image(&u1, 0.0) && cam.is_in_image(&u2, 0.0) {
                a.push(u1);
                b.push(u2);
                pts.push(p);
            }
        }
        (a, b, pts)
    }

    #[test]
    fn test_recovers_motion_up_to_scale() {
        let truth = SE3::from_params(&Vector3::new(0.0, 0.08, 0.0), &Vector3::new(0.5, 0.0, 0.05));
        let (uv1, uv2, pts) = synthetic_pair(&truth, 150);
        let res = reconstruct_two_view(&uv1, &uv2, &camera(), &TwoViewConfig::default()).unwrap();

        assert!(res.pose2.angle_to(&truth) < 1e-3);
        let dir_est = res.pose2.translation.normalize();
        let dir_true = truth.translation.normalize();
        assert!(dir_est.dot(&dir_true) > 0.999);

        // Structure matches up to the same scale factor
        let scale = truth.translation.norm() / res.pose2.translation.norm();
        let (i, p) = res
            .points
            .iter()
            .enumerate()
            .find_map(|(i, p)| p.map(|p| (i, p)))
            .unwrap();
        assert_relative_eq!(p * scale, pts[i], epsilon = 1e-3);
    }

    #[test]
    fn test_ransac_rounds_follow_inlier_ratio() {
        assert_eq!(ransac_rounds(1.0, 500), MIN_RANSAC_ITERATIONS);
        assert_eq!(ransac_rounds(0.0, 500), 500);
        let half = ransac_rounds(0.5, 5000);
        assert!(half > 1000 && half < 1300);
        assert_eq!(ransac_rounds(0.5, 500), 500);
        assert_eq!(ransac_rounds(0.9, 10), 10);
    }

    #[test]
    fn test_recovers_motion_with_outliers() {
        let truth = SE3::from_params(&Vector3::new(0.0, -0.06, 0.0), &Vector3::new(-0.4, 0.02, 0.0));
        let (uv1, mut uv2, _) = synthetic_pair(&truth, 200);
        let mut rng = StdRng::seed_from_u64(3);
        for p in uv2.iter_mut().step_by(5) {
            *p = Vector2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0));
        }
        let res = reconstruct_two_view(&uv1, &uv2, &camera(), &TwoViewConfig::default()).unwrap();
        assert!(res.pose2.angle_to(&truth) < 1e-3);
        assert!(res.pose2.translation.normalize().dot(&truth.translation.normalize()) > 0.999);
        assert!(res.num_triangulated > 140);
        let kept_outliers = res.points.iter().step_by(5).filter(|p| p.is_some()).count();
        assert!(kept_outliers <= 2);
    }

    #[test]
    fn test_rejects_pure_rotation() {
        let rot_only = SE3::from_params(&Vector3::new(0.0, 0.05, 0.0), &Vector3::zeros());
        let (uv1, uv2, _) = synthetic_pair(&rot_only, 150);
        assert!(reconstruct_two_view(&uv1, &uv2, &camera(), &TwoViewConfig::default()).is_none());
    }
}
