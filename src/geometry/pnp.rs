//! Perspective-n-Point pose estimation.
//!
//! Given 3D world points and their undistorted pixel observations, estimates
//! the camera pose (T_wc):
//! 1. Initial guess: the caller's prior when available; otherwise a
//!    normalized DLT wrapped in a seeded RANSAC loop (six points or more),
//!    or P3P over every point triple (four or five points). Either way the
//!    result is reproducible for identical inputs.
//! 2. Refinement: Levenberg-Marquardt over a 6-DoF axis-angle/translation
//!    parameterization with Huber-weighted residuals, alternated with
//!    outlier rejection rounds that re-classify every correspondence.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{
    DMatrix, DVector, Dyn, Matrix2x3, Matrix3, Matrix3x4, Matrix4, OMatrix, Owned, U6, Vector2,
    Vector3, Vector4, Vector6,
};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use thiserror::Error;

use crate::geometry::so3::{right_jacobian_so3, skew};
use crate::geometry::SE3;
use crate::tracking::frame::camera::MIN_DEPTH;
use crate::tracking::frame::CameraModel;

/// Minimum number of correspondences accepted by the estimator.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Minimum sample size for the linear (DLT) solution.
const DLT_SAMPLE_SIZE: usize = 6;

/// RANSAC iterations for the DLT initialization.
const RANSAC_ITERATIONS: usize = 96;

/// Outlier rejection rounds during refinement.
const REFINEMENT_ROUNDS: usize = 4;

/// Samples of the first depth scanned for P3P roots.
const P3P_SCAN_STEPS: usize = 2000;

/// Errors from pose estimation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoseError {
    #[error("need at least {required} correspondences, got {actual}")]
    InsufficientCorrespondences { required: usize, actual: usize },

    #[error("point and observation counts differ ({points} vs {observations})")]
    MismatchedInput { points: usize, observations: usize },

    #[error("pose did not converge ({inliers} inliers, mean error {mean_error:.2}px)")]
    NotConverged { inliers: usize, mean_error: f64 },
}

/// Tunables for [`estimate_pose`].
#[derive(Debug, Clone)]
pub struct PoseEstimatorConfig {
    /// Correspondences with a larger reprojection error are outliers (px).
    pub max_reprojection_error: f64,
    /// Iteration budget handed to each LM refinement round.
    pub max_iterations: usize,
    /// Minimum inlier count for a converged estimate.
    pub min_inliers: usize,
    /// Seed for the RANSAC initialization.
    pub seed: u64,
}

impl Default for PoseEstimatorConfig {
    fn default() -> Self {
        Self {
            max_reprojection_error: 4.0,
            max_iterations: 20,
            min_inliers: MIN_CORRESPONDENCES,
            seed: 0x5EED,
        }
    }
}

/// Outcome of a successful estimation.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    /// Camera pose (T_wc).
    pub pose: SE3,
    /// Inlier flag per input correspondence.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    /// Mean reprojection error over inliers (px).
    pub mean_error: f64,
    /// Confidence in [0, 1] from inlier ratio and mean residual.
    pub confidence: f64,
    /// Residual evaluations spent in refinement.
    pub iterations: usize,
}

/// Estimate the camera pose from 2D–3D correspondences.
///
/// # Arguments
/// * `points3d` - World points
/// * `points2d` - Undistorted pixel observations, same order as `points3d`
/// * `camera` - Intrinsics used for projection
/// * `prior` - Optional warm start (T_wc)
/// * `config` - Thresholds and iteration budget
pub fn estimate_pose(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    prior: Option<&SE3>,
    config: &PoseEstimatorConfig,
) -> Result<PoseEstimate, PoseError> {
    if points3d.len() != points2d.len() {
        return Err(PoseError::MismatchedInput {
            points: points3d.len(),
            observations: points2d.len(),
        });
    }
    let n = points3d.len();
    if n < MIN_CORRESPONDENCES {
        return Err(PoseError::InsufficientCorrespondences {
            required: MIN_CORRESPONDENCES,
            actual: n,
        });
    }

    let threshold = config.max_reprojection_error;

    // Step 1: initial guess (T_cw)
    let mut pose_cw = match prior {
        Some(p) => p.inverse(),
        None => initial_pose_ransac(points3d, points2d, camera, threshold, config.seed).ok_or(
            PoseError::NotConverged {
                inliers: 0,
                mean_error: f64::INFINITY,
            },
        )?,
    };

    // Step 2: alternate LM refinement with outlier classification.
    // A linear initialization already separates the consensus set; a prior
    // may be off by more than the threshold, so it starts from all points.
    let mut inliers = vec![true; n];
    if prior.is_none() {
        let consensus: Vec<bool> = (0..n)
            .map(|i| {
                reprojection_error(camera, &pose_cw, &points3d[i], &points2d[i])
                    .map_or(false, |e| e < threshold)
            })
            .collect();
        if consensus.iter().filter(|&&f| f).count() >= MIN_CORRESPONDENCES {
            inliers = consensus;
        }
    }
    let mut iterations = 0;
    for round in 0..REFINEMENT_ROUNDS {
        let active: Vec<usize> = (0..n).filter(|&i| inliers[i]).collect();
        if active.len() < MIN_CORRESPONDENCES {
            break;
        }

        let (omega, t) = pose_cw.to_params();
        let problem = PoseProblem {
            params: Vector6::new(omega.x, omega.y, omega.z, t.x, t.y, t.z),
            points3d,
            points2d,
            camera,
            active: &active,
            huber_threshold: threshold,
        };
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(config.max_iterations.max(1))
            .minimize(problem);
        iterations += report.number_of_evaluations;

        if matches!(
            report.termination,
            TerminationReason::Numerical(_) | TerminationReason::WrongDimensions(_)
        ) {
            break;
        }
        pose_cw = problem.pose_cw();

        // Re-classify every correspondence, including earlier outliers
        let mut changed = false;
        for i in 0..n {
            let is_inlier = reprojection_error(camera, &pose_cw, &points3d[i], &points2d[i])
                .map_or(false, |e| e < threshold);
            changed |= is_inlier != inliers[i];
            inliers[i] = is_inlier;
        }
        if !changed && round > 0 {
            break;
        }
    }

    let errors: Vec<f64> = (0..n)
        .filter(|&i| inliers[i])
        .filter_map(|i| reprojection_error(camera, &pose_cw, &points3d[i], &points2d[i]))
        .collect();
    let num_inliers = errors.len();
    let mean_error = if num_inliers > 0 {
        errors.iter().sum::<f64>() / num_inliers as f64
    } else {
        f64::INFINITY
    };

    let min_inliers = config.min_inliers.max(MIN_CORRESPONDENCES);
    if num_inliers < min_inliers || !mean_error.is_finite() || mean_error > threshold {
        return Err(PoseError::NotConverged {
            inliers: num_inliers,
            mean_error,
        });
    }

    let inlier_ratio = num_inliers as f64 / n as f64;
    let confidence =
        (0.5 * inlier_ratio + 0.5 * (1.0 - mean_error / threshold)).clamp(0.0, 1.0);

    Ok(PoseEstimate {
        pose: pose_cw.inverse(),
        inliers,
        num_inliers,
        mean_error,
        confidence,
        iterations,
    })
}

/// Pixel distance between an observation and the projection of a world
/// point under `pose_cw`; `None` when the point is behind the camera.
pub fn reprojection_error(
    camera: &CameraModel,
    pose_cw: &SE3,
    point: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> Option<f64> {
    let p_cam = pose_cw.transform_point(point);
    camera.project(&p_cam).map(|uv| (uv - observed).norm())
}

// ─────────────────────────────────────────────────────────────────────────────
// Linear initialization
// ─────────────────────────────────────────────────────────────────────────────

/// Seeded RANSAC over DLT solutions; returns T_cw.
fn initial_pose_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    threshold: f64,
    seed: u64,
) -> Option<SE3> {
    let n = points3d.len();
    if n < DLT_SAMPLE_SIZE {
        return minimal_pose(points3d, points2d, camera, threshold);
    }
    let bearings: Vec<Vector2<f64>> = points2d
        .iter()
        .map(|uv| camera.unproject(uv).xy())
        .collect();

    let count_inliers = |pose_cw: &SE3| -> usize {
        (0..n)
            .filter(|&i| {
                reprojection_error(camera, pose_cw, &points3d[i], &points2d[i])
                    .map_or(false, |e| e < threshold)
            })
            .count()
    };

    // All-points solution first: clean inputs need no sampling
    let mut best: Option<(SE3, usize)> = None;
    if let Some(pose) = dlt_pose(points3d, &bearings, &(0..n).collect::<Vec<_>>()) {
        let score = count_inliers(&pose);
        if score * 10 >= n * 9 {
            return Some(pose);
        }
        best = Some((pose, score));
    }

    let mut rng = StdRng::seed_from_u64(seed ^ n as u64);
    for _ in 0..RANSAC_ITERATIONS {
        let subset = sample(&mut rng, n, DLT_SAMPLE_SIZE).into_vec();
        let Some(pose) = dlt_pose(points3d, &bearings, &subset) else {
            continue;
        };
        let score = count_inliers(&pose);
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((pose, score));
        }
    }

    // Re-fit on the consensus set
    let (pose, score) = best?;
    let consensus: Vec<usize> = (0..n)
        .filter(|&i| {
            reprojection_error(camera, &pose, &points3d[i], &points2d[i])
                .map_or(false, |e| e < threshold)
        })
        .collect();
    if consensus.len() >= DLT_SAMPLE_SIZE {
        if let Some(refit) = dlt_pose(points3d, &bearings, &consensus) {
            if count_inliers(&refit) >= score {
                return Some(refit);
            }
        }
    }
    Some(pose)
}

/// Direct linear transform on normalized image coordinates; returns T_cw.
///
/// World points are centered and scaled before solving, and the rotation is
/// projected back onto SO(3).
fn dlt_pose(
    points3d: &[Vector3<f64>],
    bearings: &[Vector2<f64>],
    indices: &[usize],
) -> Option<SE3> {
    if indices.len() < DLT_SAMPLE_SIZE {
        return None;
    }

    let centroid = indices
        .iter()
        .fold(Vector3::zeros(), |acc, &i| acc + points3d[i])
        / indices.len() as f64;
    let mean_dist = indices
        .iter()
        .map(|&i| (points3d[i] - centroid).norm())
        .sum::<f64>()
        / indices.len() as f64;
    if mean_dist < 1e-9 {
        return None;
    }
    let scale = 3f64.sqrt() / mean_dist;
    let mut normalize = Matrix4::identity() * scale;
    normalize[(3, 3)] = 1.0;
    normalize
        .fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&(-centroid * scale));

    let mut ata = DMatrix::<f64>::zeros(12, 12);
    for &i in indices {
        let p = (points3d[i] - centroid) * scale;
        let xw = Vector4::new(p.x, p.y, p.z, 1.0);
        let (u, v) = (bearings[i].x, bearings[i].y);
        let mut row_u = DVector::<f64>::zeros(12);
        let mut row_v = DVector::<f64>::zeros(12);
        for k in 0..4 {
            row_u[k] = xw[k];
            row_u[8 + k] = -u * xw[k];
            row_v[4 + k] = xw[k];
            row_v[8 + k] = -v * xw[k];
        }
        ata += &row_u * row_u.transpose();
        ata += &row_v * row_v.transpose();
    }

    let eig = ata.symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h: Vec<f64> = eig.eigenvectors.column(min_idx).iter().copied().collect();
    let mut p = Matrix3x4::from_row_slice(&h) * normalize;

    // Points must lie in front of the camera
    let positive = indices
        .iter()
        .filter(|&&i| {
            let x = points3d[i];
            (p.row(2) * Vector4::new(x.x, x.y, x.z, 1.0))[0] > 0.0
        })
        .count();
    if positive * 2 < indices.len() {
        p = -p;
    }

    let m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
    let svd = m.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut rotation = u * v_t;
    let mut s = svd.singular_values.mean();
    if rotation.determinant() < 0.0 {
        rotation = -rotation;
        s = -s;
    }
    if s.abs() < 1e-12 {
        return None;
    }
    let translation: Vector3<f64> = p.fixed_view::<3, 1>(0, 3).into_owned() / s;
    let pose = SE3::from_rt(&rotation, &translation);
    if pose.translation.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(pose)
}

// ─────────────────────────────────────────────────────────────────────────────
// Minimal solver
// ─────────────────────────────────────────────────────────────────────────────

/// Best P3P solution over every triple of a small correspondence set, scored
/// by inlier count and then by summed inlier error; returns T_cw.
fn minimal_pose(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    threshold: f64,
) -> Option<SE3> {
    let n = points3d.len();
    let bearings: Vec<Vector3<f64>> = points2d
        .iter()
        .map(|uv| camera.unproject(uv).normalize())
        .collect();

    let mut best: Option<(SE3, usize, f64)> = None;
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                let world = [points3d[i], points3d[j], points3d[k]];
                let rays = [bearings[i], bearings[j], bearings[k]];
                for pose in p3p(&world, &rays) {
                    let errors: Vec<f64> = (0..n)
                        .filter_map(|m| reprojection_error(camera, &pose, &points3d[m], &points2d[m]))
                        .filter(|&e| e < threshold)
                        .collect();
                    let score = errors.len();
                    let total: f64 = errors.iter().sum();
                    let better = best.as_ref().map_or(true, |&(_, s, t)| {
                        score > s || (score == s && total < t)
                    });
                    if better {
                        best = Some((pose, score, total));
                    }
                }
            }
        }
    }
    best.map(|(pose, _, _)| pose)
}

/// Poses (T_cw) placing three world points on three unit bearings.
///
/// The depths follow from the law of cosines: for a first depth `s1` each
/// of the other two has two closed-form branches, and the remaining side
/// leaves a scalar residual. Its sign changes over a dense scan of `s1` are
/// refined by bisection, and each root is turned into a pose by aligning
/// the two point triples.
fn p3p(world: &[Vector3<f64>; 3], rays: &[Vector3<f64>; 3]) -> Vec<SE3> {
    let d12 = (world[0] - world[1]).norm();
    let d13 = (world[0] - world[2]).norm();
    let d23 = (world[1] - world[2]).norm();
    let c12 = rays[0].dot(&rays[1]);
    let c13 = rays[0].dot(&rays[2]);
    let c23 = rays[1].dot(&rays[2]);
    let sin12 = (1.0 - c12 * c12).max(0.0).sqrt();
    let sin13 = (1.0 - c13 * c13).max(0.0).sqrt();
    if sin12 < 1e-9 || sin13 < 1e-9 || d12 < 1e-9 || d13 < 1e-9 || d23 < 1e-9 {
        return Vec::new();
    }
    let s1_max = (d12 / sin12).min(d13 / sin13);

    // Other depth from s1 and a chord, on one branch; None when not positive.
    let other = |s1: f64, c: f64, d: f64, sign: f64| -> Option<f64> {
        let s = s1 * c + sign * (d * d - s1 * s1 * (1.0 - c * c)).max(0.0).sqrt();
        (s > 0.0).then_some(s)
    };
    let depths = |s1: f64, b2: f64, b3: f64| -> Option<(f64, f64, f64)> {
        let s2 = other(s1, c12, d12, b2)?;
        let s3 = other(s1, c13, d13, b3)?;
        Some((s2, s3, s2 * s2 + s3 * s3 - 2.0 * s2 * s3 * c23 - d23 * d23))
    };

    let mut poses = Vec::new();
    for (b2, b3) in [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)] {
        let residual = |s1: f64| depths(s1, b2, b3).map(|(_, _, f)| f);
        let mut prev: Option<(f64, f64)> = None;
        for step in 1..=P3P_SCAN_STEPS {
            let s1 = s1_max * step as f64 / P3P_SCAN_STEPS as f64;
            let Some(f) = residual(s1) else {
                prev = None;
                continue;
            };
            let root = match prev {
                _ if f == 0.0 => Some(s1),
                Some((a, fa)) if fa * f < 0.0 => bisect(&residual, a, fa, s1),
                _ => None,
            };
            prev = Some((s1, f));

            let Some(s1) = root else { continue };
            let Some((s2, s3, _)) = depths(s1, b2, b3) else {
                continue;
            };
            let camera_points = [rays[0] * s1, rays[1] * s2, rays[2] * s3];
            if let Some(pose) = align_triples(world, &camera_points) {
                poses.push(pose);
            }
        }
    }
    poses
}

fn bisect(f: &dyn Fn(f64) -> Option<f64>, mut a: f64, mut fa: f64, mut b: f64) -> Option<f64> {
    for _ in 0..80 {
        let m = 0.5 * (a + b);
        let fm = f(m)?;
        if fm == 0.0 {
            return Some(m);
        }
        if fa * fm < 0.0 {
            b = m;
        } else {
            a = m;
            fa = fm;
        }
    }
    Some(0.5 * (a + b))
}

/// Rigid transform (T_cw) taking `world` onto `camera`, by SVD of the
/// cross-covariance.
fn align_triples(world: &[Vector3<f64>; 3], camera: &[Vector3<f64>; 3]) -> Option<SE3> {
    let cw = (world[0] + world[1] + world[2]) / 3.0;
    let cc = (camera[0] + camera[1] + camera[2]) / 3.0;
    let mut h = Matrix3::zeros();
    for (w, c) in world.iter().zip(camera) {
        h += (w - cw) * (c - cc).transpose();
    }
    let svd = h.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut v = v_t.transpose();
    if (v * u.transpose()).determinant() < 0.0 {
        let (weakest, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))?;
        v.column_mut(weakest).neg_mut();
    }
    let rotation = v * u.transpose();
    let translation = cc - rotation * cw;
    let pose = SE3::from_rt(&rotation, &translation);
    pose.translation.iter().all(|x| x.is_finite()).then_some(pose)
}

// ─────────────────────────────────────────────────────────────────────────────
// Nonlinear refinement
// ─────────────────────────────────────────────────────────────────────────────

/// Reprojection problem over a single pose, parameterized as T_cw with
/// axis-angle rotation `[ω, t]`.
struct PoseProblem<'a> {
    params: Vector6<f64>,
    points3d: &'a [Vector3<f64>],
    points2d: &'a [Vector2<f64>],
    camera: &'a CameraModel,
    active: &'a [usize],
    huber_threshold: f64,
}

impl PoseProblem<'_> {
    fn pose_cw(&self) -> SE3 {
        SE3::from_params(
            &self.params.fixed_rows::<3>(0).into_owned(),
            &self.params.fixed_rows::<3>(3).into_owned(),
        )
    }

    fn huber_sqrt_weight(&self, error: f64) -> f64 {
        if error <= self.huber_threshold {
            1.0
        } else {
            (self.huber_threshold / error).sqrt()
        }
    }
}

impl LeastSquaresProblem<f64, Dyn, U6> for PoseProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.params = *x;
    }

    fn params(&self) -> Vector6<f64> {
        self.params
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let pose_cw = self.pose_cw();
        let mut r = DVector::zeros(self.active.len() * 2);
        for (row, &i) in self.active.iter().enumerate() {
            let p_cam = pose_cw.transform_point(&self.points3d[i]);
            let z = p_cam.z.max(MIN_DEPTH);
            let uv = Vector2::new(
                self.camera.fx * p_cam.x / z + self.camera.cx,
                self.camera.fy * p_cam.y / z + self.camera.cy,
            );
            let e = uv - self.points2d[i];
            let w = self.huber_sqrt_weight(e.norm());
            r[2 * row] = w * e.x;
            r[2 * row + 1] = w * e.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U6>> {
        let pose_cw = self.pose_cw();
        let rot = pose_cw.rotation_matrix();
        let omega: Vector3<f64> = self.params.fixed_rows::<3>(0).into_owned();
        let jr = right_jacobian_so3(&omega);

        let mut jac = OMatrix::<f64, Dyn, U6>::zeros(self.active.len() * 2);
        for (row, &i) in self.active.iter().enumerate() {
            let pw = self.points3d[i];
            let p_cam = pose_cw.transform_point(&pw);
            let z = p_cam.z.max(MIN_DEPTH);
            let inv_z = 1.0 / z;
            let inv_z2 = inv_z * inv_z;

            let d_proj = Matrix2x3::new(
                self.camera.fx * inv_z,
                0.0,
                -self.camera.fx * p_cam.x * inv_z2,
                0.0,
                self.camera.fy * inv_z,
                -self.camera.fy * p_cam.y * inv_z2,
            );
            // d(R p + t)/dω = -R [p]x Jr(ω),  d(R p + t)/dt = I
            let d_rot = d_proj * (-rot * skew(&pw) * jr);

            let uv = Vector2::new(
                self.camera.fx * p_cam.x * inv_z + self.camera.cx,
                self.camera.fy * p_cam.y * inv_z + self.camera.cy,
            );
            let w = self.huber_sqrt_weight((uv - self.points2d[i]).norm());

            for r in 0..2 {
                for c in 0..3 {
                    jac[(2 * row + r, c)] = w * d_rot[(r, c)];
                    jac[(2 * row + r, 3 + c)] = w * d_proj[(r, c)];
                }
            }
        }
        Some(jac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn camera() -> CameraModel {
        CameraModel::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    /// Points scattered in front of a camera at `pose_wc`.
    fn scene(pose_wc: &SE3, count: usize, seed: u64) -> (Vec<Vector3<f64>>, Vec<Vector2<f64>>) {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut pts3d = Vec::new();
        let mut pts2d = Vec::new();
        while pts3d.len() < count {
            let p_cam = Vector3::new(
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(2.0..6.0),
            );
            if let Some(uv) = cam.project(&p_cam) {
                pts3d.push(pose_wc.transform_point(&p_cam));
                pts2d.push(uv);
            }
        }
        (pts3d, pts2d)
    }

    fn true_pose() -> SE3 {
        SE3::from_params(&Vector3::new(0.05, -0.2, 0.1), &Vector3::new(0.5, -0.3, 1.0))
    }

    #[test]
    fn test_recovers_pose_without_prior() {
        let pose = true_pose();
        let (p3, p2) = scene(&pose, 60, 1);
        let est = estimate_pose(&p3, &p2, &camera(), None, &PoseEstimatorConfig::default())
            .unwrap();
        assert_eq!(est.num_inliers, 60);
        assert_relative_eq!(est.pose.translation, pose.translation, epsilon = 1e-4);
        assert!(est.pose.angle_to(&pose) < 1e-5);
        assert!(est.confidence > 0.95);
    }

    #[test]
    fn test_refines_from_prior() {
        let pose = true_pose();
        let (p3, p2) = scene(&pose, 40, 2);
        let prior = pose.compose(&SE3::from_params(
            &Vector3::new(0.02, 0.01, -0.02),
            &Vector3::new(0.05, -0.03, 0.04),
        ));
        let est =
            estimate_pose(&p3, &p2, &camera(), Some(&prior), &PoseEstimatorConfig::default())
                .unwrap();
        assert_relative_eq!(est.pose.translation, pose.translation, epsilon = 1e-4);
    }

    #[test]
    fn test_rejects_outliers() {
        let pose = true_pose();
        let (p3, mut p2) = scene(&pose, 80, 3);
        for uv in p2.iter_mut().take(16) {
            uv.x += 60.0;
            uv.y -= 45.0;
        }
        let est = estimate_pose(&p3, &p2, &camera(), None, &PoseEstimatorConfig::default())
            .unwrap();
        assert!(est.inliers[..16].iter().all(|&f| !f));
        assert!(est.inliers[16..].iter().all(|&f| f));
        assert!(est.pose.distance_to(&pose) < 1e-3);
        assert!(est.confidence < 0.95);
    }

    #[test]
    fn test_deterministic() {
        let pose = true_pose();
        let (p3, mut p2) = scene(&pose, 50, 4);
        for uv in p2.iter_mut().step_by(5) {
            uv.x += 30.0;
        }
        let cfg = PoseEstimatorConfig::default();
        let a = estimate_pose(&p3, &p2, &camera(), None, &cfg).unwrap();
        let b = estimate_pose(&p3, &p2, &camera(), None, &cfg).unwrap();
        assert_eq!(a.pose, b.pose);
        assert_eq!(a.inliers, b.inliers);
    }

    #[test]
    fn test_p3p_contains_true_pose() {
        let pose = true_pose();
        let (p3, p2) = scene(&pose, 3, 8);
        let cam = camera();
        let world = [p3[0], p3[1], p3[2]];
        let rays = [
            cam.unproject(&p2[0]).normalize(),
            cam.unproject(&p2[1]).normalize(),
            cam.unproject(&p2[2]).normalize(),
        ];
        let solutions = p3p(&world, &rays);
        assert!(!solutions.is_empty() && solutions.len() <= 4);
        let truth_cw = pose.inverse();
        assert!(solutions
            .iter()
            .any(|s| s.distance_to(&truth_cw) < 1e-6 && s.angle_to(&truth_cw) < 1e-6));
    }

    #[test]
    fn test_minimal_sets_without_prior() {
        let pose = true_pose();
        for (count, seed) in [(4, 9), (5, 10)] {
            let (p3, p2) = scene(&pose, count, seed);
            let est = estimate_pose(&p3, &p2, &camera(), None, &PoseEstimatorConfig::default())
                .unwrap();
            assert_eq!(est.num_inliers, count);
            assert_relative_eq!(est.pose.translation, pose.translation, epsilon = 1e-5);
            assert!(est.pose.angle_to(&pose) < 1e-5);
        }
    }

    #[test]
    fn test_insufficient_correspondences() {
        let (p3, p2) = scene(&true_pose(), 3, 5);
        let err = estimate_pose(&p3, &p2, &camera(), None, &PoseEstimatorConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            PoseError::InsufficientCorrespondences {
                required: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn test_garbage_does_not_converge() {
        let (p3, _) = scene(&true_pose(), 30, 6);
        let mut rng = StdRng::seed_from_u64(7);
        let p2: Vec<Vector2<f64>> = (0..30)
            .map(|_| Vector2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0)))
            .collect();
        let cfg = PoseEstimatorConfig {
            min_inliers: 15,
            ..Default::default()
        };
        assert!(matches!(
            estimate_pose(&p3, &p2, &camera(), None, &cfg),
            Err(PoseError::NotConverged { .. })
        ));
    }
}
