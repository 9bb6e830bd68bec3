//! Sparse bundle adjustment core.
//!
//! Levenberg-Marquardt over keyframe poses (T_cw, left-multiplicative
//! 6-DoF updates) and landmark positions, solved through the Schur
//! complement:
//!
//! ```text
//! S  = H_pp - H_pl H_ll⁻¹ H_plᵀ
//! S δp = b_p - H_pl H_ll⁻¹ b_l
//! δl = H_ll⁻¹ (b_l - H_plᵀ δp)
//! ```
//!
//! `H_ll` is block diagonal (one 3×3 block per landmark), so only the pose
//! system is solved densely. Residuals are Huber-weighted.

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, Matrix3, Matrix6x3, Vector2, Vector3};

use crate::geometry::so3::{self, skew};
use crate::geometry::SE3;
use crate::tracking::frame::camera::MIN_DEPTH;
use crate::tracking::frame::CameraModel;

/// χ² threshold at 95% for 2 DoF (px²).
pub const CHI2_MONO: f64 = 5.991;

const LAMBDA_MIN: f64 = 1e-9;
const LAMBDA_MAX: f64 = 1e8;

/// A landmark seen in a keyframe at an undistorted pixel location.
#[derive(Debug, Clone)]
pub struct BundleObservation {
    pub pose: usize,
    pub point: usize,
    pub uv: Vector2<f64>,
}

/// Variables and measurements of one adjustment.
#[derive(Debug, Clone, Default)]
pub struct BundleProblem {
    /// World-to-camera poses.
    pub poses_cw: Vec<SE3>,
    /// Fixed flag per pose; fixed poses only constrain the landmarks.
    pub fixed: Vec<bool>,
    pub points: Vec<Vector3<f64>>,
    pub observations: Vec<BundleObservation>,
}

#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub max_iterations: usize,
    /// Huber threshold on the residual norm (px).
    pub huber_threshold: f64,
    pub initial_lambda: f64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            huber_threshold: CHI2_MONO.sqrt(),
            initial_lambda: 1e-3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BundleReport {
    pub iterations: usize,
    /// Robust cost before and after.
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Mean reprojection error before and after (px).
    pub initial_error: f64,
    pub final_error: f64,
}

struct Linearized {
    h_pp: DMatrix<f64>,
    b_p: DVector<f64>,
    h_ll: Vec<Matrix3<f64>>,
    b_l: Vec<Vector3<f64>>,
    /// Per landmark: (pose parameter block, H_pl block).
    h_pl: Vec<Vec<(usize, Matrix6x3<f64>)>>,
}

impl BundleProblem {
    pub fn add_pose(&mut self, pose_cw: SE3, fixed: bool) -> usize {
        self.poses_cw.push(pose_cw);
        self.fixed.push(fixed);
        self.poses_cw.len() - 1
    }

    pub fn add_point(&mut self, point: Vector3<f64>) -> usize {
        self.points.push(point);
        self.points.len() - 1
    }

    pub fn add_observation(&mut self, pose: usize, point: usize, uv: Vector2<f64>) {
        self.observations.push(BundleObservation { pose, point, uv });
    }

    /// Residual (projection - observation) of one observation, `None` when
    /// the landmark is behind the camera.
    pub fn residual(&self, camera: &CameraModel, obs: &BundleObservation) -> Option<Vector2<f64>> {
        let p_cam = self.poses_cw[obs.pose].transform_point(&self.points[obs.point]);
        camera.project(&p_cam).map(|uv| uv - obs.uv)
    }

    /// Squared error per observation; infinite behind the camera.
    pub fn chi2(&self, camera: &CameraModel, obs: &BundleObservation) -> f64 {
        self.residual(camera, obs)
            .map_or(f64::INFINITY, |r| r.norm_squared())
    }

    fn optimized_index(&self) -> (Vec<Option<usize>>, usize) {
        let mut next = 0;
        let index = self
            .fixed
            .iter()
            .map(|&fixed| {
                if fixed {
                    None
                } else {
                    next += 1;
                    Some(next - 1)
                }
            })
            .collect();
        (index, next)
    }

    fn cost(&self, camera: &CameraModel, huber: f64) -> (f64, f64) {
        let mut cost = 0.0;
        let mut err_sum = 0.0;
        let mut n = 0usize;
        for obs in &self.observations {
            match self.residual(camera, obs) {
                Some(r) => {
                    let e = r.norm();
                    cost += huber_cost(e, huber);
                    err_sum += e;
                    n += 1;
                }
                // Behind the camera: saturated penalty so such steps get rejected
                None => cost += huber_cost(1e3, huber),
            }
        }
        let mean = if n > 0 { err_sum / n as f64 } else { 0.0 };
        (cost, mean)
    }

    fn linearize(
        &self,
        camera: &CameraModel,
        index: &[Option<usize>],
        num_poses: usize,
        huber: f64,
    ) -> Linearized {
        let mut lin = Linearized {
            h_pp: DMatrix::zeros(num_poses * 6, num_poses * 6),
            b_p: DVector::zeros(num_poses * 6),
            h_ll: vec![Matrix3::zeros(); self.points.len()],
            b_l: vec![Vector3::zeros(); self.points.len()],
            h_pl: vec![Vec::new(); self.points.len()],
        };

        for obs in &self.observations {
            let pose = &self.poses_cw[obs.pose];
            let point = &self.points[obs.point];
            let p_cam = pose.transform_point(point);
            let Some(uv) = camera.project(&p_cam) else {
                continue;
            };
            let r = uv - obs.uv;
            let w = huber_weight(r.norm(), huber);
            let (j_pose, j_point) = jacobians(pose, &p_cam, camera);

            let jlt_w = j_point.transpose() * w;
            lin.h_ll[obs.point] += jlt_w * j_point;
            lin.b_l[obs.point] -= jlt_w * r;

            if let Some(k) = index[obs.pose] {
                let jpt_w = j_pose.transpose() * w;
                let mut block = lin.h_pp.fixed_view_mut::<6, 6>(k * 6, k * 6);
                block += jpt_w * j_pose;
                let mut rhs = lin.b_p.fixed_rows_mut::<6>(k * 6);
                rhs -= jpt_w * r;
                lin.h_pl[obs.point].push((k, jpt_w * j_point));
            }
        }
        lin
    }
}

/// Jacobians of the projection w.r.t. a left pose perturbation `[ω, v]`
/// and the world point.
fn jacobians(
    pose_cw: &SE3,
    p_cam: &Vector3<f64>,
    camera: &CameraModel,
) -> (Matrix2x6<f64>, Matrix2x3<f64>) {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z.max(MIN_DEPTH));
    let inv_z = 1.0 / z;
    let inv_z2 = inv_z * inv_z;
    let j_proj = Matrix2x3::new(
        camera.fx * inv_z,
        0.0,
        -camera.fx * x * inv_z2,
        0.0,
        camera.fy * inv_z,
        -camera.fy * y * inv_z2,
    );

    let mut j_pose = Matrix2x6::zeros();
    j_pose
        .fixed_view_mut::<2, 3>(0, 0)
        .copy_from(&(j_proj * -skew(p_cam)));
    j_pose.fixed_view_mut::<2, 3>(0, 3).copy_from(&j_proj);

    let j_point = j_proj * pose_cw.rotation_matrix();
    (j_pose, j_point)
}

fn huber_cost(e: f64, delta: f64) -> f64 {
    if e <= delta {
        e * e
    } else {
        2.0 * delta * e - delta * delta
    }
}

fn huber_weight(e: f64, delta: f64) -> f64 {
    if e <= delta {
        1.0
    } else {
        delta / e
    }
}

fn apply_pose_update(pose_cw: &SE3, delta: &[f64]) -> SE3 {
    let dr = so3::exp(&Vector3::new(delta[0], delta[1], delta[2]));
    SE3::from_quaternion(
        dr * pose_cw.rotation,
        dr * pose_cw.translation + Vector3::new(delta[3], delta[4], delta[5]),
    )
}

/// Solve the damped system; `None` when the Schur complement is singular.
fn solve_step(
    lin: &Linearized,
    lambda: f64,
    num_poses: usize,
) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
    let damp3 = |m: &Matrix3<f64>| {
        let mut d = *m;
        for i in 0..3 {
            d[(i, i)] += lambda * m[(i, i)].max(1e-6);
        }
        d
    };

    let h_ll_inv: Vec<Option<Matrix3<f64>>> =
        lin.h_ll.iter().map(|h| damp3(h).try_inverse()).collect();

    let mut s = lin.h_pp.clone();
    for i in 0..num_poses * 6 {
        s[(i, i)] += lambda * lin.h_pp[(i, i)].max(1e-6);
    }
    let mut rhs = lin.b_p.clone();

    for (j, blocks) in lin.h_pl.iter().enumerate() {
        let Some(inv) = h_ll_inv[j] else {
            continue;
        };
        let inv_b = inv * lin.b_l[j];
        for &(k, ref w_k) in blocks {
            let w_inv = w_k * inv;
            let mut r = rhs.fixed_rows_mut::<6>(k * 6);
            r -= w_k * inv_b;
            for &(l, ref w_l) in blocks {
                let mut block = s.fixed_view_mut::<6, 6>(k * 6, l * 6);
                block -= w_inv * w_l.transpose();
            }
        }
    }

    let delta_p = if num_poses == 0 {
        DVector::zeros(0)
    } else {
        match s.clone().cholesky() {
            Some(chol) => chol.solve(&rhs),
            None => s.lu().solve(&rhs)?,
        }
    };

    let delta_l = lin
        .h_pl
        .iter()
        .enumerate()
        .map(|(j, blocks)| match h_ll_inv[j] {
            Some(inv) => {
                let mut b = lin.b_l[j];
                for &(k, ref w_k) in blocks {
                    b -= w_k.transpose() * delta_p.fixed_rows::<6>(k * 6);
                }
                inv * b
            }
            None => Vector3::zeros(),
        })
        .collect();

    Some((delta_p, delta_l))
}

/// Run Levenberg-Marquardt in place. `should_stop` is polled between
/// iterations.
pub fn solve(
    problem: &mut BundleProblem,
    camera: &CameraModel,
    config: &BundleConfig,
    should_stop: &dyn Fn() -> bool,
) -> BundleReport {
    let huber = config.huber_threshold;
    let (index, num_poses) = problem.optimized_index();
    let (initial_cost, initial_error) = problem.cost(camera, huber);

    let mut cost = initial_cost;
    let mut lambda = config.initial_lambda;
    let mut iterations = 0;

    while iterations < config.max_iterations && !should_stop() {
        iterations += 1;
        let lin = problem.linearize(camera, &index, num_poses, huber);
        let Some((delta_p, delta_l)) = solve_step(&lin, lambda, num_poses) else {
            break;
        };

        let mut trial = problem.clone();
        for (pose_idx, slot) in index.iter().enumerate() {
            if let Some(k) = slot {
                let d = &delta_p.as_slice()[k * 6..k * 6 + 6];
                trial.poses_cw[pose_idx] = apply_pose_update(&problem.poses_cw[pose_idx], d);
            }
        }
        for (p, d) in trial.points.iter_mut().zip(&delta_l) {
            *p += d;
        }

        let (trial_cost, _) = trial.cost(camera, huber);
        if trial_cost < cost {
            let improvement = (cost - trial_cost) / cost.max(1e-12);
            *problem = trial;
            cost = trial_cost;
            lambda = (lambda * 0.1).max(LAMBDA_MIN);
            if improvement < 1e-6 {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                break;
            }
        }
    }

    let (final_cost, final_error) = problem.cost(camera, huber);
    BundleReport {
        iterations,
        initial_cost,
        final_cost,
        initial_error,
        final_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }

    fn scene() -> (Vec<SE3>, Vec<Vector3<f64>>) {
        let poses_wc = vec![
            SE3::identity(),
            SE3::from_params(&Vector3::new(0.0, -0.05, 0.0), &Vector3::new(0.5, 0.0, 0.0)),
            SE3::from_params(&Vector3::new(0.02, -0.1, 0.01), &Vector3::new(1.0, 0.1, 0.1)),
        ];
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                points.push(Vector3::new(
                    -1.0 + 0.5 * i as f64,
                    -0.8 + 0.4 * j as f64,
                    4.0 + 0.3 * ((i + j) % 3) as f64,
                ));
            }
        }
        (poses_wc, points)
    }

    fn build(poses_wc: &[SE3], points: &[Vector3<f64>], fixed: &[bool]) -> BundleProblem {
        let cam = camera();
        let mut problem = BundleProblem::default();
        for (pose, &f) in poses_wc.iter().zip(fixed) {
            problem.add_pose(pose.inverse(), f);
        }
        for p in points {
            problem.add_point(*p);
        }
        for (pi, pose) in poses_wc.iter().enumerate() {
            for (li, p) in points.iter().enumerate() {
                let uv = cam.project(&pose.inverse().transform_point(p)).unwrap();
                problem.add_observation(pi, li, uv);
            }
        }
        problem
    }

    #[test]
    fn test_pose_jacobian_matches_numeric() {
        let cam = camera();
        let pose = SE3::from_params(&Vector3::new(0.1, -0.2, 0.05), &Vector3::new(0.3, 0.1, -0.2));
        let point = Vector3::new(0.4, -0.3, 4.0);
        let p_cam = pose.transform_point(&point);
        let (j_pose, j_point) = jacobians(&pose, &p_cam, &cam);

        let eps = 1e-5;
        let proj = |p: &SE3, x: &Vector3<f64>| cam.project(&p.transform_point(x)).unwrap();
        for i in 0..6 {
            let mut d = [0.0; 6];
            d[i] = eps;
            let plus = proj(&apply_pose_update(&pose, &d), &point);
            d[i] = -eps;
            let minus = proj(&apply_pose_update(&pose, &d), &point);
            let numeric = (plus - minus) / (2.0 * eps);
            assert_relative_eq!(numeric, j_pose.column(i).into_owned(), epsilon = 1e-3);
        }
        for i in 0..3 {
            let mut dp = Vector3::zeros();
            dp[i] = eps;
            let numeric = (proj(&pose, &(point + dp)) - proj(&pose, &(point - dp))) / (2.0 * eps);
            assert_relative_eq!(numeric, j_point.column(i).into_owned(), epsilon = 1e-3);
        }
    }

    #[test]
    fn test_recovers_perturbed_pose_and_points() {
        let cam = camera();
        let (poses, points) = scene();
        let truth = poses[2];

        let mut noisy_poses = poses.clone();
        noisy_poses[2] = SE3::from_params(
            &(truth.to_params().0 + Vector3::new(0.01, -0.01, 0.005)),
            &(truth.translation + Vector3::new(0.03, -0.02, 0.02)),
        );
        let noisy_points: Vec<_> = points
            .iter()
            .enumerate()
            .map(|(i, p)| p + Vector3::new(0.02 * ((i % 3) as f64 - 1.0), 0.01, -0.015))
            .collect();

        // Two fixed cameras pin down the gauge.
        let mut problem = build(&poses, &points, &[true, true, false]);
        problem.poses_cw[2] = noisy_poses[2].inverse();
        problem.points = noisy_points;

        let config = BundleConfig {
            max_iterations: 30,
            ..Default::default()
        };
        let report = solve(&mut problem, &cam, &config, &|| false);
        assert!(report.final_cost < report.initial_cost);
        assert!(report.final_error < 1e-3, "final error {}", report.final_error);

        let recovered = problem.poses_cw[2].inverse();
        assert_relative_eq!(recovered.translation, truth.translation, epsilon = 1e-4);
        assert!(recovered.angle_to(&truth) < 1e-4);
        for (p, t) in problem.points.iter().zip(&points) {
            assert_relative_eq!(*p, *t, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_fixed_poses_untouched_and_stop() {
        let cam = camera();
        let (poses, points) = scene();
        let mut problem = build(&poses, &points, &[true, false, false]);
        problem.points[0] += Vector3::new(0.1, 0.0, 0.0);
        let before = problem.poses_cw[0];

        let report = solve(&mut problem, &cam, &BundleConfig::default(), &|| true);
        assert_eq!(report.iterations, 0);

        solve(&mut problem, &cam, &BundleConfig::default(), &|| false);
        assert_eq!(problem.poses_cw[0], before);
    }
}
