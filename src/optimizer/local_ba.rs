//! Local Bundle Adjustment over a covisibility window.
//!
//! Three phases, so the solve runs on plain data:
//! 1. **Collect**: the new keyframe plus its most covisible neighbors are
//!    optimized; the oldest of them is the fixed anchor. Keyframes outside
//!    the window that observe window landmarks are added as fixed. Without
//!    such observers the two oldest window keyframes are fixed, which pins
//!    the monocular scale.
//! 2. **Solve**: [`bundle::solve`](super::bundle::solve) in two rounds;
//!    observations over the χ² threshold after the first round are dropped
//!    before the second.
//! 3. **Apply**: poses and positions are written back; dropped and still
//!    failing observations are reported as outliers.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::map::{KeyFrameId, LandmarkId, Map, MapError};
use crate::tracking::frame::CameraModel;

use super::bundle::{self, BundleConfig, BundleProblem, BundleReport, CHI2_MONO};

/// Configuration for local BA.
#[derive(Debug, Clone)]
pub struct LocalBAConfig {
    /// Covisible keyframes optimized together with the new one.
    pub window: usize,
    /// Cap on fixed observer keyframes pulled in from outside the window.
    pub max_fixed_keyframes: usize,
    pub bundle: BundleConfig,
    /// Squared pixel error above which an observation is an outlier.
    pub chi2_threshold: f64,
}

impl Default for LocalBAConfig {
    fn default() -> Self {
        Self {
            window: 10,
            max_fixed_keyframes: 20,
            bundle: BundleConfig::default(),
            chi2_threshold: CHI2_MONO,
        }
    }
}

/// Result of local bundle adjustment.
#[derive(Debug)]
pub struct LocalBAResult {
    pub iterations: usize,
    /// Mean reprojection error before and after (px).
    pub initial_error: f64,
    pub final_error: f64,
    /// Keyframes optimized (excluding fixed ones).
    pub num_keyframes: usize,
    pub num_landmarks: usize,
    pub num_observations: usize,
    /// Observations to drop: (keyframe, feature index).
    pub outliers: Vec<(KeyFrameId, usize)>,
}

/// Problem extracted from the map, with the ids behind each index.
pub(crate) struct MapProblem {
    pub problem: BundleProblem,
    pub keyframes: Vec<KeyFrameId>,
    pub landmarks: Vec<LandmarkId>,
    /// Feature index behind each observation.
    pub features: Vec<usize>,
}

impl MapProblem {
    /// Observations over `chi2_threshold` as (keyframe, feature index).
    fn outliers(&self, camera: &CameraModel, chi2_threshold: f64) -> Vec<(KeyFrameId, usize)> {
        self.problem
            .observations
            .iter()
            .zip(&self.features)
            .filter(|(obs, _)| self.problem.chi2(camera, obs) > chi2_threshold)
            .map(|(obs, &feature_idx)| (self.keyframes[obs.pose], feature_idx))
            .collect()
    }

    /// Remove observations over the threshold; returns them.
    fn drop_outliers(&mut self, camera: &CameraModel, chi2_threshold: f64) -> Vec<(KeyFrameId, usize)> {
        let keep: Vec<bool> = self
            .problem
            .observations
            .iter()
            .map(|obs| self.problem.chi2(camera, obs) <= chi2_threshold)
            .collect();
        let mut dropped = Vec::new();
        let observations = std::mem::take(&mut self.problem.observations);
        let features = std::mem::take(&mut self.features);
        for ((obs, feature_idx), keep) in observations.into_iter().zip(features).zip(keep) {
            if keep {
                self.problem.observations.push(obs);
                self.features.push(feature_idx);
            } else {
                dropped.push((self.keyframes[obs.pose], feature_idx));
            }
        }
        dropped
    }
}

/// Solve, drop χ² outliers, solve again. Returns the report spanning both
/// rounds and every outlier observation.
pub(crate) fn solve_robust(
    collected: &mut MapProblem,
    camera: &CameraModel,
    config: &BundleConfig,
    chi2_threshold: f64,
    should_stop: &dyn Fn() -> bool,
) -> (BundleReport, Vec<(KeyFrameId, usize)>) {
    let first = bundle::solve(&mut collected.problem, camera, config, should_stop);
    let mut outliers = collected.drop_outliers(camera, chi2_threshold);
    if outliers.is_empty() || collected.problem.observations.is_empty() || should_stop() {
        outliers.extend(collected.outliers(camera, chi2_threshold));
        return (first, outliers);
    }

    let second = bundle::solve(&mut collected.problem, camera, config, should_stop);
    outliers.extend(collected.outliers(camera, chi2_threshold));
    let report = BundleReport {
        iterations: first.iterations + second.iterations,
        initial_cost: first.initial_cost,
        final_cost: second.final_cost,
        initial_error: first.initial_error,
        final_error: second.final_error,
    };
    (report, outliers)
}

/// Build a bundle problem over `owners ∪ fixed` keyframes and the landmarks
/// observed by `owners`. Keyframes in `fixed` are held constant.
pub(crate) fn collect_problem(
    map: &Map,
    owners: &BTreeSet<KeyFrameId>,
    fixed: &BTreeSet<KeyFrameId>,
) -> Option<MapProblem> {
    let landmarks = map.landmarks_of(owners);
    if landmarks.is_empty() {
        return None;
    }

    let mut problem = BundleProblem::default();
    let mut keyframes = Vec::new();
    let mut kf_index = BTreeMap::new();
    for &id in owners.iter().chain(fixed.iter()) {
        let kf = map.keyframe(id)?;
        if kf_index.contains_key(&id) {
            continue;
        }
        let idx = problem.add_pose(kf.pose_cw(), fixed.contains(&id));
        kf_index.insert(id, idx);
        keyframes.push(id);
    }

    let mut features = Vec::new();
    for (point_idx, &lm_id) in landmarks.iter().enumerate() {
        let lm = map.landmark(lm_id)?;
        problem.add_point(*lm.position());
        for (kf_id, &feature_idx) in lm.observations() {
            let (Some(&pose_idx), Some(kf)) = (kf_index.get(kf_id), map.keyframe(*kf_id)) else {
                continue;
            };
            let Some(kp) = kf.keypoint(feature_idx) else {
                continue;
            };
            problem.add_observation(pose_idx, point_idx, kp.pt);
            features.push(feature_idx);
        }
    }

    Some(MapProblem {
        problem,
        keyframes,
        landmarks,
        features,
    })
}

/// Write optimized values back.
///
/// Runs inside a single-writer commit, so every collected entity still
/// exists; a miss is a broken map.
pub(crate) fn apply_problem(map: &mut Map, solved: &MapProblem) -> Result<(), MapError> {
    let problem = &solved.problem;
    for (idx, &kf_id) in solved.keyframes.iter().enumerate() {
        if !problem.fixed[idx] {
            map.set_keyframe_pose(kf_id, problem.poses_cw[idx].inverse())?;
        }
    }
    for (idx, &lm_id) in solved.landmarks.iter().enumerate() {
        map.set_landmark_position(lm_id, problem.points[idx])?;
    }
    Ok(())
}

/// Optimize the window around `current_kf_id` in place.
///
/// `Ok(None)` when there is nothing to optimize.
pub fn local_bundle_adjustment(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &LocalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Result<Option<LocalBAResult>, MapError> {
    // Step 1: window = current + most covisible neighbors
    let mut window: BTreeSet<KeyFrameId> = map
        .local_keyframes(current_kf_id, config.window)
        .into_iter()
        .collect();
    window.insert(current_kf_id);
    if window.len() < 2 {
        return Ok(None);
    }

    // Step 2: observers outside the window stay fixed
    let mut fixed = BTreeSet::new();
    for lm_id in map.landmarks_of(&window) {
        if fixed.len() >= config.max_fixed_keyframes {
            break;
        }
        if let Some(lm) = map.landmark(lm_id) {
            fixed.extend(lm.observations().keys().filter(|kf| !window.contains(kf)));
        }
    }

    // Step 3: the oldest window keyframe (and the map origin) anchor the
    // gauge; with no outside observer the second oldest fixes the scale
    let anchors = if fixed.is_empty() && window.len() > 2 { 2 } else { 1 };
    fixed.extend(window.iter().take(anchors).copied());
    if let Some(origin) = map.origin() {
        if window.contains(&origin) {
            fixed.insert(origin);
        }
    }
    let optimized: BTreeSet<KeyFrameId> = window.difference(&fixed).copied().collect();
    if optimized.is_empty() {
        return Ok(None);
    }

    let Some(mut collected) = collect_problem(map, &window, &fixed) else {
        return Ok(None);
    };
    let num_observations = collected.problem.observations.len();

    let (report, outliers) = solve_robust(
        &mut collected,
        camera,
        &config.bundle,
        config.chi2_threshold,
        should_stop,
    );
    apply_problem(map, &collected)?;

    debug!(
        "[LocalBA] {} iters={} error: {:.3} -> {:.3} px ({} KFs, {} landmarks, {} outliers)",
        current_kf_id,
        report.iterations,
        report.initial_error,
        report.final_error,
        optimized.len(),
        collected.landmarks.len(),
        outliers.len()
    );

    Ok(Some(LocalBAResult {
        iterations: report.iterations,
        initial_error: report.initial_error,
        final_error: report.final_error,
        num_keyframes: optimized.len(),
        num_landmarks: collected.landmarks.len(),
        num_observations,
        outliers,
    }))
}
