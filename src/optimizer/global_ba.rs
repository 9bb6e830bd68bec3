//! Global Bundle Adjustment.
//!
//! Refines every keyframe pose and landmark position at once. Used after
//! map bootstrap and after a loop closure. The map origin is held fixed to
//! anchor the gauge.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::map::{KeyFrameId, Map, MapError};
use crate::tracking::frame::CameraModel;

use super::bundle::{BundleConfig, CHI2_MONO};
use super::local_ba::{apply_problem, collect_problem, solve_robust};

/// Configuration for global BA.
#[derive(Debug, Clone)]
pub struct GlobalBAConfig {
    /// Maps larger than this are skipped; the dense Schur system grows
    /// quadratically with the keyframe count.
    pub max_keyframes: usize,
    pub bundle: BundleConfig,
    pub chi2_threshold: f64,
}

impl Default for GlobalBAConfig {
    fn default() -> Self {
        Self {
            max_keyframes: 150,
            bundle: BundleConfig {
                max_iterations: 15,
                ..BundleConfig::default()
            },
            chi2_threshold: CHI2_MONO,
        }
    }
}

/// Result of global BA.
#[derive(Debug)]
pub struct GlobalBAResult {
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub num_keyframes: usize,
    pub num_landmarks: usize,
    /// Observations exceeding the χ² threshold after optimization.
    pub outliers: Vec<(KeyFrameId, usize)>,
}

/// Optimize the whole map in place.
///
/// Returns `Ok(None)` when the map has fewer than two keyframes, has no
/// landmarks, or exceeds [`GlobalBAConfig::max_keyframes`].
pub fn global_bundle_adjustment(
    map: &mut Map,
    camera: &CameraModel,
    config: &GlobalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Result<Option<GlobalBAResult>, MapError> {
    let num_kfs = map.num_keyframes();
    if num_kfs < 2 {
        return Ok(None);
    }
    if num_kfs > config.max_keyframes {
        warn!(
            "[GlobalBA] Skipped: {} keyframes exceeds limit of {}",
            num_kfs, config.max_keyframes
        );
        return Ok(None);
    }

    let all: BTreeSet<KeyFrameId> = map.keyframe_ids().collect();
    let fixed: BTreeSet<KeyFrameId> = map.origin().into_iter().collect();

    let Some(mut collected) = collect_problem(map, &all, &fixed) else {
        return Ok(None);
    };
    let (report, outliers) = solve_robust(
        &mut collected,
        camera,
        &config.bundle,
        config.chi2_threshold,
        should_stop,
    );
    apply_problem(map, &collected)?;

    info!(
        "[GlobalBA] {} iterations, error {:.4} -> {:.4} px ({} KFs, {} landmarks)",
        report.iterations,
        report.initial_error,
        report.final_error,
        num_kfs,
        collected.landmarks.len()
    );

    Ok(Some(GlobalBAResult {
        iterations: report.iterations,
        initial_error: report.initial_error,
        final_error: report.final_error,
        num_keyframes: num_kfs,
        num_landmarks: collected.landmarks.len(),
        outliers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::MapLimits;
    use crate::tracking::frame::{FeatureSet, KeyPoint};
    use nalgebra::Vector3;
    use std::sync::Arc;

    fn camera() -> CameraModel {
        CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480)
    }

    fn scene(num_kfs: usize) -> Map {
        let cam = camera();
        let points: Vec<Vector3<f64>> = (0..30)
            .map(|i| {
                Vector3::new(
                    -1.0 + 0.3 * (i % 6) as f64,
                    -0.5 + 0.25 * (i / 6) as f64,
                    5.0 + 0.3 * (i % 4) as f64,
                )
            })
            .collect();
        let mut map = Map::new("global", 0.0, MapLimits::default());
        let mut ids = Vec::new();
        for k in 0..num_kfs {
            let pose = SE3::from_params(&Vector3::zeros(), &Vector3::new(0.3 * k as f64, 0.0, 0.0));
            let keypoints: Vec<KeyPoint> = points
                .iter()
                .map(|p| KeyPoint {
                    pt: cam.project(&pose.inverse().transform_point(p)).unwrap(),
                    angle: 0.0,
                    response: 1.0,
                })
                .collect();
            let features = FeatureSet {
                descriptors: vec![[0u8; 32]; keypoints.len()],
                keypoints,
            };
            ids.push(
                map.insert_keyframe(k as f64, pose, Arc::new(features), Default::default())
                    .unwrap(),
            );
        }
        for (i, p) in points.iter().enumerate() {
            let lm = map.insert_landmark(*p, [0u8; 32], ids[0]).unwrap();
            for &kf in &ids {
                map.associate(kf, i, lm).unwrap();
            }
        }
        map
    }

    #[test]
    fn test_global_ba_refines_points_with_origin_fixed() {
        let mut map = scene(4);
        let origin = map.origin().unwrap();
        let origin_pose = *map.keyframe(origin).unwrap().pose();

        let ids: Vec<_> = map.landmark_ids().collect();
        for (n, id) in ids.iter().enumerate() {
            let p = *map.landmark(*id).unwrap().position();
            let offset = if n % 2 == 0 { 0.03 } else { -0.03 };
            map.set_landmark_position(*id, p + Vector3::new(offset, -offset, 0.0))
                .unwrap();
        }

        let result =
            global_bundle_adjustment(&mut map, &camera(), &GlobalBAConfig::default(), &|| false)
                .unwrap()
                .unwrap();
        assert!(result.final_error < result.initial_error);
        assert_eq!(result.num_keyframes, 4);
        assert_eq!(*map.keyframe(origin).unwrap().pose(), origin_pose);
    }

    #[test]
    fn test_size_guard_skips_large_maps() {
        let mut map = scene(3);
        let config = GlobalBAConfig {
            max_keyframes: 2,
            ..GlobalBAConfig::default()
        };
        assert!(global_bundle_adjustment(&mut map, &camera(), &config, &|| false)
            .unwrap()
            .is_none());

        let mut single = scene(1);
        assert!(
            global_bundle_adjustment(&mut single, &camera(), &GlobalBAConfig::default(), &|| false)
                .unwrap()
                .is_none()
        );
    }
}
