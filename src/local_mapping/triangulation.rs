//! Multi-frame triangulation with geometric validation.
//!
//! Creates landmarks from features of a new keyframe that tracking left
//! unmatched:
//! 1. For each covisible neighbor with enough baseline, find epipolar-
//!    constrained descriptor matches between unmatched features
//! 2. Triangulate with DLT
//! 3. Validate with parallax, depth and reprojection error checks

use std::collections::BTreeMap;

use nalgebra::Vector2;
use tracing::{debug, warn};

use crate::geometry::triangulation::{
    epipolar_distance_sq, fundamental_matrix, triangulate_dlt, validate_triangulation,
};
use crate::map::{KeyFrame, KeyFrameId, Map, MapError};
use crate::tracking::frame::CameraModel;
use crate::tracking::matching::{descriptor_distance, NN_RATIO, TH_LOW};

/// Configuration for multi-frame triangulation.
#[derive(Debug, Clone)]
pub struct TriangulationConfig {
    /// Number of neighbor keyframes to consider.
    pub num_neighbors: usize,
    /// Maximum descriptor distance for matching.
    pub max_descriptor_dist: u32,
    /// Minimum baseline as fraction of the median scene depth.
    pub min_baseline_ratio: f64,
    /// Rays closer than this (cosine) are not triangulated (~1.1 degrees).
    pub max_parallax_cos: f64,
    /// Squared epipolar distance threshold (px², χ² 95% with 1 DOF).
    pub max_epipolar_sq: f64,
    /// Squared reprojection error threshold (px², χ² 95% with 2 DOF).
    pub max_reprojection_sq: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            num_neighbors: 10,
            max_descriptor_dist: TH_LOW,
            min_baseline_ratio: 0.01,
            max_parallax_cos: 0.9998,
            max_epipolar_sq: 3.84,
            max_reprojection_sq: 5.991,
        }
    }
}

/// Result of multi-frame triangulation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TriangulationResult {
    pub num_new_points: usize,
    pub num_pairs_checked: usize,
    pub num_matches_found: usize,
    /// Stopped early because a landmark ceiling was reached.
    pub capacity_reached: bool,
}

/// Median depth of the landmarks of a keyframe in its own camera frame.
fn median_scene_depth(map: &Map, kf: &KeyFrame) -> Option<f64> {
    let pose_cw = kf.pose_cw();
    let mut depths: Vec<f64> = kf
        .landmark_indices()
        .filter_map(|(_, id)| map.landmark(id))
        .map(|lm| pose_cw.transform_point(lm.position()).z)
        .collect();
    if depths.is_empty() {
        return None;
    }
    depths.sort_by(f64::total_cmp);
    Some(depths[(depths.len() - 1) / 2])
}

/// Search for triangulation matches between two keyframes.
///
/// Finds matches between features that:
/// 1. Are not already associated with landmarks
/// 2. Have similar descriptors (below threshold, passing the ratio test)
/// 3. Satisfy the epipolar constraint
///
/// Returns `(idx1, idx2)` pairs, one-to-one.
fn search_for_triangulation(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    camera: &CameraModel,
    config: &TriangulationConfig,
) -> Vec<(usize, usize)> {
    let f12 = fundamental_matrix(kf1.pose(), kf2.pose(), camera);
    let free2: Vec<usize> = (0..kf2.num_features())
        .filter(|&j| kf2.landmark(j).is_none())
        .collect();

    // target -> (source, distance)
    let mut by_target: BTreeMap<usize, (usize, u32)> = BTreeMap::new();
    for i in 0..kf1.num_features() {
        if kf1.landmark(i).is_some() {
            continue;
        }
        let (Some(kp1), Some(d1)) = (kf1.keypoint(i), kf1.descriptor(i)) else {
            continue;
        };

        let mut best = (u32::MAX, None);
        let mut second = u32::MAX;
        for &j in &free2 {
            let (Some(kp2), Some(d2)) = (kf2.keypoint(j), kf2.descriptor(j)) else {
                continue;
            };
            let dist = descriptor_distance(d1, d2);
            if dist > config.max_descriptor_dist || dist >= second {
                continue;
            }
            if epipolar_distance_sq(&f12, &kp1.pt, &kp2.pt) > config.max_epipolar_sq {
                continue;
            }
            if dist < best.0 {
                second = best.0;
                best = (dist, Some(j));
            } else {
                second = dist;
            }
        }

        let (dist, Some(j)) = best else { continue };
        if second != u32::MAX && dist as f32 > NN_RATIO * second as f32 {
            continue;
        }
        match by_target.get(&j) {
            Some(&(_, d)) if d <= dist => {}
            _ => {
                by_target.insert(j, (i, dist));
            }
        }
    }

    let mut out: Vec<(usize, usize)> = by_target.into_iter().map(|(j, (i, _))| (i, j)).collect();
    out.sort_unstable();
    out
}

/// Triangulate new landmarks between the current keyframe and its neighbors.
pub fn triangulate_from_neighbors(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &TriangulationConfig,
) -> Result<TriangulationResult, MapError> {
    let mut result = TriangulationResult::default();

    let neighbor_ids = map.local_keyframes(current_kf_id, config.num_neighbors);
    if neighbor_ids.is_empty() {
        return Ok(result);
    }

    for neighbor_id in neighbor_ids {
        result.num_pairs_checked += 1;

        // Collect: matches and candidate points from the current map state
        let candidates = {
            let (Some(current), Some(neighbor)) = (map.keyframe(current_kf_id), map.keyframe(neighbor_id))
            else {
                continue;
            };

            // Check baseline is sufficient
            let baseline = (neighbor.camera_center() - current.camera_center()).norm();
            let Some(depth) = median_scene_depth(map, neighbor) else {
                continue;
            };
            if baseline / depth < config.min_baseline_ratio {
                continue;
            }

            let matches = search_for_triangulation(current, neighbor, camera, config);
            result.num_matches_found += matches.len();

            let mut candidates = Vec::new();
            for (idx1, idx2) in matches {
                let (Some(kp1), Some(kp2), Some(desc)) = (
                    current.keypoint(idx1),
                    neighbor.keypoint(idx2),
                    current.descriptor(idx1),
                ) else {
                    continue;
                };
                let uv1: Vector2<f64> = kp1.pt;
                let uv2: Vector2<f64> = kp2.pt;
                let xn1 = camera.unproject(&uv1);
                let xn2 = camera.unproject(&uv2);

                // Parallax between the viewing rays
                let ray1 = current.pose().rotation * xn1;
                let ray2 = neighbor.pose().rotation * xn2;
                let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());
                if cos_parallax <= 0.0 || cos_parallax >= config.max_parallax_cos {
                    continue;
                }

                let Some(point) = triangulate_dlt(&xn1, &xn2, current.pose(), neighbor.pose()) else {
                    continue;
                };
                if !validate_triangulation(
                    &point,
                    current.pose(),
                    neighbor.pose(),
                    &uv1,
                    &uv2,
                    camera,
                    config.max_reprojection_sq,
                ) {
                    continue;
                }
                candidates.push((idx1, idx2, point, *desc));
            }
            candidates
        };

        // Apply: create landmarks observed by both keyframes
        for (idx1, idx2, point, desc) in candidates {
            let lm = match map.insert_landmark(point, desc, current_kf_id) {
                Ok(lm) => lm,
                Err(MapError::CapacityExceeded { resource, limit }) => {
                    warn!(
                        "[Triangulation] {} ceiling of {} reached, stopping",
                        resource, limit
                    );
                    result.capacity_reached = true;
                    return Ok(result);
                }
                Err(e) => return Err(e),
            };
            // Headroom culling may have released the neighbor.
            if !map.contains_keyframe(neighbor_id) {
                map.remove_landmark(lm)?;
                break;
            }
            // Either slot may have been taken by an earlier neighbor.
            let linked1 = map.associate(current_kf_id, idx1, lm)?;
            let linked2 = linked1 && map.associate(neighbor_id, idx2, lm)?;
            if !linked2 {
                map.remove_landmark(lm)?;
                continue;
            }
            map.update_landmark_descriptor(lm);
            result.num_new_points += 1;
        }
    }

    if result.num_new_points > 0 {
        debug!(
            "[Triangulation] {}: {} new landmarks (pairs={}, matches={})",
            current_kf_id, result.num_new_points, result.num_pairs_checked, result.num_matches_found
        );
    }
    Ok(result)
}
