//! SearchInNeighbors - landmark fusion between covisible keyframes.
//!
//! Fuses duplicate landmarks between the current keyframe and its neighbors:
//! 1. Collect neighbor keyframes (best covisibles + their best covisibles)
//! 2. Fuse the current keyframe's landmarks into the neighbors
//! 3. Fuse the neighbors' landmarks into the current keyframe
//! 4. Update descriptors and normals of the affected landmarks

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::map::{KeyFrameId, LandmarkId, Map, MapError};
use crate::tracking::frame::CameraModel;
use crate::tracking::matching::{descriptor_distance, TH_LOW};
use crate::tracking::tracking_frame::FeatureGrid;

/// Configuration for SearchInNeighbors.
#[derive(Debug, Clone)]
pub struct SearchInNeighborsConfig {
    /// Number of best covisible keyframes to collect.
    pub nn_covisibles: usize,
    /// Second-order neighbors taken from each first-order neighbor.
    pub nn_secondary: usize,
    /// Projection search radius in pixels.
    pub search_radius: f64,
    /// Descriptor distance threshold for matching.
    pub desc_threshold: u32,
    /// Reject projections seen more than ~60° off the landmark's mean
    /// viewing direction.
    pub min_view_cos: f64,
}

impl Default for SearchInNeighborsConfig {
    fn default() -> Self {
        Self {
            nn_covisibles: 10,
            nn_secondary: 5,
            search_radius: 5.0,
            desc_threshold: TH_LOW,
            min_view_cos: 0.5,
        }
    }
}

/// Result of SearchInNeighbors operation.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SearchInNeighborsResult {
    /// Number of duplicate landmarks merged.
    pub num_fused: usize,
    /// Number of new observations added.
    pub num_observations_added: usize,
    /// Number of descriptors updated.
    pub num_descriptors_updated: usize,
}

/// Perform landmark fusion between the current keyframe and its neighbors.
pub fn search_in_neighbors(
    map: &mut Map,
    current_kf_id: KeyFrameId,
    camera: &CameraModel,
    config: &SearchInNeighborsConfig,
) -> Result<SearchInNeighborsResult, MapError> {
    let mut result = SearchInNeighborsResult::default();

    // Phase 1: Collect neighbor keyframes
    let neighbor_ids = collect_neighbors(map, current_kf_id, config);
    if neighbor_ids.is_empty() {
        return Ok(result);
    }

    let current_lm_ids: Vec<LandmarkId> = match map.keyframe(current_kf_id) {
        Some(kf) => kf.landmark_indices().map(|(_, id)| id).collect(),
        None => return Ok(result),
    };

    // Phase 2: Fuse current KF's landmarks into neighbors
    let (fused, added) = fuse_into_keyframes(map, &current_lm_ids, &neighbor_ids, camera, config)?;
    result.num_fused += fused;
    result.num_observations_added += added;

    // Phase 3: Fuse neighbors' landmarks into current KF
    let current_set: BTreeSet<LandmarkId> = map
        .keyframe(current_kf_id)
        .map(|kf| kf.landmark_indices().map(|(_, id)| id).collect())
        .unwrap_or_default();
    let neighbor_set: BTreeSet<KeyFrameId> = neighbor_ids.iter().copied().collect();
    let neighbor_only: Vec<LandmarkId> = map
        .landmarks_of(&neighbor_set)
        .into_iter()
        .filter(|id| !current_set.contains(id))
        .collect();

    let (fused, added) = fuse_into_keyframes(map, &neighbor_only, &[current_kf_id], camera, config)?;
    result.num_fused += fused;
    result.num_observations_added += added;

    // Phase 4: Refresh the current keyframe's landmarks
    let affected: Vec<LandmarkId> = map
        .keyframe(current_kf_id)
        .map(|kf| kf.landmark_indices().map(|(_, id)| id).collect())
        .unwrap_or_default();
    for lm_id in affected {
        map.update_landmark_descriptor(lm_id);
        result.num_descriptors_updated += 1;
    }

    debug!(
        "[SearchInNeighbors] {}: fused={} obs_added={} desc_updated={}",
        current_kf_id, result.num_fused, result.num_observations_added, result.num_descriptors_updated
    );
    Ok(result)
}

/// Best covisibles of the current keyframe plus a few of theirs.
fn collect_neighbors(
    map: &Map,
    current_kf_id: KeyFrameId,
    config: &SearchInNeighborsConfig,
) -> Vec<KeyFrameId> {
    let first = map.local_keyframes(current_kf_id, config.nn_covisibles);
    let mut neighbors: BTreeSet<KeyFrameId> = first.iter().copied().collect();

    for &neighbor_id in &first {
        let secondary = map.local_keyframes(neighbor_id, config.nn_secondary + 1);
        neighbors.extend(
            secondary
                .into_iter()
                .filter(|id| *id != current_kf_id)
                .take(config.nn_secondary),
        );
    }
    neighbors.remove(&current_kf_id);
    neighbors.into_iter().collect()
}

/// Project landmarks into target keyframes and link or merge on a match.
///
/// - Target feature without a landmark: add the observation
/// - Target feature with a different landmark: merge, keeping the one with
///   more observers
///
/// Returns `(num_fused, num_observations_added)`.
fn fuse_into_keyframes(
    map: &mut Map,
    lm_ids: &[LandmarkId],
    target_kf_ids: &[KeyFrameId],
    camera: &CameraModel,
    config: &SearchInNeighborsConfig,
) -> Result<(usize, usize), MapError> {
    let mut num_fused = 0;
    let mut num_obs_added = 0;
    let mut grids: BTreeMap<KeyFrameId, FeatureGrid> = BTreeMap::new();

    for &lm_id in lm_ids {
        for &target_kf_id in target_kf_ids {
            // The landmark may have been merged away by an earlier target.
            let Some(lm) = map.landmark(lm_id) else {
                break;
            };
            if lm.is_observed_by(target_kf_id) {
                continue;
            }
            let Some(kf) = map.keyframe(target_kf_id) else {
                continue;
            };

            let position = *lm.position();
            let p_cam = kf.pose_cw().transform_point(&position);
            let Some(uv) = camera.project(&p_cam) else {
                continue;
            };
            if !camera.is_in_image(&uv, 0.0) {
                continue;
            }

            // Viewing direction against the landmark's mean normal
            let ray = position - kf.camera_center();
            if lm.normal.norm() > 0.0 && ray.dot(&lm.normal) < config.min_view_cos * ray.norm() {
                continue;
            }

            let grid = grids.entry(target_kf_id).or_insert_with(|| {
                FeatureGrid::new(
                    &kf.features.keypoints,
                    camera.width as f64,
                    camera.height as f64,
                )
            });

            let mut best: Option<(u32, usize)> = None;
            for idx in grid.features_in_area(uv.x, uv.y, config.search_radius) {
                let (Some(kp), Some(desc)) = (kf.keypoint(idx), kf.descriptor(idx)) else {
                    continue;
                };
                if (kp.pt - uv).norm() > config.search_radius {
                    continue;
                }
                let dist = descriptor_distance(&lm.descriptor, desc);
                if dist <= config.desc_threshold && best.map_or(true, |(d, _)| dist < d) {
                    best = Some((dist, idx));
                }
            }
            let Some((_, feat_idx)) = best else {
                continue;
            };

            match kf.landmark(feat_idx) {
                Some(existing) if existing != lm_id => {
                    let lm_obs = lm.num_observations();
                    let existing_obs = map.landmark(existing).map_or(0, |l| l.num_observations());
                    let (keep, duplicate) = if lm_obs >= existing_obs {
                        (lm_id, existing)
                    } else {
                        (existing, lm_id)
                    };
                    map.replace_landmark(duplicate, keep)?;
                    num_fused += 1;
                }
                Some(_) => {}
                None => {
                    if map.associate(target_kf_id, feat_idx, lm_id)? {
                        num_obs_added += 1;
                    }
                }
            }
        }
    }

    Ok((num_fused, num_obs_added))
}
