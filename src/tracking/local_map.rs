//! Track Local Map: the landmarks a frame is matched against.
//!
//! The local map is the reference keyframe plus its most covisible
//! neighbors; their landmarks are the candidates for projection search.

use std::collections::BTreeSet;

use crate::geometry::SE3;
use crate::map::{KeyFrameId, LandmarkId, Map};
use crate::tracking::frame::CameraModel;
use crate::tracking::matching::LandmarkCandidate;

/// Landmarks further than this from their mean viewing direction
/// (cosine) are not expected to be visible.
const MIN_VIEW_COS: f64 = 0.5;

/// Snapshot of the landmarks around a reference keyframe.
#[derive(Debug, Clone, Default)]
pub struct LocalMap {
    pub reference: Option<KeyFrameId>,
    pub keyframes: BTreeSet<KeyFrameId>,
    pub candidates: Vec<LandmarkCandidate>,
}

impl LocalMap {
    /// Collect `reference` and its `num_neighbors` most covisible
    /// keyframes, and every landmark they observe.
    pub fn build(map: &Map, reference: KeyFrameId, num_neighbors: usize) -> Self {
        if !map.contains_keyframe(reference) {
            return Self::default();
        }
        let mut keyframes: BTreeSet<KeyFrameId> = map
            .local_keyframes(reference, num_neighbors)
            .into_iter()
            .collect();
        keyframes.insert(reference);

        let candidates = map
            .landmarks_of(&keyframes)
            .into_iter()
            .filter_map(|id| {
                let lm = map.landmark(id)?;
                Some(LandmarkCandidate {
                    id,
                    position: *lm.position(),
                    descriptor: lm.descriptor,
                })
            })
            .collect();

        Self {
            reference: Some(reference),
            keyframes,
            candidates,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Landmarks that project inside the image from `pose` (T_wc) and are
    /// seen from a direction close to their mean viewing direction.
    pub fn visible_from(&self, map: &Map, pose: &SE3, camera: &CameraModel) -> Vec<LandmarkId> {
        let pose_cw = pose.inverse();
        let center = pose.translation;
        self.candidates
            .iter()
            .filter(|cand| {
                let p_cam = pose_cw.transform_point(&cand.position);
                let Some(uv) = camera.project(&p_cam) else {
                    return false;
                };
                if !camera.is_in_image(&uv, 0.0) {
                    return false;
                }
                let Some(normal) = map.landmark(cand.id).map(|lm| lm.normal) else {
                    return false;
                };
                if normal.norm_squared() < 1e-12 {
                    return true;
                }
                let ray = cand.position - center;
                let dist = ray.norm();
                dist > 1e-12 && ray.dot(&normal) / dist >= MIN_VIEW_COS
            })
            .map(|cand| cand.id)
            .collect()
    }
}
