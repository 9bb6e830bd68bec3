//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the nodes of the SLAM graph. They contain:
//! - Features of the source frame (shared with the tracking frame)
//! - Pose estimate (T_wc)
//! - Feature → landmark associations
//! - Covisibility edges to other keyframes
//!
//! Associations and covisibility are only mutated through [`Map`] so the
//! two sides of every relationship stay consistent.
//!
//! [`Map`]: super::Map

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, FeatureSet, KeyPoint};
use crate::vocabulary::BowVector;

use super::types::{KeyFrameId, LandmarkId};

#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from camera to world (T_wc).
    pub(super) pose: SE3,

    pub features: Arc<FeatureSet>,

    /// Bag-of-Words signature for place recognition.
    pub bow_vector: BowVector,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// `landmark_ids[i] = Some(id)` if feature `i` observes landmark `id`.
    landmark_ids: Vec<Option<LandmarkId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared landmarks.
    covisibility: BTreeMap<KeyFrameId, usize>,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        timestamp: f64,
        pose: SE3,
        features: Arc<FeatureSet>,
        bow_vector: BowVector,
    ) -> Self {
        let n = features.len();
        Self {
            id,
            timestamp,
            pose,
            features,
            bow_vector,
            landmark_ids: vec![None; n],
            covisibility: BTreeMap::new(),
        }
    }

    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    /// World-to-camera transform.
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn keypoint(&self, idx: usize) -> Option<&KeyPoint> {
        self.features.keypoints.get(idx)
    }

    pub fn descriptor(&self, idx: usize) -> Option<&Descriptor> {
        self.features.descriptors.get(idx)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn landmark(&self, feature_idx: usize) -> Option<LandmarkId> {
        self.landmark_ids.get(feature_idx).copied().flatten()
    }

    pub fn landmark_ids(&self) -> &[Option<LandmarkId>] {
        &self.landmark_ids
    }

    /// All associated landmarks with their feature indices.
    pub fn landmark_indices(&self) -> impl Iterator<Item = (usize, LandmarkId)> + '_ {
        self.landmark_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, lm)| lm.map(|id| (idx, id)))
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmark_ids.iter().filter(|lm| lm.is_some()).count()
    }

    pub(super) fn set_landmark(&mut self, feature_idx: usize, id: LandmarkId) {
        if let Some(slot) = self.landmark_ids.get_mut(feature_idx) {
            *slot = Some(id);
        }
    }

    pub(super) fn erase_landmark(&mut self, feature_idx: usize) -> Option<LandmarkId> {
        self.landmark_ids.get_mut(feature_idx).and_then(Option::take)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    pub fn covisibility_weight(&self, other: KeyFrameId) -> usize {
        self.covisibility.get(&other).copied().unwrap_or(0)
    }

    pub fn covisibility(&self) -> &BTreeMap<KeyFrameId, usize> {
        &self.covisibility
    }

    /// Sum of all covisibility weights.
    pub fn total_covisibility(&self) -> usize {
        self.covisibility.values().sum()
    }

    /// The `n` best covisible keyframes: heaviest first, ties by id.
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        let mut ordered: Vec<(KeyFrameId, usize)> =
            self.covisibility.iter().map(|(&id, &w)| (id, w)).collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.into_iter().take(n).map(|(id, _)| id).collect()
    }

    /// Returns true when a new edge was created.
    pub(super) fn increment_covisibility(&mut self, other: KeyFrameId) -> bool {
        if other == self.id {
            return false;
        }
        let w = self.covisibility.entry(other).or_insert(0);
        *w += 1;
        *w == 1
    }

    /// Returns true when the edge was removed.
    pub(super) fn decrement_covisibility(&mut self, other: KeyFrameId) -> bool {
        match self.covisibility.get_mut(&other) {
            Some(w) if *w <= 1 => {
                self.covisibility.remove(&other);
                true
            }
            Some(w) => {
                *w -= 1;
                false
            }
            None => false,
        }
    }

    pub(super) fn erase_covisibility(&mut self, other: KeyFrameId) -> bool {
        self.covisibility.remove(&other).is_some()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("num_features", &self.num_features())
            .field("num_landmarks", &self.num_landmarks())
            .field("covisibles", &self.covisibility.len())
            .finish()
    }
}
