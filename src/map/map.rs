//! Map - Container for KeyFrames and Landmarks.
//!
//! The Map is the central data structure that holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - Landmarks (3D points) with their observations
//! - Covisibility relationships between KeyFrames
//! - A voxel index over landmark positions and a place-recognition index
//!   over keyframe signatures
//!
//! Every mutation keeps two invariants:
//! - each landmark is observed by at least one keyframe of the map
//! - each covisibility edge joins two keyframes sharing at least one
//!   landmark, with weight equal to the shared count
//!
//! Insertions respect the configured ceilings (keyframes, landmarks,
//! estimated memory). When a ceiling would be exceeded the weakest keyframe
//! is culled first; if that does not free headroom the insertion fails with
//! [`MapError::CapacityExceeded`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::debug;

use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, FeatureSet};
use crate::tracking::matching::descriptor_distance;
use crate::vocabulary::BowVector;

use super::keyframe::KeyFrame;
use super::keyframe_db::{Candidate, KeyFrameDatabase};
use super::landmark::Landmark;
use super::spatial_index::SpatialIndex;
use super::types::{KeyFrameId, LandmarkId};
use super::MapError;

/// Longest map identifier kept.
pub const MAX_MAP_ID_LEN: usize = 63;

/// Approximate fixed cost of one keyframe record, excluding features.
const KEYFRAME_OVERHEAD_BYTES: usize = 512;
/// Keypoint + descriptor + association slot.
const FEATURE_BYTES: usize = 40 + 32 + 16;
const LANDMARK_OVERHEAD_BYTES: usize = 160;
const OBSERVATION_BYTES: usize = 48;
/// One direction of a covisibility edge.
const EDGE_BYTES: usize = 16;

fn keyframe_bytes(kf: &KeyFrame) -> usize {
    KEYFRAME_OVERHEAD_BYTES
        + kf.num_features() * FEATURE_BYTES
        + kf.bow_vector.len() * 16
        + kf.covisibility().len() * EDGE_BYTES
}

fn landmark_bytes(lm: &Landmark) -> usize {
    LANDMARK_OVERHEAD_BYTES + lm.num_observations() * OBSERVATION_BYTES
}

/// Resource ceilings applied to insertions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapLimits {
    pub max_keyframes: usize,
    pub max_landmarks: usize,
    pub memory_limit_bytes: usize,
}

impl Default for MapLimits {
    fn default() -> Self {
        Self {
            max_keyframes: 500,
            max_landmarks: 50_000,
            memory_limit_bytes: 512 * 1024 * 1024,
        }
    }
}

/// The SLAM map containing KeyFrames and Landmarks.
#[derive(Clone)]
pub struct Map {
    id: String,
    creation_timestamp: f64,
    version: u64,

    keyframes: BTreeMap<KeyFrameId, KeyFrame>,
    landmarks: BTreeMap<LandmarkId, Landmark>,

    next_kf_id: u64,
    next_lm_id: u64,

    /// First keyframe of the map; never culled.
    origin: Option<KeyFrameId>,

    spatial_index: SpatialIndex,
    keyframe_db: KeyFrameDatabase,
    limits: MapLimits,
    /// Running total behind [`Map::memory_usage_bytes`].
    bytes: usize,
}

impl Map {
    pub fn new(id: impl Into<String>, creation_timestamp: f64, limits: MapLimits) -> Self {
        let mut id: String = id.into();
        if id.len() > MAX_MAP_ID_LEN {
            let mut cut = MAX_MAP_ID_LEN;
            while !id.is_char_boundary(cut) {
                cut -= 1;
            }
            id.truncate(cut);
        }
        Self {
            id,
            creation_timestamp,
            version: 0,
            keyframes: BTreeMap::new(),
            landmarks: BTreeMap::new(),
            next_kf_id: 0,
            next_lm_id: 0,
            origin: None,
            spatial_index: SpatialIndex::default(),
            keyframe_db: KeyFrameDatabase::new(),
            limits,
            bytes: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creation_timestamp(&self) -> f64 {
        self.creation_timestamp
    }

    /// Incremented by every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    pub fn limits(&self) -> &MapLimits {
        &self.limits
    }

    /// New ceilings apply to future insertions only.
    pub fn set_limits(&mut self, limits: MapLimits) {
        self.limits = limits;
    }

    pub fn origin(&self) -> Option<KeyFrameId> {
        self.origin
    }

    pub(crate) fn next_ids(&self) -> (u64, u64) {
        (self.next_kf_id, self.next_lm_id)
    }

    pub(crate) fn set_next_ids(&mut self, next_kf: u64, next_lm: u64) {
        self.next_kf_id = self.next_kf_id.max(next_kf);
        self.next_lm_id = self.next_lm_id.max(next_lm);
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a keyframe, culling the weakest keyframe first if a ceiling
    /// would be exceeded.
    pub fn insert_keyframe(
        &mut self,
        timestamp: f64,
        pose: SE3,
        features: Arc<FeatureSet>,
        bow_vector: BowVector,
    ) -> Result<KeyFrameId, MapError> {
        let added_bytes = KEYFRAME_OVERHEAD_BYTES + features.len() * FEATURE_BYTES;
        self.ensure_headroom(1, 0, added_bytes)?;

        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframe_db.add(id, bow_vector.clone());
        let kf = KeyFrame::new(id, timestamp, pose, features, bow_vector);
        self.bytes += keyframe_bytes(&kf);
        self.keyframes.insert(id, kf);
        if self.origin.is_none() {
            self.origin = Some(id);
        }
        self.touch();
        Ok(id)
    }

    /// Insert a keyframe with a fixed id and no associations (map loading).
    pub(crate) fn restore_keyframe(&mut self, kf: KeyFrame) {
        let id = kf.id;
        self.next_kf_id = self.next_kf_id.max(id.0 + 1);
        self.keyframe_db.add(id, kf.bow_vector.clone());
        self.bytes += keyframe_bytes(&kf);
        self.keyframes.insert(id, kf);
        if self.origin.map_or(true, |o| id < o) {
            self.origin = Some(id);
        }
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    /// KeyFrames in id (insertion) order.
    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.keyframes.keys().copied()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn contains_keyframe(&self, id: KeyFrameId) -> bool {
        self.keyframes.contains_key(&id)
    }

    /// Most recently inserted keyframe.
    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.keyframes.keys().next_back().copied()
    }

    pub fn set_keyframe_pose(&mut self, id: KeyFrameId, pose: SE3) -> Result<(), MapError> {
        let kf = self
            .keyframes
            .get_mut(&id)
            .ok_or(MapError::KeyFrameNotFound(id))?;
        kf.pose = pose;
        self.touch();
        Ok(())
    }

    /// Remove a keyframe with all its associations. Landmarks left without
    /// observers are removed too.
    pub fn remove_keyframe(&mut self, id: KeyFrameId) -> Result<KeyFrame, MapError> {
        let mut kf = self
            .keyframes
            .remove(&id)
            .ok_or(MapError::KeyFrameNotFound(id))?;

        self.bytes -= keyframe_bytes(&kf);
        for other in kf.covisibility().keys() {
            if let Some(other_kf) = self.keyframes.get_mut(other) {
                if other_kf.erase_covisibility(id) {
                    self.bytes -= EDGE_BYTES;
                }
            }
        }
        let associations: Vec<(usize, LandmarkId)> = kf.landmark_indices().collect();
        for (idx, lm_id) in associations {
            kf.erase_landmark(idx);
            let orphaned = match self.landmarks.get_mut(&lm_id) {
                Some(lm) => {
                    if lm.observations.remove(&id).is_some() {
                        self.bytes -= OBSERVATION_BYTES;
                    }
                    lm.observations.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.drop_landmark(lm_id);
            }
        }
        self.keyframe_db.erase(id);

        if self.origin == Some(id) {
            self.origin = self.keyframes.keys().next().copied();
        }
        self.touch();
        Ok(kf)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a landmark. It must be associated with at least one keyframe
    /// (see [`Map::associate`]) before the map is committed.
    pub fn insert_landmark(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf: KeyFrameId,
    ) -> Result<LandmarkId, MapError> {
        if !self.keyframes.contains_key(&first_kf) {
            return Err(MapError::KeyFrameNotFound(first_kf));
        }
        self.ensure_headroom_protecting(0, 1, LANDMARK_OVERHEAD_BYTES, &[first_kf])?;

        let id = LandmarkId::new(self.next_lm_id);
        self.next_lm_id += 1;
        self.spatial_index.insert(id, position);
        let lm = Landmark::new(id, position, descriptor, first_kf);
        self.bytes += landmark_bytes(&lm);
        self.landmarks.insert(id, lm);
        self.touch();
        Ok(id)
    }

    /// Insert a landmark with a fixed id and no observations (map loading).
    pub(crate) fn restore_landmark(&mut self, mut lm: Landmark) {
        lm.observations.clear();
        self.next_lm_id = self.next_lm_id.max(lm.id.0 + 1);
        self.spatial_index.insert(lm.id, lm.position);
        self.bytes += landmark_bytes(&lm);
        self.landmarks.insert(lm.id, lm);
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    /// Mutable access for statistics and descriptor updates. Position changes
    /// go through [`Map::set_landmark_position`].
    pub fn landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        self.landmarks.get_mut(&id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn landmark_ids(&self) -> impl Iterator<Item = LandmarkId> + '_ {
        self.landmarks.keys().copied()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn set_landmark_position(
        &mut self,
        id: LandmarkId,
        position: Vector3<f64>,
    ) -> Result<(), MapError> {
        let lm = self
            .landmarks
            .get_mut(&id)
            .ok_or(MapError::LandmarkNotFound(id))?;
        let old = lm.position;
        lm.position = position;
        self.spatial_index.update(id, &old, position);
        self.touch();
        Ok(())
    }

    /// Remove a landmark and every association to it.
    pub fn remove_landmark(&mut self, id: LandmarkId) -> Result<Landmark, MapError> {
        let observers: Vec<(KeyFrameId, usize)> = self
            .landmarks
            .get(&id)
            .ok_or(MapError::LandmarkNotFound(id))?
            .observations
            .iter()
            .map(|(&kf, &idx)| (kf, idx))
            .collect();

        for (i, &(kf_id, idx)) in observers.iter().enumerate() {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_landmark(idx);
            }
            for &(other, _) in &observers[i + 1..] {
                self.decrement_pair(kf_id, other);
            }
        }
        let lm = self
            .drop_landmark(id)
            .ok_or(MapError::LandmarkNotFound(id))?;
        self.touch();
        Ok(lm)
    }

    /// Remove a landmark from storage and the spatial index only.
    fn drop_landmark(&mut self, id: LandmarkId) -> Option<Landmark> {
        let lm = self.landmarks.remove(&id)?;
        self.spatial_index.remove(id, &lm.position);
        self.bytes -= landmark_bytes(&lm);
        Some(lm)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ Landmark)
    // ─────────────────────────────────────────────────────────────────────────

    /// Link feature `feature_idx` of `kf_id` to `lm_id` and update
    /// covisibility with the landmark's other observers.
    ///
    /// Returns `Ok(false)` when the feature is already associated or the
    /// keyframe already observes the landmark through another feature.
    pub fn associate(
        &mut self,
        kf_id: KeyFrameId,
        feature_idx: usize,
        lm_id: LandmarkId,
    ) -> Result<bool, MapError> {
        let kf = self
            .keyframes
            .get(&kf_id)
            .ok_or(MapError::KeyFrameNotFound(kf_id))?;
        if feature_idx >= kf.num_features() {
            return Err(MapError::FeatureOutOfRange {
                keyframe: kf_id,
                index: feature_idx,
            });
        }
        let lm = self
            .landmarks
            .get(&lm_id)
            .ok_or(MapError::LandmarkNotFound(lm_id))?;
        if kf.landmark(feature_idx).is_some() || lm.is_observed_by(kf_id) {
            return Ok(false);
        }

        let existing: Vec<KeyFrameId> = lm.observations.keys().copied().collect();
        for other in existing {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                if other_kf.increment_covisibility(kf_id) {
                    self.bytes += EDGE_BYTES;
                }
            }
            if let Some(this_kf) = self.keyframes.get_mut(&kf_id) {
                if this_kf.increment_covisibility(other) {
                    self.bytes += EDGE_BYTES;
                }
            }
        }
        if let Some(lm) = self.landmarks.get_mut(&lm_id) {
            lm.observations.insert(kf_id, feature_idx);
            self.bytes += OBSERVATION_BYTES;
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_landmark(feature_idx, lm_id);
        }
        self.touch();
        Ok(true)
    }

    /// Remove the association of one keyframe feature. A landmark left
    /// without observers is removed.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<LandmarkId> {
        let lm_id = self.keyframes.get_mut(&kf_id)?.erase_landmark(feature_idx)?;
        let others: Vec<KeyFrameId> = match self.landmarks.get_mut(&lm_id) {
            Some(lm) => {
                if lm.observations.remove(&kf_id).is_some() {
                    self.bytes -= OBSERVATION_BYTES;
                }
                lm.observations.keys().copied().collect()
            }
            None => Vec::new(),
        };
        for other in &others {
            self.decrement_pair(kf_id, *other);
        }
        if others.is_empty() {
            self.drop_landmark(lm_id);
        }
        self.touch();
        Some(lm_id)
    }

    fn decrement_pair(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&a) {
            if kf.decrement_covisibility(b) {
                self.bytes -= EDGE_BYTES;
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            if kf.decrement_covisibility(a) {
                self.bytes -= EDGE_BYTES;
            }
        }
    }

    /// Merge `duplicate` into `keep`: observations of the duplicate move to
    /// the kept landmark unless that keyframe already observes it, then the
    /// duplicate is removed.
    pub fn replace_landmark(
        &mut self,
        duplicate: LandmarkId,
        keep: LandmarkId,
    ) -> Result<(), MapError> {
        if duplicate == keep {
            return Ok(());
        }
        if !self.landmarks.contains_key(&keep) {
            return Err(MapError::LandmarkNotFound(keep));
        }
        let removed = self.remove_landmark(duplicate)?;
        for (&kf_id, &idx) in &removed.observations {
            // Slots were cleared by the removal; re-link them to `keep`.
            self.associate(kf_id, idx, keep)?;
        }
        if let Some(lm) = self.landmarks.get_mut(&keep) {
            lm.increase_visible(removed.visible_count);
            lm.increase_found(removed.found_count);
        }
        Ok(())
    }

    /// Pick the observation descriptor with the smallest median distance to
    /// the other observations.
    pub fn update_landmark_descriptor(&mut self, id: LandmarkId) {
        let Some(lm) = self.landmarks.get(&id) else {
            return;
        };
        let descs: Vec<Descriptor> = lm
            .observations
            .iter()
            .filter_map(|(kf, &idx)| self.keyframes.get(kf)?.descriptor(idx).copied())
            .collect();
        if descs.is_empty() {
            return;
        }

        let mut best = (u32::MAX, 0usize);
        for (i, a) in descs.iter().enumerate() {
            let mut dists: Vec<u32> = descs.iter().map(|b| descriptor_distance(a, b)).collect();
            dists.sort_unstable();
            let median = dists[(dists.len() - 1) / 2];
            if median < best.0 {
                best = (median, i);
            }
        }
        let chosen = descs[best.1];
        let centers: Vec<Vector3<f64>> = lm
            .observations
            .keys()
            .filter_map(|kf| self.keyframes.get(kf).map(|k| k.camera_center()))
            .collect();
        if let Some(lm) = self.landmarks.get_mut(&id) {
            lm.descriptor = chosen;
            lm.update_normal(centers.iter());
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// The `n` keyframes sharing the most landmarks with `kf_id`.
    pub fn local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.best_covisibles(n))
            .unwrap_or_default()
    }

    /// Keyframes within `hops` covisibility edges of `kf_id`, including it.
    pub fn covisible_within_hops(&self, kf_id: KeyFrameId, hops: usize) -> BTreeSet<KeyFrameId> {
        let mut seen = BTreeSet::new();
        if !self.keyframes.contains_key(&kf_id) {
            return seen;
        }
        let mut queue = VecDeque::from([(kf_id, 0usize)]);
        seen.insert(kf_id);
        while let Some((id, depth)) = queue.pop_front() {
            if depth == hops {
                continue;
            }
            if let Some(kf) = self.keyframes.get(&id) {
                for &next in kf.covisibility().keys() {
                    if seen.insert(next) {
                        queue.push_back((next, depth + 1));
                    }
                }
            }
        }
        seen
    }

    /// Landmarks observed by any keyframe of `kf_ids`, sorted by id.
    pub fn landmarks_of(&self, kf_ids: &BTreeSet<KeyFrameId>) -> Vec<LandmarkId> {
        let set: BTreeSet<LandmarkId> = kf_ids
            .iter()
            .filter_map(|id| self.keyframes.get(id))
            .flat_map(|kf| kf.landmark_indices().map(|(_, lm)| lm))
            .collect();
        set.into_iter().collect()
    }

    /// Landmarks visible from the covisibility neighborhood of `kf_id`.
    pub fn landmarks_in_neighborhood(&self, kf_id: KeyFrameId, hops: usize) -> Vec<LandmarkId> {
        self.landmarks_of(&self.covisible_within_hops(kf_id, hops))
    }

    pub fn landmarks_within_radius(&self, center: &Vector3<f64>, radius: f64) -> Vec<LandmarkId> {
        self.spatial_index.query_radius(center, radius)
    }

    /// The `k` keyframes whose camera centers are closest to `pose`.
    pub fn nearest_keyframes(&self, pose: &SE3, k: usize) -> Vec<KeyFrameId> {
        let mut by_dist: Vec<(f64, KeyFrameId)> = self
            .keyframes
            .values()
            .map(|kf| ((kf.camera_center() - pose.translation).norm_squared(), kf.id))
            .collect();
        by_dist.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        by_dist.into_iter().take(k).map(|(_, id)| id).collect()
    }

    /// Place-recognition query over keyframe signatures.
    pub fn place_candidates(
        &self,
        bow: &BowVector,
        exclude: &BTreeSet<KeyFrameId>,
        min_score: f64,
        max_results: usize,
    ) -> Vec<Candidate> {
        self.keyframe_db
            .detect_candidates(bow, exclude, min_score, max_results)
    }

    /// All covisibility edges `(a, b, weight)` with `a < b`.
    pub fn covisibility_edges(&self) -> Vec<(KeyFrameId, KeyFrameId, usize)> {
        self.keyframes
            .values()
            .flat_map(|kf| {
                kf.covisibility()
                    .iter()
                    .filter(move |(&other, _)| kf.id < other)
                    .map(move |(&other, &w)| (kf.id, other, w))
            })
            .collect()
    }

    /// Axis-aligned bounds of landmark positions, or of keyframe centers
    /// when there are no landmarks.
    pub fn bounding_box(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let mut points: Box<dyn Iterator<Item = Vector3<f64>>> = if self.landmarks.is_empty() {
            Box::new(self.keyframes.values().map(|kf| kf.camera_center()))
        } else {
            Box::new(self.landmarks.values().map(|lm| lm.position))
        };
        let first = points.next()?;
        Some(points.fold((first, first), |(lo, hi), p| (lo.inf(&p), hi.sup(&p))))
    }

    pub fn center(&self) -> Vector3<f64> {
        self.bounding_box()
            .map(|(lo, hi)| (lo + hi) * 0.5)
            .unwrap_or_else(Vector3::zeros)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resources
    // ─────────────────────────────────────────────────────────────────────────

    /// Estimated heap footprint in bytes, maintained on every mutation.
    pub fn memory_usage_bytes(&self) -> usize {
        self.bytes
    }

    /// Full recount of the estimate; checked against the running total.
    fn recount_bytes(&self) -> usize {
        self.keyframes.values().map(keyframe_bytes).sum::<usize>()
            + self.landmarks.values().map(landmark_bytes).sum::<usize>()
    }

    fn ensure_headroom(
        &mut self,
        new_keyframes: usize,
        new_landmarks: usize,
        new_bytes: usize,
    ) -> Result<(), MapError> {
        self.ensure_headroom_protecting(new_keyframes, new_landmarks, new_bytes, &[])
    }

    /// Check the ceilings for an insertion, culling the keyframe with the
    /// lowest total covisibility weight once if needed.
    fn ensure_headroom_protecting(
        &mut self,
        new_keyframes: usize,
        new_landmarks: usize,
        new_bytes: usize,
        protected: &[KeyFrameId],
    ) -> Result<(), MapError> {
        if self.exceeded(new_keyframes, new_landmarks, new_bytes).is_none() {
            return Ok(());
        }
        if let Some(victim) = self.weakest_keyframe(protected) {
            let landmarks_before = self.num_landmarks();
            self.remove_keyframe(victim)?;
            debug!(
                "[Map] Culled {} for headroom ({} landmarks released)",
                victim,
                landmarks_before - self.num_landmarks()
            );
        }
        match self.exceeded(new_keyframes, new_landmarks, new_bytes) {
            None => Ok(()),
            Some((resource, limit)) => Err(MapError::CapacityExceeded { resource, limit }),
        }
    }

    fn exceeded(
        &self,
        new_keyframes: usize,
        new_landmarks: usize,
        new_bytes: usize,
    ) -> Option<(&'static str, usize)> {
        if new_keyframes > 0 && self.num_keyframes() + new_keyframes > self.limits.max_keyframes {
            return Some(("keyframe", self.limits.max_keyframes));
        }
        if new_landmarks > 0 && self.num_landmarks() + new_landmarks > self.limits.max_landmarks {
            return Some(("landmark", self.limits.max_landmarks));
        }
        if self.memory_usage_bytes() + new_bytes > self.limits.memory_limit_bytes {
            return Some(("memory", self.limits.memory_limit_bytes));
        }
        None
    }

    /// Cull candidate: lowest total covisibility weight, oldest first on
    /// ties. The origin and the most recent keyframe are never chosen.
    fn weakest_keyframe(&self, protected: &[KeyFrameId]) -> Option<KeyFrameId> {
        let newest = self.last_keyframe_id();
        self.keyframes
            .values()
            .filter(|kf| Some(kf.id) != self.origin && Some(kf.id) != newest)
            .filter(|kf| !protected.contains(&kf.id))
            .min_by(|a, b| {
                a.total_covisibility()
                    .cmp(&b.total_covisibility())
                    .then(a.id.cmp(&b.id))
            })
            .map(|kf| kf.id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invariants
    // ─────────────────────────────────────────────────────────────────────────

    /// Verify the association and covisibility invariants.
    pub fn check_invariants(&self) -> Result<(), MapError> {
        let violation = |msg: String| Err(MapError::InvariantViolation(msg));

        let mut shared: BTreeMap<(KeyFrameId, KeyFrameId), usize> = BTreeMap::new();
        for lm in self.landmarks.values() {
            if lm.observations.is_empty() {
                return violation(format!("{} has no observers", lm.id));
            }
            for (&kf_id, &idx) in &lm.observations {
                let Some(kf) = self.keyframes.get(&kf_id) else {
                    return violation(format!("{} observed by missing {}", lm.id, kf_id));
                };
                if kf.landmark(idx) != Some(lm.id) {
                    return violation(format!("{} slot {} does not point at {}", kf_id, idx, lm.id));
                }
            }
            let observers: Vec<KeyFrameId> = lm.observations.keys().copied().collect();
            for (i, &a) in observers.iter().enumerate() {
                for &b in &observers[i + 1..] {
                    *shared.entry((a, b)).or_insert(0) += 1;
                }
            }
        }

        for kf in self.keyframes.values() {
            for (idx, lm_id) in kf.landmark_indices() {
                match self.landmarks.get(&lm_id) {
                    Some(lm) if lm.observations.get(&kf.id) == Some(&idx) => {}
                    _ => return violation(format!("{} slot {} dangles to {}", kf.id, idx, lm_id)),
                }
            }
            for (&other, &w) in kf.covisibility() {
                let key = if kf.id < other { (kf.id, other) } else { (other, kf.id) };
                if shared.get(&key).copied().unwrap_or(0) != w {
                    return violation(format!("edge {}-{} has weight {}", kf.id, other, w));
                }
            }
        }
        for (&(a, b), &w) in &shared {
            let kf_a = self.keyframes.get(&a).map(|kf| kf.covisibility_weight(b));
            if kf_a != Some(w) {
                return violation(format!("missing edge {}-{}", a, b));
            }
        }
        if self.spatial_index.len() != self.landmarks.len() {
            return violation("spatial index out of sync".to_string());
        }
        let recount = self.recount_bytes();
        if recount != self.bytes {
            return violation(format!("memory estimate {} != recount {}", self.bytes, recount));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("num_keyframes", &self.keyframes.len())
            .field("num_landmarks", &self.landmarks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::KeyPoint;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    fn features(n: usize) -> Arc<FeatureSet> {
        Arc::new(FeatureSet {
            keypoints: (0..n)
                .map(|i| KeyPoint {
                    pt: Vector2::new(i as f64, i as f64),
                    angle: 0.0,
                    response: 1.0,
                })
                .collect(),
            descriptors: (0..n).map(|i| [i as u8; 32]).collect(),
        })
    }

    fn add_kf(map: &mut Map, x: f64) -> KeyFrameId {
        let pose = SE3::from_params(&Vector3::zeros(), &Vector3::new(x, 0.0, 0.0));
        map.insert_keyframe(x, pose, features(10), BowVector::new())
            .unwrap()
    }

    fn add_lm(map: &mut Map, pos: Vector3<f64>, observers: &[(KeyFrameId, usize)]) -> LandmarkId {
        let id = map.insert_landmark(pos, [0u8; 32], observers[0].0).unwrap();
        for &(kf, idx) in observers {
            assert!(map.associate(kf, idx, id).unwrap());
        }
        id
    }

    fn test_map() -> Map {
        Map::new("test", 0.0, MapLimits::default())
    }

    #[test]
    fn test_associate_builds_covisibility() {
        let mut map = test_map();
        let kf0 = add_kf(&mut map, 0.0);
        let kf1 = add_kf(&mut map, 1.0);
        let lm = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 0), (kf1, 3)]);

        assert_eq!(map.landmark(lm).unwrap().num_observations(), 2);
        assert_eq!(map.keyframe(kf1).unwrap().landmark(3), Some(lm));
        assert_eq!(map.keyframe(kf0).unwrap().covisibility_weight(kf1), 1);
        assert_eq!(map.keyframe(kf1).unwrap().covisibility_weight(kf0), 1);

        // A keyframe observes a landmark at most once.
        assert!(!map.associate(kf1, 4, lm).unwrap());
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_associate_rejects_bad_references() {
        let mut map = test_map();
        let kf0 = add_kf(&mut map, 0.0);
        let lm = map.insert_landmark(Vector3::zeros(), [0u8; 32], kf0).unwrap();
        assert!(matches!(
            map.associate(kf0, 99, lm),
            Err(MapError::FeatureOutOfRange { .. })
        ));
        assert!(matches!(
            map.associate(KeyFrameId(9), 0, lm),
            Err(MapError::KeyFrameNotFound(_))
        ));
        assert!(matches!(
            map.insert_landmark(Vector3::zeros(), [0u8; 32], KeyFrameId(9)),
            Err(MapError::KeyFrameNotFound(_))
        ));
    }

    #[test]
    fn test_disassociate_removes_orphans() {
        let mut map = test_map();
        let kf0 = add_kf(&mut map, 0.0);
        let kf1 = add_kf(&mut map, 1.0);
        let lm = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 0), (kf1, 0)]);

        assert_eq!(map.disassociate(kf0, 0), Some(lm));
        assert_eq!(map.keyframe(kf0).unwrap().covisibility_weight(kf1), 0);
        assert!(map.landmark(lm).is_some());

        assert_eq!(map.disassociate(kf1, 0), Some(lm));
        assert!(map.landmark(lm).is_none());
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_keyframe_keeps_invariants() {
        let mut map = test_map();
        let kf0 = add_kf(&mut map, 0.0);
        let kf1 = add_kf(&mut map, 1.0);
        let kf2 = add_kf(&mut map, 2.0);
        let shared = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 0), (kf1, 0), (kf2, 0)]);
        let only_kf1 = add_lm(&mut map, Vector3::new(1.0, 0.0, 5.0), &[(kf1, 1)]);

        map.remove_keyframe(kf1).unwrap();
        assert!(map.landmark(only_kf1).is_none());
        assert_eq!(map.landmark(shared).unwrap().num_observations(), 2);
        assert_eq!(map.keyframe(kf0).unwrap().covisibility_weight(kf1), 0);
        assert_eq!(map.keyframe(kf0).unwrap().covisibility_weight(kf2), 1);
        map.check_invariants().unwrap();

        assert!(matches!(map.remove_keyframe(kf1), Err(MapError::KeyFrameNotFound(_))));
    }

    #[test]
    fn test_remove_landmark_updates_covisibility() {
        let mut map = test_map();
        let kf0 = add_kf(&mut map, 0.0);
        let kf1 = add_kf(&mut map, 1.0);
        let a = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 0), (kf1, 0)]);
        add_lm(&mut map, Vector3::new(1.0, 0.0, 5.0), &[(kf0, 1), (kf1, 1)]);
        assert_eq!(map.keyframe(kf0).unwrap().covisibility_weight(kf1), 2);

        map.remove_landmark(a).unwrap();
        assert_eq!(map.keyframe(kf0).unwrap().covisibility_weight(kf1), 1);
        assert_eq!(map.keyframe(kf0).unwrap().landmark(0), None);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_replace_landmark_merges_observers() {
        let mut map = test_map();
        let kf0 = add_kf(&mut map, 0.0);
        let kf1 = add_kf(&mut map, 1.0);
        let kf2 = add_kf(&mut map, 2.0);
        let keep = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 0), (kf1, 0)]);
        let dup = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.1), &[(kf1, 5), (kf2, 2)]);

        map.replace_landmark(dup, keep).unwrap();
        assert!(map.landmark(dup).is_none());
        let lm = map.landmark(keep).unwrap();
        assert_eq!(lm.num_observations(), 3);
        assert_eq!(map.keyframe(kf2).unwrap().landmark(2), Some(keep));
        // kf1 already observed `keep`; its duplicate slot is released.
        assert_eq!(map.keyframe(kf1).unwrap().landmark(5), None);
        assert_eq!(map.keyframe(kf0).unwrap().covisibility_weight(kf2), 1);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_keyframe_ceiling_culls_weakest() {
        let limits = MapLimits {
            max_keyframes: 3,
            ..MapLimits::default()
        };
        let mut map = Map::new("small", 0.0, limits);
        let kf0 = add_kf(&mut map, 0.0);
        let kf1 = add_kf(&mut map, 1.0);
        let kf2 = add_kf(&mut map, 2.0);
        add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 0), (kf2, 0)]);

        let kf3 = add_kf(&mut map, 3.0);
        assert_eq!(map.num_keyframes(), 3);
        assert!(map.keyframe(kf1).is_none());
        assert!(map.keyframe(kf0).is_some());
        assert!(map.keyframe(kf3).is_some());
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_ceiling_without_candidates_fails() {
        let limits = MapLimits {
            max_keyframes: 2,
            ..MapLimits::default()
        };
        let mut map = Map::new("tiny", 0.0, limits);
        add_kf(&mut map, 0.0);
        add_kf(&mut map, 1.0);
        // Only the origin and the newest keyframe exist: nothing may be culled.
        let err = map
            .insert_keyframe(2.0, SE3::identity(), features(4), BowVector::new())
            .unwrap_err();
        assert!(matches!(err, MapError::CapacityExceeded { resource: "keyframe", .. }));
        assert_eq!(map.num_keyframes(), 2);
    }

    #[test]
    fn test_memory_estimate_follows_mutations() {
        let mut map = test_map();
        assert_eq!(map.memory_usage_bytes(), 0);
        let kf0 = add_kf(&mut map, 0.0);
        let baseline = map.memory_usage_bytes();
        assert_eq!(baseline, KEYFRAME_OVERHEAD_BYTES + 10 * FEATURE_BYTES);

        let kf1 = add_kf(&mut map, 1.0);
        let kf2 = add_kf(&mut map, 2.0);
        let a = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 0), (kf1, 0), (kf2, 0)]);
        let b = add_lm(&mut map, Vector3::new(1.0, 0.0, 5.0), &[(kf1, 1), (kf2, 1)]);
        map.check_invariants().unwrap();
        assert_eq!(
            map.memory_usage_bytes(),
            3 * baseline + 2 * LANDMARK_OVERHEAD_BYTES + 5 * OBSERVATION_BYTES + 6 * EDGE_BYTES
        );

        map.replace_landmark(b, a).unwrap();
        map.check_invariants().unwrap();
        map.disassociate(kf2, 0);
        map.check_invariants().unwrap();
        map.remove_keyframe(kf1).unwrap();
        map.remove_keyframe(kf2).unwrap();
        map.check_invariants().unwrap();
        assert_eq!(map.num_landmarks(), 1);
        assert_eq!(
            map.memory_usage_bytes(),
            baseline + LANDMARK_OVERHEAD_BYTES + OBSERVATION_BYTES
        );
    }

    #[test]
    fn test_memory_ceiling_rejects_insertion() {
        let limits = MapLimits {
            memory_limit_bytes: KEYFRAME_OVERHEAD_BYTES + 10 * FEATURE_BYTES + LANDMARK_OVERHEAD_BYTES,
            ..MapLimits::default()
        };
        let mut map = Map::new("bytes", 0.0, limits);
        let kf0 = add_kf(&mut map, 0.0);
        add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 0)]);
        let err = map
            .insert_landmark(Vector3::new(1.0, 0.0, 5.0), [0u8; 32], kf0)
            .unwrap_err();
        assert!(matches!(err, MapError::CapacityExceeded { resource: "memory", .. }));
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_neighborhood_queries() {
        let mut map = test_map();
        let kfs: Vec<_> = (0..4).map(|i| add_kf(&mut map, i as f64)).collect();
        // Chain kf0 - kf1 - kf2 - kf3
        let mut lms = Vec::new();
        for i in 0..3 {
            let p = Vector3::new(i as f64, 0.0, 5.0);
            lms.push(add_lm(&mut map, p, &[(kfs[i], 0), (kfs[i + 1], 1)]));
        }

        let one_hop = map.covisible_within_hops(kfs[0], 1);
        assert_eq!(one_hop.into_iter().collect::<Vec<_>>(), vec![kfs[0], kfs[1]]);
        assert_eq!(map.covisible_within_hops(kfs[0], 2).len(), 3);
        assert_eq!(map.landmarks_in_neighborhood(kfs[0], 1), vec![lms[0], lms[1]]);

        let radius = map.landmarks_within_radius(&Vector3::new(0.0, 0.0, 5.0), 1.5);
        assert_eq!(radius, vec![lms[0], lms[1]]);

        let pose = SE3::from_params(&Vector3::zeros(), &Vector3::new(2.9, 0.0, 0.0));
        assert_eq!(map.nearest_keyframes(&pose, 2), vec![kfs[3], kfs[2]]);
        assert_eq!(map.local_keyframes(kfs[1], 5), vec![kfs[0], kfs[2]]);
    }

    #[test]
    fn test_bounding_box_and_center() {
        let mut map = test_map();
        assert!(map.bounding_box().is_none());
        let kf = add_kf(&mut map, 0.0);
        add_lm(&mut map, Vector3::new(-1.0, 2.0, 3.0), &[(kf, 0)]);
        add_lm(&mut map, Vector3::new(1.0, -2.0, 5.0), &[(kf, 1)]);
        let (lo, hi) = map.bounding_box().unwrap();
        assert_relative_eq!(lo, Vector3::new(-1.0, -2.0, 3.0));
        assert_relative_eq!(hi, Vector3::new(1.0, 2.0, 5.0));
        assert_relative_eq!(map.center(), Vector3::new(0.0, 0.0, 4.0));
    }

    #[test]
    fn test_set_landmark_position_moves_index_entry() {
        let mut map = test_map();
        let kf = add_kf(&mut map, 0.0);
        let lm = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf, 0)]);
        map.set_landmark_position(lm, Vector3::new(10.0, 0.0, 0.0)).unwrap();
        assert!(map.landmarks_within_radius(&Vector3::new(0.0, 0.0, 5.0), 1.0).is_empty());
        assert_eq!(map.landmarks_within_radius(&Vector3::new(10.0, 0.0, 0.0), 0.5), vec![lm]);
        map.check_invariants().unwrap();
    }

    #[test]
    fn test_version_increments_and_id_truncation() {
        let mut map = Map::new("x".repeat(100), 0.0, MapLimits::default());
        assert_eq!(map.id().len(), MAX_MAP_ID_LEN);
        let v0 = map.version();
        add_kf(&mut map, 0.0);
        assert!(map.version() > v0);
    }

    #[test]
    fn test_descriptor_update_picks_medoid() {
        let mut map = test_map();
        let kf0 = add_kf(&mut map, 0.0);
        let kf1 = add_kf(&mut map, 1.0);
        let kf2 = add_kf(&mut map, 2.0);
        // Descriptors are [i; 32] for feature i; two observers agree on 1.
        let lm = add_lm(&mut map, Vector3::new(0.0, 0.0, 5.0), &[(kf0, 9), (kf1, 1), (kf2, 1)]);
        map.update_landmark_descriptor(lm);
        let d = map.landmark(lm).unwrap().descriptor;
        assert_eq!(d, [1u8; 32]);
    }
}
