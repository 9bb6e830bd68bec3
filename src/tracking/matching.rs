//! Descriptor matching: frame-to-frame for initialization, frame-to-map by
//! projection for tracking, and brute-force frame-to-landmarks for
//! relocalization and loop verification.

use std::collections::BTreeMap;

use nalgebra::{Vector2, Vector3};

use crate::geometry::SE3;
use crate::map::LandmarkId;
use crate::tracking::frame::{CameraModel, Descriptor, FeatureSet};
use crate::tracking::tracking_frame::{FeatureGrid, Frame};

/// Matching thresholds
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Stricter threshold
pub const NN_RATIO: f32 = 0.75; // Ratio test threshold (best/second_best)

/// Default search radius for projection matching, in pixels.
pub const PROJECTION_RADIUS: f64 = 15.0;

/// Number of differing bits between two descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// A landmark offered for matching.
#[derive(Debug, Clone)]
pub struct LandmarkCandidate {
    pub id: LandmarkId,
    pub position: Vector3<f64>,
    pub descriptor: Descriptor,
}

/// Best and second-best distances seen so far, with the best index.
#[derive(Debug, Clone, Copy)]
struct BestTwo {
    best: u32,
    second: u32,
    index: Option<usize>,
}

impl BestTwo {
    fn new() -> Self {
        Self {
            best: u32::MAX,
            second: u32::MAX,
            index: None,
        }
    }

    fn offer(&mut self, dist: u32, index: usize) {
        if dist < self.best {
            self.second = self.best;
            self.best = dist;
            self.index = Some(index);
        } else if dist < self.second {
            self.second = dist;
        }
    }

    /// Index of the best match if it passes the threshold and ratio test.
    fn accept(&self, threshold: u32) -> Option<usize> {
        if self.best > threshold {
            return None;
        }
        if self.second != u32::MAX && self.best as f32 > NN_RATIO * self.second as f32 {
            return None;
        }
        self.index
    }
}

/// Keep only the lowest-distance pairing per target index.
fn resolve_one_to_one(pairs: Vec<(usize, usize, u32)>) -> Vec<(usize, usize)> {
    let mut by_target: BTreeMap<usize, (usize, u32)> = BTreeMap::new();
    for (source, target, dist) in pairs {
        match by_target.get(&target) {
            Some(&(_, d)) if d <= dist => {}
            _ => {
                by_target.insert(target, (source, dist));
            }
        }
    }
    let mut out: Vec<(usize, usize)> = by_target
        .into_iter()
        .map(|(target, (source, _))| (source, target))
        .collect();
    out.sort_unstable();
    out
}

/// Match features of the initialization reference against the current
/// frame. Reference feature `i` is searched within `window` pixels of
/// `centers[i]`, usually where it was last matched.
///
/// Returns `(reference_idx, current_idx)` pairs, one-to-one.
pub fn search_for_initialization(
    reference: &FeatureSet,
    centers: &[Vector2<f64>],
    current: &FeatureSet,
    current_grid: &FeatureGrid,
    window: f64,
) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, (center, desc)) in centers.iter().zip(&reference.descriptors).enumerate() {
        let mut best = BestTwo::new();
        for j in current_grid.features_in_area(center.x, center.y, window) {
            if (current.keypoints[j].pt - center).norm() > window {
                continue;
            }
            best.offer(descriptor_distance(desc, &current.descriptors[j]), j);
        }
        if let Some(j) = best.accept(TH_LOW) {
            pairs.push((i, j, best.best));
        }
    }
    resolve_one_to_one(pairs)
}

/// Project landmarks into the frame and match them against nearby
/// unmatched features. Writes associations into `frame.landmark_matches`.
///
/// `pose` is the predicted camera pose (T_wc). Returns the number of new
/// associations.
pub fn search_by_projection(
    frame: &mut Frame,
    candidates: &[LandmarkCandidate],
    pose: &SE3,
    camera: &CameraModel,
    radius: f64,
) -> usize {
    let pose_cw = pose.inverse();
    let mut pairs = Vec::new();
    for (ci, cand) in candidates.iter().enumerate() {
        if frame.landmark_matches.contains(&Some(cand.id)) {
            continue;
        }
        let p_cam = pose_cw.transform_point(&cand.position);
        let Some(uv) = camera.project(&p_cam) else {
            continue;
        };
        if !camera.is_in_image(&uv, 0.0) {
            continue;
        }

        let mut best = BestTwo::new();
        for j in frame.grid.features_in_area(uv.x, uv.y, radius) {
            if frame.landmark_matches[j].is_some() {
                continue;
            }
            if (frame.features.keypoints[j].pt - uv).norm() > radius {
                continue;
            }
            best.offer(descriptor_distance(&cand.descriptor, &frame.features.descriptors[j]), j);
        }
        if let Some(j) = best.accept(TH_HIGH) {
            pairs.push((ci, j, best.best));
        }
    }

    let matched = resolve_one_to_one(pairs);
    for &(ci, j) in &matched {
        frame.landmark_matches[j] = Some(candidates[ci].id);
    }
    matched.len()
}

/// Brute-force match every landmark against all features.
///
/// Returns `(feature_idx, candidate_idx)` pairs, one-to-one.
pub fn search_by_descriptor(
    features: &FeatureSet,
    candidates: &[LandmarkCandidate],
) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (ci, cand) in candidates.iter().enumerate() {
        let mut best = BestTwo::new();
        for (j, desc) in features.descriptors.iter().enumerate() {
            best.offer(descriptor_distance(&cand.descriptor, desc), j);
        }
        if let Some(j) = best.accept(TH_LOW) {
            pairs.push((ci, j, best.best));
        }
    }
    resolve_one_to_one(pairs)
        .into_iter()
        .map(|(ci, j)| (j, ci))
        .collect()
}
