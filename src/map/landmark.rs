//! Landmark - A 3D point observed by KeyFrames.
//!
//! Each landmark tracks which KeyFrames observe it, maintains quality
//! metrics for culling decisions and a representative descriptor.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::tracking::frame::Descriptor;

use super::types::{KeyFrameId, LandmarkId};

/// Smoothing factor of the running reprojection error.
const REPROJECTION_EMA_ALPHA: f64 = 0.2;

#[derive(Clone)]
pub struct Landmark {
    pub id: LandmarkId,

    /// World position. Private so the map's spatial index stays in sync.
    pub(super) position: Vector3<f64>,

    pub descriptor: Descriptor,

    /// Observing KeyFrame → feature index in that KeyFrame.
    pub(super) observations: BTreeMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Times the landmark was predicted visible in a tracked frame.
    pub visible_count: u32,

    /// Times it was actually matched as an inlier.
    pub found_count: u32,

    /// Running mean of the reprojection error in pixels.
    pub reprojection_error: f64,

    /// KeyFrame that created this landmark.
    pub first_kf: KeyFrameId,
}

impl Landmark {
    pub fn new(
        id: LandmarkId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        first_kf: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: BTreeMap::new(),
            normal: Vector3::zeros(),
            visible_count: 1,
            found_count: 1,
            reprojection_error: 0.0,
            first_kf,
        }
    }

    pub fn position(&self) -> &Vector3<f64> {
        &self.position
    }

    pub fn observations(&self) -> &BTreeMap<KeyFrameId, usize> {
        &self.observations
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf: KeyFrameId) -> bool {
        self.observations.contains_key(&kf)
    }

    /// found / visible; 1.0 before the landmark was ever predicted visible.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count = self.visible_count.saturating_add(n);
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count = self.found_count.saturating_add(n);
    }

    /// Fold a new reprojection error sample into the running mean.
    pub fn record_reprojection_error(&mut self, error: f64) {
        if self.reprojection_error == 0.0 {
            self.reprojection_error = error;
        } else {
            self.reprojection_error += REPROJECTION_EMA_ALPHA * (error - self.reprojection_error);
        }
    }

    /// Recompute the mean viewing direction from observer centers.
    pub fn update_normal<'a>(&mut self, centers: impl Iterator<Item = &'a Vector3<f64>>) {
        let mut sum = Vector3::zeros();
        for c in centers {
            let dir = self.position - c;
            let n = dir.norm();
            if n > 1e-10 {
                sum += dir / n;
            }
        }
        let norm = sum.norm();
        if norm > 1e-10 {
            self.normal = sum / norm;
        }
    }
}

impl std::fmt::Debug for Landmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Landmark")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .finish()
    }
}
