//! Tracking `Frame` representation.
//!
//! A `Frame` is what the tracker operates on: the extracted features of one
//! camera image, a Bag-of-Words vector for place recognition and the
//! temporary associations of its features to map landmarks. It becomes a
//! `KeyFrame` only when the keyframe decision says so.

use std::sync::Arc;

use nalgebra::{Vector2, Vector3};

use crate::map::{LandmarkId, Map};
use crate::tracking::frame::{FeatureSet, KeyPoint};
use crate::vocabulary::BowVector;

/// Matched 2D-3D pairs of a frame, aligned by position.
#[derive(Debug, Clone, Default)]
pub struct Correspondences {
    /// Frame feature index of each pair.
    pub features: Vec<usize>,
    pub points: Vec<Vector3<f64>>,
    pub pixels: Vec<Vector2<f64>>,
}

impl Correspondences {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Spatial grid for constant-time feature lookup around a pixel.
///
/// The grid divides the image into `GRID_COLS x GRID_ROWS` cells; each cell
/// stores the indices of the features whose keypoints fall inside it.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// Row-major: `cells[row * grid_cols + col]`.
    cells: Vec<Vec<usize>>,
    cell_width_inv: f64,
    cell_height_inv: f64,
    grid_cols: usize,
    grid_rows: usize,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(keypoints: &[KeyPoint], img_width: f64, img_height: f64) -> Self {
        let cell_width_inv = Self::GRID_COLS as f64 / img_width.max(1.0);
        let cell_height_inv = Self::GRID_ROWS as f64 / img_height.max(1.0);

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS];
        for (idx, kp) in keypoints.iter().enumerate() {
            // Undistorted points may land slightly outside the image.
            let cx = ((kp.pt.x * cell_width_inv).max(0.0) as usize).min(Self::GRID_COLS - 1);
            let cy = ((kp.pt.y * cell_height_inv).max(0.0) as usize).min(Self::GRID_ROWS - 1);
            cells[cy * Self::GRID_COLS + cx].push(idx);
        }

        Self {
            cells,
            cell_width_inv,
            cell_height_inv,
            grid_cols: Self::GRID_COLS,
            grid_rows: Self::GRID_ROWS,
        }
    }

    /// Feature indices in the cells overlapping a square of half-size `r`
    /// around `(x, y)`. Exact radius filtering is left to the caller.
    pub fn features_in_area(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        let min_cx = ((x - r) * self.cell_width_inv).floor();
        let max_cx = ((x + r) * self.cell_width_inv).ceil();
        let min_cy = ((y - r) * self.cell_height_inv).floor();
        let max_cy = ((y + r) * self.cell_height_inv).ceil();
        if max_cx < 0.0 || max_cy < 0.0 {
            return Vec::new();
        }

        let min_cx = min_cx.max(0.0) as usize;
        let max_cx = (max_cx as usize).min(self.grid_cols - 1);
        let min_cy = min_cy.max(0.0) as usize;
        let max_cy = (max_cy as usize).min(self.grid_rows - 1);
        if min_cx > max_cx || min_cy > max_cy {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                candidates.extend(&self.cells[cy * self.grid_cols + cx]);
            }
        }
        candidates
    }
}

/// A frame being tracked (not yet a KeyFrame).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Timestamp in seconds.
    pub timestamp: f64,
    pub features: Arc<FeatureSet>,
    pub bow_vector: Option<BowVector>,
    /// `landmark_matches[i] = Some(id)` if feature `i` is associated.
    pub landmark_matches: Vec<Option<LandmarkId>>,
    pub grid: FeatureGrid,
}

impl Frame {
    pub fn new(timestamp: f64, features: FeatureSet, img_width: f64, img_height: f64) -> Self {
        let n = features.len();
        let grid = FeatureGrid::new(&features.keypoints, img_width, img_height);
        Self {
            timestamp,
            features: Arc::new(features),
            bow_vector: None,
            landmark_matches: vec![None; n],
            grid,
        }
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.features.keypoints
    }

    /// Number of features currently associated with a landmark.
    pub fn num_matched(&self) -> usize {
        self.landmark_matches.iter().filter(|m| m.is_some()).count()
    }

    pub fn clear_matches(&mut self) {
        self.landmark_matches.iter_mut().for_each(|m| *m = None);
    }

    /// Gather the matched landmarks that still exist in `map`.
    pub fn correspondences(&self, map: &Map) -> Correspondences {
        let mut out = Correspondences::default();
        for (idx, m) in self.landmark_matches.iter().enumerate() {
            let Some(lm) = m.and_then(|id| map.landmark(id)) else {
                continue;
            };
            out.features.push(idx);
            out.points.push(*lm.position());
            out.pixels.push(self.features.keypoints[idx].pt);
        }
        out
    }

    /// Drop the associations flagged as outliers. `inliers` is aligned with
    /// `corr`.
    pub fn retain_inliers(&mut self, corr: &Correspondences, inliers: &[bool]) {
        for (&idx, &inlier) in corr.features.iter().zip(inliers) {
            if !inlier {
                self.landmark_matches[idx] = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn kp(x: f64, y: f64) -> KeyPoint {
        KeyPoint {
            pt: Vector2::new(x, y),
            angle: 0.0,
            response: 1.0,
        }
    }

    #[test]
    fn test_grid_lookup() {
        let kps = vec![kp(10.0, 10.0), kp(600.0, 400.0), kp(15.0, 12.0), kp(-2.0, 5.0)];
        let grid = FeatureGrid::new(&kps, 640.0, 480.0);

        let mut near = grid.features_in_area(12.0, 11.0, 10.0);
        near.sort_unstable();
        assert_eq!(near, vec![0, 2, 3]);

        assert_eq!(grid.features_in_area(600.0, 400.0, 2.0), vec![1]);
        assert!(grid.features_in_area(-100.0, -100.0, 5.0).is_empty());
    }

    #[test]
    fn test_frame_matches() {
        let features = FeatureSet {
            keypoints: vec![kp(1.0, 1.0), kp(2.0, 2.0)],
            descriptors: vec![[0u8; 32]; 2],
        };
        let mut frame = Frame::new(0.5, features, 640.0, 480.0);
        assert_eq!(frame.num_matched(), 0);
        frame.landmark_matches[1] = Some(LandmarkId(7));
        assert_eq!(frame.num_matched(), 1);
        frame.clear_matches();
        assert_eq!(frame.num_matched(), 0);
    }

    #[test]
    fn test_correspondences_skip_missing_landmarks() {
        use crate::geometry::SE3;
        use crate::map::MapLimits;
        use nalgebra::Vector3;

        let features = FeatureSet {
            keypoints: vec![kp(1.0, 1.0), kp(2.0, 2.0), kp(3.0, 3.0)],
            descriptors: vec![[0u8; 32]; 3],
        };
        let mut map = Map::new("frame", 0.0, MapLimits::default());
        let kf = map
            .insert_keyframe(0.0, SE3::identity(), Arc::new(features.clone()), BowVector::new())
            .unwrap();
        let lm = map.insert_landmark(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], kf).unwrap();
        map.associate(kf, 0, lm).unwrap();

        let mut frame = Frame::new(1.0, features, 640.0, 480.0);
        frame.landmark_matches[1] = Some(lm);
        frame.landmark_matches[2] = Some(LandmarkId(99));
        let corr = frame.correspondences(&map);
        assert_eq!(corr.features, vec![1]);
        assert_eq!(corr.pixels[0], Vector2::new(2.0, 2.0));

        frame.retain_inliers(&corr, &[false]);
        assert_eq!(frame.landmark_matches[1], None);
        assert_eq!(frame.landmark_matches[2], Some(LandmarkId(99)));
    }
}
