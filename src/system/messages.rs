//! Inter-thread message types.
//!
//! These types are sent from tracking to the mapping worker over a bounded
//! channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::geometry::SE3;
use crate::map::LandmarkId;
use crate::tracking::frame::FeatureSet;
use crate::vocabulary::BowVector;

/// Per-landmark tracking statistics accumulated since the last keyframe.
///
/// Tracking never writes to the shared map; these are folded into the map
/// by the worker when the keyframe is committed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LandmarkStats {
    /// Frames in which the landmark was predicted to be visible.
    pub visible: u32,
    /// Frames in which it was matched as an inlier.
    pub found: u32,
    /// Sum of inlier reprojection errors (px).
    pub error_sum: f64,
}

impl LandmarkStats {
    pub fn merge(&mut self, other: &LandmarkStats) {
        self.visible += other.visible;
        self.found += other.found;
        self.error_sum += other.error_sum;
    }

    pub fn mean_error(&self) -> Option<f64> {
        (self.found > 0).then(|| self.error_sum / self.found as f64)
    }
}

/// Message sent from tracking to the mapping worker when a new keyframe is
/// created.
///
/// Contains all the data the worker needs to:
/// 1. Insert the keyframe into the map
/// 2. Associate the landmark matches found by tracking
/// 3. Triangulate new landmarks from unmatched features
#[derive(Debug, Clone)]
pub struct NewKeyFrameMsg {
    /// Map epoch the frame was tracked against; stale messages are dropped.
    pub epoch: u64,

    pub timestamp: f64,

    /// Pose estimate from tracking (T_wc).
    pub pose: SE3,

    pub features: Arc<FeatureSet>,

    pub bow_vector: BowVector,

    /// `matches[i] = Some(lm)` if feature i was matched as an inlier.
    pub matches: Vec<Option<LandmarkId>>,

    pub landmark_stats: BTreeMap<LandmarkId, LandmarkStats>,
}

impl NewKeyFrameMsg {
    pub fn num_matched(&self) -> usize {
        self.matches.iter().filter(|m| m.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_merge() {
        let mut a = LandmarkStats {
            visible: 2,
            found: 1,
            error_sum: 0.5,
        };
        assert_eq!(a.mean_error(), Some(0.5));
        a.merge(&LandmarkStats {
            visible: 3,
            found: 3,
            error_sum: 1.5,
        });
        assert_eq!(a.visible, 5);
        assert_eq!(a.found, 4);
        assert_eq!(a.mean_error(), Some(0.5));
        assert_eq!(LandmarkStats::default().mean_error(), None);
    }
}
