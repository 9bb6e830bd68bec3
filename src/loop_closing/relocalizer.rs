//! Relocalization against the whole map.
//!
//! 1. Place-recognition query with the frame's BoW vector
//! 2. For each candidate: descriptor matching against the landmarks of the
//!    candidate and its covisible neighbors
//! 3. Pose estimation without prior, then a projection search from the
//!    estimate and a second estimation with the estimate as prior
//! 4. Accept under the stricter relocalization confidence

use std::collections::BTreeSet;

use tracing::debug;

use crate::geometry::{estimate_pose, PoseEstimatorConfig, SE3};
use crate::map::{KeyFrameId, LandmarkId, Map};
use crate::tracking::frame::CameraModel;
use crate::tracking::matching::{
    search_by_descriptor, search_by_projection, LandmarkCandidate, PROJECTION_RADIUS,
};
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::BowVector;

#[derive(Debug, Clone)]
pub struct RelocalizerConfig {
    /// Place-recognition candidates verified per attempt.
    pub max_candidates: usize,
    /// Covisibility hops around a candidate whose landmarks are matched.
    pub neighborhood_hops: usize,
    pub min_inliers: usize,
    pub min_confidence: f64,
    pub pose: PoseEstimatorConfig,
}

impl Default for RelocalizerConfig {
    fn default() -> Self {
        Self {
            max_candidates: 5,
            neighborhood_hops: 1,
            min_inliers: 30,
            min_confidence: 0.7,
            pose: PoseEstimatorConfig::default(),
        }
    }
}

/// An accepted relocalization.
#[derive(Debug, Clone)]
pub struct Relocalization {
    /// Camera pose (T_wc).
    pub pose: SE3,
    pub confidence: f64,
    pub num_inliers: usize,
    pub mean_error: f64,
    /// Keyframe whose neighborhood produced the pose.
    pub keyframe: KeyFrameId,
    /// Inlier association per frame feature.
    pub matches: Vec<Option<LandmarkId>>,
}

#[derive(Debug, Clone)]
pub enum RelocalizationOutcome {
    /// The place index returned nothing for this frame.
    NoCandidates,
    /// Candidates existed but none passed verification.
    Rejected { candidates: usize },
    Accepted(Relocalization),
}

/// Landmarks observed by `keyframe` and its neighborhood.
pub(crate) fn neighborhood_candidates(
    map: &Map,
    keyframe: KeyFrameId,
    hops: usize,
) -> Vec<LandmarkCandidate> {
    map.landmarks_in_neighborhood(keyframe, hops)
        .into_iter()
        .filter_map(|id| {
            let lm = map.landmark(id)?;
            Some(LandmarkCandidate {
                id,
                position: *lm.position(),
                descriptor: lm.descriptor,
            })
        })
        .collect()
}

/// Verify one candidate keyframe: match `frame` against the landmarks of
/// its neighborhood and estimate the pose. Shared with loop verification.
pub(crate) fn verify_candidate(
    map: &Map,
    frame: &Frame,
    keyframe: KeyFrameId,
    camera: &CameraModel,
    config: &RelocalizerConfig,
) -> Option<Relocalization> {
    let candidates = neighborhood_candidates(map, keyframe, config.neighborhood_hops);
    let pairs = search_by_descriptor(&frame.features, &candidates);
    if pairs.len() < config.min_inliers {
        return None;
    }

    let mut work = frame.clone();
    work.clear_matches();
    for &(feature, cand) in &pairs {
        work.landmark_matches[feature] = Some(candidates[cand].id);
    }

    // Coarse estimate from descriptor matches alone.
    let corr = work.correspondences(map);
    let coarse = estimate_pose(&corr.points, &corr.pixels, camera, None, &config.pose).ok()?;
    work.retain_inliers(&corr, &coarse.inliers);

    // Recover more matches by projection, then refine.
    search_by_projection(&mut work, &candidates, &coarse.pose, camera, PROJECTION_RADIUS);
    let corr = work.correspondences(map);
    let refined =
        estimate_pose(&corr.points, &corr.pixels, camera, Some(&coarse.pose), &config.pose).ok()?;
    work.retain_inliers(&corr, &refined.inliers);

    debug!(
        "[Reloc] candidate {}: {} matches, {} inliers, confidence {:.2}",
        keyframe,
        pairs.len(),
        refined.num_inliers,
        refined.confidence
    );

    if refined.num_inliers < config.min_inliers || refined.confidence < config.min_confidence {
        return None;
    }
    Some(Relocalization {
        pose: refined.pose,
        confidence: refined.confidence,
        num_inliers: refined.num_inliers,
        mean_error: refined.mean_error,
        keyframe,
        matches: work.landmark_matches,
    })
}

/// Try to localize `frame` against the whole map.
pub fn relocalize(
    map: &Map,
    frame: &Frame,
    bow: &BowVector,
    camera: &CameraModel,
    config: &RelocalizerConfig,
) -> RelocalizationOutcome {
    let candidates = map.place_candidates(bow, &BTreeSet::new(), 0.0, config.max_candidates);
    if candidates.is_empty() {
        return RelocalizationOutcome::NoCandidates;
    }

    let mut best: Option<Relocalization> = None;
    for cand in &candidates {
        if let Some(reloc) = verify_candidate(map, frame, cand.keyframe_id, camera, config) {
            if best.as_ref().map_or(true, |b| reloc.num_inliers > b.num_inliers) {
                best = Some(reloc);
            }
        }
    }

    match best {
        Some(reloc) => RelocalizationOutcome::Accepted(reloc),
        None => RelocalizationOutcome::Rejected {
            candidates: candidates.len(),
        },
    }
}
