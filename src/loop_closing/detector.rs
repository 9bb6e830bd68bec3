//! Loop detection using Bag-of-Words with temporal consistency checking.
//!
//! First stage of loop closing: find keyframes that look like the current
//! one but are not connected to it in the covisibility graph, then require
//! the same region to come back for several consecutive keyframes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::map::{KeyFrameId, Map};
use crate::vocabulary::Vocabulary;

/// Configuration for loop detection.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Maximum candidates returned by the place index per keyframe.
    pub max_candidates: usize,

    /// Minimum id gap between current and loop keyframe.
    /// Prevents detecting recent keyframes as loops.
    pub min_temporal_gap: u64,

    /// Covisibility hops around a candidate that count as the same region
    /// for consistency checking.
    pub region_hops: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            max_candidates: 10,
            min_temporal_gap: 10,
            region_hops: 1,
        }
    }
}

/// A potential loop closure candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopCandidate {
    /// Current keyframe ID that detected the loop.
    pub current_kf_id: KeyFrameId,

    /// Loop keyframe ID (the older keyframe we're closing back to).
    pub loop_kf_id: KeyFrameId,

    /// BoW similarity score between current and loop keyframe.
    pub bow_score: f64,

    /// The candidate's covisibility region (candidate included).
    pub region: BTreeSet<KeyFrameId>,
}

/// Tracks temporal consistency of loop detections.
///
/// A loop is only accepted once candidates from the same region were
/// detected for `threshold` consecutive keyframes.
#[derive(Debug, Default, Clone)]
pub struct ConsistencyChecker {
    /// Candidate regions of the most recent keyframes, oldest first.
    history: VecDeque<BTreeSet<KeyFrameId>>,
}

impl ConsistencyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the candidates of a new keyframe and return the best one that
    /// has been seen in each of the last `threshold - 1` keyframes as well.
    pub fn add_and_check(
        &mut self,
        candidates: &[LoopCandidate],
        threshold: usize,
    ) -> Option<LoopCandidate> {
        let threshold = threshold.max(1);
        let needed = threshold - 1;

        let mut best: Option<&LoopCandidate> = None;
        for candidate in candidates {
            // Consecutive keyframes back from the newest whose regions overlap.
            let streak = self
                .history
                .iter()
                .rev()
                .take_while(|region| !region.is_disjoint(&candidate.region))
                .count();
            if streak >= needed && best.map_or(true, |b| candidate.bow_score > b.bow_score) {
                best = Some(candidate);
            }
        }

        if let Some(candidate) = best {
            let accepted = candidate.clone();
            // Start over so the same loop is not reported again right away.
            self.clear();
            return Some(accepted);
        }

        let region: BTreeSet<KeyFrameId> = candidates
            .iter()
            .flat_map(|c| c.region.iter().copied())
            .collect();
        self.history.push_back(region);
        while self.history.len() > needed {
            self.history.pop_front();
        }
        None
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Detect loop closure candidates for a given keyframe.
///
/// 1. Uses the lowest BoW score against the directly covisible keyframes as
///    the acceptance threshold
/// 2. Queries the place index, skipping the covisible keyframes
/// 3. Filters out keyframes too recent to be a loop
///
/// Returns candidates sorted by score, best first.
pub fn detect_loop_candidates(
    map: &Map,
    kf_id: KeyFrameId,
    config: &LoopDetectorConfig,
) -> Vec<LoopCandidate> {
    let Some(current) = map.keyframe(kf_id) else {
        return Vec::new();
    };
    if current.bow_vector.is_empty() {
        return Vec::new();
    }

    let connected = map.covisible_within_hops(kf_id, 1);
    let min_score = connected
        .iter()
        .filter(|&&id| id != kf_id)
        .filter_map(|&id| map.keyframe(id))
        .map(|kf| Vocabulary::score(&current.bow_vector, &kf.bow_vector))
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.min(s))));
    // An isolated keyframe has no reference for what "similar" means.
    let Some(min_score) = min_score else {
        return Vec::new();
    };

    let mut regions: BTreeMap<KeyFrameId, BTreeSet<KeyFrameId>> = BTreeMap::new();
    map.place_candidates(&current.bow_vector, &connected, min_score, config.max_candidates)
        .into_iter()
        .filter(|c| kf_id.0.abs_diff(c.keyframe_id.0) >= config.min_temporal_gap)
        .map(|c| {
            let region = regions
                .entry(c.keyframe_id)
                .or_insert_with(|| map.covisible_within_hops(c.keyframe_id, config.region_hops))
                .clone();
            LoopCandidate {
                current_kf_id: kf_id,
                loop_kf_id: c.keyframe_id,
                bow_score: c.score,
                region,
            }
        })
        .collect()
}
