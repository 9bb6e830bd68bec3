//! KeyFrameDatabase - inverted index for place recognition.
//!
//! Maps each visual word to the keyframes containing it, so candidate
//! retrieval only scores keyframes sharing at least one word with the query.

use std::collections::{BTreeMap, BTreeSet};

use crate::vocabulary::{BowVector, Vocabulary};

use super::types::KeyFrameId;

/// Fraction of the best shared-word count a candidate must reach.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct KeyFrameDatabase {
    inverted: BTreeMap<u32, BTreeSet<KeyFrameId>>,
    entries: BTreeMap<KeyFrameId, BowVector>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add or replace a keyframe entry.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: BowVector) {
        self.erase(kf_id);
        for word in bow.keys() {
            self.inverted.entry(*word).or_default().insert(kf_id);
        }
        self.entries.insert(kf_id, bow);
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        let Some(bow) = self.entries.remove(&kf_id) else {
            return;
        };
        for word in bow.keys() {
            if let Some(kfs) = self.inverted.get_mut(word) {
                kfs.remove(&kf_id);
                if kfs.is_empty() {
                    self.inverted.remove(word);
                }
            }
        }
    }

    /// Keyframes similar to `query`, best first (ties by id), skipping
    /// `exclude` and anything scoring below `min_score`.
    pub fn detect_candidates(
        &self,
        query: &BowVector,
        exclude: &BTreeSet<KeyFrameId>,
        min_score: f64,
        max_results: usize,
    ) -> Vec<Candidate> {
        let mut common: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        for word in query.keys() {
            if let Some(kfs) = self.inverted.get(word) {
                for kf in kfs {
                    if !exclude.contains(kf) {
                        *common.entry(*kf).or_insert(0) += 1;
                    }
                }
            }
        }
        let Some(&max_common) = common.values().max() else {
            return Vec::new();
        };
        let min_common = ((max_common as f64) * MIN_COMMON_WORDS_RATIO).ceil() as usize;

        let mut cands: Vec<Candidate> = common
            .into_iter()
            .filter(|&(_, n)| n >= min_common)
            .filter_map(|(kf, _)| {
                let score = Vocabulary::score(query, self.entries.get(&kf)?);
                (score >= min_score).then_some(Candidate {
                    keyframe_id: kf,
                    score,
                })
            })
            .collect();

        cands.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.keyframe_id.cmp(&b.keyframe_id))
        });
        cands.truncate(max_results);
        cands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(words: &[u32]) -> BowVector {
        let w = 1.0 / words.len() as f64;
        words.iter().map(|&id| (id, w)).collect()
    }

    #[test]
    fn test_candidates_ranked_by_score() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId(0), bow(&[1, 2, 3, 4]));
        db.add(KeyFrameId(1), bow(&[1, 2, 3, 4, 9]));
        db.add(KeyFrameId(2), bow(&[7, 8]));

        let cands = db.detect_candidates(&bow(&[1, 2, 3, 4]), &BTreeSet::new(), 0.0, 5);
        assert_eq!(cands[0].keyframe_id, KeyFrameId(0));
        assert!((cands[0].score - 1.0).abs() < 1e-12);
        assert_eq!(cands[1].keyframe_id, KeyFrameId(1));
        assert!((cands[1].score - 0.8).abs() < 1e-12);
        assert_eq!(cands.len(), 2);

        // Too few shared words relative to the best candidate.
        db.add(KeyFrameId(3), bow(&[1, 8]));
        let cands = db.detect_candidates(&bow(&[1, 2, 3, 4]), &BTreeSet::new(), 0.0, 5);
        assert!(cands.iter().all(|c| c.keyframe_id != KeyFrameId(3)));
    }

    #[test]
    fn test_exclude_and_erase() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId(0), bow(&[1, 2]));
        db.add(KeyFrameId(1), bow(&[1, 2]));

        let exclude: BTreeSet<_> = [KeyFrameId(0)].into_iter().collect();
        let cands = db.detect_candidates(&bow(&[1, 2]), &exclude, 0.0, 5);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].keyframe_id, KeyFrameId(1));

        db.erase(KeyFrameId(1));
        assert!(db.detect_candidates(&bow(&[1, 2]), &exclude, 0.0, 5).is_empty());
        assert_eq!(db.len(), 1);
    }
}
