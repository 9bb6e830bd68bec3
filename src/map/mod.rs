//! Map store - keyframes, landmarks and their relationships.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature observations
//! - [`Landmark`] - 3D points observed by KeyFrames
//! - [`Map`] - Container managing both, the covisibility graph, a spatial
//!   index over landmarks and the place-recognition database
//!
//! # Architecture
//!
//! The map forms a bipartite graph:
//! - KeyFrames observe Landmarks (KF → LM via `landmark_ids`)
//! - Landmarks track their observers (LM → KF via `observations`)
//!
//! Both directions use typed ids into map-owned collections, so a map can be
//! cloned wholesale for copy-on-write snapshots.

pub mod keyframe;
pub mod keyframe_db;
pub mod landmark;
#[allow(clippy::module_inception)]
pub mod map;
pub mod spatial_index;
pub mod types;

use thiserror::Error;

pub use keyframe::KeyFrame;
pub use keyframe_db::{Candidate, KeyFrameDatabase};
pub use landmark::Landmark;
pub use map::{Map, MapLimits, MAX_MAP_ID_LEN};
pub use spatial_index::SpatialIndex;
pub use types::{KeyFrameId, LandmarkId};

/// Errors raised by map mutations and invariant checks.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("{resource} ceiling of {limit} reached")]
    CapacityExceeded { resource: &'static str, limit: usize },

    #[error("keyframe {0} not found")]
    KeyFrameNotFound(KeyFrameId),

    #[error("landmark {0} not found")]
    LandmarkNotFound(LandmarkId),

    #[error("feature index {index} out of range for keyframe {keyframe}")]
    FeatureOutOfRange { keyframe: KeyFrameId, index: usize },

    #[error("map invariant violated: {0}")]
    InvariantViolation(String),
}
