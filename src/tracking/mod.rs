//! Tracking: processes frames on the caller thread and outputs poses and
//! keyframes.
//!
//! - Frame processing (image conversion, feature extraction)
//! - Map bootstrap from two views
//! - Pose estimation against the local map (projection search + PnP)
//! - New keyframe decision
//! - System state machine and relocalization fallback

pub mod frame;
pub mod keyframe_decision;
pub mod local_map;
pub mod matching;
pub mod motion_model;
pub mod result;
pub mod state;
pub mod tracker;
pub mod tracking_frame;

pub use result::{FrameStats, Pose, TrackingQuality, TrackingStats};
pub use state::SystemState;
pub use tracker::{TrackOutcome, Tracker};
