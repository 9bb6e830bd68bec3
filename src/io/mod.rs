//! Frame sources.
//!
//! - [`synthetic`] - seeded textured scene and circular camera trajectory

pub mod synthetic;

pub use synthetic::{CircularTrajectory, SyntheticScene};
