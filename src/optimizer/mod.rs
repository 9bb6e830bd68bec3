//! Optimization module for Bundle Adjustment.
//!
//! - [`bundle`] - Levenberg-Marquardt solver over poses and points with a
//!   Schur complement on the point block
//! - [`local_ba`] - Covisibility-window refinement run by the mapping worker
//! - [`global_ba`] - Whole-map refinement after bootstrap and loop closure

pub mod bundle;
pub mod global_ba;
pub mod local_ba;

pub use bundle::{BundleConfig, BundleProblem, BundleReport, CHI2_MONO};
pub use global_ba::{global_bundle_adjustment, GlobalBAConfig, GlobalBAResult};
pub use local_ba::{local_bundle_adjustment, LocalBAConfig, LocalBAResult};
