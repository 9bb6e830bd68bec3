//! Geometry utilities: SE3/SO3, pose estimation, triangulation and
//! two-view reconstruction.

pub mod pnp;
pub mod se3;
pub mod so3;
pub mod triangulation;
pub mod two_view;

pub use pnp::{estimate_pose, PoseError, PoseEstimate, PoseEstimatorConfig};
pub use se3::SE3;
pub use two_view::{reconstruct_two_view, TwoViewConfig, TwoViewResult};
