pub mod codec;
pub mod error;
pub mod geometry;
pub mod io;
pub mod local_mapping;
pub mod loop_closing;
pub mod map;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod vocabulary;

pub use error::{ResultCode, SlamError};
pub use system::{MapInfo, SlamConfig, SlamSystem};
pub use tracking::{Pose, SystemState, TrackingQuality, TrackingStats};
