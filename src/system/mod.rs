//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that runs tracking and
//! coordinates the local mapping worker, along with configuration, shared
//! state, caller callbacks and inter-thread messaging types.

pub mod config;
pub mod events;
pub mod messages;
pub mod shared_state;
mod slam_system;

pub use config::SlamConfig;
pub use events::Callbacks;
pub use messages::NewKeyFrameMsg;
pub use shared_state::SharedState;
pub use slam_system::{MapInfo, SlamSystem, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};
