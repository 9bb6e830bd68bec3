//! Caller-registered notification hooks.
//!
//! Hooks run on whichever thread produced the event (tracking on the caller
//! thread, failures possibly on the mapping worker). They are cloned out of
//! the registry before being invoked, so a hook may re-register hooks.

use std::sync::Arc;

use crate::error::ResultCode;
use crate::tracking::result::Pose;
use crate::tracking::SystemState;

pub type StateChangeFn = Arc<dyn Fn(SystemState, SystemState) + Send + Sync>;
pub type PoseUpdateFn = Arc<dyn Fn(&Pose) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(ResultCode, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Callbacks {
    /// (previous, next) on every state transition.
    pub on_state_change: Option<StateChangeFn>,
    /// Every accepted pose.
    pub on_pose_update: Option<PoseUpdateFn>,
    pub on_error: Option<ErrorFn>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_pose_update", &self.on_pose_update.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
