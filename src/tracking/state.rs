//! System state machine.
//!
//! ```text
//! UNINITIALIZED → INITIALIZING → READY → TRACKING ⇄ LOST ⇄ RELOCALIZATION
//!                                   any → FAILED
//! ```

use std::fmt;

/// Lifecycle state of a SLAM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SystemState {
    /// Not yet configured.
    #[default]
    Uninitialized,
    /// Loading vocabulary and checking calibration.
    Initializing,
    /// Accepting frames; no pose yet (empty map or bootstrap in progress).
    Ready,
    /// Camera pose is being estimated against the map.
    Tracking,
    /// Tracking failed; waiting for relocalization.
    Lost,
    /// Verifying place-recognition candidates.
    Relocalization,
    /// Unrecoverable internal failure. Terminal.
    Failed,
}

impl SystemState {
    pub const ALL: [SystemState; 7] = [
        SystemState::Uninitialized,
        SystemState::Initializing,
        SystemState::Ready,
        SystemState::Tracking,
        SystemState::Lost,
        SystemState::Relocalization,
        SystemState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SystemState::Uninitialized => "Uninitialized",
            SystemState::Initializing => "Initializing",
            SystemState::Ready => "Ready",
            SystemState::Tracking => "Tracking",
            SystemState::Lost => "Lost",
            SystemState::Relocalization => "Relocalization",
            SystemState::Failed => "Failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SystemState) -> bool {
        use SystemState::*;
        if self == Failed {
            return false;
        }
        if next == Failed || next == self {
            return true;
        }
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Ready)
                | (Ready, Tracking)
                | (Tracking, Lost)
                | (Lost, Relocalization)
                | (Relocalization, Tracking)
                | (Relocalization, Lost)
                // reset / clear / load
                | (Tracking | Lost | Relocalization, Ready)
                | (Ready, Lost)
        )
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
