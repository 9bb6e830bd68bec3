//! Core ID types for the map structures.

/// Unique identifier for a KeyFrame within a Map.
///
/// KeyFrameIds are assigned sequentially when KeyFrames are created and are
/// never reused within a map. They serve as lightweight handles for
/// cross-referencing without shared ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a Landmark within a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}
