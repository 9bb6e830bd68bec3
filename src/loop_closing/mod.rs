//! Loop closing and relocalization.
//!
//! Both run on the place-recognition index kept by the map:
//! 1. **Detection** (`detector.rs`): BoW candidates with consistency checking
//! 2. **Closing** (`loop_closer.rs`): geometric verification, region
//!    correction, landmark merging and global BA
//! 3. **Relocalization** (`relocalizer.rs`): recovering the camera pose
//!    against the whole map after tracking is lost
//!
//! Loop closing runs on the mapping worker after each committed pass;
//! relocalization runs on the caller thread against the latest snapshot.

pub mod detector;
pub mod loop_closer;
pub mod relocalizer;

pub use detector::{detect_loop_candidates, ConsistencyChecker, LoopCandidate, LoopDetectorConfig};
pub use loop_closer::{apply_loop, verify_loop, LoopCloser, LoopCloserConfig, LoopClosure, VerifiedLoop};
pub use relocalizer::{relocalize, Relocalization, RelocalizationOutcome, RelocalizerConfig};
