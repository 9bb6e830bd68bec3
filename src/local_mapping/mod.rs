//! Mapping worker.
//!
//! The worker is responsible for:
//! - Inserting new keyframes into the map
//! - Triangulating new landmarks against covisible keyframes
//! - Fusing duplicate landmarks between neighbors
//! - Running local bundle adjustment
//! - Culling weak landmarks and redundant keyframes

mod local_mapper;
pub mod search_in_neighbors;
pub mod triangulation;

pub use local_mapper::{LocalMapper, LocalMappingConfig, MappingReport};
