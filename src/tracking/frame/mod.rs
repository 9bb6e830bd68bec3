//! Frame-level processing: camera model, image conversion, feature extraction.

pub mod camera;
pub mod features;
pub mod image;

pub use camera::CameraModel;
pub use features::{Descriptor, ExtractorConfig, FeatureExtractor, FeatureSet, KeyPoint};
pub use image::{GrayImage, ImageView};
