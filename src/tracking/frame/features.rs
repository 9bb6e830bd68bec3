//! Feature extraction - FAST corners with steered BRIEF descriptors.
//!
//! - FAST-9 segment test with a sum-of-differences corner score
//! - 3x3 non-maximum suppression, then a quality cut relative to the
//!   strongest corner and greedy minimum-distance suppression
//! - Orientation from the intensity centroid of a circular patch
//! - 256-bit rotated BRIEF on a blurred image
//!
//! Detection runs in horizontal bands, one scoped thread per band.

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::camera::CameraModel;
use super::image::GrayImage;

/// 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// Pixels kept clear of the image edge so every descriptor sample is inside.
pub const FEATURE_BORDER: usize = 20;

/// Radius of the orientation patch.
const HALF_PATCH: i32 = 15;

/// Maximum absolute coordinate of a BRIEF sample before rotation.
const PATTERN_RADIUS: i32 = 13;

const PATTERN_SEED: u64 = 0x0B1E_F5EE;

const DESCRIPTOR_BITS: usize = 256;

/// Bresenham circle of radius 3, clockwise from the top.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

const ARC_LENGTH: usize = 9;

/// A detected keypoint in undistorted pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub pt: Vector2<f64>,
    /// Orientation in radians.
    pub angle: f32,
    /// Corner strength.
    pub response: f32,
}

/// Keypoints with their descriptors (same length, same order).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub max_features: usize,
    /// Minimum corner score as a fraction of the strongest corner.
    pub quality: f32,
    /// Minimum pixel distance between two kept features.
    pub min_distance: f32,
    pub fast_threshold: u8,
    pub num_threads: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_features: 1000,
            quality: 0.01,
            min_distance: 8.0,
            fast_threshold: 20,
            num_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Corner {
    x: usize,
    y: usize,
    score: f32,
}

/// Reusable extractor holding the sampling pattern.
pub struct FeatureExtractor {
    config: ExtractorConfig,
    pattern: Vec<[(i32, i32); 2]>,
}

impl FeatureExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let pattern = (0..DESCRIPTOR_BITS)
            .map(|_| {
                let mut sample = || {
                    (
                        rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                        rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    )
                };
                [sample(), sample()]
            })
            .collect();
        Self { config, pattern }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Detect and describe features. Keypoint positions are undistorted
    /// through `camera`; sampling happens on the raw image.
    pub fn extract(&self, image: &GrayImage, camera: &CameraModel) -> FeatureSet {
        if image.width < 2 * FEATURE_BORDER + 1 || image.height < 2 * FEATURE_BORDER + 1 {
            return FeatureSet::default();
        }

        let corners = detect_fast(image, self.config.fast_threshold, self.config.num_threads);
        let corners = self.select(corners);
        if corners.is_empty() {
            return FeatureSet::default();
        }

        let blurred = image.blurred();
        let mut out = FeatureSet {
            keypoints: Vec::with_capacity(corners.len()),
            descriptors: Vec::with_capacity(corners.len()),
        };
        for c in corners {
            let angle = intensity_centroid_angle(image, c.x as i32, c.y as i32);
            let descriptor = self.describe(&blurred, c.x as i32, c.y as i32, angle);
            let raw = Vector2::new(c.x as f64, c.y as f64);
            out.keypoints.push(KeyPoint {
                pt: camera.undistort_point(&raw),
                angle,
                response: c.score,
            });
            out.descriptors.push(descriptor);
        }
        out
    }

    /// Quality cut, then greedy strongest-first distance suppression.
    fn select(&self, mut corners: Vec<Corner>) -> Vec<Corner> {
        let Some(best) = corners.iter().map(|c| c.score).reduce(f32::max) else {
            return Vec::new();
        };
        let min_score = best * self.config.quality.max(0.0);
        corners.retain(|c| c.score >= min_score);
        // Stable: equal scores keep row-major order.
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));

        let min_dist = self.config.min_distance.max(0.0);
        if min_dist < 1.0 {
            corners.truncate(self.config.max_features);
            return corners;
        }
        let min_dist_sq = min_dist * min_dist;
        let cell = min_dist.ceil() as usize;
        let cols = corners.iter().map(|c| c.x).max().unwrap_or(0) / cell + 1;
        let rows = corners.iter().map(|c| c.y).max().unwrap_or(0) / cell + 1;
        let mut occupancy: Vec<Vec<usize>> = vec![Vec::new(); cols * rows];

        let mut kept: Vec<Corner> = Vec::new();
        for c in corners {
            if kept.len() >= self.config.max_features {
                break;
            }
            let (cx, cy) = (c.x / cell, c.y / cell);
            let mut clear = true;
            'search: for gy in cy.saturating_sub(1)..=(cy + 1).min(rows - 1) {
                for gx in cx.saturating_sub(1)..=(cx + 1).min(cols - 1) {
                    for &k in &occupancy[gy * cols + gx] {
                        let other: &Corner = &kept[k];
                        let dx = other.x as f32 - c.x as f32;
                        let dy = other.y as f32 - c.y as f32;
                        if dx * dx + dy * dy < min_dist_sq {
                            clear = false;
                            break 'search;
                        }
                    }
                }
            }
            if clear {
                occupancy[cy * cols + cx].push(kept.len());
                kept.push(c);
            }
        }
        kept
    }

    fn describe(&self, image: &GrayImage, x: i32, y: i32, angle: f32) -> Descriptor {
        let (sin, cos) = (angle as f64).sin_cos();
        let rotate = |(px, py): (i32, i32)| -> (i32, i32) {
            let rx = (cos * px as f64 - sin * py as f64).round() as i32;
            let ry = (sin * px as f64 + cos * py as f64).round() as i32;
            (x + rx, y + ry)
        };
        let mut desc = [0u8; 32];
        for (bit, pair) in self.pattern.iter().enumerate() {
            let (ax, ay) = rotate(pair[0]);
            let (bx, by) = rotate(pair[1]);
            if image.at(ax, ay) < image.at(bx, by) {
                desc[bit / 8] |= 1 << (bit % 8);
            }
        }
        desc
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FAST
// ─────────────────────────────────────────────────────────────────────────────

/// Detect FAST-9 corners inside the descriptor border, row-major order.
fn detect_fast(image: &GrayImage, threshold: u8, num_threads: usize) -> Vec<Corner> {
    let y0 = FEATURE_BORDER;
    let y1 = image.height - FEATURE_BORDER;
    let rows = y1 - y0;
    let bands = num_threads.clamp(1, rows.max(1));
    if bands == 1 {
        return detect_band(image, threshold, y0, y1);
    }

    let band_height = rows.div_ceil(bands);
    let ranges: Vec<(usize, usize)> = (0..bands)
        .map(|b| (y0 + b * band_height, (y0 + (b + 1) * band_height).min(y1)))
        .filter(|(a, b)| a < b)
        .collect();

    std::thread::scope(|scope| {
        let handles: Vec<_> = ranges
            .iter()
            .map(|&(a, b)| scope.spawn(move || detect_band(image, threshold, a, b)))
            .collect();
        let mut all = Vec::new();
        for (handle, &(a, b)) in handles.into_iter().zip(&ranges) {
            match handle.join() {
                Ok(band) => all.extend(band),
                // A panicking band is recomputed on this thread.
                Err(_) => all.extend(detect_band(image, threshold, a, b)),
            }
        }
        all
    })
}

/// Corners with rows in `[y0, y1)` after 3x3 non-maximum suppression.
fn detect_band(image: &GrayImage, threshold: u8, y0: usize, y1: usize) -> Vec<Corner> {
    let x0 = FEATURE_BORDER;
    let x1 = image.width - FEATURE_BORDER;
    let width = x1 - x0;

    // Scores for one row above and below the band so suppression sees
    // neighbours across band boundaries.
    let sy0 = y0 - 1;
    let sy1 = y1 + 1;
    let mut scores = vec![0.0f32; (sy1 - sy0) * width];
    for y in sy0..sy1 {
        for x in x0..x1 {
            scores[(y - sy0) * width + (x - x0)] = fast_score(image, x, y, threshold);
        }
    }

    let score_at = |x: usize, y: usize| -> f32 {
        if x < x0 || x >= x1 {
            0.0
        } else {
            scores[(y - sy0) * width + (x - x0)]
        }
    };

    let mut corners = Vec::new();
    for y in y0..y1 {
        for x in x0..x1 {
            let s = score_at(x, y);
            if s <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'nms: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let n = score_at((x as i32 + dx) as usize, (y as i32 + dy) as usize);
                    // Ties go to the earlier pixel in row-major order.
                    let earlier = dy < 0 || (dy == 0 && dx < 0);
                    if n > s || (earlier && n == s) {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                corners.push(Corner { x, y, score: s });
            }
        }
    }
    corners
}

/// Segment-test score: 0 when the pixel is not a corner, otherwise the
/// larger of the bright and dark sums of differences beyond the threshold.
fn fast_score(image: &GrayImage, x: usize, y: usize, threshold: u8) -> f32 {
    let center = image.get(x, y) as i32;
    let t = threshold as i32;
    let sample = |i: usize| -> i32 {
        let (dx, dy) = CIRCLE[i];
        image.at(x as i32 + dx, y as i32 + dy) as i32
    };

    // Any 9-arc covers at least two of the four compass points.
    let compass = [sample(0), sample(4), sample(8), sample(12)];
    let bright = compass.iter().filter(|&&v| v > center + t).count();
    let dark = compass.iter().filter(|&&v| v < center - t).count();
    if bright < 2 && dark < 2 {
        return 0.0;
    }

    let mut ring = [0i32; 16];
    for (i, v) in ring.iter_mut().enumerate() {
        *v = sample(i);
    }

    let mut best = 0i32;
    for sign in [1i32, -1] {
        let passes = |v: i32| sign * (v - center) > t;
        let mut run = 0usize;
        let mut found = false;
        for i in 0..(16 + ARC_LENGTH - 1) {
            if passes(ring[i % 16]) {
                run += 1;
                if run >= ARC_LENGTH {
                    found = true;
                    break;
                }
            } else {
                run = 0;
            }
        }
        if found {
            let sum: i32 = ring
                .iter()
                .map(|&v| sign * (v - center) - t)
                .filter(|&d| d > 0)
                .sum();
            best = best.max(sum);
        }
    }
    best as f32
}

/// Orientation of the intensity centroid within a circular patch.
fn intensity_centroid_angle(image: &GrayImage, x: i32, y: i32) -> f32 {
    let mut m01 = 0i64;
    let mut m10 = 0i64;
    for dy in -HALF_PATCH..=HALF_PATCH {
        let half_width = ((HALF_PATCH * HALF_PATCH - dy * dy) as f64).sqrt() as i32;
        for dx in -half_width..=half_width {
            let v = image.at(x + dx, y + dy) as i64;
            m10 += dx as i64 * v;
            m01 += dy as i64 * v;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(w: u32, h: u32) -> CameraModel {
        CameraModel::pinhole(300.0, 300.0, w as f64 / 2.0, h as f64 / 2.0, w, h)
    }

    /// Dark background with bright squares, each giving four corners.
    fn squares_image(w: usize, h: usize) -> GrayImage {
        let mut img = GrayImage::new(w, h);
        img.data.iter_mut().for_each(|v| *v = 30);
        for (sx, sy) in [(40, 40), (100, 50), (60, 100), (130, 110)] {
            for y in sy..sy + 20 {
                for x in sx..sx + 20 {
                    img.set(x, y, 220);
                }
            }
        }
        img
    }

    #[test]
    fn test_blank_image_has_no_features() {
        let mut img = GrayImage::new(160, 120);
        img.data.iter_mut().for_each(|v| *v = 128);
        let ex = FeatureExtractor::new(ExtractorConfig::default());
        assert!(ex.extract(&img, &camera(160, 120)).is_empty());
    }

    #[test]
    fn test_detects_square_corners() {
        let img = squares_image(180, 150);
        let ex = FeatureExtractor::new(ExtractorConfig::default());
        let set = ex.extract(&img, &camera(180, 150));
        assert!(set.len() >= 8, "found {}", set.len());
        assert_eq!(set.keypoints.len(), set.descriptors.len());
        for kp in &set.keypoints {
            assert!(kp.response > 0.0);
            assert!(kp.pt.x >= FEATURE_BORDER as f64 && kp.pt.y >= FEATURE_BORDER as f64);
        }
    }

    #[test]
    fn test_min_distance_and_cap() {
        let img = squares_image(180, 150);
        let config = ExtractorConfig {
            min_distance: 10.0,
            max_features: 5,
            ..Default::default()
        };
        let set = FeatureExtractor::new(config).extract(&img, &camera(180, 150));
        assert!(set.len() <= 5);
        for (i, a) in set.keypoints.iter().enumerate() {
            for b in &set.keypoints[i + 1..] {
                assert!((a.pt - b.pt).norm() >= 10.0);
            }
        }
    }

    #[test]
    fn test_threaded_detection_matches_single_thread() {
        let img = squares_image(180, 150);
        let single = FeatureExtractor::new(ExtractorConfig::default()).extract(&img, &camera(180, 150));
        let threaded = FeatureExtractor::new(ExtractorConfig {
            num_threads: 4,
            ..Default::default()
        })
        .extract(&img, &camera(180, 150));
        assert_eq!(single, threaded);
    }

    #[test]
    fn test_fast_rejects_flat_patch() {
        let mut img = GrayImage::new(50, 50);
        img.data.iter_mut().for_each(|v| *v = 90);
        assert_eq!(fast_score(&img, 25, 25, 20), 0.0);
        img.set(25, 25, 250);
        assert!(fast_score(&img, 25, 25, 20) > 0.0);
    }
}
