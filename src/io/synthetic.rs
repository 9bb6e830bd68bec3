//! Seeded synthetic scenes for tests and the demo binary.
//!
//! The scene is a cylindrical wall of landmarks laid out with a minimum
//! spacing. Each landmark is drawn as a fixed stamp at its projection: a
//! dark pixel inside a bright core, surrounded by low-contrast random
//! texture. The core yields exactly one corner, at the projected pixel,
//! and the texture makes the descriptor unique to the landmark. Rendering
//! is fully deterministic for a given seed.

use std::f64::consts::TAU;

use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;

/// Radius of the disc drawn for each landmark (pixels).
const STAMP_RADIUS: i32 = 9;

const STAMP_SIDE: usize = (2 * STAMP_RADIUS + 1) as usize;

/// Squared radius of the bright core around the dark center pixel.
const CORE_RADIUS_SQ: i32 = 12;

const BACKGROUND: u8 = 128;

/// Texture stays this close to the background level, below the corner
/// detector's contrast threshold.
const TEXTURE_AMPLITUDE: u8 = 10;

/// Placement cell side as a multiple of the minimum spacing.
const CELL_FACTOR: f64 = 1.25;

const PLACEMENT_ATTEMPTS: usize = 10;

/// Points closer than this to the camera are not drawn.
const MIN_RENDER_DEPTH: f64 = 0.2;

type Stamp = [u8; STAMP_SIDE * STAMP_SIDE];

/// A set of textured 3D points and a camera to look at them with.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    camera: CameraModel,
    points: Vec<Vector3<f64>>,
    stamps: Vec<Stamp>,
}

impl SyntheticScene {
    /// Points on a vertical cylinder around the origin, at least `spacing`
    /// apart.
    ///
    /// The surface is cut into cells slightly larger than `spacing`; each
    /// cell receives at most one point at a random spot that keeps clear
    /// of the points already placed in the neighboring cells.
    pub fn cylinder(camera: CameraModel, radius: f64, height: f64, spacing: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let cell = (spacing * CELL_FACTOR).max(f64::EPSILON);
        let columns = ((TAU * radius / cell).floor() as usize).max(1);
        let rows = ((height / cell).floor() as usize).max(1);
        let cell_angle = TAU / columns as f64;
        let cell_height = height / rows as f64;

        let mut occupant: Vec<Option<usize>> = vec![None; columns * rows];
        let mut points: Vec<Vector3<f64>> = Vec::new();
        for row in 0..rows {
            for col in 0..columns {
                for _ in 0..PLACEMENT_ATTEMPTS {
                    let theta = (col as f64 + rng.gen::<f64>()) * cell_angle;
                    let y = (row as f64 + rng.gen::<f64>()) * cell_height - height / 2.0;
                    let p = Vector3::new(radius * theta.cos(), y, radius * theta.sin());
                    let crowded = neighbor_cells(col, row, columns, rows)
                        .filter_map(|c| occupant[c])
                        .any(|k| (points[k] - p).norm() < spacing);
                    if !crowded {
                        occupant[row * columns + col] = Some(points.len());
                        points.push(p);
                        break;
                    }
                }
            }
        }

        let stamps = points.iter().map(|_| stamp(&mut rng)).collect();
        Self {
            camera,
            points,
            stamps,
        }
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    /// Pixel where landmark `index` is drawn from `pose`, if it is drawn.
    pub fn stamp_center(&self, index: usize, pose: &SE3) -> Option<(usize, usize)> {
        let p_cam = pose.inverse().transform_point(self.points.get(index)?);
        self.center_of(&p_cam).map(|(_, u, v)| (u, v))
    }

    fn center_of(&self, p_cam: &Vector3<f64>) -> Option<(f64, usize, usize)> {
        if p_cam.z < MIN_RENDER_DEPTH {
            return None;
        }
        let uv = self.camera.project(p_cam)?;
        let (u, v) = (uv.x.round(), uv.y.round());
        let r = STAMP_RADIUS as f64;
        if u < r || v < r || u + r >= self.camera.width as f64 || v + r >= self.camera.height as f64 {
            return None;
        }
        Some((p_cam.z, u as usize, v as usize))
    }

    /// Render a single-channel image seen from `pose` (camera to world).
    pub fn render(&self, pose: &SE3) -> Vec<u8> {
        let width = self.camera.width as usize;
        let height = self.camera.height as usize;
        let mut image = vec![BACKGROUND; width * height];

        let pose_cw = pose.inverse();
        let mut visible: Vec<(f64, usize, usize, usize)> = self
            .points
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                let (depth, u, v) = self.center_of(&pose_cw.transform_point(p))?;
                Some((depth, i, u, v))
            })
            .collect();

        // Far to near so closer stamps occlude.
        visible.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        let r = STAMP_RADIUS;
        for (_, i, u, v) in visible {
            let stamp = &self.stamps[i];
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx * dx + dy * dy > r * r {
                        continue;
                    }
                    let x = (u as i32 + dx) as usize;
                    let y = (v as i32 + dy) as usize;
                    image[y * width + x] = stamp[((dy + r) as usize) * STAMP_SIDE + (dx + r) as usize];
                }
            }
        }
        image
    }
}

/// Indices of the 3x3 block of cells around `(col, row)`; columns wrap
/// around the cylinder.
fn neighbor_cells(col: usize, row: usize, columns: usize, rows: usize) -> impl Iterator<Item = usize> {
    (row.saturating_sub(1)..=(row + 1).min(rows - 1)).flat_map(move |r| {
        [columns - 1, 0, 1]
            .into_iter()
            .map(move |dc| r * columns + (col + dc) % columns)
    })
}

fn stamp(rng: &mut StdRng) -> Stamp {
    let mut stamp = [BACKGROUND; STAMP_SIDE * STAMP_SIDE];
    let r = STAMP_RADIUS;
    for dy in -r..=r {
        for dx in -r..=r {
            let d2 = dx * dx + dy * dy;
            let value = if d2 == 0 {
                0
            } else if d2 <= CORE_RADIUS_SQ {
                255
            } else {
                rng.gen_range(BACKGROUND - TEXTURE_AMPLITUDE..=BACKGROUND + TEXTURE_AMPLITUDE)
            };
            stamp[((dy + r) as usize) * STAMP_SIDE + (dx + r) as usize] = value;
        }
    }
    stamp
}

/// Camera moving on a horizontal circle while looking outward.
#[derive(Debug, Clone, Copy)]
pub struct CircularTrajectory {
    pub radius: f64,
    pub frames_per_lap: usize,
    pub frame_rate: f64,
}

impl Default for CircularTrajectory {
    fn default() -> Self {
        Self {
            radius: 1.0,
            frames_per_lap: 180,
            frame_rate: 30.0,
        }
    }
}

impl CircularTrajectory {
    /// Pose of frame `index` (camera to world). The camera y axis points
    /// down the world y axis; z looks away from the circle's center.
    pub fn pose(&self, index: usize) -> SE3 {
        let theta = TAU * index as f64 / self.frames_per_lap.max(1) as f64;
        let (sin, cos) = theta.sin_cos();
        let z_axis = Vector3::new(cos, 0.0, sin);
        let y_axis = Vector3::new(0.0, 1.0, 0.0);
        let x_axis = y_axis.cross(&z_axis);
        let rotation = Matrix3::from_columns(&[x_axis, y_axis, z_axis]);
        SE3::from_rt(&rotation, &(z_axis * self.radius))
    }

    pub fn timestamp(&self, index: usize) -> f64 {
        index as f64 / self.frame_rate
    }
}
