//! Voxel hash over landmark positions for radius queries.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use super::types::LandmarkId;

type Cell = (i64, i64, i64);

/// Uniform voxel grid. Each cell lists the landmarks inside it together
/// with their positions.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    cell_size: f64,
    cells: BTreeMap<Cell, Vec<(LandmarkId, Vector3<f64>)>>,
    len: usize,
}

impl SpatialIndex {
    pub const DEFAULT_CELL_SIZE: f64 = 0.5;

    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size: if cell_size > 0.0 { cell_size } else { Self::DEFAULT_CELL_SIZE },
            cells: BTreeMap::new(),
            len: 0,
        }
    }

    fn cell_of(&self, p: &Vector3<f64>) -> Cell {
        (
            (p.x / self.cell_size).floor() as i64,
            (p.y / self.cell_size).floor() as i64,
            (p.z / self.cell_size).floor() as i64,
        )
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, id: LandmarkId, position: Vector3<f64>) {
        let cell = self.cell_of(&position);
        self.cells.entry(cell).or_default().push((id, position));
        self.len += 1;
    }

    /// Remove `id`, which must have been inserted at `position`.
    pub fn remove(&mut self, id: LandmarkId, position: &Vector3<f64>) -> bool {
        let cell = self.cell_of(position);
        let Some(entries) = self.cells.get_mut(&cell) else {
            return false;
        };
        let Some(i) = entries.iter().position(|(e, _)| *e == id) else {
            return false;
        };
        entries.swap_remove(i);
        if entries.is_empty() {
            self.cells.remove(&cell);
        }
        self.len -= 1;
        true
    }

    pub fn update(&mut self, id: LandmarkId, old: &Vector3<f64>, new: Vector3<f64>) {
        self.remove(id, old);
        self.insert(id, new);
    }

    /// Landmarks within `radius` of `center`, sorted by id.
    pub fn query_radius(&self, center: &Vector3<f64>, radius: f64) -> Vec<LandmarkId> {
        if radius < 0.0 || !radius.is_finite() {
            return Vec::new();
        }
        let lo = self.cell_of(&(center - Vector3::repeat(radius)));
        let hi = self.cell_of(&(center + Vector3::repeat(radius)));
        let r2 = radius * radius;

        let mut out = Vec::new();
        for x in lo.0..=hi.0 {
            for y in lo.1..=hi.1 {
                for z in lo.2..=hi.2 {
                    if let Some(entries) = self.cells.get(&(x, y, z)) {
                        out.extend(
                            entries
                                .iter()
                                .filter(|(_, p)| (p - center).norm_squared() <= r2)
                                .map(|(id, _)| *id),
                        );
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.len = 0;
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CELL_SIZE)
    }
}
