//! Versioned binary map format.
//!
//! Layout (all integers and floats little-endian):
//! - Header:
//!   - Magic: "SSLAMMAP" (8 bytes)
//!   - Format version: u32
//!   - Map id: 64 bytes, UTF-8, zero padded
//!   - Creation timestamp: f64
//!   - Map version: u64
//!   - Next keyframe id, next landmark id: u64 each
//!   - Keyframe, landmark and covisibility edge counts: u32 each
//! - Keyframe records: id, timestamp, pose (quaternion wxyz + translation),
//!   features (pt, angle, response, descriptor), BoW signature,
//!   observations (feature index, landmark id)
//! - Landmark records: id, position, descriptor, normal, counters,
//!   running reprojection error, first keyframe, observers
//!   (keyframe id, feature index)
//! - Covisibility edges: (keyframe a, keyframe b, weight)
//!
//! Decoding validates every cross reference before anything is returned:
//! observations must agree from both sides and stored edges must match the
//! covisibility implied by the observations. Any failure rejects the whole
//! buffer.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use nalgebra::{Quaternion, UnitQuaternion, Vector2, Vector3};
use thiserror::Error;
use tracing::{debug, info};

use crate::geometry::SE3;
use crate::map::{KeyFrame, KeyFrameId, Landmark, LandmarkId, Map, MapLimits, MAX_MAP_ID_LEN};
use crate::tracking::frame::{Descriptor, FeatureSet, KeyPoint};
use crate::vocabulary::BowVector;

/// Magic bytes at the start of every map file.
pub const MAGIC: &[u8; 8] = b"SSLAMMAP";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const MAP_ID_FIELD: usize = MAX_MAP_ID_LEN + 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("map I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a map file (bad magic)")]
    BadMagic,

    #[error("unsupported map format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("map data truncated")]
    Truncated,

    #[error("buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("inconsistent map data: {0}")]
    Inconsistent(String),
}

fn inconsistent<T>(msg: impl Into<String>) -> Result<T, CodecError> {
    Err(CodecError::Inconsistent(msg.into()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn vec3(&mut self, v: &Vector3<f64>) {
        self.f64(v.x);
        self.f64(v.y);
        self.f64(v.z);
    }
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }
    fn len(&mut self, n: usize) {
        self.u32(n as u32);
    }
}

/// Serialize a map.
pub fn encode(map: &Map) -> Vec<u8> {
    let mut w = Writer {
        buf: Vec::with_capacity(map.memory_usage_bytes()),
    };

    w.bytes(MAGIC);
    w.u32(FORMAT_VERSION);
    let mut id_field = [0u8; MAP_ID_FIELD];
    let id = map.id().as_bytes();
    let n = id.len().min(MAX_MAP_ID_LEN);
    id_field[..n].copy_from_slice(&id[..n]);
    w.bytes(&id_field);
    w.f64(map.creation_timestamp());
    w.u64(map.version());
    let (next_kf, next_lm) = map.next_ids();
    w.u64(next_kf);
    w.u64(next_lm);
    let edges = map.covisibility_edges();
    w.len(map.num_keyframes());
    w.len(map.num_landmarks());
    w.len(edges.len());

    for kf in map.keyframes() {
        w.u64(kf.id.0);
        w.f64(kf.timestamp);
        let q = kf.pose().rotation.quaternion();
        w.f64(q.w);
        w.f64(q.i);
        w.f64(q.j);
        w.f64(q.k);
        w.vec3(&kf.pose().translation);

        w.len(kf.features.len());
        for (kp, desc) in kf.features.keypoints.iter().zip(&kf.features.descriptors) {
            w.f64(kp.pt.x);
            w.f64(kp.pt.y);
            w.f32(kp.angle);
            w.f32(kp.response);
            w.bytes(desc);
        }

        w.len(kf.bow_vector.len());
        for (&word, &weight) in &kf.bow_vector {
            w.u32(word);
            w.f64(weight);
        }

        w.len(kf.num_landmarks());
        for (idx, lm) in kf.landmark_indices() {
            w.u32(idx as u32);
            w.u64(lm.0);
        }
    }

    for lm in map.landmarks() {
        w.u64(lm.id.0);
        w.vec3(lm.position());
        w.bytes(&lm.descriptor);
        w.vec3(&lm.normal);
        w.u32(lm.visible_count);
        w.u32(lm.found_count);
        w.f64(lm.reprojection_error);
        w.u64(lm.first_kf.0);
        w.len(lm.num_observations());
        for (&kf, &idx) in lm.observations() {
            w.u64(kf.0);
            w.u32(idx as u32);
        }
    }

    for (a, b, weight) in edges {
        w.u64(a.0);
        w.u64(b.0);
        w.u32(weight as u32);
    }
    // Reserved flags byte for future extensions.
    w.u8(0);

    w.buf
}

/// Exact number of bytes [`encode`] produces.
pub fn encoded_size(map: &Map) -> usize {
    encode(map).len()
}

/// Serialize into a caller buffer, returning the bytes written.
pub fn encode_into(map: &Map, out: &mut [u8]) -> Result<usize, CodecError> {
    let bytes = encode(map);
    if bytes.len() > out.len() {
        return Err(CodecError::BufferTooSmall {
            needed: bytes.len(),
            available: out.len(),
        });
    }
    out[..bytes.len()].copy_from_slice(&bytes);
    Ok(bytes.len())
}

/// Write a map file, returning the bytes written.
pub fn save_to_file(map: &Map, path: &Path) -> Result<usize, CodecError> {
    let bytes = encode(map);
    std::fs::write(path, &bytes)?;
    info!(
        "[Codec] Saved map '{}' ({} KFs, {} landmarks, {} bytes) to {}",
        map.id(),
        map.num_keyframes(),
        map.num_landmarks(),
        bytes.len(),
        path.display()
    );
    Ok(bytes.len())
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }
    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }
    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }
    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
    fn f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.array()?))
    }
    fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.array()?))
    }
    fn finite(&mut self, what: &str) -> Result<f64, CodecError> {
        let v = self.f64()?;
        if v.is_finite() {
            Ok(v)
        } else {
            inconsistent(format!("non-finite {}", what))
        }
    }
    fn vec3(&mut self, what: &str) -> Result<Vector3<f64>, CodecError> {
        Ok(Vector3::new(self.finite(what)?, self.finite(what)?, self.finite(what)?))
    }
    /// A count, bounded by the bytes that could possibly back it.
    fn count(&mut self, min_record_bytes: usize) -> Result<usize, CodecError> {
        let n = self.u32()? as usize;
        let remaining = self.data.len() - self.pos;
        if n.saturating_mul(min_record_bytes) > remaining {
            return Err(CodecError::Truncated);
        }
        Ok(n)
    }
}

const FEATURE_RECORD: usize = 8 + 8 + 4 + 4 + 32;

/// Parsed keyframe record before it is linked into a map.
struct KeyFrameRecord {
    keyframe: KeyFrame,
    observations: Vec<(usize, LandmarkId)>,
}

/// Deserialize a map, validating all references.
pub fn decode(data: &[u8], limits: MapLimits) -> Result<Map, CodecError> {
    let mut r = Reader { data, pos: 0 };

    if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    r.take(MAGIC.len())?;
    let version = r.u32()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    let id_field: [u8; MAP_ID_FIELD] = r.array()?;
    let id_len = id_field.iter().position(|&b| b == 0).unwrap_or(MAX_MAP_ID_LEN);
    let map_id = std::str::from_utf8(&id_field[..id_len])
        .map_err(|_| CodecError::Inconsistent("map id is not UTF-8".to_string()))?
        .to_string();
    let creation_timestamp = r.finite("creation timestamp")?;
    let map_version = r.u64()?;
    let next_kf = r.u64()?;
    let next_lm = r.u64()?;
    let num_kfs = r.count(8)?;
    let num_lms = r.count(8)?;
    let num_edges = r.count(20)?;

    let mut kf_records = Vec::with_capacity(num_kfs);
    for _ in 0..num_kfs {
        kf_records.push(read_keyframe(&mut r)?);
    }
    let mut landmarks = Vec::with_capacity(num_lms);
    for _ in 0..num_lms {
        landmarks.push(read_landmark(&mut r)?);
    }
    let mut edges = BTreeMap::new();
    for _ in 0..num_edges {
        let a = KeyFrameId(r.u64()?);
        let b = KeyFrameId(r.u64()?);
        let w = r.u32()? as usize;
        let key = if a < b { (a, b) } else { (b, a) };
        if a == b || w == 0 || edges.insert(key, w).is_some() {
            return inconsistent(format!("invalid covisibility edge {}-{}", a, b));
        }
    }
    let _flags = r.u8()?;
    if r.pos != data.len() {
        return inconsistent(format!("{} trailing bytes", data.len() - r.pos));
    }

    // Assemble
    let mut map = Map::new(map_id, creation_timestamp, limits);
    let mut kf_observations = Vec::with_capacity(kf_records.len());
    for rec in kf_records {
        let id = rec.keyframe.id;
        if id.0 >= next_kf || map.contains_keyframe(id) {
            return inconsistent(format!("invalid or duplicate keyframe id {}", id));
        }
        kf_observations.push((id, rec.observations));
        map.restore_keyframe(rec.keyframe);
    }

    let mut lm_observers = Vec::with_capacity(landmarks.len());
    for (lm, observers) in landmarks {
        if lm.id.0 >= next_lm || map.landmark(lm.id).is_some() {
            return inconsistent(format!("invalid or duplicate landmark id {}", lm.id));
        }
        if observers.is_empty() {
            return inconsistent(format!("{} has no observers", lm.id));
        }
        lm_observers.push((lm.id, observers));
        map.restore_landmark(lm);
    }

    for (lm_id, observers) in &lm_observers {
        for &(kf_id, idx) in observers {
            if !map.contains_keyframe(kf_id) {
                return inconsistent(format!("{} observed by missing {}", lm_id, kf_id));
            }
            match map.associate(kf_id, idx, *lm_id) {
                Ok(true) => {}
                Ok(false) => return inconsistent(format!("duplicate observation of {}", lm_id)),
                Err(e) => return inconsistent(e.to_string()),
            }
        }
    }

    // Keyframe-side records must describe exactly the same associations.
    for (kf_id, observations) in &kf_observations {
        let Some(kf) = map.keyframe(*kf_id) else {
            return inconsistent(format!("missing {}", kf_id));
        };
        if observations.len() != kf.num_landmarks() {
            return inconsistent(format!("{} observation count mismatch", kf_id));
        }
        for &(idx, lm) in observations {
            if kf.landmark(idx) != Some(lm) {
                return inconsistent(format!("{} slot {} does not match {}", kf_id, idx, lm));
            }
        }
    }

    let rebuilt: BTreeMap<(KeyFrameId, KeyFrameId), usize> = map
        .covisibility_edges()
        .into_iter()
        .map(|(a, b, w)| ((a, b), w))
        .collect();
    if rebuilt != edges {
        return inconsistent("covisibility edges do not match observations");
    }

    map.check_invariants()
        .map_err(|e| CodecError::Inconsistent(e.to_string()))?;
    map.set_next_ids(next_kf, next_lm);
    map.set_version(map_version);

    debug!(
        "[Codec] Decoded map '{}': {} KFs, {} landmarks, {} edges",
        map.id(),
        map.num_keyframes(),
        map.num_landmarks(),
        edges.len()
    );
    Ok(map)
}

fn read_keyframe(r: &mut Reader<'_>) -> Result<KeyFrameRecord, CodecError> {
    let id = KeyFrameId(r.u64()?);
    let timestamp = r.finite("keyframe timestamp")?;
    let (w, i, j, k) = (
        r.finite("rotation")?,
        r.finite("rotation")?,
        r.finite("rotation")?,
        r.finite("rotation")?,
    );
    let q = Quaternion::new(w, i, j, k);
    if (q.norm() - 1.0).abs() > 1e-6 {
        return inconsistent(format!("{} rotation is not normalized", id));
    }
    let translation = r.vec3("translation")?;
    let pose = SE3::from_quaternion(UnitQuaternion::from_quaternion(q), translation);

    let n = r.count(FEATURE_RECORD)?;
    let mut features = FeatureSet {
        keypoints: Vec::with_capacity(n),
        descriptors: Vec::with_capacity(n),
    };
    for _ in 0..n {
        let pt = Vector2::new(r.finite("keypoint")?, r.finite("keypoint")?);
        let angle = r.f32()?;
        let response = r.f32()?;
        let descriptor: Descriptor = r.array()?;
        features.keypoints.push(KeyPoint { pt, angle, response });
        features.descriptors.push(descriptor);
    }

    let n_words = r.count(12)?;
    let mut bow = BowVector::new();
    for _ in 0..n_words {
        let word = r.u32()?;
        let weight = r.finite("BoW weight")?;
        bow.insert(word, weight);
    }

    let n_obs = r.count(12)?;
    let mut observations = Vec::with_capacity(n_obs);
    for _ in 0..n_obs {
        let idx = r.u32()? as usize;
        let lm = LandmarkId(r.u64()?);
        if idx >= n {
            return inconsistent(format!("{} feature index {} out of range", id, idx));
        }
        observations.push((idx, lm));
    }

    Ok(KeyFrameRecord {
        keyframe: KeyFrame::new(id, timestamp, pose, Arc::new(features), bow),
        observations,
    })
}

fn read_landmark(r: &mut Reader<'_>) -> Result<(Landmark, Vec<(KeyFrameId, usize)>), CodecError> {
    let id = LandmarkId(r.u64()?);
    let position = r.vec3("landmark position")?;
    let descriptor: Descriptor = r.array()?;
    let normal = r.vec3("landmark normal")?;
    let visible_count = r.u32()?;
    let found_count = r.u32()?;
    let reprojection_error = r.finite("reprojection error")?;
    let first_kf = KeyFrameId(r.u64()?);

    let n = r.count(12)?;
    let mut observers = Vec::with_capacity(n);
    for _ in 0..n {
        let kf = KeyFrameId(r.u64()?);
        let idx = r.u32()? as usize;
        observers.push((kf, idx));
    }

    let mut lm = Landmark::new(id, position, descriptor, first_kf);
    lm.normal = normal;
    lm.visible_count = visible_count;
    lm.found_count = found_count;
    lm.reprojection_error = reprojection_error;
    Ok((lm, observers))
}

/// Read and decode a map file.
pub fn load_from_file(path: &Path, limits: MapLimits) -> Result<Map, CodecError> {
    let mut data = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut data)?;
    let map = decode(&data, limits)?;
    info!(
        "[Codec] Loaded map '{}' ({} KFs, {} landmarks) from {}",
        map.id(),
        map.num_keyframes(),
        map.num_landmarks(),
        path.display()
    );
    Ok(map)
}
