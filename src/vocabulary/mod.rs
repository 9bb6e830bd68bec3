//! Binary-descriptor vocabulary for Bag-of-Words place recognition.
//!
//! The vocabulary is a hierarchical k-means tree over 256-bit descriptors:
//! - Branching factor k, depth L
//! - Leaves are the "visual words", each with an IDF weight
//!
//! Two sources are supported:
//! - [`Vocabulary::load_from_text`]: a pre-trained tree in DBoW2 text format
//! - [`Vocabulary::synthetic`]: a seeded random tree, used when no file is
//!   configured. Quantization is deterministic either way, so identical
//!   descriptors always map to identical words.
//!
//! # Key Types
//!
//! - [`BowVector`]: sparse word histogram with TF-IDF weights
//! - [`Vocabulary`]: the tree with quantization and scoring

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::tracking::frame::Descriptor;
use crate::tracking::matching::descriptor_distance;

/// Bag-of-Words vector: word_id -> weight, L1-normalized.
pub type BowVector = BTreeMap<u32, f64>;

/// Errors that can occur when loading or using a vocabulary.
#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("vocabulary I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vocabulary parse error: {0}")]
    Parse(String),

    #[error("vocabulary has no words")]
    Empty,
}

/// A node in the vocabulary tree.
#[derive(Debug, Clone)]
struct VocabNode {
    children: Vec<u32>,
    descriptor: Descriptor,
    /// IDF weight (leaves only).
    weight: f64,
    word_id: Option<u32>,
}

impl VocabNode {
    fn new() -> Self {
        Self {
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word_id: None,
        }
    }
}

/// Vocabulary tree.
#[derive(Debug)]
pub struct Vocabulary {
    /// `nodes[0]` is the root.
    nodes: Vec<VocabNode>,
    num_words: usize,
    k: usize,
    l: usize,
}

impl Vocabulary {
    /// Load a vocabulary from DBoW2 text format.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] desc[1] ... desc[31] weight
    /// ...
    /// ```
    ///
    /// One line per node, root excluded; nodes are numbered in file order
    /// starting at 1.
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let file = File::open(path.as_ref())?;
        let mut lines = BufReader::new(file).lines();

        let header = lines
            .next()
            .ok_or_else(|| VocabularyError::Parse("empty vocabulary file".to_string()))??;
        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            return Err(VocabularyError::Parse(
                "invalid header, expected: k L [scoring weighting]".to_string(),
            ));
        }
        let k: usize = header_parts[0]
            .parse()
            .map_err(|_| VocabularyError::Parse("invalid k value".to_string()))?;
        let l: usize = header_parts[1]
            .parse()
            .map_err(|_| VocabularyError::Parse("invalid L value".to_string()))?;

        let mut nodes = vec![VocabNode::new()];
        let mut num_words = 0u32;

        for (line_num, line) in lines.enumerate() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            // parent_id is_leaf desc[32] weight
            if parts.len() < 35 {
                return Err(VocabularyError::Parse(format!(
                    "line {}: expected 35 fields, found {}",
                    line_num + 2,
                    parts.len()
                )));
            }
            let bad = |what: &str| VocabularyError::Parse(format!("invalid {} at line {}", what, line_num + 2));

            let parent: u32 = parts[0].parse().map_err(|_| bad("parent_id"))?;
            if parent as usize >= nodes.len() {
                return Err(bad("parent_id"));
            }
            let mut node = VocabNode::new();
            for (i, byte) in parts[2..34].iter().enumerate() {
                node.descriptor[i] = byte.parse().map_err(|_| bad("descriptor byte"))?;
            }
            node.weight = parts[34].parse().map_err(|_| bad("weight"))?;
            if parts[1] == "1" {
                node.word_id = Some(num_words);
                num_words += 1;
            }

            let node_id = nodes.len() as u32;
            nodes[parent as usize].children.push(node_id);
            nodes.push(node);
        }

        if num_words == 0 {
            return Err(VocabularyError::Empty);
        }

        tracing::info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            k,
            l,
            nodes.len(),
            num_words
        );

        Ok(Self {
            nodes,
            num_words: num_words as usize,
            k,
            l,
        })
    }

    /// Build a random tree with `k^l` words from a fixed seed.
    pub fn synthetic(k: usize, l: usize, seed: u64) -> Self {
        let k = k.max(2);
        let l = l.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut nodes = vec![VocabNode::new()];
        let mut frontier = vec![0u32];
        let mut num_words = 0u32;

        for level in 0..l {
            let mut next = Vec::with_capacity(frontier.len() * k);
            for &parent in &frontier {
                for _ in 0..k {
                    let mut node = VocabNode::new();
                    rng.fill(&mut node.descriptor[..]);
                    if level + 1 == l {
                        node.word_id = Some(num_words);
                        node.weight = 1.0;
                        num_words += 1;
                    }
                    let id = nodes.len() as u32;
                    nodes[parent as usize].children.push(id);
                    nodes.push(node);
                    next.push(id);
                }
            }
            frontier = next;
        }

        Self {
            nodes,
            num_words: num_words as usize,
            k,
            l,
        }
    }

    /// (branching factor, depth)
    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Quantize a descriptor to its leaf: (word_id, leaf_node_id).
    ///
    /// Descends from the root following the closest child; ties go to the
    /// first child.
    fn quantize(&self, desc: &Descriptor) -> (u32, usize) {
        let mut node_id = 0usize;
        while let Some(&first) = self.nodes[node_id].children.first() {
            let mut best_child = first;
            let mut best_dist = descriptor_distance(desc, &self.nodes[first as usize].descriptor);
            for &child in &self.nodes[node_id].children[1..] {
                let dist = descriptor_distance(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }
            node_id = best_child as usize;
        }
        (self.nodes[node_id].word_id.unwrap_or(0), node_id)
    }

    /// Word id of a single descriptor.
    pub fn word_of(&self, desc: &Descriptor) -> u32 {
        self.quantize(desc).0
    }

    /// Transform descriptors into an L1-normalized BoW vector.
    pub fn transform(&self, descriptors: &[Descriptor]) -> BowVector {
        let mut bow = BowVector::new();
        for desc in descriptors {
            let (word_id, leaf) = self.quantize(desc);
            *bow.entry(word_id).or_insert(0.0) += self.nodes[leaf].weight;
        }
        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            bow.values_mut().for_each(|v| *v /= sum);
        }
        bow
    }

    /// L1 similarity `1 - 0.5 * |v1 - v2|_1`, in [0, 1].
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;
        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }
        (1.0 - 0.5 * diff_sum).clamp(0.0, 1.0)
    }
}
