//! Core types for pelage

use serde::{Deserialize, Serialize};
use std::fmt;

/// Annotation ID type
pub type Aid = u64;

/// Visual word index in `[0, K)`
pub type WordIndex = usize;

/// Descriptor vector type
pub type Vector = Vec<f32>;

/// Identity label of an annotation.
///
/// Unknown annotations never group together: each one is its own identity
/// when name-level scores are derived.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    Known(u64),
    Unknown,
}

impl Identity {
    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(nid) => write!(f, "{nid}"),
            Identity::Unknown => f.write_str("____"),
        }
    }
}

/// Keypoint location in chip coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default)]
    pub ori: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            scale: 1.0,
            ori: 0.0,
        }
    }
}

/// Keypoints and descriptors of one annotation.
///
/// `keypoints[i]` is the location of `vectors[i]`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub vectors: Vec<Vector>,
}

impl FeatureSet {
    pub fn new(keypoints: Vec<Keypoint>, vectors: Vec<Vector>) -> Self {
        Self { keypoints, vectors }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Descriptor dimensionality, `None` when the set is empty.
    pub fn dim(&self) -> Option<usize> {
        self.vectors.first().map(|v| v.len())
    }
}

/// One identity with its derived score, as exposed to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IdentityScore {
    pub identity: Identity,
    pub score: f32,
}

pub(crate) fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let diff = x - y;
        sum += diff * diff;
    }
    sum
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub(crate) fn l2_norm(a: &[f32]) -> f32 {
    a.iter()
        .map(|v| *v as f64 * *v as f64)
        .sum::<f64>()
        .sqrt() as f32
}
