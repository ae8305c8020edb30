//! Residual vectors between descriptors and their assigned words.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::types::{l2_norm, Vector};

/// Quantization scale of the reduced-precision residual representation.
pub const CAST_SCALE: f32 = 255.0;

/// `normalize(word - vec)`; the zero vector and `true` when `vec == word`.
pub fn compute_residual(word: &[f32], vec: &[f32]) -> (Vector, bool) {
    let mut rvec: Vector = word.iter().zip(vec.iter()).map(|(w, v)| w - v).collect();
    let norm = l2_norm(&rvec);
    if norm == 0.0 {
        rvec.iter_mut().for_each(|x| *x = 0.0);
        return (rvec, true);
    }
    rvec.iter_mut().for_each(|x| *x /= norm);
    (rvec, false)
}

/// Weighted aggregate of the residuals of every descriptor assigned to `word`.
///
/// Member residuals are weighted by their multi-assignment weight, summed and
/// renormalized. The result is flagged when any member equals the word or the
/// sum vanishes; a flagged aggregate is always the zero vector.
pub fn aggregate_residuals<'a>(
    word: &[f32],
    members: impl IntoIterator<Item = (&'a [f32], f32)>,
) -> (Vector, bool) {
    let mut agg = vec![0.0f32; word.len()];
    let mut flag = false;
    for (vec, maw) in members {
        let (rvec, degenerate) = compute_residual(word, vec);
        flag |= degenerate;
        for (a, r) in agg.iter_mut().zip(rvec.iter()) {
            *a += maw * r;
        }
    }

    let norm = l2_norm(&agg);
    if flag || norm == 0.0 {
        agg.iter_mut().for_each(|x| *x = 0.0);
        return (agg, true);
    }
    agg.iter_mut().for_each(|x| *x /= norm);
    (agg, false)
}

/// Scale by 255, round, and clip into the signed-byte range.
pub fn cast_residual(phi: &[f32]) -> Vec<i8> {
    phi.iter()
        .map(|x| (x * CAST_SCALE).round().clamp(i8::MIN as f32, i8::MAX as f32) as i8)
        .collect()
}

pub fn uncast_residual(quantized: &[i8]) -> Vector {
    quantized.iter().map(|q| *q as f32 / CAST_SCALE).collect()
}

/// Per-word aggregated residuals of one annotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResidualStore {
    Float(Vec<Vector>),
    Int8(Vec<Vec<i8>>),
}

impl ResidualStore {
    pub fn from_vectors(phis: Vec<Vector>, int8: bool) -> Self {
        if int8 {
            ResidualStore::Int8(phis.iter().map(|p| cast_residual(p)).collect())
        } else {
            ResidualStore::Float(phis)
        }
    }

    /// Residual `i`, de-scaled if stored in reduced precision.
    pub fn get(&self, i: usize) -> Cow<'_, [f32]> {
        match self {
            ResidualStore::Float(phis) => Cow::Borrowed(&phis[i]),
            ResidualStore::Int8(phis) => Cow::Owned(uncast_residual(&phis[i])),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResidualStore::Float(phis) => phis.len(),
            ResidualStore::Int8(phis) => phis.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
