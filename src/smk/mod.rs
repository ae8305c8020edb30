//! Selective match kernel
//!
//! Annotations are summarized per visual word by an aggregated residual
//! vector. Two annotations are compared word by word through a selectivity
//! function applied to residual dot products, weighted by squared IDF and
//! normalized by per-annotation gammas.

pub mod inverted;
pub mod residual;

use serde::{Deserialize, Serialize};

use crate::config::ResolvedParams;
use crate::types::{dot, WordIndex};

pub use inverted::{AnnotWords, InvertedIndex};
pub use residual::{
    aggregate_residuals, cast_residual, compute_residual, uncast_residual, ResidualStore,
};

/// Kernel shape parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmkParams {
    pub alpha: f32,
    pub thresh: f32,
}

impl SmkParams {
    pub fn from_params(params: &ResolvedParams) -> Self {
        Self {
            alpha: params.smk_alpha,
            thresh: params.smk_thresh,
        }
    }
}

impl Default for SmkParams {
    fn default() -> Self {
        Self {
            alpha: 3.0,
            thresh: 0.0,
        }
    }
}

/// `sign(u) * |u|^alpha` when `u > thresh`, else zero.
pub fn selectivity(u: f32, alpha: f32, thresh: f32) -> f32 {
    if u > thresh {
        u.signum() * u.abs().powf(alpha)
    } else {
        0.0
    }
}

/// Residual dot product of one word shared by two annotations.
///
/// A flagged residual means a descriptor sat exactly on the word, which is
/// scored as a perfect match.
fn word_dot(a: &AnnotWords, ax: usize, b: &AnnotWords, bx: usize) -> f32 {
    if a.flags[ax] || b.flags[bx] {
        return 1.0;
    }
    dot(&a.phi(ax), &b.phi(bx))
}

/// Per-word kernel contributions between two annotations, before gammas.
///
/// Yields `(word, position in a, position in b, idf^2 * sel(phi_a . phi_b))`
/// for every shared word with a non-zero contribution.
pub fn word_contributions(
    a: &AnnotWords,
    b: &AnnotWords,
    idf: impl Fn(WordIndex) -> f32,
    params: SmkParams,
) -> Vec<(WordIndex, usize, usize, f32)> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.wxs.len() && j < b.wxs.len() {
        match a.wxs[i].cmp(&b.wxs[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                let wx = a.wxs[i];
                let weight = idf(wx).powi(2);
                let score =
                    weight * selectivity(word_dot(a, i, b, j), params.alpha, params.thresh);
                if score != 0.0 {
                    out.push((wx, i, j, score));
                }
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Kernel of an annotation with itself, the quantity gamma normalizes.
pub fn self_similarity(
    annot: &AnnotWords,
    idf: impl Fn(WordIndex) -> f32,
    params: SmkParams,
) -> f32 {
    word_contributions(annot, annot, idf, params)
        .iter()
        .map(|(_, _, _, s)| s)
        .sum()
}

/// `1 / sqrt(self similarity)`, zero for an annotation with no support.
pub fn gamma(self_sim: f32) -> f32 {
    if self_sim > 0.0 {
        1.0 / self_sim.sqrt()
    } else {
        0.0
    }
}

/// `gamma_a * gamma_b * sum_w idf(w)^2 * sel(phi_a(w) . phi_b(w))`.
pub fn smk_similarity(
    a: &AnnotWords,
    gamma_a: f32,
    b: &AnnotWords,
    gamma_b: f32,
    idf: impl Fn(WordIndex) -> f32,
    params: SmkParams,
) -> f32 {
    let raw: f32 = word_contributions(a, b, idf, params)
        .iter()
        .map(|(_, _, _, s)| s)
        .sum();
    gamma_a * gamma_b * raw
}
