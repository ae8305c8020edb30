//! Score normalizer
//!
//! Maps raw identity scores to the probability of a correct match. The curve
//! is fit from labeled true-positive and true-negative support scores.
//!
//! Readers (`normalize`) share a read lock; `add_support` and `retrain` take
//! the write lock, so a curve is never read while it is being refit.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::types::Aid;
use crate::{Error, Result};

/// Golden ratio; scores are clipped at `(1 + phi) * max(tn)`.
const PHI: f32 = 1.618_034;

/// A normalized score, or `Unknown` when the normalizer cannot tell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizedScore {
    Probability(f32),
    Unknown,
}

impl NormalizedScore {
    pub fn probability(&self) -> Option<f32> {
        match self {
            NormalizedScore::Probability(p) => Some(*p),
            NormalizedScore::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, NormalizedScore::Unknown)
    }
}

/// (query annotation, gallery annotation) a support score came from.
pub type SupportLabel = (Aid, Aid);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerParams {
    /// Points in the fitted score domain.
    pub grid_size: usize,
    pub clip_factor: f32,
}

impl Default for NormalizerParams {
    fn default() -> Self {
        Self {
            grid_size: 1024,
            clip_factor: 1.0 + PHI,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Support {
    tp_scores: Vec<f32>,
    tn_scores: Vec<f32>,
    tp_labels: Vec<SupportLabel>,
    tn_labels: Vec<SupportLabel>,
}

impl Support {
    fn len(&self) -> usize {
        self.tp_scores.len() + self.tn_scores.len()
    }
}

/// Monotonic probability curve over an ascending score domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Curve {
    domain: Vec<f32>,
    probs: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NormalizerState {
    key: String,
    params: NormalizerParams,
    support: Support,
    curve: Option<Curve>,
}

pub struct ScoreNormalizer {
    state: RwLock<NormalizerState>,
}

impl std::fmt::Debug for ScoreNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ScoreNormalizer")
            .field("key", &state.key)
            .field("support", &state.support.len())
            .field("trained", &state.curve.is_some())
            .finish()
    }
}

impl ScoreNormalizer {
    /// A normalizer with no support; it answers `Unknown` until trained.
    pub fn untrained(key: impl Into<String>) -> Self {
        Self::with_params(key, NormalizerParams::default())
    }

    pub fn with_params(key: impl Into<String>, params: NormalizerParams) -> Self {
        Self {
            state: RwLock::new(NormalizerState {
                key: key.into(),
                params,
                support: Support::default(),
                curve: None,
            }),
        }
    }

    pub fn key(&self) -> String {
        self.state.read().key.clone()
    }

    pub fn num_support(&self) -> usize {
        self.state.read().support.len()
    }

    pub fn is_trained(&self) -> bool {
        let state = self.state.read();
        state.curve.is_some() && state.support.len() >= 2
    }

    /// Probability that `score` belongs to a true match.
    ///
    /// Scores below the fitted domain map to 0; scores above it saturate at
    /// the midpoint between the highest fitted probability and 1.
    pub fn normalize(&self, score: f32) -> NormalizedScore {
        let state = self.state.read();
        if state.support.len() < 2 {
            return NormalizedScore::Unknown;
        }
        let Some(curve) = state.curve.as_ref() else {
            return NormalizedScore::Unknown;
        };
        let (Some(&lo), Some(&hi)) = (curve.domain.first(), curve.domain.last()) else {
            return NormalizedScore::Unknown;
        };
        if score.is_nan() {
            return NormalizedScore::Unknown;
        }
        if score < lo {
            return NormalizedScore::Probability(0.0);
        }
        if score > hi {
            let max_prob = curve.probs.iter().copied().fold(0.0f32, f32::max);
            return NormalizedScore::Probability((max_prob + 1.0) / 2.0);
        }
        let idx = curve.domain.partition_point(|d| *d <= score).saturating_sub(1);
        NormalizedScore::Probability(curve.probs[idx])
    }

    /// Append labeled support not seen before.
    ///
    /// Returns whether anything was added. Scores and labels of each class
    /// must have equal lengths.
    pub fn add_support(
        &self,
        tp_scores: &[f32],
        tn_scores: &[f32],
        tp_labels: &[SupportLabel],
        tn_labels: &[SupportLabel],
    ) -> Result<bool> {
        let mut state = self.state.write();
        add_support_locked(&mut state.support, tp_scores, tn_scores, tp_labels, tn_labels)
    }

    /// Refit the probability curve from the current support.
    pub fn retrain(&self) {
        let mut state = self.state.write();
        state.curve = fit_curve(&state.support, &state.params);
        tracing::info!(
            key = %state.key,
            num_tp = state.support.tp_scores.len(),
            num_tn = state.support.tn_scores.len(),
            trained = state.curve.is_some(),
            "Retrained score normalizer"
        );
    }

    /// `add_support` then `retrain` under one write lock; skips the refit when nothing was new.
    pub fn add_support_and_retrain(
        &self,
        tp_scores: &[f32],
        tn_scores: &[f32],
        tp_labels: &[SupportLabel],
        tn_labels: &[SupportLabel],
    ) -> Result<bool> {
        let mut state = self.state.write();
        let added =
            add_support_locked(&mut state.support, tp_scores, tn_scores, tp_labels, tn_labels)?;
        if added {
            state.curve = fit_curve(&state.support, &state.params);
        }
        Ok(added)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = self.state.read();
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &*state)?;
        tracing::debug!(key = %state.key, path = %path.display(), "Saved score normalizer");
        Ok(())
    }

    /// Load a saved normalizer; `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state: NormalizerState = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(Self {
            state: RwLock::new(state),
        }))
    }
}

fn add_support_locked(
    support: &mut Support,
    tp_scores: &[f32],
    tn_scores: &[f32],
    tp_labels: &[SupportLabel],
    tn_labels: &[SupportLabel],
) -> Result<bool> {
    if tp_scores.len() != tp_labels.len() || tn_scores.len() != tn_labels.len() {
        return Err(Error::invalid(format!(
            "support scores and labels differ in length: tp {}/{}, tn {}/{}",
            tp_scores.len(),
            tp_labels.len(),
            tn_scores.len(),
            tn_labels.len()
        )));
    }

    let before = support.len();
    let mut seen: HashSet<SupportLabel> = support.tp_labels.iter().copied().collect();
    for (score, label) in tp_scores.iter().zip(tp_labels) {
        if seen.insert(*label) {
            support.tp_scores.push(*score);
            support.tp_labels.push(*label);
        }
    }
    let mut seen: HashSet<SupportLabel> = support.tn_labels.iter().copied().collect();
    for (score, label) in tn_scores.iter().zip(tn_labels) {
        if seen.insert(*label) {
            support.tn_scores.push(*score);
            support.tn_labels.push(*label);
        }
    }
    Ok(support.len() > before)
}

/// Silverman's rule-of-thumb bandwidth, floored at `min_bw`.
fn bandwidth(samples: &[f32], min_bw: f64) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|s| *s as f64).sum::<f64>() / n;
    let var = samples
        .iter()
        .map(|s| (*s as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (1.06 * var.sqrt() * n.powf(-0.2)).max(min_bw)
}

fn density(samples: &[f32], bw: f64, x: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let norm = 1.0 / (samples.len() as f64 * bw * (2.0 * std::f64::consts::PI).sqrt());
    samples
        .iter()
        .map(|s| {
            let z = (x - *s as f64) / bw;
            (-0.5 * z * z).exp()
        })
        .sum::<f64>()
        * norm
}

fn fit_curve(support: &Support, params: &NormalizerParams) -> Option<Curve> {
    if support.len() < 2 {
        return None;
    }
    let tp: Vec<f32> = support.tp_scores.iter().copied().filter(|s| s.is_finite()).collect();
    let tn: Vec<f32> = support.tn_scores.iter().copied().filter(|s| s.is_finite()).collect();
    if tp.len() + tn.len() < 2 {
        return None;
    }

    let lo = tp.iter().chain(tn.iter()).copied().fold(f32::MAX, f32::min);
    let reference = if tn.is_empty() { &tp } else { &tn };
    let reference_max = reference.iter().copied().fold(f32::MIN, f32::max);
    let mut hi = params.clip_factor * reference_max;
    if hi <= lo {
        hi = lo + 1.0;
    }

    let grid_size = params.grid_size.max(2);
    let step = (hi - lo) as f64 / (grid_size - 1) as f64;
    let min_bw = step.max(f64::EPSILON);
    let bw_tp = if tp.is_empty() { 1.0 } else { bandwidth(&tp, min_bw) };
    let bw_tn = if tn.is_empty() { 1.0 } else { bandwidth(&tn, min_bw) };
    let prior = tp.len() as f64 / (tp.len() + tn.len()) as f64;

    let mut domain = Vec::with_capacity(grid_size);
    let mut probs = Vec::with_capacity(grid_size);
    let mut running = 0.0f64;
    for i in 0..grid_size {
        let x = lo as f64 + step * i as f64;
        let f_tp = prior * density(&tp, bw_tp, x);
        let f_tn = (1.0 - prior) * density(&tn, bw_tn, x);
        let total = f_tp + f_tn;
        if total > 0.0 {
            running = running.max(f_tp / total);
        }
        domain.push(x as f32);
        probs.push(running as f32);
    }
    Some(Curve { domain, probs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(offset: Aid, n: usize) -> Vec<SupportLabel> {
        (0..n as Aid).map(|i| (offset, i)).collect()
    }

    fn trained() -> ScoreNormalizer {
        let normalizer = ScoreNormalizer::untrained("zebra");
        let tp: Vec<f32> = (0..50).map(|i| 8.0 + (i % 5) as f32 * 0.5).collect();
        let tn: Vec<f32> = (0..50).map(|i| 1.0 + (i % 5) as f32 * 0.5).collect();
        normalizer
            .add_support_and_retrain(&tp, &tn, &labels(1, 50), &labels(2, 50))
            .unwrap();
        normalizer
    }

    #[test]
    fn untrained_is_unknown() {
        let normalizer = ScoreNormalizer::untrained("zebra");
        assert_eq!(normalizer.normalize(3.0), NormalizedScore::Unknown);

        normalizer
            .add_support(&[5.0], &[], &[(1, 2)], &[])
            .unwrap();
        normalizer.retrain();
        assert_eq!(normalizer.normalize(3.0), NormalizedScore::Unknown);
    }

    #[test]
    fn curve_is_monotonic_and_bounded() {
        let normalizer = trained();
        let mut last = 0.0f32;
        for i in 0..200 {
            let p = normalizer.normalize(i as f32 * 0.1).probability().unwrap();
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= last);
            last = p;
        }
        let low = normalizer.normalize(1.5).probability().unwrap();
        let high = normalizer.normalize(9.0).probability().unwrap();
        assert!(low < 0.5);
        assert!(high > 0.5);
    }

    #[test]
    fn outside_domain_saturates() {
        let normalizer = trained();
        assert_eq!(normalizer.normalize(-10.0), NormalizedScore::Probability(0.0));
        let top = normalizer.normalize(1.0e6).probability().unwrap();
        assert!(top > 0.5 && top <= 1.0);
    }

    #[test]
    fn duplicate_labels_are_ignored() {
        let normalizer = trained();
        let before = normalizer.num_support();
        let added = normalizer
            .add_support(&[9.0], &[1.0], &[(1, 0)], &[(2, 0)])
            .unwrap();
        assert!(!added);
        assert_eq!(normalizer.num_support(), before);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let normalizer = ScoreNormalizer::untrained("zebra");
        let err = normalizer
            .add_support(&[1.0, 2.0], &[], &[(1, 1)], &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn json_round_trip_preserves_curve() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("zebra.json");
        let normalizer = trained();
        normalizer.save(&path).unwrap();
        let loaded = ScoreNormalizer::load(&path).unwrap().unwrap();
        assert_eq!(loaded.normalize(7.3), normalizer.normalize(7.3));
        assert!(ScoreNormalizer::load(&temp.path().join("absent.json"))
            .unwrap()
            .is_none());
    }
}
