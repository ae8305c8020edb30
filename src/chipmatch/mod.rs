//! Per-query match results
//!
//! A [`ChipMatch`] holds, for one query annotation, the correspondences found
//! against each gallery annotation and the scores derived from them. Scores
//! are produced by a [`ScoringStrategy`]; identity scores are always derived
//! from the annotation scores of the same assignment.

pub mod scoring;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ScoreMethod;
use crate::normalizer::{NormalizedScore, ScoreNormalizer};
use crate::types::{Aid, Identity, IdentityScore};

pub use scoring::{
    strategy_for, AnnotCoverage, ChipSum, CoverageScorer, GridCoverage, NameCoverage, NameSum,
    ScoringContext, ScoringStrategy, SmkScore,
};

/// Channel label of the SMK kernel contribution.
pub const SMK_CHANNEL: &str = "smk";

/// How annotation scores combine into the score of their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameCombine {
    Sum,
    Max,
    /// Sum saturating at 1, for scores that are fractions of the query.
    ClippedSum,
}

impl NameCombine {
    fn combine(self, scores: impl Iterator<Item = f32>) -> f32 {
        match self {
            NameCombine::Sum => scores.sum(),
            NameCombine::Max => scores.fold(0.0f32, f32::max),
            NameCombine::ClippedSum => scores.sum::<f32>().min(1.0),
        }
    }
}

/// The canonical scores of a [`ChipMatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreAssignment {
    pub method: ScoreMethod,
    pub combine: NameCombine,
    /// One score per gallery annotation, aligned with `ChipMatch::daids`.
    pub annot_scores: Vec<f32>,
    /// Identity of each group and the annotation positions it owns.
    pub groups: Vec<(Identity, Vec<usize>)>,
    /// One score per group.
    pub identity_scores: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct ChipMatch {
    pub qaid: Aid,
    pub daids: Vec<Aid>,
    pub dnids: Vec<Identity>,
    /// `(query feature, gallery feature)` pairs per gallery annotation.
    pub fm: Vec<Vec<(usize, usize)>>,
    /// Channel scores of each correspondence, aligned with `fsv_labels`.
    pub fsv: Vec<Vec<Vec<f32>>>,
    /// Neighbor rank each correspondence came from.
    pub fk: Vec<Vec<usize>>,
    pub fsv_labels: Vec<String>,
    /// Verified transform, query to gallery coordinates.
    pub homographies: Vec<Option<Matrix3<f64>>>,
    scores: Option<ScoreAssignment>,
    probabilities: Option<Vec<NormalizedScore>>,
}

impl ChipMatch {
    pub fn new(qaid: Aid, fsv_labels: Vec<String>) -> Self {
        Self {
            qaid,
            fsv_labels,
            ..Default::default()
        }
    }

    /// Number of gallery annotations with evidence.
    pub fn len(&self) -> usize {
        self.daids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daids.is_empty()
    }

    pub fn num_correspondences(&self) -> usize {
        self.fm.iter().map(Vec::len).sum()
    }

    pub fn index_of(&self, daid: Aid) -> Option<usize> {
        self.daids.iter().position(|d| *d == daid)
    }

    pub fn channel(&self, label: &str) -> Option<usize> {
        self.fsv_labels.iter().position(|l| l == label)
    }

    /// Append the correspondences of one gallery annotation. Drops any scores.
    pub fn push_annot(
        &mut self,
        daid: Aid,
        dnid: Identity,
        fm: Vec<(usize, usize)>,
        fsv: Vec<Vec<f32>>,
        fk: Vec<usize>,
    ) {
        self.daids.push(daid);
        self.dnids.push(dnid);
        self.fm.push(fm);
        self.fsv.push(fsv);
        self.fk.push(fk);
        self.homographies.push(None);
        self.invalidate();
    }

    /// Keep only the correspondences at `keep` for gallery annotation `dx`.
    pub fn retain_correspondences(&mut self, dx: usize, keep: &[usize]) {
        self.fm[dx] = keep.iter().map(|&i| self.fm[dx][i]).collect();
        self.fsv[dx] = keep.iter().map(|&i| self.fsv[dx][i].clone()).collect();
        self.fk[dx] = keep.iter().map(|&i| self.fk[dx][i]).collect();
        self.invalidate();
    }

    /// Keep only the gallery annotations at positions `keep`, in that order.
    pub fn retain_annots(&mut self, keep: &[usize]) {
        self.daids = keep.iter().map(|&dx| self.daids[dx]).collect();
        self.dnids = keep.iter().map(|&dx| self.dnids[dx]).collect();
        self.fm = keep.iter().map(|&dx| std::mem::take(&mut self.fm[dx])).collect();
        self.fsv = keep.iter().map(|&dx| std::mem::take(&mut self.fsv[dx])).collect();
        self.fk = keep.iter().map(|&dx| std::mem::take(&mut self.fk[dx])).collect();
        self.homographies = keep.iter().map(|&dx| self.homographies[dx]).collect();
        self.invalidate();
    }

    /// Elementwise channel product of each correspondence of annotation `dx`.
    pub fn correspondence_scores(&self, dx: usize) -> Vec<f32> {
        self.fsv[dx]
            .iter()
            .map(|channels| channels.iter().product())
            .collect()
    }

    /// Sum of channel products per gallery annotation.
    pub fn chipsum(&self) -> Vec<f32> {
        (0..self.len())
            .map(|dx| self.correspondence_scores(dx).iter().sum())
            .collect()
    }

    /// Score every gallery annotation and derive identity scores with `strategy`.
    pub fn score(&mut self, strategy: &dyn ScoringStrategy, ctx: &ScoringContext<'_>) {
        let annot_scores = strategy.annot_scores(self, ctx);
        let combine = strategy.combine();
        let groups = group_by_identity(&self.dnids);
        let identity_scores = identity_scores(&groups, &annot_scores, combine);
        self.scores = Some(ScoreAssignment {
            method: strategy.method(),
            combine,
            annot_scores,
            groups,
            identity_scores,
        });
        self.probabilities = None;
    }

    pub fn scores(&self) -> Option<&ScoreAssignment> {
        self.scores.as_ref()
    }

    pub fn annot_scores(&self) -> Option<&[f32]> {
        self.scores.as_ref().map(|s| s.annot_scores.as_slice())
    }

    /// Reassign identity labels and regroup the current scores under them.
    pub fn set_identities(&mut self, dnids: Vec<Identity>) {
        debug_assert_eq!(dnids.len(), self.daids.len());
        self.dnids = dnids;
        if let Some(scores) = self.scores.as_mut() {
            scores.groups = group_by_identity(&self.dnids);
            scores.identity_scores =
                identity_scores(&scores.groups, &scores.annot_scores, scores.combine);
        }
        self.probabilities = None;
    }

    /// Map identity scores to probabilities, aligned with the score groups.
    pub fn apply_normalizer(&mut self, normalizer: &ScoreNormalizer) {
        self.probabilities = self.scores.as_ref().map(|scores| {
            scores
                .identity_scores
                .iter()
                .map(|s| normalizer.normalize(*s))
                .collect()
        });
    }

    pub fn probabilities(&self) -> Option<&[NormalizedScore]> {
        self.probabilities.as_deref()
    }

    /// Score groups ordered best first; ties go to the lower identity.
    fn ranked_groups(&self) -> Vec<usize> {
        let Some(scores) = self.scores.as_ref() else {
            return Vec::new();
        };
        let mut order: Vec<usize> = (0..scores.groups.len()).collect();
        order.sort_by(|&a, &b| {
            scores.identity_scores[b]
                .partial_cmp(&scores.identity_scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(scores.groups[a].0.cmp(&scores.groups[b].0))
        });
        order
    }

    /// The `n` best identities, highest score first; ties go to the lower identity.
    pub fn top_identities(&self, n: usize) -> Vec<IdentityScore> {
        self.top_identities_with_probability(n)
            .into_iter()
            .map(|(score, _)| score)
            .collect()
    }

    /// Like [`ChipMatch::top_identities`], with the normalized score of each
    /// identity when a normalizer was applied.
    pub fn top_identities_with_probability(
        &self,
        n: usize,
    ) -> Vec<(IdentityScore, Option<NormalizedScore>)> {
        let Some(scores) = self.scores.as_ref() else {
            return Vec::new();
        };
        self.ranked_groups()
            .into_iter()
            .take(n)
            .map(|gx| {
                let score = IdentityScore {
                    identity: scores.groups[gx].0,
                    score: scores.identity_scores[gx],
                };
                let probability = self.probabilities.as_ref().map(|p| p[gx]);
                (score, probability)
            })
            .collect()
    }

    /// Gallery annotations ranked by annotation score, best first.
    pub fn ranked_annots(&self) -> Vec<(Aid, f32)> {
        let scores = match self.annot_scores() {
            Some(scores) => scores.to_vec(),
            None => self.chipsum(),
        };
        let mut ranked: Vec<(Aid, f32)> = self.daids.iter().copied().zip(scores).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked
    }

    fn invalidate(&mut self) {
        self.scores = None;
        self.probabilities = None;
    }
}

/// Group annotation positions by identity. Every unknown annotation is its own group.
pub fn group_by_identity(dnids: &[Identity]) -> Vec<(Identity, Vec<usize>)> {
    let mut known: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    let mut unknown = Vec::new();
    for (dx, dnid) in dnids.iter().enumerate() {
        match dnid {
            Identity::Known(nid) => known.entry(*nid).or_default().push(dx),
            Identity::Unknown => unknown.push((Identity::Unknown, vec![dx])),
        }
    }
    known
        .into_iter()
        .map(|(nid, dxs)| (Identity::Known(nid), dxs))
        .chain(unknown)
        .collect()
}

fn identity_scores(
    groups: &[(Identity, Vec<usize>)],
    annot_scores: &[f32],
    combine: NameCombine,
) -> Vec<f32> {
    groups
        .iter()
        .map(|(_, dxs)| combine.combine(dxs.iter().map(|&dx| annot_scores[dx])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChipMatch {
        let mut cm = ChipMatch::new(1, vec!["lnbnn".into(), "fg".into()]);
        cm.push_annot(
            10,
            Identity::Known(7),
            vec![(0, 0), (1, 1)],
            vec![vec![0.5, 1.0], vec![0.25, 0.5]],
            vec![0, 0],
        );
        cm.push_annot(
            11,
            Identity::Known(7),
            vec![(2, 0)],
            vec![vec![0.4, 0.5]],
            vec![1],
        );
        cm.push_annot(12, Identity::Unknown, vec![(3, 3)], vec![vec![0.3, 1.0]], vec![0]);
        cm.push_annot(13, Identity::Unknown, vec![(4, 3)], vec![vec![0.1, 1.0]], vec![0]);
        cm
    }

    fn score(cm: &mut ChipMatch, strategy: &dyn ScoringStrategy) {
        let coverage = GridCoverage::default();
        let ctx = ScoringContext {
            query_keypoints: &[],
            coverage: &coverage,
        };
        cm.score(strategy, &ctx);
    }

    #[test]
    fn chipsum_multiplies_channels() {
        let cm = sample();
        let sums = cm.chipsum();
        assert!((sums[0] - 0.625).abs() < 1e-6);
        assert!((sums[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn unknown_annotations_never_group() {
        let groups = group_by_identity(&sample().dnids);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], (Identity::Known(7), vec![0, 1]));
        assert_eq!(groups[1], (Identity::Unknown, vec![2]));
        assert_eq!(groups[2], (Identity::Unknown, vec![3]));
    }

    #[test]
    fn namesum_adds_identity_members() {
        let mut cm = sample();
        score(&mut cm, &NameSum);
        let top = cm.top_identities(1);
        assert_eq!(top[0].identity, Identity::Known(7));
        assert!((top[0].score - 0.825).abs() < 1e-6);
    }

    #[test]
    fn regrouping_is_idempotent() {
        let mut cm = sample();
        score(&mut cm, &NameSum);
        let dnids = cm.dnids.clone();
        cm.set_identities(dnids.clone());
        let first = cm.scores().cloned();
        cm.set_identities(dnids);
        assert_eq!(cm.scores().cloned(), first);
    }

    #[test]
    fn relabeling_regroups_scores() {
        let mut cm = sample();
        score(&mut cm, &NameSum);
        cm.set_identities(vec![
            Identity::Known(7),
            Identity::Known(8),
            Identity::Known(8),
            Identity::Unknown,
        ]);
        let scores = cm.scores().unwrap();
        assert_eq!(scores.identity_scores.len(), scores.groups.len());
        assert_eq!(scores.groups.len(), 3);
        let top = cm.top_identities(3);
        assert_eq!(top[0].identity, Identity::Known(7));
    }

    #[test]
    fn mutation_drops_stale_scores() {
        let mut cm = sample();
        score(&mut cm, &ChipSum);
        cm.retain_correspondences(0, &[0]);
        assert!(cm.scores().is_none());
    }

    #[test]
    fn retain_annots_keeps_alignment() {
        let mut cm = sample();
        cm.retain_annots(&[2, 0]);
        assert_eq!(cm.daids, vec![12, 10]);
        assert_eq!(cm.fm[1].len(), 2);
        assert_eq!(cm.homographies.len(), 2);
    }
}
