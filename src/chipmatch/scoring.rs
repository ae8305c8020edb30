//! Scoring strategies over ChipMatch correspondences

use super::{ChipMatch, NameCombine, SMK_CHANNEL};
use crate::config::ScoreMethod;
use crate::types::Keypoint;

/// Inputs a strategy may need beyond the ChipMatch itself.
pub struct ScoringContext<'a> {
    /// Keypoints of the query annotation, indexed by query feature.
    pub query_keypoints: &'a [Keypoint],
    pub coverage: &'a dyn CoverageScorer,
}

/// One way of turning correspondences into per-annotation scores.
pub trait ScoringStrategy: Send + Sync {
    fn method(&self) -> ScoreMethod;

    /// How annotation scores combine into identity scores.
    fn combine(&self) -> NameCombine;

    /// One score per gallery annotation of `cm`.
    fn annot_scores(&self, cm: &ChipMatch, ctx: &ScoringContext<'_>) -> Vec<f32>;
}

/// Fraction of the query explained by a set of weighted query features.
pub trait CoverageScorer: Send + Sync {
    /// # Arguments
    /// * `keypoints` - all query keypoints
    /// * `matched` - `(query feature, weight)` of each correspondence
    fn coverage(&self, keypoints: &[Keypoint], matched: &[(usize, f32)]) -> f32;
}

/// Splits the query keypoint extent into a `grid x grid` lattice.
///
/// Each cell takes the largest correspondence weight inside it, clipped to
/// `[0, 1]`; coverage is the mean over all cells.
#[derive(Debug, Clone)]
pub struct GridCoverage {
    pub grid: usize,
}

impl Default for GridCoverage {
    fn default() -> Self {
        Self { grid: 8 }
    }
}

impl CoverageScorer for GridCoverage {
    fn coverage(&self, keypoints: &[Keypoint], matched: &[(usize, f32)]) -> f32 {
        let grid = self.grid.max(1);
        if keypoints.is_empty() || matched.is_empty() {
            return 0.0;
        }
        let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
        let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
        for kp in keypoints {
            min_x = min_x.min(kp.x);
            min_y = min_y.min(kp.y);
            max_x = max_x.max(kp.x);
            max_y = max_y.max(kp.y);
        }
        let width = (max_x - min_x).max(f32::EPSILON);
        let height = (max_y - min_y).max(f32::EPSILON);

        let mut cells = vec![0.0f32; grid * grid];
        for &(qfx, weight) in matched {
            let Some(kp) = keypoints.get(qfx) else {
                continue;
            };
            let cx = (((kp.x - min_x) / width * grid as f32) as usize).min(grid - 1);
            let cy = (((kp.y - min_y) / height * grid as f32) as usize).min(grid - 1);
            let cell = &mut cells[cy * grid + cx];
            *cell = cell.max(weight.clamp(0.0, 1.0));
        }
        cells.iter().sum::<f32>() / cells.len() as f32
    }
}

/// Sum of channel products over correspondences; identities rank by their best annotation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChipSum;

impl ScoringStrategy for ChipSum {
    fn method(&self) -> ScoreMethod {
        ScoreMethod::Csum
    }

    fn combine(&self) -> NameCombine {
        NameCombine::Max
    }

    fn annot_scores(&self, cm: &ChipMatch, _ctx: &ScoringContext<'_>) -> Vec<f32> {
        cm.chipsum()
    }
}

/// ChipSum annotation scores, summed per identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameSum;

impl ScoringStrategy for NameSum {
    fn method(&self) -> ScoreMethod {
        ScoreMethod::Nsum
    }

    fn combine(&self) -> NameCombine {
        NameCombine::Sum
    }

    fn annot_scores(&self, cm: &ChipMatch, _ctx: &ScoringContext<'_>) -> Vec<f32> {
        cm.chipsum()
    }
}

fn coverage_scores(cm: &ChipMatch, ctx: &ScoringContext<'_>) -> Vec<f32> {
    (0..cm.len())
        .map(|dx| {
            let matched: Vec<(usize, f32)> = cm.fm[dx]
                .iter()
                .zip(cm.correspondence_scores(dx))
                .map(|((qfx, _), weight)| (*qfx, weight))
                .collect();
            ctx.coverage.coverage(ctx.query_keypoints, &matched)
        })
        .collect()
}

/// Query coverage per annotation; an identity takes its best annotation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotCoverage;

impl ScoringStrategy for AnnotCoverage {
    fn method(&self) -> ScoreMethod {
        ScoreMethod::AnnotCoverage
    }

    fn combine(&self) -> NameCombine {
        NameCombine::Max
    }

    fn annot_scores(&self, cm: &ChipMatch, ctx: &ScoringContext<'_>) -> Vec<f32> {
        coverage_scores(cm, ctx)
    }
}

/// Query coverage per annotation, accumulated per identity and saturating at 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameCoverage;

impl ScoringStrategy for NameCoverage {
    fn method(&self) -> ScoreMethod {
        ScoreMethod::NameCoverage
    }

    fn combine(&self) -> NameCombine {
        NameCombine::ClippedSum
    }

    fn annot_scores(&self, cm: &ChipMatch, ctx: &ScoringContext<'_>) -> Vec<f32> {
        coverage_scores(cm, ctx)
    }
}

/// Sum of the kernel channel, which adds up to the pairwise SMK similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmkScore;

impl ScoringStrategy for SmkScore {
    fn method(&self) -> ScoreMethod {
        ScoreMethod::Smk
    }

    fn combine(&self) -> NameCombine {
        NameCombine::Max
    }

    fn annot_scores(&self, cm: &ChipMatch, _ctx: &ScoringContext<'_>) -> Vec<f32> {
        match cm.channel(SMK_CHANNEL) {
            Some(cx) => cm
                .fsv
                .iter()
                .map(|fsv| fsv.iter().map(|channels| channels[cx]).sum())
                .collect(),
            None => vec![0.0; cm.len()],
        }
    }
}

pub fn strategy_for(method: ScoreMethod) -> Box<dyn ScoringStrategy> {
    match method {
        ScoreMethod::Csum => Box::new(ChipSum),
        ScoreMethod::Nsum => Box::new(NameSum),
        ScoreMethod::AnnotCoverage => Box::new(AnnotCoverage),
        ScoreMethod::NameCoverage => Box::new(NameCoverage),
        ScoreMethod::Smk => Box::new(SmkScore),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    fn square_keypoints() -> Vec<Keypoint> {
        vec![
            Keypoint::new(0.0, 0.0),
            Keypoint::new(10.0, 0.0),
            Keypoint::new(0.0, 10.0),
            Keypoint::new(10.0, 10.0),
        ]
    }

    #[test]
    fn grid_coverage_is_mean_of_cell_maxima() {
        let scorer = GridCoverage { grid: 2 };
        let kps = square_keypoints();
        assert_eq!(scorer.coverage(&kps, &[]), 0.0);
        let half = scorer.coverage(&kps, &[(0, 1.0), (0, 0.5), (3, 1.0)]);
        assert!((half - 0.5).abs() < 1e-6);
        let clipped = scorer.coverage(&kps, &[(0, 5.0), (1, 5.0), (2, 5.0), (3, 5.0)]);
        assert!((clipped - 1.0).abs() < 1e-6);
    }

    #[test]
    fn name_coverage_saturates() {
        let mut cm = ChipMatch::new(1, vec!["fg".into()]);
        for daid in [10, 11] {
            cm.push_annot(
                daid,
                Identity::Known(3),
                vec![(0, 0), (1, 0), (2, 0), (3, 0)],
                vec![vec![1.0]; 4],
                vec![0; 4],
            );
        }
        let kps = square_keypoints();
        let coverage = GridCoverage { grid: 2 };
        let ctx = ScoringContext {
            query_keypoints: &kps,
            coverage: &coverage,
        };
        cm.score(&NameCoverage, &ctx);
        assert_eq!(cm.top_identities(1)[0].score, 1.0);
        cm.score(&AnnotCoverage, &ctx);
        assert_eq!(cm.annot_scores().unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn smk_score_reads_only_the_kernel_channel() {
        let mut cm = ChipMatch::new(1, vec![SMK_CHANNEL.to_string()]);
        cm.push_annot(
            10,
            Identity::Known(1),
            vec![(0, 0), (0, 1)],
            vec![vec![0.2], vec![0.2]],
            vec![0, 0],
        );
        let coverage = GridCoverage::default();
        let ctx = ScoringContext {
            query_keypoints: &[],
            coverage: &coverage,
        };
        cm.score(strategy_for(ScoreMethod::Smk).as_ref(), &ctx);
        assert!((cm.annot_scores().unwrap()[0] - 0.4).abs() < 1e-6);
    }
}
