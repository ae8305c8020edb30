//! One-vs-one matching
//!
//! Each gallery annotation is searched against an index over the query's own
//! descriptors, and the resulting pairs are flipped back so a ChipMatch is
//! always query feature first.

use std::sync::Arc;

use super::neighbors::NeighborIndex;
use super::weights::{
    baseline_filter, group_by_owner, read_foreground, weight_neighbors, Foreground,
    IdentityCache, WeightedNeighbors,
};
use crate::ann::{AnnIndex, AnnParams};
use crate::chipmatch::ChipMatch;
use crate::config::ResolvedParams;
use crate::features::FeatureStore;
use crate::types::{Aid, FeatureSet};
use crate::Result;

pub const VSONE_RATIO_CHANNEL: &str = "vsone_ratio";

/// Searches of one query in one-vs-one mode.
pub struct VsoneSearch {
    /// Index over the query's own descriptors.
    pub index: NeighborIndex,
    pub foreground: Option<Arc<Vec<f32>>>,
    /// One search per readable gallery annotation, in gallery order.
    pub searches: Vec<WeightedNeighbors>,
}

/// Search the descriptors of every gallery annotation against those of `qaid`.
///
/// # Returns
/// * `None` when the query has no readable descriptors
pub fn search_gallery(
    qaid: Aid,
    daids: &[Aid],
    store: &dyn FeatureStore,
    params: &ResolvedParams,
) -> Result<Option<VsoneSearch>> {
    let (index, _) = NeighborIndex::build(store, &[qaid], params)?;
    if index.is_empty() {
        return Ok(None);
    }
    let foreground = if params.fg_on {
        read_foreground(store, qaid)?
    } else {
        None
    };
    let num_neighbors = params.k + params.knorm;

    let mut searches = Vec::with_capacity(daids.len());
    for &daid in daids {
        let gallery = match store.get_descriptors(daid) {
            Ok(gallery) => gallery,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(qaid, daid, error = %err, "Skipping unreadable gallery annotation");
                continue;
            }
        };
        if gallery.is_empty() {
            continue;
        }
        if gallery.dim() != Some(index.dim()) {
            tracing::warn!(qaid, daid, "Descriptor dimension mismatch; skipping annotation");
            continue;
        }
        let hits = index.search(&gallery.vectors, num_neighbors)?;
        searches.push(WeightedNeighbors::new(daid, hits, params.k));
    }
    Ok(Some(VsoneSearch {
        index,
        foreground,
        searches,
    }))
}

impl VsoneSearch {
    /// Apply the baseline filter to every gallery search.
    pub fn filter(&mut self, params: &ResolvedParams, identities: &mut IdentityCache<'_>) {
        for wn in &mut self.searches {
            let identity = identities.get(wn.aid);
            baseline_filter(wn, &self.index, identity, params, identities);
        }
    }

    /// Compute the score channels of every gallery search.
    pub fn weigh(&mut self, params: &ResolvedParams) {
        let foreground = if params.fg_on {
            Foreground::Indexed(self.foreground.as_deref().map(Vec::as_slice).unwrap_or(&[]))
        } else {
            Foreground::Off
        };
        for wn in &mut self.searches {
            weight_neighbors(wn, &self.index, params, foreground);
        }
    }

    /// Collect the valid pairs of every gallery search into a ChipMatch of `qaid`.
    pub fn into_chipmatch(
        self,
        qaid: Aid,
        labels: &[String],
        identities: &mut IdentityCache<'_>,
    ) -> ChipMatch {
        let mut cm = ChipMatch::new(qaid, labels.to_vec());
        for wn in &self.searches {
            // Every indexed row belongs to the query.
            if let Some(found) = group_by_owner(wn, &self.index).remove(&qaid) {
                let found = found.flipped();
                cm.push_annot(wn.aid, identities.get(wn.aid), found.fm, found.fsv, found.fk);
            }
        }
        cm
    }
}

/// Mutual nearest neighbors between two descriptor sets that pass the ratio test.
///
/// Returns `(query feature, gallery feature, 1 - ratio)` in query feature order.
pub fn mutual_ratio_matches(
    query: &FeatureSet,
    gallery: &FeatureSet,
    ratio_thresh: f32,
) -> Result<Vec<(usize, usize, f32)>> {
    if query.is_empty() || gallery.is_empty() {
        return Ok(Vec::new());
    }
    let exact = AnnParams {
        exact_threshold: usize::MAX,
        ..AnnParams::default()
    };
    let gallery_index = AnnIndex::build(&gallery.vectors, &exact)?;
    let query_index = AnnIndex::build(&query.vectors, &exact)?;

    let mut matches = Vec::new();
    for (qfx, vector) in query.vectors.iter().enumerate() {
        let hits = gallery_index.knn(vector, 2)?;
        let Some(best) = hits.first() else {
            continue;
        };
        let back = query_index.knn(gallery_index.vector(best.index), 1)?;
        if back.first().map(|n| n.index) != Some(qfx) {
            continue;
        }
        let ratio = match hits.get(1) {
            Some(second) if second.distance > 0.0 => {
                (best.distance.max(0.0) / second.distance).sqrt()
            }
            Some(_) => 1.0,
            None => 0.0,
        };
        if ratio < ratio_thresh {
            matches.push((qfx, best.index, 1.0 - ratio));
        }
    }
    Ok(matches)
}

/// Re-score the best annotations of `cm` with mutual ratio matching.
///
/// The ChipMatch is replaced by one over the shortlist with a single
/// [`VSONE_RATIO_CHANNEL`]; verified transforms are kept.
pub fn rerank(
    cm: &mut ChipMatch,
    query: &FeatureSet,
    store: &dyn FeatureStore,
    params: &ResolvedParams,
) -> Result<()> {
    let mut order: Vec<(usize, f32)> = cm.chipsum().into_iter().enumerate().collect();
    order.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(cm.daids[a.0].cmp(&cm.daids[b.0]))
    });
    order.truncate(params.rerank_shortlist);

    let mut reranked = ChipMatch::new(cm.qaid, vec![VSONE_RATIO_CHANNEL.to_string()]);
    for (dx, _) in order {
        let daid = cm.daids[dx];
        let gallery = match store.get_descriptors(daid) {
            Ok(gallery) => gallery,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(qaid = cm.qaid, daid, error = %err, "Dropping annotation from rerank");
                continue;
            }
        };
        let matches = mutual_ratio_matches(query, &gallery, params.ratio_thresh)?;
        let fm = matches.iter().map(|(q, d, _)| (*q, *d)).collect();
        let fsv = matches.iter().map(|(_, _, s)| vec![*s]).collect();
        let fk = vec![0; matches.len()];
        reranked.push_annot(daid, cm.dnids[dx], fm, fsv, fk);
        if let Some(last) = reranked.homographies.last_mut() {
            *last = cm.homographies[dx];
        }
    }
    tracing::debug!(
        qaid = cm.qaid,
        before = cm.len(),
        after = reranked.len(),
        "Reranked shortlist"
    );
    *cm = reranked;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineRoot, QueryConfig};
    use crate::features::{AnnotationRecord, InMemoryFeatureStore};
    use crate::pipeline::weights::channel_labels;
    use crate::types::{Identity, Keypoint, Vector};

    fn features(vectors: Vec<Vector>) -> FeatureSet {
        let keypoints = (0..vectors.len())
            .map(|i| Keypoint::new(i as f32, 0.0))
            .collect();
        FeatureSet::new(keypoints, vectors)
    }

    fn store() -> InMemoryFeatureStore {
        let mut store = InMemoryFeatureStore::new();
        let annots = [
            (1, Identity::Known(1), vec![vec![0.0, 0.0], vec![5.0, 5.0]]),
            (2, Identity::Known(2), vec![vec![0.1, 0.0], vec![5.0, 5.1]]),
            (3, Identity::Known(3), vec![vec![9.0, -9.0]]),
        ];
        for (aid, identity, vectors) in annots {
            store
                .insert(AnnotationRecord {
                    aid,
                    identity,
                    species: None,
                    features: features(vectors),
                    foreground: None,
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn pairs_are_query_feature_first() {
        let store = store();
        let params = QueryConfig {
            pipeline_root: PipelineRoot::Vsone,
            k: 1,
            knorm: 1,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let mut identities = IdentityCache::new(&store);
        let labels = channel_labels(&params);
        let mut search = search_gallery(1, &[2, 3, 1], &store, &params)
            .unwrap()
            .unwrap();
        assert_eq!(search.searches.len(), 3);
        search.filter(&params, &mut identities);
        search.weigh(&params);
        let cm = search.into_chipmatch(1, &labels, &mut identities);

        assert_eq!(cm.daids, vec![2, 3]);
        assert_eq!(cm.fm[0], vec![(0, 0), (1, 1)]);
        assert_eq!(cm.dnids[0], Identity::Known(2));
    }

    #[test]
    fn query_without_descriptors_has_no_search() {
        let store = store();
        let params = QueryConfig {
            pipeline_root: PipelineRoot::Vsone,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert!(search_gallery(42, &[1, 2], &store, &params)
            .unwrap()
            .is_none());
    }

    #[test]
    fn mutual_matches_pass_ratio_test() {
        let q = features(vec![vec![0.0, 0.0], vec![10.0, 10.0]]);
        let d = features(vec![vec![10.0, 10.2], vec![0.1, 0.0], vec![50.0, 50.0]]);
        let matches = mutual_ratio_matches(&q, &d, 0.8).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!((matches[0].0, matches[0].1), (0, 1));
        assert_eq!((matches[1].0, matches[1].1), (1, 0));
    }

    #[test]
    fn rerank_keeps_shortlist_only() {
        let store = store();
        let params = QueryConfig {
            pipeline_root: PipelineRoot::Vsone,
            rerank_on: true,
            rerank_shortlist: 1,
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let mut cm = ChipMatch::new(1, vec!["lnbnn".into()]);
        cm.push_annot(2, Identity::Known(2), vec![(0, 0)], vec![vec![0.9]], vec![0]);
        cm.push_annot(3, Identity::Known(3), vec![(0, 0)], vec![vec![0.1]], vec![0]);
        let query = store.get_descriptors(1).unwrap();
        rerank(&mut cm, &query, &store, &params).unwrap();

        assert_eq!(cm.daids, vec![2]);
        assert_eq!(cm.fsv_labels, vec![VSONE_RATIO_CHANNEL.to_string()]);
        assert_eq!(cm.fm[0].len(), 2);
    }
}
