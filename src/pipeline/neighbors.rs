//! Nearest-neighbor index over the descriptors of a gallery

use std::collections::HashSet;
use std::path::Path;

use crate::ann::{AnnIndex, AnnParams, Neighbor};
use crate::config::ResolvedParams;
use crate::features::FeatureStore;
use crate::pool::BuildReport;
use crate::types::{Aid, Vector};
use crate::Result;

/// Descriptors of several annotations stacked into one searchable index.
///
/// Row `i` of the index is feature `owners[i].1` of annotation `owners[i].0`.
pub struct NeighborIndex {
    key: String,
    ann: AnnIndex,
    owners: Vec<(Aid, u32)>,
    aids: Vec<Aid>,
}

struct Gathered {
    vectors: Vec<Vector>,
    owners: Vec<(Aid, u32)>,
    aids: Vec<Aid>,
    report: BuildReport,
}

pub fn ann_params(params: &ResolvedParams) -> AnnParams {
    AnnParams {
        exact_threshold: params.ann_exact_threshold,
        nlist: params.ann_nlist,
        nprobe: params.ann_nprobe,
        ..AnnParams::default()
    }
}

impl NeighborIndex {
    /// Index the descriptors of `daids`; unreadable annotations are skipped.
    pub fn build(
        store: &dyn FeatureStore,
        daids: &[Aid],
        params: &ResolvedParams,
    ) -> Result<(Self, BuildReport)> {
        let gathered = gather(store, daids)?;
        let ann = AnnIndex::build(&gathered.vectors, &ann_params(params))?;
        Ok(Self::assemble(params.nn_key(daids), ann, gathered))
    }

    /// Like [`NeighborIndex::build`], reusing the index structure cached in `dir`.
    pub fn load_or_build(
        dir: &Path,
        store: &dyn FeatureStore,
        daids: &[Aid],
        params: &ResolvedParams,
    ) -> Result<(Self, BuildReport)> {
        let gathered = gather(store, daids)?;
        let key = params.nn_key(daids);
        let path = dir.join(format!("{key}.ann"));
        let ann = AnnIndex::load_or_build(&path, &gathered.vectors, &ann_params(params))?;
        Ok(Self::assemble(key, ann, gathered))
    }

    fn assemble(key: String, ann: AnnIndex, gathered: Gathered) -> (Self, BuildReport) {
        tracing::debug!(
            key = %key,
            num_annots = gathered.aids.len(),
            num_vectors = gathered.vectors.len(),
            exact = ann.is_exact(),
            "Neighbor index ready"
        );
        let index = Self {
            key,
            ann,
            owners: gathered.owners,
            aids: gathered.aids,
        };
        (index, gathered.report)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Annotations with at least one indexed descriptor.
    pub fn aids(&self) -> &[Aid] {
        &self.aids
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.ann.dim()
    }

    /// Annotation and feature index of row `index`.
    pub fn owner(&self, index: usize) -> (Aid, usize) {
        let (aid, fx) = self.owners[index];
        (aid, fx as usize)
    }

    /// The `k` nearest rows of each query descriptor, ascending by distance.
    pub fn search(&self, vectors: &[Vector], k: usize) -> Result<Vec<Vec<Neighbor>>> {
        if self.is_empty() {
            return Ok(vec![Vec::new(); vectors.len()]);
        }
        self.ann.knn_batch(vectors, k)
    }
}

fn gather(store: &dyn FeatureStore, daids: &[Aid]) -> Result<Gathered> {
    let mut gathered = Gathered {
        vectors: Vec::new(),
        owners: Vec::new(),
        aids: Vec::new(),
        report: BuildReport::default(),
    };
    let mut dim: Option<usize> = None;
    let mut seen = HashSet::with_capacity(daids.len());

    for &aid in daids {
        if !seen.insert(aid) {
            continue;
        }
        let features = match store.get_descriptors(aid) {
            Ok(features) => features,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(aid, error = %err, "Leaving annotation out of neighbor index");
                gathered.report.skipped.push((aid, err.to_string()));
                continue;
            }
        };
        let Some(annot_dim) = features.dim() else {
            continue;
        };
        match dim {
            Some(expected) if expected != annot_dim => {
                let reason = format!("descriptor dimension {annot_dim}, expected {expected}");
                tracing::warn!(aid, reason = %reason, "Leaving annotation out of neighbor index");
                gathered.report.skipped.push((aid, reason));
                continue;
            }
            _ => dim = Some(annot_dim),
        }
        for (fx, vector) in features.vectors.iter().enumerate() {
            gathered.vectors.push(vector.clone());
            gathered.owners.push((aid, fx as u32));
        }
        gathered.aids.push(aid);
        gathered.report.built += 1;
    }
    Ok(gathered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::features::{AnnotationRecord, InMemoryFeatureStore};
    use crate::types::{FeatureSet, Identity, Keypoint};
    use crate::Error;

    fn record(aid: Aid, vectors: Vec<Vector>) -> AnnotationRecord {
        let keypoints = vectors.iter().map(|_| Keypoint::new(0.0, 0.0)).collect();
        AnnotationRecord {
            aid,
            identity: Identity::Unknown,
            species: None,
            features: FeatureSet::new(keypoints, vectors),
            foreground: None,
        }
    }

    #[test]
    fn rows_map_back_to_annotation_features() {
        let mut store = InMemoryFeatureStore::new();
        store
            .insert(record(1, vec![vec![0.0, 0.0], vec![1.0, 0.0]]))
            .unwrap();
        store.insert(record(2, vec![vec![5.0, 5.0]])).unwrap();
        let params = QueryConfig::default().resolve().unwrap();

        let (index, report) = NeighborIndex::build(&store, &[1, 2, 3], &params).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.aids(), &[1, 2]);
        assert_eq!(report.skipped.len(), 1);

        let hits = index.search(&[vec![4.9, 5.0]], 2).unwrap();
        assert_eq!(index.owner(hits[0][0].index), (2, 0));
        assert_eq!(index.owner(hits[0][1].index), (1, 1));
    }

    #[test]
    fn repeated_gallery_ids_are_indexed_once() {
        let mut store = InMemoryFeatureStore::new();
        store.insert(record(1, vec![vec![0.0, 0.0]])).unwrap();
        store.insert(record(2, vec![vec![1.0, 1.0], vec![2.0, 2.0]])).unwrap();
        let params = QueryConfig::default().resolve().unwrap();

        let (index, report) =
            NeighborIndex::build(&store, &[2, 1, 2, 7, 1, 7], &params).unwrap();
        assert_eq!(index.aids(), &[2, 1]);
        assert_eq!(index.len(), 3);
        assert_eq!(report.built, 2);
        assert_eq!(report.skipped, vec![(7, Error::AnnotationNotFound(7).to_string())]);
    }

    #[test]
    fn empty_gallery_yields_no_neighbors() {
        let store = InMemoryFeatureStore::new();
        let params = QueryConfig::default().resolve().unwrap();
        let (index, _) = NeighborIndex::build(&store, &[], &params).unwrap();
        let hits = index.search(&[vec![1.0, 2.0]], 3).unwrap();
        assert_eq!(hits, vec![Vec::<Neighbor>::new()]);
    }
}
