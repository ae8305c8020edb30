//! End-to-end matching through the query service

use std::collections::BTreeSet;
use std::sync::Arc;

use pelage::chipmatch::{ChipSum, NameSum};
use pelage::config::{PipelineRoot, QueryConfig, ServiceSection, SvTransform};
use pelage::features::{AnnotationRecord, FeatureStore, InMemoryFeatureStore};
use pelage::pipeline::weights::{baseline_filter, weight_neighbors, Foreground, IdentityCache};
use pelage::pipeline::{estimate_transform_ransac, NeighborIndex, SvConfig, WeightedNeighbors};
use pelage::request::QueryRequest;
use pelage::service::QueryService;
use pelage::types::{Aid, FeatureSet, Identity, Keypoint, Vector};

fn insert(
    store: &mut InMemoryFeatureStore,
    aid: Aid,
    identity: Identity,
    keypoints: Vec<Keypoint>,
    vectors: Vec<Vector>,
) {
    store
        .insert(AnnotationRecord {
            aid,
            identity,
            species: None,
            features: FeatureSet::new(keypoints, vectors),
            foreground: None,
        })
        .unwrap();
}

fn line_keypoints(n: usize) -> Vec<Keypoint> {
    (0..n).map(|i| Keypoint::new(i as f32 * 3.0, (i % 2) as f32)).collect()
}

fn service(store: InMemoryFeatureStore) -> QueryService {
    let settings = ServiceSection {
        workers: 2,
        ..Default::default()
    };
    QueryService::init(Arc::new(store), settings).unwrap()
}

/// Query 1 matches annotations 10 and 11 (identity 100) and nothing of 12 (identity 200).
fn shared_identity_store() -> InMemoryFeatureStore {
    let mut store = InMemoryFeatureStore::new();
    insert(
        &mut store,
        1,
        Identity::Unknown,
        line_keypoints(2),
        vec![vec![0.0, 0.0], vec![5.0, 5.0]],
    );
    insert(&mut store, 10, Identity::Known(100), line_keypoints(1), vec![vec![0.0, 0.1]]);
    insert(&mut store, 11, Identity::Known(100), line_keypoints(1), vec![vec![5.0, 5.1]]);
    insert(&mut store, 12, Identity::Known(200), line_keypoints(1), vec![vec![50.0, 50.0]]);
    store
}

#[test]
fn namesum_ranks_shared_identity_first() {
    let service = service(shared_identity_store());
    let config = QueryConfig {
        k: 1,
        knorm: 1,
        ..Default::default()
    };
    let results = service.run_query(&[1], &[10, 11, 12], &config).unwrap();
    let cm = &results[&1];

    let matched: BTreeSet<Aid> = cm.daids.iter().copied().collect();
    assert_eq!(matched, BTreeSet::from([10, 11]));

    let top = cm.top_identities(2);
    assert_eq!(top[0].identity, Identity::Known(100));
    let chipsum: f32 = cm.chipsum().iter().sum();
    assert!((top[0].score - chipsum).abs() < 1e-5);
    if let Some(other) = top.get(1) {
        assert!(other.score < top[0].score);
    }
}

#[test]
fn identity_scores_follow_relabeling() {
    let service = service(shared_identity_store());
    let config = QueryConfig {
        k: 1,
        knorm: 1,
        ..Default::default()
    };
    let mut results = service.run_query(&[1], &[10, 11, 12], &config).unwrap();
    let cm = results.get_mut(&1).unwrap();
    let scores = cm.scores().cloned().unwrap();
    assert_eq!(scores.identity_scores.len(), 1);

    let dnids = cm.dnids.clone();
    cm.set_identities(dnids.clone());
    cm.set_identities(dnids);
    assert_eq!(cm.scores(), Some(&scores));

    // Splitting the identity yields one group per annotation.
    cm.set_identities(vec![Identity::Known(100), Identity::Known(101)]);
    let regrouped = cm.scores().unwrap();
    assert_eq!(regrouped.identity_scores.len(), 2);
    assert_eq!(regrouped.annot_scores, scores.annot_scores);
}

#[test]
fn switching_strategy_rederives_both_levels() {
    let store: Arc<InMemoryFeatureStore> = Arc::new(shared_identity_store());
    let params = Arc::new(
        QueryConfig {
            k: 1,
            knorm: 1,
            ..Default::default()
        }
        .resolve()
        .unwrap(),
    );
    let request = QueryRequest::new(vec![1], vec![10, 11, 12], params.clone(), store.clone())
        .unwrap()
        .with_strategy(Box::new(ChipSum));
    let csum = pelage::pipeline::execute(&request).unwrap().remove(0);
    let request = QueryRequest::new(vec![1], vec![10, 11, 12], params, store)
        .unwrap()
        .with_strategy(Box::new(NameSum));
    let nsum = pelage::pipeline::execute(&request).unwrap().remove(0);

    let csum_scores = csum.scores().unwrap();
    let nsum_scores = nsum.scores().unwrap();
    assert_eq!(csum_scores.annot_scores, nsum_scores.annot_scores);
    let max = csum_scores.annot_scores.iter().cloned().fold(0.0f32, f32::max);
    let sum: f32 = nsum_scores.annot_scores.iter().sum();
    assert!((csum_scores.identity_scores[0] - max).abs() < 1e-6);
    assert!((nsum_scores.identity_scores[0] - sum).abs() < 1e-6);
}

#[test]
fn filters_only_clear_candidates() {
    let mut store = shared_identity_store();
    store.set_identity(1, Identity::Known(100)).unwrap();
    let params = QueryConfig {
        k: 3,
        knorm: 1,
        ratio_on: true,
        ratio_thresh: 0.5,
        can_match_samename: false,
        ..Default::default()
    }
    .resolve()
    .unwrap();

    let (index, _) = NeighborIndex::build(&store, &[1, 10, 11, 12], &params).unwrap();
    let query = store.get_descriptors(1).unwrap();
    let hits = index.search(&query.vectors, params.k + params.knorm).unwrap();
    let mut wn = WeightedNeighbors::new(1, hits, params.k);
    let all: BTreeSet<(usize, usize)> = wn.valid_pairs().into_iter().collect();

    let mut identities = IdentityCache::new(&store);
    baseline_filter(&mut wn, &index, Identity::Known(100), &params, &mut identities);
    let filtered: BTreeSet<(usize, usize)> = wn.valid_pairs().into_iter().collect();
    weight_neighbors(&mut wn, &index, &params, Foreground::Off);
    let weighted: BTreeSet<(usize, usize)> = wn.valid_pairs().into_iter().collect();

    assert!(filtered.is_subset(&all));
    assert!(weighted.is_subset(&filtered));
    // Self and same-name neighbors are gone; only identity 200 could remain.
    for (fx, rank) in weighted {
        let (owner, _) = index.owner(wn.neighbors[fx][rank].index);
        assert_eq!(owner, 12);
    }
    // Alignment with the search output is untouched.
    assert_eq!(wn.valid.len(), query.len());
}

fn scattered_points() -> Vec<(f64, f64)> {
    (0..12)
        .map(|i| {
            let i = i as f64;
            ((i * 37.0) % 101.0, (i * 53.0) % 89.0 + i)
        })
        .collect()
}

#[test]
fn ransac_keeps_translation_and_drops_outliers() {
    let src = scattered_points();
    let mut dst: Vec<(f64, f64)> = src.iter().map(|(x, y)| (x + 20.0, y - 7.5)).collect();
    dst[3] = (400.0, -300.0);
    dst[8] = (-250.0, 180.0);

    let config = SvConfig {
        transform: SvTransform::Affine,
        xy_thresh: 0.01,
        min_inliers: 4,
        max_iterations: 200,
        seed: 11,
    };
    let result = estimate_transform_ransac(&src, &dst, 1.0, &config, 5).unwrap();
    let inliers: BTreeSet<usize> = result.inliers.iter().copied().collect();
    assert_eq!(inliers.len(), src.len() - 2);
    assert!(!inliers.contains(&3));
    assert!(!inliers.contains(&8));
    assert!((result.transform[(0, 2)] - 20.0).abs() < 1e-3);
    assert!((result.transform[(1, 2)] + 7.5).abs() < 1e-3);
}

#[test]
fn spatial_verification_in_pipeline() {
    let points = scattered_points();
    let n = points.len();
    let query_kps: Vec<Keypoint> = points
        .iter()
        .map(|(x, y)| Keypoint::new(*x as f32, *y as f32))
        .collect();
    let mut gallery_kps: Vec<Keypoint> = points
        .iter()
        .map(|(x, y)| Keypoint::new(*x as f32 + 15.0, *y as f32 + 4.0))
        .collect();
    gallery_kps[2] = Keypoint::new(-120.0, 260.0);
    gallery_kps[9] = Keypoint::new(310.0, -40.0);

    let query_vecs: Vec<Vector> = (0..n).map(|i| vec![i as f32 * 10.0, 0.0]).collect();
    let gallery_vecs: Vec<Vector> = (0..n).map(|i| vec![i as f32 * 10.0 + 0.2, 0.0]).collect();

    let mut store = InMemoryFeatureStore::new();
    insert(&mut store, 1, Identity::Unknown, query_kps, query_vecs);
    insert(&mut store, 2, Identity::Known(7), gallery_kps, gallery_vecs);

    let config = QueryConfig {
        k: 1,
        knorm: 1,
        spatial_verification_on: true,
        sv_transform: SvTransform::Affine,
        ..Default::default()
    };
    let results = service(store).run_query(&[1], &[2], &config).unwrap();
    let cm = &results[&1];
    assert_eq!(cm.daids, vec![2]);

    let kept: BTreeSet<usize> = cm.fm[0].iter().map(|(qfx, _)| *qfx).collect();
    assert_eq!(kept.len(), n - 2);
    assert!(!kept.contains(&2));
    assert!(!kept.contains(&9));
    let transform = cm.homographies[0].unwrap();
    assert!((transform[(0, 2)] - 15.0).abs() < 1e-2);
    assert!((transform[(1, 2)] - 4.0).abs() < 1e-2);
}

#[test]
fn vsone_root_with_rerank() {
    let config = QueryConfig {
        pipeline_root: PipelineRoot::Vsone,
        k: 1,
        knorm: 1,
        rerank_on: true,
        rerank_shortlist: 1,
        ..Default::default()
    };
    let results = service(shared_identity_store())
        .run_query(&[1], &[10, 11, 12], &config)
        .unwrap();
    let cm = &results[&1];
    assert!(cm.len() <= 1);
    assert_eq!(cm.fsv_labels, vec!["vsone_ratio".to_string()]);
}

#[test]
fn empty_query_yields_empty_match() {
    let mut store = shared_identity_store();
    insert(&mut store, 5, Identity::Unknown, Vec::new(), Vec::new());
    let results = service(store)
        .run_query(&[5, 1], &[10, 11, 12], &QueryConfig::default())
        .unwrap();
    assert!(results[&5].is_empty());
    assert!(results[&5].top_identities(3).is_empty());
    assert_eq!(results.len(), 2);
}
