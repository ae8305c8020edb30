use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use pelage::ann::AnnParams;
use pelage::config::{PipelineRoot, QueryConfig};
use pelage::features::{AnnotationRecord, InMemoryFeatureStore};
use pelage::pool::{CancelToken, WorkerPool};
use pelage::smk::InvertedIndex;
use pelage::types::{FeatureSet, Identity, Keypoint, Vector};
use pelage::vocab::VisualVocabulary;

const DIM: usize = 32;

fn random_vectors(rng: &mut StdRng, n: usize) -> Vec<Vector> {
    (0..n)
        .map(|_| (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

fn bench_inverted_build(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut vocab = VisualVocabulary::from_words(random_vectors(&mut rng, 256));
    vocab.build_index(&AnnParams::default()).unwrap();

    let mut store = InMemoryFeatureStore::new();
    let daids: Vec<u64> = (0..200).collect();
    for &aid in &daids {
        let vectors = random_vectors(&mut rng, 150);
        let keypoints = (0..vectors.len())
            .map(|i| Keypoint::new(i as f32, (i * 7 % 100) as f32))
            .collect();
        store
            .insert(AnnotationRecord {
                aid,
                identity: Identity::Known(aid / 4),
                species: None,
                features: FeatureSet::new(keypoints, vectors),
                foreground: None,
            })
            .unwrap();
    }

    let params = QueryConfig {
        pipeline_root: PipelineRoot::Smk,
        num_words: 256,
        assignment_k: 3,
        ..Default::default()
    }
    .resolve()
    .unwrap();
    let cancel = CancelToken::new();

    let mut group = c.benchmark_group("inverted_index_build");
    for workers in [1, 4] {
        let pool = WorkerPool::new(workers);
        group.bench_function(format!("workers_{workers}"), |b| {
            b.iter(|| {
                let (index, _) =
                    InvertedIndex::build(&vocab, &store, black_box(&daids), &params, &pool, &cancel)
                        .unwrap();
                black_box(index.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_inverted_build);
criterion_main!(benches);
