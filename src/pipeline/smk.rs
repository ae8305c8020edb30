//! Vocabulary-based matching with the selective match kernel

use crate::chipmatch::{ChipMatch, SMK_CHANNEL};
use crate::config::ResolvedParams;
use crate::features::FeatureStore;
use crate::smk::{word_contributions, AnnotWords, InvertedIndex};
use crate::types::Aid;
use crate::vocab::{AssignParams, VisualVocabulary};
use crate::Result;

use super::weights::IdentityCache;

/// Query words for `qaid`, or `None` when the annotation has nothing to match.
pub fn query_words(
    qaid: Aid,
    vocab: &VisualVocabulary,
    store: &dyn FeatureStore,
    params: &ResolvedParams,
) -> Result<Option<AnnotWords>> {
    let features = match store.get_descriptors(qaid) {
        Ok(features) => features,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            tracing::warn!(qaid, error = %err, "Cannot read query descriptors");
            return Ok(None);
        }
    };
    let assign = AssignParams::from_params(params);
    match AnnotWords::compute(qaid, vocab, &features.vectors, &assign, params.residual_int8) {
        Ok(words) if words.num_words() > 0 => Ok(Some(words)),
        Ok(_) => Ok(None),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            tracing::warn!(qaid, error = %err, "Cannot assign query descriptors");
            Ok(None)
        }
    }
}

/// Score `query` against every gallery annotation sharing a word with it.
///
/// Each shared word's kernel contribution is split evenly over the cross
/// product of the query and gallery features assigned to it, so the chipsum
/// of an annotation equals its SMK similarity to the query.
pub fn match_query(
    query: &AnnotWords,
    inverted: &InvertedIndex,
    params: &ResolvedParams,
    identities: &mut IdentityCache<'_>,
) -> ChipMatch {
    let qaid = query.aid;
    let mut cm = ChipMatch::new(qaid, vec![SMK_CHANNEL.to_string()]);
    let query_gamma = inverted.query_gamma(query);
    if query_gamma == 0.0 {
        return cm;
    }
    let query_identity = identities.get(qaid);
    let smk = inverted.smk_params();

    for ax in inverted.candidates(query) {
        let gallery = inverted.annot_at(ax);
        if gallery.aid == qaid {
            continue;
        }
        let gallery_identity = identities.get(gallery.aid);
        if !params.can_match_samename
            && query_identity.is_known()
            && gallery_identity == query_identity
        {
            continue;
        }

        let scale = query_gamma * inverted.gamma_at(ax);
        let mut fm = Vec::new();
        let mut fsv = Vec::new();
        for (_, qpos, dpos, score) in
            word_contributions(query, gallery, |wx| inverted.idf(wx), smk)
        {
            let qfxs = &query.fxs[qpos];
            let dfxs = &gallery.fxs[dpos];
            let pairs = qfxs.len() * dfxs.len();
            if pairs == 0 {
                continue;
            }
            let share = score * scale / pairs as f32;
            for &qfx in qfxs {
                for &dfx in dfxs {
                    fm.push((qfx, dfx));
                    fsv.push(vec![share]);
                }
            }
        }
        if !fm.is_empty() {
            let fk = vec![0; fm.len()];
            cm.push_annot(gallery.aid, gallery_identity, fm, fsv, fk);
        }
    }
    cm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::AnnParams;
    use crate::config::{PipelineRoot, QueryConfig, ScoreMethod};
    use crate::features::{AnnotationRecord, InMemoryFeatureStore};
    use crate::pool::{CancelToken, WorkerPool};
    use crate::smk::{smk_similarity, SmkParams};
    use crate::types::{FeatureSet, Identity, Keypoint, Vector};

    fn params() -> ResolvedParams {
        QueryConfig {
            pipeline_root: PipelineRoot::Smk,
            score_method: ScoreMethod::Smk,
            num_words: 4,
            residual_int8: false,
            smk_alpha: 1.0,
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    fn setup() -> (VisualVocabulary, InMemoryFeatureStore) {
        let mut vocab = VisualVocabulary::from_words(vec![
            vec![0.0, 0.0],
            vec![10.0, 0.0],
            vec![0.0, 10.0],
            vec![10.0, 10.0],
        ]);
        vocab.build_index(&AnnParams::default()).unwrap();

        let mut store = InMemoryFeatureStore::new();
        let annots: [(Aid, Identity, Vec<Vector>); 4] = [
            (1, Identity::Known(1), vec![vec![1.0, 0.5], vec![9.0, 0.5]]),
            (2, Identity::Known(1), vec![vec![1.0, 0.4], vec![9.0, 0.6], vec![1.1, 0.5]]),
            (3, Identity::Known(2), vec![vec![0.5, 9.0]]),
            (4, Identity::Unknown, vec![vec![9.5, 9.5]]),
        ];
        for (aid, identity, vectors) in annots {
            let keypoints = vectors.iter().map(|_| Keypoint::new(0.0, 0.0)).collect();
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
        (vocab, store)
    }

    #[test]
    fn chipsum_equals_kernel_similarity() {
        let (vocab, store) = setup();
        let params = params();
        let (inverted, _) = InvertedIndex::build(
            &vocab,
            &store,
            &[2, 3, 4],
            &params,
            &WorkerPool::new(2),
            &CancelToken::new(),
        )
        .unwrap();
        let query = query_words(1, &vocab, &store, &params).unwrap().unwrap();
        let mut identities = IdentityCache::new(&store);
        let cm = match_query(&query, &inverted, &params, &mut identities);

        assert_eq!(cm.daids, vec![2]);
        assert_eq!(cm.fm[0].len(), 3);
        let ax = 0;
        let expected = smk_similarity(
            &query,
            inverted.query_gamma(&query),
            inverted.annot_at(ax),
            inverted.gamma_at(ax),
            |wx| inverted.idf(wx),
            SmkParams::from_params(&params),
        );
        assert!((cm.chipsum()[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn empty_query_has_no_words() {
        let (vocab, mut store) = setup();
        store
            .insert(AnnotationRecord {
                aid: 9,
                identity: Identity::Unknown,
                species: None,
                features: FeatureSet::default(),
                foreground: None,
            })
            .unwrap();
        assert!(query_words(9, &vocab, &store, &params()).unwrap().is_none());
        assert!(query_words(77, &vocab, &store, &params()).unwrap().is_none());
    }
}
