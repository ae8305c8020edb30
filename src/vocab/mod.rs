//! Visual vocabulary
//!
//! `K` cluster centers ("words") in descriptor space with a nearest-neighbor
//! index over them. Descriptors are quantized to words with soft
//! multi-assignment weights.

pub mod kmeans;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ann::{AnnIndex, AnnParams};
use crate::config::{ResolvedParams, VocabAlgorithm};
use crate::persist;
use crate::types::{Vector, WordIndex};
use crate::{Error, Result};

pub use kmeans::{Clusterer, KMeans, MiniBatchKMeans};

/// Added to the nearest distance before scaling by `alpha`.
const MASSIGN_EPS: f32 = 0.001;

/// Per-descriptor word assignments, aligned with the input descriptors.
///
/// A descriptor whose candidates were all filtered out has empty lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiAssignment {
    pub wxs: Vec<Vec<WordIndex>>,
    pub maws: Vec<Vec<f32>>,
}

impl MultiAssignment {
    pub fn len(&self) -> usize {
        self.wxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wxs.is_empty()
    }

    /// Number of descriptors with at least one surviving word.
    pub fn num_assigned(&self) -> usize {
        self.wxs.iter().filter(|w| !w.is_empty()).count()
    }
}

/// Soft-assignment parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignParams {
    pub k: usize,
    pub alpha: f32,
    pub sigma: f32,
    pub equal_weights: bool,
}

impl AssignParams {
    pub fn from_params(params: &ResolvedParams) -> Self {
        Self {
            k: params.assignment_k,
            alpha: params.massign_alpha,
            sigma: params.massign_sigma,
            equal_weights: params.massign_equal_weights,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct VocabularyFile {
    cfgstr: String,
    words: Vec<Vector>,
}

#[derive(Debug)]
pub struct VisualVocabulary {
    cfgstr: String,
    words: Vec<Vector>,
    index: Option<AnnIndex>,
}

impl VisualVocabulary {
    /// Cluster a descriptor sample into `num_words` words and index them.
    pub fn build(
        sample: &[Vector],
        num_words: usize,
        algorithm: &dyn Clusterer,
        seed: u64,
    ) -> Result<Self> {
        if sample.is_empty() {
            tracing::error!(num_words, "Cannot build a vocabulary from zero descriptors");
            return Err(Error::EmptyTrainingSet(
                "vocabulary training sample is empty".into(),
            ));
        }
        if num_words > sample.len() {
            tracing::warn!(
                num_words,
                num_samples = sample.len(),
                "Fewer training descriptors than words; clamping vocabulary size"
            );
        }

        tracing::info!(
            num_words,
            num_samples = sample.len(),
            algorithm = algorithm.name(),
            "Building visual vocabulary"
        );
        let words = algorithm.cluster(sample, num_words, seed)?;
        let mut vocab = Self::from_words(words);
        vocab.build_index(&AnnParams {
            seed,
            ..AnnParams::default()
        })?;
        Ok(vocab)
    }

    /// Build from the query parameters' vocabulary settings.
    pub fn build_for(sample: &[Vector], params: &ResolvedParams) -> Result<Self> {
        let clusterer = clusterer_for(params);
        let mut vocab = Self::build(
            sample,
            params.num_words,
            clusterer.as_ref(),
            params.vocab_seed,
        )?;
        vocab.cfgstr = params.vocab_cfgstr();
        Ok(vocab)
    }

    /// Wrap precomputed words. The word index must be built before lookups.
    pub fn from_words(words: Vec<Vector>) -> Self {
        Self {
            cfgstr: String::new(),
            words,
            index: None,
        }
    }

    pub fn build_index(&mut self, params: &AnnParams) -> Result<()> {
        self.index = Some(AnnIndex::build(&self.words, params)?);
        Ok(())
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    pub fn cfgstr(&self) -> &str {
        &self.cfgstr
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.words.first().map(|w| w.len()).unwrap_or(0)
    }

    pub fn words(&self) -> &[Vector] {
        &self.words
    }

    pub fn word(&self, wx: WordIndex) -> &[f32] {
        &self.words[wx]
    }

    /// The `k` nearest words of each descriptor with squared distances.
    pub fn nearest_words(
        &self,
        descriptors: &[Vector],
        k: usize,
    ) -> Result<(Vec<Vec<WordIndex>>, Vec<Vec<f32>>)> {
        if k == 0 {
            return Err(Error::invalid("k must be >= 1"));
        }
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| Error::IndexNotBuilt("vocabulary word index".into()))?;
        let mut wxs = Vec::with_capacity(descriptors.len());
        let mut dists = Vec::with_capacity(descriptors.len());
        for hits in index.knn_batch(descriptors, k)? {
            wxs.push(hits.iter().map(|h| h.index).collect());
            dists.push(hits.iter().map(|h| h.distance).collect());
        }
        Ok((wxs, dists))
    }

    /// Soft multi-assignment of descriptors to words.
    pub fn assign_to_words(
        &self,
        descriptors: &[Vector],
        params: &AssignParams,
    ) -> Result<MultiAssignment> {
        let (wxs, dists) = self.nearest_words(descriptors, params.k)?;
        Ok(weight_multi_assigns(wxs, dists, params))
    }

    fn words_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{key}.words"))
    }

    fn index_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(format!("{key}.ann"))
    }

    pub fn save(&self, dir: &Path, key: &str) -> Result<()> {
        persist::write_file(
            &Self::words_path(dir, key),
            &VocabularyFile {
                cfgstr: self.cfgstr.clone(),
                words: self.words.clone(),
            },
        )?;
        if let Some(index) = &self.index {
            index.save(&Self::index_path(dir, key))?;
        }
        tracing::info!(key, num_words = self.len(), "Persisted visual vocabulary");
        Ok(())
    }

    /// Load a persisted vocabulary; its word index is rebuilt if stale.
    pub fn load(dir: &Path, key: &str) -> Result<Option<Self>> {
        let file: VocabularyFile = match persist::read_file(&Self::words_path(dir, key))? {
            Some(file) => file,
            None => return Ok(None),
        };
        let index = AnnIndex::load_or_build(
            &Self::index_path(dir, key),
            &file.words,
            &AnnParams::default(),
        )?;
        Ok(Some(Self {
            cfgstr: file.cfgstr,
            words: file.words,
            index: Some(index),
        }))
    }
}

pub fn clusterer_for(params: &ResolvedParams) -> Box<dyn Clusterer> {
    match params.vocab_algorithm {
        VocabAlgorithm::Minibatch => Box::new(MiniBatchKMeans {
            max_iterations: params.vocab_max_iters,
            batch_size: params.vocab_batch_size,
        }),
        VocabAlgorithm::Kmeans => Box::new(KMeans {
            max_iterations: params.vocab_max_iters,
            tolerance: 1e-4,
        }),
    }
}

/// Filter and weight the `k` candidate words of each descriptor.
///
/// Candidates farther than `alpha * (eps + d_min)` are dropped, where `d_min`
/// is the nearest distance, or the second nearest when the nearest is exactly
/// zero. Survivors get Gaussian weights `exp(-d / (2 sigma^2))` normalized to
/// sum to one, or uniform weights when `equal_weights` is set.
pub fn weight_multi_assigns(
    wxs: Vec<Vec<WordIndex>>,
    dists: Vec<Vec<f32>>,
    params: &AssignParams,
) -> MultiAssignment {
    let mut out = MultiAssignment {
        wxs: Vec::with_capacity(wxs.len()),
        maws: Vec::with_capacity(wxs.len()),
    };

    for (cand_wxs, cand_dists) in wxs.into_iter().zip(dists) {
        if cand_wxs.len() <= 1 {
            let n = cand_wxs.len();
            out.wxs.push(cand_wxs);
            out.maws.push(vec![1.0; n]);
            continue;
        }

        let nearest = if cand_dists[0] == 0.0 {
            cand_dists[1]
        } else {
            cand_dists[0]
        };
        let thresh = params.alpha * (MASSIGN_EPS + nearest);
        let gauss_denom = 2.0 * (params.sigma as f64).powi(2);

        let mut kept_wxs = Vec::with_capacity(cand_wxs.len());
        let mut kept_weights = Vec::with_capacity(cand_wxs.len());
        for (wx, dist) in cand_wxs.into_iter().zip(cand_dists) {
            if dist > thresh {
                continue;
            }
            kept_wxs.push(wx);
            kept_weights.push((-(dist as f64) / gauss_denom).exp());
        }

        let maws: Vec<f32> = if kept_wxs.is_empty() {
            Vec::new()
        } else if params.equal_weights {
            vec![1.0 / kept_wxs.len() as f32; kept_wxs.len()]
        } else {
            let total: f64 = kept_weights.iter().sum();
            if total > 0.0 {
                kept_weights.iter().map(|w| (w / total) as f32).collect()
            } else {
                vec![1.0 / kept_wxs.len() as f32; kept_wxs.len()]
            }
        };
        out.wxs.push(kept_wxs);
        out.maws.push(maws);
    }
    out
}
