//! Inverted index over a gallery for a fixed vocabulary

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use super::residual::{aggregate_residuals, ResidualStore};
use super::{gamma, self_similarity, SmkParams};
use crate::config::ResolvedParams;
use crate::features::FeatureStore;
use crate::persist;
use crate::pool::{BuildReport, CancelToken, WorkerPool};
use crate::types::{Aid, Vector, WordIndex};
use crate::vocab::{AssignParams, VisualVocabulary};
use crate::{Error, Result};

/// Word assignments and aggregated residuals of one annotation.
///
/// All per-word lists are aligned with `wxs`, which is sorted ascending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnotWords {
    pub aid: Aid,
    /// Raw descriptor count of the annotation.
    pub num_descriptors: usize,
    pub wxs: Vec<WordIndex>,
    /// Feature indices assigned to each word.
    pub fxs: Vec<Vec<usize>>,
    /// Multi-assignment weight of each feature index in `fxs`.
    pub maws: Vec<Vec<f32>>,
    pub residuals: ResidualStore,
    pub flags: Vec<bool>,
}

impl AnnotWords {
    /// Assign the descriptors of one annotation and aggregate a residual per word.
    pub fn compute(
        aid: Aid,
        vocab: &VisualVocabulary,
        vectors: &[Vector],
        assign: &AssignParams,
        int8: bool,
    ) -> Result<Self> {
        if vectors.is_empty() {
            return Ok(Self::empty(aid, int8));
        }
        if vectors[0].len() != vocab.dim() {
            return Err(Error::invalid(format!(
                "annotation {} descriptors have dimension {}, vocabulary has {}",
                aid,
                vectors[0].len(),
                vocab.dim()
            )));
        }

        let assignment = vocab.assign_to_words(vectors, assign)?;
        let mut groups: BTreeMap<WordIndex, Vec<(usize, f32)>> = BTreeMap::new();
        for (fx, (wxs, maws)) in assignment.wxs.iter().zip(assignment.maws.iter()).enumerate() {
            for (wx, maw) in wxs.iter().zip(maws.iter()) {
                groups.entry(*wx).or_default().push((fx, *maw));
            }
        }

        let mut out = Self {
            aid,
            num_descriptors: vectors.len(),
            wxs: Vec::with_capacity(groups.len()),
            fxs: Vec::with_capacity(groups.len()),
            maws: Vec::with_capacity(groups.len()),
            residuals: ResidualStore::Float(Vec::new()),
            flags: Vec::with_capacity(groups.len()),
        };
        let mut phis = Vec::with_capacity(groups.len());
        for (wx, members) in groups {
            let (phi, flag) = aggregate_residuals(
                vocab.word(wx),
                members
                    .iter()
                    .map(|(fx, maw)| (vectors[*fx].as_slice(), *maw)),
            );
            out.wxs.push(wx);
            out.fxs.push(members.iter().map(|(fx, _)| *fx).collect());
            out.maws.push(members.iter().map(|(_, maw)| *maw).collect());
            out.flags.push(flag);
            phis.push(phi);
        }
        out.residuals = ResidualStore::from_vectors(phis, int8);
        Ok(out)
    }

    fn empty(aid: Aid, int8: bool) -> Self {
        Self {
            aid,
            num_descriptors: 0,
            wxs: Vec::new(),
            fxs: Vec::new(),
            maws: Vec::new(),
            residuals: ResidualStore::from_vectors(Vec::new(), int8),
            flags: Vec::new(),
        }
    }

    pub fn num_words(&self) -> usize {
        self.wxs.len()
    }

    /// Distinct descriptors that survived multi-assignment.
    pub fn num_assigned(&self) -> usize {
        self.fxs
            .iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Aggregated residual of the `i`-th used word.
    pub fn phi(&self, i: usize) -> Cow<'_, [f32]> {
        self.residuals.get(i)
    }

    /// Position of word `wx` in this annotation's word list.
    pub fn position(&self, wx: WordIndex) -> Option<usize> {
        self.wxs.binary_search(&wx).ok()
    }
}

/// Postings, IDF weights and gammas over a gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvertedIndex {
    key: String,
    num_words: usize,
    smk: SmkParams,
    annots: Vec<AnnotWords>,
    ax_of: HashMap<Aid, usize>,
    postings: BTreeMap<WordIndex, Vec<usize>>,
    idf: HashMap<WordIndex, f32>,
    gammas: Vec<f32>,
}

impl InvertedIndex {
    /// Build over `daids`, one worker unit per annotation.
    ///
    /// Annotations whose unit fails for a non-configuration reason are left
    /// out and listed in the returned [`BuildReport`].
    pub fn build(
        vocab: &VisualVocabulary,
        store: &dyn FeatureStore,
        daids: &[Aid],
        params: &ResolvedParams,
        pool: &WorkerPool,
        cancel: &CancelToken,
    ) -> Result<(Self, BuildReport)> {
        if vocab.is_empty() || !vocab.is_indexed() {
            return Err(Error::config(format!(
                "no usable vocabulary for {}",
                params.vocab_cfgstr()
            )));
        }

        let key = params.index_key(daids);
        let assign = AssignParams::from_params(params);
        let int8 = params.residual_int8;

        let mut seen = BTreeSet::new();
        let items: Vec<(Aid, ())> = daids
            .iter()
            .filter(|aid| seen.insert(**aid))
            .map(|aid| (*aid, ()))
            .collect();

        tracing::info!(
            key = %key,
            num_annots = items.len(),
            workers = pool.workers(),
            "Building inverted index"
        );

        let outcome = pool.map_ordered(items, cancel, |aid, ()| {
            let features = store.get_descriptors(aid)?;
            AnnotWords::compute(aid, vocab, &features.vectors, &assign, int8)
        })?;
        let report = outcome.report();
        let annots = outcome.results.into_iter().map(|(_, words)| words).collect();

        let index = Self::from_annots(key, vocab.len(), annots, SmkParams::from_params(params));
        tracing::info!(
            key = %index.key,
            built = report.built,
            skipped = report.skipped.len(),
            num_postings = index.postings.len(),
            "Inverted index ready"
        );
        Ok((index, report))
    }

    /// Assemble from precomputed annotation units and derive postings, IDF and gammas.
    pub fn from_annots(
        key: impl Into<String>,
        num_words: usize,
        annots: Vec<AnnotWords>,
        smk: SmkParams,
    ) -> Self {
        let ax_of = annots
            .iter()
            .enumerate()
            .map(|(ax, annot)| (annot.aid, ax))
            .collect();
        let mut index = Self {
            key: key.into(),
            num_words,
            smk,
            annots,
            ax_of,
            postings: BTreeMap::new(),
            idf: HashMap::new(),
            gammas: Vec::new(),
        };
        index.postings = index.compute_postings();
        index.idf = index.compute_idf();
        index.gammas = index.compute_gammas(&index.idf, smk.alpha, smk.thresh);
        index
    }

    /// Word to annotation-position postings.
    pub fn compute_postings(&self) -> BTreeMap<WordIndex, Vec<usize>> {
        let mut postings: BTreeMap<WordIndex, Vec<usize>> = BTreeMap::new();
        for (ax, annot) in self.annots.iter().enumerate() {
            for wx in &annot.wxs {
                postings.entry(*wx).or_default().push(ax);
            }
        }
        postings
    }

    /// `idf(w) = ln((N + 1) / (df(w) + 1))` for every word in use.
    pub fn compute_idf(&self) -> HashMap<WordIndex, f32> {
        let total = self.annots.len() as f64;
        let mut doc_freq: HashMap<WordIndex, usize> = HashMap::new();
        for annot in &self.annots {
            for wx in &annot.wxs {
                *doc_freq.entry(*wx).or_default() += 1;
            }
        }
        doc_freq
            .into_iter()
            .map(|(wx, df)| (wx, ((total + 1.0) / (df as f64 + 1.0)).ln() as f32))
            .collect()
    }

    /// Per-annotation kernel normalization from each annotation's self-similarity.
    pub fn compute_gammas(&self, idf: &HashMap<WordIndex, f32>, alpha: f32, thresh: f32) -> Vec<f32> {
        let params = SmkParams { alpha, thresh };
        let lookup = |wx: WordIndex| idf.get(&wx).copied().unwrap_or(0.0);
        self.annots
            .iter()
            .map(|annot| gamma(self_similarity(annot, lookup, params)))
            .collect()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn smk_params(&self) -> SmkParams {
        self.smk
    }

    pub fn len(&self) -> usize {
        self.annots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annots.is_empty()
    }

    pub fn aids(&self) -> impl Iterator<Item = Aid> + '_ {
        self.annots.iter().map(|annot| annot.aid)
    }

    pub fn annots(&self) -> &[AnnotWords] {
        &self.annots
    }

    pub fn annot(&self, aid: Aid) -> Option<&AnnotWords> {
        self.ax_of.get(&aid).map(|ax| &self.annots[*ax])
    }

    pub fn annot_at(&self, ax: usize) -> &AnnotWords {
        &self.annots[ax]
    }

    /// IDF of a word; words no annotation uses resolve to zero.
    pub fn idf(&self, wx: WordIndex) -> f32 {
        self.idf.get(&wx).copied().unwrap_or(0.0)
    }

    pub fn idf_table(&self) -> &HashMap<WordIndex, f32> {
        &self.idf
    }

    pub fn gamma_at(&self, ax: usize) -> f32 {
        self.gammas[ax]
    }

    pub fn gamma(&self, aid: Aid) -> Option<f32> {
        self.ax_of.get(&aid).map(|ax| self.gammas[*ax])
    }

    /// Annotation positions that use word `wx`.
    pub fn postings(&self, wx: WordIndex) -> &[usize] {
        self.postings.get(&wx).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Gamma of an annotation not in the index, under this index's IDF table.
    pub fn query_gamma(&self, query: &AnnotWords) -> f32 {
        gamma(self_similarity(query, |wx| self.idf(wx), self.smk))
    }

    /// Annotation positions sharing at least one word with `query`, ascending.
    pub fn candidates(&self, query: &AnnotWords) -> Vec<usize> {
        let mut axs: BTreeSet<usize> = BTreeSet::new();
        for wx in &query.wxs {
            axs.extend(self.postings(*wx).iter().copied());
        }
        axs.into_iter().collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        persist::write_file(path, self)
    }

    /// Load a persisted index; a corrupted file is reported and treated as absent.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match persist::read_file::<Self>(path) {
            Ok(index) => Ok(index),
            Err(Error::CorruptedIndex(reason)) => {
                tracing::warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Discarding corrupted inverted index"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
