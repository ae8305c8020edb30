//! Batch matching pipeline
//!
//! Queries advance in chunks through a fixed sequence of states. Each state
//! runs over the whole chunk before the next one starts:
//!
//! NeighborSearch -> BaselineFilter -> WeightNeighbors -> BuildChipMatches
//! -> SpatialVerification -> VsoneRerank -> Finalize
//!
//! Disabled optional states are skipped. The vocabulary root replaces the
//! neighbor search with word assignment and applies its identity exclusion
//! while building matches.

pub mod neighbors;
pub mod smk;
pub mod verify;
pub mod vsone;
pub mod weights;

use std::sync::Arc;

use crate::chipmatch::{ChipMatch, ScoringContext};
use crate::config::{PipelineRoot, ResolvedParams};
use crate::features::FeatureStore;
use crate::pool::{CancelToken, WorkerPool};
use crate::request::{IdSetView, QueryRequest};
use crate::smk::{AnnotWords, InvertedIndex};
use crate::types::{Aid, FeatureSet};
use crate::vocab::VisualVocabulary;
use crate::{Error, Result};

pub use neighbors::NeighborIndex;
pub use verify::{estimate_transform_ransac, SvConfig, SvResult};
pub use weights::{channel_labels, IdentityCache, WeightedNeighbors};

use vsone::VsoneSearch;
use weights::{baseline_filter, group_by_owner, read_foreground, weight_neighbors, Foreground};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    NeighborSearch,
    BaselineFilter,
    WeightNeighbors,
    BuildChipMatches,
    SpatialVerification,
    VsoneRerank,
    Finalize,
}

impl PipelineState {
    /// The state after `self` under `params`, `None` after [`PipelineState::Finalize`].
    pub fn next(self, params: &ResolvedParams) -> Option<Self> {
        use PipelineState::*;
        let smk = params.pipeline_root == PipelineRoot::Smk;
        let mut state = self;
        loop {
            state = match state {
                NeighborSearch => BaselineFilter,
                BaselineFilter => WeightNeighbors,
                WeightNeighbors => BuildChipMatches,
                BuildChipMatches => SpatialVerification,
                SpatialVerification => VsoneRerank,
                VsoneRerank => Finalize,
                Finalize => return None,
            };
            let enabled = match state {
                BaselineFilter | WeightNeighbors => !smk,
                SpatialVerification => params.sv_on,
                VsoneRerank => params.rerank_on && params.pipeline_root == PipelineRoot::Vsone,
                _ => true,
            };
            if enabled {
                return Some(state);
            }
        }
    }
}

/// Search products of one query, by pipeline root.
enum QuerySearch {
    /// Descriptors of the query searched against the gallery index.
    Vsmany(WeightedNeighbors),
    Vsone(VsoneSearch),
    Smk(AnnotWords),
    /// Nothing to match; finalizes to an empty ChipMatch.
    Empty,
}

/// Working state of one chunk.
struct Chunk {
    qaids: Vec<Aid>,
    queries: Vec<Option<Arc<FeatureSet>>>,
    searches: Vec<QuerySearch>,
    matches: Vec<ChipMatch>,
}

/// Gallery-side resources resolved once per run.
enum GallerySide {
    Neighbors(Arc<NeighborIndex>),
    Vsone,
    Smk {
        vocab: Arc<VisualVocabulary>,
        inverted: Arc<InvertedIndex>,
    },
}

pub struct MatchPipeline<'r> {
    req: &'r QueryRequest,
    labels: Vec<String>,
    visited: Vec<PipelineState>,
}

impl<'r> MatchPipeline<'r> {
    pub fn new(req: &'r QueryRequest) -> Self {
        Self {
            req,
            labels: channel_labels(req.params()),
            visited: Vec::new(),
        }
    }

    /// States entered so far, in order, across all chunks.
    pub fn visited(&self) -> &[PipelineState] {
        &self.visited
    }

    /// Run every query of the request.
    ///
    /// # Returns
    /// * One ChipMatch per query, aligned with [`QueryRequest::external_qaids`]
    pub fn execute(&mut self) -> Result<Vec<ChipMatch>> {
        let req = self.req;
        let gallery = self.resolve_gallery()?;
        let view = req.query_view();
        let mut results = Vec::with_capacity(view.len());
        for chunk in view.chunks(req.chunk_size()) {
            results.extend(self.run_chunk(chunk, &gallery)?);
        }
        tracing::debug!(
            num_queries = results.len(),
            root = ?req.params().pipeline_root,
            "Pipeline finished"
        );
        Ok(results)
    }

    fn resolve_gallery(&self) -> Result<GallerySide> {
        let params = self.req.params();
        let resources = self.req.resources();
        match params.pipeline_root {
            PipelineRoot::Vsmany => {
                let index = match &resources.neighbors {
                    Some(index) => index.clone(),
                    None => {
                        let (index, report) = NeighborIndex::build(
                            self.req.store(),
                            self.req.internal_daids(),
                            params,
                        )?;
                        if !report.is_complete() {
                            tracing::warn!(
                                skipped = report.skipped.len(),
                                "Some gallery annotations are not searchable"
                            );
                        }
                        Arc::new(index)
                    }
                };
                Ok(GallerySide::Neighbors(index))
            }
            PipelineRoot::Vsone => Ok(GallerySide::Vsone),
            PipelineRoot::Smk => {
                let vocab = resources.vocab.clone().ok_or_else(|| {
                    Error::config(format!("no vocabulary loaded for {}", params.vocab_cfgstr()))
                })?;
                let inverted = match &resources.inverted {
                    Some(inverted) => inverted.clone(),
                    None => {
                        let (inverted, _) = InvertedIndex::build(
                            &vocab,
                            self.req.store(),
                            self.req.internal_daids(),
                            params,
                            &WorkerPool::new(1),
                            &CancelToken::new(),
                        )?;
                        Arc::new(inverted)
                    }
                };
                Ok(GallerySide::Smk { vocab, inverted })
            }
        }
    }

    fn run_chunk(&mut self, view: IdSetView<'_>, gallery: &GallerySide) -> Result<Vec<ChipMatch>> {
        let req = self.req;
        let params = req.params();
        let store = req.store();
        let mut identities = IdentityCache::new(store);
        let mut chunk = Chunk {
            qaids: view.to_vec(),
            queries: Vec::new(),
            searches: Vec::new(),
            matches: Vec::new(),
        };

        let mut state = Some(PipelineState::NeighborSearch);
        while let Some(current) = state {
            tracing::debug!(
                state = ?current,
                num_queries = chunk.qaids.len(),
                "Entering pipeline state"
            );
            self.visited.push(current);
            match current {
                PipelineState::NeighborSearch => self.neighbor_search(&mut chunk, gallery)?,
                PipelineState::BaselineFilter => {
                    for (qaid, search) in chunk.qaids.iter().zip(chunk.searches.iter_mut()) {
                        match (search, gallery) {
                            (QuerySearch::Vsmany(wn), GallerySide::Neighbors(index)) => {
                                let identity = identities.get(*qaid);
                                baseline_filter(wn, index, identity, params, &mut identities);
                            }
                            (QuerySearch::Vsone(search), _) => search.filter(params, &mut identities),
                            _ => {}
                        }
                    }
                }
                PipelineState::WeightNeighbors => {
                    for search in chunk.searches.iter_mut() {
                        match (search, gallery) {
                            (QuerySearch::Vsmany(wn), GallerySide::Neighbors(index)) => {
                                let fg = if params.fg_on {
                                    read_foreground(store, wn.aid)?
                                } else {
                                    None
                                };
                                let foreground = if params.fg_on {
                                    let weights = fg.as_deref().map(Vec::as_slice);
                                    Foreground::Searched(weights.unwrap_or(&[]))
                                } else {
                                    Foreground::Off
                                };
                                weight_neighbors(wn, index, params, foreground);
                            }
                            (QuerySearch::Vsone(search), _) => search.weigh(params),
                            _ => {}
                        }
                    }
                }
                PipelineState::BuildChipMatches => {
                    self.build_chipmatches(&mut chunk, gallery, &mut identities)
                }
                PipelineState::SpatialVerification => {
                    let config = SvConfig::from_params(params);
                    for (query, cm) in chunk.queries.iter().zip(chunk.matches.iter_mut()) {
                        if let Some(query) = query {
                            verify::verify_chipmatch(cm, query, store, &config)?;
                        }
                    }
                }
                PipelineState::VsoneRerank => {
                    for (query, cm) in chunk.queries.iter().zip(chunk.matches.iter_mut()) {
                        if let Some(query) = query {
                            vsone::rerank(cm, query, store, params)?;
                        }
                    }
                }
                PipelineState::Finalize => self.finalize(&mut chunk),
            }
            state = current.next(params);
        }
        Ok(chunk.matches)
    }

    fn neighbor_search(&self, chunk: &mut Chunk, gallery: &GallerySide) -> Result<()> {
        let req = self.req;
        let params = req.params();
        let store = req.store();
        for &qaid in &chunk.qaids {
            let query = load_query(store, qaid)?;
            let search = match (&query, gallery) {
                (None, _) => QuerySearch::Empty,
                (Some(features), GallerySide::Neighbors(index)) => {
                    if index.is_empty() || features.dim() != Some(index.dim()) {
                        if !index.is_empty() {
                            tracing::warn!(qaid, "Query descriptor dimension differs from gallery");
                        }
                        QuerySearch::Empty
                    } else {
                        let hits = index.search(&features.vectors, params.k + params.knorm)?;
                        QuerySearch::Vsmany(WeightedNeighbors::new(qaid, hits, params.k))
                    }
                }
                (Some(_), GallerySide::Vsone) => {
                    match vsone::search_gallery(qaid, req.internal_qaids(), store, params)? {
                        Some(search) => QuerySearch::Vsone(search),
                        None => QuerySearch::Empty,
                    }
                }
                (Some(_), GallerySide::Smk { vocab, .. }) => {
                    match smk::query_words(qaid, vocab, store, params)? {
                        Some(words) => QuerySearch::Smk(words),
                        None => QuerySearch::Empty,
                    }
                }
            };
            chunk.queries.push(query);
            chunk.searches.push(search);
        }
        Ok(())
    }

    fn build_chipmatches(
        &self,
        chunk: &mut Chunk,
        gallery: &GallerySide,
        identities: &mut IdentityCache<'_>,
    ) {
        let params = self.req.params();
        let searches = std::mem::take(&mut chunk.searches);
        for (qaid, search) in chunk.qaids.iter().zip(searches) {
            let cm = match (search, gallery) {
                (QuerySearch::Vsmany(wn), GallerySide::Neighbors(index)) => {
                    let mut cm = ChipMatch::new(*qaid, self.labels.clone());
                    for (daid, found) in group_by_owner(&wn, index) {
                        let dnid = identities.get(daid);
                        cm.push_annot(daid, dnid, found.fm, found.fsv, found.fk);
                    }
                    cm
                }
                (QuerySearch::Vsone(search), _) => {
                    search.into_chipmatch(*qaid, &self.labels, identities)
                }
                (QuerySearch::Smk(words), GallerySide::Smk { inverted, .. }) => {
                    smk::match_query(&words, inverted, params, identities)
                }
                _ => {
                    tracing::warn!(qaid = *qaid, "Nothing to match; returning an empty match");
                    ChipMatch::new(*qaid, self.labels.clone())
                }
            };
            chunk.matches.push(cm);
        }
    }

    fn finalize(&self, chunk: &mut Chunk) {
        let req = self.req;
        let params = req.params();
        let normalizer = if params.score_normalization_on {
            req.resources().normalizer.as_deref()
        } else {
            None
        };
        for (query, cm) in chunk.queries.iter().zip(chunk.matches.iter_mut()) {
            let keypoints = query.as_deref().map(|q| q.keypoints.as_slice()).unwrap_or(&[]);
            let ctx = ScoringContext {
                query_keypoints: keypoints,
                coverage: req.coverage(),
            };
            cm.score(req.strategy(), &ctx);
            if let Some(normalizer) = normalizer {
                cm.apply_normalizer(normalizer);
            }
        }
    }
}

/// Run every query of `req` through the pipeline.
pub fn execute(req: &QueryRequest) -> Result<Vec<ChipMatch>> {
    MatchPipeline::new(req).execute()
}

/// Query features, or `None` for a query that cannot contribute matches.
fn load_query(store: &dyn FeatureStore, qaid: Aid) -> Result<Option<Arc<FeatureSet>>> {
    match store.get_descriptors(qaid) {
        Ok(features) if features.is_empty() => {
            tracing::warn!(qaid, "Query has no descriptors");
            Ok(None)
        }
        Ok(features) => Ok(Some(features)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            tracing::warn!(qaid, error = %err, "Cannot read query descriptors");
            Ok(None)
        }
    }
}
