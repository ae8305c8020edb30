//! Query requests
//!
//! A [`QueryRequest`] bundles the query and gallery ids of one run with the
//! resolved parameters, the feature store and the loaded resources the
//! pipeline reads. In one-vs-one mode the internal roles are swapped: each
//! gallery annotation is searched against the features of the query.

use std::sync::Arc;

use crate::chipmatch::{strategy_for, CoverageScorer, GridCoverage, ScoringStrategy};
use crate::config::{PipelineRoot, ResolvedParams, DEFAULT_CHUNK_SIZE};
use crate::features::FeatureStore;
use crate::normalizer::ScoreNormalizer;
use crate::pipeline::NeighborIndex;
use crate::smk::InvertedIndex;
use crate::types::Aid;
use crate::vocab::VisualVocabulary;
use crate::{Error, Result};

/// Borrowed view over an id array, optionally restricted to some positions.
///
/// The view never copies or mutates the array it borrows.
#[derive(Debug, Clone, Copy)]
pub struct IdSetView<'a> {
    ids: &'a [Aid],
    active: Option<&'a [usize]>,
}

impl<'a> IdSetView<'a> {
    pub fn new(ids: &'a [Aid]) -> Self {
        Self { ids, active: None }
    }

    /// Restrict to the positions in `active`.
    pub fn masked(ids: &'a [Aid], active: &'a [usize]) -> Self {
        Self {
            ids,
            active: Some(active),
        }
    }

    pub fn len(&self) -> usize {
        match self.active {
            Some(active) => active.len(),
            None => self.ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<Aid> {
        match self.active {
            Some(active) => active.get(i).and_then(|pos| self.ids.get(*pos)).copied(),
            None => self.ids.get(i).copied(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Aid> + 'a {
        let ids = self.ids;
        let active = self.active;
        let len = self.len();
        (0..len).filter_map(move |i| match active {
            Some(active) => ids.get(active[i]).copied(),
            None => ids.get(i).copied(),
        })
    }

    /// Consecutive sub-views of at most `size` ids.
    pub fn chunks(&self, size: usize) -> Vec<IdSetView<'a>> {
        let size = size.max(1);
        match self.active {
            Some(active) => active
                .chunks(size)
                .map(|chunk| IdSetView::masked(self.ids, chunk))
                .collect(),
            None => self.ids.chunks(size).map(IdSetView::new).collect(),
        }
    }

    pub fn to_vec(&self) -> Vec<Aid> {
        self.iter().collect()
    }
}

/// Resources loaded for one run.
#[derive(Default, Clone)]
pub struct QueryResources {
    pub vocab: Option<Arc<VisualVocabulary>>,
    pub inverted: Option<Arc<InvertedIndex>>,
    pub neighbors: Option<Arc<NeighborIndex>>,
    pub normalizer: Option<Arc<ScoreNormalizer>>,
}

pub struct QueryRequest {
    qaids: Vec<Aid>,
    daids: Vec<Aid>,
    params: Arc<ResolvedParams>,
    store: Arc<dyn FeatureStore>,
    resources: QueryResources,
    strategy: Box<dyn ScoringStrategy>,
    coverage: Box<dyn CoverageScorer>,
    chunk_size: usize,
}

impl QueryRequest {
    /// # Arguments
    /// * `qaids` - query annotations, as the caller names them
    /// * `daids` - gallery annotations, as the caller names them
    pub fn new(
        qaids: Vec<Aid>,
        daids: Vec<Aid>,
        params: Arc<ResolvedParams>,
        store: Arc<dyn FeatureStore>,
    ) -> Result<Self> {
        if qaids.is_empty() {
            return Err(Error::invalid("query id set is empty"));
        }
        let strategy = strategy_for(params.score_method);
        Ok(Self {
            qaids: dedup(qaids),
            daids: dedup(daids),
            params,
            store,
            resources: QueryResources::default(),
            strategy,
            coverage: Box::new(GridCoverage::default()),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_resources(mut self, resources: QueryResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn ScoringStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_coverage(mut self, coverage: Box<dyn CoverageScorer>) -> Self {
        self.coverage = coverage;
        self
    }

    /// Queries advanced through the pipeline together.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn external_qaids(&self) -> &[Aid] {
        &self.qaids
    }

    pub fn external_daids(&self) -> &[Aid] {
        &self.daids
    }

    /// Ids searched with their own descriptors.
    pub fn internal_qaids(&self) -> &[Aid] {
        match self.params.pipeline_root {
            PipelineRoot::Vsone => &self.daids,
            PipelineRoot::Vsmany | PipelineRoot::Smk => &self.qaids,
        }
    }

    /// Ids whose descriptors are indexed and searched against.
    pub fn internal_daids(&self) -> &[Aid] {
        match self.params.pipeline_root {
            PipelineRoot::Vsone => &self.qaids,
            PipelineRoot::Vsmany | PipelineRoot::Smk => &self.daids,
        }
    }

    pub fn query_view(&self) -> IdSetView<'_> {
        IdSetView::new(&self.qaids)
    }

    pub fn params(&self) -> &ResolvedParams {
        &self.params
    }

    pub fn store(&self) -> &dyn FeatureStore {
        self.store.as_ref()
    }

    pub fn resources(&self) -> &QueryResources {
        &self.resources
    }

    pub fn strategy(&self) -> &dyn ScoringStrategy {
        self.strategy.as_ref()
    }

    pub fn coverage(&self) -> &dyn CoverageScorer {
        self.coverage.as_ref()
    }
}

fn dedup(ids: Vec<Aid>) -> Vec<Aid> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|aid| seen.insert(*aid)).collect()
}
