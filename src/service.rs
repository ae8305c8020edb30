//! Query service
//!
//! The [`QueryService`] is the process-level owner of every shared resource:
//! vocabularies, inverted indexes, neighbor indexes and score normalizers live
//! in bounded caches keyed by their content key, and are persisted under the
//! configured directories when those are set. Callers pass the service by
//! reference; nothing here is global state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CacheStats, ResourceCache};
use crate::chipmatch::ChipMatch;
use crate::config::{PipelineRoot, QueryConfig, ResolvedParams, ServiceSection};
use crate::features::FeatureStore;
use crate::normalizer::ScoreNormalizer;
use crate::pipeline::{self, NeighborIndex};
use crate::pool::{BuildReport, CancelToken, WorkerPool};
use crate::request::{QueryRequest, QueryResources};
use crate::smk::InvertedIndex;
use crate::types::{Aid, Vector};
use crate::vocab::VisualVocabulary;
use crate::{Error, Result};

pub struct QueryService {
    store: Arc<dyn FeatureStore>,
    settings: ServiceSection,
    pool: WorkerPool,
    /// Cancelled on close; every build token is a child of it.
    shutdown: CancelToken,
    vocabs: ResourceCache<VisualVocabulary>,
    inverted: ResourceCache<InvertedIndex>,
    neighbors: ResourceCache<NeighborIndex>,
    normalizers: ResourceCache<ScoreNormalizer>,
}

impl QueryService {
    /// Create the service and its on-disk directories.
    pub fn init(store: Arc<dyn FeatureStore>, settings: ServiceSection) -> Result<Self> {
        for dir in [&settings.cache_dir, &settings.normalizer_dir]
            .into_iter()
            .flatten()
        {
            std::fs::create_dir_all(dir)?;
        }
        let capacity = settings.cache_capacity;
        tracing::info!(
            workers = settings.workers,
            cache_capacity = capacity,
            cache_dir = ?settings.cache_dir,
            "Query service initialised"
        );
        Ok(Self {
            store,
            pool: WorkerPool::new(settings.workers),
            shutdown: CancelToken::new(),
            vocabs: ResourceCache::new("vocabulary", capacity),
            inverted: ResourceCache::new("inverted_index", capacity),
            neighbors: ResourceCache::new("neighbor_index", capacity),
            normalizers: ResourceCache::new("normalizer", capacity),
            settings,
        })
    }

    pub fn store(&self) -> &Arc<dyn FeatureStore> {
        &self.store
    }

    /// Token for one index build. Cancelling it abandons only that build;
    /// closing the service cancels every such token.
    pub fn build_cancel_token(&self) -> CancelToken {
        self.shutdown.child()
    }

    /// Drop every cached resource and refuse new ones.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.vocabs.close();
        self.inverted.close();
        self.neighbors.close();
        self.normalizers.close();
        tracing::info!("Query service closed");
    }

    pub fn cache_stats(&self) -> Vec<(&'static str, CacheStats)> {
        vec![
            (self.vocabs.name(), self.vocabs.stats()),
            (self.inverted.name(), self.inverted.stats()),
            (self.neighbors.name(), self.neighbors.stats()),
            (self.normalizers.name(), self.normalizers.stats()),
        ]
    }

    fn cache_dir(&self) -> Option<&Path> {
        self.settings.cache_dir.as_deref()
    }

    /// Build, or load from cache, the vocabulary of `config` trained on `sample_aids`.
    pub fn build_vocabulary(
        &self,
        sample_aids: &[Aid],
        config: &QueryConfig,
    ) -> Result<Arc<VisualVocabulary>> {
        let params = config.resolve()?;
        let key = params.vocab_key();
        self.vocabs.get_or_try_insert_with(&key, || {
            if let Some(vocab) = self.load_vocabulary(&key)? {
                return Ok(vocab);
            }
            let sample = self.gather_sample(sample_aids)?;
            let vocab = VisualVocabulary::build_for(&sample, &params)?;
            if let Some(dir) = self.cache_dir() {
                vocab.save(dir, &key)?;
            }
            Ok(vocab)
        })
    }

    /// The vocabulary of `params` if it was built before.
    pub fn vocabulary(&self, params: &ResolvedParams) -> Result<Option<Arc<VisualVocabulary>>> {
        let key = params.vocab_key();
        if let Some(vocab) = self.vocabs.get(&key) {
            return Ok(Some(vocab));
        }
        match self.load_vocabulary(&key)? {
            Some(vocab) => {
                let vocab = Arc::new(vocab);
                self.vocabs.insert(key, vocab.clone())?;
                Ok(Some(vocab))
            }
            None => Ok(None),
        }
    }

    fn load_vocabulary(&self, key: &str) -> Result<Option<VisualVocabulary>> {
        let Some(dir) = self.cache_dir() else {
            return Ok(None);
        };
        match VisualVocabulary::load(dir, key) {
            Ok(vocab) => Ok(vocab),
            Err(Error::CorruptedIndex(reason)) => {
                tracing::warn!(key, reason = %reason, "Discarding corrupted vocabulary");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn gather_sample(&self, aids: &[Aid]) -> Result<Vec<Vector>> {
        let mut sample = Vec::new();
        for &aid in aids {
            match self.store.get_descriptors(aid) {
                Ok(features) => sample.extend(features.vectors.iter().cloned()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(aid, error = %err, "Leaving annotation out of vocabulary sample");
                }
            }
        }
        Ok(sample)
    }

    /// Inverted index of `daids` over `vocab`, built on the worker pool when missing.
    pub fn inverted_index(
        &self,
        vocab: &VisualVocabulary,
        daids: &[Aid],
        params: &ResolvedParams,
    ) -> Result<Arc<InvertedIndex>> {
        self.inverted_index_with_cancel(vocab, daids, params, &self.build_cancel_token())
    }

    /// [`Self::inverted_index`] with a caller-held token for abandoning the build.
    pub fn inverted_index_with_cancel(
        &self,
        vocab: &VisualVocabulary,
        daids: &[Aid],
        params: &ResolvedParams,
        cancel: &CancelToken,
    ) -> Result<Arc<InvertedIndex>> {
        let key = params.index_key(daids);
        let path = self.cache_dir().map(|dir| dir.join(format!("{key}.inva")));
        self.inverted.get_or_try_insert_with(&key, || {
            if let Some(path) = &path {
                if let Some(index) = InvertedIndex::load(path)? {
                    tracing::info!(key = %key, "Loaded inverted index");
                    return Ok(index);
                }
            }
            let (index, report) = InvertedIndex::build(
                vocab,
                self.store.as_ref(),
                daids,
                params,
                &self.pool,
                cancel,
            )?;
            log_report("inverted index", &report);
            if let Some(path) = &path {
                index.save(path)?;
            }
            Ok(index)
        })
    }

    /// Neighbor index over the descriptors of `daids`.
    pub fn neighbor_index(
        &self,
        daids: &[Aid],
        params: &ResolvedParams,
    ) -> Result<Arc<NeighborIndex>> {
        let key = params.nn_key(daids);
        self.neighbors.get_or_try_insert_with(&key, || {
            let store = self.store.as_ref();
            let (index, report) = match self.cache_dir() {
                Some(dir) => NeighborIndex::load_or_build(dir, store, daids, params)?,
                None => NeighborIndex::build(store, daids, params)?,
            };
            log_report("neighbor index", &report);
            Ok(index)
        })
    }

    fn normalizer_path(&self, key: &str) -> Option<PathBuf> {
        self.settings
            .normalizer_dir
            .as_ref()
            .map(|dir| dir.join(format!("{key}.json")))
    }

    /// Trained normalizer of the scoring config, or an untrained one.
    pub fn normalizer(&self, params: &ResolvedParams) -> Result<Arc<ScoreNormalizer>> {
        let key = params.normalizer_key();
        let path = self.normalizer_path(&key);
        self.normalizers.get_or_try_insert_with(&key, || {
            if let Some(path) = &path {
                if let Some(normalizer) = ScoreNormalizer::load(path)? {
                    tracing::info!(key = %key, support = normalizer.num_support(), "Loaded score normalizer");
                    return Ok(normalizer);
                }
            }
            tracing::warn!(
                key = %key,
                "No trained normalizer for this scoring config; probabilities will be unknown"
            );
            Ok(ScoreNormalizer::untrained(key.clone()))
        })
    }

    /// Persist a normalizer under `normalizer_dir`.
    pub fn save_normalizer(&self, normalizer: &ScoreNormalizer) -> Result<()> {
        let key = normalizer.key();
        let path = self
            .normalizer_path(&key)
            .ok_or_else(|| Error::config("normalizer_dir is not configured"))?;
        normalizer.save(&path)
    }

    /// Every annotation must report the configured species, when one is set.
    pub fn check_species(&self, params: &ResolvedParams, aids: &[Aid]) -> Result<()> {
        let Some(expected) = params.species.as_deref() else {
            return Ok(());
        };
        for &aid in aids {
            let species = match self.store.get_species(aid) {
                Ok(species) => species,
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => continue,
            };
            if let Some(species) = species {
                if species != expected {
                    return Err(Error::config(format!(
                        "annotation {aid} is '{species}', query config expects '{expected}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Match every query annotation against the gallery.
    ///
    /// # Returns
    /// * One ChipMatch per distinct query annotation
    pub fn run_query(
        &self,
        query_aids: &[Aid],
        gallery_aids: &[Aid],
        config: &QueryConfig,
    ) -> Result<HashMap<Aid, ChipMatch>> {
        let params = Arc::new(config.resolve()?);
        self.check_species(&params, query_aids)?;
        self.check_species(&params, gallery_aids)?;

        let request = QueryRequest::new(
            query_aids.to_vec(),
            gallery_aids.to_vec(),
            params.clone(),
            self.store.clone(),
        )?
        .with_chunk_size(self.settings.chunk_size);
        let resources = self.load_resources(&request, &params)?;
        let request = request.with_resources(resources);

        tracing::info!(
            num_queries = request.external_qaids().len(),
            num_gallery = request.external_daids().len(),
            root = ?params.pipeline_root,
            "Running query"
        );
        let matches = pipeline::execute(&request)?;
        Ok(matches.into_iter().map(|cm| (cm.qaid, cm)).collect())
    }

    fn load_resources(
        &self,
        request: &QueryRequest,
        params: &ResolvedParams,
    ) -> Result<QueryResources> {
        let mut resources = QueryResources::default();
        match params.pipeline_root {
            PipelineRoot::Vsmany => {
                resources.neighbors = Some(self.neighbor_index(request.internal_daids(), params)?);
            }
            PipelineRoot::Vsone => {}
            PipelineRoot::Smk => {
                let vocab = self.vocabulary(params)?.ok_or_else(|| {
                    Error::config(format!(
                        "vocabulary {} has not been built",
                        params.vocab_cfgstr()
                    ))
                })?;
                resources.inverted =
                    Some(self.inverted_index(&vocab, request.internal_daids(), params)?);
                resources.vocab = Some(vocab);
            }
        }
        if params.score_normalization_on {
            resources.normalizer = Some(self.normalizer(params)?);
        }
        Ok(resources)
    }
}

fn log_report(what: &str, report: &BuildReport) {
    if report.is_complete() {
        tracing::debug!(what, built = report.built, "Build complete");
    } else {
        tracing::warn!(
            what,
            built = report.built,
            skipped = report.skipped.len(),
            "Build skipped annotations"
        );
    }
}
