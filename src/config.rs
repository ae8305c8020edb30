use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::Aid;
use crate::{Error, Result};

const DEFAULT_CACHE_CAPACITY: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSection,
    pub query: QueryConfig,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = env::var("PELAGE_CONFIG").unwrap_or_else(|_| "pelage.toml".to_string());
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_path = config_path.as_ref();
        let mut builder = config::Config::builder();

        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path.to_path_buf()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PELAGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }
        if config.service.workers == 0 {
            config.service.workers = default_workers();
        }

        Ok(config)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Worker threads for the inverted-index build
    pub workers: usize,
    /// Maximum resident entries per resource cache
    pub cache_capacity: usize,
    /// On-disk cache for vocabularies and ANN indexes
    pub cache_dir: Option<PathBuf>,
    /// Directory of trained score normalizers
    pub normalizer_dir: Option<PathBuf>,
    /// Queries processed per pipeline chunk
    pub chunk_size: usize,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_dir: None,
            normalizer_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Which matching pipeline answers a query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PipelineRoot {
    /// One query against the whole gallery through a shared neighbor index
    #[default]
    Vsmany,
    /// Each gallery annotation searched against the query's own features
    Vsone,
    /// Visual vocabulary + selective match kernel
    Smk,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VocabAlgorithm {
    #[default]
    Minibatch,
    Kmeans,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SvTransform {
    #[default]
    Affine,
    Homography,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    Csum,
    #[default]
    Nsum,
    AnnotCoverage,
    NameCoverage,
    Smk,
}

/// Per-run query configuration as supplied by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub pipeline_root: PipelineRoot,
    pub feature_cfgstr: String,
    pub species: Option<String>,

    // vocabulary
    pub num_words: usize,
    pub vocab_algorithm: VocabAlgorithm,
    pub vocab_seed: u64,
    pub vocab_max_iters: usize,
    pub vocab_batch_size: usize,

    // multi-assignment / SMK
    pub assignment_k: usize,
    pub massign_alpha: f32,
    pub massign_sigma: f32,
    pub massign_equal_weights: bool,
    pub smk_alpha: f32,
    pub smk_thresh: f32,
    pub residual_int8: bool,

    // nearest neighbors
    pub k: usize,
    pub knorm: usize,
    pub ratio_on: bool,
    pub ratio_thresh: f32,
    pub lnbnn_on: bool,
    pub foreground_weighting_on: bool,
    pub can_match_samename: bool,
    pub ann_exact_threshold: usize,
    pub ann_nlist: usize,
    pub ann_nprobe: usize,

    // spatial verification
    pub spatial_verification_on: bool,
    pub sv_transform: SvTransform,
    pub sv_xy_thresh: f32,
    pub sv_min_inliers: usize,
    pub sv_iterations: usize,
    pub sv_seed: u64,

    // reranking
    pub rerank_on: bool,
    pub rerank_shortlist: usize,

    // scoring
    pub score_method: ScoreMethod,
    pub score_normalization_on: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            pipeline_root: PipelineRoot::Vsmany,
            feature_cfgstr: "sift".to_string(),
            species: None,
            num_words: 8000,
            vocab_algorithm: VocabAlgorithm::Minibatch,
            vocab_seed: 42,
            vocab_max_iters: 100,
            vocab_batch_size: 1000,
            assignment_k: 1,
            massign_alpha: 1.2,
            massign_sigma: 80.0,
            massign_equal_weights: false,
            smk_alpha: 3.0,
            smk_thresh: 0.0,
            residual_int8: true,
            k: 4,
            knorm: 1,
            ratio_on: false,
            ratio_thresh: 0.8,
            lnbnn_on: true,
            foreground_weighting_on: false,
            can_match_samename: true,
            ann_exact_threshold: 4096,
            ann_nlist: 0,
            ann_nprobe: 8,
            spatial_verification_on: false,
            sv_transform: SvTransform::Affine,
            sv_xy_thresh: 0.01,
            sv_min_inliers: 4,
            sv_iterations: 200,
            sv_seed: 0,
            rerank_on: false,
            rerank_shortlist: 20,
            score_method: ScoreMethod::Nsum,
            score_normalization_on: false,
        }
    }
}

impl QueryConfig {
    /// Validate and flatten into the parameters the pipeline reads.
    pub fn resolve(&self) -> Result<ResolvedParams> {
        if self.k == 0 {
            return Err(Error::config("k must be >= 1"));
        }
        if self.assignment_k == 0 {
            return Err(Error::config("assignment_k must be >= 1"));
        }
        if self.num_words == 0 {
            return Err(Error::config("num_words must be >= 1"));
        }
        if !(self.massign_sigma > 0.0) {
            return Err(Error::config("massign_sigma must be > 0"));
        }
        if !(self.massign_alpha > 0.0) {
            return Err(Error::config("massign_alpha must be > 0"));
        }
        if self.ratio_on && self.knorm == 0 {
            return Err(Error::config("ratio test requires knorm >= 1"));
        }
        if self.lnbnn_on && self.knorm == 0 {
            return Err(Error::config("lnbnn weighting requires knorm >= 1"));
        }
        if self.rerank_on && self.pipeline_root != PipelineRoot::Vsone {
            return Err(Error::config(
                "rerank_on is only supported by the vsone pipeline",
            ));
        }
        if self.score_method == ScoreMethod::Smk && self.pipeline_root != PipelineRoot::Smk {
            return Err(Error::config(
                "score_method 'smk' requires the smk pipeline root",
            ));
        }
        if self.spatial_verification_on && self.sv_min_inliers < min_sample_size(self.sv_transform)
        {
            return Err(Error::config(format!(
                "sv_min_inliers must be >= {} for {:?}",
                min_sample_size(self.sv_transform),
                self.sv_transform
            )));
        }
        if self.feature_cfgstr.trim().is_empty() {
            return Err(Error::config("feature_cfgstr must not be empty"));
        }

        Ok(ResolvedParams {
            pipeline_root: self.pipeline_root,
            feature_cfgstr: self.feature_cfgstr.trim().to_string(),
            species: self
                .species
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            num_words: self.num_words,
            vocab_algorithm: self.vocab_algorithm,
            vocab_seed: self.vocab_seed,
            vocab_max_iters: self.vocab_max_iters.max(1),
            vocab_batch_size: self.vocab_batch_size.max(1),
            assignment_k: self.assignment_k,
            massign_alpha: self.massign_alpha,
            massign_sigma: self.massign_sigma,
            massign_equal_weights: self.massign_equal_weights,
            smk_alpha: self.smk_alpha,
            smk_thresh: self.smk_thresh,
            residual_int8: self.residual_int8,
            k: self.k,
            knorm: if self.ratio_on || self.lnbnn_on {
                self.knorm
            } else {
                0
            },
            ratio_on: self.ratio_on,
            ratio_thresh: self.ratio_thresh,
            lnbnn_on: self.lnbnn_on,
            fg_on: self.foreground_weighting_on,
            can_match_samename: self.can_match_samename,
            ann_exact_threshold: self.ann_exact_threshold,
            ann_nlist: self.ann_nlist,
            ann_nprobe: self.ann_nprobe.max(1),
            sv_on: self.spatial_verification_on,
            sv_transform: self.sv_transform,
            sv_xy_thresh: self.sv_xy_thresh,
            sv_min_inliers: self.sv_min_inliers,
            sv_iterations: self.sv_iterations.max(1),
            sv_seed: self.sv_seed,
            rerank_on: self.rerank_on,
            rerank_shortlist: self.rerank_shortlist.max(1),
            score_method: self.score_method,
            score_normalization_on: self.score_normalization_on,
        })
    }
}

fn min_sample_size(transform: SvTransform) -> usize {
    match transform {
        SvTransform::Affine => 3,
        SvTransform::Homography => 4,
    }
}

/// Flat, validated parameters for one query run.
///
/// Produced once by [`QueryConfig::resolve`]; never mutated afterward.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    pub pipeline_root: PipelineRoot,
    pub feature_cfgstr: String,
    pub species: Option<String>,
    pub num_words: usize,
    pub vocab_algorithm: VocabAlgorithm,
    pub vocab_seed: u64,
    pub vocab_max_iters: usize,
    pub vocab_batch_size: usize,
    pub assignment_k: usize,
    pub massign_alpha: f32,
    pub massign_sigma: f32,
    pub massign_equal_weights: bool,
    pub smk_alpha: f32,
    pub smk_thresh: f32,
    pub residual_int8: bool,
    pub k: usize,
    /// Normalizer neighbors appended after the `k` match candidates.
    pub knorm: usize,
    pub ratio_on: bool,
    pub ratio_thresh: f32,
    pub lnbnn_on: bool,
    pub fg_on: bool,
    pub can_match_samename: bool,
    pub ann_exact_threshold: usize,
    pub ann_nlist: usize,
    pub ann_nprobe: usize,
    pub sv_on: bool,
    pub sv_transform: SvTransform,
    pub sv_xy_thresh: f32,
    pub sv_min_inliers: usize,
    pub sv_iterations: usize,
    pub sv_seed: u64,
    pub rerank_on: bool,
    pub rerank_shortlist: usize,
    pub score_method: ScoreMethod,
    pub score_normalization_on: bool,
}

impl ResolvedParams {
    /// Config string of the vocabulary: parent feature config + clustering params.
    pub fn vocab_cfgstr(&self) -> String {
        format!(
            "{}_VOCAB(nW={},alg={:?},seed={},it={},bs={})",
            self.feature_cfgstr,
            self.num_words,
            self.vocab_algorithm,
            self.vocab_seed,
            self.vocab_max_iters,
            self.vocab_batch_size
        )
    }

    pub fn vocab_key(&self) -> String {
        content_key("vocab", &self.vocab_cfgstr())
    }

    /// Config string of the inverted index (vocabulary, assignment and
    /// kernel params; the gammas depend on the kernel).
    pub fn index_cfgstr(&self) -> String {
        format!(
            "{}_INVA(nA={},a={},s={},eq={},i8={})_SMK(a={},t={})",
            self.vocab_cfgstr(),
            self.assignment_k,
            self.massign_alpha,
            self.massign_sigma,
            self.massign_equal_weights,
            self.residual_int8,
            self.smk_alpha,
            self.smk_thresh
        )
    }

    pub fn index_key(&self, gallery: &[Aid]) -> String {
        content_key(
            "inva",
            &format!("{}_DAIDS({:016x})", self.index_cfgstr(), gallery_hash(gallery)),
        )
    }

    /// Key of the flat neighbor index over gallery descriptors.
    pub fn nn_key(&self, gallery: &[Aid]) -> String {
        content_key(
            "nnindex",
            &format!(
                "{}_NN(ex={},nl={},np={})_DAIDS({:016x})",
                self.feature_cfgstr,
                self.ann_exact_threshold,
                self.ann_nlist,
                self.ann_nprobe,
                gallery_hash(gallery)
            ),
        )
    }

    /// Scoring config string; normalizers are trained per scoring config.
    pub fn scoring_cfgstr(&self) -> String {
        format!(
            "{}_{:?}_K={}+{}_ratio={}({})_lnbnn={}_fg={}_sv={}_score={:?}",
            self.feature_cfgstr,
            self.pipeline_root,
            self.k,
            self.knorm,
            self.ratio_on,
            self.ratio_thresh,
            self.lnbnn_on,
            self.fg_on,
            self.sv_on,
            self.score_method
        )
    }

    pub fn normalizer_key(&self) -> String {
        let species = self.species.as_deref().unwrap_or("unknown");
        content_key(species, &self.scoring_cfgstr())
    }
}

/// Order-independent hash of a gallery id set.
pub fn gallery_hash(aids: &[Aid]) -> u64 {
    let mut sorted = aids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut bytes = Vec::with_capacity(sorted.len() * 8);
    for aid in sorted {
        bytes.extend_from_slice(&aid.to_le_bytes());
    }
    seahash::hash(&bytes)
}

/// `<prefix>_<hash>` key addressing a cached resource.
pub fn content_key(prefix: &str, cfgstr: &str) -> String {
    format!("{}_{:016x}", prefix, seahash::hash(cfgstr.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_resolves() {
        let params = QueryConfig::default().resolve().unwrap();
        assert_eq!(params.k, 4);
        assert_eq!(params.knorm, 1);
        assert_eq!(params.pipeline_root, PipelineRoot::Vsmany);
    }

    #[test]
    fn knorm_dropped_when_no_channel_needs_it() {
        let config = QueryConfig {
            lnbnn_on: false,
            ratio_on: false,
            knorm: 3,
            ..Default::default()
        };
        assert_eq!(config.resolve().unwrap().knorm, 0);
    }

    #[test]
    fn gallery_hash_ignores_order_and_duplicates() {
        assert_eq!(gallery_hash(&[3, 1, 2]), gallery_hash(&[1, 2, 3, 3]));
        assert_ne!(gallery_hash(&[1, 2]), gallery_hash(&[1, 2, 3]));
    }

    #[test]
    fn keys_change_with_parent_feature_config() {
        let a = QueryConfig::default().resolve().unwrap();
        let b = QueryConfig {
            feature_cfgstr: "hesaff".into(),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_ne!(a.vocab_key(), b.vocab_key());
        assert_ne!(a.index_key(&[1, 2]), b.index_key(&[1, 2]));
        assert_eq!(a.index_key(&[2, 1]), a.index_key(&[1, 2]));
    }

    #[test]
    fn index_key_changes_with_kernel_params() {
        let smk = |smk_alpha, smk_thresh| {
            QueryConfig {
                pipeline_root: PipelineRoot::Smk,
                smk_alpha,
                smk_thresh,
                ..Default::default()
            }
            .resolve()
            .unwrap()
        };
        let base = smk(3.0, 0.0);
        assert_ne!(base.index_key(&[1, 2]), smk(1.0, 0.0).index_key(&[1, 2]));
        assert_ne!(base.index_key(&[1, 2]), smk(3.0, 0.2).index_key(&[1, 2]));
        assert_eq!(base.vocab_key(), smk(1.0, 0.2).vocab_key());
    }
}
