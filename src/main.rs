//! Pelage command-line binary

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pelage::config::{AppConfig, LogFormat};
use pelage::features::{FeatureStore, InMemoryFeatureStore};
use pelage::normalizer::NormalizedScore;
use pelage::service::QueryService;
use pelage::types::{Aid, IdentityScore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (overrides PELAGE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the visual vocabulary of the configured query settings
    BuildVocab {
        /// JSON feature dump
        #[arg(long)]
        features: PathBuf,
        /// Annotations sampled for training (all when omitted)
        #[arg(long, value_delimiter = ',')]
        aids: Vec<Aid>,
    },
    /// Rank gallery identities for each query annotation
    Identify {
        #[arg(long)]
        features: PathBuf,
        #[arg(long, value_delimiter = ',', required = true)]
        query: Vec<Aid>,
        /// Gallery annotations (all other annotations when omitted)
        #[arg(long, value_delimiter = ',')]
        gallery: Vec<Aid>,
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
}

#[derive(Serialize)]
struct RankedIdentity {
    #[serde(flatten)]
    score: IdentityScore,
    /// Omitted without a normalizer, `null` when the normalizer cannot tell.
    #[serde(skip_serializing_if = "Option::is_none")]
    probability: Option<Option<f32>>,
}

#[derive(Serialize)]
struct QueryOutput {
    qaid: Aid,
    num_matched_annots: usize,
    identities: Vec<RankedIdentity>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;

    init_tracing(&config)?;

    match cli.command {
        Command::BuildVocab { features, aids } => {
            let store = load_store(&features)?;
            let aids = if aids.is_empty() { store.aids() } else { aids };
            let service = QueryService::init(Arc::new(store), config.service.clone())?;
            let vocab = service
                .build_vocabulary(&aids, &config.query)
                .context("vocabulary build failed")?;
            tracing::info!(num_words = vocab.len(), cfgstr = vocab.cfgstr(), "Vocabulary ready");
            if config.service.cache_dir.is_none() {
                tracing::warn!("service.cache_dir is not set; the vocabulary was not persisted");
            }
            service.close();
        }
        Command::Identify {
            features,
            mut query,
            gallery,
            top,
        } => {
            let mut seen = std::collections::HashSet::new();
            query.retain(|aid| seen.insert(*aid));
            let store = load_store(&features)?;
            let gallery = if gallery.is_empty() {
                store
                    .aids()
                    .into_iter()
                    .filter(|aid| !query.contains(aid))
                    .collect()
            } else {
                gallery
            };
            let store: Arc<dyn FeatureStore> = Arc::new(store);
            let service = QueryService::init(store, config.service.clone())?;
            let mut results = service
                .run_query(&query, &gallery, &config.query)
                .context("query failed")?;

            let mut output = Vec::with_capacity(query.len());
            for qaid in &query {
                let cm = results
                    .remove(qaid)
                    .ok_or_else(|| anyhow!("no result for query annotation {qaid}"))?;
                let identities = cm
                    .top_identities_with_probability(top)
                    .into_iter()
                    .map(|(score, probability)| RankedIdentity {
                        score,
                        probability: probability.as_ref().map(NormalizedScore::probability),
                    })
                    .collect();
                output.push(QueryOutput {
                    qaid: *qaid,
                    num_matched_annots: cm.len(),
                    identities,
                });
            }
            println!("{}", serde_json::to_string_pretty(&output)?);
            service.close();
        }
    }

    Ok(())
}

fn load_store(path: &Path) -> anyhow::Result<InMemoryFeatureStore> {
    InMemoryFeatureStore::load_json(path)
        .with_context(|| format!("failed to load features from {}", path.display()))
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("pelage=info"));

    // Logs go to stderr so stdout carries only results.
    let registry = tracing_subscriber::registry().with(env_filter);

    match config.logging.format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
