use std::io::Write;

use pelage::config::{AppConfig, LogFormat, PipelineRoot, QueryConfig, ScoreMethod, SvTransform};
use pelage::Error;

fn assert_config_error(config: QueryConfig, what: &str) {
    match config.resolve() {
        Err(Error::PipelineConfiguration(_)) => {}
        other => panic!("Expected configuration error for {what}, got {other:?}"),
    }
}

#[test]
fn rejects_invalid_query_settings() {
    assert_config_error(
        QueryConfig {
            k: 0,
            ..Default::default()
        },
        "k = 0",
    );
    assert_config_error(
        QueryConfig {
            assignment_k: 0,
            ..Default::default()
        },
        "assignment_k = 0",
    );
    assert_config_error(
        QueryConfig {
            num_words: 0,
            ..Default::default()
        },
        "num_words = 0",
    );
    assert_config_error(
        QueryConfig {
            massign_sigma: 0.0,
            ..Default::default()
        },
        "massign_sigma = 0",
    );
    assert_config_error(
        QueryConfig {
            ratio_on: true,
            knorm: 0,
            ..Default::default()
        },
        "ratio test without normalizer neighbor",
    );
}

#[test]
fn rerank_and_smk_scoring_need_their_roots() {
    assert_config_error(
        QueryConfig {
            rerank_on: true,
            ..Default::default()
        },
        "rerank outside vsone",
    );
    assert_config_error(
        QueryConfig {
            score_method: ScoreMethod::Smk,
            ..Default::default()
        },
        "smk scoring outside smk root",
    );

    let vsone = QueryConfig {
        pipeline_root: PipelineRoot::Vsone,
        rerank_on: true,
        ..Default::default()
    };
    assert!(vsone.resolve().is_ok());
}

#[test]
fn homography_needs_four_inliers() {
    assert_config_error(
        QueryConfig {
            spatial_verification_on: true,
            sv_transform: SvTransform::Homography,
            sv_min_inliers: 3,
            ..Default::default()
        },
        "homography with 3 inliers",
    );
}

#[test]
fn loads_sections_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[service]
workers = 3
cache_capacity = 2
chunk_size = 16

[query]
pipeline_root = "smk"
score_method = "smk"
num_words = 64
species = " zebra_plains "

[logging]
level = "debug"
format = "json"
"#
    )
    .unwrap();

    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(config.service.workers, 3);
    assert_eq!(config.service.cache_capacity, 2);
    assert_eq!(config.service.chunk_size, 16);
    assert!(matches!(config.logging.format, LogFormat::Json));

    let params = config.query.resolve().unwrap();
    assert_eq!(params.pipeline_root, PipelineRoot::Smk);
    assert_eq!(params.num_words, 64);
    assert_eq!(params.species.as_deref(), Some("zebra_plains"));
    assert!(params.normalizer_key().starts_with("zebra_plains_"));
}

#[test]
fn missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert!(config.service.workers >= 1);
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.query.pipeline_root, PipelineRoot::Vsmany);
}
