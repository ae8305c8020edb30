//! Error types for pelage

use thiserror::Error;

use crate::types::Aid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Pipeline configuration error: {0}")]
    PipelineConfiguration(String),

    #[error("Empty training set: {0}")]
    EmptyTrainingSet(String),

    #[error("Index not built: {0}")]
    IndexNotBuilt(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Annotation not found: {0}")]
    AnnotationNotFound(Aid),

    #[error("Corrupted index: {0}")]
    CorruptedIndex(String),

    #[error("Build cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::PipelineConfiguration(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Error::CorruptedIndex(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether this error aborts a whole batch instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PipelineConfiguration(_) | Error::Cancelled)
    }
}
