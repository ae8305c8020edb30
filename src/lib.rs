//! Pelage - instance-level animal identification by local feature matching
//!
//! A query annotation's descriptors are matched against a gallery and the
//! evidence is aggregated into ranked identities:
//! - Nearest-neighbor matching (one-vs-many and one-vs-one) with ratio,
//!   LNBNN and foreground weighting plus RANSAC spatial verification
//! - A visual vocabulary and inverted index scored with the selective
//!   match kernel (SMK)
//! - Interchangeable annotation/identity scoring strategies
//! - Score normalization to calibrated match probabilities

pub mod ann;
pub mod cache;
pub mod chipmatch;
pub mod config;
pub mod error;
pub mod features;
pub mod normalizer;
pub mod persist;
pub mod pipeline;
pub mod pool;
pub mod request;
pub mod service;
pub mod smk;
pub mod types;
pub mod vocab;

pub use error::{Error, Result};
