//! Annotation feature store
//!
//! Keypoints, descriptors, identity labels and foreground weights are owned by
//! an external annotation store. The matching core only reads them through the
//! [`FeatureStore`] capability.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::types::{Aid, FeatureSet, Identity};
use crate::{Error, Result};

/// Read-only access to per-annotation features.
pub trait FeatureStore: Send + Sync {
    /// Keypoints and descriptor vectors of an annotation.
    fn get_descriptors(&self, aid: Aid) -> Result<Arc<FeatureSet>>;

    /// Number of active descriptors of an annotation.
    fn get_descriptor_count(&self, aid: Aid) -> Result<usize> {
        Ok(self.get_descriptors(aid)?.len())
    }

    fn get_identity_label(&self, aid: Aid) -> Result<Identity>;

    /// Per-descriptor foreground weight, if the store computed one.
    fn get_foreground_weight(&self, aid: Aid) -> Result<Option<Arc<Vec<f32>>>> {
        let _ = aid;
        Ok(None)
    }

    /// Species of an annotation, if known.
    fn get_species(&self, aid: Aid) -> Result<Option<String>> {
        let _ = aid;
        Ok(None)
    }
}

/// One annotation as stored by [`InMemoryFeatureStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub aid: Aid,
    #[serde(default = "unknown_identity")]
    pub identity: Identity,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(flatten)]
    pub features: FeatureSet,
    #[serde(default)]
    pub foreground: Option<Vec<f32>>,
}

fn unknown_identity() -> Identity {
    Identity::Unknown
}

#[derive(Serialize, Deserialize)]
struct FeatureDump {
    annotations: Vec<AnnotationRecord>,
}

struct StoredAnnotation {
    identity: Identity,
    species: Option<String>,
    features: Arc<FeatureSet>,
    foreground: Option<Arc<Vec<f32>>>,
}

/// Feature store backed by a hash map, loadable from a JSON dump.
#[derive(Default)]
pub struct InMemoryFeatureStore {
    annotations: HashMap<Aid, StoredAnnotation>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an annotation.
    pub fn insert(&mut self, record: AnnotationRecord) -> Result<()> {
        let features = record.features;
        if features.keypoints.len() != features.vectors.len() {
            return Err(Error::invalid(format!(
                "annotation {}: {} keypoints but {} descriptors",
                record.aid,
                features.keypoints.len(),
                features.vectors.len()
            )));
        }
        if let Some(dim) = features.dim() {
            if features.vectors.iter().any(|v| v.len() != dim) {
                return Err(Error::invalid(format!(
                    "annotation {}: ragged descriptor dimensions",
                    record.aid
                )));
            }
        }
        if let Some(fg) = &record.foreground {
            if fg.len() != features.vectors.len() {
                return Err(Error::invalid(format!(
                    "annotation {}: {} foreground weights for {} descriptors",
                    record.aid,
                    fg.len(),
                    features.vectors.len()
                )));
            }
        }
        self.annotations.insert(
            record.aid,
            StoredAnnotation {
                identity: record.identity,
                species: record.species,
                features: Arc::new(features),
                foreground: record.foreground.map(Arc::new),
            },
        );
        Ok(())
    }

    /// Reassign an identity label.
    pub fn set_identity(&mut self, aid: Aid, identity: Identity) -> Result<()> {
        let entry = self
            .annotations
            .get_mut(&aid)
            .ok_or(Error::AnnotationNotFound(aid))?;
        entry.identity = identity;
        Ok(())
    }

    pub fn aids(&self) -> Vec<Aid> {
        let mut aids: Vec<Aid> = self.annotations.keys().copied().collect();
        aids.sort_unstable();
        aids
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// Load a JSON dump of the form `{"annotations": [...]}`.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let dump: FeatureDump = serde_json::from_slice(&data)?;
        let mut store = Self::new();
        for record in dump.annotations {
            store.insert(record)?;
        }
        tracing::info!(
            annotations = store.len(),
            path = %path.as_ref().display(),
            "Loaded feature dump"
        );
        Ok(store)
    }

    fn entry(&self, aid: Aid) -> Result<&StoredAnnotation> {
        self.annotations
            .get(&aid)
            .ok_or(Error::AnnotationNotFound(aid))
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn get_descriptors(&self, aid: Aid) -> Result<Arc<FeatureSet>> {
        Ok(self.entry(aid)?.features.clone())
    }

    fn get_descriptor_count(&self, aid: Aid) -> Result<usize> {
        Ok(self.entry(aid)?.features.len())
    }

    fn get_identity_label(&self, aid: Aid) -> Result<Identity> {
        Ok(self.entry(aid)?.identity)
    }

    fn get_foreground_weight(&self, aid: Aid) -> Result<Option<Arc<Vec<f32>>>> {
        Ok(self.entry(aid)?.foreground.clone())
    }

    fn get_species(&self, aid: Aid) -> Result<Option<String>> {
        Ok(self.entry(aid)?.species.clone())
    }
}
