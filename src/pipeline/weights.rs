//! Neighbor validity and score channels
//!
//! Validity is a mask aligned with the neighbor lists of the search. Filters
//! and channels only clear entries; nothing is removed until correspondences
//! are collected per gallery annotation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::neighbors::NeighborIndex;
use crate::ann::Neighbor;
use crate::config::ResolvedParams;
use crate::features::FeatureStore;
use crate::types::{Aid, Identity};
use crate::Result;

pub const LNBNN_CHANNEL: &str = "lnbnn";
pub const RATIO_CHANNEL: &str = "ratio";
pub const FG_CHANNEL: &str = "fg";

/// Neighbors of every descriptor of one searched annotation.
///
/// `neighbors[fx]` holds up to `k + knorm` hits; `valid[fx]` and `fsv[fx]`
/// cover the first `k` of them.
#[derive(Debug, Clone)]
pub struct WeightedNeighbors {
    pub aid: Aid,
    pub neighbors: Vec<Vec<Neighbor>>,
    pub valid: Vec<Vec<bool>>,
    pub fsv: Vec<Vec<Vec<f32>>>,
}

impl WeightedNeighbors {
    /// Every match candidate starts out valid.
    pub fn new(aid: Aid, neighbors: Vec<Vec<Neighbor>>, k: usize) -> Self {
        let valid: Vec<Vec<bool>> = neighbors
            .iter()
            .map(|hits| vec![true; hits.len().min(k)])
            .collect();
        let fsv = valid
            .iter()
            .map(|mask| vec![Vec::new(); mask.len()])
            .collect();
        Self {
            aid,
            neighbors,
            valid,
            fsv,
        }
    }

    /// An annotation that produced no search at all.
    pub fn empty(aid: Aid) -> Self {
        Self::new(aid, Vec::new(), 0)
    }

    pub fn num_valid(&self) -> usize {
        self.valid.iter().flatten().filter(|v| **v).count()
    }

    /// `(feature, rank)` of every valid match candidate.
    pub fn valid_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for (fx, mask) in self.valid.iter().enumerate() {
            for (rank, valid) in mask.iter().enumerate() {
                if *valid {
                    pairs.push((fx, rank));
                }
            }
        }
        pairs
    }
}

/// Identity labels read from the store, memoized per batch.
///
/// A failed lookup is treated as an unknown identity.
pub struct IdentityCache<'a> {
    store: &'a dyn FeatureStore,
    labels: HashMap<Aid, Identity>,
}

impl<'a> IdentityCache<'a> {
    pub fn new(store: &'a dyn FeatureStore) -> Self {
        Self {
            store,
            labels: HashMap::new(),
        }
    }

    pub fn get(&mut self, aid: Aid) -> Identity {
        let store = self.store;
        *self
            .labels
            .entry(aid)
            .or_insert_with(|| match store.get_identity_label(aid) {
                Ok(identity) => identity,
                Err(err) => {
                    tracing::debug!(aid, error = %err, "Identity lookup failed; treating as unknown");
                    Identity::Unknown
                }
            })
    }
}

/// Where the foreground weight of a correspondence is read from.
#[derive(Debug, Clone, Copy)]
pub enum Foreground<'a> {
    Off,
    /// Weights of the searched annotation's descriptors.
    Searched(&'a [f32]),
    /// Weights of the indexed annotation's descriptors.
    Indexed(&'a [f32]),
}

/// Channel labels produced by [`weight_neighbors`] under `params`, in order.
pub fn channel_labels(params: &ResolvedParams) -> Vec<String> {
    let mut labels = Vec::new();
    if params.lnbnn_on {
        labels.push(LNBNN_CHANNEL.to_string());
    }
    if params.ratio_on {
        labels.push(RATIO_CHANNEL.to_string());
    }
    if params.fg_on {
        labels.push(FG_CHANNEL.to_string());
    }
    labels
}

/// Clear candidates that match the searched annotation itself or, when
/// same-name matching is disabled, an annotation of the same known identity.
pub fn baseline_filter(
    wn: &mut WeightedNeighbors,
    index: &NeighborIndex,
    searched_identity: Identity,
    params: &ResolvedParams,
    identities: &mut IdentityCache<'_>,
) {
    for (hits, mask) in wn.neighbors.iter().zip(wn.valid.iter_mut()) {
        for (hit, valid) in hits.iter().zip(mask.iter_mut()) {
            if !*valid {
                continue;
            }
            let (owner, _) = index.owner(hit.index);
            if owner == wn.aid {
                *valid = false;
                continue;
            }
            if !params.can_match_samename && searched_identity.is_known() {
                *valid = identities.get(owner) != searched_identity;
            }
        }
    }
}

/// Compute the enabled score channels of every candidate.
///
/// Channels use Euclidean distances. `lnbnn` is the normalizer distance minus
/// the match distance and `ratio` is `1 - d_match / d_norm`; both clear a
/// candidate without a normalizer neighbor, and `ratio` also clears one whose
/// distance ratio reaches `ratio_thresh`.
pub fn weight_neighbors(
    wn: &mut WeightedNeighbors,
    index: &NeighborIndex,
    params: &ResolvedParams,
    foreground: Foreground<'_>,
) {
    let needs_norm = params.lnbnn_on || params.ratio_on;
    for fx in 0..wn.valid.len() {
        let hits = &wn.neighbors[fx];
        let norm = if needs_norm {
            hits.get(params.k).map(|n| n.distance.max(0.0).sqrt())
        } else {
            None
        };
        for rank in 0..wn.valid[fx].len() {
            let hit = hits[rank];
            let d_match = hit.distance.max(0.0).sqrt();
            let mut channels = Vec::with_capacity(3);
            let mut valid = wn.valid[fx][rank];

            if params.lnbnn_on {
                match norm {
                    Some(d_norm) => channels.push((d_norm - d_match).max(0.0)),
                    None => {
                        channels.push(0.0);
                        valid = false;
                    }
                }
            }
            if params.ratio_on {
                match norm {
                    Some(d_norm) if d_norm > 0.0 => {
                        let ratio = d_match / d_norm;
                        if ratio >= params.ratio_thresh {
                            valid = false;
                        }
                        channels.push(1.0 - ratio);
                    }
                    _ => {
                        channels.push(0.0);
                        valid = false;
                    }
                }
            }
            if params.fg_on {
                let weight = match foreground {
                    Foreground::Off => 1.0,
                    Foreground::Searched(weights) => weights.get(fx).copied().unwrap_or(1.0),
                    Foreground::Indexed(weights) => {
                        let (_, dfx) = index.owner(hit.index);
                        weights.get(dfx).copied().unwrap_or(1.0)
                    }
                };
                channels.push(weight);
            }

            wn.valid[fx][rank] = valid;
            wn.fsv[fx][rank] = channels;
        }
    }
}

/// Correspondences collected for one indexed annotation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correspondences {
    /// `(searched feature, indexed feature)` pairs.
    pub fm: Vec<(usize, usize)>,
    pub fsv: Vec<Vec<f32>>,
    pub fk: Vec<usize>,
}

impl Correspondences {
    fn push(&mut self, pair: (usize, usize), channels: Vec<f32>, rank: usize) {
        self.fm.push(pair);
        self.fsv.push(channels);
        self.fk.push(rank);
    }

    /// Swap the sides of every pair.
    pub fn flipped(mut self) -> Self {
        for pair in &mut self.fm {
            *pair = (pair.1, pair.0);
        }
        self
    }
}

/// Group the valid candidates by the annotation owning the neighbor.
///
/// Candidates keep their search order: searched feature first, then rank.
pub fn group_by_owner(
    wn: &WeightedNeighbors,
    index: &NeighborIndex,
) -> BTreeMap<Aid, Correspondences> {
    let mut groups: BTreeMap<Aid, Correspondences> = BTreeMap::new();
    for (fx, rank) in wn.valid_pairs() {
        let hit = wn.neighbors[fx][rank];
        let (owner, ofx) = index.owner(hit.index);
        groups
            .entry(owner)
            .or_default()
            .push((fx, ofx), wn.fsv[fx][rank].clone(), rank);
    }
    groups
}

/// Foreground weights of `aid`; a non-fatal read failure means no weights.
pub(super) fn read_foreground(
    store: &dyn FeatureStore,
    aid: Aid,
) -> Result<Option<Arc<Vec<f32>>>> {
    match store.get_foreground_weight(aid) {
        Ok(weights) => Ok(weights),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            tracing::debug!(aid, error = %err, "No foreground weights; using 1.0");
            Ok(None)
        }
    }
}
