//! Approximate nearest-neighbor index
//!
//! An inverted-file index: vectors are partitioned into k-means lists and a
//! query scans only the lists whose centroids are closest. Small collections
//! (fewer than `exact_threshold` vectors) are scanned exhaustively instead.
//!
//! Only the index structure is persisted. The vectors are supplied again on
//! load and checked against the fingerprint recorded at build time; a stale or
//! corrupted file is rebuilt from the vectors.

use rand::{prelude::SliceRandom, rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

use crate::persist;
use crate::types::{l2_squared, Vector};
use crate::vocab::kmeans::{nearest_center, Clusterer, KMeans};
use crate::{Error, Result};

/// Training points per list used to learn the coarse quantizer.
const TRAIN_POINTS_PER_LIST: usize = 64;

/// Build parameters for [`AnnIndex`].
#[derive(Debug, Clone)]
pub struct AnnParams {
    /// Collections smaller than this are searched exhaustively.
    pub exact_threshold: usize,
    /// Number of inverted lists (0 = `sqrt(n)`).
    pub nlist: usize,
    /// Lists scanned per query.
    pub nprobe: usize,
    pub seed: u64,
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            exact_threshold: 4096,
            nlist: 0,
            nprobe: 8,
            seed: 42,
        }
    }
}

/// One search hit: row index into the indexed vectors and squared L2 distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexStructure {
    dim: usize,
    num_vectors: usize,
    fingerprint: u64,
    nprobe: usize,
    centroids: Vec<Vector>,
    lists: Vec<Vec<u32>>,
}

#[derive(Debug)]
pub struct AnnIndex {
    structure: IndexStructure,
    /// Row-major copy of the indexed vectors.
    data: Vec<f32>,
}

impl AnnIndex {
    pub fn build(vectors: &[Vector], params: &AnnParams) -> Result<Self> {
        let (dim, data) = flatten(vectors)?;
        let num_vectors = vectors.len();
        let fingerprint = fingerprint(&data);

        let (centroids, lists) = if num_vectors < params.exact_threshold.max(1) {
            (Vec::new(), Vec::new())
        } else {
            let nlist = if params.nlist == 0 {
                ((num_vectors as f64).sqrt() as usize).max(1)
            } else {
                params.nlist.min(num_vectors)
            };
            train_lists(vectors, nlist, params.seed)?
        };

        tracing::debug!(
            num_vectors,
            dim,
            nlist = lists.len(),
            "Built nearest-neighbor index"
        );

        Ok(Self {
            structure: IndexStructure {
                dim,
                num_vectors,
                fingerprint,
                nprobe: params.nprobe.max(1),
                centroids,
                lists,
            },
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.structure.num_vectors
    }

    pub fn is_empty(&self) -> bool {
        self.structure.num_vectors == 0
    }

    pub fn dim(&self) -> usize {
        self.structure.dim
    }

    /// Whether queries scan every vector.
    pub fn is_exact(&self) -> bool {
        self.structure.lists.is_empty()
    }

    pub fn vector(&self, index: usize) -> &[f32] {
        let dim = self.structure.dim;
        &self.data[index * dim..(index + 1) * dim]
    }

    /// The `k` nearest indexed vectors, ascending by distance.
    ///
    /// Returns fewer than `k` hits only when the index holds fewer vectors.
    pub fn knn(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if k == 0 {
            return Err(Error::invalid("k must be >= 1"));
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.structure.dim {
            return Err(Error::invalid(format!(
                "query dimension mismatch: expected {}, got {}",
                self.structure.dim,
                query.len()
            )));
        }

        let mut heap = BinaryHeap::with_capacity(k + 1);
        if self.is_exact() {
            for index in 0..self.structure.num_vectors {
                push_bounded(&mut heap, k, index, l2_squared(query, self.vector(index)));
            }
        } else {
            let mut order: Vec<(usize, f32)> = self
                .structure
                .centroids
                .iter()
                .enumerate()
                .map(|(lx, c)| (lx, l2_squared(query, c)))
                .collect();
            order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

            let mut scanned = 0usize;
            for (probe, (lx, _)) in order.iter().enumerate() {
                // Keep probing past nprobe until k candidates were seen.
                if probe >= self.structure.nprobe && scanned >= k {
                    break;
                }
                for &index in &self.structure.lists[*lx] {
                    let index = index as usize;
                    push_bounded(&mut heap, k, index, l2_squared(query, self.vector(index)));
                    scanned += 1;
                }
            }
        }

        let mut hits: Vec<Neighbor> = heap
            .into_iter()
            .map(|item| Neighbor {
                index: item.index,
                distance: item.distance,
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.index.cmp(&b.index)));
        Ok(hits)
    }

    pub fn knn_batch(&self, queries: &[Vector], k: usize) -> Result<Vec<Vec<Neighbor>>> {
        queries.iter().map(|q| self.knn(q, k)).collect()
    }

    /// Whether this index was built over exactly these vectors.
    pub fn matches(&self, vectors: &[Vector]) -> bool {
        match flatten(vectors) {
            Ok((dim, data)) => {
                dim == self.structure.dim
                    && vectors.len() == self.structure.num_vectors
                    && fingerprint(&data) == self.structure.fingerprint
            }
            Err(_) => false,
        }
    }

    /// Persist the index structure (not the vectors).
    pub fn save(&self, path: &Path) -> Result<()> {
        persist::write_file(path, &self.structure)?;
        tracing::debug!(path = %path.display(), "Persisted nearest-neighbor index");
        Ok(())
    }

    /// Load a persisted structure and attach it to `vectors`.
    ///
    /// Fails with `CorruptedIndex` when the file does not describe `vectors`.
    pub fn load(path: &Path, vectors: &[Vector]) -> Result<Option<Self>> {
        let structure: IndexStructure = match persist::read_file(path)? {
            Some(structure) => structure,
            None => return Ok(None),
        };
        let (dim, data) = flatten(vectors)?;
        if structure.dim != dim
            || structure.num_vectors != vectors.len()
            || structure.fingerprint != fingerprint(&data)
        {
            return Err(Error::corrupted(format!(
                "{} was built over different vectors",
                path.display()
            )));
        }
        let max_index = structure.lists.iter().flatten().copied().max();
        if let Some(max_index) = max_index {
            if max_index as usize >= structure.num_vectors {
                return Err(Error::corrupted(format!(
                    "{} references vector {} of {}",
                    path.display(),
                    max_index,
                    structure.num_vectors
                )));
            }
        }
        Ok(Some(Self { structure, data }))
    }

    /// Load from `path` when valid, otherwise rebuild and overwrite it.
    pub fn load_or_build(path: &Path, vectors: &[Vector], params: &AnnParams) -> Result<Self> {
        match Self::load(path, vectors) {
            Ok(Some(index)) => return Ok(index),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Cached nearest-neighbor index is unusable; rebuilding"
                );
            }
        }
        let index = Self::build(vectors, params)?;
        if let Err(err) = index.save(path) {
            tracing::warn!(path = %path.display(), error = %err, "Failed to persist index");
        }
        Ok(index)
    }
}

fn train_lists(vectors: &[Vector], nlist: usize, seed: u64) -> Result<(Vec<Vector>, Vec<Vec<u32>>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let budget = nlist * TRAIN_POINTS_PER_LIST;
    let sample: Vec<Vector> = if vectors.len() > budget {
        vectors.choose_multiple(&mut rng, budget).cloned().collect()
    } else {
        vectors.to_vec()
    };
    let clusterer = KMeans {
        max_iterations: 10,
        tolerance: 1e-3,
    };
    let centroids = clusterer.cluster(&sample, nlist, seed)?;
    let mut lists = vec![Vec::new(); centroids.len()];
    for (index, vector) in vectors.iter().enumerate() {
        let (lx, _) = nearest_center(vector, &centroids);
        lists[lx].push(index as u32);
    }
    Ok((centroids, lists))
}

fn flatten(vectors: &[Vector]) -> Result<(usize, Vec<f32>)> {
    let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
    let mut data = Vec::with_capacity(vectors.len() * dim);
    for (idx, vector) in vectors.iter().enumerate() {
        if vector.len() != dim {
            return Err(Error::invalid(format!(
                "vector {idx} dimension mismatch: {} vs {}",
                vector.len(),
                dim
            )));
        }
        data.extend_from_slice(vector);
    }
    Ok((dim, data))
}

fn fingerprint(data: &[f32]) -> u64 {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for value in data {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    seahash::hash(&bytes)
}

struct HeapItem {
    distance: f32,
    index: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

fn push_bounded(heap: &mut BinaryHeap<HeapItem>, k: usize, index: usize, distance: f32) {
    let item = HeapItem { distance, index };
    if heap.len() < k {
        heap.push(item);
    } else if let Some(worst) = heap.peek() {
        if item < *worst {
            heap.pop();
            heap.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<Vector> {
        (0..n)
            .map(|i| vec![(i % 50) as f32, (i / 50) as f32])
            .collect()
    }

    #[test]
    fn exact_search_returns_sorted_neighbors() {
        let vectors = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![5.0, 0.0], vec![2.0, 0.0]];
        let index = AnnIndex::build(&vectors, &AnnParams::default()).unwrap();
        assert!(index.is_exact());
        let hits = index.knn(&[0.9, 0.0], 3).unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.index).collect();
        assert_eq!(order, vec![1, 0, 3]);
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn inverted_lists_find_true_nearest_on_grid() {
        let vectors = grid(2500);
        let params = AnnParams {
            exact_threshold: 100,
            nlist: 25,
            nprobe: 4,
            seed: 3,
        };
        let index = AnnIndex::build(&vectors, &params).unwrap();
        assert!(!index.is_exact());
        let hits = index.knn(&[10.2, 20.1], 1).unwrap();
        assert_eq!(hits[0].index, 20 * 50 + 10);
    }

    #[test]
    fn returns_fewer_hits_than_k_for_small_collections() {
        let index = AnnIndex::build(&[vec![1.0], vec![2.0]], &AnnParams::default()).unwrap();
        assert_eq!(index.knn(&[0.0], 5).unwrap().len(), 2);
        assert!(index.knn(&[0.0], 0).is_err());
    }

    #[test]
    fn stale_file_is_rebuilt() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("words.ann");
        let params = AnnParams {
            exact_threshold: 10,
            nlist: 4,
            nprobe: 2,
            seed: 1,
        };
        let original = grid(100);
        AnnIndex::build(&original, &params).unwrap().save(&path).unwrap();

        let mut changed = original.clone();
        changed[0] = vec![99.0, 99.0];
        assert!(matches!(
            AnnIndex::load(&path, &changed),
            Err(Error::CorruptedIndex(_))
        ));

        let rebuilt = AnnIndex::load_or_build(&path, &changed, &params).unwrap();
        assert!(rebuilt.matches(&changed));
        assert!(AnnIndex::load(&path, &changed).unwrap().is_some());
    }
}
