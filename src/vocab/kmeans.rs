//! Clustering routines used to learn vocabulary words.

use rand::{prelude::SliceRandom, rngs::StdRng, Rng, SeedableRng};

use crate::types::{l2_squared, Vector};
use crate::{Error, Result};

/// A clustering algorithm producing `num_clusters` centers from a sample.
pub trait Clusterer: Send + Sync {
    fn cluster(&self, samples: &[Vector], num_clusters: usize, seed: u64) -> Result<Vec<Vector>>;

    fn name(&self) -> &'static str;
}

/// Lloyd iterations with k-means++ initialization.
#[derive(Clone, Debug)]
pub struct KMeans {
    /// Maximum number of k-means iterations.
    pub max_iterations: usize,
    /// Early stopping tolerance on centroid movement (L2 norm).
    pub tolerance: f32,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-4,
        }
    }
}

/// Mini-batch k-means: per-center learning rates decay as `1 / count`.
#[derive(Clone, Debug)]
pub struct MiniBatchKMeans {
    pub max_iterations: usize,
    pub batch_size: usize,
}

impl Default for MiniBatchKMeans {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            batch_size: 1000,
        }
    }
}

impl Clusterer for KMeans {
    fn cluster(&self, samples: &[Vector], num_clusters: usize, seed: u64) -> Result<Vec<Vector>> {
        let k = validate(samples, num_clusters)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut centers = initialize_kmeans_pp(samples, k, &mut rng)?;
        let mut assignments = vec![usize::MAX; samples.len()];
        let tolerance = self.tolerance.max(0.0);

        for _ in 0..self.max_iterations.max(1) {
            let changed = assign_samples(samples, &centers, &mut assignments);
            let shift = update_centers(samples, &assignments, &mut centers, &mut rng)?;
            if !changed || shift <= tolerance {
                break;
            }
        }
        Ok(centers)
    }

    fn name(&self) -> &'static str {
        "kmeans"
    }
}

impl Clusterer for MiniBatchKMeans {
    fn cluster(&self, samples: &[Vector], num_clusters: usize, seed: u64) -> Result<Vec<Vector>> {
        let k = validate(samples, num_clusters)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut centers = initialize_kmeans_pp(samples, k, &mut rng)?;
        let mut counts = vec![0usize; k];
        let batch_size = self.batch_size.max(1);
        let mut batch: Vec<usize> = Vec::with_capacity(batch_size.min(samples.len()));

        for _ in 0..self.max_iterations.max(1) {
            batch.clear();
            if batch_size >= samples.len() {
                batch.extend(0..samples.len());
            } else {
                for _ in 0..batch_size {
                    batch.push(rng.gen_range(0..samples.len()));
                }
            }

            let nearest: Vec<usize> = batch
                .iter()
                .map(|&idx| nearest_center(&samples[idx], &centers).0)
                .collect();

            for (&idx, &cx) in batch.iter().zip(nearest.iter()) {
                counts[cx] += 1;
                let eta = 1.0 / counts[cx] as f32;
                for (c, x) in centers[cx].iter_mut().zip(samples[idx].iter()) {
                    *c += eta * (x - *c);
                }
            }
        }
        Ok(centers)
    }

    fn name(&self) -> &'static str {
        "minibatch"
    }
}

fn validate(samples: &[Vector], num_clusters: usize) -> Result<usize> {
    if samples.is_empty() {
        return Err(Error::EmptyTrainingSet(
            "cannot cluster an empty descriptor sample".into(),
        ));
    }
    if num_clusters == 0 {
        return Err(Error::invalid("number of clusters must be > 0"));
    }
    let dim = samples[0].len();
    if dim == 0 {
        return Err(Error::invalid("sample dimensionality must be > 0"));
    }
    for (idx, sample) in samples.iter().enumerate() {
        if sample.len() != dim {
            return Err(Error::invalid(format!(
                "sample {idx} dimension mismatch: {} vs {}",
                sample.len(),
                dim
            )));
        }
    }
    Ok(num_clusters.min(samples.len()))
}

/// Index and squared distance of the closest center.
pub(crate) fn nearest_center(vector: &[f32], centers: &[Vector]) -> (usize, f32) {
    let mut best_idx = 0usize;
    let mut best_dist = f32::MAX;
    for (idx, center) in centers.iter().enumerate() {
        let distance = l2_squared(vector, center);
        if distance < best_dist {
            best_dist = distance;
            best_idx = idx;
        }
    }
    (best_idx, best_dist)
}

fn assign_samples(samples: &[Vector], centers: &[Vector], assignments: &mut [usize]) -> bool {
    let mut changed = false;
    for (idx, sample) in samples.iter().enumerate() {
        let (cx, _) = nearest_center(sample, centers);
        if assignments[idx] != cx {
            assignments[idx] = cx;
            changed = true;
        }
    }
    changed
}

fn update_centers(
    samples: &[Vector],
    assignments: &[usize],
    centers: &mut [Vector],
    rng: &mut StdRng,
) -> Result<f32> {
    let dim = centers
        .first()
        .ok_or_else(|| Error::internal("centers must not be empty"))?
        .len();
    let mut sums = vec![vec![0.0f32; dim]; centers.len()];
    let mut counts = vec![0usize; centers.len()];

    for (sample, &cx) in samples.iter().zip(assignments.iter()) {
        for (s, x) in sums[cx].iter_mut().zip(sample.iter()) {
            *s += x;
        }
        counts[cx] += 1;
    }

    let mut max_shift = 0.0f32;
    for (idx, center) in centers.iter_mut().enumerate() {
        if counts[idx] == 0 {
            // Dead center: reseed from a random sample.
            let replacement = samples
                .choose(rng)
                .ok_or_else(|| Error::internal("failed to reseed center"))?;
            *center = replacement.clone();
            continue;
        }
        let next: Vector = sums[idx]
            .iter()
            .map(|value| *value / counts[idx] as f32)
            .collect();
        let shift = l2_squared(center, &next).sqrt();
        if shift > max_shift {
            max_shift = shift;
        }
        *center = next;
    }
    Ok(max_shift)
}

fn initialize_kmeans_pp(samples: &[Vector], k: usize, rng: &mut StdRng) -> Result<Vec<Vector>> {
    let mut centers = Vec::with_capacity(k);
    let first = samples
        .choose(rng)
        .ok_or_else(|| Error::internal("no samples available for initialization"))?;
    centers.push(first.clone());

    while centers.len() < k {
        let mut weights = Vec::with_capacity(samples.len());
        let mut total = 0.0f64;
        for sample in samples {
            let (_, dist) = nearest_center(sample, &centers);
            weights.push(dist as f64);
            total += dist as f64;
        }

        let chosen = if total <= f64::EPSILON {
            rng.gen_range(0..samples.len())
        } else {
            let target = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = samples.len() - 1;
            for (idx, weight) in weights.iter().enumerate() {
                cumulative += weight;
                if cumulative >= target && *weight > 0.0 {
                    chosen = idx;
                    break;
                }
            }
            chosen
        };
        centers.push(samples[chosen].clone());
    }
    Ok(centers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered_samples() -> Vec<Vector> {
        let mut samples = Vec::new();
        for i in 0..50 {
            samples.push(vec![i as f32 * 0.02, 0.0]);
        }
        for i in 0..50 {
            samples.push(vec![10.0 + i as f32 * 0.02, 0.0]);
        }
        samples
    }

    fn assert_separates(centers: &[Vector]) {
        assert_eq!(centers.len(), 2);
        let (left, _) = nearest_center(&[0.1, 0.0], centers);
        let (right, _) = nearest_center(&[10.1, 0.0], centers);
        assert_ne!(left, right, "points from different clusters map to same center");
    }

    #[test]
    fn kmeans_separates_clusters() {
        let centers = KMeans::default()
            .cluster(&clustered_samples(), 2, 7)
            .unwrap();
        assert_separates(&centers);
    }

    #[test]
    fn minibatch_separates_clusters() {
        let clusterer = MiniBatchKMeans {
            max_iterations: 50,
            batch_size: 16,
        };
        let centers = clusterer.cluster(&clustered_samples(), 2, 7).unwrap();
        assert_separates(&centers);
    }

    #[test]
    fn same_seed_same_centers() {
        let samples = clustered_samples();
        let a = MiniBatchKMeans::default().cluster(&samples, 3, 11).unwrap();
        let b = MiniBatchKMeans::default().cluster(&samples, 3, 11).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_sample_is_an_error() {
        let err = KMeans::default().cluster(&[], 4, 0).unwrap_err();
        assert!(matches!(err, Error::EmptyTrainingSet(_)));
    }

    #[test]
    fn clamps_cluster_count_to_sample_size() {
        let samples = vec![vec![0.0, 0.0], vec![1.0, 1.0]];
        let centers = KMeans::default().cluster(&samples, 10, 0).unwrap();
        assert_eq!(centers.len(), 2);
    }
}
