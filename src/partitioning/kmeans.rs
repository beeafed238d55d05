//! k-means clustering implementation.
//!
//! Shared by PQ codebook training (one run per subspace) and by the
//! partitioned graph build (shard centroids).

use crate::error::{Result, RetrieveError};
use crate::simd;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Lloyd k-means over squared L2 with k-means++ seeding.
pub struct KMeans {
    /// Centroids, flat (k x dimension)
    centroids: Vec<f32>,
    dimension: usize,
    k: usize,
    max_iterations: usize,
    seed: Option<u64>,
}

impl KMeans {
    /// Create new k-means with k clusters.
    pub fn new(dimension: usize, k: usize) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(RetrieveError::InvalidParameter(
                "k-means dimension and k must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            max_iterations: 100,
            seed: None,
        })
    }

    /// Configure a deterministic seed for k-means++ initialization.
    ///
    /// When set, repeated `fit(...)` calls on the same inputs produce identical results.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations.max(1);
        self
    }

    /// Train on `num_vectors` row-major vectors.
    ///
    /// When there are fewer vectors than clusters, `k` shrinks to `num_vectors`.
    pub fn fit(&mut self, vectors: &[f32], num_vectors: usize) -> Result<()> {
        if num_vectors == 0 || vectors.len() < num_vectors * self.dimension {
            return Err(RetrieveError::InvalidParameter(format!(
                "k-means needs {} vectors of dimension {}, got {} floats",
                num_vectors,
                self.dimension,
                vectors.len()
            )));
        }
        self.k = self.k.min(num_vectors);

        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        self.centroids = self.kmeans_plus_plus(vectors, num_vectors, &mut rng);

        for _ in 0..self.max_iterations {
            let assignments = self.assign_clusters(vectors, num_vectors);
            let new_centroids =
                self.update_centroids(vectors, num_vectors, &assignments, &mut rng);

            let shift = self
                .centroids
                .chunks_exact(self.dimension)
                .zip(new_centroids.chunks_exact(self.dimension))
                .map(|(old, new)| simd::l2_distance_squared(old, new))
                .fold(0.0f32, f32::max);

            self.centroids = new_centroids;
            if shift <= 1e-6 {
                break;
            }
        }

        Ok(())
    }

    /// k-means++ initialization.
    ///
    /// Keeps a running nearest-centroid distance per point so each new centroid
    /// costs one pass over the data.
    fn kmeans_plus_plus(&self, vectors: &[f32], num_vectors: usize, rng: &mut StdRng) -> Vec<f32> {
        let mut centroids = Vec::with_capacity(self.k * self.dimension);

        let first = rng.random_range(0..num_vectors);
        centroids.extend_from_slice(self.get_vector(vectors, first));

        let mut min_dist: Vec<f32> = (0..num_vectors)
            .into_par_iter()
            .map(|i| simd::l2_distance_squared(self.get_vector(vectors, i), &centroids))
            .collect();

        while centroids.len() < self.k * self.dimension {
            let total: f64 = min_dist.iter().map(|&d| d as f64).sum();
            let chosen = if total <= 0.0 {
                rng.random_range(0..num_vectors)
            } else {
                let threshold = rng.random::<f64>() * total;
                let mut cumulative = 0.0;
                let mut pick = num_vectors - 1;
                for (i, &d) in min_dist.iter().enumerate() {
                    cumulative += d as f64;
                    if cumulative >= threshold {
                        pick = i;
                        break;
                    }
                }
                pick
            };

            let start = centroids.len();
            centroids.extend_from_slice(self.get_vector(vectors, chosen));
            let newest = &centroids[start..];
            min_dist.par_iter_mut().enumerate().for_each(|(i, d)| {
                let nd = simd::l2_distance_squared(self.get_vector(vectors, i), newest);
                if nd < *d {
                    *d = nd;
                }
            });
        }

        centroids
    }

    /// Assign vectors to nearest clusters.
    pub fn assign_clusters(&self, vectors: &[f32], num_vectors: usize) -> Vec<usize> {
        (0..num_vectors)
            .into_par_iter()
            .map(|i| self.nearest(self.get_vector(vectors, i)).0)
            .collect()
    }

    /// Indices of the `n` closest centroids to `v`, nearest first.
    pub fn nearest_n(&self, v: &[f32], n: usize) -> Vec<usize> {
        let mut scored: Vec<(usize, f32)> = self
            .centroids
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(c, centroid)| (c, simd::l2_distance_squared(v, centroid)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(n);
        scored.into_iter().map(|(c, _)| c).collect()
    }

    /// Nearest centroid index and its squared distance.
    #[inline]
    pub fn nearest(&self, v: &[f32]) -> (usize, f32) {
        let mut best = (0, f32::INFINITY);
        for (c, centroid) in self.centroids.chunks_exact(self.dimension).enumerate() {
            let d = simd::l2_distance_squared(v, centroid);
            if d < best.1 {
                best = (c, d);
            }
        }
        best
    }

    /// Update centroids based on assignments.
    ///
    /// An empty cluster is re-seeded with a random input vector.
    fn update_centroids(
        &self,
        vectors: &[f32],
        num_vectors: usize,
        assignments: &[usize],
        rng: &mut StdRng,
    ) -> Vec<f32> {
        let mut sums = vec![0.0f64; self.k * self.dimension];
        let mut counts = vec![0usize; self.k];

        for (i, &cluster) in assignments.iter().enumerate().take(num_vectors) {
            counts[cluster] += 1;
            let row = &mut sums[cluster * self.dimension..(cluster + 1) * self.dimension];
            for (s, &x) in row.iter_mut().zip(self.get_vector(vectors, i)) {
                *s += x as f64;
            }
        }

        let mut centroids = Vec::with_capacity(self.k * self.dimension);
        for (c, &count) in counts.iter().enumerate() {
            if count > 0 {
                let row = &sums[c * self.dimension..(c + 1) * self.dimension];
                centroids.extend(row.iter().map(|&s| (s / count as f64) as f32));
            } else {
                let pick = rng.random_range(0..num_vectors);
                centroids.extend_from_slice(self.get_vector(vectors, pick));
            }
        }
        centroids
    }

    /// Get vector from row-major storage.
    #[inline]
    fn get_vector<'a>(&self, vectors: &'a [f32], idx: usize) -> &'a [f32] {
        let start = idx * self.dimension;
        &vectors[start..start + self.dimension]
    }

    /// Flat centroid table (k x dimension).
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Effective cluster count after fitting.
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}
