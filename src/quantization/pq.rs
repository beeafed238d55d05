//! Product Quantization (PQ).
//!
//! Vectors are centered on the training mean, split into `num_chunks`
//! contiguous subspaces and each slice is replaced by the index of its nearest
//! centroid in that subspace's codebook. Chunk widths differ by at most one
//! when the dimension is not divisible by the chunk count.
//!
//! Search scores codes with asymmetric distance computation: a
//! [`DistanceTable`] holds, per subspace, the squared distance from the query
//! slice to every centroid, so scoring a code is `num_chunks` lookups.

use crate::error::{Result, RetrieveError};
use crate::partitioning::KMeans;
use crate::simd;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Centroids per subspace; codes are one byte each.
pub const NUM_PQ_CENTROIDS: usize = 256;
/// Upper bound on vectors used for codebook training.
pub const MAX_PQ_TRAINING_SET: usize = 64_000;
/// Lloyd iterations per subspace.
const PQ_KMEANS_ITERATIONS: usize = 12;

/// Code length that fits `budget_bytes` over `rows` vectors of width `dim`.
///
/// Returns the length and whether the request had to be clamped. Requests
/// above `dim` bytes per vector are downsized so the codes never exceed
/// `dim * rows` bytes in total; requests below one byte get one byte.
pub fn code_len_for_budget(budget_bytes: u64, rows: usize, dim: usize) -> (usize, bool) {
    let requested = if rows == 0 {
        0
    } else {
        (budget_bytes / rows as u64) as usize
    };
    let len = requested.clamp(1, dim.max(1));
    (len, len != requested)
}

/// Trained PQ codebook. Immutable once built; shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PqCodebook {
    dim: usize,
    num_chunks: usize,
    num_centroids: usize,
    /// Subspace boundaries, `num_chunks + 1` entries.
    chunk_offsets: Vec<usize>,
    /// Training mean subtracted before encoding.
    centroid: Vec<f32>,
    /// Per chunk `c`: `num_centroids` rows of width `chunk_width(c)`,
    /// starting at `num_centroids * chunk_offsets[c]`.
    tables: Vec<f32>,
}

impl PqCodebook {
    /// Train a codebook on `num_vectors` row-major vectors.
    pub fn train(
        vectors: &[f32],
        num_vectors: usize,
        dim: usize,
        num_chunks: usize,
        seed: u64,
    ) -> Result<Self> {
        if num_vectors == 0 {
            return Err(RetrieveError::EmptyIndex);
        }
        if dim == 0 || num_chunks == 0 || num_chunks > dim {
            return Err(RetrieveError::InvalidParameter(format!(
                "PQ needs 1 <= num_chunks <= dim, got num_chunks={num_chunks}, dim={dim}"
            )));
        }
        if vectors.len() < num_vectors * dim {
            return Err(RetrieveError::InvalidParameter(format!(
                "PQ training expects {} floats, got {}",
                num_vectors * dim,
                vectors.len()
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let train_rows: Vec<usize> = if num_vectors > MAX_PQ_TRAINING_SET {
            let mut rows = sample(&mut rng, num_vectors, MAX_PQ_TRAINING_SET).into_vec();
            rows.sort_unstable();
            rows
        } else {
            (0..num_vectors).collect()
        };
        let n_train = train_rows.len();

        let mut centroid = vec![0.0f64; dim];
        for &r in &train_rows {
            for (c, &x) in centroid.iter_mut().zip(&vectors[r * dim..(r + 1) * dim]) {
                *c += x as f64;
            }
        }
        let centroid: Vec<f32> = centroid.iter().map(|&s| (s / n_train as f64) as f32).collect();

        let chunk_offsets = chunk_offsets(dim, num_chunks);
        let num_centroids = NUM_PQ_CENTROIDS.min(n_train);

        let per_chunk: Vec<Vec<f32>> = (0..num_chunks)
            .into_par_iter()
            .map(|c| -> Result<Vec<f32>> {
                let (lo, hi) = (chunk_offsets[c], chunk_offsets[c + 1]);
                let width = hi - lo;
                let mut sub = Vec::with_capacity(n_train * width);
                for &r in &train_rows {
                    let row = &vectors[r * dim..(r + 1) * dim];
                    sub.extend(row[lo..hi].iter().zip(&centroid[lo..hi]).map(|(x, m)| x - m));
                }
                let mut km = KMeans::new(width, num_centroids)?
                    .with_seed(seed.wrapping_add(c as u64))
                    .with_max_iterations(PQ_KMEANS_ITERATIONS);
                km.fit(&sub, n_train)?;
                let mut table = km.centroids().to_vec();
                // Duplicate points can leave fewer distinct clusters than requested.
                table.resize(num_centroids * width, 0.0);
                Ok(table)
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            dim,
            num_chunks,
            num_centroids,
            chunk_offsets,
            centroid,
            tables: per_chunk.concat(),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Bytes per code.
    pub fn code_len(&self) -> usize {
        self.num_chunks
    }

    pub fn num_centroids(&self) -> usize {
        self.num_centroids
    }

    #[inline]
    fn chunk_centroid(&self, chunk: usize, code: usize) -> &[f32] {
        let (lo, hi) = (self.chunk_offsets[chunk], self.chunk_offsets[chunk + 1]);
        let width = hi - lo;
        let base = self.num_centroids * lo + code * width;
        &self.tables[base..base + width]
    }

    /// Encode one vector into `out` (length `code_len()`).
    pub fn encode_into(&self, vector: &[f32], out: &mut [u8]) {
        let mut residual = Vec::with_capacity(self.dim / self.num_chunks + 1);
        for chunk in 0..self.num_chunks {
            let (lo, hi) = (self.chunk_offsets[chunk], self.chunk_offsets[chunk + 1]);
            residual.clear();
            residual.extend(vector[lo..hi].iter().zip(&self.centroid[lo..hi]).map(|(x, m)| x - m));

            let mut best = (0usize, f32::INFINITY);
            for code in 0..self.num_centroids {
                let d = simd::l2_distance_squared(&residual, self.chunk_centroid(chunk, code));
                if d < best.1 {
                    best = (code, d);
                }
            }
            out[chunk] = best.0 as u8;
        }
    }

    /// Encode one vector.
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut out = vec![0u8; self.num_chunks];
        self.encode_into(vector, &mut out);
        out
    }

    /// Encode `num_vectors` row-major vectors into one flat code buffer.
    pub fn encode_all(&self, vectors: &[f32], num_vectors: usize) -> Vec<u8> {
        let mut codes = vec![0u8; num_vectors * self.num_chunks];
        codes
            .par_chunks_mut(self.num_chunks)
            .enumerate()
            .for_each(|(i, out)| {
                self.encode_into(&vectors[i * self.dim..(i + 1) * self.dim], out);
            });
        codes
    }

    /// Reconstruct the approximate vector for a code.
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        let mut out = self.centroid.clone();
        for (chunk, &c) in code.iter().enumerate().take(self.num_chunks) {
            let lo = self.chunk_offsets[chunk];
            for (o, &x) in out[lo..].iter_mut().zip(self.chunk_centroid(chunk, c as usize)) {
                *o += x;
            }
        }
        out
    }

    /// Precompute per-subspace query-to-centroid distances.
    pub fn distance_table(&self, query: &[f32]) -> DistanceTable {
        let mut table = Vec::with_capacity(self.num_chunks * NUM_PQ_CENTROIDS);
        let mut residual = Vec::new();
        for chunk in 0..self.num_chunks {
            let (lo, hi) = (self.chunk_offsets[chunk], self.chunk_offsets[chunk + 1]);
            residual.clear();
            residual.extend(query[lo..hi].iter().zip(&self.centroid[lo..hi]).map(|(q, m)| q - m));
            for code in 0..self.num_centroids {
                table.push(simd::l2_distance_squared(&residual, self.chunk_centroid(chunk, code)));
            }
            // Pad so lookups can always index by a full byte.
            table.resize((chunk + 1) * NUM_PQ_CENTROIDS, f32::INFINITY);
        }
        DistanceTable {
            table,
            num_chunks: self.num_chunks,
        }
    }
}

/// Query-specific ADC lookup table.
#[derive(Debug, Clone)]
pub struct DistanceTable {
    table: Vec<f32>,
    num_chunks: usize,
}

impl DistanceTable {
    /// Approximate squared L2 distance between the query and a code.
    #[inline(always)]
    pub fn distance(&self, code: &[u8]) -> f32 {
        code.iter()
            .take(self.num_chunks)
            .enumerate()
            .map(|(chunk, &c)| self.table[chunk * NUM_PQ_CENTROIDS + c as usize])
            .sum()
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }
}

fn chunk_offsets(dim: usize, num_chunks: usize) -> Vec<usize> {
    let base = dim / num_chunks;
    let extra = dim % num_chunks;
    let mut offsets = Vec::with_capacity(num_chunks + 1);
    let mut at = 0;
    offsets.push(0);
    for c in 0..num_chunks {
        at += base + usize::from(c < extra);
        offsets.push(at);
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn random_data(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        use rand::Rng;
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.random_range(-1.0f32..1.0)).collect()
    }

    #[test]
    fn chunk_offsets_cover_dimension() {
        assert_eq!(chunk_offsets(10, 3), vec![0, 4, 7, 10]);
        assert_eq!(chunk_offsets(8, 8), vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn budget_clamps_to_dimension() {
        // 1 GB for 1000 rows of dim 16 would be ~1M bytes per row.
        let (len, clamped) = code_len_for_budget(1 << 30, 1000, 16);
        assert_eq!(len, 16);
        assert!(clamped);

        let (len, clamped) = code_len_for_budget(8_000, 1000, 16);
        assert_eq!(len, 8);
        assert!(!clamped);

        let (len, _) = code_len_for_budget(10, 1000, 16);
        assert_eq!(len, 1);
    }

    #[test]
    fn encode_picks_exact_centroid_for_training_points() {
        // Fewer points than centroids: every point becomes its own centroid.
        let data = random_data(20, 8, 1);
        let pq = PqCodebook::train(&data, 20, 8, 4, 9).unwrap();
        for row in data.chunks_exact(8) {
            let decoded = pq.decode(&pq.encode(row));
            assert!(simd::l2_distance_squared(row, &decoded) < 1e-6);
        }
    }

    #[test]
    fn table_distance_matches_decoded_distance() {
        let data = random_data(500, 12, 2);
        let pq = PqCodebook::train(&data, 500, 12, 5, 3).unwrap();
        let query = random_data(1, 12, 99);
        let table = pq.distance_table(&query);
        for row in data.chunks_exact(12).take(50) {
            let code = pq.encode(row);
            let via_table = table.distance(&code);
            let via_decode = simd::l2_distance_squared(&query, &pq.decode(&code));
            assert!((via_table - via_decode).abs() < 1e-3 * via_decode.max(1.0));
        }
    }

    #[test]
    fn adc_tracks_true_distance() {
        let n = 1500;
        let dim = 16;
        let data = random_data(n, dim, 4);
        let pq = PqCodebook::train(&data, n, dim, 8, 5).unwrap();
        let codes = pq.encode_all(&data, n);

        let query = random_data(1, dim, 77);
        let table = pq.distance_table(&query);
        let mut rel_err = 0.0f64;
        for (row, code) in data.chunks_exact(dim).zip(codes.chunks_exact(8)) {
            let exact = simd::l2_distance_squared(&query, row) as f64;
            let approx = table.distance(code) as f64;
            rel_err += (approx - exact).abs() / exact.max(1e-6);
        }
        let mean_rel_err = rel_err / n as f64;
        assert!(mean_rel_err < 0.25, "mean relative error {mean_rel_err}");
    }

    #[test]
    fn codebook_serde_roundtrip() {
        let data = random_data(100, 6, 8);
        let pq = PqCodebook::train(&data, 100, 6, 3, 8).unwrap();
        let bytes = postcard::to_stdvec(&pq).unwrap();
        let back: PqCodebook = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(pq, back);
    }

    #[test]
    fn train_rejects_bad_chunking() {
        let data = random_data(10, 4, 0);
        assert!(PqCodebook::train(&data, 10, 4, 5, 0).is_err());
        assert!(PqCodebook::train(&data, 10, 4, 0, 0).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_code_len_bounded_by_dim(budget in 0u64..(1u64 << 40), rows in 1usize..1_000_000, dim in 1usize..2048) {
            let (len, _) = code_len_for_budget(budget, rows, dim);
            prop_assert!(len >= 1);
            prop_assert!(len <= dim);
            prop_assert!((len as u128) * (rows as u128) <= (dim as u128) * (rows as u128));
        }
    }
}
