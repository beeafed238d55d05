//! Distance metrics and the build-space transform.
//!
//! Graph construction, pruning and PQ all work on squared L2 distance in a
//! *build space* derived from the user metric:
//!
//! - `L2`: vectors are used as-is.
//! - `COSINE`: vectors (and queries) are L2-normalized, so
//!   `‖q - x‖² = 2 - 2 cos(q, x)`.
//! - `IP`: base vectors get one extra coordinate `sqrt(M² - ‖x‖²)` where `M` is
//!   the largest base norm; queries get `0`. Then
//!   `‖q' - x'‖² = ‖q‖² + M² - 2⟨q, x⟩`, which ranks exactly like `-⟨q, x⟩`.
//!
//! [`BuildSpace::to_metric`] maps a build-space distance back to the distance
//! reported to callers, so ranking never needs the user metric directly.

use crate::error::{Result, RetrieveError};
use crate::simd;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance metric for dense vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DistanceMetric {
    /// Squared Euclidean distance.
    #[default]
    #[serde(rename = "L2")]
    L2,
    /// Inner product, reported as `-⟨a, b⟩` so smaller is better.
    #[serde(rename = "IP")]
    InnerProduct,
    /// Cosine distance `1 - cos(a, b)`.
    #[serde(rename = "COSINE")]
    Cosine,
}

impl DistanceMetric {
    /// Compute the reported distance between two raw vectors.
    ///
    /// If dimensions mismatch, this returns `f32::INFINITY` (so it is never selected as a
    /// nearest neighbor).
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        match self {
            DistanceMetric::L2 => simd::l2_distance_squared(a, b),
            DistanceMetric::InnerProduct => -simd::dot(a, b),
            DistanceMetric::Cosine => cosine_distance(a, b),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceMetric::L2 => "L2",
            DistanceMetric::InnerProduct => "IP",
            DistanceMetric::Cosine => "COSINE",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            DistanceMetric::L2 => 0,
            DistanceMetric::InnerProduct => 1,
            DistanceMetric::Cosine => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DistanceMetric::L2),
            1 => Some(DistanceMetric::InnerProduct),
            2 => Some(DistanceMetric::Cosine),
            _ => None,
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = RetrieveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "L2" => Ok(DistanceMetric::L2),
            "IP" => Ok(DistanceMetric::InnerProduct),
            "COSINE" => Ok(DistanceMetric::Cosine),
            other => Err(RetrieveError::config(
                "metric_type",
                format!("unsupported metric {other:?}, expected one of L2, IP, COSINE"),
            )),
        }
    }
}

/// Cosine distance `1 - cos(a,b)`; computes norms, so inputs need not be normalized.
#[inline]
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let na = simd::norm(a);
    let nb = simd::norm(b);
    if na < 1e-10 || nb < 1e-10 {
        return 1.0;
    }
    1.0 - (simd::dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

/// Normalize a vector to unit L2 norm.
#[inline]
#[must_use]
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let n = simd::norm(v);
    if n < 1e-10 {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / n).collect()
}

/// Mapping between user vectors and the squared-L2 build space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuildSpace {
    metric: DistanceMetric,
    dim: usize,
    /// Largest base-vector norm; only meaningful for `InnerProduct`.
    max_norm: f32,
}

/// A query already transformed into build space.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub vector: Vec<f32>,
    /// Squared norm of the raw query, needed to recover inner products.
    pub raw_norm_sq: f32,
}

impl BuildSpace {
    /// Fit the transform to a flat row-major dataset.
    pub fn fit(metric: DistanceMetric, data: &[f32], dim: usize) -> Self {
        let max_norm = match metric {
            DistanceMetric::InnerProduct => data
                .chunks_exact(dim)
                .map(simd::norm)
                .fold(0.0f32, f32::max),
            _ => 0.0,
        };
        Self {
            metric,
            dim,
            max_norm,
        }
    }

    pub(crate) fn from_parts(metric: DistanceMetric, dim: usize, max_norm: f32) -> Self {
        Self {
            metric,
            dim,
            max_norm,
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Dimension of user vectors.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn max_norm(&self) -> f32 {
        self.max_norm
    }

    /// Dimension of vectors as stored on disk and used by the graph.
    pub fn stored_dim(&self) -> usize {
        match self.metric {
            DistanceMetric::InnerProduct => self.dim + 1,
            _ => self.dim,
        }
    }

    /// Append the build-space image of a base vector to `out`.
    pub fn push_base(&self, v: &[f32], out: &mut Vec<f32>) {
        match self.metric {
            DistanceMetric::L2 => out.extend_from_slice(v),
            DistanceMetric::Cosine => out.extend(normalize(v)),
            DistanceMetric::InnerProduct => {
                out.extend_from_slice(v);
                let slack = self.max_norm * self.max_norm - simd::dot(v, v);
                out.push(slack.max(0.0).sqrt());
            }
        }
    }

    /// Transform a whole row-major dataset.
    pub fn transform_base(&self, data: &[f32]) -> Vec<f32> {
        let rows = data.len() / self.dim.max(1);
        let mut out = Vec::with_capacity(rows * self.stored_dim());
        for v in data.chunks_exact(self.dim) {
            self.push_base(v, &mut out);
        }
        out
    }

    pub fn prepare_query(&self, query: &[f32]) -> Result<PreparedQuery> {
        if query.len() != self.dim {
            return Err(RetrieveError::DimensionMismatch {
                query_dim: query.len(),
                doc_dim: self.dim,
            });
        }
        let raw_norm_sq = simd::dot(query, query);
        let vector = match self.metric {
            DistanceMetric::L2 => query.to_vec(),
            DistanceMetric::Cosine => normalize(query),
            DistanceMetric::InnerProduct => {
                let mut v = Vec::with_capacity(self.dim + 1);
                v.extend_from_slice(query);
                v.push(0.0);
                v
            }
        };
        Ok(PreparedQuery {
            vector,
            raw_norm_sq,
        })
    }

    /// Map a squared-L2 build-space distance to the reported metric distance.
    #[inline]
    pub fn to_metric(&self, query: &PreparedQuery, build_dist: f32) -> f32 {
        match self.metric {
            DistanceMetric::L2 => build_dist,
            DistanceMetric::Cosine => build_dist * 0.5,
            DistanceMetric::InnerProduct => {
                let ip =
                    (query.raw_norm_sq + self.max_norm * self.max_norm - build_dist) * 0.5;
                -ip
            }
        }
    }

    /// Recover the user vector from its stored form.
    pub fn restore_base<'a>(&self, stored: &'a [f32]) -> &'a [f32] {
        &stored[..self.dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_distance_is_zero_for_identical() {
        let a = [1.0_f32, 2.0, 3.0];
        assert!(cosine_distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn metric_parses_case_insensitively() {
        assert_eq!("l2".parse::<DistanceMetric>().unwrap(), DistanceMetric::L2);
        assert_eq!("IP".parse::<DistanceMetric>().unwrap(), DistanceMetric::InnerProduct);
        assert_eq!("Cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert!("HAMMING".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn metric_serde_uses_wire_names() {
        let json = serde_json::to_string(&DistanceMetric::InnerProduct).unwrap();
        assert_eq!(json, "\"IP\"");
        let back: DistanceMetric = serde_json::from_str("\"COSINE\"").unwrap();
        assert_eq!(back, DistanceMetric::Cosine);
    }

    #[test]
    fn inner_product_build_space_recovers_ip() {
        let data = vec![1.0f32, 0.0, 0.5, 0.5, -2.0, 1.0];
        let space = BuildSpace::fit(DistanceMetric::InnerProduct, &data, 2);
        assert_eq!(space.stored_dim(), 3);
        let stored = space.transform_base(&data);

        let q = space.prepare_query(&[0.3, -0.7]).unwrap();
        for (raw, st) in data.chunks_exact(2).zip(stored.chunks_exact(3)) {
            let d = simd::l2_distance_squared(&q.vector, st);
            let expected = DistanceMetric::InnerProduct.distance(&[0.3, -0.7], raw);
            assert!((space.to_metric(&q, d) - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn cosine_build_space_recovers_cosine() {
        let data = vec![3.0f32, 4.0, -1.0, 2.0];
        let space = BuildSpace::fit(DistanceMetric::Cosine, &data, 2);
        let stored = space.transform_base(&data);
        let q = space.prepare_query(&[1.0, 1.0]).unwrap();
        for (raw, st) in data.chunks_exact(2).zip(stored.chunks_exact(2)) {
            let d = simd::l2_distance_squared(&q.vector, st);
            let expected = cosine_distance(&[1.0, 1.0], raw);
            assert!((space.to_metric(&q, d) - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn prepare_query_rejects_wrong_width() {
        let space = BuildSpace::fit(DistanceMetric::L2, &[0.0; 8], 4);
        let err = space.prepare_query(&[1.0; 3]).unwrap_err();
        assert!(matches!(err, RetrieveError::DimensionMismatch { query_dim: 3, doc_dim: 4 }));
    }
}
