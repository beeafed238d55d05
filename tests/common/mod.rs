//! Shared helpers for integration tests.

#![allow(dead_code)]

use ssdann::{BuildReport, Dataset, DiskAnnConfig, DiskAnnIndex, DistanceMetric, Neighbor};
use std::collections::HashSet;
use std::path::Path;

/// Generate random vectors in `[-1, 1)`, flat row-major.
pub fn generate_vectors(n: usize, d: usize, seed: u64) -> Vec<f32> {
    let mut state = seed;
    (0..n * d)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((state >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0
        })
        .collect()
}

/// Bytes expressed in the config's GB unit.
pub fn gb(bytes: u64) -> f32 {
    bytes as f32 / (1u64 << 30) as f32
}

/// Small, well-connected build for tests.
pub fn test_config() -> DiskAnnConfig {
    DiskAnnConfig {
        max_degree: 32,
        search_list_size: None,
        pq_code_budget_gb: Some(1.0),
        build_dram_budget_gb: Some(1.0),
        ..Default::default()
    }
}

pub fn build_index(
    dir: &Path,
    data: &[f32],
    dim: usize,
    config: &DiskAnnConfig,
) -> (DiskAnnIndex, BuildReport) {
    let dataset = Dataset::new(data.to_vec(), dim).expect("valid dataset");
    let mut index = DiskAnnIndex::new(dir);
    let report = index.build(&dataset, config).expect("build succeeds");
    (index, report)
}

/// Brute force k-NN for ground truth, in the metric's reported distance.
pub fn brute_force_knn(
    data: &[f32],
    dim: usize,
    query: &[f32],
    k: usize,
    metric: DistanceMetric,
) -> Vec<(u32, f32)> {
    let mut dists: Vec<(u32, f32)> = data
        .chunks_exact(dim)
        .enumerate()
        .map(|(i, v)| (i as u32, metric.distance(query, v)))
        .collect();
    dists.sort_by(|a, b| a.1.total_cmp(&b.1));
    dists.truncate(k);
    dists
}

/// Compute recall@k
pub fn compute_recall(results: &[Neighbor], ground_truth: &[(u32, f32)], k: usize) -> f64 {
    let gt_ids: HashSet<u32> = ground_truth.iter().take(k).map(|(id, _)| *id).collect();
    let found = results.iter().take(k).filter(|r| gt_ids.contains(&r.id)).count();
    found as f64 / k as f64
}

pub fn assert_sorted(results: &[Neighbor]) {
    for w in results.windows(2) {
        assert!(
            w[0].distance <= w[1].distance,
            "results out of order: {:?}",
            w
        );
    }
}
