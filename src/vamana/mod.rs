//! Vamana graph construction.
//!
//! Vamana (from DiskANN) builds a navigable proximity graph with:
//! - greedy search from the medoid to collect candidate neighbors,
//! - occlusion (alpha) pruning to keep at most `max_degree` diverse edges,
//! - reverse-edge insertion with re-pruning of over-full lists,
//! - two passes (alpha 1.0, then alpha 1.2) unless the build is accelerated.
//!
//! When the dataset plus working graph does not fit the memory budget, the
//! build goes through [`partition`]: overlapping shards are built
//! independently and merged by re-pruning each node's edge union.
//!
//! # References
//!
//! - Subramanya et al. (2019): "DiskANN: Fast Accurate Billion-point Nearest
//!   Neighbor Search on a Single Node"

mod build;
pub mod partition;
pub mod prune;
pub mod search;

pub use build::build_in_memory;
pub use partition::{plan_shards, ShardPlan};
pub use prune::{robust_prune, DEFAULT_ALPHA};
pub use search::{greedy_search, Neighbor, NeighborQueue};

use crate::error::{Result, RetrieveError};
use crate::simd;
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Borrowed row-major vectors.
#[derive(Clone, Copy, Debug)]
pub struct VectorSlice<'a> {
    data: &'a [f32],
    dim: usize,
}

impl<'a> VectorSlice<'a> {
    pub fn new(data: &'a [f32], dim: usize) -> Self {
        Self { data, dim }
    }

    #[inline]
    pub fn get(&self, id: u32) -> &'a [f32] {
        let start = id as usize * self.dim;
        &self.data[start..start + self.dim]
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn as_flat(&self) -> &'a [f32] {
        self.data
    }

    #[inline]
    pub fn distance(&self, a: u32, b: u32) -> f32 {
        simd::l2_distance_squared(self.get(a), self.get(b))
    }

    #[inline]
    pub fn distance_to(&self, query: &[f32], id: u32) -> f32 {
        simd::l2_distance_squared(query, self.get(id))
    }
}

/// Configuration for Vamana graph construction.
#[derive(Clone, Debug, PartialEq)]
pub struct VamanaConfig {
    /// Maximum degree (R) - neighbors per node
    pub max_degree: usize,
    /// Build search list size (L)
    pub search_list_size: usize,
    /// Alpha of the final pass
    pub alpha: f32,
    /// Skip the alpha = 1.0 pass
    pub accelerate: bool,
    /// Seed for visit order and shard assignment
    pub seed: u64,
}

impl Default for VamanaConfig {
    fn default() -> Self {
        Self {
            max_degree: 48,
            search_list_size: 128,
            alpha: DEFAULT_ALPHA,
            accelerate: false,
            seed: 0x5eed_d15c,
        }
    }
}

impl VamanaConfig {
    /// Alpha per construction pass.
    pub fn pass_alphas(&self) -> Vec<f32> {
        if self.accelerate {
            vec![self.alpha]
        } else {
            vec![1.0, self.alpha]
        }
    }
}

/// Built graph: adjacency lists plus the entry point.
#[derive(Clone, Debug)]
pub struct VamanaGraph {
    pub adjacency: Vec<Vec<u32>>,
    pub medoid: u32,
}

impl VamanaGraph {
    pub fn num_nodes(&self) -> usize {
        self.adjacency.len()
    }

    pub fn max_observed_degree(&self) -> usize {
        self.adjacency.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn average_degree(&self) -> f32 {
        if self.adjacency.is_empty() {
            return 0.0;
        }
        let total: usize = self.adjacency.iter().map(Vec::len).sum();
        total as f32 / self.adjacency.len() as f32
    }

    /// Check degree bound, id range, self-loops and duplicates.
    pub fn validate(&self, max_degree: usize) -> Result<()> {
        let n = self.adjacency.len() as u32;
        for (node, nbrs) in self.adjacency.iter().enumerate() {
            if nbrs.len() > max_degree {
                return Err(RetrieveError::InvalidParameter(format!(
                    "node {node} has degree {} > max_degree {max_degree}",
                    nbrs.len()
                )));
            }
            let mut seen = nbrs.clone();
            seen.sort_unstable();
            seen.dedup();
            if seen.len() != nbrs.len() {
                return Err(RetrieveError::InvalidParameter(format!(
                    "node {node} has duplicate neighbors"
                )));
            }
            if nbrs.iter().any(|&v| v == node as u32 || v >= n) {
                return Err(RetrieveError::InvalidParameter(format!(
                    "node {node} has a self-loop or out-of-range neighbor"
                )));
            }
        }
        Ok(())
    }
}

/// Summary of a graph build.
#[derive(Clone, Debug)]
pub struct GraphBuildStats {
    pub num_shards: usize,
    pub passes: usize,
    pub medoid: u32,
    pub average_degree: f32,
    pub max_degree: usize,
    pub elapsed: Duration,
}

/// Vamana graph builder with a memory budget.
pub struct GraphBuilder {
    config: VamanaConfig,
    dram_budget_bytes: u64,
}

impl GraphBuilder {
    pub fn new(config: VamanaConfig, dram_budget_bytes: u64) -> Self {
        Self {
            config,
            dram_budget_bytes,
        }
    }

    pub fn config(&self) -> &VamanaConfig {
        &self.config
    }

    /// Build over `vectors`, partitioning when one shard would exceed the budget.
    pub fn build(&self, vectors: VectorSlice<'_>) -> Result<(VamanaGraph, GraphBuildStats)> {
        if vectors.is_empty() {
            return Err(RetrieveError::EmptyIndex);
        }
        let start = Instant::now();
        let plan = plan_shards(vectors, &self.config, self.dram_budget_bytes)?;

        let graph = if plan.num_shards() <= 1 {
            log::info!(
                "building single-shard vamana graph: {} nodes, R={}, L={}",
                vectors.len(),
                self.config.max_degree,
                self.config.search_list_size
            );
            build_in_memory(vectors, &self.config)?
        } else {
            log::info!(
                "building partitioned vamana graph: {} nodes over {} shards",
                vectors.len(),
                plan.num_shards()
            );
            partition::build_partitioned(vectors, &self.config, &plan, self.dram_budget_bytes)?
        };

        let stats = GraphBuildStats {
            num_shards: plan.num_shards().max(1),
            passes: self.config.pass_alphas().len(),
            medoid: graph.medoid,
            average_degree: graph.average_degree(),
            max_degree: graph.max_observed_degree(),
            elapsed: start.elapsed(),
        };
        log::info!(
            "vamana graph ready: medoid={}, avg degree {:.1}, max degree {}, {:?}",
            stats.medoid,
            stats.average_degree,
            stats.max_degree,
            stats.elapsed
        );
        Ok((graph, stats))
    }
}

/// Node closest to the dataset mean.
pub fn find_medoid(vectors: VectorSlice<'_>) -> u32 {
    let n = vectors.len();
    let dim = vectors.dim();
    let mut mean = vec![0.0f64; dim];
    for i in 0..n {
        for (m, &x) in mean.iter_mut().zip(vectors.get(i as u32)) {
            *m += x as f64;
        }
    }
    let mean: Vec<f32> = mean.iter().map(|&s| (s / n as f64) as f32).collect();

    (0..n as u32)
        .into_par_iter()
        .map(|i| (i, vectors.distance_to(&mean, i)))
        .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        .map_or(0, |(i, _)| i)
}
