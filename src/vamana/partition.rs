//! Budget-aware divide-and-conquer build.
//!
//! When the vectors plus working graph exceed the DRAM budget, the dataset
//! is split into overlapping shards. Shard centroids come from k-means on a
//! sample; every vector joins its two closest shards that still have room.
//! Each shard is built independently (groups of shards in parallel, as many
//! as the budget holds at once) and the shard graphs are merged by taking
//! each node's edge union and re-pruning it down to `max_degree`.

use super::build::build_in_memory;
use super::prune::robust_prune;
use super::{find_medoid, VamanaConfig, VamanaGraph, VectorSlice};
use crate::error::{Result, RetrieveError};
use crate::partitioning::KMeans;
use rand::rngs::StdRng;
use rand::seq::{index::sample, SliceRandom};
use rand::SeedableRng;
use rayon::prelude::*;

/// Upper bound on the number of shards.
pub const MAX_SHARDS: usize = 512;
/// Shards each vector is assigned to.
pub const SHARD_OVERLAP: usize = 2;
/// Smallest shard worth building.
pub const MIN_SHARD_ROWS_FLOOR: usize = 64;

/// Headroom on adjacency lists while a pass is in flight.
const DEGREE_SLACK: f64 = 1.3;
/// Per-node bookkeeping (list headers, visit order, queue entries).
const NODE_OVERHEAD_BYTES: u64 = 32;
/// Target fill of a shard relative to its hard row cap.
const SHARD_FILL: f64 = 0.9;
/// Centroids tried per vector before falling back to a full ranking.
const PRECOMPUTED_CHOICES: usize = 8;
const KMEANS_ITERATIONS: usize = 10;
const MIN_KMEANS_SAMPLE: usize = 10_000;
const SAMPLE_PER_SHARD: usize = 64;

/// Estimated resident bytes per node during construction.
pub fn bytes_per_node(dim: usize, max_degree: usize) -> u64 {
    let vector = dim as u64 * 4;
    let edges = (max_degree as f64 * 4.0 * DEGREE_SLACK).ceil() as u64;
    vector + edges + NODE_OVERHEAD_BYTES
}

/// Smallest shard that can still hold a full neighbor list per node.
pub fn min_shard_rows(max_degree: usize) -> usize {
    MIN_SHARD_ROWS_FLOOR.max(max_degree + 1)
}

/// Assignment of global ids to shards.
#[derive(Clone, Debug)]
pub struct ShardPlan {
    max_rows_per_shard: usize,
    bytes_per_node: u64,
    shards: Vec<Vec<u32>>,
}

impl ShardPlan {
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn is_single(&self) -> bool {
        self.shards.len() <= 1
    }

    /// Sorted member ids of every shard.
    pub fn shards(&self) -> &[Vec<u32>] {
        &self.shards
    }

    pub fn max_rows_per_shard(&self) -> usize {
        self.max_rows_per_shard
    }

    pub fn bytes_per_node(&self) -> u64 {
        self.bytes_per_node
    }

    fn largest_shard(&self) -> usize {
        self.shards.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Decide how many shards the build needs and who belongs to each.
pub fn plan_shards(
    vectors: VectorSlice<'_>,
    config: &VamanaConfig,
    budget_bytes: u64,
) -> Result<ShardPlan> {
    let n = vectors.len();
    let bpn = bytes_per_node(vectors.dim(), config.max_degree);
    let max_rows = usize::try_from(budget_bytes / bpn).unwrap_or(usize::MAX);
    let min_rows = min_shard_rows(config.max_degree);

    if max_rows >= n {
        return Ok(ShardPlan {
            max_rows_per_shard: max_rows,
            bytes_per_node: bpn,
            shards: vec![(0..n as u32).collect()],
        });
    }
    if max_rows < min_rows {
        return Err(RetrieveError::BudgetExceeded {
            required_bytes: min_rows as u64 * bpn,
            budget_bytes,
        });
    }

    let target_rows = (max_rows as f64 * SHARD_FILL).max(1.0);
    let mut num_shards = ((SHARD_OVERLAP * n) as f64 / target_rows).ceil() as usize;
    num_shards = num_shards.max(2);

    loop {
        if num_shards > MAX_SHARDS {
            let rows = ((SHARD_OVERLAP * n) as f64 / MAX_SHARDS as f64 / SHARD_FILL).ceil();
            return Err(RetrieveError::BudgetExceeded {
                required_bytes: rows as u64 * bpn,
                budget_bytes,
            });
        }
        if let Some(shards) = assign_shards(vectors, num_shards, max_rows, config.seed)? {
            log::info!(
                "partitioned build: {} shards, at most {} rows each ({} bytes/node)",
                shards.len(),
                max_rows,
                bpn
            );
            return Ok(ShardPlan {
                max_rows_per_shard: max_rows,
                bytes_per_node: bpn,
                shards,
            });
        }
        num_shards += num_shards / 8 + 1;
        log::debug!("shard assignment overflowed, retrying with {num_shards} shards");
    }
}

/// Capacity-constrained overlapping assignment. `None` when some vector
/// finds no shard with room.
fn assign_shards(
    vectors: VectorSlice<'_>,
    num_shards: usize,
    capacity: usize,
    seed: u64,
) -> Result<Option<Vec<Vec<u32>>>> {
    let n = vectors.len();
    let dim = vectors.dim();
    let mut rng = StdRng::seed_from_u64(seed);

    let sample_size = n.min(MIN_KMEANS_SAMPLE.max(num_shards * SAMPLE_PER_SHARD));
    let mut training = Vec::with_capacity(sample_size * dim);
    for i in sample(&mut rng, n, sample_size).iter() {
        training.extend_from_slice(vectors.get(i as u32));
    }
    let mut kmeans = KMeans::new(dim, num_shards)?
        .with_seed(seed)
        .with_max_iterations(KMEANS_ITERATIONS);
    kmeans.fit(&training, sample_size)?;
    let k = kmeans.k();

    let choices = PRECOMPUTED_CHOICES.min(k);
    let ranked: Vec<Vec<usize>> = (0..n as u32)
        .into_par_iter()
        .map(|i| kmeans.nearest_n(vectors.get(i), choices))
        .collect();

    let mut order: Vec<u32> = (0..n as u32).collect();
    order.shuffle(&mut rng);

    let mut shards: Vec<Vec<u32>> = vec![Vec::new(); k];
    for id in order {
        let mut placed = place(&mut shards, &ranked[id as usize], id, capacity);
        if placed == 0 && choices < k {
            placed = place(&mut shards, &kmeans.nearest_n(vectors.get(id), k), id, capacity);
        }
        if placed == 0 {
            return Ok(None);
        }
    }

    shards.retain(|s| !s.is_empty());
    for s in &mut shards {
        s.sort_unstable();
    }
    Ok(Some(shards))
}

/// Push `id` into the first shards of `ranked` with room. `ranked` holds
/// distinct centroids and each id is placed once, so no shard sees it twice.
fn place(shards: &mut [Vec<u32>], ranked: &[usize], id: u32, capacity: usize) -> usize {
    let mut placed = 0;
    for &c in ranked {
        if shards[c].len() < capacity {
            shards[c].push(id);
            placed += 1;
            if placed == SHARD_OVERLAP {
                break;
            }
        }
    }
    placed
}

/// Build every shard of `plan` and merge the results.
pub fn build_partitioned(
    vectors: VectorSlice<'_>,
    config: &VamanaConfig,
    plan: &ShardPlan,
    budget_bytes: u64,
) -> Result<VamanaGraph> {
    let n = vectors.len();
    let dim = vectors.dim();
    let shard_bytes = (plan.largest_shard() as u64 * plan.bytes_per_node()).max(1);
    let group_size = usize::try_from(budget_bytes / shard_bytes)
        .unwrap_or(usize::MAX)
        .max(1);

    let mut union: Vec<Vec<u32>> = vec![Vec::new(); n];
    let indexed: Vec<(usize, &Vec<u32>)> = plan.shards().iter().enumerate().collect();

    for group in indexed.chunks(group_size) {
        let built: Vec<(usize, VamanaGraph)> = group
            .par_iter()
            .map(|&(shard, members)| {
                let mut local = Vec::with_capacity(members.len() * dim);
                for &id in members.iter() {
                    local.extend_from_slice(vectors.get(id));
                }
                let shard_config = VamanaConfig {
                    seed: config.seed.wrapping_add(shard as u64 + 1),
                    ..config.clone()
                };
                let graph = build_in_memory(VectorSlice::new(&local, dim), &shard_config)?;
                log::debug!(
                    "shard {shard}: {} nodes, avg degree {:.1}",
                    members.len(),
                    graph.average_degree()
                );
                Ok((shard, graph))
            })
            .collect::<Result<_>>()?;

        for (shard, graph) in built {
            let members = &plan.shards()[shard];
            for (local, nbrs) in graph.adjacency.iter().enumerate() {
                let global = members[local] as usize;
                union[global].extend(nbrs.iter().map(|&l| members[l as usize]));
            }
        }
    }

    let dist = |a: u32, b: u32| vectors.distance(a, b);
    let adjacency: Vec<Vec<u32>> = union
        .into_par_iter()
        .enumerate()
        .map(|(node, mut candidates)| {
            let node = node as u32;
            candidates.retain(|&c| c != node);
            candidates.sort_unstable();
            candidates.dedup();
            if candidates.len() <= config.max_degree {
                return candidates;
            }
            let mut pool: Vec<(u32, f32)> = candidates
                .into_iter()
                .map(|c| (c, vectors.distance(node, c)))
                .collect();
            robust_prune(node, &mut pool, config.alpha, config.max_degree, &dist)
        })
        .collect();

    Ok(VamanaGraph {
        adjacency,
        medoid: find_medoid(vectors),
    })
}
