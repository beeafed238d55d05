//! In-memory Vamana construction.
//!
//! Each pass visits every node in a seeded random order. Nodes are inserted
//! in batches that grow geometrically (1, 2, 4, ... capped at 2% of the
//! dataset): a batch runs greedy search and pruning in parallel against the
//! graph as it stood before the batch, then edges and reverse edges are
//! applied sequentially. Results depend only on the seed.

use super::prune::robust_prune;
use super::search::greedy_search;
use super::{find_medoid, VamanaConfig, VamanaGraph, VectorSlice};
use crate::error::{Result, RetrieveError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashMap;

/// Fraction of the dataset a single insertion batch may cover.
const MAX_BATCH_FRACTION: f64 = 0.02;

/// Build a graph over all of `vectors` in one shard.
pub fn build_in_memory(vectors: VectorSlice<'_>, config: &VamanaConfig) -> Result<VamanaGraph> {
    let n = vectors.len();
    if n == 0 {
        return Err(RetrieveError::EmptyIndex);
    }
    if config.max_degree == 0 {
        return Err(RetrieveError::config("max_degree", "must be greater than 0"));
    }
    if n > u32::MAX as usize {
        return Err(RetrieveError::InvalidParameter(format!(
            "{n} vectors exceed the u32 id space"
        )));
    }

    let medoid = find_medoid(vectors);
    let mut adjacency: Vec<Vec<u32>> = vec![Vec::new(); n];
    if n == 1 {
        return Ok(VamanaGraph { adjacency, medoid });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let search_list_size = config.search_list_size.max(config.max_degree);

    for (pass, alpha) in config.pass_alphas().into_iter().enumerate() {
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.shuffle(&mut rng);
        run_pass(
            vectors,
            &mut adjacency,
            medoid,
            &order,
            alpha,
            config.max_degree,
            search_list_size,
        );
        log::debug!("vamana pass {} (alpha {alpha}) done over {n} nodes", pass + 1);
    }

    Ok(VamanaGraph { adjacency, medoid })
}

fn run_pass(
    vectors: VectorSlice<'_>,
    adjacency: &mut [Vec<u32>],
    medoid: u32,
    order: &[u32],
    alpha: f32,
    max_degree: usize,
    search_list_size: usize,
) {
    let max_batch = ((order.len() as f64 * MAX_BATCH_FRACTION).ceil() as usize).max(1);
    let mut start = 0;
    let mut batch = 1;
    while start < order.len() {
        let end = (start + batch).min(order.len());
        insert_batch(
            vectors,
            adjacency,
            medoid,
            &order[start..end],
            alpha,
            max_degree,
            search_list_size,
        );
        start = end;
        batch = (batch * 2).min(max_batch);
    }
}

fn insert_batch(
    vectors: VectorSlice<'_>,
    adjacency: &mut [Vec<u32>],
    medoid: u32,
    nodes: &[u32],
    alpha: f32,
    max_degree: usize,
    search_list_size: usize,
) {
    let dist = |a: u32, b: u32| vectors.distance(a, b);

    let updates: Vec<(u32, Vec<u32>)> = {
        let snapshot: &[Vec<u32>] = adjacency;
        nodes
            .par_iter()
            .map(|&node| {
                let found = greedy_search(
                    vectors.get(node),
                    medoid,
                    vectors,
                    |id| snapshot[id as usize].as_slice(),
                    search_list_size,
                );
                let mut pool = found.expanded;
                pool.extend(
                    snapshot[node as usize]
                        .iter()
                        .map(|&nb| (nb, vectors.distance(node, nb))),
                );
                (node, robust_prune(node, &mut pool, alpha, max_degree, &dist))
            })
            .collect()
    };

    let mut incoming: HashMap<u32, Vec<u32>> = HashMap::new();
    for (node, list) in updates {
        for &nb in &list {
            incoming.entry(nb).or_default().push(node);
        }
        adjacency[node as usize] = list;
    }

    let reverse: Vec<(u32, Vec<u32>)> = {
        let snapshot: &[Vec<u32>] = adjacency;
        incoming
            .into_par_iter()
            .filter_map(|(target, sources)| {
                let current = &snapshot[target as usize];
                let mut merged = current.clone();
                for s in sources {
                    if s != target && !merged.contains(&s) {
                        merged.push(s);
                    }
                }
                if merged.len() == current.len() {
                    return None;
                }
                if merged.len() > max_degree {
                    let mut pool: Vec<(u32, f32)> = merged
                        .iter()
                        .map(|&id| (id, vectors.distance(target, id)))
                        .collect();
                    merged = robust_prune(target, &mut pool, alpha, max_degree, &dist);
                }
                Some((target, merged))
            })
            .collect()
    };

    for (target, list) in reverse {
        adjacency[target as usize] = list;
    }
}
