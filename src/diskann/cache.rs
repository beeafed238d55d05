//! Node cache for disk search.
//!
//! A fixed set of node records kept in memory so hot nodes near the entry
//! point cost no reads. Two ways to choose them:
//!
//! - **SampleQueries**: run a batch of queries made from random stored
//!   vectors, count how often each node is expanded and cache the most
//!   frequent ones. Suits top-k workloads that revisit the same hubs.
//! - **Bfs**: walk outward from the entry point, caching whole layers.
//!   Suits range search, whose frontier fans out widely.
//!
//! Each cached node costs its payload bytes plus `4 * (1 + degree)`; the
//! total never exceeds the budget.

use super::layout::NodeRecord;
use super::search::{DiskSearcher, SearchParams};
use crate::error::Result;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Records fetched per read batch while filling the cache.
const FILL_BATCH: usize = 64;
/// Upper bound on sample queries for frequency counting.
const MAX_SAMPLE_QUERIES: usize = 1_000;
const SAMPLE_K: usize = 10;
const SAMPLE_SEARCH_LIST: usize = 32;
/// Throwaway queries issued by warm-up.
const WARM_UP_QUERIES: usize = 100;

/// How cached nodes are chosen. Fixed for the life of a loaded index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStrategy {
    SampleQueries,
    Bfs,
}

impl CacheStrategy {
    pub fn from_config(use_bfs_cache: bool) -> Self {
        if use_bfs_cache {
            CacheStrategy::Bfs
        } else {
            CacheStrategy::SampleQueries
        }
    }
}

/// Read-only map from node id to its record.
#[derive(Debug, Default)]
pub struct CacheTable {
    nodes: HashMap<u32, NodeRecord>,
    bytes_used: usize,
    budget_bytes: u64,
}

impl CacheTable {
    pub fn empty(budget_bytes: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            bytes_used: 0,
            budget_bytes,
        }
    }

    /// Add `record` if it fits the remaining budget.
    fn try_insert(&mut self, id: u32, record: NodeRecord) -> bool {
        if self.nodes.contains_key(&id) {
            return true;
        }
        let cost = record.cache_bytes();
        if (self.bytes_used + cost) as u64 > self.budget_bytes {
            return false;
        }
        self.bytes_used += cost;
        self.nodes.insert(id, record);
        true
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<&NodeRecord> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.keys().copied()
    }
}

/// Chooses the cached node set for a searcher.
pub struct CacheSelector<'a> {
    searcher: &'a DiskSearcher,
    budget_bytes: u64,
    beamwidth: usize,
    seed: u64,
}

impl<'a> CacheSelector<'a> {
    pub fn new(searcher: &'a DiskSearcher, budget_bytes: u64, beamwidth: usize, seed: u64) -> Self {
        Self {
            searcher,
            budget_bytes,
            beamwidth: beamwidth.max(1),
            seed,
        }
    }

    pub fn select(&self, strategy: CacheStrategy) -> Result<CacheTable> {
        if self.budget_bytes == 0 || self.searcher.num_nodes() == 0 {
            return Ok(CacheTable::empty(self.budget_bytes));
        }
        let table = match strategy {
            CacheStrategy::Bfs => self.bfs()?,
            CacheStrategy::SampleQueries => self.sample_queries()?,
        };
        log::debug!(
            "cache ({strategy:?}): {} nodes, {} of {} bytes",
            table.len(),
            table.bytes_used(),
            table.budget_bytes()
        );
        Ok(table)
    }

    /// Layer-by-layer walk from the entry point until a record does not fit.
    fn bfs(&self) -> Result<CacheTable> {
        let layout = self.searcher.layout();
        let mut table = CacheTable::empty(self.budget_bytes);
        let mut seen: HashSet<u32> = HashSet::new();
        let entry = self.searcher.entry_point();
        seen.insert(entry);
        let mut layer = vec![entry];

        while !layer.is_empty() {
            let mut next = Vec::new();
            for chunk in layer.chunks(FILL_BATCH) {
                for (&id, record) in chunk.iter().zip(layout.read_nodes(chunk)?) {
                    for &nb in &record.neighbors {
                        if seen.insert(nb) {
                            next.push(nb);
                        }
                    }
                    if !table.try_insert(id, record) {
                        return Ok(table);
                    }
                }
            }
            layer = next;
        }
        Ok(table)
    }

    /// Cache the nodes most often expanded by a batch of sample queries.
    fn sample_queries(&self) -> Result<CacheTable> {
        let n = self.searcher.num_nodes();
        let queries = self.searcher.sample_queries(MAX_SAMPLE_QUERIES.min(n), self.seed)?;
        let mut params = SearchParams::new(SAMPLE_K.min(n), SAMPLE_SEARCH_LIST, self.beamwidth);
        params.collect_expanded = true;

        let per_query: Vec<Vec<u32>> = queries
            .par_iter()
            .map(|q| {
                self.searcher
                    .search_prepared(q, &params, None)
                    .map(|(_, stats)| stats.expanded)
            })
            .collect::<Result<_>>()?;

        let mut counts: HashMap<u32, u32> = HashMap::new();
        for id in per_query.into_iter().flatten() {
            *counts.entry(id).or_insert(0) += 1;
        }
        let mut ranked: Vec<(u32, u32)> = counts.into_iter().collect();
        ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let layout = self.searcher.layout();
        let mut table = CacheTable::empty(self.budget_bytes);
        let ids: Vec<u32> = ranked.into_iter().map(|(id, _)| id).collect();
        for chunk in ids.chunks(FILL_BATCH) {
            for (&id, record) in chunk.iter().zip(layout.read_nodes(chunk)?) {
                if !table.try_insert(id, record) {
                    return Ok(table);
                }
            }
        }
        Ok(table)
    }
}

/// Run a throwaway query batch to prime the OS page cache.
pub fn warm_up(searcher: &DiskSearcher, beamwidth: usize, seed: u64) -> Result<usize> {
    let n = searcher.num_nodes();
    let queries = searcher.sample_queries(WARM_UP_QUERIES.min(n), seed)?;
    let params = SearchParams::new(SAMPLE_K.min(n).max(1), SAMPLE_SEARCH_LIST, beamwidth);
    queries
        .par_iter()
        .try_for_each(|q| searcher.search_prepared(q, &params, None).map(|_| ()))?;
    log::debug!("warm-up issued {} queries", queries.len());
    Ok(queries.len())
}
