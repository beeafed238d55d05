//! Beam search over the on-disk layout.
//!
//! Per query:
//! 1. The candidate list is seeded with the entry point, scored by PQ.
//! 2. Each round takes up to `beamwidth` closest unexpanded candidates.
//!    Cached nodes are served from memory; the rest go out as one batch of
//!    concurrent aligned reads that is joined before the round continues.
//! 3. Every fetched node contributes its exact distance to the result list
//!    (unless filtered out), and its unvisited neighbors enter the candidate
//!    list with PQ distances.
//! 4. When no unexpanded candidate remains (or a round/deadline bound hits),
//!    the best `k` results by exact distance are returned.
//!
//! When a filter excludes most of the dataset, graph search wastes reads on
//! nodes that can never be returned, so the searcher switches to PQ + refine:
//! every allowed id is ranked by PQ distance and only the survivors are read.

use super::cache::CacheTable;
use super::layout::{DiskLayoutReader, NodeRecord, RecordPayload};
use crate::distance::{BuildSpace, PreparedQuery};
use crate::error::{Result, RetrieveError};
use crate::filtering::{Bitset, FilterStrategy, FilterStrategySelector};
use crate::quantization::{DistanceTable, PqCodebook};
use crate::simd;
use crate::vamana::{Neighbor, NeighborQueue};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Per-call search bounds.
#[derive(Clone, Debug)]
pub struct SearchParams {
    pub k: usize,
    pub search_list_size: usize,
    pub beamwidth: usize,
    /// Excluded fraction at which filtered search switches to PQ + refine;
    /// negative selects the dynamic threshold.
    pub filter_threshold: f32,
    /// Stop after this many I/O rounds.
    pub max_rounds: Option<usize>,
    /// Stop once this instant has passed. Checked between rounds.
    pub deadline: Option<Instant>,
    /// Record expanded node ids in [`QueryStats::expanded`].
    pub collect_expanded: bool,
}

impl SearchParams {
    pub fn new(k: usize, search_list_size: usize, beamwidth: usize) -> Self {
        Self {
            k,
            search_list_size: search_list_size.max(k),
            beamwidth: beamwidth.max(1),
            filter_threshold: -1.0,
            max_rounds: None,
            deadline: None,
            collect_expanded: false,
        }
    }

    #[must_use]
    pub fn with_filter_threshold(mut self, threshold: f32) -> Self {
        self.filter_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn out_of_budget(&self, rounds: usize) -> bool {
        self.max_rounds.is_some_and(|max| rounds >= max)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Counters for one query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryStats {
    pub rounds: usize,
    pub disk_reads: usize,
    pub cache_hits: usize,
    pub pq_distances: usize,
    pub exact_distances: usize,
    /// Search stopped early on `max_rounds` or `deadline`.
    pub truncated: bool,
    pub used_pq_refine: bool,
    pub expanded: Vec<u32>,
}

impl QueryStats {
    pub fn merge(&mut self, other: &QueryStats) {
        self.rounds += other.rounds;
        self.disk_reads += other.disk_reads;
        self.cache_hits += other.cache_hits;
        self.pq_distances += other.pq_distances;
        self.exact_distances += other.exact_distances;
        self.truncated |= other.truncated;
        self.used_pq_refine |= other.used_pq_refine;
        self.expanded.extend_from_slice(&other.expanded);
    }
}

/// Query engine over a loaded layout. Immutable; share it across threads.
pub struct DiskSearcher {
    layout: DiskLayoutReader,
    space: BuildSpace,
    pq: Arc<PqCodebook>,
    pq_codes: Vec<u8>,
    disk_pq: Option<Arc<PqCodebook>>,
    cache: CacheTable,
}

impl DiskSearcher {
    pub fn new(
        layout: DiskLayoutReader,
        space: BuildSpace,
        pq: Arc<PqCodebook>,
        pq_codes: Vec<u8>,
        disk_pq: Option<Arc<PqCodebook>>,
    ) -> Result<Self> {
        let n = layout.num_nodes();
        if pq_codes.len() != n * pq.code_len() {
            return Err(RetrieveError::InvalidParameter(format!(
                "expected {} PQ code bytes for {n} nodes, got {}",
                n * pq.code_len(),
                pq_codes.len()
            )));
        }
        if pq.dim() != space.stored_dim() {
            return Err(RetrieveError::DimensionMismatch {
                query_dim: pq.dim(),
                doc_dim: space.stored_dim(),
            });
        }
        let disk_width = layout.header().disk_pq_dims as usize;
        match &disk_pq {
            Some(c) if c.code_len() != disk_width => {
                return Err(RetrieveError::InvalidParameter(format!(
                    "disk codebook has {} chunks, layout records {disk_width}",
                    c.code_len()
                )))
            }
            None if disk_width > 0 => {
                return Err(RetrieveError::NotReady(
                    "layout stores disk PQ codes but no disk codebook was loaded".to_string(),
                ))
            }
            _ => {}
        }
        Ok(Self {
            layout,
            space,
            pq,
            pq_codes,
            disk_pq,
            cache: CacheTable::empty(0),
        })
    }

    pub fn set_cache(&mut self, cache: CacheTable) {
        self.cache = cache;
    }

    pub fn cache(&self) -> &CacheTable {
        &self.cache
    }

    pub fn layout(&self) -> &DiskLayoutReader {
        &self.layout
    }

    pub fn space(&self) -> &BuildSpace {
        &self.space
    }

    pub fn num_nodes(&self) -> usize {
        self.layout.num_nodes()
    }

    pub fn entry_point(&self) -> u32 {
        self.layout.header().entry_point
    }

    /// Bytes held in memory: PQ codes, codebooks and cache.
    pub fn memory_bytes(&self) -> usize {
        let codebook = |c: &PqCodebook| c.num_centroids() * c.dim() * 4 + c.dim() * 4;
        self.pq_codes.len()
            + codebook(self.pq.as_ref())
            + self.disk_pq.as_deref().map_or(0, codebook)
            + self.cache.bytes_used()
    }

    #[inline]
    fn code(&self, id: u32) -> &[u8] {
        let len = self.pq.code_len();
        let start = id as usize * len;
        &self.pq_codes[start..start + len]
    }

    /// Top-k search for a raw query. Distances are in the index metric.
    pub fn search(
        &self,
        query: &[f32],
        params: &SearchParams,
        filter: Option<&Bitset>,
    ) -> Result<(Vec<Neighbor>, QueryStats)> {
        let prepared = self.space.prepare_query(query)?;
        let (mut results, stats) = self.search_prepared(&prepared, params, filter)?;
        for r in &mut results {
            r.distance = self.space.to_metric(&prepared, r.distance);
        }
        Ok((results, stats))
    }

    /// Top-k search for a build-space query. Distances stay squared L2.
    pub fn search_prepared(
        &self,
        query: &PreparedQuery,
        params: &SearchParams,
        filter: Option<&Bitset>,
    ) -> Result<(Vec<Neighbor>, QueryStats)> {
        if params.k == 0 {
            return Err(RetrieveError::config("k", "must be at least 1"));
        }
        let n = self.num_nodes();
        if n == 0 {
            return Err(RetrieveError::EmptyIndex);
        }
        if let Some(bits) = filter {
            if bits.len() != n {
                return Err(RetrieveError::InvalidParameter(format!(
                    "filter covers {} ids but the index holds {}",
                    bits.len(),
                    n
                )));
            }
        }

        let strategy =
            FilterStrategySelector::new(params.filter_threshold).select(filter, params.k, n);
        match (strategy, filter) {
            (FilterStrategy::PqRefine, Some(bits)) => self.pq_refine(query, params, bits),
            _ => self.beam_search(query, params, filter),
        }
    }

    fn beam_search(
        &self,
        query: &PreparedQuery,
        params: &SearchParams,
        filter: Option<&Bitset>,
    ) -> Result<(Vec<Neighbor>, QueryStats)> {
        let mut stats = QueryStats::default();
        let table = self.pq.distance_table(&query.vector);
        let disk_table = self.disk_pq.as_ref().map(|c| c.distance_table(&query.vector));

        let mut candidates = NeighborQueue::new(params.search_list_size);
        let mut visited: HashSet<u32> = HashSet::with_capacity(params.search_list_size * 8);
        let mut results: Vec<Neighbor> = Vec::with_capacity(params.search_list_size * 2);

        let entry = self.entry_point();
        visited.insert(entry);
        candidates.insert(entry, table.distance(self.code(entry)));
        stats.pq_distances += 1;

        loop {
            if params.out_of_budget(stats.rounds) {
                stats.truncated = candidates.has_unexpanded();
                break;
            }
            let frontier = candidates.pop_unexpanded_batch(params.beamwidth);
            if frontier.is_empty() {
                break;
            }
            stats.rounds += 1;

            let ids: Vec<u32> = frontier.iter().map(|c| c.id).collect();
            let records = self.fetch(&ids, &mut stats)?;
            for (&id, record) in ids.iter().zip(&records) {
                if params.collect_expanded {
                    stats.expanded.push(id);
                }
                if !filter.is_some_and(|f| f.is_excluded(id)) {
                    let d = exact_distance(&query.vector, disk_table.as_ref(), record);
                    stats.exact_distances += 1;
                    results.push(Neighbor::new(id, d));
                }
                for &nb in &record.neighbors {
                    if visited.insert(nb) {
                        candidates.insert(nb, table.distance(self.code(nb)));
                        stats.pq_distances += 1;
                    }
                }
            }
        }

        Ok((top_k(results, params.k), stats))
    }

    fn pq_refine(
        &self,
        query: &PreparedQuery,
        params: &SearchParams,
        filter: &Bitset,
    ) -> Result<(Vec<Neighbor>, QueryStats)> {
        let mut stats = QueryStats {
            used_pq_refine: true,
            ..Default::default()
        };
        let table = self.pq.distance_table(&query.vector);
        let disk_table = self.disk_pq.as_ref().map(|c| c.distance_table(&query.vector));

        let scored: Vec<Neighbor> = (0..self.num_nodes() as u32)
            .into_par_iter()
            .filter(|&id| !filter.is_excluded(id))
            .map(|id| Neighbor::new(id, table.distance(self.code(id))))
            .collect();
        stats.pq_distances = scored.len();
        let survivors = top_k(scored, params.search_list_size);

        let mut results = Vec::with_capacity(survivors.len());
        for batch in survivors.chunks(params.beamwidth) {
            if params.out_of_budget(stats.rounds) {
                stats.truncated = true;
                break;
            }
            stats.rounds += 1;
            let ids: Vec<u32> = batch.iter().map(|c| c.id).collect();
            let records = self.fetch(&ids, &mut stats)?;
            for (&id, record) in ids.iter().zip(&records) {
                if params.collect_expanded {
                    stats.expanded.push(id);
                }
                results.push(Neighbor::new(
                    id,
                    exact_distance(&query.vector, disk_table.as_ref(), record),
                ));
                stats.exact_distances += 1;
            }
        }

        Ok((top_k(results, params.k), stats))
    }

    /// Records for `ids`, in order. Cache hits are borrowed; misses are read
    /// as one batch.
    fn fetch(&self, ids: &[u32], stats: &mut QueryStats) -> Result<Vec<Cow<'_, NodeRecord>>> {
        let mut out: Vec<Option<Cow<'_, NodeRecord>>> = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();
        let mut miss_slots = Vec::new();
        for (slot, &id) in ids.iter().enumerate() {
            match self.cache.get(id) {
                Some(record) => {
                    stats.cache_hits += 1;
                    out.push(Some(Cow::Borrowed(record)));
                }
                None => {
                    misses.push(id);
                    miss_slots.push(slot);
                    out.push(None);
                }
            }
        }
        if !misses.is_empty() {
            stats.disk_reads += misses.len();
            let records = self.layout.read_nodes(&misses)?;
            for (slot, record) in miss_slots.into_iter().zip(records) {
                out[slot] = Some(Cow::Owned(record));
            }
        }
        Ok(out.into_iter().flatten().collect())
    }

    /// Stored build-space vector of a record; decoded under disk PQ.
    pub(crate) fn stored_vector(&self, record: &NodeRecord) -> Result<Vec<f32>> {
        match (&record.payload, &self.disk_pq) {
            (RecordPayload::Full(v), _) => Ok(v.clone()),
            (RecordPayload::Pq(code), Some(codebook)) => Ok(codebook.decode(code)),
            (RecordPayload::Pq(_), None) => Err(RetrieveError::NotReady(
                "disk PQ record without a disk codebook".to_string(),
            )),
        }
    }

    /// User-space vectors for `ids`. Cosine indexes return unit vectors;
    /// disk PQ indexes return PQ reconstructions.
    pub fn get_vectors(&self, ids: &[u32]) -> Result<Vec<Vec<f32>>> {
        let n = self.num_nodes();
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= n) {
            return Err(RetrieveError::InvalidParameter(format!(
                "id {bad} out of range for {n} vectors"
            )));
        }
        let mut stats = QueryStats::default();
        self.fetch(ids, &mut stats)?
            .iter()
            .map(|record| {
                let stored = self.stored_vector(record)?;
                Ok(self.space.restore_base(&stored).to_vec())
            })
            .collect()
    }

    /// Build-space queries made from `count` random stored vectors.
    pub(crate) fn sample_queries(&self, count: usize, seed: u64) -> Result<Vec<PreparedQuery>> {
        let n = self.num_nodes();
        let count = count.min(n);
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ids: Vec<u32> = sample(&mut rng, n, count)
            .into_iter()
            .map(|i| i as u32)
            .collect();
        ids.sort_unstable();

        let mut queries = Vec::with_capacity(count);
        for chunk in ids.chunks(64) {
            for record in self.layout.read_nodes(chunk)? {
                let stored = self.stored_vector(&record)?;
                queries.push(self.space.prepare_query(self.space.restore_base(&stored))?);
            }
        }
        Ok(queries)
    }
}

#[inline]
fn exact_distance(query: &[f32], disk_table: Option<&DistanceTable>, record: &NodeRecord) -> f32 {
    match (&record.payload, disk_table) {
        (RecordPayload::Full(v), _) => simd::l2_distance_squared(query, v),
        (RecordPayload::Pq(code), Some(table)) => table.distance(code),
        (RecordPayload::Pq(_), None) => f32::INFINITY,
    }
}

/// Best `k` by `(distance, id)`, ascending.
fn top_k(mut items: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    let cmp = |a: &Neighbor, b: &Neighbor| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id));
    if items.len() > k && k > 0 {
        items.select_nth_unstable_by(k - 1, cmp);
        items.truncate(k);
    }
    items.sort_by(cmp);
    items.truncate(k);
    items
}
