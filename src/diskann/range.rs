//! Radius search on top of top-k search.
//!
//! Start at `k = min_k` with a search list of `ceil(k * ratio)`. While the
//! farthest result is still inside the radius and the search came back full,
//! the boundary may lie further out: double `k` and search again. Stop when
//! the farthest result leaves the radius, when fewer than `k` results come
//! back, or when doubling would pass `max_k`. This runs at most
//! `floor(log2(max_k / min_k)) + 1` rounds.

use super::search::{DiskSearcher, QueryStats, SearchParams};
use crate::error::{Result, RetrieveError};
use crate::filtering::Bitset;
use crate::vamana::Neighbor;
use std::collections::HashMap;

/// Range search bounds.
#[derive(Clone, Debug)]
pub struct RangeSearchParams {
    pub radius: f32,
    pub min_k: usize,
    pub max_k: usize,
    /// Search list size as a multiple of k.
    pub search_list_and_k_ratio: f32,
    pub beamwidth: usize,
    pub filter_threshold: f32,
}

/// Results within the radius, plus how the doubling went.
#[derive(Clone, Debug, Default)]
pub struct RangeSearchResult {
    /// Distinct ids with distance `<= radius`, ascending.
    pub neighbors: Vec<Neighbor>,
    pub rounds: usize,
    /// `k` used by each round.
    pub k_per_round: Vec<usize>,
    /// Distinct qualifying ids accumulated after each round.
    pub qualifying_per_round: Vec<usize>,
    pub stats: QueryStats,
}

impl RangeSearchResult {
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}

/// Upper bound on doubling rounds for `[min_k, max_k]`.
pub fn max_rounds(min_k: usize, max_k: usize) -> usize {
    let mut rounds = 1;
    let mut k = min_k.max(1);
    while k.saturating_mul(2) <= max_k {
        k *= 2;
        rounds += 1;
    }
    rounds
}

pub struct RangeSearchController<'a> {
    searcher: &'a DiskSearcher,
}

impl<'a> RangeSearchController<'a> {
    pub fn new(searcher: &'a DiskSearcher) -> Self {
        Self { searcher }
    }

    pub fn search(
        &self,
        query: &[f32],
        params: &RangeSearchParams,
        filter: Option<&Bitset>,
    ) -> Result<RangeSearchResult> {
        if params.min_k == 0 || params.min_k > params.max_k {
            return Err(RetrieveError::config(
                "min_k",
                format!("need 1 <= min_k <= max_k, got {} and {}", params.min_k, params.max_k),
            ));
        }
        if params.radius.is_nan() {
            return Err(RetrieveError::InvalidParameter("radius is NaN".to_string()));
        }

        let mut out = RangeSearchResult::default();
        let mut found: HashMap<u32, f32> = HashMap::new();
        let mut k = params.min_k;

        loop {
            let list = ((k as f64) * params.search_list_and_k_ratio as f64).ceil() as usize;
            let top = SearchParams::new(k, list, params.beamwidth)
                .with_filter_threshold(params.filter_threshold);
            let (results, stats) = self.searcher.search(query, &top, filter)?;

            out.rounds += 1;
            out.k_per_round.push(k);
            out.stats.merge(&stats);
            for r in results.iter().filter(|r| r.distance <= params.radius) {
                found
                    .entry(r.id)
                    .and_modify(|d| *d = d.min(r.distance))
                    .or_insert(r.distance);
            }
            out.qualifying_per_round.push(found.len());

            let full = results.len() >= k;
            let farthest = results.last().map_or(f32::INFINITY, |r| r.distance);
            if !full || farthest > params.radius || k.saturating_mul(2) > params.max_k {
                break;
            }
            k *= 2;
            log::debug!("range search: boundary not reached, doubling k to {k}");
        }

        out.neighbors = found
            .into_iter()
            .map(|(id, distance)| Neighbor::new(id, distance))
            .collect();
        out.neighbors
            .sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}
