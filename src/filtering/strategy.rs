//! Choosing between filtered graph search and PQ + refine.

use super::Bitset;

/// How a filtered query is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStrategy {
    /// Beam search over the graph; excluded ids are traversed but not returned.
    Graph,
    /// Score every allowed id with PQ codes, then re-rank the best with exact
    /// distances read from disk.
    PqRefine,
}

/// Lower clamp of the dynamic threshold.
const DYNAMIC_THRESHOLD_MIN: f32 = 0.5;
/// Upper clamp of the dynamic threshold.
const DYNAMIC_THRESHOLD_MAX: f32 = 0.95;
/// Allowed ids per requested result below which graph search stops paying off.
const ALLOWED_PER_RESULT: f32 = 100.0;

/// Threshold used when `filter_threshold` is negative.
///
/// Switch once fewer than `100 * k` ids remain allowed, clamped to
/// `[0.5, 0.95]`.
pub fn dynamic_filter_threshold(k: usize, num_points: usize) -> f32 {
    if num_points == 0 {
        return DYNAMIC_THRESHOLD_MIN;
    }
    let t = 1.0 - (ALLOWED_PER_RESULT * k as f32) / num_points as f32;
    t.clamp(DYNAMIC_THRESHOLD_MIN, DYNAMIC_THRESHOLD_MAX)
}

pub struct FilterStrategySelector {
    threshold: f32,
}

impl FilterStrategySelector {
    /// `threshold` is the configured `filter_threshold`; negative means dynamic.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn effective_threshold(&self, k: usize, num_points: usize) -> f32 {
        if self.threshold < 0.0 {
            dynamic_filter_threshold(k, num_points)
        } else {
            self.threshold
        }
    }

    pub fn select(&self, filter: Option<&Bitset>, k: usize, num_points: usize) -> FilterStrategy {
        let Some(filter) = filter else {
            return FilterStrategy::Graph;
        };
        if filter.count_excluded() == 0 {
            return FilterStrategy::Graph;
        }
        if filter.excluded_ratio() >= self.effective_threshold(k, num_points) {
            FilterStrategy::PqRefine
        } else {
            FilterStrategy::Graph
        }
    }
}
