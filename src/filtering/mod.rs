//! Id filtering for vector search.
//!
//! A [`Bitset`] marks ids that must not be returned: a set bit excludes the
//! id. Filtered ids are still traversed by graph search (they keep the graph
//! connected) but never enter the result list.

pub mod strategy;

pub use strategy::{dynamic_filter_threshold, FilterStrategy, FilterStrategySelector};

/// Fixed-size exclusion bitset over node ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitset {
    words: Vec<u64>,
    len: usize,
    ones: usize,
}

impl Bitset {
    /// An all-clear bitset (nothing excluded) over `len` ids.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            ones: 0,
        }
    }

    /// Build from an iterator of excluded ids; ids `>= len` are ignored.
    pub fn from_excluded(len: usize, excluded: impl IntoIterator<Item = u32>) -> Self {
        let mut bits = Self::new(len);
        for id in excluded {
            bits.set(id);
        }
        bits
    }

    /// Exclude `id`.
    pub fn set(&mut self, id: u32) {
        let i = id as usize;
        if i >= self.len {
            return;
        }
        let (w, b) = (i / 64, i % 64);
        if self.words[w] & (1 << b) == 0 {
            self.words[w] |= 1 << b;
            self.ones += 1;
        }
    }

    /// True when `id` is excluded. Ids past the end are never excluded.
    #[inline]
    pub fn is_excluded(&self, id: u32) -> bool {
        let i = id as usize;
        i < self.len && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of excluded ids.
    pub fn count_excluded(&self) -> usize {
        self.ones
    }

    /// Fraction of ids excluded, in `[0, 1]`.
    pub fn excluded_ratio(&self) -> f32 {
        if self.len == 0 {
            0.0
        } else {
            self.ones as f32 / self.len as f32
        }
    }

    /// Ids that pass the filter, ascending.
    pub fn iter_allowed(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len as u32).filter(move |&id| !self.is_excluded(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_query() {
        let mut bits = Bitset::new(130);
        bits.set(0);
        bits.set(64);
        bits.set(129);
        bits.set(129);
        bits.set(500);
        assert_eq!(bits.count_excluded(), 3);
        assert!(bits.is_excluded(64));
        assert!(!bits.is_excluded(65));
        assert!(!bits.is_excluded(10_000));
    }

    #[test]
    fn ratio_and_allowed() {
        let bits = Bitset::from_excluded(10, [1, 3, 5, 7, 9]);
        assert!((bits.excluded_ratio() - 0.5).abs() < 1e-6);
        let allowed: Vec<u32> = bits.iter_allowed().collect();
        assert_eq!(allowed, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn empty_bitset_excludes_nothing() {
        let bits = Bitset::new(0);
        assert!(bits.is_empty());
        assert_eq!(bits.excluded_ratio(), 0.0);
    }
}
