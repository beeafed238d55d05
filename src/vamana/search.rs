//! Candidate list and greedy best-first search.
//!
//! [`NeighborQueue`] is the bounded, distance-sorted candidate list used by
//! both construction (in memory) and the disk beam search. It keeps at most
//! `capacity` entries and a cursor to the closest entry not yet expanded.

use super::VectorSlice;
use std::collections::HashSet;

/// A search result: node id and distance (smaller is closer).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub id: u32,
    pub distance: f32,
}

impl Neighbor {
    pub fn new(id: u32, distance: f32) -> Self {
        Self { id, distance }
    }
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    id: u32,
    dist: f32,
    expanded: bool,
}

/// Bounded candidate list ordered by `(distance, id)`.
#[derive(Clone, Debug)]
pub struct NeighborQueue {
    items: Vec<Entry>,
    capacity: usize,
    cursor: usize,
}

impl NeighborQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity + 1),
            capacity,
            cursor: 0,
        }
    }

    /// Insert a candidate. Returns false when it is no better than the worst
    /// entry of a full list. Callers keep a visited set so ids are not repeated.
    pub fn insert(&mut self, id: u32, dist: f32) -> bool {
        if self.items.len() == self.capacity {
            if let Some(worst) = self.items.last() {
                if dist >= worst.dist {
                    return false;
                }
            }
        }

        let pos = self
            .items
            .partition_point(|e| e.dist < dist || (e.dist == dist && e.id < id));
        self.items.insert(
            pos,
            Entry {
                id,
                dist,
                expanded: false,
            },
        );
        if self.items.len() > self.capacity {
            self.items.pop();
        }
        if pos < self.cursor {
            self.cursor = pos;
        }
        true
    }

    /// Mark and return the closest unexpanded candidate.
    pub fn pop_closest_unexpanded(&mut self) -> Option<Neighbor> {
        self.skip_expanded();
        let entry = self.items.get_mut(self.cursor)?;
        entry.expanded = true;
        let n = Neighbor::new(entry.id, entry.dist);
        self.skip_expanded();
        Some(n)
    }

    /// Mark and return up to `width` closest unexpanded candidates.
    pub fn pop_unexpanded_batch(&mut self, width: usize) -> Vec<Neighbor> {
        let mut batch = Vec::with_capacity(width);
        self.skip_expanded();
        for entry in self.items[self.cursor..].iter_mut() {
            if batch.len() >= width {
                break;
            }
            if !entry.expanded {
                entry.expanded = true;
                batch.push(Neighbor::new(entry.id, entry.dist));
            }
        }
        self.skip_expanded();
        batch
    }

    pub fn has_unexpanded(&mut self) -> bool {
        self.skip_expanded();
        self.cursor < self.items.len()
    }

    fn skip_expanded(&mut self) {
        while self.cursor < self.items.len() && self.items[self.cursor].expanded {
            self.cursor += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Distance of the worst kept entry, or infinity while the list has room.
    pub fn worst_distance(&self) -> f32 {
        if self.items.len() < self.capacity {
            f32::INFINITY
        } else {
            self.items.last().map_or(f32::INFINITY, |e| e.dist)
        }
    }

    /// Entries in ascending distance order.
    pub fn iter(&self) -> impl Iterator<Item = Neighbor> + '_ {
        self.items.iter().map(|e| Neighbor::new(e.id, e.dist))
    }
}

/// Result of an in-memory greedy search.
pub struct GreedyResult {
    /// Every node expanded during the search, with its distance to the query.
    pub expanded: Vec<(u32, f32)>,
    /// Best `search_list_size` candidates, ascending.
    pub best: Vec<Neighbor>,
}

/// Greedy best-first search over an in-memory adjacency list.
pub fn greedy_search<'g, G>(
    query: &[f32],
    start: u32,
    vectors: VectorSlice<'_>,
    neighbors_of: G,
    search_list_size: usize,
) -> GreedyResult
where
    G: Fn(u32) -> &'g [u32],
{
    let mut queue = NeighborQueue::new(search_list_size);
    let mut visited: HashSet<u32> = HashSet::with_capacity(search_list_size * 4);
    let mut expanded = Vec::with_capacity(search_list_size * 2);

    visited.insert(start);
    queue.insert(start, vectors.distance_to(query, start));

    while let Some(current) = queue.pop_closest_unexpanded() {
        expanded.push((current.id, current.distance));
        for &nb in neighbors_of(current.id) {
            if !visited.insert(nb) {
                continue;
            }
            let d = vectors.distance_to(query, nb);
            queue.insert(nb, d);
        }
    }

    GreedyResult {
        expanded,
        best: queue.iter().collect(),
    }
}
