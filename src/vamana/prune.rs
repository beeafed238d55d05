//! Occlusion (alpha) pruning.
//!
//! A candidate `c` is occluded by an already selected neighbor `s` when
//! `alpha * d(s, c) <= d(node, c)`: `s` is close enough to `c` that a greedy
//! walk through `s` reaches `c`, so a direct edge is redundant. Distances are
//! squared L2.
//!
//! Selection runs with a growing alpha (1.0, 1.2, 1.44, ... up to `alpha`):
//! the strict pass keeps the relative-neighborhood edges, later passes admit
//! some longer edges while there is room.

/// Default pruning factor for the final construction pass.
pub const DEFAULT_ALPHA: f32 = 1.2;

const ALPHA_STEP: f32 = 1.2;

/// Sort `pool` by id, dropping duplicate ids (keeping the smallest distance)
/// and the node itself.
pub fn dedup_pool(node: u32, pool: &mut Vec<(u32, f32)>) {
    pool.retain(|&(id, _)| id != node);
    pool.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pool.dedup_by_key(|c| c.0);
}

/// Select at most `max_degree` diverse neighbors for `node` from `pool`.
///
/// `pool` holds `(id, d(node, id))` pairs in any order, possibly with
/// duplicates. `dist(a, b)` returns the distance between two pool members.
/// The result never contains `node` and never repeats an id.
pub fn robust_prune<F>(
    node: u32,
    pool: &mut Vec<(u32, f32)>,
    alpha: f32,
    max_degree: usize,
    dist: &F,
) -> Vec<u32>
where
    F: Fn(u32, u32) -> f32,
{
    dedup_pool(node, pool);
    pool.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut selected: Vec<u32> = Vec::with_capacity(max_degree);
    if pool.is_empty() || max_degree == 0 {
        return selected;
    }

    // Largest d(node, c) / d(s, c) over selected s; f32::MAX once c is selected.
    let mut occlusion = vec![0.0f32; pool.len()];
    let mut cur_alpha = 1.0f32;

    while cur_alpha <= alpha * 1.0001 && selected.len() < max_degree {
        for i in 0..pool.len() {
            if selected.len() >= max_degree {
                break;
            }
            if occlusion[i] > cur_alpha {
                continue;
            }

            let (id, _) = pool[i];
            occlusion[i] = f32::MAX;
            selected.push(id);

            for j in (i + 1)..pool.len() {
                if occlusion[j] > alpha {
                    continue;
                }
                let d_sel = dist(id, pool[j].0);
                occlusion[j] = if d_sel <= 0.0 {
                    f32::MAX
                } else {
                    occlusion[j].max(pool[j].1 / d_sel)
                };
            }
        }
        cur_alpha *= ALPHA_STEP;
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn l2sq(points: &[[f32; 2]]) -> impl Fn(u32, u32) -> f32 + '_ {
        move |a, b| {
            let (p, q) = (points[a as usize], points[b as usize]);
            (p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)
        }
    }

    #[test]
    fn closest_always_kept() {
        let d = |a: u32, b: u32| (a as f32 - b as f32).powi(2);
        let mut pool: Vec<(u32, f32)> = (1..6).map(|i| (i, d(0, i))).collect();
        let pruned = robust_prune(0, &mut pool, 1.2, 3, &d);
        assert_eq!(pruned[0], 1);
        assert!(pruned.len() <= 3);
    }

    #[test]
    fn collinear_points_are_occluded() {
        // From 0, point 2 lies behind point 1 on the same ray.
        let points = [[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [0.0, 1.0]];
        let d = l2sq(&points);
        let mut pool = vec![(1, d(0, 1)), (2, d(0, 2)), (3, d(0, 3))];
        let pruned = robust_prune(0, &mut pool, 1.0, 3, &d);
        assert!(pruned.contains(&1));
        assert!(pruned.contains(&3));
        assert!(!pruned.contains(&2));
    }

    #[test]
    fn drops_self_and_duplicates() {
        let d = |a: u32, b: u32| (a as f32 - b as f32).abs() + 0.5;
        let mut pool = vec![(5, 0.0), (3, 2.5), (3, 2.0), (7, 2.5), (7, 2.5)];
        let pruned = robust_prune(5, &mut pool, 2.0, 8, &d);
        assert!(!pruned.contains(&5));
        let mut sorted = pruned.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), pruned.len());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_prune_respects_degree_and_uniqueness(
            coords in proptest::collection::vec((-10.0f32..10.0, -10.0f32..10.0), 2..60),
            ids in proptest::collection::vec(0usize..60, 0..120),
            max_degree in 1usize..16,
            alpha in 1.0f32..2.0,
        ) {
            let points: Vec<[f32; 2]> = coords.iter().map(|&(x, y)| [x, y]).collect();
            let d = l2sq(&points);
            let n = points.len() as u32;
            let mut pool: Vec<(u32, f32)> = ids
                .iter()
                .map(|&i| (i as u32 % n, d(0, i as u32 % n)))
                .collect();
            let pruned = robust_prune(0, &mut pool, alpha, max_degree, &d);

            prop_assert!(pruned.len() <= max_degree);
            prop_assert!(!pruned.contains(&0));
            let mut uniq = pruned.clone();
            uniq.sort_unstable();
            uniq.dedup();
            prop_assert_eq!(uniq.len(), pruned.len());
        }
    }
}
