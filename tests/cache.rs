//! Node cache population and its effect on reads.

mod common;

use common::*;
use ssdann::diskann::{CacheStrategy, SearchParams};
use ssdann::{DiskAnnConfig, DiskAnnIndex};

const BUDGET_BYTES: u64 = 20_000;

fn cached_config(use_bfs_cache: bool) -> DiskAnnConfig {
    DiskAnnConfig {
        search_cache_budget_gb: gb(BUDGET_BYTES),
        use_bfs_cache,
        ..test_config()
    }
}

#[test]
fn both_strategies_stay_within_budget_and_serve_hits() {
    let (n, d) = (1000, 16);
    let data = generate_vectors(n, d, 41);
    let dir = tempfile::tempdir().unwrap();
    build_index(dir.path(), &data, d, &test_config());

    for (bfs, strategy) in [(true, CacheStrategy::Bfs), (false, CacheStrategy::SampleQueries)] {
        let cfg = cached_config(bfs);
        let mut index = DiskAnnIndex::new(dir.path());
        index.load(&cfg).unwrap();
        assert_eq!(index.cache_strategy(), Some(strategy));

        let (nodes, bytes) = index.cache_usage().unwrap();
        assert!(nodes > 0, "{strategy:?} cached nothing");
        assert!(bytes as u64 <= BUDGET_BYTES, "{strategy:?} used {bytes} bytes");

        let params = SearchParams::new(10, 32, cfg.beamwidth);
        let (_, stats) = index.search_with_params(&data[..d], &params, None).unwrap();
        assert!(stats.cache_hits > 0, "{strategy:?} served no hits");
    }
}

#[test]
fn zero_budget_caches_nothing() {
    let (n, d) = (300, 8);
    let data = generate_vectors(n, d, 43);
    let dir = tempfile::tempdir().unwrap();
    let (index, _) = build_index(dir.path(), &data, d, &test_config());
    assert_eq!(index.cache_usage(), Some((0, 0)));

    let (_, stats) = index
        .search_with_params(&data[..d], &SearchParams::new(5, 16, 4), None)
        .unwrap();
    assert_eq!(stats.cache_hits, 0);
    assert!(stats.disk_reads > 0);
}

#[test]
fn cache_does_not_change_results() {
    let (n, d) = (800, 16);
    let data = generate_vectors(n, d, 45);
    let dir = tempfile::tempdir().unwrap();
    let (plain, _) = build_index(dir.path(), &data, d, &test_config());

    let mut cached = DiskAnnIndex::new(dir.path());
    cached.load(&cached_config(false)).unwrap();

    let queries = generate_vectors(10, d, 46);
    for q in queries.chunks_exact(d) {
        let params = SearchParams::new(10, 40, 4);
        let (a, a_stats) = plain.search_with_params(q, &params, None).unwrap();
        let (b, b_stats) = cached.search_with_params(q, &params, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a_stats.rounds, b_stats.rounds);
        assert_eq!(
            a_stats.disk_reads,
            b_stats.disk_reads + b_stats.cache_hits,
            "cache hits should replace reads one for one"
        );
    }
}

#[test]
fn bfs_cache_covers_entry_point_first() {
    let (n, d) = (500, 8);
    let data = generate_vectors(n, d, 47);
    let dir = tempfile::tempdir().unwrap();
    build_index(dir.path(), &data, d, &test_config());

    // Room for one full-degree record: 8 floats plus a degree word and 32 slots.
    let budget = 8 * 4 + 4 * 33;
    let cfg = DiskAnnConfig {
        search_cache_budget_gb: gb(budget),
        use_bfs_cache: true,
        ..test_config()
    };
    let mut index = DiskAnnIndex::new(dir.path());
    index.load(&cfg).unwrap();
    let (nodes, bytes) = index.cache_usage().unwrap();
    assert!(nodes >= 1);
    assert!(bytes as u64 <= budget);

    // Every query expands the entry point first.
    let (_, stats) = index
        .search_with_params(&data[..d], &SearchParams::new(5, 16, 4), None)
        .unwrap();
    assert!(stats.cache_hits >= 1);
}

#[test]
fn warm_up_leaves_index_searchable() {
    let (n, d) = (400, 8);
    let data = generate_vectors(n, d, 49);
    let dir = tempfile::tempdir().unwrap();
    build_index(dir.path(), &data, d, &test_config());

    let cfg = DiskAnnConfig {
        warm_up: true,
        ..cached_config(false)
    };
    let mut index = DiskAnnIndex::new(dir.path());
    index.load(&cfg).unwrap();
    let hits = index.search(&data[..d], 3, &cfg, None).unwrap();
    assert_eq!(hits[0].id, 0);
}
