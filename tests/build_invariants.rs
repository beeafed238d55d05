//! Graph construction under RAM budgets.

mod common;

use common::*;
use ssdann::vamana::partition::bytes_per_node;
use ssdann::{Dataset, DiskAnnConfig, DiskAnnIndex, DistanceMetric, RetrieveError};

fn average_recall(index: &DiskAnnIndex, data: &[f32], dim: usize, cfg: &DiskAnnConfig) -> f64 {
    let k = 10;
    let queries = generate_vectors(30, dim, 999);
    let total: f64 = queries
        .chunks_exact(dim)
        .map(|q| {
            let results = index.search(q, k, cfg, None).unwrap();
            let gt = brute_force_knn(data, dim, q, k, DistanceMetric::L2);
            compute_recall(&results, &gt, k)
        })
        .sum();
    total / 30.0
}

#[test]
fn partitioned_build_matches_single_shard_quality() {
    let (n, d, r) = (1500, 8, 16);
    let data = generate_vectors(n, d, 77);
    let search_cfg = DiskAnnConfig {
        search_list_size: Some(48),
        ..DiskAnnConfig::default()
    };

    let single_dir = tempfile::tempdir().unwrap();
    let single_cfg = DiskAnnConfig {
        max_degree: r,
        ..test_config()
    };
    let (single, single_report) = build_index(single_dir.path(), &data, d, &single_cfg);
    assert_eq!(single_report.num_shards, 1);

    let sharded_dir = tempfile::tempdir().unwrap();
    let sharded_cfg = DiskAnnConfig {
        max_degree: r,
        build_dram_budget_gb: Some(gb(600 * bytes_per_node(d, r))),
        ..test_config()
    };
    let (sharded, sharded_report) = build_index(sharded_dir.path(), &data, d, &sharded_cfg);
    assert!(sharded_report.num_shards > 1, "{sharded_report:?}");
    assert!(sharded_report.max_degree <= r);
    assert_eq!(
        sharded.metadata().unwrap().num_shards,
        sharded_report.num_shards
    );

    let single_recall = average_recall(&single, &data, d, &search_cfg);
    let sharded_recall = average_recall(&sharded, &data, d, &search_cfg);
    assert!(single_recall >= 0.8, "single-shard recall {single_recall}");
    assert!(sharded_recall >= 0.8, "sharded recall {sharded_recall}");
    assert!(
        (single_recall - sharded_recall).abs() <= 0.05,
        "single {single_recall} vs sharded {sharded_recall}"
    );
}

#[test]
fn budget_below_one_shard_is_rejected() {
    let (n, d) = (400, 8);
    let data = generate_vectors(n, d, 3);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        max_degree: 16,
        build_dram_budget_gb: Some(gb(1000)),
        ..test_config()
    };
    let mut index = DiskAnnIndex::new(dir.path());
    let err = index
        .build(&Dataset::new(data, d).unwrap(), &cfg)
        .unwrap_err();
    match err {
        RetrieveError::BudgetExceeded {
            required_bytes,
            budget_bytes,
        } => {
            assert!(required_bytes > budget_bytes);
            assert_eq!(required_bytes, 64 * bytes_per_node(d, 16));
        }
        other => panic!("expected BudgetExceeded, got {other:?}"),
    }
    assert!(!index.is_ready());
}

#[test]
fn accelerated_build_runs_one_pass() {
    let (n, d) = (600, 8);
    let data = generate_vectors(n, d, 4);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        accelerate_build: true,
        ..test_config()
    };
    let (index, report) = build_index(dir.path(), &data, d, &cfg);
    assert_eq!(report.passes, 1);
    assert!(index.metadata().unwrap().accelerate_build);
    assert!(average_recall(&index, &data, d, &test_config()) >= 0.7);
}

#[test]
fn build_rejects_missing_budgets_and_empty_data() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = Dataset::new(generate_vectors(10, 4, 1), 4).unwrap();

    let mut index = DiskAnnIndex::new(dir.path());
    let no_pq = DiskAnnConfig {
        pq_code_budget_gb: None,
        ..test_config()
    };
    assert!(matches!(
        index.build(&dataset, &no_pq),
        Err(RetrieveError::Config { field: "pq_code_budget_gb", .. })
    ));
    let no_dram = DiskAnnConfig {
        build_dram_budget_gb: None,
        ..test_config()
    };
    assert!(matches!(
        index.build(&dataset, &no_dram),
        Err(RetrieveError::Config { field: "build_dram_budget_gb", .. })
    ));

    let empty = Dataset::new(Vec::new(), 4).unwrap();
    assert!(matches!(
        index.build(&empty, &test_config()),
        Err(RetrieveError::EmptyIndex)
    ));
}

#[test]
fn tiny_pq_budget_is_clamped_to_one_byte() {
    let (n, d) = (300, 8);
    let data = generate_vectors(n, d, 8);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        pq_code_budget_gb: Some(0.0),
        ..test_config()
    };
    let (index, report) = build_index(dir.path(), &data, d, &cfg);
    assert_eq!(report.pq_code_len, 1);
    assert!(report.pq_code_clamped);
    // Exact re-ranking keeps self-queries correct even with coarse codes.
    let hit = index.search(&data[..d], 1, &test_config(), None).unwrap();
    assert_eq!(hit[0].id, 0);
}

#[test]
fn single_vector_index() {
    let dir = tempfile::tempdir().unwrap();
    let (index, report) = build_index(dir.path(), &[0.5, -0.5, 1.0], 3, &test_config());
    assert_eq!(report.num_nodes, 1);
    assert_eq!(report.medoid, 0);
    let hits = index.search(&[0.0, 0.0, 0.0], 5, &test_config(), None).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, 0);
}
