//! Inner product, cosine and disk-PQ indexes against brute force.

mod common;

use common::*;
use ssdann::diskann::index::{DISK_PQ_PIVOTS_FILE, PQ_COMPRESSED_FILE};
use ssdann::{DiskAnnConfig, DistanceMetric};

fn check_metric(metric: DistanceMetric, seed: u64) {
    let (n, d, k) = (1000, 16, 10);
    let data = generate_vectors(n, d, seed);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        metric_type: metric,
        ..test_config()
    };
    let (index, report) = build_index(dir.path(), &data, d, &cfg);
    let expected_stored = if metric == DistanceMetric::InnerProduct { d + 1 } else { d };
    assert_eq!(index.metadata().unwrap().stored_dim, expected_stored);
    assert_eq!(report.dim, d);

    let search_cfg = DiskAnnConfig {
        search_list_size: Some(40),
        ..cfg
    };
    let queries = generate_vectors(20, d, seed + 1);
    let mut recall = 0.0;
    for q in queries.chunks_exact(d) {
        let results = index.search(q, k, &search_cfg, None).unwrap();
        assert_eq!(results.len(), k);
        assert_sorted(&results);
        for r in &results {
            let row = &data[r.id as usize * d..(r.id as usize + 1) * d];
            let expected = metric.distance(q, row);
            assert!(
                (r.distance - expected).abs() < 1e-3,
                "{metric}: id {} reported {} expected {}",
                r.id,
                r.distance,
                expected
            );
        }
        recall += compute_recall(&results, &brute_force_knn(&data, d, q, k, metric), k);
    }
    assert!(recall / 20.0 >= 0.8, "{metric} recall {}", recall / 20.0);
}

#[test]
fn inner_product_matches_brute_force() {
    check_metric(DistanceMetric::InnerProduct, 71);
}

#[test]
fn cosine_matches_brute_force() {
    check_metric(DistanceMetric::Cosine, 73);
}

#[test]
fn cosine_vectors_come_back_normalized() {
    let (n, d) = (200, 8);
    let data = generate_vectors(n, d, 75);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        metric_type: DistanceMetric::Cosine,
        ..test_config()
    };
    let (index, _) = build_index(dir.path(), &data, d, &cfg);
    let v = &index.get_vector_by_ids(&[3]).unwrap()[0];
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);

    let raw = &data[3 * d..4 * d];
    let raw_norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    for (a, b) in v.iter().zip(raw) {
        assert!((a - b / raw_norm).abs() < 1e-5);
    }
}

#[test]
fn inner_product_vectors_drop_the_extra_coordinate() {
    let (n, d) = (200, 8);
    let data = generate_vectors(n, d, 77);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        metric_type: DistanceMetric::InnerProduct,
        ..test_config()
    };
    let (index, _) = build_index(dir.path(), &data, d, &cfg);
    let got = index.get_vector_by_ids(&[10]).unwrap();
    assert_eq!(got[0], data[10 * d..11 * d].to_vec());
}

#[test]
fn disk_pq_layout_still_ranks_well() {
    let (n, d, k) = (1000, 16, 10);
    let data = generate_vectors(n, d, 79);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        disk_pq_dims: 8,
        search_list_size: Some(48),
        ..test_config()
    };
    let (index, report) = build_index(dir.path(), &data, d, &cfg);
    assert_eq!(report.disk_pq_dims, 8);
    assert!(dir.path().join(DISK_PQ_PIVOTS_FILE).exists());

    let queries = generate_vectors(20, d, 80);
    let mut recall = 0.0;
    for q in queries.chunks_exact(d) {
        let results = index.search(q, k, &cfg, None).unwrap();
        assert_eq!(results.len(), k);
        assert_sorted(&results);
        recall += compute_recall(&results, &brute_force_knn(&data, d, q, k, DistanceMetric::L2), k);
    }
    assert!(recall / 20.0 >= 0.5, "disk PQ recall {}", recall / 20.0);

    let approx = &index.get_vector_by_ids(&[0]).unwrap()[0];
    assert_eq!(approx.len(), d);
}

#[test]
fn disk_pq_width_is_clamped_to_dimension() {
    let (n, d) = (300, 8);
    let data = generate_vectors(n, d, 81);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        disk_pq_dims: 100,
        ..test_config()
    };
    let (index, report) = build_index(dir.path(), &data, d, &cfg);
    assert_eq!(report.disk_pq_dims, d);
    assert_eq!(index.metadata().unwrap().disk_pq_dims, d);
    assert!(!index.search(&data[..d], 5, &cfg, None).unwrap().is_empty());
}

#[test]
fn inner_product_codes_stay_within_user_dimension() {
    let (n, d) = (300, 8);
    let data = generate_vectors(n, d, 83);
    let dir = tempfile::tempdir().unwrap();
    let cfg = DiskAnnConfig {
        metric_type: DistanceMetric::InnerProduct,
        disk_pq_dims: 100,
        ..test_config()
    };
    let (index, report) = build_index(dir.path(), &data, d, &cfg);
    assert_eq!(index.metadata().unwrap().stored_dim, d + 1);
    assert_eq!(report.pq_code_len, d);
    assert!(report.pq_code_clamped);
    assert_eq!(report.disk_pq_dims, d);

    let codes = std::fs::metadata(dir.path().join(PQ_COMPRESSED_FILE)).unwrap().len();
    assert!(codes <= (d * n) as u64, "{codes} code bytes for {n} rows of width {d}");
    assert_eq!(index.search(&data[..d], 3, &cfg, None).unwrap().len(), 3);
}
