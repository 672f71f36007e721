//! Search quality against a brute-force scan.

use std::collections::HashSet;

use crate::common::{TestIndex, brute_force, random_rows};
use pqgraph::{Distance, IndexReader};

#[test]
fn test_top10_matches_exact_scan_for_most_queries() {
    let mut index = TestIndex::ingest("recall", random_rows(500, 16, 7), Distance::L2);
    index.params.max_connections_per_vertex = 32;
    index.params.max_candidates = 128;
    index.params.compression_ratio = 8;
    index.build();

    let reader = IndexReader::open(index.reader_params(128)).unwrap();
    let queries = random_rows(40, 16, 1234);

    let mut result = Vec::new();
    let mut matching = 0;
    for query in &queries {
        reader.nearest(query, &mut result, 10).unwrap();
        assert_eq!(result.len(), 10);

        let found: HashSet<u32> = result.iter().copied().collect();
        let exact: HashSet<u32> = brute_force(&index.rows, query, 10).into_iter().collect();
        if found == exact {
            matching += 1;
        }
    }
    assert!(
        matching * 100 >= queries.len() * 95,
        "only {matching} of {} queries matched the exact top 10",
        queries.len()
    );
}

#[test]
fn test_exact_nearest_agrees_with_brute_force() {
    let index = TestIndex::ingest("exact", random_rows(120, 8, 3), Distance::L2);
    index.build();
    let reader = IndexReader::open(index.reader_params(32)).unwrap();

    for query in random_rows(5, 8, 99) {
        assert_eq!(
            reader.exact_nearest(&query, 5).unwrap(),
            brute_force(&index.rows, &query, 5)
        );
    }
}

#[test]
fn test_cosine_index_finds_scaled_copy() {
    let rows = random_rows(200, 8, 11);
    let index = TestIndex::ingest("cosine", rows.clone(), Distance::Cosine);
    index.build();
    let reader = IndexReader::open(index.reader_params(64)).unwrap();

    // Cosine ignores magnitude, so a scaled row still finds itself.
    let mut result = Vec::new();
    for id in [0usize, 57, 199] {
        let scaled: Vec<f32> = rows[id].iter().map(|x| x * 3.5).collect();
        reader.nearest(&scaled, &mut result, 1).unwrap();
        assert_eq!(result, vec![id as u32]);
    }
}

#[test]
fn test_partitioned_build_keeps_recall() {
    let mut index = TestIndex::ingest("split", random_rows(400, 8, 5), Distance::L2);
    index.params.max_connections_per_vertex = 16;
    // About 150 of the 400 vertices fit in one partition.
    index.params.memory_budget_bytes = 150 * index.params.partition_vertex_bytes();
    let report = index.build();
    assert!(report.partitions >= 3, "got {} partitions", report.partitions);
    assert!(report.shared_vertices > 0);

    let reader = IndexReader::open(index.reader_params(64)).unwrap();
    let mut result = Vec::new();
    let mut hits = 0;
    for (id, row) in index.rows.iter().enumerate().step_by(20) {
        reader.nearest(row, &mut result, 1).unwrap();
        if result == [id as u32] {
            hits += 1;
        }
    }
    assert!(hits >= 18, "only {hits} of 20 stored vectors found themselves");
}
