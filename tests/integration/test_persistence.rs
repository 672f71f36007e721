//! On-disk state after a build.

use crate::common::{TestIndex, random_rows};
use pqgraph::index::{IndexMetadata, metadata_path};
use pqgraph::vector::vectors_path;
use pqgraph::{Distance, IndexReader};

#[test]
fn test_graph_invariants_after_build() {
    let index = TestIndex::ingest("invariants", random_rows(300, 8, 21), Distance::L2);
    let report = index.build();
    let n = index.rows.len() as u32;
    let max = index.params.max_connections_per_vertex;

    let edges = index.edges();
    assert_eq!(edges.len(), 300);
    for (v, list) in edges.iter().enumerate() {
        assert!(list.len() <= max, "vertex {v} has {} edges", list.len());
        assert!(!list.contains(&(v as u32)), "vertex {v} has a self-loop");
        assert!(list.iter().all(|&e| e < n), "vertex {v} links outside the graph");
    }
    assert!(report.max_degree <= max);
    assert!(report.average_degree > 0.0);
    assert!((report.medoid as usize) < 300);
}

#[test]
fn test_raw_vectors_are_removed_and_vectors_persisted() {
    let index = TestIndex::ingest("persisted", random_rows(64, 4, 2), Distance::L2);
    index.build();
    assert!(!vectors_path(index.path(), "persisted").exists());

    let reader = IndexReader::open(index.reader_params(16)).unwrap();
    for (id, row) in index.rows.iter().enumerate() {
        assert_eq!(reader.exact_distance(row, id as u32).unwrap(), 0.0);
    }
}

#[test]
fn test_quantizer_state_round_trips_bit_for_bit() {
    let index = TestIndex::ingest("roundtrip", random_rows(150, 8, 4), Distance::L2);
    index.build();

    let path = metadata_path(index.path(), "roundtrip");
    let original = std::fs::read(&path).unwrap();
    let (metadata, quantizer) = IndexMetadata::read(&path, 8).unwrap();

    let copy = index.path().join("copy.data");
    metadata.write(&copy, &quantizer).unwrap();
    assert_eq!(std::fs::read(&copy).unwrap(), original);

    let reader = IndexReader::open(index.reader_params(16)).unwrap();
    assert_eq!(reader.quantizer(), &quantizer);
    assert_eq!(reader.medoid(), metadata.medoid);
    assert_eq!(reader.vertex_count(), 150);
}
