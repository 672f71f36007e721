//! Four corners of a unit square with a degree bound of two.

use crate::common::TestIndex;
use pqgraph::Distance;

fn square() -> TestIndex {
    let rows = vec![
        vec![0.0, 0.0],
        vec![1.0, 0.0],
        vec![1.0, 1.0],
        vec![0.0, 1.0],
    ];
    let mut index = TestIndex::ingest("square", rows, Distance::L2);
    index.params.max_connections_per_vertex = 2;
    index.params.max_candidates = 8;
    index.params.parallel_threads = 1;
    index
}

/// Corner diagonally opposite `v`.
fn diagonal(v: u32) -> u32 {
    (v + 2) % 4
}

#[test]
fn test_square_has_no_diagonal_edges() {
    let index = square();
    let report = index.build();
    assert_eq!(report.vertex_count, 4);
    assert_eq!(report.partitions, 1);

    for (v, edges) in index.edges().iter().enumerate() {
        let v = v as u32;
        assert!(!edges.is_empty(), "vertex {v} has no edges");
        assert!(edges.len() <= 2);
        assert!(!edges.contains(&v), "vertex {v} links to itself");
        assert!(
            !edges.contains(&diagonal(v)),
            "vertex {v} links to its diagonal: {edges:?}"
        );
        for &n in edges {
            assert!(n == (v + 1) % 4 || n == (v + 3) % 4);
        }
    }
}
