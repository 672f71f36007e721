//! Many threads searching one reader.

use std::thread;

use crate::common::{TestIndex, random_rows};
use pqgraph::index::graph_path;
use pqgraph::{Distance, IndexReader};

#[test]
fn test_concurrent_searches_leave_no_pinned_pages() {
    let mut index = TestIndex::ingest("concurrent", random_rows(400, 16, 8), Distance::L2);
    index.params.max_connections_per_vertex = 24;
    index.build();
    let graph = graph_path(index.path(), "concurrent");
    let before = std::fs::read(&graph).unwrap();

    let mut params = index.reader_params(48);
    // A few pages only, so pins and evictions interleave across threads.
    params.cache_bytes = 4 * 4096;
    let reader = IndexReader::open(params).unwrap();
    let queries = random_rows(64, 16, 77);

    let expected: Vec<Vec<u32>> = queries
        .iter()
        .map(|q| {
            let mut out = Vec::new();
            reader.nearest(q, &mut out, 5).unwrap();
            out
        })
        .collect();

    thread::scope(|scope| {
        for worker in 0..8 {
            let reader = &reader;
            let queries = &queries;
            let expected = &expected;
            scope.spawn(move || {
                let mut out = Vec::new();
                for round in 0..4 {
                    for (i, q) in queries.iter().enumerate() {
                        if (i + worker + round) % 2 == 0 {
                            reader.nearest(q, &mut out, 5).unwrap();
                            assert_eq!(&out, &expected[i]);
                        }
                    }
                }
            });
        }
    });

    let stats = reader.cache_stats().unwrap();
    assert_eq!(stats.locked_pages, 0);
    assert!(stats.evictions > 0);
    assert_eq!(std::fs::read(&graph).unwrap(), before);
}
