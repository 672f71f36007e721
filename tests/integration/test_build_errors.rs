//! Failure modes of building and opening an index.

use crate::common::{TestIndex, random_rows};
use pqgraph::display::ProgressStack;
use pqgraph::index::{graph_path, metadata_path};
use pqgraph::vector::vectors_path;
use pqgraph::{Distance, IndexBuilder, IndexError, IndexReader};

#[test]
fn test_zero_vectors_is_a_successful_no_op() {
    let index = TestIndex::ingest("empty", random_rows(1, 4, 0), Distance::L2);
    // Truncate the file to zero records.
    std::fs::write(vectors_path(index.path(), "empty"), Vec::<u8>::new()).unwrap();

    let report = index.build();
    assert_eq!(report.vertex_count, 0);
    assert!(!graph_path(index.path(), "empty").exists());
    assert!(!metadata_path(index.path(), "empty").exists());
}

#[test]
fn test_non_divisible_compression_ratio_fails_before_io() {
    let mut index = TestIndex::ingest("ratio", random_rows(20, 6, 0), Distance::L2);
    index.params.compression_ratio = 5;

    let err = IndexBuilder::new(index.params.clone())
        .build(&ProgressStack::disabled())
        .unwrap_err();
    assert!(matches!(err, IndexError::InvalidConfiguration { .. }));
    assert_eq!(err.status_code(), "INVALID_CONFIGURATION");
    assert!(vectors_path(index.path(), "ratio").exists());
    assert!(!graph_path(index.path(), "ratio").exists());
}

#[test]
fn test_more_codebooks_than_dimensions_is_rejected() {
    let mut index = TestIndex::ingest("codebooks", random_rows(20, 4, 0), Distance::L2);
    // 4 * 4 / 2 = 8 codebooks for 4 dimensions
    index.params.compression_ratio = 2;
    let err = IndexBuilder::new(index.params.clone())
        .build(&ProgressStack::disabled())
        .unwrap_err();
    assert!(matches!(err, IndexError::InvalidConfiguration { .. }));
}

#[test]
fn test_reader_rejects_mismatched_dimension() {
    let index = TestIndex::ingest("mismatch", random_rows(50, 8, 0), Distance::L2);
    index.build();

    let mut params = index.reader_params(16);
    params.dimension = 16;
    assert!(matches!(
        IndexReader::open(params),
        Err(IndexError::CorruptOrIncompatibleIndex { .. })
    ));
}

#[test]
fn test_reader_rejects_truncated_metadata() {
    let index = TestIndex::ingest("truncated", random_rows(50, 8, 0), Distance::L2);
    index.build();

    let path = metadata_path(index.path(), "truncated");
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
    assert!(matches!(
        IndexReader::open(index.reader_params(16)),
        Err(IndexError::CorruptOrIncompatibleIndex { .. })
    ));
}

#[test]
fn test_closed_reader_refuses_queries() {
    let index = TestIndex::ingest("closed", random_rows(50, 8, 0), Distance::L2);
    index.build();

    let mut reader = IndexReader::open(index.reader_params(16)).unwrap();
    let mut result = Vec::new();
    reader.nearest(&index.rows[0], &mut result, 3).unwrap();
    assert_eq!(result.len(), 3);

    reader.close();
    assert!(matches!(
        reader.nearest(&index.rows[0], &mut result, 3),
        Err(IndexError::Closed)
    ));
    assert!(matches!(
        reader.exact_nearest(&index.rows[0], 3),
        Err(IndexError::Closed)
    ));
    assert!(reader.cache_stats().is_none());
}
