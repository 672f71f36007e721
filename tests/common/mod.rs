//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;

use pqgraph::display::ProgressStack;
use pqgraph::index::{BuildParams, BuildReport, GraphLayout, IndexBuilder, ReaderParams};
use pqgraph::{Distance, RawVectorWriter, VectorDimension};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// An index directory with its ingested rows kept for brute-force checks.
pub struct TestIndex {
    pub dir: TempDir,
    pub name: String,
    pub rows: Vec<Vec<f32>>,
    pub params: BuildParams,
}

impl TestIndex {
    /// Ingests `rows` and prepares default build parameters.
    pub fn ingest(name: &str, rows: Vec<Vec<f32>>, distance: Distance) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let dimension = rows[0].len();
        let mut writer = RawVectorWriter::open(
            dir.path(),
            name,
            VectorDimension::new(dimension).expect("valid dimension"),
            distance.search_function(),
        )
        .expect("Failed to open vector file");
        writer
            .append_all(rows.iter().map(Vec::as_slice))
            .expect("Failed to append vectors");
        writer.finish().expect("Failed to flush vector file");

        let params = BuildParams {
            name: name.to_string(),
            dimension,
            index_dir: dir.path().to_path_buf(),
            scratch_dir: None,
            memory_budget_bytes: 64 << 20,
            max_connections_per_vertex: 16,
            max_candidates: 64,
            distance_multiplication: 1.2,
            compression_ratio: 4,
            distance,
            parallel_threads: 4,
            seed: 42,
        };

        Self {
            dir,
            name: name.to_string(),
            rows,
            params,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn build(&self) -> BuildReport {
        IndexBuilder::new(self.params.clone())
            .build(&ProgressStack::disabled())
            .expect("Failed to build index")
    }

    pub fn reader_params(&self, max_candidates: usize) -> ReaderParams {
        ReaderParams {
            name: self.name.clone(),
            dimension: self.params.dimension,
            index_dir: self.params.index_dir.clone(),
            max_connections_per_vertex: self.params.max_connections_per_vertex,
            max_candidates,
            compression_ratio: self.params.compression_ratio,
            cache_bytes: 1 << 20,
            distance: self.params.distance,
        }
    }

    pub fn layout(&self) -> GraphLayout {
        GraphLayout::new(self.params.dimension, self.params.max_connections_per_vertex)
    }

    /// Edge lists of every vertex, read straight from the graph file.
    pub fn edges(&self) -> Vec<Vec<u32>> {
        let layout = self.layout();
        let path = pqgraph::index::graph_path(self.path(), &self.name);
        let bytes = std::fs::read(path).expect("Failed to read graph file");
        (0..self.rows.len() as u32)
            .map(|v| {
                let start = layout.page_of(v) * layout.page_size;
                let mut edges = Vec::new();
                layout.record_edges(&bytes[start..start + layout.page_size], v, &mut edges);
                edges
            })
            .collect()
    }
}

pub fn random_rows(count: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..dimension).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect()
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Ids of the `k` rows closest to `query` under squared L2.
pub fn brute_force(rows: &[Vec<f32>], query: &[f32], k: usize) -> Vec<u32> {
    let mut scored: Vec<(f32, u32)> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| (squared_l2(row, query), i as u32))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(k).map(|(_, i)| i).collect()
}
