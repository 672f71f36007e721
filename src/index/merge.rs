//! Merging per-partition edge lists into the global graph file.
//!
//! Each partition leaves a scratch file of records
//! `(global id: u32, count: u32, edges: count x u32)` in increasing global
//! order. A k-way merge over all files visits every global vertex once, in
//! strictly increasing order. A vertex present in several partitions gets
//! the union of its edge lists; when the union exceeds the degree bound it
//! is sampled uniformly down to the bound.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::debug;

use super::layout::GraphFileWriter;
use super::partition_graph::PartitionGraph;
use crate::error::{IndexError, IndexResult};
use crate::vector::VertexIndex;

/// Degree statistics of the merged graph.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MergeStats {
    pub vertices: usize,
    /// Vertices present in more than one partition.
    pub shared_vertices: usize,
    pub total_edges: usize,
    pub max_degree: usize,
}

impl MergeStats {
    pub fn average_degree(&self) -> f64 {
        if self.vertices == 0 {
            0.0
        } else {
            self.total_edges as f64 / self.vertices as f64
        }
    }
}

/// Writes the edges of `graph`, translated to global ids, to `path`.
pub fn write_partition_edges(graph: &PartitionGraph, path: &Path) -> IndexResult<()> {
    let write_err = |source| IndexError::FileWrite {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(write_err)?);
    let mut edges = Vec::new();
    for local in 0..graph.size() as VertexIndex {
        graph.neighbors_snapshot(local, &mut edges);
        writer
            .write_all(&graph.global_id(local).to_le_bytes())
            .map_err(write_err)?;
        writer
            .write_all(&(edges.len() as u32).to_le_bytes())
            .map_err(write_err)?;
        for &edge in &edges {
            writer
                .write_all(&graph.global_id(edge).to_le_bytes())
                .map_err(write_err)?;
        }
    }
    writer.flush().map_err(write_err)
}

/// Sequential reader over one partition edge file.
struct PartitionEdgeReader {
    path: PathBuf,
    reader: BufReader<File>,
    global: VertexIndex,
    edges: Vec<VertexIndex>,
}

impl PartitionEdgeReader {
    fn open(path: &Path) -> IndexResult<Self> {
        let file = File::open(path).map_err(|source| IndexError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            global: 0,
            edges: Vec::new(),
        })
    }

    /// Loads the next record; `false` at a clean end of file.
    fn advance(&mut self) -> IndexResult<bool> {
        let mut word = [0u8; 4];
        match self.reader.read_exact(&mut word) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(source) => {
                return Err(IndexError::FileRead {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        self.global = u32::from_le_bytes(word);

        let corrupt = |e: io::Error| IndexError::corrupt(&self.path, e.to_string());
        self.reader.read_exact(&mut word).map_err(corrupt)?;
        let count = u32::from_le_bytes(word) as usize;
        self.edges.clear();
        for _ in 0..count {
            self.reader.read_exact(&mut word).map_err(corrupt)?;
            self.edges.push(u32::from_le_bytes(word));
        }
        Ok(true)
    }
}

/// Unions `sets` into `out`, sampling down to `cap` when larger.
///
/// The order of first appearance is kept before sampling.
pub fn merge_edge_sets<G: Rng>(
    sets: &[&[VertexIndex]],
    cap: usize,
    rng: &mut G,
    out: &mut Vec<VertexIndex>,
) {
    out.clear();
    let mut seen = HashSet::new();
    for set in sets {
        out.extend(set.iter().copied().filter(|&edge| seen.insert(edge)));
    }
    if out.len() > cap {
        // Partial Fisher-Yates: the first `cap` slots become a uniform sample.
        for i in 0..cap {
            let j = rng.random_range(i..out.len());
            out.swap(i, j);
        }
        out.truncate(cap);
    }
}

/// Merges partition edge files into `graph`.
///
/// Fails with a protocol violation if the global ids do not come out
/// strictly increasing.
pub fn merge_partitions<G: Rng>(
    paths: &[PathBuf],
    graph: &mut GraphFileWriter,
    max_connections: usize,
    rng: &mut G,
) -> IndexResult<MergeStats> {
    let mut readers = paths
        .iter()
        .map(|p| PartitionEdgeReader::open(p))
        .collect::<IndexResult<Vec<_>>>()?;

    let mut heap = BinaryHeap::new();
    for (partition, reader) in readers.iter_mut().enumerate() {
        if reader.advance()? {
            heap.push(Reverse((reader.global, partition)));
        }
    }

    let mut stats = MergeStats::default();
    let mut previous: Option<VertexIndex> = None;
    let mut group = Vec::new();
    let mut merged = Vec::with_capacity(max_connections);

    while let Some(Reverse((global, first))) = heap.pop() {
        if previous.is_some_and(|p| p >= global) {
            return Err(IndexError::protocol(format!(
                "partition merge emitted vertex {global} after {previous:?}"
            )));
        }
        previous = Some(global);

        group.clear();
        group.push(first);
        while let Some(&Reverse((next, partition))) = heap.peek() {
            if next != global {
                break;
            }
            heap.pop();
            group.push(partition);
        }

        if let &[only] = group.as_slice() {
            let edges = &readers[only].edges;
            merged.clear();
            merged.extend_from_slice(&edges[..edges.len().min(max_connections)]);
        } else {
            let sets: Vec<&[VertexIndex]> =
                group.iter().map(|&p| readers[p].edges.as_slice()).collect();
            merge_edge_sets(&sets, max_connections, rng, &mut merged);
            stats.shared_vertices += 1;
        }
        // A union never adds a self-loop, but a corrupt input could.
        merged.retain(|&edge| edge != global);

        graph.write_edges(global, &merged);
        stats.vertices += 1;
        stats.total_edges += merged.len();
        stats.max_degree = stats.max_degree.max(merged.len());

        for &partition in &group {
            if readers[partition].advance()? {
                heap.push(Reverse((readers[partition].global, partition)));
            }
        }
    }

    debug!(
        vertices = stats.vertices,
        shared = stats.shared_vertices,
        "merged partition edge lists"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::layout::{GraphLayout, graph_path};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn write_records(path: &Path, records: &[(u32, Vec<u32>)]) {
        let mut bytes = Vec::new();
        for (global, edges) in records {
            bytes.extend_from_slice(&global.to_le_bytes());
            bytes.extend_from_slice(&(edges.len() as u32).to_le_bytes());
            for e in edges {
                bytes.extend_from_slice(&e.to_le_bytes());
            }
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn read_edges(path: &Path, layout: &GraphLayout, vertex: u32) -> Vec<u32> {
        let bytes = std::fs::read(path).unwrap();
        let start = layout.page_of(vertex) * layout.page_size;
        let mut edges = Vec::new();
        layout.record_edges(&bytes[start..start + layout.page_size], vertex, &mut edges);
        edges
    }

    #[test]
    fn test_union_of_shared_vertex() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut out = Vec::new();
        let (a, b): (&[u32], &[u32]) = (&[10, 11], &[11, 12]);
        merge_edge_sets(&[a, b], 8, &mut rng, &mut out);
        assert_eq!(out, vec![10, 11, 12]);
    }

    #[test]
    fn test_union_sampled_down_to_cap() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut out = Vec::new();
        let (a, b): (&[u32], &[u32]) = (&[10, 11], &[11, 12]);
        merge_edge_sets(&[a, b], 2, &mut rng, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| [10, 11, 12].contains(e)));
        assert_ne!(out[0], out[1]);
    }

    #[test]
    fn test_merge_two_partitions() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("p0.edges");
        let b = temp_dir.path().join("p1.edges");
        // Vertex 1 lives in both partitions with {0, 2} and {2, 3}.
        write_records(&a, &[(0, vec![1]), (1, vec![0, 2]), (2, vec![1])]);
        write_records(&b, &[(1, vec![2, 3]), (3, vec![1])]);

        let layout = GraphLayout::new(2, 4);
        let path = graph_path(temp_dir.path(), "g");
        let mut writer = GraphFileWriter::create(&path, layout, 4).unwrap();
        let stats =
            merge_partitions(&[a, b], &mut writer, 4, &mut StdRng::seed_from_u64(3)).unwrap();
        writer.finish().unwrap();

        assert_eq!(stats.vertices, 4);
        assert_eq!(stats.shared_vertices, 1);
        assert_eq!(read_edges(&path, &layout, 1), vec![0, 2, 3]);
        assert_eq!(read_edges(&path, &layout, 3), vec![1]);
    }

    #[test]
    fn test_out_of_order_partition_is_protocol_violation() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("p0.edges");
        write_records(&a, &[(2, vec![0]), (1, vec![0])]);

        let layout = GraphLayout::new(2, 4);
        let mut writer =
            GraphFileWriter::create(graph_path(temp_dir.path(), "g"), layout, 3).unwrap();
        assert!(matches!(
            merge_partitions(&[a], &mut writer, 4, &mut StdRng::seed_from_u64(0)),
            Err(IndexError::ProtocolViolation { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_merge_is_bounded_subset_of_union(
            a in prop::collection::vec(0u32..50, 0..20),
            b in prop::collection::vec(0u32..50, 0..20),
            cap in 1usize..12,
            seed in any::<u64>(),
        ) {
            let mut out = Vec::new();
            let mut rng = StdRng::seed_from_u64(seed);
            merge_edge_sets(&[a.as_slice(), b.as_slice()], cap, &mut rng, &mut out);

            let union: HashSet<u32> = a.iter().chain(&b).copied().collect();
            prop_assert_eq!(out.len(), union.len().min(cap));
            prop_assert!(out.iter().all(|e| union.contains(e)));
            let distinct: HashSet<u32> = out.iter().copied().collect();
            prop_assert_eq!(distinct.len(), out.len());
        }
    }
}
