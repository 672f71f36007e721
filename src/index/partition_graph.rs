//! In-memory proximity graph of one partition.
//!
//! Vertices are addressed by local index; `global_ids` maps them back to
//! their global index and is sorted ascending, so walking local indices
//! walks global indices in order. Edge lists live in an `MmapArena` and
//! are guarded by a `VersionGuard`.

use std::path::Path;
use std::sync::atomic::Ordering;

use rand::Rng;
use rand::seq::SliceRandom;

use super::arena::MmapArena;
use super::version::VersionGuard;
use crate::error::IndexResult;
use crate::vector::{VectorReader, VertexIndex};

pub struct PartitionGraph {
    arena: MmapArena,
    versions: VersionGuard,
    global_ids: Vec<VertexIndex>,
    max_connections: usize,
    medoid: VertexIndex,
}

impl PartitionGraph {
    /// Allocates a graph for the vertices `global_ids` with no edges.
    pub fn create(
        scratch_dir: &Path,
        global_ids: Vec<VertexIndex>,
        dimension: usize,
        max_connections: usize,
    ) -> IndexResult<Self> {
        debug_assert!(global_ids.windows(2).all(|w| w[0] < w[1]));
        let arena = MmapArena::create(scratch_dir, global_ids.len(), dimension, max_connections)?;
        Ok(Self {
            arena,
            versions: VersionGuard::new(global_ids.len()),
            global_ids,
            max_connections,
            medoid: 0,
        })
    }

    /// Copies every member vector out of the global vector set.
    pub fn load_vectors<R: VectorReader + ?Sized>(&mut self, reader: &R) {
        let dim = self.arena.dimension();
        let ids = &self.global_ids;
        let vectors = self.arena.vectors_mut();
        for (local, &global) in ids.iter().enumerate() {
            vectors[local * dim..(local + 1) * dim].copy_from_slice(reader.read(global as usize));
        }
    }

    pub fn size(&self) -> usize {
        self.global_ids.len()
    }

    pub fn dimension(&self) -> usize {
        self.arena.dimension()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn vector(&self, local: VertexIndex) -> &[f32] {
        self.arena.vector(local as usize)
    }

    pub fn global_id(&self, local: VertexIndex) -> VertexIndex {
        self.global_ids[local as usize]
    }

    pub fn global_ids(&self) -> &[VertexIndex] {
        &self.global_ids
    }

    pub fn medoid(&self) -> VertexIndex {
        self.medoid
    }

    pub fn set_medoid(&mut self, local: VertexIndex) {
        self.medoid = local;
    }

    pub fn versions(&self) -> &VersionGuard {
        &self.versions
    }

    /// Copies the current edges of `vertex` into `out`.
    pub fn neighbors_snapshot(&self, vertex: VertexIndex, out: &mut Vec<VertexIndex>) {
        let slot = self.arena.edge_slot(vertex as usize);
        self.versions.read_consistent(vertex as usize, || {
            out.clear();
            let count = (slot[0].load(Ordering::Relaxed) as usize).min(self.max_connections);
            out.extend(slot[1..=count].iter().map(|e| e.load(Ordering::Relaxed)));
        });
    }

    pub fn degree(&self, vertex: VertexIndex) -> usize {
        let slot = self.arena.edge_slot(vertex as usize);
        self.versions
            .read_consistent(vertex as usize, || slot[0].load(Ordering::Relaxed) as usize)
    }

    /// Replaces the edges of `vertex`; extra edges beyond the bound are dropped.
    pub fn set_neighbors(&self, vertex: VertexIndex, neighbors: &[VertexIndex]) -> IndexResult<()> {
        let count = neighbors.len().min(self.max_connections);
        let slot = self.arena.edge_slot(vertex as usize);
        self.versions.acquire(vertex as usize)?;
        for (cell, &neighbor) in slot[1..=count].iter().zip(neighbors) {
            cell.store(neighbor, Ordering::Relaxed);
        }
        slot[0].store(count as u32, Ordering::Relaxed);
        self.versions.release(vertex as usize)
    }

    /// Appends `neighbor` if `vertex` has headroom; returns whether it did.
    pub fn push_neighbor(&self, vertex: VertexIndex, neighbor: VertexIndex) -> IndexResult<bool> {
        let slot = self.arena.edge_slot(vertex as usize);
        self.versions.acquire(vertex as usize)?;
        let count = slot[0].load(Ordering::Relaxed) as usize;
        let pushed = count < self.max_connections;
        if pushed {
            slot[1 + count].store(neighbor, Ordering::Relaxed);
            slot[0].store(count as u32 + 1, Ordering::Relaxed);
        }
        self.versions.release(vertex as usize)?;
        Ok(pushed)
    }

    /// Gives every vertex `min(size - 1, max_connections)` distinct random
    /// out-edges, never itself.
    ///
    /// Targets are consumed from a shuffled permutation of all vertices,
    /// reshuffled whenever it runs out.
    pub fn init_random_edges<G: Rng>(&self, rng: &mut G) -> IndexResult<()> {
        let n = self.size();
        let degree = n.saturating_sub(1).min(self.max_connections);
        if degree == 0 {
            return Ok(());
        }

        let mut permutation: Vec<VertexIndex> = (0..n as VertexIndex).collect();
        permutation.shuffle(rng);
        let mut cursor = 0;
        let mut edges = Vec::with_capacity(degree);

        for vertex in 0..n as VertexIndex {
            edges.clear();
            while edges.len() < degree {
                if cursor == n {
                    permutation.shuffle(rng);
                    cursor = 0;
                }
                let candidate = permutation[cursor];
                cursor += 1;
                if candidate != vertex && !edges.contains(&candidate) {
                    edges.push(candidate);
                }
            }
            self.set_neighbors(vertex, &edges)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::InMemoryVectors;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn graph(temp_dir: &TempDir, n: u32, max_connections: usize) -> PartitionGraph {
        PartitionGraph::create(temp_dir.path(), (0..n).map(|i| i * 3).collect(), 2, max_connections)
            .unwrap()
    }

    #[test]
    fn test_load_vectors_by_global_id() {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<Vec<f32>> = (0..9).map(|i| vec![i as f32, -(i as f32)]).collect();
        let vectors = InMemoryVectors::from_rows(&rows).unwrap();

        let mut graph = graph(&temp_dir, 3, 4);
        graph.load_vectors(&vectors);
        assert_eq!(graph.vector(1), &[3.0, -3.0]);
        assert_eq!(graph.vector(2), &[6.0, -6.0]);
        assert_eq!(graph.global_id(2), 6);
    }

    #[test]
    fn test_random_edges_are_distinct_and_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        for (n, max) in [(1u32, 4usize), (2, 4), (5, 4), (40, 6)] {
            let graph = graph(&temp_dir, n, max);
            graph.init_random_edges(&mut rng).unwrap();

            let expected = (n as usize - 1).min(max);
            let mut edges = Vec::new();
            for v in 0..n {
                graph.neighbors_snapshot(v, &mut edges);
                assert_eq!(edges.len(), expected);
                assert!(!edges.contains(&v));
                let mut dedup = edges.clone();
                dedup.sort_unstable();
                dedup.dedup();
                assert_eq!(dedup.len(), edges.len());
                assert!(edges.iter().all(|&e| e < n));
            }
        }
    }

    #[test]
    fn test_push_respects_degree_bound() {
        let temp_dir = TempDir::new().unwrap();
        let graph = graph(&temp_dir, 4, 2);
        assert!(graph.push_neighbor(0, 1).unwrap());
        assert!(graph.push_neighbor(0, 2).unwrap());
        assert!(!graph.push_neighbor(0, 3).unwrap());
        assert_eq!(graph.degree(0), 2);

        graph.set_neighbors(0, &[3, 2, 1]).unwrap();
        let mut edges = Vec::new();
        graph.neighbors_snapshot(0, &mut edges);
        assert_eq!(edges, vec![3, 2]);
    }
}
