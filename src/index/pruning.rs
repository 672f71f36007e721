//! Graph refinement: greedy search, robust prune and back-propagation.
//!
//! # Algorithm
//! For every vertex `v` of a partition:
//! 1. Greedy search from the medoid toward `v` with a bounded queue of
//!    exact distances; every vertex checked on the way joins the pool
//! 2. Robust prune the pool plus the current edges of `v` down to half the
//!    degree bound, leaving room for reverse edges
//! 3. Each kept neighbor `u` must consider `v` in turn: append when `u` has
//!    headroom, otherwise robust prune `u`'s edges plus `v`
//!
//! # Ownership
//! Vertex `v` belongs to worker `v % workers`. Only the owner writes the
//! edges of `v`, so reverse edges are sent to the owner's queue instead of
//! being applied in place. Readers of other workers still see consistent
//! edge lists through the per-vertex version guard.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Barrier;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::partition_graph::PartitionGraph;
use super::queue::BoundedGreedyVertexPriorityQueue;
use crate::display::PhaseGuard;
use crate::error::{IndexError, IndexResult, worker_panic};
use crate::vector::{DistanceFunction, VertexIndex};

/// Growth of the prune factor between rounds.
const ALPHA_STEP: f32 = 1.2;

/// Tuning of graph refinement.
#[derive(Debug, Clone, Copy)]
pub struct PruneParams {
    pub max_connections: usize,
    pub max_candidates: usize,
    /// Upper bound of the prune factor alpha.
    pub distance_multiplication: f32,
}

/// A reverse edge `candidate -> vertex` waiting for `vertex`'s owner.
#[derive(Debug, Clone, Copy)]
struct BackEdge {
    vertex: VertexIndex,
    candidate: VertexIndex,
}

/// Visited set stamped with a search epoch, cleared in O(1).
struct VisitedMarks {
    marks: Vec<u32>,
    epoch: u32,
}

impl VisitedMarks {
    fn new(size: usize) -> Self {
        Self {
            marks: vec![0; size],
            epoch: 0,
        }
    }

    fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.marks.fill(0);
            self.epoch = 1;
        }
    }

    /// Marks `vertex`, returning whether it was unvisited.
    fn insert(&mut self, vertex: VertexIndex) -> bool {
        let mark = &mut self.marks[vertex as usize];
        let fresh = *mark != self.epoch;
        *mark = self.epoch;
        fresh
    }
}

/// Reusable buffers of one worker.
pub struct SearchScratch {
    queue: BoundedGreedyVertexPriorityQueue,
    visited: VisitedMarks,
    neighbors: Vec<VertexIndex>,
    fresh: Vec<VertexIndex>,
    pool: Vec<(VertexIndex, f32)>,
    selected: Vec<VertexIndex>,
}

impl SearchScratch {
    pub fn new(vertices: usize, max_candidates: usize) -> Self {
        Self {
            queue: BoundedGreedyVertexPriorityQueue::new(max_candidates),
            visited: VisitedMarks::new(vertices),
            neighbors: Vec::new(),
            fresh: Vec::new(),
            pool: Vec::new(),
            selected: Vec::new(),
        }
    }

    /// Vertices checked by the last `greedy_search`, with their distances.
    pub fn pool(&self) -> &[(VertexIndex, f32)] {
        &self.pool
    }
}

/// Best-first search from the medoid toward `target`.
///
/// Leaves every checked vertex and its exact distance in `scratch.pool`.
pub fn greedy_search(
    graph: &PartitionGraph,
    distance: &dyn DistanceFunction,
    target: &[f32],
    scratch: &mut SearchScratch,
) {
    let SearchScratch {
        queue,
        visited,
        neighbors,
        fresh,
        pool,
        ..
    } = scratch;
    queue.clear();
    visited.reset();
    pool.clear();

    let start = graph.medoid();
    visited.insert(start);
    queue.add(start, distance.distance(target, graph.vector(start)), true, false);

    while let Some(position) = queue.next_not_checked() {
        queue.mark_checked(position);
        let entry = *queue.get(position);
        pool.push((entry.vertex, entry.distance));

        graph.neighbors_snapshot(entry.vertex, neighbors);
        fresh.clear();
        fresh.extend(neighbors.iter().copied().filter(|&n| visited.insert(n)));

        for chunk in fresh.chunks(4) {
            if let &[a, b, c, d] = chunk {
                let distances = distance.distance_batch4(
                    target,
                    [graph.vector(a), graph.vector(b), graph.vector(c), graph.vector(d)],
                );
                for (vertex, dist) in [a, b, c, d].into_iter().zip(distances) {
                    queue.add(vertex, dist, true, false);
                }
            } else {
                for &vertex in chunk {
                    queue.add(vertex, distance.distance(target, graph.vector(vertex)), true, false);
                }
            }
        }
    }
}

/// Selects a diverse subset of `candidates` as the edges of `target`.
///
/// Candidates are visited nearest first. A kept candidate `s` removes every
/// candidate `c` with `alpha * d(s, c) <= d(target, c)`. When a round ends
/// short of `limit`, alpha grows by 1.2 up to `max_alpha` and the
/// remaining candidates get another chance. The result is stored in
/// `out` with the first selected last.
pub fn robust_prune(
    graph: &PartitionGraph,
    distance: &dyn DistanceFunction,
    target: VertexIndex,
    candidates: &mut Vec<(VertexIndex, f32)>,
    limit: usize,
    max_alpha: f32,
    out: &mut Vec<VertexIndex>,
) {
    candidates.retain(|&(vertex, _)| vertex != target);
    // One entry per vertex, its smallest distance, before ordering by distance.
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    candidates.dedup_by_key(|c| c.0);
    candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    out.clear();

    let len = candidates.len();
    let mut selected = vec![false; len];
    let mut pruned = vec![false; len];
    let max_alpha = max_alpha.max(1.0);
    let mut alpha = 1.0f32;

    loop {
        // Re-derive what the current selection prunes at this alpha.
        for (i, &(vertex, dist)) in candidates.iter().enumerate() {
            pruned[i] = selected[i]
                || out.iter().any(|&s| {
                    alpha * distance.distance(graph.vector(s), graph.vector(vertex)) <= dist
                });
        }

        for i in 0..len {
            if out.len() >= limit {
                break;
            }
            if pruned[i] {
                continue;
            }
            let (kept, _) = candidates[i];
            selected[i] = true;
            pruned[i] = true;
            out.push(kept);

            let kept_vector = graph.vector(kept);
            for j in i + 1..len {
                if pruned[j] {
                    continue;
                }
                let (other, dist) = candidates[j];
                if alpha * distance.distance(kept_vector, graph.vector(other)) <= dist {
                    pruned[j] = true;
                }
            }
        }

        if out.len() >= limit || alpha >= max_alpha {
            break;
        }
        alpha = (alpha * ALPHA_STEP).min(max_alpha);
    }

    out.reverse();
}

/// Lets `vertex` consider `candidate` as a new neighbor.
fn accept_back_edge(
    graph: &PartitionGraph,
    distance: &dyn DistanceFunction,
    params: &PruneParams,
    edge: BackEdge,
    scratch: &mut SearchScratch,
) -> IndexResult<()> {
    let BackEdge { vertex, candidate } = edge;
    graph.neighbors_snapshot(vertex, &mut scratch.neighbors);
    if scratch.neighbors.contains(&candidate) {
        return Ok(());
    }
    if scratch.neighbors.len() < params.max_connections
        && graph.push_neighbor(vertex, candidate)?
    {
        return Ok(());
    }

    let origin = graph.vector(vertex);
    scratch.pool.clear();
    scratch.pool.extend(
        scratch
            .neighbors
            .iter()
            .chain(std::iter::once(&candidate))
            .map(|&n| (n, distance.distance(origin, graph.vector(n)))),
    );
    robust_prune(
        graph,
        distance,
        vertex,
        &mut scratch.pool,
        params.max_connections,
        params.distance_multiplication,
        &mut scratch.selected,
    );
    graph.set_neighbors(vertex, &scratch.selected)
}

struct Worker<'a> {
    id: usize,
    workers: usize,
    graph: &'a PartitionGraph,
    distance: &'a dyn DistanceFunction,
    params: &'a PruneParams,
    senders: &'a [Sender<BackEdge>],
    inbox: Receiver<BackEdge>,
    progress: &'a PhaseGuard<'a>,
}

impl Worker<'_> {
    fn drain(&self, scratch: &mut SearchScratch) -> IndexResult<()> {
        while let Ok(edge) = self.inbox.try_recv() {
            accept_back_edge(self.graph, self.distance, self.params, edge, scratch)?;
        }
        Ok(())
    }

    fn forward_pass(&self, scratch: &mut SearchScratch, rng: &mut StdRng) -> IndexResult<()> {
        let graph = self.graph;
        let limit = (self.params.max_connections / 2).max(1);
        let mut owned: Vec<VertexIndex> = (self.id..graph.size())
            .step_by(self.workers)
            .map(|v| v as VertexIndex)
            .collect();
        owned.shuffle(rng);

        for vertex in owned {
            self.drain(scratch)?;

            let origin = graph.vector(vertex);
            greedy_search(graph, self.distance, origin, scratch);
            graph.neighbors_snapshot(vertex, &mut scratch.neighbors);
            for &n in &scratch.neighbors {
                scratch
                    .pool
                    .push((n, self.distance.distance(origin, graph.vector(n))));
            }
            robust_prune(
                graph,
                self.distance,
                vertex,
                &mut scratch.pool,
                limit,
                self.params.distance_multiplication,
                &mut scratch.selected,
            );
            graph.set_neighbors(vertex, &scratch.selected)?;

            for &neighbor in &scratch.selected {
                self.senders[neighbor as usize % self.workers]
                    .send(BackEdge {
                        vertex: neighbor,
                        candidate: vertex,
                    })
                    .map_err(|_| IndexError::WorkerFailed {
                        phase: "pruning",
                        cause: "back-propagation queue disconnected".to_string(),
                    })?;
            }
            self.progress.report(1);
        }
        Ok(())
    }

    fn run(self, barrier: &Barrier, seed: u64) -> IndexResult<()> {
        let mut scratch = SearchScratch::new(self.graph.size(), self.params.max_candidates);
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(self.id as u64));

        // Every worker must reach the barrier, even after a failure.
        let forward = panic::catch_unwind(AssertUnwindSafe(|| {
            self.forward_pass(&mut scratch, &mut rng)
        }))
        .unwrap_or_else(|payload| Err(worker_panic("pruning", payload)));
        barrier.wait();
        forward?;

        // All forward edges were sent before the barrier and accepting a
        // reverse edge never sends another, so the inbox drains to empty.
        self.drain(&mut scratch)
    }
}

/// Refines every edge list of `graph` on `workers` OS threads.
pub fn prune_index(
    graph: &PartitionGraph,
    distance: &dyn DistanceFunction,
    params: &PruneParams,
    workers: usize,
    seed: u64,
    progress: &PhaseGuard<'_>,
) -> IndexResult<()> {
    let n = graph.size();
    if n <= 1 {
        return Ok(());
    }
    let workers = workers.clamp(1, n);
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..workers).map(|_| unbounded()).unzip();
    let barrier = Barrier::new(workers);

    thread::scope(|scope| {
        let handles: Vec<_> = receivers
            .into_iter()
            .enumerate()
            .map(|(id, inbox)| {
                let worker = Worker {
                    id,
                    workers,
                    graph,
                    distance,
                    params,
                    senders: &senders,
                    inbox,
                    progress,
                };
                let barrier = &barrier;
                scope.spawn(move || worker.run(barrier, seed))
            })
            .collect();

        // Join every worker before reporting, so no panic escapes the scope.
        let results: Vec<IndexResult<()>> = handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|payload| Err(worker_panic("pruning", payload)))
            })
            .collect();
        results.into_iter().collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::ProgressStack;
    use crate::vector::{InMemoryVectors, L2Distance};
    use rand::Rng;
    use tempfile::TempDir;

    fn build_graph(
        temp_dir: &TempDir,
        rows: &[Vec<f32>],
        max_connections: usize,
    ) -> PartitionGraph {
        let vectors = InMemoryVectors::from_rows(rows).unwrap();
        let mut graph = PartitionGraph::create(
            temp_dir.path(),
            (0..rows.len() as u32).collect(),
            rows[0].len(),
            max_connections,
        )
        .unwrap();
        graph.load_vectors(&vectors);
        graph
    }

    #[test]
    fn test_robust_prune_keeps_diverse_neighbors() {
        let temp_dir = TempDir::new().unwrap();
        // 0 at origin; 1 and 2 close together on the x axis; 3 on the y axis.
        let rows = vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![1.1, 0.0],
            vec![0.0, 1.5],
        ];
        let graph = build_graph(&temp_dir, &rows, 4);
        let mut candidates: Vec<(u32, f32)> = (0..4)
            .map(|v| (v, L2Distance.distance(&rows[0], &rows[v as usize])))
            .collect();
        candidates.push((1, 1.0));

        let mut out = Vec::new();
        robust_prune(&graph, &L2Distance, 0, &mut candidates, 4, 1.0, &mut out);

        // 2 is dominated by 1; result is reversed.
        assert_eq!(out, vec![3, 1]);
    }

    #[test]
    fn test_robust_prune_drops_separated_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let rows = vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![-1.0, 0.0],
        ];
        let graph = build_graph(&temp_dir, &rows, 4);
        // Two copies of 1 differing in the last bits, with 2 between them.
        let mut candidates = vec![(1, 1.0), (2, 1.000_000_1), (1, 1.000_000_2), (3, 1.5)];

        let mut out = Vec::new();
        robust_prune(&graph, &L2Distance, 0, &mut candidates, 4, 1.0, &mut out);

        assert_eq!(candidates, vec![(1, 1.0), (2, 1.000_000_1), (3, 1.5)]);
        let mut unique = out.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), out.len());
    }

    #[test]
    fn test_robust_prune_respects_limit() {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<Vec<f32>> = (0..8)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::TAU / 8.0;
                vec![angle.cos(), angle.sin()]
            })
            .chain(std::iter::once(vec![0.0, 0.0]))
            .collect();
        let graph = build_graph(&temp_dir, &rows, 8);
        let mut candidates: Vec<(u32, f32)> = (0..8)
            .map(|v| (v, L2Distance.distance(&rows[8], &rows[v as usize])))
            .collect();

        let mut out = Vec::new();
        robust_prune(&graph, &L2Distance, 8, &mut candidates, 3, 1.2, &mut out);
        assert_eq!(out.len(), 3);
        assert!(!out.contains(&8));
    }

    #[test]
    fn test_greedy_search_reaches_target() {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<Vec<f32>> = (0..30).map(|i| vec![i as f32, 0.0]).collect();
        let graph = build_graph(&temp_dir, &rows, 4);
        graph.init_random_edges(&mut StdRng::seed_from_u64(1)).unwrap();

        let mut scratch = SearchScratch::new(30, 64);
        greedy_search(&graph, &L2Distance, &rows[17], &mut scratch);
        assert!(scratch.pool().iter().any(|&(v, d)| v == 17 && d == 0.0));
    }

    #[test]
    fn test_prune_index_invariants() {
        let temp_dir = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let rows: Vec<Vec<f32>> = (0..300)
            .map(|_| (0..6).map(|_| rng.random_range(-1.0f32..1.0)).collect())
            .collect();
        let graph = build_graph(&temp_dir, &rows, 12);
        graph.init_random_edges(&mut rng).unwrap();

        let params = PruneParams {
            max_connections: 12,
            max_candidates: 32,
            distance_multiplication: 1.2,
        };
        let stack = ProgressStack::disabled();
        let phase = stack.push("prune", 300);
        prune_index(&graph, &L2Distance, &params, 4, 9, &phase).unwrap();
        assert_eq!(phase.completed(), 300);

        let mut edges = Vec::new();
        for v in 0..300u32 {
            graph.neighbors_snapshot(v, &mut edges);
            assert!(!edges.is_empty());
            assert!(edges.len() <= 12);
            assert!(!edges.contains(&v));
            assert!(edges.iter().all(|&e| e < 300));
            let mut dedup = edges.clone();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), edges.len(), "duplicate edge at {v}");
            // Every vertex is released after refinement.
            assert_eq!(graph.versions().version(v as usize) % 2, 0);
        }
    }
}
