//! Search over a built index.
//!
//! `nearest` walks the graph from the medoid with a bounded candidate queue.
//! Neighbors enter the queue with a PQ estimate; before a candidate is
//! expanded its estimate is replaced by the exact distance read from its
//! graph page, four candidates at a time. Entries with an exact distance
//! keep their page pinned in the `DiskCache` until they leave the queue or
//! the search ends.
//!
//! `nearest` takes `&self` and may run on many threads at once; `close`
//! takes `&mut self`, so no search can be in flight when it runs.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::disk_cache::{CacheStats, DiskCache};
use super::layout::{GraphLayout, graph_path};
use super::metadata::{IndexMetadata, metadata_path};
use super::queue::{BoundedGreedyVertexPriorityQueue, Insertion};
use crate::error::{IndexError, IndexResult};
use crate::vector::{
    Distance, DistanceFunction, PqQuantizer, VectorDimension, VectorError, VertexIndex,
    quantizer_count,
};

/// Candidate pages prefetched after each expansion.
const PREFETCH_BATCH: usize = 4;

/// Parameters needed to open an index; they must match the build.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderParams {
    pub name: String,
    pub dimension: usize,
    pub index_dir: PathBuf,
    pub max_connections_per_vertex: usize,
    /// Candidate queue capacity of a search
    pub max_candidates: usize,
    pub compression_ratio: usize,
    pub cache_bytes: usize,
    pub distance: Distance,
}

pub struct IndexReader {
    name: String,
    dimension: usize,
    max_candidates: usize,
    medoid: VertexIndex,
    vertex_count: usize,
    quantizer: PqQuantizer,
    distance: &'static dyn DistanceFunction,
    cache: Option<DiskCache>,
}

/// Per-call search state.
struct SearchState {
    queue: BoundedGreedyVertexPriorityQueue,
    visited: HashSet<VertexIndex>,
    table: Vec<f32>,
    batch: Vec<usize>,
    neighbors: Vec<VertexIndex>,
    fresh: Vec<VertexIndex>,
    prefetch: Vec<usize>,
}

impl SearchState {
    fn new(capacity: usize, table_len: usize) -> Self {
        Self {
            queue: BoundedGreedyVertexPriorityQueue::new(capacity),
            visited: HashSet::new(),
            table: vec![0.0; table_len],
            batch: Vec::with_capacity(4),
            neighbors: Vec::new(),
            fresh: Vec::with_capacity(4),
            prefetch: Vec::with_capacity(PREFETCH_BATCH),
        }
    }
}

/// Drops one pin per vertex on a path that is already failing.
fn release_pins(cache: &DiskCache, vertices: &[VertexIndex]) {
    for &vertex in vertices {
        if let Err(e) = cache.unpin_vertex(vertex) {
            warn!(vertex, error = %e, "failed to release page pin");
        }
    }
}

impl IndexReader {
    /// Opens the index `name` in `index_dir`.
    ///
    /// Fails with `CorruptOrIncompatibleIndex` when the stored files do not
    /// match the dimension, compression ratio or degree bound.
    pub fn open(params: ReaderParams) -> IndexResult<Self> {
        VectorDimension::new(params.dimension)?;
        if params.max_candidates == 0 {
            return Err(IndexError::invalid_config("max_candidates must be at least 1"));
        }
        let expected_quantizers = quantizer_count(params.dimension, params.compression_ratio)
            .map_err(|e| IndexError::invalid_config(e.to_string()))?;

        let data_path = metadata_path(&params.index_dir, &params.name);
        let (metadata, quantizer) = IndexMetadata::read(&data_path, params.dimension)?;
        if quantizer.quantizer_count() != expected_quantizers {
            return Err(IndexError::corrupt(
                &data_path,
                format!(
                    "index has {} quantizers, compression ratio {} implies {expected_quantizers}",
                    quantizer.quantizer_count(),
                    params.compression_ratio
                ),
            ));
        }

        let layout = GraphLayout::new(params.dimension, params.max_connections_per_vertex);
        let cache = DiskCache::open(
            &graph_path(&params.index_dir, &params.name),
            layout,
            metadata.vertex_count,
            params.cache_bytes,
        )?;

        debug!(
            name = %params.name,
            vertices = metadata.vertex_count,
            medoid = metadata.medoid,
            cache_pages = cache.capacity(),
            "opened index"
        );

        Ok(Self {
            name: params.name,
            dimension: params.dimension,
            max_candidates: params.max_candidates,
            medoid: metadata.medoid,
            vertex_count: metadata.vertex_count,
            quantizer,
            distance: params.distance.search_function(),
            cache: Some(cache),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn medoid(&self) -> VertexIndex {
        self.medoid
    }

    pub fn quantizer(&self) -> &PqQuantizer {
        &self.quantizer
    }

    pub fn is_closed(&self) -> bool {
        self.cache.is_none()
    }

    /// Cache counters, `None` once closed.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(DiskCache::stats)
    }

    /// Releases the graph mapping and cached pages.
    pub fn close(&mut self) {
        if let Some(cache) = self.cache.take() {
            let locked = cache.locked_pages();
            if locked > 0 {
                warn!(name = %self.name, locked, "closing index with pinned pages");
            }
        }
    }

    fn cache(&self) -> IndexResult<&DiskCache> {
        self.cache.as_ref().ok_or(IndexError::Closed)
    }

    /// Preprocessed copy of `query`.
    fn prepare_query(&self, query: &[f32]) -> IndexResult<Vec<f32>> {
        if query.len() != self.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            }
            .into());
        }
        let mut query = query.to_vec();
        self.distance.pre_process(&mut query);
        Ok(query)
    }

    /// Writes the ids of up to `k` approximate nearest neighbors of `query`
    /// into `result`, closest first.
    pub fn nearest(
        &self,
        query: &[f32],
        result: &mut Vec<VertexIndex>,
        k: usize,
    ) -> IndexResult<()> {
        let cache = self.cache()?;
        let query = self.prepare_query(query)?;
        result.clear();
        if self.vertex_count == 0 || k == 0 {
            return Ok(());
        }

        let mut state = SearchState::new(
            self.max_candidates.max(k),
            self.quantizer.lookup_table_len(),
        );
        self.quantizer
            .build_distance_lookup_table(&query, &mut state.table, self.distance);

        let outcome = self.search(cache, &query, &mut state);

        // Every pin is released, also when the search failed.
        let mut released = Ok(());
        for vertex in state.queue.drain_locked() {
            if let Err(e) = cache.unpin_vertex(vertex) {
                released = Err(e);
            }
        }
        outcome?;
        released?;

        state.queue.vertices_into(result, k);
        Ok(())
    }

    fn search(
        &self,
        cache: &DiskCache,
        query: &[f32],
        state: &mut SearchState,
    ) -> IndexResult<()> {
        let start = self.medoid;
        let page = cache.pin_vertex(start)?;
        let distance = self
            .distance
            .distance_bytes(query, cache.vector_bytes(&page, start));
        state.visited.insert(start);
        state.queue.add(start, distance, true, true);

        while let Some(position) = state.queue.next_not_checked() {
            if !state.queue.get(position).exact {
                self.upgrade_estimates(cache, query, state)?;
                continue;
            }

            state.queue.mark_checked(position);
            let vertex = state.queue.get(position).vertex;
            let page = cache.page(cache.layout().page_of(vertex))?;
            cache.edges(&page, vertex, &mut state.neighbors);

            self.prefetch_candidates(cache, state)?;
            self.insert_neighbors(cache, state)?;
        }
        Ok(())
    }

    /// Replaces the PQ estimates of up to four unchecked candidates by
    /// exact distances and pins their pages.
    ///
    /// A pin is owned by its queue entry once the entry is marked locked;
    /// pins taken before that point are dropped again on failure.
    fn upgrade_estimates(
        &self,
        cache: &DiskCache,
        query: &[f32],
        state: &mut SearchState,
    ) -> IndexResult<()> {
        state.queue.next_not_checked_pq(&mut state.batch);
        let vertices: Vec<VertexIndex> = state
            .batch
            .iter()
            .map(|&p| state.queue.get(p).vertex)
            .collect();
        let mut pages = Vec::with_capacity(vertices.len());
        for &vertex in &vertices {
            match cache.pin_vertex(vertex) {
                Ok(page) => pages.push(page),
                Err(e) => {
                    release_pins(cache, &vertices[..pages.len()]);
                    return Err(e);
                }
            }
        }

        let exact: Vec<f32> = if let [a, b, c, d] = vertices.as_slice() {
            self.distance
                .distance_batch4_bytes(
                    query,
                    [
                        cache.vector_bytes(&pages[0], *a),
                        cache.vector_bytes(&pages[1], *b),
                        cache.vector_bytes(&pages[2], *c),
                        cache.vector_bytes(&pages[3], *d),
                    ],
                )
                .to_vec()
        } else {
            vertices
                .iter()
                .zip(&pages)
                .map(|(&v, page)| {
                    self.distance
                        .distance_bytes(query, cache.vector_bytes(page, v))
                })
                .collect()
        };

        for (i, (&vertex, &distance)) in vertices.iter().zip(&exact).enumerate() {
            let locked = match state.queue.position_of(vertex) {
                Some(position) => {
                    let position = state.queue.update_distance(position, distance);
                    state.queue.mark_locked(position)
                }
                None => Err(IndexError::protocol(format!(
                    "vertex {vertex} left the queue during an upgrade"
                ))),
            };
            if let Err(e) = locked {
                release_pins(cache, &vertices[i..]);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Warms the pages of the closest candidates not yet pinned.
    fn prefetch_candidates(&self, cache: &DiskCache, state: &mut SearchState) -> IndexResult<()> {
        let layout = cache.layout();
        state.prefetch.clear();
        for entry in state.queue.entries().iter().filter(|e| !e.locked && !e.checked) {
            let page = layout.page_of(entry.vertex);
            if !state.prefetch.contains(&page) {
                state.prefetch.push(page);
                if state.prefetch.len() == PREFETCH_BATCH {
                    break;
                }
            }
        }
        cache.prefetch(&state.prefetch)
    }

    /// Adds unvisited neighbors with their PQ estimate.
    fn insert_neighbors(&self, cache: &DiskCache, state: &mut SearchState) -> IndexResult<()> {
        let SearchState {
            queue,
            visited,
            table,
            neighbors,
            fresh,
            ..
        } = state;
        let n = self.vertex_count;

        for chunk in neighbors.chunks(4) {
            fresh.clear();
            fresh.extend(
                chunk
                    .iter()
                    .copied()
                    .filter(|&v| (v as usize) < n && visited.insert(v)),
            );

            let estimates: [f32; 4] = if let &[a, b, c, d] = fresh.as_slice() {
                let ids = [a as usize, b as usize, c as usize, d as usize];
                self.quantizer.compute_distance_batch4(table, ids)
            } else {
                let mut out = [0.0; 4];
                for (slot, &v) in out.iter_mut().zip(fresh.iter()) {
                    *slot = self.quantizer.compute_distance(table, v as usize);
                }
                out
            };

            for (&vertex, &estimate) in fresh.iter().zip(&estimates) {
                if let Insertion::Evicted(_, evicted) = queue.add(vertex, estimate, false, false) {
                    if evicted.locked {
                        cache.unpin_vertex(evicted.vertex)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Exact distance from `query` to the stored vector of `vertex`.
    pub fn exact_distance(&self, query: &[f32], vertex: VertexIndex) -> IndexResult<f32> {
        let cache = self.cache()?;
        if vertex as usize >= self.vertex_count {
            return Err(VectorError::OutOfRange {
                index: vertex as usize,
                size: self.vertex_count,
            }
            .into());
        }
        let query = self.prepare_query(query)?;
        let page = cache.page(cache.layout().page_of(vertex))?;
        Ok(self
            .distance
            .distance_bytes(&query, cache.vector_bytes(&page, vertex)))
    }

    /// Ids of the `k` vertices closest to `query` by a full scan of the
    /// graph file.
    pub fn exact_nearest(&self, query: &[f32], k: usize) -> IndexResult<Vec<VertexIndex>> {
        let cache = self.cache()?;
        let query = self.prepare_query(query)?;
        let layout = cache.layout();

        let mut scored = Vec::with_capacity(self.vertex_count);
        for page_index in 0..layout.page_count(self.vertex_count) {
            let page = cache.page(page_index)?;
            let first = page_index * layout.vertices_per_page;
            let last = (first + layout.vertices_per_page).min(self.vertex_count);
            for vertex in first as VertexIndex..last as VertexIndex {
                let distance = self
                    .distance
                    .distance_bytes(&query, cache.vector_bytes(&page, vertex));
                scored.push((distance, vertex));
            }
        }
        scored.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(scored.into_iter().take(k).map(|(_, v)| v).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::ProgressStack;
    use crate::index::{BuildParams, IndexBuilder};
    use crate::vector::{L2Distance, RawVectorWriter};
    use tempfile::TempDir;

    fn build_grid(dir: &std::path::Path) {
        let dimension = VectorDimension::new(4).unwrap();
        let mut writer = RawVectorWriter::open(dir, "grid", dimension, &L2Distance).unwrap();
        for x in 0..8 {
            for y in 0..8 {
                writer.append(&[x as f32, y as f32, (x * y) as f32 * 0.1, 1.0]).unwrap();
            }
        }
        writer.finish().unwrap();

        IndexBuilder::new(BuildParams {
            name: "grid".to_string(),
            dimension: 4,
            index_dir: dir.to_path_buf(),
            scratch_dir: None,
            memory_budget_bytes: 1 << 20,
            max_connections_per_vertex: 8,
            max_candidates: 32,
            distance_multiplication: 1.2,
            compression_ratio: 4,
            distance: Distance::L2,
            parallel_threads: 2,
            seed: 7,
        })
        .build(&ProgressStack::disabled())
        .unwrap();
    }

    fn params(dir: &std::path::Path) -> ReaderParams {
        ReaderParams {
            name: "grid".to_string(),
            dimension: 4,
            index_dir: dir.to_path_buf(),
            max_connections_per_vertex: 8,
            max_candidates: 32,
            compression_ratio: 4,
            cache_bytes: 1 << 16,
            distance: Distance::L2,
        }
    }

    #[test]
    fn test_nearest_finds_stored_vector() {
        let temp_dir = TempDir::new().unwrap();
        build_grid(temp_dir.path());
        let reader = IndexReader::open(params(temp_dir.path())).unwrap();
        assert_eq!(reader.vertex_count(), 64);

        // Vector (3, 5) was appended as id 3 * 8 + 5.
        let mut result = Vec::new();
        reader.nearest(&[3.0, 5.0, 1.5, 1.0], &mut result, 1).unwrap();
        assert_eq!(result, vec![29]);
        assert_eq!(reader.exact_nearest(&[3.0, 5.0, 1.5, 1.0], 1).unwrap(), vec![29]);
        assert_eq!(reader.cache_stats().unwrap().locked_pages, 0);
    }

    #[test]
    fn test_nearest_on_closed_reader() {
        let temp_dir = TempDir::new().unwrap();
        build_grid(temp_dir.path());
        let mut reader = IndexReader::open(params(temp_dir.path())).unwrap();
        reader.close();
        assert!(reader.is_closed());

        let mut result = Vec::new();
        assert!(matches!(
            reader.nearest(&[0.0; 4], &mut result, 3),
            Err(IndexError::Closed)
        ));
    }

    #[test]
    fn test_mismatched_parameters_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        build_grid(temp_dir.path());

        let mut wrong_ratio = params(temp_dir.path());
        wrong_ratio.compression_ratio = 8;
        assert!(matches!(
            IndexReader::open(wrong_ratio),
            Err(IndexError::CorruptOrIncompatibleIndex { .. })
        ));

        let mut wrong_degree = params(temp_dir.path());
        wrong_degree.max_connections_per_vertex = 200;
        assert!(matches!(
            IndexReader::open(wrong_degree),
            Err(IndexError::CorruptOrIncompatibleIndex { .. })
        ));
    }

    #[test]
    fn test_query_dimension_is_checked() {
        let temp_dir = TempDir::new().unwrap();
        build_grid(temp_dir.path());
        let reader = IndexReader::open(params(temp_dir.path())).unwrap();
        let mut result = Vec::new();
        assert!(matches!(
            reader.nearest(&[1.0, 2.0], &mut result, 3),
            Err(IndexError::Vector(VectorError::DimensionMismatch { .. }))
        ));
    }

    #[test]
    fn test_failed_upgrade_releases_acquired_pins() {
        let temp_dir = TempDir::new().unwrap();
        build_grid(temp_dir.path());
        let reader = IndexReader::open(params(temp_dir.path())).unwrap();
        let cache = reader.cache().unwrap();

        let mut state = SearchState::new(8, reader.quantizer().lookup_table_len());
        state.queue.add(3, 0.5, false, false);
        // Lies past the last page of the graph file, so pinning it fails
        // after vertex 3 was already pinned.
        state.queue.add(1_000_000, 0.7, false, false);

        let err = reader
            .upgrade_estimates(cache, &[0.0, 3.0, 0.0, 1.0], &mut state)
            .unwrap_err();
        assert!(matches!(err, IndexError::CorruptOrIncompatibleIndex { .. }));
        assert_eq!(cache.locked_pages(), 0);
        assert!(state.queue.entries().iter().all(|e| !e.locked));
    }
}
