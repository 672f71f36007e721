//! Disk-scalable graph index construction.
//!
//! # Pipeline
//! 1. Train the product quantizer on every vector and encode them
//! 2. Estimate the global centroid with single-cluster K-means over PQ codes
//! 3. Split the vectors into partitions that fit the memory budget, using
//!    K-means over PQ codes; each vector joins its two nearest partitions
//! 4. Per partition: load the vectors, pick the local medoid, add random
//!    edges, refine them with robust pruning, then write the vectors to the
//!    graph file and the edges to a scratch file
//! 5. Merge the partition edge files into the graph file
//! 6. Write the metadata file and delete the raw vector file
//!
//! Free disk space is checked before any file is created.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::ThreadPool;
use rayon::prelude::*;
use sysinfo::Disks;
use tracing::{debug, info, warn};

use super::layout::{GraphFileWriter, GraphLayout, graph_path};
use super::merge::{MergeStats, merge_partitions, write_partition_edges};
use super::metadata::{IndexMetadata, metadata_path};
use super::partition_graph::PartitionGraph;
use super::pruning::{PruneParams, prune_index};
use crate::display::ProgressStack;
use crate::error::{IndexError, IndexResult, join_workers};
use crate::vector::{
    ClusterInitializer, ClusterSpace, Distance, DistanceFunction, KMeansClustering,
    MmapVectorReader, PqQuantizer, PqSpace, VectorDimension, VectorReader, VectorStorageError,
    VertexIndex, quantizer_count, vectors_path,
};

/// Initial partition count is this many times the minimum.
const PARTITION_OVERSUBSCRIPTION: u64 = 3;

/// Partition count growth after a partition overflowed the budget.
const PARTITION_GROWTH: f64 = 1.2;

/// Lloyd iterations used when partitioning.
const PARTITION_ITERATIONS: usize = 20;

/// Parameters of one index build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildParams {
    pub name: String,
    pub dimension: usize,
    /// Directory holding the raw vectors and receiving the index files
    pub index_dir: PathBuf,
    /// Directory for partition scratch files; defaults to `index_dir`
    pub scratch_dir: Option<PathBuf>,
    pub memory_budget_bytes: u64,
    pub max_connections_per_vertex: usize,
    pub max_candidates: usize,
    pub distance_multiplication: f32,
    pub compression_ratio: usize,
    pub distance: Distance,
    pub parallel_threads: usize,
    pub seed: u64,
}

impl BuildParams {
    /// Bytes one vertex occupies in an in-memory partition graph.
    pub fn partition_vertex_bytes(&self) -> u64 {
        // vector + edge slot + version counter + global id
        (self.dimension * 4 + (1 + self.max_connections_per_vertex) * 4 + 8 + 4) as u64
    }

    /// Rejects parameters that cannot produce an index.
    pub fn validate(&self) -> IndexResult<()> {
        if self.name.is_empty() {
            return Err(IndexError::invalid_config("Index name cannot be empty"));
        }
        VectorDimension::new(self.dimension)?;
        if self.max_connections_per_vertex == 0 {
            return Err(IndexError::invalid_config(
                "max_connections_per_vertex must be at least 1",
            ));
        }
        if self.max_candidates == 0 {
            return Err(IndexError::invalid_config("max_candidates must be at least 1"));
        }
        if !(self.distance_multiplication >= 1.0) {
            return Err(IndexError::invalid_config(format!(
                "distance_multiplication must be at least 1.0, got {}",
                self.distance_multiplication
            )));
        }
        if self.parallel_threads == 0 {
            return Err(IndexError::invalid_config("parallel_threads must be at least 1"));
        }
        if self.memory_budget_bytes < 2 * self.partition_vertex_bytes() {
            return Err(IndexError::invalid_config(format!(
                "memory budget of {} bytes cannot hold two vertices of {} bytes",
                self.memory_budget_bytes,
                self.partition_vertex_bytes()
            )));
        }
        quantizer_count(self.dimension, self.compression_ratio)
            .map_err(|e| IndexError::invalid_config(e.to_string()))?;
        Ok(())
    }
}

/// Summary of a finished build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub name: String,
    pub vertex_count: usize,
    pub partitions: usize,
    pub shared_vertices: usize,
    pub medoid: VertexIndex,
    pub average_degree: f64,
    pub max_degree: usize,
    pub elapsed: Duration,
    pub graph_path: Option<PathBuf>,
}

pub struct IndexBuilder {
    params: BuildParams,
}

impl IndexBuilder {
    pub fn new(params: BuildParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &BuildParams {
        &self.params
    }

    /// Builds the index from `<name>.vectors` in the index directory.
    pub fn build(&self, progress: &ProgressStack) -> IndexResult<BuildReport> {
        let started = Instant::now();
        let params = &self.params;
        params.validate()?;

        let dimension = VectorDimension::new(params.dimension)?;
        let raw_path = vectors_path(&params.index_dir, &params.name);
        let reader = MmapVectorReader::open(&raw_path, dimension).map_err(|e| match e {
            VectorStorageError::InvalidFormat { path, reason } => IndexError::corrupt(path, reason),
            VectorStorageError::Io { path, source } => IndexError::FileRead { path, source },
            other => other.into(),
        })?;

        let n = reader.size();
        if n == 0 {
            info!(name = %params.name, "no vectors to index, nothing to build");
            return Ok(BuildReport {
                name: params.name.clone(),
                vertex_count: 0,
                partitions: 0,
                shared_vertices: 0,
                medoid: 0,
                average_degree: 0.0,
                max_degree: 0,
                elapsed: started.elapsed(),
                graph_path: None,
            });
        }
        if n > i32::MAX as usize {
            return Err(IndexError::invalid_config(format!(
                "{n} vectors exceed the addressable vertex range"
            )));
        }

        let layout = GraphLayout::new(params.dimension, params.max_connections_per_vertex);
        self.check_disk_space(&layout, n)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.parallel_threads)
            .thread_name(|i| format!("pqgraph-build-{i}"))
            .build()
            .map_err(|e| IndexError::WorkerFailed {
                phase: "thread pool",
                cause: e.to_string(),
            })?;

        info!(name = %params.name, vectors = n, dimension = params.dimension, "building index");

        let mut quantizer = params.distance.quantizer();
        quantizer.generate_pq_codes(
            &pool,
            params.dimension,
            params.compression_ratio,
            &reader,
            progress,
        )?;

        let build_fn = params.distance.build_function();
        let space = PqSpace::new(&quantizer, build_fn);
        let centroid = join_workers("centroid", || {
            KMeansClustering::new(1, ClusterInitializer::Random, params.seed).fit(&pool, &space)
        })??
        .centroids;

        let partitions = self.partition(&pool, &quantizer, progress)?;
        info!(partitions = partitions.len(), "partitioned vectors");

        let graph_file = graph_path(&params.index_dir, &params.name);
        let mut writer = GraphFileWriter::create(&graph_file, layout, n)?;

        let scratch_root = params.scratch_dir.as_deref().unwrap_or(&params.index_dir);
        let scratch = tempfile::Builder::new()
            .prefix(".pqgraph-build-")
            .tempdir_in(scratch_root)
            .map_err(|source| IndexError::FileWrite {
                path: scratch_root.to_path_buf(),
                source,
            })?;

        let mut rng = StdRng::seed_from_u64(params.seed);
        let prune_params = PruneParams {
            max_connections: params.max_connections_per_vertex,
            max_candidates: params.max_candidates,
            distance_multiplication: params.distance_multiplication,
        };
        let partition_count = partitions.len();
        let mut edge_files = Vec::with_capacity(partition_count);

        for (index, members) in partitions.into_iter().enumerate() {
            let size = members.len();
            debug!(partition = index, size, "building partition graph");

            let mut graph = PartitionGraph::create(
                scratch.path(),
                members,
                params.dimension,
                params.max_connections_per_vertex,
            )?;
            graph.load_vectors(&reader);
            let medoid = nearest_to(&pool, size, &centroid, build_fn, |l| {
                graph.vector(l as VertexIndex)
            })?;
            graph.set_medoid(medoid);
            graph.init_random_edges(&mut rng)?;

            {
                let phase = progress.push(
                    &format!("Pruning partition {}/{partition_count}", index + 1),
                    size as u64,
                );
                prune_index(
                    &graph,
                    build_fn,
                    &prune_params,
                    params.parallel_threads,
                    params.seed.wrapping_add(index as u64),
                    &phase,
                )?;
            }

            for local in 0..size as VertexIndex {
                writer.write_vector(graph.global_id(local), graph.vector(local));
            }
            let edges_path = scratch.path().join(format!("partition-{index}.edges"));
            write_partition_edges(&graph, &edges_path)?;
            edge_files.push(edges_path);
        }

        let stats: MergeStats = {
            let _phase = progress.push("Merging partitions", 0);
            merge_partitions(
                &edge_files,
                &mut writer,
                params.max_connections_per_vertex,
                &mut rng,
            )?
        };
        let graph_file = writer.finish()?;
        drop(scratch);

        let medoid = nearest_to(&pool, n, &centroid, build_fn, |i| reader.read(i))?;
        let metadata = IndexMetadata {
            medoid,
            vertex_count: n,
        };
        metadata.write(&metadata_path(&params.index_dir, &params.name), &quantizer)?;

        drop(reader);
        std::fs::remove_file(&raw_path).map_err(|source| IndexError::FileWrite {
            path: raw_path.clone(),
            source,
        })?;

        let report = BuildReport {
            name: params.name.clone(),
            vertex_count: n,
            partitions: partition_count,
            shared_vertices: stats.shared_vertices,
            medoid,
            average_degree: stats.average_degree(),
            max_degree: stats.max_degree,
            elapsed: started.elapsed(),
            graph_path: Some(graph_file),
        };
        info!(
            name = %report.name,
            vertices = report.vertex_count,
            partitions = report.partitions,
            medoid = report.medoid,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "index built"
        );
        Ok(report)
    }

    /// Bytes the build writes: graph file, the largest partition arena,
    /// partition edge files and the metadata file.
    fn required_bytes(&self, layout: &GraphLayout, n: usize) -> u64 {
        let params = &self.params;
        let n = n as u64;
        let total_partition = n * params.partition_vertex_bytes();
        let arena = (2 * total_partition).min(params.memory_budget_bytes);
        let edge_files = 2 * n * (8 + 4 * params.max_connections_per_vertex as u64);
        let metadata = n * (params.dimension * 4 / params.compression_ratio.max(1)) as u64
            + 256 * (params.dimension as u64) * 4
            + 64;
        layout.file_size(n as usize) + arena + edge_files + metadata
    }

    fn check_disk_space(&self, layout: &GraphLayout, n: usize) -> IndexResult<()> {
        let required = self.required_bytes(layout, n);
        for dir in [Some(&self.params.index_dir), self.params.scratch_dir.as_ref()]
            .into_iter()
            .flatten()
        {
            match available_space(dir) {
                Some(available) => ensure_disk_space(dir, required, available)?,
                None => warn!(path = %dir.display(), "cannot determine free disk space"),
            }
        }
        Ok(())
    }

    /// Groups vector ids into partitions that fit the memory budget.
    ///
    /// Every list is sorted ascending; a vector may appear in two lists.
    fn partition(
        &self,
        pool: &ThreadPool,
        quantizer: &PqQuantizer,
        progress: &ProgressStack,
    ) -> IndexResult<Vec<Vec<VertexIndex>>> {
        let params = &self.params;
        let n = quantizer.vector_count();
        let per_vertex = params.partition_vertex_bytes();
        let budget = params.memory_budget_bytes;
        let total = n as u64 * per_vertex;

        if total <= budget {
            return Ok(vec![(0..n as VertexIndex).collect()]);
        }

        let _phase = progress.push("Partitioning vectors", 0);
        let mut count = (PARTITION_OVERSUBSCRIPTION * total / budget).max(2) as usize;
        loop {
            count = count.min(n);
            let partitions = self.assign_partitions(pool, quantizer, count)?;
            let largest = partitions.iter().map(Vec::len).max().unwrap_or(0);
            if largest as u64 * per_vertex <= budget {
                return Ok(partitions);
            }
            if count == n {
                return Err(IndexError::invalid_config(format!(
                    "memory budget of {budget} bytes cannot hold a partition of {largest} vertices"
                )));
            }
            let next = ((count as f64 * PARTITION_GROWTH) as usize).max(count + 1);
            info!(
                partitions = count,
                largest, next, "largest partition exceeds the memory budget, retrying"
            );
            count = next;
        }
    }

    /// K-means over PQ codes into `count` clusters; each vector joins its
    /// two nearest clusters. Empty clusters are dropped.
    fn assign_partitions(
        &self,
        pool: &ThreadPool,
        quantizer: &PqQuantizer,
        count: usize,
    ) -> IndexResult<Vec<Vec<VertexIndex>>> {
        let space = PqSpace::new(quantizer, self.params.distance.build_function());
        let result = join_workers("partitioning", || {
            KMeansClustering::new(count, ClusterInitializer::KMeansPlusPlus, self.params.seed)
                .with_max_iterations(PARTITION_ITERATIONS)
                .fit(pool, &space)
        })??;
        let prepared = space.prepare(&result.centroids);
        let clusters = result.cluster_count();

        let nearest: Vec<(u32, u32)> = join_workers("partitioning", || {
            pool.install(|| {
                (0..space.len())
                    .into_par_iter()
                    .map(|i| {
                        let mut best = [(u32::MAX, f32::INFINITY); 2];
                        for c in 0..clusters {
                            let d = space.distance(&prepared, i, c);
                            if d < best[0].1 {
                                best[1] = best[0];
                                best[0] = (c as u32, d);
                            } else if d < best[1].1 {
                                best[1] = (c as u32, d);
                            }
                        }
                        (best[0].0, best[1].0)
                    })
                    .collect()
            })
        })?;

        let mut partitions = vec![Vec::new(); clusters];
        for (vertex, &(first, second)) in nearest.iter().enumerate() {
            partitions[first as usize].push(vertex as VertexIndex);
            if second != u32::MAX && second != first {
                partitions[second as usize].push(vertex as VertexIndex);
            }
        }
        partitions.retain(|p| !p.is_empty());
        Ok(partitions)
    }
}

/// Index in `0..count` whose vector is closest to `target`.
fn nearest_to<'a, F>(
    pool: &ThreadPool,
    count: usize,
    target: &[f32],
    distance: &dyn DistanceFunction,
    vector: F,
) -> IndexResult<VertexIndex>
where
    F: Fn(usize) -> &'a [f32] + Sync,
{
    join_workers("medoid search", || {
        pool.install(|| {
            (0..count)
                .into_par_iter()
                .map(|i| (distance.distance(vector(i), target), i))
                .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
                .map_or(0, |(_, i)| i as VertexIndex)
        })
    })
}

/// Fails unless `available` covers `required` plus 10% headroom.
pub fn ensure_disk_space(path: &Path, required: u64, available: u64) -> IndexResult<()> {
    let with_headroom = required.saturating_add(required / 10);
    if available < with_headroom {
        return Err(IndexError::InsufficientDiskSpace {
            path: path.to_path_buf(),
            required: with_headroom,
            available,
        });
    }
    Ok(())
}

/// Free bytes on the disk holding `path`.
fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{L2Distance, RawVectorWriter};
    use tempfile::TempDir;

    fn params(dir: &Path) -> BuildParams {
        BuildParams {
            name: "docs".to_string(),
            dimension: 4,
            index_dir: dir.to_path_buf(),
            scratch_dir: None,
            memory_budget_bytes: 1 << 20,
            max_connections_per_vertex: 8,
            max_candidates: 16,
            distance_multiplication: 1.2,
            compression_ratio: 8,
            distance: Distance::L2,
            parallel_threads: 2,
            seed: 1,
        }
    }

    #[test]
    fn test_validation_rejects_bad_configuration() {
        let temp_dir = TempDir::new().unwrap();
        let mut p = params(temp_dir.path());
        p.compression_ratio = 3;
        assert!(matches!(p.validate(), Err(IndexError::InvalidConfiguration { .. })));

        let mut p = params(temp_dir.path());
        p.compression_ratio = 2;
        // 8 quantizers for 4 dimensions
        assert!(matches!(p.validate(), Err(IndexError::InvalidConfiguration { .. })));

        let mut p = params(temp_dir.path());
        p.distance_multiplication = 0.5;
        assert!(p.validate().is_err());

        let mut p = params(temp_dir.path());
        p.memory_budget_bytes = 10;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_invalid_configuration_fails_before_io() {
        let temp_dir = TempDir::new().unwrap();
        let mut p = params(temp_dir.path());
        p.compression_ratio = 3;
        // No raw vector file exists; the configuration error wins.
        let err = IndexBuilder::new(p).build(&ProgressStack::disabled()).unwrap_err();
        assert!(matches!(err, IndexError::InvalidConfiguration { .. }));
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_zero_vectors_is_a_no_op() {
        let temp_dir = TempDir::new().unwrap();
        let dimension = VectorDimension::new(4).unwrap();
        RawVectorWriter::open(temp_dir.path(), "docs", dimension, &L2Distance)
            .unwrap()
            .finish()
            .unwrap();

        let report = IndexBuilder::new(params(temp_dir.path()))
            .build(&ProgressStack::disabled())
            .unwrap();
        assert_eq!(report.vertex_count, 0);
        assert!(report.graph_path.is_none());
        assert!(!graph_path(temp_dir.path(), "docs").exists());
    }

    #[test]
    fn test_disk_space_headroom() {
        let path = Path::new("/index");
        assert!(ensure_disk_space(path, 1000, 1100).is_ok());
        assert!(matches!(
            ensure_disk_space(path, 1000, 1099),
            Err(IndexError::InsufficientDiskSpace {
                required: 1100,
                available: 1099,
                ..
            })
        ));
    }

    #[test]
    fn test_medoid_search_reports_worker_panic() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let rows: Vec<Vec<f32>> = (0..50).map(|i| vec![i as f32, 0.0]).collect();

        let target = [20.2, 0.0];
        let medoid = nearest_to(&pool, rows.len(), &target, &L2Distance, |i| rows[i].as_slice());
        assert_eq!(medoid.unwrap(), 20);

        let err = nearest_to(&pool, rows.len(), &target, &L2Distance, |i| {
            assert!(i != 31, "vector {i} went missing");
            rows[i].as_slice()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            IndexError::WorkerFailed {
                phase: "medoid search",
                ..
            }
        ));
    }

    #[test]
    fn test_small_budget_splits_into_overlapping_partitions() {
        let temp_dir = TempDir::new().unwrap();
        let dimension = VectorDimension::new(4).unwrap();
        let mut writer =
            RawVectorWriter::open(temp_dir.path(), "docs", dimension, &L2Distance).unwrap();
        for i in 0..200 {
            let x = (i % 4) as f32 * 10.0;
            writer
                .append(&[x + (i as f32 * 0.01), -x, (i % 7) as f32 * 0.1, 1.0])
                .unwrap();
        }
        writer.finish().unwrap();

        let mut p = params(temp_dir.path());
        // Room for about 120 of the 200 vertices per partition.
        p.memory_budget_bytes = 120 * p.partition_vertex_bytes();
        let report = IndexBuilder::new(p).build(&ProgressStack::disabled()).unwrap();

        assert!(report.partitions >= 2);
        assert_eq!(report.vertex_count, 200);
        assert!(report.max_degree <= 8);
        assert!(!vectors_path(temp_dir.path(), "docs").exists());
        assert!(metadata_path(temp_dir.path(), "docs").exists());
    }
}
