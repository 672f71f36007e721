//! Parallel K-means clustering used for PQ codebook training, the global
//! centroid estimate and partitioning vectors before graph construction.
//!
//! # Algorithm Details
//! - Lloyd's iterations over a `ClusterSpace`
//! - Vectors are split evenly across the worker pool; each worker
//!   accumulates per-cluster sums which are then reduced
//! - Stops as soon as no assignment changes, or after `max_iterations`
//! - An empty cluster keeps its previous centroid (no division by zero)
//! - Seeding is pluggable through `ClusterInitializer`
//!
//! # Performance Characteristics
//! - O(n * k * d * iterations) time, O(k * d) space per worker
//! - 1-D fast path: binary search over sorted centroids

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::distance::DistanceFunction;
use super::reader::VectorReader;

/// Default maximum number of Lloyd iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

/// Minimum number of vectors handled by a single worker chunk.
const MIN_CHUNK: usize = 256;

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Flat `k * dimensions` centroid table.
    pub centroids: Vec<f32>,

    /// Cluster index for each input vector.
    pub assignments: Vec<u32>,

    /// Number of assignment passes performed.
    pub iterations: usize,

    pub dimensions: usize,
}

impl KMeansResult {
    /// Centroid `cluster` as a slice.
    #[must_use]
    pub fn centroid(&self, cluster: usize) -> &[f32] {
        &self.centroids[cluster * self.dimensions..(cluster + 1) * self.dimensions]
    }

    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.centroids.len() / self.dimensions.max(1)
    }
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Ensure vectors are stored before clustering"
    )]
    EmptyVectorSet,

    #[error("Invalid cluster count: {0}\nSuggestion: Use k between 1 and the number of vectors")]
    InvalidClusterCount(usize),
}

/// Vector space clustered by `KMeansClustering`.
///
/// `prepare` turns a centroid table into a form that makes repeated
/// distance evaluations cheap: the exact space keeps the table (plus a
/// sorted copy for 1-D), the PQ space builds one lookup table per centroid.
pub trait ClusterSpace: Sync {
    type Prepared: Sync;

    fn len(&self) -> usize;

    fn dimensions(&self) -> usize;

    /// Adds vector `index` into `acc` (used for centroid means).
    fn accumulate(&self, index: usize, acc: &mut [f32]);

    /// Copies vector `index` into `out`.
    fn copy_vector(&self, index: usize, out: &mut [f32]);

    fn prepare(&self, centroids: &[f32]) -> Self::Prepared;

    /// Distance from vector `index` to centroid `cluster` of `prepared`.
    fn distance(&self, prepared: &Self::Prepared, index: usize, cluster: usize) -> f32;

    /// Nearest centroid of `prepared` for vector `index`.
    fn nearest(&self, prepared: &Self::Prepared, clusters: usize, index: usize) -> (u32, f32) {
        let mut best = (0u32, f32::INFINITY);
        for cluster in 0..clusters {
            let d = self.distance(prepared, index, cluster);
            if d < best.1 {
                best = (cluster as u32, d);
            }
        }
        best
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exact space over a contiguous dimension range of a `VectorReader`.
pub struct SubVectorSpace<'a, R: VectorReader + ?Sized> {
    reader: &'a R,
    offset: usize,
    width: usize,
    distance: &'a dyn DistanceFunction,
}

impl<'a, R: VectorReader + ?Sized> SubVectorSpace<'a, R> {
    /// Space over dimensions `offset..offset + width`.
    pub fn new(
        reader: &'a R,
        offset: usize,
        width: usize,
        distance: &'a dyn DistanceFunction,
    ) -> Self {
        Self {
            reader,
            offset,
            width,
            distance,
        }
    }

    /// Space over whole vectors.
    pub fn full(reader: &'a R, distance: &'a dyn DistanceFunction) -> Self {
        Self::new(reader, 0, reader.dimensions(), distance)
    }

    fn slice(&self, index: usize) -> &[f32] {
        &self.reader.read(index)[self.offset..self.offset + self.width]
    }
}

/// Prepared centroids of an exact space.
pub struct ExactCentroids {
    centroids: Vec<f32>,
    /// `(coordinate, cluster)` sorted by coordinate, only for 1-D spaces.
    sorted: Option<Vec<(f32, u32)>>,
}

impl<R: VectorReader + ?Sized> ClusterSpace for SubVectorSpace<'_, R> {
    type Prepared = ExactCentroids;

    fn len(&self) -> usize {
        self.reader.size()
    }

    fn dimensions(&self) -> usize {
        self.width
    }

    fn accumulate(&self, index: usize, acc: &mut [f32]) {
        for (a, v) in acc.iter_mut().zip(self.slice(index)) {
            *a += v;
        }
    }

    fn copy_vector(&self, index: usize, out: &mut [f32]) {
        out.copy_from_slice(self.slice(index));
    }

    fn prepare(&self, centroids: &[f32]) -> ExactCentroids {
        let sorted = (self.width == 1).then(|| {
            let mut sorted: Vec<(f32, u32)> = centroids
                .iter()
                .enumerate()
                .map(|(i, &c)| (c, i as u32))
                .collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
            sorted
        });
        ExactCentroids {
            centroids: centroids.to_vec(),
            sorted,
        }
    }

    fn distance(&self, prepared: &ExactCentroids, index: usize, cluster: usize) -> f32 {
        let w = self.width;
        self.distance
            .distance(self.slice(index), &prepared.centroids[cluster * w..(cluster + 1) * w])
    }

    fn nearest(&self, prepared: &ExactCentroids, clusters: usize, index: usize) -> (u32, f32) {
        // The sorted fast path is only valid for metrics monotonic in |x - c|.
        if let (Some(sorted), "l2") = (&prepared.sorted, self.distance.name()) {
            let x = self.slice(index)[0];
            let at = sorted.partition_point(|(c, _)| *c < x);
            let mut best = (0u32, f32::INFINITY);
            for &(c, cluster) in sorted[at.saturating_sub(1)..(at + 1).min(sorted.len())].iter() {
                let d = (x - c) * (x - c);
                if d < best.1 || (d == best.1 && cluster < best.0) {
                    best = (cluster, d);
                }
            }
            return best;
        }

        let mut best = (0u32, f32::INFINITY);
        for cluster in 0..clusters {
            let d = self.distance(prepared, index, cluster);
            if d < best.1 {
                best = (cluster as u32, d);
            }
        }
        best
    }
}

/// Seeding strategy for the initial centroids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterInitializer {
    /// Uniform random pick of distinct vectors.
    Random,
    /// Greedy pick of the vector farthest from all chosen centroids.
    MaxDistance,
    /// Pick with probability proportional to squared distance.
    #[default]
    KMeansPlusPlus,
}

impl ClusterInitializer {
    /// Chooses `k` initial centroids.
    ///
    /// Distance reductions run in parallel over index ranges on `pool`.
    pub fn initialize<S: ClusterSpace>(
        self,
        pool: &ThreadPool,
        space: &S,
        k: usize,
        rng: &mut StdRng,
    ) -> Vec<f32> {
        let n = space.len();
        let dim = space.dimensions();
        let mut centroids = vec![0.0f32; k * dim];

        match self {
            Self::Random => {
                let picks = rand::seq::index::sample(rng, n, k);
                for (slot, index) in picks.iter().enumerate() {
                    space.copy_vector(index, &mut centroids[slot * dim..(slot + 1) * dim]);
                }
            }
            Self::MaxDistance | Self::KMeansPlusPlus => {
                let first = rng.random_range(0..n);
                space.copy_vector(first, &mut centroids[..dim]);
                let mut min_distance = vec![f32::INFINITY; n];
                let chunk = chunk_size(pool, n);

                for slot in 1..k {
                    let prepared = space.prepare(&centroids[(slot - 1) * dim..slot * dim]);
                    let chosen = pool.install(|| {
                        min_distance
                            .par_chunks_mut(chunk)
                            .enumerate()
                            .map(|(c, distances)| {
                                let base = c * chunk;
                                let mut local = Reduction::default();
                                for (offset, slot_distance) in distances.iter_mut().enumerate() {
                                    let d = space.distance(&prepared, base + offset, 0);
                                    let weight = weight_of(self, d);
                                    if weight < *slot_distance {
                                        *slot_distance = weight;
                                    }
                                    local.push(base + offset, *slot_distance);
                                }
                                local
                            })
                            .reduce(Reduction::default, Reduction::merge)
                    });

                    let index = match self {
                        Self::MaxDistance => chosen.farthest.map(|(i, _)| i),
                        _ => sample_weighted(&min_distance, chosen.total, rng),
                    }
                    // Every remaining weight is zero: all points coincide with a centroid.
                    .unwrap_or_else(|| rng.random_range(0..n));

                    space.copy_vector(index, &mut centroids[slot * dim..(slot + 1) * dim]);
                }
            }
        }

        centroids
    }
}

/// Weight assigned to a distance by the seeding strategy.
///
/// L2 distances are already squared. Negated dot products can be negative
/// and are clamped so the sampling weights stay valid.
fn weight_of(initializer: ClusterInitializer, distance: f32) -> f32 {
    match initializer {
        ClusterInitializer::KMeansPlusPlus => distance.max(0.0),
        _ => distance,
    }
}

/// Parallel reduction of the total weight and the farthest vector.
#[derive(Debug, Default, Clone, Copy)]
struct Reduction {
    total: f64,
    farthest: Option<(usize, f32)>,
}

impl Reduction {
    fn push(&mut self, index: usize, weight: f32) {
        if weight.is_finite() {
            self.total += f64::from(weight.max(0.0));
        }
        match self.farthest {
            Some((_, best)) if best >= weight => {}
            _ => self.farthest = Some((index, weight)),
        }
    }

    fn merge(a: Self, b: Self) -> Self {
        let farthest = match (a.farthest, b.farthest) {
            (Some(x), Some(y)) => Some(if y.1 > x.1 || (y.1 == x.1 && y.0 < x.0) { y } else { x }),
            (x, y) => x.or(y),
        };
        Self {
            total: a.total + b.total,
            farthest,
        }
    }
}

fn sample_weighted(weights: &[f32], total: f64, rng: &mut StdRng) -> Option<usize> {
    if total <= f64::EPSILON {
        return None;
    }
    let target = rng.random::<f64>() * total;
    let mut cumulative = 0.0f64;
    let mut last_positive = None;
    for (i, &w) in weights.iter().enumerate() {
        if w > 0.0 && w.is_finite() {
            cumulative += f64::from(w);
            last_positive = Some(i);
            if cumulative >= target {
                return Some(i);
            }
        }
    }
    // Rounding can leave the target just above the accumulated sum.
    last_positive
}

fn chunk_size(pool: &ThreadPool, n: usize) -> usize {
    n.div_ceil(pool.current_num_threads().max(1)).max(MIN_CHUNK.min(n.max(1)))
}

/// Lloyd's K-means over a `ClusterSpace`.
#[derive(Debug, Clone)]
pub struct KMeansClustering {
    pub clusters: usize,
    pub max_iterations: usize,
    pub initializer: ClusterInitializer,
    pub seed: u64,
}

impl KMeansClustering {
    #[must_use]
    pub fn new(clusters: usize, initializer: ClusterInitializer, seed: u64) -> Self {
        Self {
            clusters,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            initializer,
            seed,
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Clusters `space` on `pool`.
    ///
    /// # Algorithm
    /// 1. Seed centroids with the configured initializer
    /// 2. Iterate until no assignment changes or `max_iterations`:
    ///    - assign each vector to its nearest centroid (parallel)
    ///    - recompute centroids as means of per-worker partial sums
    #[must_use = "clustering results should be used or the computation is wasted"]
    pub fn fit<S: ClusterSpace>(
        &self,
        pool: &ThreadPool,
        space: &S,
    ) -> Result<KMeansResult, ClusteringError> {
        let n = space.len();
        let k = self.clusters;
        let dim = space.dimensions();

        if n == 0 {
            return Err(ClusteringError::EmptyVectorSet);
        }
        if k == 0 || k > n {
            return Err(ClusteringError::InvalidClusterCount(k));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids = if k == 1 {
            // The mean is the exact answer for one cluster; skip seeding.
            vec![0.0f32; dim]
        } else {
            self.initializer.initialize(pool, space, k, &mut rng)
        };
        let mut assignments = vec![u32::MAX; n];
        let chunk = chunk_size(pool, n);
        let mut iterations = 0;

        loop {
            iterations += 1;
            let prepared = space.prepare(&centroids);

            let (sums, counts, changed) = pool.install(|| {
                assignments
                    .par_chunks_mut(chunk)
                    .enumerate()
                    .map(|(c, slots)| {
                        let base = c * chunk;
                        let mut sums = vec![0.0f32; k * dim];
                        let mut counts = vec![0usize; k];
                        let mut changed = 0usize;
                        for (offset, slot) in slots.iter_mut().enumerate() {
                            let index = base + offset;
                            let cluster = if k == 1 {
                                0
                            } else {
                                space.nearest(&prepared, k, index).0
                            };
                            if *slot != cluster {
                                *slot = cluster;
                                changed += 1;
                            }
                            let cluster = cluster as usize;
                            space.accumulate(index, &mut sums[cluster * dim..(cluster + 1) * dim]);
                            counts[cluster] += 1;
                        }
                        (sums, counts, changed)
                    })
                    .reduce(
                        || (vec![0.0f32; k * dim], vec![0usize; k], 0usize),
                        |mut a, b| {
                            for (x, y) in a.0.iter_mut().zip(&b.0) {
                                *x += y;
                            }
                            for (x, y) in a.1.iter_mut().zip(&b.1) {
                                *x += y;
                            }
                            a.2 += b.2;
                            a
                        },
                    )
            });

            if changed == 0 {
                break;
            }

            for cluster in 0..k {
                let count = counts[cluster];
                if count == 0 {
                    continue;
                }
                let inv = 1.0 / count as f32;
                for (c, s) in centroids[cluster * dim..(cluster + 1) * dim]
                    .iter_mut()
                    .zip(&sums[cluster * dim..(cluster + 1) * dim])
                {
                    *c = s * inv;
                }
            }

            if k == 1 || iterations >= self.max_iterations {
                break;
            }
        }

        Ok(KMeansResult {
            centroids,
            assignments,
            iterations,
            dimensions: dim,
        })
    }
}
