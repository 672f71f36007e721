//! Pluggable distance kernels over float slices and mapped byte buffers.
//!
//! Every kernel returns a value where lower means closer, so graph search
//! always minimizes:
//! - `L2Distance`: squared Euclidean distance, no epsilon correction
//! - `DotDistance`: negated inner product
//! - `CosineDistance`: negated inner product of L2-normalized vectors.
//!   Parallel vectors yield the most negative value; this is not `1 - cos`.
//!
//! Each kernel also has a 4-way batch form computing the distance from one
//! query to four candidates in a single pass over the dimensions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::types::BYTES_PER_F32;

/// Norm below which a vector is left untouched by normalization.
const NORM_EPSILON: f32 = 1e-12;

/// Read-only view of a vector's coordinates.
///
/// Implemented for plain `f32` slices and for little-endian byte buffers such
/// as pages of a memory-mapped graph file, so kernels run on either.
pub trait VectorView: Copy {
    fn dimensions(&self) -> usize;
    fn coordinate(&self, index: usize) -> f32;
}

impl VectorView for &[f32] {
    #[inline]
    fn dimensions(&self) -> usize {
        self.len()
    }

    #[inline]
    fn coordinate(&self, index: usize) -> f32 {
        self[index]
    }
}

/// Vector stored as little-endian `f32` bytes in an externally owned buffer.
#[derive(Debug, Clone, Copy)]
pub struct LeBytes<'a>(pub &'a [u8]);

impl VectorView for LeBytes<'_> {
    #[inline]
    fn dimensions(&self) -> usize {
        self.0.len() / BYTES_PER_F32
    }

    #[inline]
    fn coordinate(&self, index: usize) -> f32 {
        let at = index * BYTES_PER_F32;
        f32::from_le_bytes([self.0[at], self.0[at + 1], self.0[at + 2], self.0[at + 3]])
    }
}

/// Per-coordinate accumulation rule of a metric.
trait Kernel {
    fn accumulate(x: f32, y: f32) -> f32;
    fn finish(sum: f32) -> f32;
}

struct SquaredL2;

impl Kernel for SquaredL2 {
    #[inline(always)]
    fn accumulate(x: f32, y: f32) -> f32 {
        let d = x - y;
        d * d
    }

    #[inline(always)]
    fn finish(sum: f32) -> f32 {
        sum
    }
}

struct NegatedDot;

impl Kernel for NegatedDot {
    #[inline(always)]
    fn accumulate(x: f32, y: f32) -> f32 {
        x * y
    }

    #[inline(always)]
    fn finish(sum: f32) -> f32 {
        -sum
    }
}

#[inline]
fn pairwise<K: Kernel, A: VectorView, B: VectorView>(a: A, b: B) -> f32 {
    let len = a.dimensions();
    debug_assert_eq!(len, b.dimensions(), "Vectors must have same dimension");

    // Four independent accumulators keep the loop free of a serial dependency.
    let mut acc = [0.0f32; 4];
    let tail = len - len % 4;
    let mut i = 0;
    while i < tail {
        acc[0] += K::accumulate(a.coordinate(i), b.coordinate(i));
        acc[1] += K::accumulate(a.coordinate(i + 1), b.coordinate(i + 1));
        acc[2] += K::accumulate(a.coordinate(i + 2), b.coordinate(i + 2));
        acc[3] += K::accumulate(a.coordinate(i + 3), b.coordinate(i + 3));
        i += 4;
    }
    for j in tail..len {
        acc[0] += K::accumulate(a.coordinate(j), b.coordinate(j));
    }
    K::finish((acc[0] + acc[1]) + (acc[2] + acc[3]))
}

#[inline]
fn batch4<K: Kernel, A: VectorView, B: VectorView>(origin: A, candidates: [B; 4]) -> [f32; 4] {
    let len = origin.dimensions();
    let mut acc = [0.0f32; 4];
    for i in 0..len {
        let x = origin.coordinate(i);
        acc[0] += K::accumulate(x, candidates[0].coordinate(i));
        acc[1] += K::accumulate(x, candidates[1].coordinate(i));
        acc[2] += K::accumulate(x, candidates[2].coordinate(i));
        acc[3] += K::accumulate(x, candidates[3].coordinate(i));
    }
    acc.map(K::finish)
}

/// A vector distance where lower is closer.
pub trait DistanceFunction: Send + Sync + fmt::Debug {
    /// Distance between two float slices of equal length.
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;

    /// Distance from a float slice to a vector stored as little-endian bytes.
    fn distance_bytes(&self, a: &[f32], b: &[u8]) -> f32;

    /// Distances from `origin` to four candidates in one pass.
    fn distance_batch4(&self, origin: &[f32], candidates: [&[f32]; 4]) -> [f32; 4];

    /// Distances from `origin` to four byte-encoded candidates in one pass.
    fn distance_batch4_bytes(&self, origin: &[f32], candidates: [&[u8]; 4]) -> [f32; 4];

    /// Transform applied to every vector at ingestion time and to queries.
    fn pre_process(&self, _vector: &mut [f32]) {}

    fn name(&self) -> &'static str;
}

/// Squared Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Distance;

impl DistanceFunction for L2Distance {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        pairwise::<SquaredL2, _, _>(a, b)
    }

    fn distance_bytes(&self, a: &[f32], b: &[u8]) -> f32 {
        pairwise::<SquaredL2, _, _>(a, LeBytes(b))
    }

    fn distance_batch4(&self, origin: &[f32], candidates: [&[f32]; 4]) -> [f32; 4] {
        batch4::<SquaredL2, _, _>(origin, candidates)
    }

    fn distance_batch4_bytes(&self, origin: &[f32], candidates: [&[u8]; 4]) -> [f32; 4] {
        batch4::<SquaredL2, _, _>(origin, candidates.map(LeBytes))
    }

    fn name(&self) -> &'static str {
        "l2"
    }
}

/// Negated inner product.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotDistance;

impl DistanceFunction for DotDistance {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        pairwise::<NegatedDot, _, _>(a, b)
    }

    fn distance_bytes(&self, a: &[f32], b: &[u8]) -> f32 {
        pairwise::<NegatedDot, _, _>(a, LeBytes(b))
    }

    fn distance_batch4(&self, origin: &[f32], candidates: [&[f32]; 4]) -> [f32; 4] {
        batch4::<NegatedDot, _, _>(origin, candidates)
    }

    fn distance_batch4_bytes(&self, origin: &[f32], candidates: [&[u8]; 4]) -> [f32; 4] {
        batch4::<NegatedDot, _, _>(origin, candidates.map(LeBytes))
    }

    fn name(&self) -> &'static str {
        "dot"
    }
}

/// Negated inner product of vectors normalized by `pre_process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineDistance;

impl DistanceFunction for CosineDistance {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        pairwise::<NegatedDot, _, _>(a, b)
    }

    fn distance_bytes(&self, a: &[f32], b: &[u8]) -> f32 {
        pairwise::<NegatedDot, _, _>(a, LeBytes(b))
    }

    fn distance_batch4(&self, origin: &[f32], candidates: [&[f32]; 4]) -> [f32; 4] {
        batch4::<NegatedDot, _, _>(origin, candidates)
    }

    fn distance_batch4_bytes(&self, origin: &[f32], candidates: [&[u8]; 4]) -> [f32; 4] {
        batch4::<NegatedDot, _, _>(origin, candidates.map(LeBytes))
    }

    fn pre_process(&self, vector: &mut [f32]) {
        normalize(vector);
    }

    fn name(&self) -> &'static str {
        "cosine"
    }
}

/// Normalizes a vector in place to unit length.
///
/// Vectors with a norm below epsilon are left as-is.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > NORM_EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Metric selection for building and searching an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    #[default]
    L2,
    Dot,
    Cosine,
}

impl Distance {
    /// Kernel used by `IndexReader::nearest`.
    #[must_use]
    pub fn search_function(self) -> &'static dyn DistanceFunction {
        match self {
            Self::L2 => &L2Distance,
            Self::Dot => &DotDistance,
            Self::Cosine => &CosineDistance,
        }
    }

    /// Kernel used while building the graph.
    ///
    /// Cosine vectors are normalized at ingestion, so building uses the
    /// same negated inner product.
    #[must_use]
    pub fn build_function(self) -> &'static dyn DistanceFunction {
        match self {
            Self::L2 => &L2Distance,
            Self::Dot | Self::Cosine => &DotDistance,
        }
    }

    /// Creates the (untrained) quantizer paired with this metric.
    #[must_use]
    pub fn quantizer(self) -> super::PqQuantizer {
        super::PqQuantizer::new()
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.search_function().name())
    }
}

impl FromStr for Distance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(Self::L2),
            "dot" | "ip" => Ok(Self::Dot),
            "cosine" => Ok(Self::Cosine),
            other => Err(format!("unknown distance '{other}', expected l2, dot or cosine")),
        }
    }
}
