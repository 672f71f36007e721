//! Product quantization codec.
//!
//! Vectors are split into `quantizer_count` contiguous sub-vector groups.
//! Each group gets its own codebook of `code_base_size` centroids trained
//! with K-means, and every vector is stored as one code byte per group.
//!
//! # Layout
//! - Dimensions are split as evenly as possible; when they do not divide,
//!   the earliest groups take one extra dimension
//! - The centroid table is `quantizer_count x code_base_size x sub_vector_size`
//!   floats where `sub_vector_size` is the widest group; narrower groups are
//!   zero-padded
//! - Codes are a flat `vector_count x quantizer_count` byte array
//!
//! # Search
//! A query builds a flat lookup table of `quantizer_count x code_base_size`
//! partial distances once. Scoring a candidate is then `quantizer_count`
//! table lookups instead of a full distance computation. This is exact for
//! L2 squared and negated inner product, which both sum over coordinates.

use std::io::{self, Read, Write};

use rayon::ThreadPool;
use rayon::prelude::*;
use tracing::debug;

use super::clustering::{ClusterInitializer, ClusterSpace, KMeansClustering, SubVectorSpace};
use super::distance::{DistanceFunction, L2Distance};
use super::reader::VectorReader;
use super::types::{BYTES_PER_F32, VectorError};
use crate::display::ProgressStack;
use crate::error::{IndexError, IndexResult, join_workers};

/// Upper bound of a codebook: one byte per code.
pub const MAX_CODE_BASE_SIZE: usize = 256;

/// Iteration bound for codebook training.
const TRAINING_ITERATIONS: usize = 30;

/// Vectors encoded per parallel work item.
const ENCODE_BATCH: usize = 1024;

/// Product quantizer holding codebooks and per-vector codes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PqQuantizer {
    dimension: usize,
    quantizer_count: usize,
    code_base_size: usize,
    sub_vector_size: usize,
    centroids: Vec<f32>,
    codes: Vec<u8>,
}

/// Number of quantizers for a dimension and compression ratio.
///
/// A ratio is the number of vector bytes one code byte stands for.
pub fn quantizer_count(dimension: usize, compression_ratio: usize) -> Result<usize, VectorError> {
    let invalid = |reason| VectorError::InvalidCompression {
        ratio: compression_ratio,
        dimension,
        reason,
    };
    if compression_ratio == 0 {
        return Err(invalid("Compression ratio must be positive"));
    }
    let bytes = dimension * BYTES_PER_F32;
    if bytes % compression_ratio != 0 {
        return Err(invalid("Vector byte size must be divisible by the compression ratio"));
    }
    let count = bytes / compression_ratio;
    if count == 0 {
        return Err(invalid("Compression ratio leaves no quantizers"));
    }
    if count > dimension {
        return Err(invalid("Quantizer count cannot exceed the vector dimension"));
    }
    Ok(count)
}

impl PqQuantizer {
    /// Untrained quantizer.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        self.quantizer_count > 0
    }

    #[must_use]
    pub fn quantizer_count(&self) -> usize {
        self.quantizer_count
    }

    #[must_use]
    pub fn code_base_size(&self) -> usize {
        self.code_base_size
    }

    #[must_use]
    pub fn sub_vector_size(&self) -> usize {
        self.sub_vector_size
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of encoded vectors.
    #[must_use]
    pub fn vector_count(&self) -> usize {
        self.codes.len().checked_div(self.quantizer_count).unwrap_or(0)
    }

    #[must_use]
    pub fn centroids(&self) -> &[f32] {
        &self.centroids
    }

    #[must_use]
    pub fn pq_codes(&self) -> &[u8] {
        &self.codes
    }

    /// Codes of vector `index`.
    #[must_use]
    pub fn codes_of(&self, index: usize) -> &[u8] {
        let q = self.quantizer_count;
        &self.codes[index * q..(index + 1) * q]
    }

    /// Length of the buffer expected by `build_distance_lookup_table`.
    #[must_use]
    pub fn lookup_table_len(&self) -> usize {
        self.quantizer_count * self.code_base_size
    }

    /// `(offset, width)` of group `group` within a full vector.
    fn group(&self, group: usize) -> (usize, usize) {
        group_bounds(self.dimension, self.quantizer_count, group)
    }

    fn centroid(&self, group: usize, code: usize) -> &[f32] {
        let start = (group * self.code_base_size + code) * self.sub_vector_size;
        &self.centroids[start..start + self.group(group).1]
    }

    /// Trains codebooks on every vector of `reader` and encodes them.
    ///
    /// Codebooks hold `min(256, n)` centroids. Fails with
    /// `InvalidConfiguration` before touching the data if the compression
    /// ratio does not split the dimension into whole groups.
    pub fn generate_pq_codes<R: VectorReader + ?Sized>(
        &mut self,
        pool: &ThreadPool,
        dimension: usize,
        compression_ratio: usize,
        reader: &R,
        progress: &ProgressStack,
    ) -> IndexResult<()> {
        let code_base_size = reader.size().min(MAX_CODE_BASE_SIZE);
        self.generate_pq_codes_with_code_base(
            pool,
            dimension,
            compression_ratio,
            code_base_size,
            reader,
            progress,
        )
    }

    /// Like `generate_pq_codes` with an explicit codebook size.
    ///
    /// `code_base_size` must lie in `1..=min(256, n)`.
    pub fn generate_pq_codes_with_code_base<R: VectorReader + ?Sized>(
        &mut self,
        pool: &ThreadPool,
        dimension: usize,
        compression_ratio: usize,
        code_base_size: usize,
        reader: &R,
        progress: &ProgressStack,
    ) -> IndexResult<()> {
        let quantizer_count = quantizer_count(dimension, compression_ratio)
            .map_err(|e| IndexError::invalid_config(e.to_string()))?;
        if reader.dimensions() != dimension {
            return Err(VectorError::DimensionMismatch {
                expected: dimension,
                actual: reader.dimensions(),
            }
            .into());
        }
        let n = reader.size();
        if n == 0 {
            return Err(IndexError::invalid_config(
                "Cannot train a quantizer on zero vectors",
            ));
        }
        if code_base_size == 0 || code_base_size > n.min(MAX_CODE_BASE_SIZE) {
            return Err(IndexError::invalid_config(format!(
                "Codebook size {code_base_size} must be between 1 and {}",
                n.min(MAX_CODE_BASE_SIZE)
            )));
        }

        let sub_vector_size = dimension.div_ceil(quantizer_count);
        debug!(
            quantizer_count,
            code_base_size, sub_vector_size, "training product quantizer"
        );

        self.dimension = dimension;
        self.quantizer_count = quantizer_count;
        self.code_base_size = code_base_size;
        self.sub_vector_size = sub_vector_size;

        let training = progress.push("Training codebooks", quantizer_count as u64);
        let tables: Vec<Vec<f32>> = join_workers("codebook training", || {
            pool.install(|| {
                (0..quantizer_count)
                    .into_par_iter()
                    .map(|group| {
                        let (offset, width) = group_bounds(dimension, quantizer_count, group);
                        let space = SubVectorSpace::new(reader, offset, width, &L2Distance);
                        let result = KMeansClustering::new(
                            code_base_size,
                            ClusterInitializer::KMeansPlusPlus,
                            group as u64,
                        )
                        .with_max_iterations(TRAINING_ITERATIONS)
                        .fit(pool, &space);
                        training.report(1);
                        result.map(|r| r.centroids)
                    })
                    .collect::<Result<_, _>>()
            })
        })??;
        drop(training);

        self.centroids = vec![0.0; quantizer_count * code_base_size * sub_vector_size];
        for (group, table) in tables.iter().enumerate() {
            let width = self.group(group).1;
            for code in 0..code_base_size {
                let start = (group * code_base_size + code) * sub_vector_size;
                self.centroids[start..start + width]
                    .copy_from_slice(&table[code * width..(code + 1) * width]);
            }
        }

        let encoding = progress.push("Encoding vectors", n as u64);
        let mut codes = vec![0u8; n * quantizer_count];
        let this = &*self;
        join_workers("encoding", || {
            pool.install(|| {
                codes
                    .par_chunks_mut(quantizer_count * ENCODE_BATCH)
                    .enumerate()
                    .for_each(|(batch, chunk)| {
                        let base = batch * ENCODE_BATCH;
                        for (offset, out) in chunk.chunks_mut(quantizer_count).enumerate() {
                            this.encode_into(reader.read(base + offset), out);
                        }
                        encoding.report((chunk.len() / quantizer_count) as u64);
                    });
            })
        })?;
        self.codes = codes;
        Ok(())
    }

    fn encode_into(&self, vector: &[f32], out: &mut [u8]) {
        for (group, code) in out.iter_mut().enumerate() {
            let (offset, width) = self.group(group);
            let sub = &vector[offset..offset + width];
            let mut best = (0usize, f32::INFINITY);
            for c in 0..self.code_base_size {
                let d = L2Distance.distance(sub, self.centroid(group, c));
                if d < best.1 {
                    best = (c, d);
                }
            }
            *code = best.0 as u8;
        }
    }

    /// Encodes a single vector with the trained codebooks.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>, VectorError> {
        if !self.is_trained() {
            return Err(VectorError::Untrained);
        }
        if vector.len() != self.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let mut out = vec![0u8; self.quantizer_count];
        self.encode_into(vector, &mut out);
        Ok(out)
    }

    /// Fills `table` with the distance from each query sub-vector to every
    /// centroid of the matching group.
    pub fn build_distance_lookup_table(
        &self,
        query: &[f32],
        table: &mut [f32],
        distance: &dyn DistanceFunction,
    ) {
        debug_assert_eq!(table.len(), self.lookup_table_len());
        for group in 0..self.quantizer_count {
            let (offset, width) = self.group(group);
            let sub = &query[offset..offset + width];
            let row = &mut table[group * self.code_base_size..(group + 1) * self.code_base_size];
            for (code, slot) in row.iter_mut().enumerate() {
                *slot = distance.distance(sub, self.centroid(group, code));
            }
        }
    }

    /// Approximate distance to vector `index` through a lookup table.
    #[inline]
    #[must_use]
    pub fn compute_distance(&self, table: &[f32], index: usize) -> f32 {
        let cbs = self.code_base_size;
        self.codes_of(index)
            .iter()
            .enumerate()
            .map(|(group, &code)| table[group * cbs + code as usize])
            .sum()
    }

    /// Four lookup-table distances in one pass over the groups.
    #[must_use]
    pub fn compute_distance_batch4(&self, table: &[f32], indices: [usize; 4]) -> [f32; 4] {
        let q = self.quantizer_count;
        let cbs = self.code_base_size;
        let codes = indices.map(|i| &self.codes[i * q..(i + 1) * q]);
        let mut acc = [0.0f32; 4];
        for group in 0..q {
            let row = &table[group * cbs..(group + 1) * cbs];
            for lane in 0..4 {
                acc[lane] += row[codes[lane][group] as usize];
            }
        }
        acc
    }

    /// Reconstructs vector `index` from its codes.
    pub fn decode_vector(&self, index: usize, out: &mut [f32]) {
        self.decode_codes(self.codes_of(index), out);
    }

    /// Reconstructs a vector from an explicit code array.
    pub fn decode_codes(&self, codes: &[u8], out: &mut [f32]) {
        for (group, &code) in codes.iter().enumerate() {
            let (offset, width) = self.group(group);
            out[offset..offset + width].copy_from_slice(self.centroid(group, code as usize));
        }
    }

    /// Mean relative reconstruction error `|v - decode(v)| / |v|`.
    ///
    /// Zero vectors contribute their absolute error.
    pub fn reconstruction_error<R: VectorReader + ?Sized>(&self, reader: &R) -> f64 {
        let n = reader.size().min(self.vector_count());
        if n == 0 {
            return 0.0;
        }
        let mut decoded = vec![0.0f32; self.dimension];
        let mut total = 0.0f64;
        for i in 0..n {
            self.decode_vector(i, &mut decoded);
            let v = reader.read(i);
            let err = f64::from(L2Distance.distance(v, &decoded)).sqrt();
            let norm = f64::from(v.iter().map(|x| x * x).sum::<f32>()).sqrt();
            total += if norm > 0.0 { err / norm } else { err };
        }
        total / n as f64
    }

    /// Writes the quantizer payload in little-endian order.
    pub fn store<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&(self.quantizer_count as i32).to_le_bytes())?;
        writer.write_all(&(self.code_base_size as i32).to_le_bytes())?;
        writer.write_all(&(self.sub_vector_size as i32).to_le_bytes())?;
        for value in &self.centroids {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.write_all(&(self.codes.len() as i64).to_le_bytes())?;
        writer.write_all(&self.codes)?;
        Ok(())
    }

    /// Reads a payload written by `store` for vectors of `dimension`.
    pub fn load<R: Read>(reader: &mut R, dimension: usize) -> io::Result<Self> {
        let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);

        let quantizer_count = read_i32(reader)?;
        let code_base_size = read_i32(reader)?;
        let sub_vector_size = read_i32(reader)?;
        if quantizer_count <= 0
            || quantizer_count as usize > dimension
            || code_base_size <= 0
            || code_base_size as usize > MAX_CODE_BASE_SIZE
        {
            return Err(invalid(format!(
                "quantizer shape {quantizer_count}x{code_base_size} does not fit dimension {dimension}"
            )));
        }
        let (quantizer_count, code_base_size) = (quantizer_count as usize, code_base_size as usize);
        if sub_vector_size < 0 || sub_vector_size as usize != dimension.div_ceil(quantizer_count) {
            return Err(invalid(format!(
                "sub-vector size {sub_vector_size} does not match dimension {dimension}"
            )));
        }
        let sub_vector_size = sub_vector_size as usize;

        let mut centroid_bytes = vec![0u8; quantizer_count * code_base_size * sub_vector_size * 4];
        reader.read_exact(&mut centroid_bytes)?;
        let centroids = centroid_bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let mut len = [0u8; 8];
        reader.read_exact(&mut len)?;
        let len = i64::from_le_bytes(len);
        if len < 0 || len as usize % quantizer_count != 0 {
            return Err(invalid(format!("invalid PQ code length {len}")));
        }
        let mut codes = vec![0u8; len as usize];
        reader.read_exact(&mut codes)?;
        if let Some(bad) = codes.iter().find(|&&c| c as usize >= code_base_size) {
            return Err(invalid(format!("PQ code {bad} outside codebook of {code_base_size}")));
        }

        Ok(Self {
            dimension,
            quantizer_count,
            code_base_size,
            sub_vector_size,
            centroids,
            codes,
        })
    }
}

fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn group_bounds(dimension: usize, quantizer_count: usize, group: usize) -> (usize, usize) {
    let base = dimension / quantizer_count;
    let extra = dimension % quantizer_count;
    let width = base + usize::from(group < extra);
    let offset = group * base + group.min(extra);
    (offset, width)
}

/// Vectors seen through their PQ codes.
///
/// Used to cluster the whole set without touching the raw vectors: each
/// centroid is prepared into a lookup table, so assigning a vector costs
/// `quantizer_count` lookups per centroid.
pub struct PqSpace<'a> {
    quantizer: &'a PqQuantizer,
    distance: &'a dyn DistanceFunction,
}

impl<'a> PqSpace<'a> {
    pub fn new(quantizer: &'a PqQuantizer, distance: &'a dyn DistanceFunction) -> Self {
        Self {
            quantizer,
            distance,
        }
    }
}

impl ClusterSpace for PqSpace<'_> {
    type Prepared = Vec<f32>;

    fn len(&self) -> usize {
        self.quantizer.vector_count()
    }

    fn dimensions(&self) -> usize {
        self.quantizer.dimension
    }

    fn accumulate(&self, index: usize, acc: &mut [f32]) {
        for (group, &code) in self.quantizer.codes_of(index).iter().enumerate() {
            let (offset, _) = self.quantizer.group(group);
            let centroid = self.quantizer.centroid(group, code as usize);
            for (a, c) in acc[offset..].iter_mut().zip(centroid) {
                *a += c;
            }
        }
    }

    fn copy_vector(&self, index: usize, out: &mut [f32]) {
        self.quantizer.decode_vector(index, out);
    }

    fn prepare(&self, centroids: &[f32]) -> Vec<f32> {
        let dim = self.quantizer.dimension;
        let len = self.quantizer.lookup_table_len();
        let mut tables = vec![0.0f32; centroids.len() / dim * len];
        for (centroid, table) in centroids.chunks_exact(dim).zip(tables.chunks_exact_mut(len)) {
            self.quantizer
                .build_distance_lookup_table(centroid, table, self.distance);
        }
        tables
    }

    fn distance(&self, prepared: &Vec<f32>, index: usize, cluster: usize) -> f32 {
        let len = self.quantizer.lookup_table_len();
        self.quantizer
            .compute_distance(&prepared[cluster * len..(cluster + 1) * len], index)
    }
}
