//! Raw vector store file and its memory-mapped reader.
//!
//! The builder consumes vectors from `<name>.vectors`, a headerless file of
//! fixed-size native-endian `f32` records written through a buffered,
//! append-only channel. The file is mapped once for a sequential build pass
//! and deleted when the index is complete.
//!
//! # Storage Format
//!
//! - No header: `vector_count = file_len / (dimension * 4)`
//! - Vectors: contiguous `f32` arrays, one record per vector

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use thiserror::Error;

use super::distance::DistanceFunction;
use super::reader::{InMemoryVectors, VectorReader};
use super::types::{BYTES_PER_F32, VectorDimension, VectorError};

/// File extension of the raw vector store.
pub const VECTORS_EXTENSION: &str = "vectors";

/// Errors specific to vector storage operations.
#[derive(Error, Debug)]
pub enum VectorStorageError {
    #[error("IO error on '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Invalid storage format in '{path}': {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
}

impl VectorStorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Path of the raw vector store for index `name` inside `dir`.
pub fn vectors_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{VECTORS_EXTENSION}"))
}

/// Buffered append-only writer for the raw vector store.
///
/// Every vector goes through the metric's `pre_process` transform before it
/// is written, so cosine indexes store normalized vectors.
pub struct RawVectorWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    dimension: VectorDimension,
    distance: &'static dyn DistanceFunction,
    written: usize,
    scratch: Vec<f32>,
}

impl RawVectorWriter {
    /// Opens (or creates) the store for appending.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        dimension: VectorDimension,
        distance: &'static dyn DistanceFunction,
    ) -> Result<Self, VectorStorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| VectorStorageError::io(dir, e))?;
        let path = vectors_path(dir, name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| VectorStorageError::io(&path, e))?;

        let existing = file
            .metadata()
            .map_err(|e| VectorStorageError::io(&path, e))?
            .len() as usize;
        if existing % dimension.byte_len() != 0 {
            return Err(VectorStorageError::InvalidFormat {
                path,
                reason: format!(
                    "length {existing} is not a multiple of the {}-byte record size",
                    dimension.byte_len()
                ),
            });
        }

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            dimension,
            distance,
            written: existing / dimension.byte_len(),
            scratch: Vec::with_capacity(dimension.get()),
        })
    }

    /// Appends one vector, returning its index.
    pub fn append(&mut self, vector: &[f32]) -> Result<usize, VectorStorageError> {
        self.dimension.validate_vector(vector)?;
        self.scratch.clear();
        self.scratch.extend_from_slice(vector);
        self.distance.pre_process(&mut self.scratch);

        for value in &self.scratch {
            self.writer
                .write_all(&value.to_ne_bytes())
                .map_err(|e| VectorStorageError::io(&self.path, e))?;
        }
        self.written += 1;
        Ok(self.written - 1)
    }

    /// Appends a batch of vectors.
    pub fn append_all<'a>(
        &mut self,
        vectors: impl IntoIterator<Item = &'a [f32]>,
    ) -> Result<(), VectorStorageError> {
        for vector in vectors {
            self.append(vector)?;
        }
        Ok(())
    }

    /// Number of vectors in the store, including previously written ones.
    #[must_use]
    pub fn vector_count(&self) -> usize {
        self.written
    }

    /// Flushes buffered records and closes the store.
    pub fn finish(mut self) -> Result<PathBuf, VectorStorageError> {
        self.writer
            .flush()
            .map_err(|e| VectorStorageError::io(&self.path, e))?;
        Ok(self.path)
    }
}

/// Memory-mapped reader over the raw vector store.
#[derive(Debug)]
pub struct MmapVectorReader {
    path: PathBuf,
    mmap: Option<Mmap>,
    dimension: VectorDimension,
    vector_count: usize,
}

impl MmapVectorReader {
    /// Maps an existing store.
    ///
    /// Returns an error if the file length is not a whole number of records.
    pub fn open(
        path: impl AsRef<Path>,
        dimension: VectorDimension,
    ) -> Result<Self, VectorStorageError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| VectorStorageError::io(&path, e))?;
        let len = file
            .metadata()
            .map_err(|e| VectorStorageError::io(&path, e))?
            .len() as usize;

        if len % dimension.byte_len() != 0 {
            return Err(VectorStorageError::InvalidFormat {
                path,
                reason: format!(
                    "length {len} is not a multiple of the {}-byte record size",
                    dimension.byte_len()
                ),
            });
        }

        // Zero-length files cannot be mapped on every platform.
        let mmap = if len == 0 {
            None
        } else {
            let mmap = unsafe { MmapOptions::new().map(&file) }
                .map_err(|e| VectorStorageError::io(&path, e))?;
            if mmap.as_ptr().align_offset(std::mem::align_of::<f32>()) != 0 {
                return Err(VectorStorageError::InvalidFormat {
                    path,
                    reason: "mapping is not f32-aligned".to_string(),
                });
            }
            Some(mmap)
        };

        Ok(Self {
            path,
            mmap,
            dimension,
            vector_count: len / dimension.byte_len(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn floats(&self) -> &[f32] {
        match &self.mmap {
            // SAFETY: alignment was checked at open, the length is a whole
            // number of f32 records and the mapping is never written through.
            Some(mmap) => unsafe {
                std::slice::from_raw_parts(mmap.as_ptr().cast::<f32>(), mmap.len() / BYTES_PER_F32)
            },
            None => &[],
        }
    }
}

impl VectorReader for MmapVectorReader {
    fn size(&self) -> usize {
        self.vector_count
    }

    fn dimensions(&self) -> usize {
        self.dimension.get()
    }

    fn read(&self, index: usize) -> &[f32] {
        let dim = self.dimension.get();
        &self.floats()[index * dim..(index + 1) * dim]
    }
}

/// Reads an `.fvecs` file: each record is a little-endian `i32` dimension
/// followed by that many little-endian `f32` values.
///
/// Every record must share the first record's dimension.
pub fn read_fvecs(path: impl AsRef<Path>) -> Result<InMemoryVectors, VectorStorageError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| VectorStorageError::io(path, e))?;
    let invalid = |reason: String| VectorStorageError::InvalidFormat {
        path: path.to_path_buf(),
        reason,
    };

    let mut vectors: Option<InMemoryVectors> = None;
    let mut row = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let header = bytes
            .get(offset..offset + 4)
            .ok_or_else(|| invalid(format!("truncated record header at byte {offset}")))?;
        let dim = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if dim <= 0 {
            return Err(invalid(format!("record dimension {dim} at byte {offset}")));
        }
        let dim = dim as usize;
        offset += 4;

        let body = bytes
            .get(offset..offset + dim * BYTES_PER_F32)
            .ok_or_else(|| invalid(format!("truncated record at byte {offset}")))?;
        row.clear();
        row.extend(
            body.chunks_exact(BYTES_PER_F32)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        offset += dim * BYTES_PER_F32;

        if vectors.is_none() {
            vectors = Some(InMemoryVectors::new(VectorDimension::new(dim)?));
        }
        if let Some(set) = vectors.as_mut() {
            set.push(&row)?;
        }
    }

    vectors.ok_or_else(|| invalid("file holds no vectors".to_string()))
}
