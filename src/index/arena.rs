//! Disk-backed arena of fixed-size vertex slots.
//!
//! One temporary file holds two regions addressed by local vertex index:
//! - vectors: `vertices * dimension` floats, written once while loading
//!   the partition and read-only afterwards
//! - edges: `vertices * (1 + max_connections)` words, a count followed by
//!   the edge slots, mutated concurrently through atomics
//!
//! The arena owns the file: dropping it unmaps the memory and deletes the
//! file.

use std::path::Path;
use std::sync::atomic::AtomicU32;

use memmap2::MmapMut;
use tempfile::NamedTempFile;

use crate::error::{IndexError, IndexResult};
use crate::vector::BYTES_PER_F32;

pub struct MmapArena {
    // Declared before `file` so the mapping is released first.
    mmap: MmapMut,
    file: NamedTempFile,
    vertices: usize,
    dimension: usize,
    slot_words: usize,
}

impl MmapArena {
    /// Creates a zeroed arena file inside `dir`.
    pub fn create(
        dir: &Path,
        vertices: usize,
        dimension: usize,
        max_connections: usize,
    ) -> IndexResult<Self> {
        let slot_words = 1 + max_connections;
        let bytes = (vertices * dimension + vertices * slot_words) * BYTES_PER_F32;

        let file = tempfile::Builder::new()
            .prefix("partition-")
            .suffix(".arena")
            .tempfile_in(dir)
            .map_err(|source| IndexError::FileWrite {
                path: dir.to_path_buf(),
                source,
            })?;
        // A zero-length mapping is rejected by some platforms.
        file.as_file()
            .set_len(bytes.max(BYTES_PER_F32) as u64)
            .map_err(|source| IndexError::FileWrite {
                path: file.path().to_path_buf(),
                source,
            })?;

        // SAFETY: the file is private to this arena and is neither truncated
        // nor mapped elsewhere while the mapping lives.
        let mmap = unsafe { MmapMut::map_mut(file.as_file()) }.map_err(|source| {
            IndexError::FileWrite {
                path: file.path().to_path_buf(),
                source,
            }
        })?;

        Ok(Self {
            mmap,
            file,
            vertices,
            dimension,
            slot_words,
        })
    }

    pub fn vertices(&self) -> usize {
        self.vertices
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn vector_floats(&self) -> usize {
        self.vertices * self.dimension
    }

    /// Whole vector region for loading.
    pub fn vectors_mut(&mut self) -> &mut [f32] {
        let len = self.vector_floats();
        // SAFETY: the mapping is page-aligned, at least `len` floats long,
        // and `&mut self` excludes every other view into it.
        unsafe { std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr().cast::<f32>(), len) }
    }

    /// Vector of local vertex `index`.
    pub fn vector(&self, index: usize) -> &[f32] {
        // SAFETY: as in `vectors_mut`; shared views only coexist with the
        // edge region, which does not overlap the vector region.
        let all = unsafe {
            std::slice::from_raw_parts(self.mmap.as_ptr().cast::<f32>(), self.vector_floats())
        };
        &all[index * self.dimension..(index + 1) * self.dimension]
    }

    /// Edge slot of local vertex `index`: the count word then the edges.
    pub fn edge_slot(&self, index: usize) -> &[AtomicU32] {
        let words = self.vertices * self.slot_words;
        // SAFETY: the edge region starts right after the vector region, is
        // 4-byte aligned and in bounds. `AtomicU32` has the layout of `u32`
        // and all writes to the region go through these atomics.
        let all = unsafe {
            let start = self.mmap.as_ptr().add(self.vector_floats() * BYTES_PER_F32);
            std::slice::from_raw_parts(start.cast::<AtomicU32>(), words)
        };
        &all[index * self.slot_words..(index + 1) * self.slot_words]
    }
}
