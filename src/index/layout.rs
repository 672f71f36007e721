//! Page layout of the global graph file and its build-time writer.
//!
//! # Record
//! `[reserved: 8 bytes][vector: dim x f32][edge count: u32][edges: max_connections x u32]`
//! All values are little-endian.
//!
//! # Pages
//! As many whole records as fit in 4 KiB (at least one) make a page; the
//! page size is rounded up to a multiple of 4 KiB so pages never straddle
//! an OS page boundary.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{IndexError, IndexResult};
use crate::vector::{BYTES_PER_F32, VertexIndex};

/// Unit of page alignment.
pub const DISK_PAGE: usize = 4096;

/// Reserved bytes at the start of every record.
pub const RECORD_HEADER: usize = 8;

/// File extension of the graph file.
pub const GRAPH_EXTENSION: &str = "graph";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphLayout {
    pub dimension: usize,
    pub max_connections: usize,
    pub record_size: usize,
    pub vertices_per_page: usize,
    pub page_size: usize,
}

impl GraphLayout {
    pub fn new(dimension: usize, max_connections: usize) -> Self {
        let record_size =
            RECORD_HEADER + dimension * BYTES_PER_F32 + 4 + max_connections * 4;
        let vertices_per_page = (DISK_PAGE / record_size).max(1);
        let page_size = (vertices_per_page * record_size).div_ceil(DISK_PAGE) * DISK_PAGE;
        Self {
            dimension,
            max_connections,
            record_size,
            vertices_per_page,
            page_size,
        }
    }

    /// Page holding vertex `vertex`.
    pub fn page_of(&self, vertex: VertexIndex) -> usize {
        vertex as usize / self.vertices_per_page
    }

    /// Offset of `vertex`'s record within its page.
    pub fn offset_in_page(&self, vertex: VertexIndex) -> usize {
        (vertex as usize % self.vertices_per_page) * self.record_size
    }

    /// Start of `vertex`'s record in the file.
    pub fn vertex_offset(&self, vertex: VertexIndex) -> usize {
        self.page_of(vertex) * self.page_size + self.offset_in_page(vertex)
    }

    /// Start of `vertex`'s vector in the file.
    pub fn vector_offset(&self, vertex: VertexIndex) -> usize {
        self.vertex_offset(vertex) + RECORD_HEADER
    }

    /// Start of `vertex`'s edge count in the file.
    pub fn edges_offset(&self, vertex: VertexIndex) -> usize {
        self.vector_offset(vertex) + self.dimension * BYTES_PER_F32
    }

    pub fn page_count(&self, vertices: usize) -> usize {
        vertices.div_ceil(self.vertices_per_page)
    }

    pub fn file_size(&self, vertices: usize) -> u64 {
        (self.page_count(vertices) * self.page_size) as u64
    }

    /// Vector bytes of `vertex` within its page.
    pub fn record_vector<'a>(&self, page: &'a [u8], vertex: VertexIndex) -> &'a [u8] {
        let start = self.offset_in_page(vertex) + RECORD_HEADER;
        &page[start..start + self.dimension * BYTES_PER_F32]
    }

    /// Edge list of `vertex` read from its page.
    pub fn record_edges(&self, page: &[u8], vertex: VertexIndex, out: &mut Vec<VertexIndex>) {
        let start = self.offset_in_page(vertex) + RECORD_HEADER + self.dimension * BYTES_PER_F32;
        let count = (read_u32(page, start) as usize).min(self.max_connections);
        out.clear();
        out.extend((0..count).map(|i| read_u32(page, start + 4 + i * 4)));
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Path of the graph file for index `name` inside `dir`.
pub fn graph_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{GRAPH_EXTENSION}"))
}

/// Writable mapping of a graph file being built.
pub struct GraphFileWriter {
    path: PathBuf,
    mmap: Option<MmapMut>,
    layout: GraphLayout,
    vertices: usize,
}

impl GraphFileWriter {
    /// Creates (or truncates) the file sized for `vertices` records.
    pub fn create(
        path: impl Into<PathBuf>,
        layout: GraphLayout,
        vertices: usize,
    ) -> IndexResult<Self> {
        let path = path.into();
        let write_err = |source| IndexError::FileWrite {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(write_err)?;
        let size = layout.file_size(vertices);
        file.set_len(size).map_err(write_err)?;

        let mmap = if size == 0 {
            None
        } else {
            // SAFETY: the file was just created for this writer and is not
            // resized while mapped.
            Some(unsafe { MmapMut::map_mut(&file) }.map_err(write_err)?)
        };

        Ok(Self {
            path,
            mmap,
            layout,
            vertices,
        })
    }

    pub fn layout(&self) -> &GraphLayout {
        &self.layout
    }

    fn bytes(&mut self, offset: usize, len: usize) -> &mut [u8] {
        match &mut self.mmap {
            Some(mmap) => &mut mmap[offset..offset + len],
            None => &mut [],
        }
    }

    pub fn write_vector(&mut self, vertex: VertexIndex, vector: &[f32]) {
        debug_assert!((vertex as usize) < self.vertices);
        let offset = self.layout.vector_offset(vertex);
        let out = self.bytes(offset, vector.len() * BYTES_PER_F32);
        for (chunk, value) in out.chunks_exact_mut(BYTES_PER_F32).zip(vector) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn write_edges(&mut self, vertex: VertexIndex, edges: &[VertexIndex]) {
        debug_assert!(edges.len() <= self.layout.max_connections);
        let offset = self.layout.edges_offset(vertex);
        let out = self.bytes(offset, 4 + edges.len() * 4);
        out[..4].copy_from_slice(&(edges.len() as u32).to_le_bytes());
        for (chunk, edge) in out[4..].chunks_exact_mut(4).zip(edges) {
            chunk.copy_from_slice(&edge.to_le_bytes());
        }
    }

    /// Flushes the mapping and closes the file.
    pub fn finish(self) -> IndexResult<PathBuf> {
        if let Some(mmap) = &self.mmap {
            mmap.flush().map_err(|source| IndexError::FileWrite {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(self.path)
    }
}
