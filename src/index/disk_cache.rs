//! Page cache over the memory-mapped graph file.
//!
//! Search pins the pages of vertices whose exact distance it has computed
//! and unpins them when the vertex leaves the candidate queue. Only unpinned
//! pages are evicted, least recently used first, so the cache may briefly
//! exceed its capacity while many pages are pinned.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use memmap2::Mmap;
use parking_lot::Mutex;

use super::layout::GraphLayout;
use crate::error::{IndexError, IndexResult};
use crate::vector::VertexIndex;

/// One graph page copied out of the mapping.
#[derive(Debug)]
pub struct CachedPage {
    index: usize,
    bytes: Box<[u8]>,
}

impl CachedPage {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug)]
struct Entry {
    page: Arc<CachedPage>,
    pins: usize,
}

/// Counters since the cache was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident_pages: usize,
    pub locked_pages: usize,
}

#[derive(Debug)]
pub struct DiskCache {
    path: PathBuf,
    mmap: Option<Mmap>,
    layout: GraphLayout,
    page_count: usize,
    capacity: usize,
    pages: Mutex<LruCache<usize, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DiskCache {
    /// Maps the graph file of `vertices` records, keeping roughly
    /// `cache_bytes` of pages resident.
    pub fn open(
        path: &Path,
        layout: GraphLayout,
        vertices: usize,
        cache_bytes: usize,
    ) -> IndexResult<Self> {
        let file = File::open(path).map_err(|source| IndexError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| IndexError::FileRead {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let expected = layout.file_size(vertices);
        if len != expected {
            return Err(IndexError::corrupt(
                path,
                format!("graph file has {len} bytes, expected {expected} for {vertices} vertices"),
            ));
        }

        let mmap = if len == 0 {
            None
        } else {
            // SAFETY: the graph file is immutable once built.
            Some(unsafe { Mmap::map(&file) }.map_err(|source| IndexError::FileRead {
                path: path.to_path_buf(),
                source,
            })?)
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            layout,
            page_count: layout.page_count(vertices),
            capacity: (cache_bytes / layout.page_size).max(1),
            pages: Mutex::new(LruCache::unbounded()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &GraphLayout {
        &self.layout
    }

    /// Pages kept resident when nothing is pinned.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn load(&self, index: usize) -> IndexResult<Arc<CachedPage>> {
        let mmap = match &self.mmap {
            Some(mmap) if index < self.page_count => mmap,
            _ => {
                return Err(IndexError::corrupt(
                    &self.path,
                    format!("page {index} outside {} pages", self.page_count),
                ));
            }
        };
        let start = index * self.layout.page_size;
        let bytes = mmap[start..start + self.layout.page_size].into();
        Ok(Arc::new(CachedPage { index, bytes }))
    }

    /// Drops unpinned pages, oldest first, until within capacity.
    fn evict(&self, pages: &mut LruCache<usize, Entry>) {
        if pages.len() <= self.capacity {
            return;
        }
        let excess = pages.len() - self.capacity;
        let victims: Vec<usize> = pages
            .iter()
            .rev()
            .filter(|(_, entry)| entry.pins == 0)
            .map(|(&index, _)| index)
            .take(excess)
            .collect();
        for index in victims {
            pages.pop(&index);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns page `index`, pinning it when `pin` is set.
    fn fetch(&self, index: usize, pin: bool) -> IndexResult<Arc<CachedPage>> {
        let mut pages = self.pages.lock();
        if let Some(entry) = pages.get_mut(&index) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if pin {
                entry.pins += 1;
            }
            return Ok(Arc::clone(&entry.page));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let page = self.load(index)?;
        pages.put(
            index,
            Entry {
                page: Arc::clone(&page),
                pins: usize::from(pin),
            },
        );
        self.evict(&mut pages);
        Ok(page)
    }

    /// Pins page `index` and returns it.
    pub fn lock_page(&self, index: usize) -> IndexResult<Arc<CachedPage>> {
        self.fetch(index, true)
    }

    /// Pins the page holding `vertex` and returns it.
    pub fn pin_vertex(&self, vertex: VertexIndex) -> IndexResult<Arc<CachedPage>> {
        self.lock_page(self.layout.page_of(vertex))
    }

    /// Releases one pin on page `index`.
    pub fn unlock_page(&self, index: usize) -> IndexResult<()> {
        let mut pages = self.pages.lock();
        match pages.peek_mut(&index) {
            Some(entry) if entry.pins > 0 => {
                entry.pins -= 1;
            }
            _ => {
                return Err(IndexError::protocol(format!(
                    "unlock of page {index} which is not locked"
                )));
            }
        }
        self.evict(&mut pages);
        Ok(())
    }

    pub fn unpin_vertex(&self, vertex: VertexIndex) -> IndexResult<()> {
        self.unlock_page(self.layout.page_of(vertex))
    }

    /// Returns page `index` without pinning it.
    pub fn page(&self, index: usize) -> IndexResult<Arc<CachedPage>> {
        self.fetch(index, false)
    }

    /// Vector bytes of `vertex`, which must live on `page`.
    pub fn vector_bytes<'a>(&self, page: &'a CachedPage, vertex: VertexIndex) -> &'a [u8] {
        debug_assert_eq!(page.index, self.layout.page_of(vertex));
        self.layout.record_vector(&page.bytes, vertex)
    }

    /// Edge list of `vertex`, which must live on `page`.
    pub fn edges(&self, page: &CachedPage, vertex: VertexIndex, out: &mut Vec<VertexIndex>) {
        debug_assert_eq!(page.index, self.layout.page_of(vertex));
        self.layout.record_edges(&page.bytes, vertex, out);
    }

    /// Loads pages without pinning them.
    pub fn prefetch(&self, pages: &[usize]) -> IndexResult<()> {
        for &index in pages {
            self.fetch(index, false)?;
        }
        Ok(())
    }

    pub fn locked_pages(&self) -> usize {
        self.pages.lock().iter().filter(|(_, e)| e.pins > 0).count()
    }

    pub fn stats(&self) -> CacheStats {
        let pages = self.pages.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident_pages: pages.len(),
            locked_pages: pages.iter().filter(|(_, e)| e.pins > 0).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::layout::{GraphFileWriter, graph_path};
    use tempfile::TempDir;

    /// Graph of 3-dim vectors with 4 vertices per page.
    fn graph(dir: &Path, vertices: usize) -> (PathBuf, GraphLayout) {
        // record = 8 + 12 + 4 + 4 * 249 = 1020 bytes, four per page
        let layout = GraphLayout::new(3, 249);
        assert_eq!(layout.vertices_per_page, 4);
        let path = graph_path(dir, "docs");
        let mut writer = GraphFileWriter::create(&path, layout, vertices).unwrap();
        for v in 0..vertices as u32 {
            writer.write_vector(v, &[v as f32, 0.0, 1.0]);
            writer.write_edges(v, &[(v + 1) % vertices as u32]);
        }
        writer.finish().unwrap();
        (path, layout)
    }

    #[test]
    fn test_pinned_pages_survive_eviction() {
        let temp_dir = TempDir::new().unwrap();
        let (path, layout) = graph(temp_dir.path(), 16);
        let cache = DiskCache::open(&path, layout, 16, layout.page_size).unwrap();
        assert_eq!(cache.capacity(), 1);

        let page = cache.pin_vertex(5).unwrap();
        assert_eq!(page.index(), 1);
        cache.prefetch(&[0, 2, 3]).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.locked_pages, 1);
        assert_eq!(stats.resident_pages, 1);

        // Still resident: a hit.
        cache.lock_page(1).unwrap();
        assert_eq!(cache.stats().hits, 1);
        cache.unlock_page(1).unwrap();
        cache.unpin_vertex(5).unwrap();
        assert_eq!(cache.locked_pages(), 0);
    }

    #[test]
    fn test_page_contents_match_file() {
        let temp_dir = TempDir::new().unwrap();
        let (path, layout) = graph(temp_dir.path(), 10);
        let cache = DiskCache::open(&path, layout, 10, 1 << 20).unwrap();

        let page = cache.pin_vertex(9).unwrap();
        let mut edges = Vec::new();
        cache.edges(&page, 9, &mut edges);
        assert_eq!(edges, vec![0]);
        let vector = cache.vector_bytes(&page, 9);
        assert_eq!(f32::from_le_bytes(vector[..4].try_into().unwrap()), 9.0);
        cache.unpin_vertex(9).unwrap();
    }

    #[test]
    fn test_unlock_of_unpinned_page_is_protocol_violation() {
        let temp_dir = TempDir::new().unwrap();
        let (path, layout) = graph(temp_dir.path(), 8);
        let cache = DiskCache::open(&path, layout, 8, 1 << 20).unwrap();
        cache.prefetch(&[0]).unwrap();
        assert!(matches!(
            cache.unlock_page(0),
            Err(IndexError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            cache.unlock_page(1),
            Err(IndexError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_wrong_vertex_count_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let (path, layout) = graph(temp_dir.path(), 8);
        assert!(matches!(
            DiskCache::open(&path, layout, 20, 1 << 20),
            Err(IndexError::CorruptOrIncompatibleIndex { .. })
        ));
        assert!(matches!(
            DiskCache::open(&path, GraphLayout::new(3, 8), 8, 1 << 20),
            Err(IndexError::CorruptOrIncompatibleIndex { .. })
        ));
    }
}
