//! Disk-resident proximity graph: construction and search.
//!
//! The builder turns `<name>.vectors` into `<name>.graph` (vectors and edge
//! lists in fixed-size pages) and `<name>.data` (medoid, vertex count and
//! quantizer state). The reader opens both and answers approximate
//! nearest-neighbor queries.

pub mod arena;
pub mod builder;
pub mod disk_cache;
pub mod layout;
pub mod merge;
pub mod metadata;
pub mod partition_graph;
pub mod pruning;
pub mod queue;
pub mod reader;
pub mod version;

pub use builder::{BuildParams, BuildReport, IndexBuilder, ensure_disk_space};
pub use disk_cache::{CacheStats, CachedPage, DiskCache};
pub use layout::{DISK_PAGE, GRAPH_EXTENSION, GraphFileWriter, GraphLayout, graph_path};
pub use merge::{MergeStats, merge_edge_sets, merge_partitions};
pub use metadata::{IndexMetadata, METADATA_EXTENSION, metadata_path};
pub use partition_graph::PartitionGraph;
pub use pruning::{PruneParams, greedy_search, prune_index, robust_prune};
pub use queue::{BoundedGreedyVertexPriorityQueue, Insertion, QueueEntry};
pub use reader::{IndexReader, ReaderParams};
pub use version::VersionGuard;
