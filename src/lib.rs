//! Disk-resident approximate nearest-neighbor index.
//!
//! Vectors are product-quantized for in-memory distance estimates and
//! linked into a bounded-degree proximity graph stored in page-aligned
//! records on disk. Searches walk the graph from its medoid, upgrading PQ
//! estimates to exact distances read through a page cache.

pub mod config;
pub mod display;
pub mod error;
pub mod index;
pub mod logging;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{ErrorContext, IndexError, IndexResult};
pub use index::{BuildParams, BuildReport, IndexBuilder, IndexReader, ReaderParams};
pub use vector::{
    ClusterInitializer, Distance, DistanceFunction, InMemoryVectors, KMeansClustering,
    PqQuantizer, RawVectorWriter, VectorDimension, VectorError, VectorReader, VertexIndex,
};
