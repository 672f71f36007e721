//! Vector primitives shared by the index builder and reader.
//!
//! # Architecture
//! - `distance`: pluggable kernels over slices and mapped little-endian bytes
//! - `reader` / `storage`: index-addressed vector sets and the raw vector file
//! - `clustering`: parallel K-means with pluggable seeding
//! - `quantizer`: product quantization codebooks, codes and lookup tables

mod clustering;
mod distance;
mod quantizer;
mod reader;
mod storage;
mod types;

pub use clustering::{
    ClusterInitializer, ClusterSpace, ClusteringError, DEFAULT_MAX_ITERATIONS, ExactCentroids,
    KMeansClustering, KMeansResult, SubVectorSpace,
};
pub use distance::{
    CosineDistance, Distance, DistanceFunction, DotDistance, L2Distance, LeBytes, VectorView,
    normalize,
};
pub use quantizer::{MAX_CODE_BASE_SIZE, PqQuantizer, PqSpace, quantizer_count};
pub use reader::{InMemoryVectors, VectorReader};
pub use storage::{
    MmapVectorReader, RawVectorWriter, VECTORS_EXTENSION, VectorStorageError, read_fvecs,
    vectors_path,
};
pub use types::{BYTES_PER_F32, VectorDimension, VectorError, VertexIndex};
