//! Error types for the index builder and reader.
//!
//! This module provides structured error types using thiserror so that
//! callers get actionable messages and stable status codes.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use thiserror::Error;

use crate::vector::{ClusteringError, VectorError, VectorStorageError};

/// Main error type for index build and search operations
#[derive(Error, Debug)]
pub enum IndexError {
    /// File system errors
    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors, raised before any disk I/O
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Resource exhaustion detected before the build creates files
    #[error(
        "Insufficient disk space in '{path}': {required} bytes required (including headroom), {available} bytes available"
    )]
    InsufficientDiskSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Persisted index does not match the reader parameters or is truncated
    #[error("Index '{path}' is corrupt or incompatible: {reason}")]
    CorruptOrIncompatibleIndex { path: PathBuf, reason: String },

    /// Concurrency protocol violations (a build-logic bug, never retried)
    #[error("Concurrency protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// A parallel worker failed; the whole phase is aborted
    #[error("Worker task failed during {phase}: {cause}")]
    WorkerFailed { phase: &'static str, cause: String },

    #[error("Index reader is closed")]
    Closed,

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Clustering(#[from] ClusteringError),

    #[error(transparent)]
    Storage(#[from] VectorStorageError),

    /// General errors for cases where we need to preserve context only
    #[error("{0}")]
    General(String),
}

impl IndexError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptOrIncompatibleIndex {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::FileRead { .. } => "FILE_READ_ERROR",
            Self::FileWrite { .. } => "FILE_WRITE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            Self::InsufficientDiskSpace { .. } => "INSUFFICIENT_DISK_SPACE",
            Self::CorruptOrIncompatibleIndex { .. } => "CORRUPT_OR_INCOMPATIBLE_INDEX",
            Self::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Self::WorkerFailed { .. } => "WORKER_FAILED",
            Self::Closed => "READER_CLOSED",
            Self::Vector(_) => "VECTOR_ERROR",
            Self::Clustering(_) => "CLUSTERING_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::General(_) => "GENERAL_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::InsufficientDiskSpace { .. } => vec![
                "Free disk space in the index directory or point index_path elsewhere",
                "Lower max_connections_per_vertex to shrink the graph file",
            ],
            Self::InvalidConfiguration { .. } => vec![
                "compression_ratio must divide dimension * 4 and leave at most one quantizer per dimension",
                "Run 'pqgraph config' to inspect the effective settings",
            ],
            Self::CorruptOrIncompatibleIndex { .. } => vec![
                "Open the index with the dimension and compression ratio it was built with",
                "Run 'pqgraph build' again to rebuild the index from its vectors",
            ],
            Self::ProtocolViolation { .. } | Self::WorkerFailed { .. } => vec![
                "The build was aborted and its output cannot be trusted; rebuild the index",
            ],
            Self::FileRead { .. } => vec![
                "Check that the file exists and you have read permissions",
            ],
            Self::Closed => vec!["Open a new reader; close() must only run after searches drain"],
            _ => vec![],
        }
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T, IndexError>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, msg: &str) -> Result<T, IndexError> {
        self.map_err(|e| IndexError::General(format!("{msg}: {e}")))
    }
}

/// Converts a panic payload from a worker thread into an `IndexError`.
pub(crate) fn worker_panic(
    phase: &'static str,
    payload: Box<dyn std::any::Any + Send>,
) -> IndexError {
    let cause = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    };
    IndexError::WorkerFailed { phase, cause }
}

/// Runs a parallel phase to its join, reporting a worker panic as
/// `WorkerFailed` instead of unwinding into the caller.
pub(crate) fn join_workers<T>(phase: &'static str, run: impl FnOnce() -> T) -> IndexResult<T> {
    panic::catch_unwind(AssertUnwindSafe(run)).map_err(|payload| worker_panic(phase, payload))
}
