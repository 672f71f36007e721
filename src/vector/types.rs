//! Core types for vector handling.
//!
//! Newtypes and error types shared by the distance kernels, the
//! quantizer and the vector readers.

use thiserror::Error;

/// Global vertex index in `[0, N)`.
pub type VertexIndex = u32;

/// Number of bytes per f32 value.
pub const BYTES_PER_F32: usize = 4;

/// Type-safe wrapper for vector dimensions.
///
/// Ensures runtime validation of vector dimensions to prevent
/// dimension mismatches during operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Size in bytes of one stored vector.
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.0 * BYTES_PER_F32
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for VectorDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during vector operations.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors and queries use the dimension the index was built with"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error("Vector index {index} out of range for {size} vectors")]
    OutOfRange { index: usize, size: usize },

    #[error(
        "Invalid compression ratio {ratio} for dimension {dimension}\nReason: {reason}"
    )]
    InvalidCompression {
        ratio: usize,
        dimension: usize,
        reason: &'static str,
    },

    #[error("Quantizer has not been trained\nSuggestion: Call generate_pq_codes or load first")]
    Untrained,
}
