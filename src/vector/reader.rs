//! Read-only access to a set of fixed-dimension vectors.

use super::types::{VectorDimension, VectorError};

/// Read-only, index-addressed vector set.
///
/// Vectors are identified by an integer index in `[0, size)` and never
/// change once stored, so readers hand out borrowed views.
pub trait VectorReader: Sync {
    /// Number of vectors.
    fn size(&self) -> usize;

    /// Dimension of every vector.
    fn dimensions(&self) -> usize;

    /// Borrowed view of vector `index`.
    fn read(&self, index: usize) -> &[f32];

    /// Single coordinate of vector `index`.
    fn read_at(&self, index: usize, dimension: usize) -> f32 {
        self.read(index)[dimension]
    }
}

/// Vectors held in one contiguous heap buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryVectors {
    data: Vec<f32>,
    dimension: VectorDimension,
}

impl InMemoryVectors {
    /// Creates an empty set of the given dimension.
    pub fn new(dimension: VectorDimension) -> Self {
        Self {
            data: Vec::new(),
            dimension,
        }
    }

    /// Builds a set from owned rows, validating every row.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, VectorError> {
        let first = rows.first().ok_or(VectorError::InvalidDimension {
            dimension: 0,
            reason: "Cannot infer dimension from an empty row set",
        })?;
        let mut vectors = Self::new(VectorDimension::new(first.len())?);
        for row in rows {
            vectors.push(row)?;
        }
        Ok(vectors)
    }

    /// Builds a set from a flat buffer of `n * dimension` floats.
    pub fn from_flat(data: Vec<f32>, dimension: VectorDimension) -> Result<Self, VectorError> {
        if data.len() % dimension.get() != 0 {
            return Err(VectorError::DimensionMismatch {
                expected: dimension.get(),
                actual: data.len() % dimension.get(),
            });
        }
        Ok(Self { data, dimension })
    }

    /// Appends one vector.
    pub fn push(&mut self, vector: &[f32]) -> Result<(), VectorError> {
        self.dimension.validate_vector(vector)?;
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Mutable view used to apply an ingestion transform.
    pub fn get_mut(&mut self, index: usize) -> &mut [f32] {
        let dim = self.dimension.get();
        &mut self.data[index * dim..(index + 1) * dim]
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }
}

impl VectorReader for InMemoryVectors {
    fn size(&self) -> usize {
        self.data.len() / self.dimension.get()
    }

    fn dimensions(&self) -> usize {
        self.dimension.get()
    }

    fn read(&self, index: usize) -> &[f32] {
        let dim = self.dimension.get();
        &self.data[index * dim..(index + 1) * dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_vectors() {
        let vectors = InMemoryVectors::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(vectors.size(), 2);
        assert_eq!(vectors.dimensions(), 2);
        assert_eq!(vectors.read(1), &[3.0, 4.0]);
        assert_eq!(vectors.read_at(0, 1), 2.0);
    }

    #[test]
    fn test_rejects_ragged_rows() {
        assert!(InMemoryVectors::from_rows(&[vec![1.0, 2.0], vec![3.0]]).is_err());
        assert!(InMemoryVectors::from_rows(&[]).is_err());
        let dim = VectorDimension::new(3).unwrap();
        assert!(InMemoryVectors::from_flat(vec![0.0; 7], dim).is_err());
    }
}
