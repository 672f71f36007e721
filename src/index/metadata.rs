//! Index metadata file.
//!
//! # Format
//! Little-endian, in order:
//! - `i32` medoid
//! - `i32` vertex count
//! - quantizer payload (see `PqQuantizer::store`)
//! - `i32` vector dimension
//!
//! Files that end right after the PQ codes are accepted; the quantizer
//! shape is then the only dimension check.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{IndexError, IndexResult};
use crate::vector::{PqQuantizer, VertexIndex};

/// File extension of the metadata file.
pub const METADATA_EXTENSION: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMetadata {
    pub medoid: VertexIndex,
    pub vertex_count: usize,
}

/// Path of the metadata file for index `name` inside `dir`.
pub fn metadata_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{METADATA_EXTENSION}"))
}

impl IndexMetadata {
    /// Writes the metadata and quantizer state to `path`.
    pub fn write(&self, path: &Path, quantizer: &PqQuantizer) -> IndexResult<()> {
        let write_err = |source| IndexError::FileWrite {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&(self.medoid as i32).to_le_bytes())
            .map_err(write_err)?;
        writer
            .write_all(&(self.vertex_count as i32).to_le_bytes())
            .map_err(write_err)?;
        quantizer.store(&mut writer).map_err(write_err)?;
        writer
            .write_all(&(quantizer.dimension() as i32).to_le_bytes())
            .map_err(write_err)?;
        writer.flush().map_err(write_err)?;
        Ok(())
    }

    /// Reads metadata and quantizer state for vectors of `dimension`.
    ///
    /// Any truncation or inconsistency is reported as a corrupt index.
    pub fn read(path: &Path, dimension: usize) -> IndexResult<(Self, PqQuantizer)> {
        let file = File::open(path).map_err(|source| IndexError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let corrupt = |e: std::io::Error| IndexError::corrupt(path, e.to_string());

        let mut word = [0u8; 4];
        reader.read_exact(&mut word).map_err(corrupt)?;
        let medoid = i32::from_le_bytes(word);
        reader.read_exact(&mut word).map_err(corrupt)?;
        let vertex_count = i32::from_le_bytes(word);
        if medoid < 0 || vertex_count < 0 || (vertex_count > 0 && medoid >= vertex_count) {
            return Err(IndexError::corrupt(
                path,
                format!("medoid {medoid} outside {vertex_count} vertices"),
            ));
        }

        let quantizer = PqQuantizer::load(&mut reader, dimension).map_err(corrupt)?;
        if quantizer.vector_count() != vertex_count as usize {
            return Err(IndexError::corrupt(
                path,
                format!(
                    "{} PQ codes for {vertex_count} vertices",
                    quantizer.vector_count()
                ),
            ));
        }
        let mut trailer = Vec::with_capacity(4);
        reader.read_to_end(&mut trailer).map_err(corrupt)?;
        match trailer.len() {
            0 => {}
            4 => {
                let stored = i32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
                if stored < 0 || stored as usize != dimension {
                    return Err(IndexError::corrupt(
                        path,
                        format!("index holds {stored}-dimensional vectors, expected {dimension}"),
                    ));
                }
            }
            len => {
                return Err(IndexError::corrupt(
                    path,
                    format!("{len} unexpected bytes after PQ codes"),
                ));
            }
        }

        Ok((
            Self {
                medoid: medoid as VertexIndex,
                vertex_count: vertex_count as usize,
            },
            quantizer,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::ProgressStack;
    use crate::vector::{InMemoryVectors, VectorReader};
    use tempfile::TempDir;

    fn quantizer() -> (PqQuantizer, usize) {
        let rows: Vec<Vec<f32>> = (0..40)
            .map(|i| vec![i as f32, (i * 7 % 13) as f32, 1.0, -(i as f32)])
            .collect();
        let vectors = InMemoryVectors::from_rows(&rows).unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let mut pq = PqQuantizer::new();
        pq.generate_pq_codes(&pool, 4, 8, &vectors, &ProgressStack::disabled())
            .unwrap();
        (pq, vectors.size())
    }

    #[test]
    fn test_metadata_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = metadata_path(temp_dir.path(), "docs");
        let (pq, n) = quantizer();

        let meta = IndexMetadata {
            medoid: 11,
            vertex_count: n,
        };
        meta.write(&path, &pq).unwrap();

        let (loaded, loaded_pq) = IndexMetadata::read(&path, 4).unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded_pq, pq);
    }

    #[test]
    fn test_truncated_metadata_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = metadata_path(temp_dir.path(), "docs");
        let (pq, n) = quantizer();
        IndexMetadata {
            medoid: 0,
            vertex_count: n,
        }
        .write(&path, &pq)
        .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            IndexMetadata::read(&path, 4),
            Err(IndexError::CorruptOrIncompatibleIndex { .. })
        ));
    }

    #[test]
    fn test_dimension_mismatch_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = metadata_path(temp_dir.path(), "docs");
        let (pq, n) = quantizer();
        IndexMetadata {
            medoid: 0,
            vertex_count: n,
        }
        .write(&path, &pq)
        .unwrap();

        assert!(matches!(
            IndexMetadata::read(&path, 9),
            Err(IndexError::CorruptOrIncompatibleIndex { .. })
        ));
    }

    #[test]
    fn test_stored_dimension_rejects_same_shaped_quantizer() {
        let temp_dir = TempDir::new().unwrap();
        let path = metadata_path(temp_dir.path(), "docs");
        // 16 dims at ratio 8 and 14 dims at ratio 7 both give 8 groups of 2.
        let rows: Vec<Vec<f32>> = (0..30)
            .map(|i| (0..16).map(|d| ((i * 16 + d) as f32).sin()).collect())
            .collect();
        let vectors = InMemoryVectors::from_rows(&rows).unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let mut pq = PqQuantizer::new();
        pq.generate_pq_codes(&pool, 16, 8, &vectors, &ProgressStack::disabled())
            .unwrap();
        IndexMetadata {
            medoid: 3,
            vertex_count: vectors.size(),
        }
        .write(&path, &pq)
        .unwrap();

        let err = IndexMetadata::read(&path, 14).unwrap_err();
        assert!(matches!(err, IndexError::CorruptOrIncompatibleIndex { .. }));
        assert!(err.to_string().contains("16-dimensional"));
        assert!(IndexMetadata::read(&path, 16).is_ok());
    }

    #[test]
    fn test_metadata_without_dimension_trailer_still_loads() {
        let temp_dir = TempDir::new().unwrap();
        let path = metadata_path(temp_dir.path(), "docs");
        let (pq, n) = quantizer();
        IndexMetadata {
            medoid: 5,
            vertex_count: n,
        }
        .write(&path, &pq)
        .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        let (loaded, loaded_pq) = IndexMetadata::read(&path, 4).unwrap();
        assert_eq!(loaded.medoid, 5);
        assert_eq!(loaded_pq, pq);

        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert!(matches!(
            IndexMetadata::read(&path, 4),
            Err(IndexError::CorruptOrIncompatibleIndex { .. })
        ));
    }
}
