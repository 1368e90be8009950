//! Materializes whole archives into named tensor maps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ArchiveError;
use crate::index::{ArchiveIndex, Dtype};
use crate::widen::{self, TensorData};

/// One materialized tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl Tensor {
    /// Number of materialized elements.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub const fn dtype(&self) -> Dtype {
        self.data.dtype()
    }
}

/// Named tensors from one or more archives.
pub type TensorMap = HashMap<String, Tensor>;

/// Result of loading a single archive.
#[derive(Debug)]
pub struct LoadedArchive {
    pub tensors: TensorMap,
    /// Number of tensors that were widened from BF16.
    pub widened: usize,
}

/// Read and materialize every tensor in the archive at `path`.
///
/// The file is read once; each payload is decoded according to its
/// descriptor, widening BF16 tensors to F32.
///
/// # Errors
///
/// Propagates I/O failures and every parse-level error from
/// [`ArchiveIndex::parse`]. Returns [`ArchiveError::ShapeMismatch`] when
/// a payload does not divide evenly into its declared shape, including
/// shapes whose element count cannot be represented.
pub fn load_archive(path: &Path) -> Result<LoadedArchive, ArchiveError> {
    let bytes = std::fs::read(path)?;
    let loaded = load_archive_bytes(&bytes)?;
    debug!(
        path = %path.display(),
        tensors = loaded.tensors.len(),
        widened = loaded.widened,
        "loaded tensor archive"
    );
    Ok(loaded)
}

/// Materialize every tensor from an in-memory archive buffer.
///
/// # Errors
///
/// Same contract as [`load_archive`], minus the I/O.
pub fn load_archive_bytes(bytes: &[u8]) -> Result<LoadedArchive, ArchiveError> {
    let index = ArchiveIndex::parse(bytes)?;
    let data = &bytes[index.data_start()..];

    let mut tensors = TensorMap::with_capacity(index.len());
    let mut widened = 0usize;
    for (name, desc) in index.tensors() {
        let raw = data.get(desc.start..desc.end).ok_or_else(|| {
            ArchiveError::OutOfRange {
                name: name.to_string(),
                start: desc.start as u64,
                end: desc.end as u64,
                len: data.len() as u64,
            }
        })?;

        let element_size = desc.dtype.size();
        let fits = desc
            .element_count()
            .is_some_and(|n| raw.len() % element_size == 0 && raw.len() / element_size == n);
        if !fits {
            return Err(ArchiveError::ShapeMismatch {
                name: name.to_string(),
                bytes: raw.len(),
                shape: desc.shape.clone(),
                element_size,
            });
        }

        if desc.dtype == Dtype::BF16 {
            widened += 1;
        }
        tensors.insert(
            name.to_string(),
            Tensor {
                shape: desc.shape.clone(),
                data: widen::decode(raw, desc.dtype),
            },
        );
    }

    Ok(LoadedArchive { tensors, widened })
}

/// All `.safetensors` files directly under `dir`, sorted by name.
///
/// Backup files (`.safetensors.bak`) do not match and are skipped.
///
/// # Errors
///
/// Returns [`ArchiveError::Io`] if the directory cannot be read.
pub fn find_archives(dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::ArchiveBuilder;

    #[test]
    fn loads_mixed_dtypes_and_counts_widened() {
        let bytes = ArchiveBuilder::new()
            .f32("conv.weight", &[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
            .bf16("head.weight", &[2], &[0x3F80, 0x4000])
            .tensor("lut", Dtype::U8, &[3], vec![1, 2, 3])
            .build()
            .unwrap();

        let loaded = load_archive_bytes(&bytes).unwrap();
        assert_eq!(loaded.tensors.len(), 3);
        assert_eq!(loaded.widened, 1);

        let head = &loaded.tensors["head.weight"];
        assert_eq!(head.dtype(), Dtype::F32);
        assert_eq!(head.data.as_f32().unwrap(), &[1.0, 2.0]);

        let conv = &loaded.tensors["conv.weight"];
        assert_eq!(conv.shape, vec![2, 3]);
        assert_eq!(conv.element_count(), 6);
    }

    #[test]
    fn rejects_payload_not_dividing_into_shape() {
        // 6 bytes cannot hold 2 F32 elements
        let json = r#"{"w":{"dtype":"F32","shape":[2],"data_offsets":[0,6]}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json.as_bytes());
        bytes.extend_from_slice(&[0; 6]);

        let err = load_archive_bytes(&bytes).unwrap_err();
        match err {
            ArchiveError::ShapeMismatch {
                name,
                bytes,
                shape,
                element_size,
            } => {
                assert_eq!(name, "w");
                assert_eq!(bytes, 6);
                assert_eq!(shape, vec![2]);
                assert_eq!(element_size, 4);
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn rejects_shape_whose_element_count_overflows() {
        // 2^32 x 2^32 elements do not fit usize; the zero-length byte
        // range must not pass as a match for the wrapped product
        let json =
            r#"{"w":{"dtype":"F32","shape":[4294967296,4294967296],"data_offsets":[0,0]}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json.as_bytes());

        assert!(matches!(
            load_archive_bytes(&bytes).unwrap_err(),
            ArchiveError::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn rejects_element_count_off_by_shape() {
        // 8 bytes hold 2 F32 elements but the shape claims 3
        let json = r#"{"w":{"dtype":"F32","shape":[3],"data_offsets":[0,8]}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json.as_bytes());
        bytes.extend_from_slice(&[0; 8]);

        assert!(matches!(
            load_archive_bytes(&bytes).unwrap_err(),
            ArchiveError::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn load_archive_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        ArchiveBuilder::new()
            .f32("w", &[2], &[1.5, -1.5])
            .write_to(&path)
            .unwrap();

        let loaded = load_archive(&path).unwrap();
        assert_eq!(loaded.tensors["w"].data.as_f32().unwrap(), &[1.5, -1.5]);
        assert_eq!(loaded.widened, 0);
    }

    #[test]
    fn find_archives_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.safetensors", "a.safetensors", "a.safetensors.bak", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let found = find_archives(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.safetensors", "b.safetensors"]);
    }

    #[test]
    fn find_archives_missing_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(matches!(
            find_archives(&missing).unwrap_err(),
            ArchiveError::Io(_)
        ));
    }
}
