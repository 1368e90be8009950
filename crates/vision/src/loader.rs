//! Directory-level weight loading.

use std::path::Path;

use glyph_archive::{ArchiveError, TensorMap, find_archives, load_archive};
use tracing::{instrument, warn};

/// Merged tensors from every archive in a model directory.
#[derive(Debug)]
pub struct LoadedWeights {
    pub tensors: TensorMap,
    /// Number of archive files read.
    pub archives: usize,
    /// Number of tensors widened from BF16 across all archives.
    pub widened: usize,
}

/// Loads a model directory into one named tensor map.
pub trait TensorLoader: Send + Sync {
    /// Load every archive under `model_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::NoArchives`] when the directory holds no
    /// `.safetensors` files, and propagates per-archive failures.
    fn load_dir(&self, model_dir: &Path) -> Result<LoadedWeights, ArchiveError>;
}

/// Default loader: reads archives in name order and widens BF16 to F32.
pub struct WideningLoader;

impl TensorLoader for WideningLoader {
    #[instrument(skip(self), fields(dir = %model_dir.display()))]
    fn load_dir(&self, model_dir: &Path) -> Result<LoadedWeights, ArchiveError> {
        let paths = find_archives(model_dir)?;
        if paths.is_empty() {
            return Err(ArchiveError::NoArchives(model_dir.to_path_buf()));
        }

        let mut tensors = TensorMap::new();
        let mut widened = 0usize;
        for path in &paths {
            let loaded = load_archive(path)?;
            widened += loaded.widened;
            for (name, tensor) in loaded.tensors {
                if tensors.insert(name.clone(), tensor).is_some() {
                    warn!(
                        tensor = %name,
                        path = %path.display(),
                        "duplicate tensor name, keeping the later archive's copy"
                    );
                }
            }
        }

        Ok(LoadedWeights {
            tensors,
            archives: paths.len(),
            widened,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glyph_archive::{ArchiveBuilder, Dtype};

    #[test]
    fn merges_archives_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        ArchiveBuilder::new()
            .f32("shared", &[1], &[1.0])
            .f32("a_only", &[1], &[10.0])
            .write_to(&dir.path().join("a.safetensors"))
            .unwrap();
        ArchiveBuilder::new()
            .f32("shared", &[1], &[2.0])
            .bf16("b_only", &[1], &[0x3F80])
            .write_to(&dir.path().join("b.safetensors"))
            .unwrap();

        let weights = WideningLoader.load_dir(dir.path()).unwrap();
        assert_eq!(weights.archives, 2);
        assert_eq!(weights.widened, 1);
        assert_eq!(weights.tensors.len(), 3);
        // later archive wins on duplicate names
        assert_eq!(weights.tensors["shared"].data.as_f32().unwrap(), &[2.0]);
        assert_eq!(weights.tensors["b_only"].dtype(), Dtype::F32);
    }

    #[test]
    fn empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            WideningLoader.load_dir(dir.path()).unwrap_err(),
            ArchiveError::NoArchives(_)
        ));
    }

    #[test]
    fn propagates_archive_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.safetensors"), [0, 1, 2]).unwrap();
        assert!(matches!(
            WideningLoader.load_dir(dir.path()).unwrap_err(),
            ArchiveError::Malformed(_)
        ));
    }
}
