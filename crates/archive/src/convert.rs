//! One-shot offline conversion of BF16 archives to F32.
//!
//! Rewrites an archive in place so later loads skip the widening work.
//! The original file survives as `<name>.safetensors.bak`; a present
//! backup marks the archive as already converted.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::ArchiveError;
use crate::index::{ArchiveIndex, Dtype, HEADER_LEN_BYTES, METADATA_KEY, TensorDescriptor};
use crate::widen::bf16_word_to_f32;
use crate::write::ArchiveBuilder;

/// What `widen_archive` did to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOutcome {
    /// Archive rewritten with `widened` tensors converted to F32.
    Converted { widened: usize },
    /// No BF16 tensors; file left untouched.
    NoBf16,
    /// A backup already exists; file treated as converted.
    BackupExists,
}

/// Whether the archive stores any BF16 tensor.
///
/// Reads only the header and index, never the data region.
///
/// # Errors
///
/// Returns [`ArchiveError::Malformed`] for a truncated or non-JSON
/// header and [`ArchiveError::Io`] for I/O failures.
pub fn has_bf16(path: &Path) -> Result<bool, ArchiveError> {
    let mut file = std::fs::File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut len_bytes = [0u8; HEADER_LEN_BYTES];
    file.read_exact(&mut len_bytes)
        .map_err(|e| ArchiveError::Malformed(format!("short header: {e}")))?;
    let header_len = u64::from_le_bytes(len_bytes);
    if (HEADER_LEN_BYTES as u64).checked_add(header_len).is_none_or(|end| end > file_len) {
        return Err(ArchiveError::Malformed(format!(
            "header length {header_len} exceeds archive size {file_len}"
        )));
    }
    let header_len = usize::try_from(header_len)
        .map_err(|_| ArchiveError::Malformed("header length exceeds address space".into()))?;

    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)
        .map_err(|e| ArchiveError::Malformed(format!("short tensor index: {e}")))?;
    let entries: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&header)
        .map_err(|e| ArchiveError::Malformed(format!("tensor index is not a JSON object: {e}")))?;

    Ok(entries.iter().any(|(name, value)| {
        name != METADATA_KEY
            && value.get("dtype").and_then(serde_json::Value::as_str) == Some(Dtype::BF16.as_str())
    }))
}

/// Rewrite the archive at `path` with every BF16 tensor widened to F32.
///
/// The rewrite goes through a temporary file: the new archive lands in
/// `<path>.tmp`, the original is renamed to `<path>.bak`, and the
/// temporary takes the original's place. Archive metadata is dropped on
/// rewrite.
///
/// # Errors
///
/// Propagates parse and I/O failures. A failed rename restores the
/// original file and removes the temporary.
pub fn widen_archive(path: &Path) -> Result<ConvertOutcome, ArchiveError> {
    let backup = sibling(path, ".bak");
    if backup.exists() {
        return Ok(ConvertOutcome::BackupExists);
    }

    let bytes = std::fs::read(path)?;
    let index = ArchiveIndex::parse(&bytes)?;
    if !index.contains_dtype(Dtype::BF16) {
        return Ok(ConvertOutcome::NoBf16);
    }

    let (rebuilt, widened) = rebuild_widened(&index, &bytes)?;

    let tmp = sibling(path, ".tmp");
    std::fs::write(&tmp, rebuilt)?;
    if let Err(e) = std::fs::rename(path, &backup) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::rename(&backup, path);
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }

    info!(path = %path.display(), widened, "widened archive in place");
    Ok(ConvertOutcome::Converted { widened })
}

fn rebuild_widened(
    index: &ArchiveIndex,
    bytes: &[u8],
) -> Result<(Vec<u8>, usize), ArchiveError> {
    let data = &bytes[index.data_start()..];
    let mut entries: Vec<(&str, &TensorDescriptor)> = index.tensors().collect();
    entries.sort_by_key(|(_, desc)| desc.start);

    let mut builder = ArchiveBuilder::new();
    let mut widened = 0usize;
    for (name, desc) in entries {
        let raw = data
            .get(desc.start..desc.end)
            .ok_or_else(|| ArchiveError::OutOfRange {
                name: name.to_string(),
                start: desc.start as u64,
                end: desc.end as u64,
                len: data.len() as u64,
            })?;
        if desc.dtype == Dtype::BF16 {
            let values: Vec<f32> = raw
                .chunks_exact(2)
                .map(|b| bf16_word_to_f32(u16::from_le_bytes([b[0], b[1]])))
                .collect();
            builder = builder.f32(name, &desc.shape, &values);
            widened += 1;
        } else {
            builder = builder.tensor(name, desc.dtype, &desc.shape, raw.to_vec());
        }
    }
    Ok((builder.build()?, widened))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_archive;

    fn mixed_archive(path: &Path) {
        ArchiveBuilder::new()
            .metadata("format", "pt")
            .bf16("attn.weight", &[3], &[0x3F80, 0x4000, 0xC000])
            .f32("norm.weight", &[2], &[0.5, -0.5])
            .write_to(path)
            .unwrap();
    }

    #[test]
    fn detects_bf16_from_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let with = dir.path().join("with.safetensors");
        let without = dir.path().join("without.safetensors");
        mixed_archive(&with);
        ArchiveBuilder::new()
            .f32("w", &[1], &[1.0])
            .write_to(&without)
            .unwrap();

        assert!(has_bf16(&with).unwrap());
        assert!(!has_bf16(&without).unwrap());
    }

    #[test]
    fn has_bf16_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.safetensors");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        assert!(matches!(
            has_bf16(&path).unwrap_err(),
            ArchiveError::Malformed(_)
        ));
    }

    #[test]
    fn widens_in_place_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        mixed_archive(&path);

        let outcome = widen_archive(&path).unwrap();
        assert_eq!(outcome, ConvertOutcome::Converted { widened: 1 });

        // rewritten file holds only F32, keeps values, drops metadata
        let bytes = std::fs::read(&path).unwrap();
        let index = ArchiveIndex::parse(&bytes).unwrap();
        assert!(!index.contains_dtype(Dtype::BF16));
        assert!(index.metadata().is_none());
        let loaded = load_archive(&path).unwrap();
        assert_eq!(loaded.widened, 0);
        assert_eq!(
            loaded.tensors["attn.weight"].data.as_f32().unwrap(),
            &[1.0, 2.0, -2.0]
        );
        assert_eq!(
            loaded.tensors["norm.weight"].data.as_f32().unwrap(),
            &[0.5, -0.5]
        );

        // backup still carries the original BF16 payload
        let backup = dir.path().join("model.safetensors.bak");
        let backup_index = ArchiveIndex::parse(&std::fs::read(&backup).unwrap()).unwrap();
        assert!(backup_index.contains_dtype(Dtype::BF16));
        assert!(backup_index.metadata().is_some());
    }

    #[test]
    fn present_backup_skips_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        mixed_archive(&path);

        assert!(matches!(
            widen_archive(&path).unwrap(),
            ConvertOutcome::Converted { .. }
        ));
        assert_eq!(widen_archive(&path).unwrap(), ConvertOutcome::BackupExists);
    }

    #[test]
    fn archive_without_bf16_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        ArchiveBuilder::new()
            .f32("w", &[2], &[1.0, 2.0])
            .write_to(&path)
            .unwrap();
        let before = std::fs::read(&path).unwrap();

        assert_eq!(widen_archive(&path).unwrap(), ConvertOutcome::NoBf16);
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(!dir.path().join("model.safetensors.bak").exists());
    }
}
