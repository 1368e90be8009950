//! Archive serialization, used by the conversion tool and test fixtures.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ArchiveError;
use crate::index::{Dtype, HEADER_LEN_BYTES, METADATA_KEY, RawDescriptor, shape_elements};

struct Entry {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

/// Builds a complete archive buffer from named tensors.
///
/// Payloads are packed in insertion order; the JSON index keys are
/// sorted by name, which is irrelevant to readers since descriptors
/// carry explicit byte ranges.
#[derive(Default)]
pub struct ArchiveBuilder {
    entries: Vec<Entry>,
    metadata: Option<HashMap<String, String>>,
}

impl ArchiveBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor from raw little-endian payload bytes.
    #[must_use]
    pub fn tensor(
        mut self,
        name: impl Into<String>,
        dtype: Dtype,
        shape: &[usize],
        bytes: Vec<u8>,
    ) -> Self {
        self.entries.push(Entry {
            name: name.into(),
            dtype,
            shape: shape.to_vec(),
            bytes,
        });
        self
    }

    /// Add an F32 tensor from values.
    #[must_use]
    pub fn f32(self, name: impl Into<String>, shape: &[usize], values: &[f32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.tensor(name, Dtype::F32, shape, bytes)
    }

    /// Add a BF16 tensor from raw 16-bit words.
    #[must_use]
    pub fn bf16(self, name: impl Into<String>, shape: &[usize], words: &[u16]) -> Self {
        let bytes = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.tensor(name, Dtype::BF16, shape, bytes)
    }

    /// Attach one `__metadata__` entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Serialize into a complete archive buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::ShapeMismatch`] when a payload does not
    /// match its shape and dtype, and [`ArchiveError::Malformed`] for
    /// duplicate tensor names.
    pub fn build(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut index = serde_json::Map::new();
        if let Some(metadata) = &self.metadata {
            let value = serde_json::to_value(metadata)
                .map_err(|e| ArchiveError::Malformed(format!("metadata: {e}")))?;
            index.insert(METADATA_KEY.to_string(), value);
        }

        let mut cursor = 0u64;
        for entry in &self.entries {
            let element_size = entry.dtype.size();
            let fits = shape_elements(&entry.shape).and_then(|n| n.checked_mul(element_size))
                == Some(entry.bytes.len());
            if !fits {
                return Err(ArchiveError::ShapeMismatch {
                    name: entry.name.clone(),
                    bytes: entry.bytes.len(),
                    shape: entry.shape.clone(),
                    element_size,
                });
            }

            let end = cursor + entry.bytes.len() as u64;
            let raw = RawDescriptor {
                dtype: entry.dtype.as_str().to_string(),
                shape: entry.shape.clone(),
                data_offsets: [cursor, end],
            };
            let value = serde_json::to_value(&raw)
                .map_err(|e| ArchiveError::Malformed(format!("descriptor: {e}")))?;
            if index.insert(entry.name.clone(), value).is_some() {
                return Err(ArchiveError::Malformed(format!(
                    "duplicate tensor `{}`",
                    entry.name
                )));
            }
            cursor = end;
        }

        let header = serde_json::to_vec(&index)
            .map_err(|e| ArchiveError::Malformed(format!("tensor index: {e}")))?;

        let payload_len: usize = self.entries.iter().map(|e| e.bytes.len()).sum();
        let mut out = Vec::with_capacity(HEADER_LEN_BYTES + header.len() + payload_len);
        out.extend_from_slice(&(header.len() as u64).to_le_bytes());
        out.extend_from_slice(&header);
        for entry in &self.entries {
            out.extend_from_slice(&entry.bytes);
        }
        Ok(out)
    }

    /// Serialize and write to `path`.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::build`], plus I/O failures.
    pub fn write_to(&self, path: &Path) -> Result<(), ArchiveError> {
        let bytes = self.build()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}
