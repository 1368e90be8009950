//! Container header and tensor index parsing.
//!
//! Layout: bytes `[0, 8)` hold a little-endian `u64` header length `H`,
//! bytes `[8, 8+H)` hold a UTF-8 JSON object mapping tensor names to
//! descriptors, and everything after `8+H` is the packed data region.
//! Descriptor byte ranges are relative to the start of the data region.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

/// Size of the little-endian header-length prefix.
pub const HEADER_LEN_BYTES: usize = 8;
/// Reserved index key carrying free-form string metadata, not a tensor.
pub const METADATA_KEY: &str = "__metadata__";

/// Element type of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    F32,
    F64,
    F16,
    BF16,
    I32,
    I64,
    U8,
}

impl Dtype {
    /// Bytes per element as stored in the data region.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    /// Tag used in the JSON index.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::I32 => "I32",
            Self::I64 => "I64",
            Self::U8 => "U8",
        }
    }

    /// Parse a JSON index tag.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::UnsupportedDtype`] for any tag outside the
    /// supported set. Unknown dtypes must fail the load rather than be
    /// reinterpreted as something else.
    pub fn parse(tag: &str) -> Result<Self, ArchiveError> {
        match tag {
            "F32" => Ok(Self::F32),
            "F64" => Ok(Self::F64),
            "F16" => Ok(Self::F16),
            "BF16" => Ok(Self::BF16),
            "I32" => Ok(Self::I32),
            "I64" => Ok(Self::I64),
            "U8" => Ok(Self::U8),
            other => Err(ArchiveError::UnsupportedDtype(other.to_string())),
        }
    }
}

/// One tensor's entry in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// Start offset into the data region, inclusive.
    pub start: usize,
    /// End offset into the data region, exclusive.
    pub end: usize,
}

impl TensorDescriptor {
    /// Number of elements the shape describes, or `None` when the
    /// product overflows `usize`. An empty shape is a scalar and counts
    /// as one element.
    #[must_use]
    pub fn element_count(&self) -> Option<usize> {
        shape_elements(&self.shape)
    }

    /// Length of the stored payload in bytes.
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.end - self.start
    }
}

/// Checked product of shape dimensions. Shapes come from untrusted
/// index text and may multiply past `usize`.
pub(crate) fn shape_elements(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// JSON wire shape of a descriptor. Shared with the writer.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawDescriptor {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: [u64; 2],
}

/// Parsed tensor index of one archive.
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    data_start: usize,
    metadata: Option<HashMap<String, String>>,
    tensors: HashMap<String, TensorDescriptor>,
}

impl ArchiveIndex {
    /// Parse the header and index from a complete archive buffer.
    ///
    /// Every descriptor's byte range is validated against the data
    /// region before this returns, so callers may slice without
    /// re-checking bounds.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::Malformed`] for a truncated header, a header
    /// length exceeding the buffer, non-UTF-8 or non-JSON index text,
    /// or descriptors with the wrong JSON shape.
    /// [`ArchiveError::UnsupportedDtype`] for dtype tags outside the
    /// supported set, and [`ArchiveError::OutOfRange`] for byte ranges
    /// outside the data region.
    pub fn parse(bytes: &[u8]) -> Result<Self, ArchiveError> {
        if bytes.len() < HEADER_LEN_BYTES {
            return Err(ArchiveError::Malformed(format!(
                "{} bytes is shorter than the 8-byte header length",
                bytes.len()
            )));
        }
        let mut len_bytes = [0u8; HEADER_LEN_BYTES];
        len_bytes.copy_from_slice(&bytes[..HEADER_LEN_BYTES]);
        let header_len = u64::from_le_bytes(len_bytes);

        let data_start = (HEADER_LEN_BYTES as u64)
            .checked_add(header_len)
            .filter(|&end| end <= bytes.len() as u64)
            .ok_or_else(|| {
                ArchiveError::Malformed(format!(
                    "header length {header_len} exceeds archive size {}",
                    bytes.len()
                ))
            })?;
        let data_start = usize::try_from(data_start)
            .map_err(|_| ArchiveError::Malformed("header length exceeds address space".into()))?;

        let text = std::str::from_utf8(&bytes[HEADER_LEN_BYTES..data_start])
            .map_err(|e| ArchiveError::Malformed(format!("tensor index is not UTF-8: {e}")))?;
        let mut entries: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)
            .map_err(|e| ArchiveError::Malformed(format!("tensor index is not a JSON object: {e}")))?;

        let metadata = match entries.remove(METADATA_KEY) {
            Some(value) => Some(serde_json::from_value(value).map_err(|_| {
                ArchiveError::Malformed("__metadata__ must map strings to strings".into())
            })?),
            None => None,
        };

        let data_len = (bytes.len() - data_start) as u64;
        let mut tensors = HashMap::with_capacity(entries.len());
        for (name, value) in entries {
            let raw: RawDescriptor = serde_json::from_value(value).map_err(|e| {
                ArchiveError::Malformed(format!("descriptor for `{name}`: {e}"))
            })?;
            let dtype = Dtype::parse(&raw.dtype)?;
            let [start, end] = raw.data_offsets;
            if end < start || end > data_len {
                return Err(ArchiveError::OutOfRange {
                    name,
                    start,
                    end,
                    len: data_len,
                });
            }
            let descriptor = TensorDescriptor {
                dtype,
                shape: raw.shape,
                start: usize::try_from(start).map_err(|_| {
                    ArchiveError::Malformed(format!("offset {start} exceeds address space"))
                })?,
                end: usize::try_from(end).map_err(|_| {
                    ArchiveError::Malformed(format!("offset {end} exceeds address space"))
                })?,
            };
            tensors.insert(name, descriptor);
        }

        Ok(Self {
            data_start,
            metadata,
            tensors,
        })
    }

    /// Byte offset where the data region begins.
    #[must_use]
    pub const fn data_start(&self) -> usize {
        self.data_start
    }

    /// Number of tensors in the index. Metadata does not count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Free-form metadata carried by the archive, if any.
    #[must_use]
    pub const fn metadata(&self) -> Option<&HashMap<String, String>> {
        self.metadata.as_ref()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TensorDescriptor> {
        self.tensors.get(name)
    }

    pub fn tensors(&self) -> impl Iterator<Item = (&str, &TensorDescriptor)> {
        self.tensors.iter().map(|(name, desc)| (name.as_str(), desc))
    }

    /// Whether any tensor is stored with the given dtype.
    #[must_use]
    pub fn contains_dtype(&self, dtype: Dtype) -> bool {
        self.tensors.values().any(|desc| desc.dtype == dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::ArchiveBuilder;

    /// Archive bytes from a raw JSON index string plus a data region.
    fn raw_archive(index_json: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(index_json.len() as u64).to_le_bytes());
        out.extend_from_slice(index_json.as_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn parses_builder_output() {
        let bytes = ArchiveBuilder::new()
            .f32("weight", &[2, 2], &[1.0, 2.0, 3.0, 4.0])
            .tensor("bias", Dtype::U8, &[4], vec![9, 8, 7, 6])
            .build()
            .unwrap();

        let index = ArchiveIndex::parse(&bytes).unwrap();
        assert_eq!(index.len(), 2);
        let weight = index.get("weight").unwrap();
        assert_eq!(weight.dtype, Dtype::F32);
        assert_eq!(weight.shape, vec![2, 2]);
        assert_eq!(weight.byte_len(), 16);
        let bias = index.get("bias").unwrap();
        assert_eq!(bias.dtype, Dtype::U8);
        assert_eq!(bias.byte_len(), 4);
    }

    #[test]
    fn metadata_is_not_a_tensor() {
        let bytes = ArchiveBuilder::new()
            .metadata("format", "pt")
            .f32("w", &[1], &[0.5])
            .build()
            .unwrap();

        let index = ArchiveIndex::parse(&bytes).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.get(METADATA_KEY).is_none());
        assert_eq!(
            index.metadata().unwrap().get("format").map(String::as_str),
            Some("pt")
        );
    }

    #[test]
    fn scalar_shape_counts_one_element() {
        let bytes = ArchiveBuilder::new().f32("s", &[], &[3.25]).build().unwrap();
        let index = ArchiveIndex::parse(&bytes).unwrap();
        assert_eq!(index.get("s").unwrap().element_count(), Some(1));
    }

    #[test]
    fn shape_product_overflow_counts_none() {
        let desc = TensorDescriptor {
            dtype: Dtype::F32,
            shape: vec![usize::MAX, 2],
            start: 0,
            end: 0,
        };
        assert_eq!(desc.element_count(), None);
    }

    #[test]
    fn rejects_truncated_header() {
        let err = ArchiveIndex::parse(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn rejects_header_length_past_eof() {
        let mut bytes = 1000u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let err = ArchiveIndex::parse(&bytes).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn rejects_header_length_overflow() {
        let bytes = u64::MAX.to_le_bytes().to_vec();
        let err = ArchiveIndex::parse(&bytes).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn rejects_non_utf8_index() {
        let mut bytes = 2u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        let err = ArchiveIndex::parse(&bytes).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn rejects_non_json_index() {
        let err = ArchiveIndex::parse(&raw_archive("not json", &[])).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn rejects_descriptor_missing_fields() {
        let json = r#"{"w":{"dtype":"F32","shape":[1]}}"#;
        let err = ArchiveIndex::parse(&raw_archive(json, &[0; 4])).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn unknown_dtype_fails_loudly() {
        let json = r#"{"w":{"dtype":"F8_E4M3","shape":[2],"data_offsets":[0,2]}}"#;
        let err = ArchiveIndex::parse(&raw_archive(json, &[0; 2])).unwrap_err();
        match err {
            ArchiveError::UnsupportedDtype(tag) => assert_eq!(tag, "F8_E4M3"),
            other => panic!("expected UnsupportedDtype, got {other:?}"),
        }
    }

    #[test]
    fn rejects_range_outside_data_region() {
        let json = r#"{"w":{"dtype":"F32","shape":[2],"data_offsets":[0,8]}}"#;
        let err = ArchiveIndex::parse(&raw_archive(json, &[0; 4])).unwrap_err();
        assert!(matches!(err, ArchiveError::OutOfRange { .. }));
    }

    #[test]
    fn rejects_inverted_range() {
        let json = r#"{"w":{"dtype":"F32","shape":[1],"data_offsets":[8,4]}}"#;
        let err = ArchiveIndex::parse(&raw_archive(json, &[0; 16])).unwrap_err();
        assert!(matches!(err, ArchiveError::OutOfRange { .. }));
    }

    #[test]
    fn dtype_tags_round_trip() {
        for dtype in [
            Dtype::F32,
            Dtype::F64,
            Dtype::F16,
            Dtype::BF16,
            Dtype::I32,
            Dtype::I64,
            Dtype::U8,
        ] {
            assert_eq!(Dtype::parse(dtype.as_str()).unwrap(), dtype);
        }
    }
}
