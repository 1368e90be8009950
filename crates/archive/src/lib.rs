//! Tensor archive handling: parse the on-disk container, widen BF16
//! payloads to F32, and load named weight maps into memory.
//!
//! The container layout is the safetensors format: an 8-byte
//! little-endian header length, a JSON tensor index, then one packed
//! data region. See [`index::ArchiveIndex`] for the exact rules.

pub mod convert;
pub mod error;
pub mod index;
pub mod loader;
pub mod widen;
pub mod write;

pub use convert::{ConvertOutcome, has_bf16, widen_archive};
pub use error::ArchiveError;
pub use index::{ArchiveIndex, Dtype, TensorDescriptor};
pub use loader::{LoadedArchive, Tensor, TensorMap, find_archives, load_archive};
pub use widen::TensorData;
pub use write::ArchiveBuilder;
