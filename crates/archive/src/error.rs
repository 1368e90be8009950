use std::path::PathBuf;

/// Failure modes for archive parsing, loading, and conversion.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Header or tensor index violates the container format.
    #[error("malformed archive: {0}")]
    Malformed(String),
    /// A descriptor's byte range falls outside the data region.
    #[error("tensor `{name}`: byte range {start}..{end} outside data region of {len} bytes")]
    OutOfRange {
        name: String,
        start: u64,
        end: u64,
        len: u64,
    },
    /// A tensor's payload does not divide into its declared shape,
    /// or the shape's element count overflows `usize`.
    #[error(
        "tensor `{name}`: {bytes} bytes do not fit shape {shape:?} with {element_size}-byte elements"
    )]
    ShapeMismatch {
        name: String,
        bytes: usize,
        shape: Vec<usize>,
        element_size: usize,
    },
    /// The index declares a dtype this loader does not understand.
    #[error("unsupported dtype `{0}`")]
    UnsupportedDtype(String),
    /// No weight archives present where some were expected.
    #[error("no .safetensors archives found in {}", .0.display())]
    NoArchives(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
