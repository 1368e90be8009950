//! Shared configuration and result types for the glyph OCR service.
//! No networking, no model code.

pub mod config;
pub mod error;

pub use config::{BackendKind, Config};
pub use error::Result;
