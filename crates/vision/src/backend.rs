//! Backend seam between the engine lifecycle and actual model code.

use std::path::Path;

use glyph_core::Result;

use crate::Page;

/// A loaded OCR model.
///
/// Implementations may assume calls are serialized; the cell never runs
/// two recognitions concurrently.
pub trait VisionBackend: Send {
    /// Recognize text in the image file at `image`.
    ///
    /// # Errors
    ///
    /// Returns an error when the image cannot be processed. The server
    /// reports it to the client as an inference failure.
    fn recognize(&mut self, image: &Path) -> Result<Vec<Page>>;
}
