//! OCR engine loading and lifecycle.
//!
//! The engine itself sits behind the [`backend::VisionBackend`] trait;
//! this crate owns everything around it: weight loading with BF16
//! widening, backend selection, and the shared [`cell::EngineCell`]
//! that serializes access from the server.

pub mod backend;
pub mod cell;
pub mod error;
pub mod loader;
pub mod mock;

use std::path::Path;

use glyph_core::{BackendKind, Config, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use backend::VisionBackend;
use error::EngineError;
use loader::{TensorLoader, WideningLoader};

pub use cell::{EngineCell, EngineState};
pub use loader::LoadedWeights;
pub use mock::MockBackend;

/// One recognized text region on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub text: String,
    /// Recognition confidence in `[0, 1]`.
    pub confidence: f32,
    /// Bounding box as `[x0, y0, x1, y1]` in image pixels.
    pub bbox: [f32; 4],
}

/// All regions recognized on one page of input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub regions: Vec<TextRegion>,
}

impl Page {
    /// Region texts joined with newlines.
    #[must_use]
    pub fn text(&self) -> String {
        let lines: Vec<&str> = self.regions.iter().map(|r| r.text.as_str()).collect();
        lines.join("\n")
    }
}

/// A loaded model behind a backend.
pub struct Engine {
    backend: Box<dyn VisionBackend>,
}

impl Engine {
    #[must_use]
    pub fn new(backend: Box<dyn VisionBackend>) -> Self {
        Self { backend }
    }

    /// Run recognition on one image file.
    ///
    /// # Errors
    ///
    /// Propagates whatever the backend reports.
    pub fn recognize(&mut self, image: &Path) -> Result<Vec<Page>> {
        self.backend.recognize(image)
    }
}

/// Load weights and construct the configured backend.
///
/// This is the expensive path: every archive under `config.model_dir`
/// is read and materialized, widening BF16 tensors to F32.
///
/// # Errors
///
/// Fails with [`EngineError::Archive`] when the model directory is
/// empty or an archive cannot be loaded.
#[instrument(skip(config), fields(backend = ?config.backend))]
pub fn build_engine(config: &Config) -> std::result::Result<Engine, EngineError> {
    debug!(model_dir = %config.model_dir.display(), "loading vision engine");
    let weights = WideningLoader.load_dir(&config.model_dir)?;
    info!(
        archives = weights.archives,
        tensors = weights.tensors.len(),
        widened = weights.widened,
        "weights loaded"
    );

    let backend: Box<dyn VisionBackend> = match config.backend {
        BackendKind::Auto => {
            warn!("no accelerated backend compiled in; falling back to mock");
            Box::new(MockBackend::new(&weights))
        }
        BackendKind::Mock => Box::new(MockBackend::new(&weights)),
    };
    info!(backend = ?config.backend, "vision backend initialized");

    Ok(Engine::new(backend))
}
