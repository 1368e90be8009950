//! Deterministic stand-in backend for builds without an accelerated
//! model runtime.

use std::path::Path;

use glyph_core::Result;

use crate::backend::VisionBackend;
use crate::loader::LoadedWeights;
use crate::{Page, TextRegion};

/// Loads real weights, returns canned text.
///
/// The output is a single page naming the input file, so clients can
/// exercise the full request path without an accelerated backend.
pub struct MockBackend {
    tensors: usize,
}

impl MockBackend {
    #[must_use]
    pub fn new(weights: &LoadedWeights) -> Self {
        Self {
            tensors: weights.tensors.len(),
        }
    }
}

impl VisionBackend for MockBackend {
    fn recognize(&mut self, image: &Path) -> Result<Vec<Page>> {
        let name = image
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        Ok(vec![Page {
            regions: vec![TextRegion {
                text: format!("mock recognition of {name} ({} weight tensors)", self.tensors),
                confidence: 1.0,
                bbox: [0.0, 0.0, 0.0, 0.0],
            }],
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glyph_archive::TensorMap;

    fn empty_weights() -> LoadedWeights {
        LoadedWeights {
            tensors: TensorMap::new(),
            archives: 0,
            widened: 0,
        }
    }

    #[test]
    fn output_is_deterministic() {
        let mut backend = MockBackend::new(&empty_weights());
        let a = backend.recognize(Path::new("/tmp/scan.png")).unwrap();
        let b = backend.recognize(Path::new("/tmp/scan.png")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert!(a[0].regions[0].text.contains("scan.png"));
    }
}
