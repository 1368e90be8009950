//! Result persistence for recognized pages.

use std::fmt::Write as _;
use std::path::Path;

use glyph_core::Result;
use glyph_vision::Page;

use crate::protocol::PageArtifact;

/// Where recognized pages go after inference.
///
/// The server holds one sink for its lifetime. Keeping rendering behind
/// this trait keeps the request path free of format decisions.
pub trait ResultSink: Send + Sync {
    /// Persist `pages` under `dir` and return one artifact per page.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory or files cannot be written.
    fn persist(&self, dir: &Path, pages: &[Page]) -> Result<Vec<PageArtifact>>;
}

/// Default sink: writes `result.json` (structured pages) and
/// `result.md` (concatenated text) under the save directory. Artifacts
/// for every page point at the same two files.
pub struct FileSink;

impl ResultSink for FileSink {
    fn persist(&self, dir: &Path, pages: &[Page]) -> Result<Vec<PageArtifact>> {
        std::fs::create_dir_all(dir)?;
        let json_path = dir.join("result.json");
        let md_path = dir.join("result.md");

        std::fs::write(&json_path, serde_json::to_vec_pretty(pages)?)?;
        std::fs::write(&md_path, render_markdown(pages))?;

        Ok(pages
            .iter()
            .enumerate()
            .map(|(idx, _)| PageArtifact {
                page_idx: idx + 1,
                json_path: json_path.display().to_string(),
                md_path: md_path.display().to_string(),
            })
            .collect())
    }
}

fn render_markdown(pages: &[Page]) -> String {
    let mut out = String::new();
    for (idx, page) in pages.iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "## Page {}", idx + 1);
        out.push('\n');
        out.push_str(&page.text());
        out.push('\n');
    }
    out
}
