use glyph_archive::ArchiveError;

/// Failure modes of the shared engine, mapped onto wire errors by the
/// server.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Inference requested before initialization completed.
    #[error("model runtime not initialized")]
    NotReady,
    /// Initialization failed earlier; the failure is terminal.
    #[error("model initialization failed: {0}")]
    InitFailed(String),
    /// The service shut down; terminal.
    #[error("service stopped")]
    Stopped,
    /// The backend reported a recognition failure.
    #[error("inference failed: {message}")]
    Inference {
        message: String,
        details: Option<String>,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}
