use thiserror::Error;
use ultradoc_core::CoreError;

#[derive(Error, Debug)]
pub enum RagError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("index corruption: {0}")]
    IndexCorruption(String),
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("chunk references unknown document {0}")]
    UnknownDocument(String),
    #[error("document id must not be empty")]
    EmptyDocumentId,
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("invalid config: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("other: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// True for failures caused by the caller's input rather than the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RagError::Core(CoreError::Parse { .. })
                | RagError::Core(CoreError::UnsupportedInput(_))
                | RagError::EmptyDocumentId
                | RagError::EmptyQuestion
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
