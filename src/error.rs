use std::path::PathBuf;

use thiserror::Error;

/// Request-scoped analysis failures.
///
/// Each variant maps to one response status at the HTTP boundary. None of
/// them is fatal to the process.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    /// Missing or malformed input: absent field, bad extension, bad threshold.
    #[error("{0}")]
    Validation(String),
    #[error("image not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("upload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("failed to stage upload")]
    Staging(#[source] std::io::Error),
    /// The detector failed while processing the image.
    #[error("image analysis failed")]
    Inference(#[source] anyhow::Error),
}

impl AnalyzeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AnalyzeError::Validation(msg.into())
    }

    /// Underlying cause chain, for error response details.
    pub fn details(&self) -> Option<String> {
        match self {
            AnalyzeError::Staging(err) => Some(err.to_string()),
            AnalyzeError::Inference(err) => Some(format!("{:#}", err)),
            _ => None,
        }
    }
}
