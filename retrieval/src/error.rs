//! Error types for the retrieval pipeline.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::generator::GenerationError;
use crate::safety::SafetyCheckError;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// External capabilities the pipeline depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Text to vector.
    Embedder,
    /// Prompt to text.
    Generator,
    /// Content screening.
    SafetyChecker,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Embedder => "embedder",
            Capability::Generator => "generator",
            Capability::SafetyChecker => "safety checker",
        })
    }
}

/// A call to an external capability failed.
#[derive(Error, Debug)]
pub enum CapabilityError {
    /// The call did not finish within its deadline.
    #[error("{capability} timed out after {}ms", .after.as_millis())]
    Timeout {
        capability: Capability,
        after: Duration,
    },

    /// The embedder failed.
    #[error("embedding failed: {0}")]
    Embedding(#[from] versefind_embeddings::EmbeddingError),

    /// The generator failed.
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// The safety checker failed.
    #[error("safety check failed: {0}")]
    SafetyCheck(#[from] SafetyCheckError),
}

impl CapabilityError {
    /// Whether repeating the call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        use versefind_embeddings::EmbeddingError;

        match self {
            CapabilityError::Timeout { .. } => true,
            CapabilityError::Embedding(e) => matches!(
                e,
                EmbeddingError::RateLimited { .. } | EmbeddingError::Http(_)
            ),
            CapabilityError::Generation(e) => e.is_transient(),
            CapabilityError::SafetyCheck(_) => false,
        }
    }
}

/// Errors surfaced by the retrieval pipeline and service registry.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Bad caller input.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A pipeline stage refused the input.
    #[error("rejected by {stage}: {reason}")]
    StageRejected { stage: String, reason: String },

    /// An external capability failed and the stage had no fallback.
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// The corpus could not be loaded.
    #[error("corpus load failed: {0}")]
    CorpusLoad(#[from] versefind_embeddings::CorpusLoadError),

    /// A required capability was never initialized.
    #[error("service unavailable: {0} is not ready")]
    ServiceUnavailable(Capability),

    /// Index query error.
    #[error("index error: {0}")]
    Index(#[from] versefind_embeddings::IndexError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
