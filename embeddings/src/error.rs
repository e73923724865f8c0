//! Error types for the embeddings system.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur while generating embeddings.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider not configured.
    #[error("embedding provider not configured")]
    ProviderNotConfigured,

    /// API request failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Vector width does not match what the caller expects.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Lazy provider construction failed.
    #[error("provider initialization failed: {0}")]
    Initialization(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised while building or querying a [`crate::VectorIndex`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    /// Vector and record sequences have different lengths.
    #[error("dimension mismatch: {vectors} vectors for {records} records")]
    DimensionMismatch { vectors: usize, records: usize },

    /// No vectors or no records were supplied.
    #[error("corpus is empty")]
    EmptyCorpus,

    /// A vector's width differs from the first vector's width.
    #[error("vector {position} has width {actual}, expected {expected}")]
    RaggedVectors {
        position: usize,
        expected: usize,
        actual: usize,
    },

    /// Vectors have no components at all.
    #[error("vectors have zero dimensions")]
    ZeroDimension,

    /// A vector has zero magnitude and cannot be normalized.
    #[error("vector {position} has zero magnitude")]
    ZeroVector { position: usize },

    /// A vector contains NaN or infinite components.
    #[error("vector {position} contains NaN or infinite components")]
    NonFiniteVector { position: usize },

    /// Bad query arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors raised while loading a persisted corpus.
#[derive(Error, Debug)]
pub enum CorpusLoadError {
    /// A corpus file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A corpus file did not contain the expected JSON shape.
    #[error("malformed corpus data in {origin}: {source}")]
    Malformed {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    /// Two records share the same id.
    #[error("duplicate record id: {0}")]
    DuplicateId(String),

    /// The loaded data does not form a valid index.
    #[error(transparent)]
    Index(#[from] IndexError),
}
