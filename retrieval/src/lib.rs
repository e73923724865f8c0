//! # Retrieval Pipeline
//!
//! Staged semantic search over a verse corpus:
//!
//! - **Stages**: guardrail, normalization (translation) and query rewrite
//! - **Pipeline**: runs enabled stages in order, embeds the result and
//!   queries the shared [`VectorIndex`]
//! - **Registry**: owns the index and capabilities, builds the configured
//!   pipelines and serves requests
//!
//! ## Architecture
//!
//! ```text
//!   text ──► guardrail ──► normalization ──► query_rewrite ──► embed ──► index
//!               │               │                  │
//!            Rejected        Degraded           Rejected
//!               ▼          (original text,         ▼
//!         StageRejected     + warning)       StageRejected
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use versefind_retrieval::{RetrievalConfig, ServiceRegistry};
//!
//! let registry = ServiceRegistry::builder()
//!     .with_config(RetrievalConfig::load("versefind.toml").await?)
//!     .with_embedder(embedder)
//!     .with_generator(generator)
//!     .initialize()
//!     .await?;
//!
//! let response = registry.therapy_search("I feel anxious about tomorrow", 5).await?;
//! ```

pub mod capability;
pub mod config;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod prompts;
pub mod registry;
pub mod safety;
pub mod stage;

pub use capability::CallPolicy;
pub use config::{RetrievalConfig, RetryPolicy};
pub use error::{Capability, CapabilityError, Result, RetrievalError};
pub use generator::{GeminiGenerator, GenerationError, Generator};
pub use pipeline::{RetrievalPipeline, SearchResponse, SearchResult, StageSlot, StageTrace};
pub use registry::{ServiceRegistry, ServiceRegistryBuilder, ServiceStatus, StageStatus};
pub use safety::{KeywordSafetyChecker, SafetyCheckError, SafetyChecker, SafetyVerdict};
pub use stage::{
    GuardrailStage, NormalizationStage, PipelineStage, QueryRewriteStage, StageOutcome,
};

// Re-export from dependencies for convenience
pub use versefind_embeddings::{EmbeddingProvider, VectorIndex, VerseRecord};
