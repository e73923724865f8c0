//! # Embeddings
//!
//! Vector-space primitives for verse retrieval.
//!
//! ## Features
//!
//! - **Corpus loading**: parallel metadata/vector files into an immutable index
//! - **Similarity search**: exact top-k cosine search with deterministic ties
//! - **Providers**: query embedding via OpenAI-compatible APIs
//! - **Caching**: bounded cache for repeated query embeddings
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  corpus files ──► VerseRecord + Embedding ──► VectorIndex       │
//! │                                                   ▲             │
//! │  EmbeddingProvider ──► CachedProvider ──► query ──┘             │
//! │  (OpenAI / Lazy)                                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod corpus;
pub mod error;
pub mod index;
pub mod provider;
pub mod similarity;

pub use cache::{CacheStats, CachedProvider, EmbeddingCache};
pub use corpus::{VerseRecord, index_from_json, load_index};
pub use error::{CorpusLoadError, EmbeddingError, IndexError, Result};
pub use index::{SearchHit, VectorIndex};
pub use provider::{
    EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, LazyProvider, OpenAIProvider,
};
pub use similarity::{Degenerate, dot_product, normalize};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
