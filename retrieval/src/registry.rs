//! Service registry: owns the index, the capabilities and the configured
//! pipelines, and is the entry point for search requests.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use versefind_embeddings::{
    CachedProvider, EmbeddingCache, EmbeddingProvider, VectorIndex, load_index,
};

use crate::config::{PipelineConfig, RetrievalConfig};
use crate::error::{Capability, Result, RetrievalError};
use crate::generator::Generator;
use crate::pipeline::{RetrievalPipeline, SearchResponse, StageSlot};
use crate::safety::{KeywordSafetyChecker, SafetyChecker};
use crate::stage::{
    GUARDRAIL, GuardrailStage, NORMALIZATION, NormalizationStage, PipelineStage, QUERY_REWRITE,
    QueryRewriteStage,
};

/// Builder for [`ServiceRegistry`]. Nothing is served until
/// [`initialize`](Self::initialize) succeeds.
#[derive(Default)]
pub struct ServiceRegistryBuilder {
    config: RetrievalConfig,
    index: Option<Arc<VectorIndex>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: Option<Arc<dyn Generator>>,
    safety_checker: Option<Arc<dyn SafetyChecker>>,
}

impl ServiceRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RetrievalConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already built index instead of loading the configured corpus.
    pub fn with_index(mut self, index: impl Into<Arc<VectorIndex>>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Replace the keyword checker built from `guardrail.blocked_terms`.
    pub fn with_safety_checker(mut self, checker: Arc<dyn SafetyChecker>) -> Self {
        self.safety_checker = Some(checker);
        self
    }

    /// Load the corpus, settle which capabilities are available and build
    /// both pipelines.
    ///
    /// Fails if the corpus cannot be loaded or a pipeline names an unknown
    /// stage. Missing capabilities do not fail initialization; they are
    /// reported by [`ServiceRegistry::status`].
    pub async fn initialize(self) -> Result<ServiceRegistry> {
        info!("Initializing retrieval service");
        let config = self.config;

        let index = match self.index {
            Some(index) => index,
            None => {
                let (Some(metadata), Some(vectors)) =
                    (&config.corpus.metadata_path, &config.corpus.vectors_path)
                else {
                    return Err(RetrievalError::Config(
                        "corpus.metadata_path and corpus.vectors_path must both be set".into(),
                    ));
                };
                Arc::new(load_index(metadata, vectors).await?)
            }
        };
        info!(
            "Corpus ready: {} records, dimension {}",
            index.len(),
            index.dimension()
        );

        let embedder = self.embedder.and_then(|embedder| {
            if !embedder.is_available() {
                warn!("Embedding provider {} is not configured", embedder.name());
                return None;
            }
            if embedder.default_dimension() != index.dimension() {
                warn!(
                    "Embedding provider {} defaults to dimension {}, corpus has {}",
                    embedder.name(),
                    embedder.default_dimension(),
                    index.dimension()
                );
            }
            if config.embedding.cache_max_entries == 0 {
                return Some(embedder);
            }
            let cache = EmbeddingCache::new(config.embedding.cache_max_entries);
            Some(Arc::new(CachedProvider::new(embedder, cache)) as Arc<dyn EmbeddingProvider>)
        });

        let safety_checker = self.safety_checker.or_else(|| {
            let checker = KeywordSafetyChecker::new(
                &config.guardrail.blocked_terms,
                config.guardrail.blocked_reason.clone(),
            );
            (!checker.is_empty()).then(|| Arc::new(checker) as Arc<dyn SafetyChecker>)
        });

        let catalog = StageCatalog::new(&config, self.generator.as_ref(), safety_checker.as_ref());
        let shared = Shared {
            index,
            embedder,
            generator: self.generator,
            safety_checker,
            catalog,
        };
        let active = shared.activate(config)?;

        let registry = ServiceRegistry {
            shared,
            active: RwLock::new(active),
        };
        let status = registry.status().await;
        info!(
            embedder = status.embedder,
            generator = status.generator,
            safety_checker = status.safety_checker,
            "Retrieval service initialized"
        );
        Ok(registry)
    }
}

/// Stage instances by name. Each stage is built once and shared by every
/// pipeline that lists it.
struct StageCatalog {
    slots: HashMap<&'static str, StageSlot>,
}

impl StageCatalog {
    fn new(
        config: &RetrievalConfig,
        generator: Option<&Arc<dyn Generator>>,
        safety_checker: Option<&Arc<dyn SafetyChecker>>,
    ) -> Self {
        let mut guardrail = GuardrailStage::new(
            &config.guardrail,
            config.call_policy(Capability::SafetyChecker),
        );
        if let Some(checker) = safety_checker {
            guardrail = guardrail.with_checker(Arc::clone(checker));
        }

        let generator_stage = |name: &'static str| match generator {
            Some(generator) => {
                let policy = config.call_policy(Capability::Generator);
                let generator = Arc::clone(generator);
                let stage: Arc<dyn PipelineStage> = if name == NORMALIZATION {
                    Arc::new(NormalizationStage::new(generator, policy))
                } else {
                    Arc::new(QueryRewriteStage::new(generator, policy))
                };
                StageSlot::Ready(stage)
            }
            None => StageSlot::Unavailable {
                name: name.to_string(),
                capability: Capability::Generator,
            },
        };

        let slots = HashMap::from([
            (GUARDRAIL, StageSlot::Ready(Arc::new(guardrail))),
            (NORMALIZATION, generator_stage(NORMALIZATION)),
            (QUERY_REWRITE, generator_stage(QUERY_REWRITE)),
        ]);
        Self { slots }
    }

    fn get(&self, name: &str) -> Result<StageSlot> {
        self.slots
            .get(name)
            .cloned()
            .ok_or_else(|| RetrievalError::Config(format!("unknown stage `{name}`")))
    }
}

/// State fixed at initialization.
struct Shared {
    index: Arc<VectorIndex>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: Option<Arc<dyn Generator>>,
    safety_checker: Option<Arc<dyn SafetyChecker>>,
    catalog: StageCatalog,
}

impl Shared {
    fn assemble(
        &self,
        stages: &PipelineConfig,
        config: &RetrievalConfig,
    ) -> Result<RetrievalPipeline> {
        let mut pipeline = RetrievalPipeline::new(Arc::clone(&self.index), self.embedder.clone())
            .with_embed_policy(config.call_policy(Capability::Embedder))
            .with_max_k(config.max_k);
        for entry in &stages.stages {
            pipeline = pipeline.with_slot(self.catalog.get(&entry.stage)?, entry.enabled);
        }
        Ok(pipeline)
    }

    fn activate(&self, config: RetrievalConfig) -> Result<Active> {
        let search = Arc::new(self.assemble(&config.search, &config)?);
        let therapy = Arc::new(self.assemble(&config.therapy, &config)?);
        Ok(Active {
            config,
            search,
            therapy,
        })
    }
}

/// The swappable part: current stage configuration and the pipelines built
/// from it.
struct Active {
    config: RetrievalConfig,
    search: Arc<RetrievalPipeline>,
    therapy: Arc<RetrievalPipeline>,
}

/// An initialized retrieval service.
///
/// Requests take a snapshot of the current pipeline and run without holding
/// any lock, so a concurrent [`set_stage_enabled`](Self::set_stage_enabled)
/// never affects a request that has already started.
pub struct ServiceRegistry {
    shared: Shared,
    active: RwLock<Active>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::new()
    }

    /// Plain semantic search.
    pub async fn search(&self, text: &str, k: usize) -> Result<SearchResponse> {
        let pipeline = Arc::clone(&self.active.read().await.search);
        debug!("search: {text:?} (k={k})");
        pipeline.run(text, k).await
    }

    /// Search for verses that speak to a described personal issue.
    pub async fn therapy_search(&self, issue: &str, k: usize) -> Result<SearchResponse> {
        let pipeline = Arc::clone(&self.active.read().await.therapy);
        debug!("therapy search: {issue:?} (k={k})");
        pipeline.run(issue, k).await
    }

    /// Enable or disable `stage` in every pipeline that lists it.
    pub async fn set_stage_enabled(&self, stage: &str, enabled: bool) -> Result<()> {
        let mut active = self.active.write().await;
        let mut config = active.config.clone();
        if !config.set_stage_enabled(stage, enabled) {
            return Err(RetrievalError::Config(format!(
                "no pipeline has a stage named `{stage}`"
            )));
        }
        *active = self.shared.activate(config)?;
        info!(stage, enabled, "Stage toggled");
        Ok(())
    }

    /// Whether `capability` was initialized.
    pub fn has_capability(&self, capability: Capability) -> bool {
        match capability {
            Capability::Embedder => self.shared.embedder.is_some(),
            Capability::Generator => self.shared.generator.is_some(),
            Capability::SafetyChecker => self.shared.safety_checker.is_some(),
        }
    }

    /// The shared corpus index.
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.shared.index
    }

    /// Snapshot of what this service can currently do.
    pub async fn status(&self) -> ServiceStatus {
        let active = self.active.read().await;
        let stages = |pipeline: &RetrievalPipeline| -> Vec<StageStatus> {
            pipeline
                .stages()
                .into_iter()
                .map(|(name, enabled)| StageStatus {
                    stage: name.to_string(),
                    enabled,
                    ready: matches!(self.shared.catalog.get(name), Ok(StageSlot::Ready(_))),
                })
                .collect()
        };

        ServiceStatus {
            records: self.shared.index.len(),
            dimension: self.shared.index.dimension(),
            embedder: self.has_capability(Capability::Embedder),
            generator: self.has_capability(Capability::Generator),
            safety_checker: self.has_capability(Capability::SafetyChecker),
            search: stages(&active.search),
            therapy: stages(&active.therapy),
        }
    }
}

/// Reported by [`ServiceRegistry::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub records: usize,
    pub dimension: usize,
    pub embedder: bool,
    pub generator: bool,
    pub safety_checker: bool,
    pub search: Vec<StageStatus>,
    pub therapy: Vec<StageStatus>,
}

/// One stage as seen by [`ServiceStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub enabled: bool,

    /// False when the stage's capability was never initialized.
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use versefind_embeddings::{EmbeddingRequest, EmbeddingResponse, VerseRecord};

    use super::*;
    use crate::generator::GenerationError;
    use pretty_assertions::assert_eq;

    /// Maps a few keywords onto the axes of a three-record corpus.
    struct KeywordEmbedder {
        calls: AtomicUsize,
    }

    impl KeywordEmbedder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        fn name(&self) -> &str {
            "keyword"
        }

        fn default_model(&self) -> &str {
            "keyword-3"
        }

        fn default_dimension(&self) -> usize {
            3
        }

        async fn embed(
            &self,
            request: EmbeddingRequest,
        ) -> versefind_embeddings::Result<EmbeddingResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = request.text.to_lowercase();
            let embedding = if text.contains("patien") {
                vec![1.0, 0.0, 0.0]
            } else if text.contains("mercy") {
                vec![0.0, 1.0, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            };
            Ok(EmbeddingResponse::new(embedding, "keyword-3"))
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl Generator for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(&self, _prompt: &str) -> std::result::Result<String, GenerationError> {
            Ok(self.0.to_string())
        }
    }

    /// Answers translation prompts with `translation` and anything else
    /// with `rewrite`.
    struct Scripted {
        translation: &'static str,
        rewrite: &'static str,
    }

    #[async_trait]
    impl Generator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str) -> std::result::Result<String, GenerationError> {
            let reply = if prompt.starts_with("Translate") {
                self.translation
            } else {
                self.rewrite
            };
            Ok(reply.to_string())
        }
    }

    fn corpus() -> VectorIndex {
        VectorIndex::build(
            vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
            vec![
                VerseRecord::new("2:153", "Seek help through patience and prayer."),
                VerseRecord::new("7:156", "My mercy encompasses all things."),
                VerseRecord::new("94:5", "With hardship comes ease."),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_requires_a_corpus() {
        let err = ServiceRegistry::builder().initialize().await.err().unwrap();
        assert!(matches!(err, RetrievalError::Config(_)));
    }

    #[tokio::test]
    async fn test_initialize_reports_corpus_load_failure() {
        let mut config = RetrievalConfig::default();
        config.corpus.metadata_path = Some("/nonexistent/metadata.json".into());
        config.corpus.vectors_path = Some("/nonexistent/vectors.json".into());

        let err = ServiceRegistry::builder()
            .with_config(config)
            .initialize()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RetrievalError::CorpusLoad(_)));
    }

    #[tokio::test]
    async fn test_initialize_rejects_unknown_stage() {
        let config = RetrievalConfig {
            search: PipelineConfig::new([("spellcheck", true)]),
            ..RetrievalConfig::default()
        };
        let err = ServiceRegistry::builder()
            .with_config(config)
            .with_index(corpus())
            .initialize()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RetrievalError::Config(msg) if msg.contains("spellcheck")));
    }

    #[tokio::test]
    async fn test_missing_generator_makes_search_unavailable() {
        let registry = ServiceRegistry::builder()
            .with_index(corpus())
            .with_embedder(KeywordEmbedder::new())
            .initialize()
            .await
            .unwrap();

        assert!(registry.has_capability(Capability::Embedder));
        assert!(!registry.has_capability(Capability::Generator));

        let err = registry.search("patience please", 1).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::ServiceUnavailable(Capability::Generator)
        ));

        registry
            .set_stage_enabled(NORMALIZATION, false)
            .await
            .unwrap();
        let response = registry.search("patience please", 1).await.unwrap();
        assert_eq!(response.results[0].id, "2:153");
    }

    #[tokio::test]
    async fn test_missing_embedder_is_unavailable() {
        let registry = ServiceRegistry::builder()
            .with_index(corpus())
            .with_generator(Arc::new(Fixed("mercy")))
            .initialize()
            .await
            .unwrap();

        let err = registry.search("show me mercy", 1).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::ServiceUnavailable(Capability::Embedder)
        ));
    }

    #[tokio::test]
    async fn test_therapy_search_rewrites_the_issue() {
        let registry = ServiceRegistry::builder()
            .with_index(corpus())
            .with_embedder(KeywordEmbedder::new())
            .with_generator(Arc::new(Fixed("Verily, My mercy encompasses all things.")))
            .initialize()
            .await
            .unwrap();

        let response = registry
            .therapy_search("I keep making the same mistakes", 1)
            .await
            .unwrap();
        assert_eq!(response.query, "Verily, My mercy encompasses all things.");
        assert_eq!(response.results[0].id, "7:156");
        assert!(response.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_therapy_search_keeps_concern_and_rewrite() {
        let registry = ServiceRegistry::builder()
            .with_index(corpus())
            .with_embedder(KeywordEmbedder::new())
            .with_generator(Arc::new(Scripted {
                translation: "I feel lonely",
                rewrite: "Verily, My mercy encompasses all things.",
            }))
            .initialize()
            .await
            .unwrap();

        let response = registry.therapy_search("Je me sens seul", 1).await.unwrap();

        assert_eq!(response.input, "Je me sens seul");
        assert_eq!(response.stage_text(NORMALIZATION), Some("I feel lonely"));
        assert_eq!(
            response.stage_text(QUERY_REWRITE),
            Some("Verily, My mercy encompasses all things.")
        );
        assert_eq!(response.query, "Verily, My mercy encompasses all things.");
        assert_eq!(response.results[0].id, "7:156");
        let order: Vec<&str> = response.stages.iter().map(|t| t.stage.as_str()).collect();
        assert_eq!(order, vec![GUARDRAIL, NORMALIZATION, QUERY_REWRITE]);
    }

    #[tokio::test]
    async fn test_therapy_guardrail_rejects_short_issue() {
        let registry = ServiceRegistry::builder()
            .with_index(corpus())
            .with_embedder(KeywordEmbedder::new())
            .with_generator(Arc::new(Fixed("mercy")))
            .initialize()
            .await
            .unwrap();

        let err = registry.therapy_search("sad", 1).await.unwrap_err();
        match err {
            RetrievalError::StageRejected { stage, reason } => {
                assert_eq!(stage, GUARDRAIL);
                assert_eq!(reason, "too short");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blocked_terms_come_from_config() {
        let mut config = RetrievalConfig::default();
        config.guardrail.blocked_terms = vec!["spam".into()];
        let registry = ServiceRegistry::builder()
            .with_config(config)
            .with_index(corpus())
            .with_embedder(KeywordEmbedder::new())
            .with_generator(Arc::new(Fixed("mercy")))
            .initialize()
            .await
            .unwrap();

        assert!(registry.has_capability(Capability::SafetyChecker));
        let err = registry
            .therapy_search("this is spam, clearly", 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::StageRejected { reason, .. }
                if reason == "Content contains inappropriate language"
        ));
    }

    #[tokio::test]
    async fn test_set_stage_enabled_rejects_unknown_stage() {
        let registry = ServiceRegistry::builder()
            .with_index(corpus())
            .initialize()
            .await
            .unwrap();
        let err = registry.set_stage_enabled("spellcheck", true).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Config(_)));
    }

    #[tokio::test]
    async fn test_status_reflects_toggles() {
        let registry = ServiceRegistry::builder()
            .with_index(corpus())
            .with_embedder(KeywordEmbedder::new())
            .initialize()
            .await
            .unwrap();

        registry.set_stage_enabled(GUARDRAIL, true).await.unwrap();
        let status = registry.status().await;

        assert_eq!(status.records, 3);
        assert_eq!(status.dimension, 3);
        assert_eq!(
            status.search,
            vec![
                StageStatus {
                    stage: GUARDRAIL.into(),
                    enabled: true,
                    ready: true,
                },
                StageStatus {
                    stage: NORMALIZATION.into(),
                    enabled: true,
                    ready: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_queries_hit_the_embedding_cache() {
        let embedder = KeywordEmbedder::new();
        let mut config = RetrievalConfig::default();
        config.set_stage_enabled(NORMALIZATION, false);
        let registry = ServiceRegistry::builder()
            .with_config(config)
            .with_index(corpus())
            .with_embedder(Arc::clone(&embedder) as Arc<dyn EmbeddingProvider>)
            .initialize()
            .await
            .unwrap();

        registry.search("patience", 2).await.unwrap();
        registry.search("patience", 2).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_can_be_disabled() {
        let embedder = KeywordEmbedder::new();
        let mut config = RetrievalConfig::default();
        config.embedding.cache_max_entries = 0;
        config.set_stage_enabled(NORMALIZATION, false);
        let registry = ServiceRegistry::builder()
            .with_config(config)
            .with_index(corpus())
            .with_embedder(Arc::clone(&embedder) as Arc<dyn EmbeddingProvider>)
            .initialize()
            .await
            .unwrap();

        registry.search("patience", 2).await.unwrap();
        registry.search("patience", 2).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }
}
