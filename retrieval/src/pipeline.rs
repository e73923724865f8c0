//! Retrieval pipeline: stages, then embedding, then index search.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use versefind_embeddings::{
    EmbeddingError, EmbeddingProvider, EmbeddingRequest, SearchHit, VectorIndex,
};

use crate::capability::{CallPolicy, call};
use crate::error::{Capability, CapabilityError, Result, RetrievalError};
use crate::stage::{PipelineStage, StageOutcome};

/// A stage slot as configured: either a ready stage, or a stage whose
/// capability was never initialized.
#[derive(Clone)]
pub enum StageSlot {
    Ready(Arc<dyn PipelineStage>),
    Unavailable {
        name: String,
        capability: Capability,
    },
}

impl StageSlot {
    /// Stage name.
    pub fn name(&self) -> &str {
        match self {
            StageSlot::Ready(stage) => stage.name(),
            StageSlot::Unavailable { name, .. } => name,
        }
    }
}

#[derive(Clone)]
struct Step {
    slot: StageSlot,
    enabled: bool,
}

/// One ranked result, flattened for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub text_primary: String,
    pub text_secondary: Option<String>,
    pub group_label: Option<String>,
    pub score: f32,
}

impl From<SearchHit> for SearchResult {
    fn from(hit: SearchHit) -> Self {
        Self {
            id: hit.record.id,
            text_primary: hit.record.text_primary,
            text_secondary: hit.record.text_secondary,
            group_label: hit.record.group_label,
            score: hit.score,
        }
    }
}

/// The text one executed stage handed to the next step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTrace {
    pub stage: String,
    pub text: String,
}

/// Successful pipeline result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// The caller's text, exactly as given.
    pub input: String,

    /// Output of every stage that ran, in execution order. Disabled stages
    /// are absent.
    pub stages: Vec<StageTrace>,

    /// The text that was finally embedded, after every stage.
    pub query: String,

    /// Hits in descending score order.
    pub results: Vec<SearchResult>,

    /// Non-fatal warnings from degraded stages, in stage order.
    pub warnings: Vec<String>,
}

impl SearchResponse {
    /// Text produced by `stage`, if it ran.
    ///
    /// In a therapy search the normalization output is the user's concern
    /// and `query` is the rewritten, verse-like sentence.
    pub fn stage_text(&self, stage: &str) -> Option<&str> {
        self.stages
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.text.as_str())
    }
}

/// An immutable, ordered chain of stages in front of a vector index.
///
/// The stage list and enabled flags are fixed when the pipeline is built.
/// To change them, build a new pipeline; requests already running keep the
/// one they started with. `run` holds no per-query state on `self`, so one
/// pipeline serves concurrent queries.
#[derive(Clone)]
pub struct RetrievalPipeline {
    steps: Vec<Step>,
    index: Arc<VectorIndex>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    embed_policy: CallPolicy,
    max_k: usize,
}

impl RetrievalPipeline {
    /// A pipeline with no stages: embed, then search.
    pub fn new(index: Arc<VectorIndex>, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            steps: Vec::new(),
            index,
            embedder,
            embed_policy: CallPolicy::with_timeout(std::time::Duration::from_secs(10)),
            max_k: usize::MAX,
        }
    }

    /// Append an enabled stage.
    pub fn with_stage(self, stage: Arc<dyn PipelineStage>) -> Self {
        self.with_slot(StageSlot::Ready(stage), true)
    }

    /// Append a stage slot with an explicit enabled flag.
    pub fn with_slot(mut self, slot: StageSlot, enabled: bool) -> Self {
        self.steps.push(Step { slot, enabled });
        self
    }

    /// Set the deadline and retry policy for the embedding call.
    pub fn with_embed_policy(mut self, policy: CallPolicy) -> Self {
        self.embed_policy = policy;
        self
    }

    /// Cap the number of results a caller may request.
    pub fn with_max_k(mut self, max_k: usize) -> Self {
        self.max_k = max_k;
        self
    }

    /// Stage names in execution order, with their enabled flag.
    pub fn stages(&self) -> Vec<(&str, bool)> {
        self.steps
            .iter()
            .map(|s| (s.slot.name(), s.enabled))
            .collect()
    }

    /// The index this pipeline searches.
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Run `text` through every enabled stage and return the top `k` hits.
    ///
    /// The text is handed on as given; surrounding whitespace only matters
    /// for the emptiness check.
    pub async fn run(&self, text: &str, k: usize) -> Result<SearchResponse> {
        if text.trim().is_empty() {
            return Err(RetrievalError::Validation("query text is empty".to_string()));
        }
        if k == 0 {
            return Err(RetrievalError::Validation("k must be at least 1".to_string()));
        }
        if k > self.max_k {
            return Err(RetrievalError::Validation(format!(
                "k must be at most {}",
                self.max_k
            )));
        }

        let embedder = self.ready_embedder()?;

        let mut current = text.to_string();
        let mut trace = Vec::new();
        let mut warnings = Vec::new();
        for step in &self.steps {
            if !step.enabled {
                debug!(stage = step.slot.name(), "stage disabled, passing through");
                continue;
            }
            let stage = match &step.slot {
                StageSlot::Ready(stage) => stage,
                StageSlot::Unavailable { capability, .. } => {
                    return Err(RetrievalError::ServiceUnavailable(*capability));
                }
            };

            current = match stage.process(&current).await {
                StageOutcome::Accepted(next) => next,
                StageOutcome::Degraded { text, warning } => {
                    warn!(stage = stage.name(), "stage degraded: {warning}");
                    warnings.push(warning);
                    text
                }
                StageOutcome::Rejected(reason) => {
                    info!(stage = stage.name(), "query rejected: {reason}");
                    return Err(RetrievalError::StageRejected {
                        stage: stage.name().to_string(),
                        reason,
                    });
                }
            };
            trace.push(StageTrace {
                stage: stage.name().to_string(),
                text: current.clone(),
            });
        }

        let embedding = self.embed(embedder, &current).await?;
        let hits = self.index.query(&embedding, k)?;
        debug!("pipeline returned {} hits for {current:?}", hits.len());

        Ok(SearchResponse {
            input: text.to_string(),
            stages: trace,
            query: current,
            results: hits.into_iter().map(SearchResult::from).collect(),
            warnings,
        })
    }

    /// Fail fast, before any stage runs, if something this pipeline will
    /// need was never initialized.
    fn ready_embedder(&self) -> Result<&Arc<dyn EmbeddingProvider>> {
        if let Some(capability) = self.steps.iter().find_map(|s| match &s.slot {
            StageSlot::Unavailable { capability, .. } if s.enabled => Some(*capability),
            _ => None,
        }) {
            return Err(RetrievalError::ServiceUnavailable(capability));
        }
        self.embedder
            .as_ref()
            .ok_or(RetrievalError::ServiceUnavailable(Capability::Embedder))
    }

    async fn embed(&self, embedder: &Arc<dyn EmbeddingProvider>, text: &str) -> Result<Vec<f32>> {
        let response = call(Capability::Embedder, &self.embed_policy, || {
            let embedder = Arc::clone(embedder);
            let request = EmbeddingRequest::new(text);
            async move { embedder.embed(request).await }
        })
        .await?;

        if response.embedding.len() != self.index.dimension() {
            return Err(CapabilityError::Embedding(EmbeddingError::DimensionMismatch {
                expected: self.index.dimension(),
                actual: response.embedding.len(),
            })
            .into());
        }
        Ok(response.embedding)
    }
}
