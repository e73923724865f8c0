//! Pipeline stages.
//!
//! A stage looks at the current query text and either lets it through
//! (possibly rewritten), rejects it, or lets a substitute through with a
//! warning when its own capability failed. Stages hold only read-only
//! configuration and shared capability handles, so one instance serves any
//! number of concurrent queries.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::capability::{CallPolicy, call, generate_text};
use crate::config::GuardrailConfig;
use crate::error::Capability;
use crate::generator::Generator;
use crate::prompts::{therapy_prompt, translation_prompt};
use crate::safety::SafetyChecker;

/// Name of the [`GuardrailStage`].
pub const GUARDRAIL: &str = "guardrail";
/// Name of the [`NormalizationStage`].
pub const NORMALIZATION: &str = "normalization";
/// Name of the [`QueryRewriteStage`].
pub const QUERY_REWRITE: &str = "query_rewrite";

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Continue with this text.
    Accepted(String),

    /// Stop the pipeline.
    Rejected(String),

    /// The stage's capability failed; continue with the fallback text and
    /// report the warning.
    Degraded { text: String, warning: String },
}

/// One unit of work in a retrieval pipeline.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stable identifier used in configuration and error reports.
    fn name(&self) -> &str;

    /// Process the current query text.
    async fn process(&self, text: &str) -> StageOutcome;
}

/// Rejects input that is too short or that a safety checker flags.
pub struct GuardrailStage {
    min_length: usize,
    fail_open: bool,
    checker: Option<Arc<dyn SafetyChecker>>,
    policy: CallPolicy,
}

impl GuardrailStage {
    /// Length-only guardrail.
    pub fn new(config: &GuardrailConfig, policy: CallPolicy) -> Self {
        Self {
            min_length: config.min_length,
            fail_open: config.fail_open,
            checker: None,
            policy,
        }
    }

    /// Also consult `checker` once the length check passes.
    pub fn with_checker(mut self, checker: Arc<dyn SafetyChecker>) -> Self {
        self.checker = Some(checker);
        self
    }
}

#[async_trait]
impl PipelineStage for GuardrailStage {
    fn name(&self) -> &str {
        GUARDRAIL
    }

    async fn process(&self, text: &str) -> StageOutcome {
        if text.trim().chars().count() < self.min_length {
            return StageOutcome::Rejected("too short".to_string());
        }

        let Some(checker) = &self.checker else {
            return StageOutcome::Accepted(text.to_string());
        };

        let verdict = call(Capability::SafetyChecker, &self.policy, || {
            let checker = Arc::clone(checker);
            let text = text.to_string();
            async move { checker.check(&text).await }
        })
        .await;

        match verdict {
            Ok(verdict) if verdict.is_safe => StageOutcome::Accepted(text.to_string()),
            Ok(verdict) => {
                info!(checker = checker.name(), "input rejected: {}", verdict.reason);
                StageOutcome::Rejected(verdict.reason)
            }
            Err(e) if self.fail_open => {
                warn!("safety check failed, letting input through unchecked: {e}");
                let warning =
                    format!("{GUARDRAIL}: safety check unavailable, input not screened ({e})");
                StageOutcome::Degraded {
                    text: text.to_string(),
                    warning,
                }
            }
            Err(e) => {
                warn!("safety check failed, rejecting input: {e}");
                StageOutcome::Rejected("validation unavailable".to_string())
            }
        }
    }
}

/// Translates the query into the corpus language.
///
/// Translation is an optimisation: if it fails, the original text is still a
/// usable query, so failures degrade instead of rejecting.
pub struct NormalizationStage {
    generator: Arc<dyn Generator>,
    policy: CallPolicy,
}

impl NormalizationStage {
    pub fn new(generator: Arc<dyn Generator>, policy: CallPolicy) -> Self {
        Self { generator, policy }
    }
}

#[async_trait]
impl PipelineStage for NormalizationStage {
    fn name(&self) -> &str {
        NORMALIZATION
    }

    async fn process(&self, text: &str) -> StageOutcome {
        match generate_text(&self.generator, translation_prompt(text), &self.policy).await {
            Ok(translated) => {
                debug!("normalized query: {text:?} -> {translated:?}");
                StageOutcome::Accepted(translated)
            }
            Err(e) => {
                warn!("translation failed, falling back to original text: {e}");
                let warning =
                    format!("{NORMALIZATION}: translation failed, using original text ({e})");
                StageOutcome::Degraded {
                    text: text.to_string(),
                    warning,
                }
            }
        }
    }
}

/// Rewrites a free-form issue into a corpus-like retrieval query.
///
/// Without the rewrite there is nothing sensible to search for, so a failure
/// rejects the request.
pub struct QueryRewriteStage {
    generator: Arc<dyn Generator>,
    policy: CallPolicy,
}

impl QueryRewriteStage {
    pub fn new(generator: Arc<dyn Generator>, policy: CallPolicy) -> Self {
        Self { generator, policy }
    }
}

#[async_trait]
impl PipelineStage for QueryRewriteStage {
    fn name(&self) -> &str {
        QUERY_REWRITE
    }

    async fn process(&self, text: &str) -> StageOutcome {
        match generate_text(&self.generator, therapy_prompt(text), &self.policy).await {
            Ok(rewritten) => {
                debug!("rewrote query: {rewritten:?}");
                StageOutcome::Accepted(rewritten)
            }
            Err(e) => {
                warn!("query rewrite failed: {e}");
                StageOutcome::Rejected(e.to_string())
            }
        }
    }
}
